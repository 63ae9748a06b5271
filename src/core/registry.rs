// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Block registry
//!
//! Process-wide registry mapping block type names to factories. Supports
//! both compile-time registration (via `inventory`) and runtime
//! registration.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::block::Block;

/// Factory producing a fresh block instance.
pub type BlockFactory = Arc<dyn Fn() -> Arc<dyn Block> + Send + Sync>;

/// Compile-time registry entry submitted through [`register_block_type!`].
pub struct BlockTypeEntry {
    pub type_name: &'static str,
    pub factory: fn() -> Arc<dyn Block>,
}

impl BlockTypeEntry {
    pub const fn new(type_name: &'static str, factory: fn() -> Arc<dyn Block>) -> Self {
        Self { type_name, factory }
    }
}

inventory::collect!(BlockTypeEntry);

/// Register a block type for auto-discovery.
///
/// Call once next to the block's implementation; the type is picked up by
/// [`global_registry`] on first access.
///
/// # Example
/// ```ignore
/// use framepipe::register_block_type;
///
/// register_block_type!("MySink", MySink);
/// ```
#[macro_export]
macro_rules! register_block_type {
    ($name:expr, $ty:ty) => {
        $crate::inventory::submit! {
            $crate::core::registry::BlockTypeEntry::new($name, || {
                ::std::sync::Arc::new(<$ty>::new()) as ::std::sync::Arc<dyn $crate::core::block::Block>
            })
        }
    };
}

/// Thread-safe mapping from block type names to factories.
///
/// `create` takes a snapshot of the factory and releases the registry lock
/// before invoking it, so factories may themselves touch the registry
/// without deadlocking.
pub struct BlockRegistry {
    factories: Mutex<HashMap<String, BlockFactory>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Register a factory under `type_name`, replacing (with a warning) any
    /// previous registration.
    pub fn register<F>(&self, type_name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Block> + Send + Sync + 'static,
    {
        let mut factories = self.factories.lock();
        if factories.contains_key(type_name) {
            tracing::warn!("block type '{}' already registered, replacing", type_name);
        }
        factories.insert(type_name.to_string(), Arc::new(factory));
        tracing::debug!("registered block type '{}'", type_name);
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        self.factories.lock().remove(type_name).is_some()
    }

    /// Instantiate a block of the given type.
    pub fn create(&self, type_name: &str) -> Option<Arc<dyn Block>> {
        let factory = self.factories.lock().get(type_name).cloned();
        match factory {
            Some(factory) => Some(factory()),
            None => {
                tracing::error!("block type '{}' not registered", type_name);
                None
            }
        }
    }

    /// Instantiate a block and give it an instance name.
    pub fn create_named(&self, type_name: &str, name: &str) -> Option<Arc<dyn Block>> {
        let block = self.create(type_name)?;
        block.set_name(name);
        Some(block)
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.lock().contains_key(type_name)
    }

    /// Registered type names, sorted for stable output.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.lock().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.lock().is_empty()
    }

    pub fn clear(&self) {
        self.factories.lock().clear();
        tracing::debug!("block registry cleared");
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<BlockRegistry> = OnceLock::new();

/// The process-wide block registry.
///
/// On first access, collects every block type submitted through
/// [`register_block_type!`] at compile time.
pub fn global_registry() -> &'static BlockRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let registry = BlockRegistry::new();
        for entry in inventory::iter::<BlockTypeEntry> {
            registry.register(entry.type_name, entry.factory);
        }
        tracing::debug!("collected {} built-in block types", registry.len());
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{BlockCore, BlockParams};
    use crate::core::error::Result;

    struct DummyBlock {
        core: BlockCore,
    }

    impl DummyBlock {
        fn new() -> Self {
            Self {
                core: BlockCore::new("dummy", "DummyBlock"),
            }
        }
    }

    impl Block for DummyBlock {
        fn core(&self) -> &BlockCore {
            &self.core
        }

        fn initialize(&self, _params: &BlockParams) -> Result<()> {
            Ok(())
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_create() {
        let registry = BlockRegistry::new();
        assert!(registry.is_empty());

        registry.register("DummyBlock", || Arc::new(DummyBlock::new()));
        assert!(registry.is_registered("DummyBlock"));
        assert_eq!(registry.len(), 1);

        let block = registry.create("DummyBlock").unwrap();
        assert_eq!(block.type_name(), "DummyBlock");
    }

    #[test]
    fn test_create_named_sets_instance_name() {
        let registry = BlockRegistry::new();
        registry.register("DummyBlock", || Arc::new(DummyBlock::new()));

        let block = registry.create_named("DummyBlock", "cam0").unwrap();
        assert_eq!(block.name(), "cam0");
    }

    #[test]
    fn test_create_unknown_type() {
        let registry = BlockRegistry::new();
        assert!(registry.create("NoSuchBlock").is_none());
    }

    #[test]
    fn test_collision_replaces_and_keeps_single_entry() {
        let registry = BlockRegistry::new();
        registry.register("X", || {
            let block = DummyBlock::new();
            block.core.set_name("from-first");
            Arc::new(block)
        });
        registry.register("X", || {
            let block = DummyBlock::new();
            block.core.set_name("from-second");
            Arc::new(block)
        });

        // Later registration wins.
        let block = registry.create("X").unwrap();
        assert_eq!(block.name(), "from-second");

        let types = registry.registered_types();
        assert_eq!(types.iter().filter(|t| t.as_str() == "X").count(), 1);
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry = BlockRegistry::new();
        registry.register("A", || Arc::new(DummyBlock::new()));
        registry.register("B", || Arc::new(DummyBlock::new()));

        assert!(registry.unregister("A"));
        assert!(!registry.unregister("A"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reentrant_factory() {
        // A factory that queries the registry must not deadlock: create()
        // releases the lock before invoking the factory.
        let registry = Arc::new(BlockRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register("Reentrant", move || {
            assert!(inner.is_registered("Reentrant"));
            Arc::new(DummyBlock::new())
        });

        assert!(registry.create("Reentrant").is_some());
    }

    #[test]
    fn test_global_registry_contains_builtin_blocks() {
        let registry = global_registry();
        for builtin in ["TestPatternSource", "ConsoleSink", "FileSink", "TcpSink"] {
            assert!(
                registry.is_registered(builtin),
                "missing builtin '{builtin}'"
            );
        }
    }
}

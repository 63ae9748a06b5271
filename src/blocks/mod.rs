//! Reference block implementations.
//!
//! Each block registers itself with the global registry through
//! [`crate::register_block_type!`], so any of them can be instantiated by
//! type name from a pipeline configuration.

pub mod console_sink;
pub mod file_sink;
pub mod tcp_sink;
pub mod test_pattern;

pub use console_sink::ConsoleSink;
pub use file_sink::{FileFormat, FileSink};
pub use tcp_sink::TcpSink;
pub use test_pattern::{TestPattern, TestPatternSource};

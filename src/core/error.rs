// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Error types for framepipe
//!
//! Defines the core error types used throughout the pipeline runtime.
//! Concrete blocks can wrap their own failures through the `Other` variant.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type that uses PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

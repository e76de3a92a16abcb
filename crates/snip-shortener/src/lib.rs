//! URL shortener service and the background deletion pool.
//!
//! Core types are re-exported from `snip_core`.

pub mod deletion;
pub mod error;
pub mod service;

pub use deletion::{DeletionJob, DeletionPool, DeletionPoolConfig, PoolState};
pub use error::PoolError;
pub use service::{ShortenerConfig, ShortenerService};
pub use snip_core::{Decoded, Encoded, Shortener, ShortenerError, Stats};

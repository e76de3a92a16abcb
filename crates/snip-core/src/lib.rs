//! Core types and traits for the snip URL shortener.
//!
//! This crate provides the types shared by the storage backends, the
//! shortener service, the deletion pool and the auth layer.

pub mod error;
pub mod repository;
pub mod shortcode;
pub mod shortener;

pub use error::{ShortenerError, StorageError};
pub use repository::{NewUrl, NewUser, Repository, UrlId, UrlRecord, UserId, UserRecord};
pub use shortcode::ShortCode;
pub use shortener::{Decoded, Encoded, Shortener, Stats};

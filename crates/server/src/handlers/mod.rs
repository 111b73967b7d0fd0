//! HTTP request handlers.

pub mod admin;
pub mod blob;
pub mod cache;
pub mod common;
pub mod health;

pub use admin::*;
pub use blob::*;
pub use cache::*;
pub use health::*;

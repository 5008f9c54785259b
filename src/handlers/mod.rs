//! HTTP handlers.

pub mod blob;

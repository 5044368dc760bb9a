//! Core domain primitives: typed identifiers, the domain error model, and
//! canonical payload hashing.
//!
//! This crate is dependency-light on purpose. It knows nothing about storage,
//! HTTP, or upstream AI providers; those live in `briefly-infra` and
//! `briefly-ai`.

pub mod error;
pub mod hash;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use hash::{canonical_json, content_hash};
pub use id::JobId;

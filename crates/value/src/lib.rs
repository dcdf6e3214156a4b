//! Value primitives for the rill transactional engine
//!
//! A tagged scalar [`Value`], the composite-key [`MultiValue`], raw-byte
//! [`Blob`]s, and the byte codecs the row substrate builds on. All types
//! are totally ordered and hashable so they can key lock tables, version
//! maps and dependency-tracking structures.

pub mod blob;
pub mod codec;
pub mod multi_value;
pub mod types;

pub use blob::Blob;
pub use multi_value::MultiValue;
pub use types::{Value, ValueKind};

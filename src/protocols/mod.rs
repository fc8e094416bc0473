//! Protocol implementations.
//!
//! - `stub`: canned-reply test server protocol (raw bytes, read-to-quiescence)

pub mod stub;

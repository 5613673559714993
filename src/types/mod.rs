//! Core data model: ids, messages, parts, usage.

pub mod ids;
pub mod message;
pub mod part;
pub mod usage;

pub use ids::*;
pub use message::*;
pub use part::*;
pub use usage::*;

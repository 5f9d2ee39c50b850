//! Database module.
//!
//! Provides the primary SQLite store and the local overflow buffer.

mod models;
mod overflow;
mod store;
#[cfg(test)]
pub(crate) mod test_support;

pub use models::*;
pub use overflow::*;
pub use store::*;

//! Database module for SitePulse.
//!
//! Provides SQLite storage with embedded migrations, the shared cache used for
//! run locks, and the metrics batch buffer.

mod buffer;
mod cache;
mod models;
mod stats;
mod store;

pub use buffer::*;
pub use cache::*;
pub use models::*;
pub use stats::*;
pub use store::*;

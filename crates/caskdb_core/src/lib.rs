//! # CaskDB Core
//!
//! An embeddable append-only key/value engine.
//!
//! Data lives in numbered segment files. Every put appends a checksummed
//! record to the active segment; an in-memory index per segment maps keys to
//! byte offsets, so a get is one lookup and one pread. When the active
//! segment reaches its size limit it is sealed and a new one starts, and a
//! background pass periodically merges the sealed segments down to a single
//! file holding only the newest record per key.
//!
//! ```no_run
//! use caskdb_core::Db;
//!
//! # fn main() -> caskdb_core::CoreResult<()> {
//! let db = Db::open("./data")?;
//! db.put("greeting", "hello")?;
//! assert_eq!(db.get("greeting")?, "hello");
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compact;
mod config;
mod db;
mod directory;
mod error;
mod record;
mod segment;
mod writer;

pub use config::Config;
pub use db::Db;
pub use error::{CoreError, CoreResult};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Transfer engine - the heart of s3pipe
//!
//! This module runs multipart transfers with:
//! - A bounded pool of part workers
//! - Per-part retries with exponential backoff
//! - In-order reassembly and checksumming of out-of-order completions
//! - Abort on failure, so no partial object is ever committed

mod download;
mod events;
mod manager;
mod part_worker;
mod pool;
pub(crate) mod retry;
mod upload;

pub use download::*;
pub use events::*;
pub use manager::*;
pub use part_worker::*;
pub use pool::*;
pub use upload::*;

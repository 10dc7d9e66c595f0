//! s3pipe Core - Transfer Engine
//!
//! This crate moves arbitrarily large byte streams to and from S3 as
//! concurrent, checksum-verified multipart transfers.

mod checksum;
mod engine;
mod error;
mod integrity;
mod sequencer;
mod store;

pub use checksum::*;
pub use engine::*;
pub use error::*;
pub use integrity::*;
pub use sequencer::*;
pub use store::*;

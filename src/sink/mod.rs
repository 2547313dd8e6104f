pub mod fanout;
pub mod store;
pub mod writer;

pub use fanout::{FanOutSink, SinkSummary};
pub use store::{LocalDirStore, MemoryStore, NotifyingStore, ShardStore, ShardStream};
pub use writer::{ShardSummary, ShardWriter};

use crate::buffer::BufferError;
use crate::pipeline::Compression;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error on shard {shard}: {source}")]
    Io {
        shard: String,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} is not supported as output compression")]
    UnsupportedCompression(Compression),
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("Shard worker aborted: {0}")]
    Worker(String),
    #[error("Sink cancelled")]
    Cancelled,
}

impl SinkError {
    /// Name of the shard the error happened on, when known.
    pub fn shard(&self) -> Option<&str> {
        match self {
            SinkError::Io { shard, .. } => Some(shard),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Io { .. })
    }
}

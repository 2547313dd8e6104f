pub mod error;
pub mod fragment;
pub mod queue;
pub mod ring;

pub use error::{BufferError, FragmentError};
pub use fragment::Fragment;
pub use queue::{Dequeued, WaitingQueue};
pub use ring::{Lease, ReleaseQueue, ReleasedSpan, RingBuffer, RingWriter};

// Buffer-layer error types shared by the queue, the ring and fragments.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Queue is completed, no further items are accepted")]
    QueueCompleted,

    #[error("Invalid ring capacity: {capacity}")]
    InvalidCapacity { capacity: usize },

    #[error(
        "Ring overrun: write cursor {written} would pass oldest unreleased byte {tail} (capacity {capacity})"
    )]
    RingOverrun {
        written: u64,
        tail: u64,
        capacity: usize,
    },

    #[error("Release of unknown range [{start}, {end})")]
    UnknownRelease { start: u64, end: u64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FragmentError {
    #[error("Splice index {index} out of range for fragment of length {len}")]
    OutOfRange { index: usize, len: usize },

    #[error("Fragments are not contiguous: [{left_start}, {left_end}) and [{right_start}, {right_end})")]
    NotContiguous {
        left_start: u64,
        left_end: u64,
        right_start: u64,
        right_end: u64,
    },

    #[error("Fragments reference different ring buffers")]
    ForeignBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrun_message_names_the_positions() {
        let overrun = BufferError::RingOverrun {
            written: 20,
            tail: 0,
            capacity: 16,
        };
        assert_eq!(
            overrun.to_string(),
            "Ring overrun: write cursor 20 would pass oldest unreleased byte 0 (capacity 16)"
        );
    }

    #[test]
    fn test_fragment_error_messages() {
        let error = FragmentError::OutOfRange { index: 4, len: 4 };
        assert_eq!(
            error.to_string(),
            "Splice index 4 out of range for fragment of length 4"
        );
        assert_eq!(
            FragmentError::ForeignBuffer.to_string(),
            "Fragments reference different ring buffers"
        );
    }
}

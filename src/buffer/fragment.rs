use super::error::FragmentError;
use super::ring::{Lease, RingBuffer};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// Immutable view of bytes produced by the source.
///
/// A ring fragment borrows a range of the [`RingBuffer`] (at most two
/// physical slices when it wraps) and keeps the leases of every raw range it
/// was derived from alive. An owned fragment holds its own memory.
#[derive(Clone, Default)]
pub struct Fragment {
    repr: Repr,
}

#[derive(Clone, Default)]
enum Repr {
    #[default]
    Empty,
    Ring(RingSpan),
    Owned(Bytes),
}

#[derive(Clone)]
struct RingSpan {
    ring: Arc<RingBuffer>,
    start: u64,
    len: usize,
    leases: Vec<Arc<Lease>>,
}

impl RingSpan {
    fn end(&self) -> u64 {
        self.start + self.len as u64
    }

    fn slices(&self) -> (&[u8], &[u8]) {
        let capacity = self.ring.capacity();
        let offset = (self.start % capacity as u64) as usize;
        let front_len = self.len.min(capacity - offset);
        // SAFETY: `len <= capacity` and both physical ranges are covered by
        // the leases this span holds, so the writer cannot reuse them.
        unsafe {
            (
                self.ring.region(offset, front_len),
                self.ring.region(0, self.len - front_len),
            )
        }
    }

    fn sub(&self, from: usize, len: usize) -> RingSpan {
        RingSpan {
            ring: self.ring.clone(),
            start: self.start + from as u64,
            len,
            leases: self.leases.clone(),
        }
    }
}

impl Fragment {
    pub fn empty() -> Self {
        Self { repr: Repr::Empty }
    }

    pub fn owned(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Self::empty()
        } else {
            Self {
                repr: Repr::Owned(bytes),
            }
        }
    }

    pub(super) fn from_ring(ring: Arc<RingBuffer>, start: u64, len: usize, lease: Arc<Lease>) -> Self {
        Self {
            repr: Repr::Ring(RingSpan {
                ring,
                start,
                len,
                leases: vec![lease],
            }),
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Empty => 0,
            Repr::Ring(span) => span.len,
            Repr::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.repr, Repr::Owned(_))
    }

    /// Absolute `[start, end)` positions of a ring fragment.
    pub fn span(&self) -> Option<(u64, u64)> {
        match &self.repr {
            Repr::Ring(span) => Some((span.start, span.end())),
            _ => None,
        }
    }

    /// Number of distinct raw ranges this fragment pins.
    pub fn lease_count(&self) -> usize {
        match &self.repr {
            Repr::Ring(span) => span.leases.len(),
            _ => 0,
        }
    }

    /// The bytes in order, as one or two slices. The second slice is only
    /// non-empty for a ring fragment that wraps the arena end.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        match &self.repr {
            Repr::Empty => {
                let none: &[u8] = &[];
                (none, none)
            }
            Repr::Ring(span) => span.slices(),
            Repr::Owned(bytes) => (bytes.as_ref(), &[]),
        }
    }

    /// Index of the first `byte` at or after `from`.
    pub fn position(&self, byte: u8, from: usize) -> Option<usize> {
        let (front, back) = self.as_slices();
        if from < front.len() {
            if let Some(found) = front[from..].iter().position(|b| *b == byte) {
                return Some(from + found);
            }
            back.iter().position(|b| *b == byte).map(|i| front.len() + i)
        } else {
            let skip = from - front.len();
            back.get(skip..)?
                .iter()
                .position(|b| *b == byte)
                .map(|i| from + i)
        }
    }

    /// Sub-fragment `[0, index]`, boundary byte included.
    pub fn splice_before(&self, index: usize) -> Result<Fragment, FragmentError> {
        self.check_index(index)?;
        Ok(match &self.repr {
            Repr::Empty => Fragment::empty(),
            Repr::Ring(span) => Fragment {
                repr: Repr::Ring(span.sub(0, index + 1)),
            },
            Repr::Owned(bytes) => Fragment::owned(bytes.slice(..=index)),
        })
    }

    /// Sub-fragment `(index, len)`; empty when `index` is the last byte.
    pub fn splice_after(&self, index: usize) -> Result<Fragment, FragmentError> {
        self.check_index(index)?;
        let remaining = self.len() - index - 1;
        if remaining == 0 {
            return Ok(Fragment::empty());
        }
        Ok(match &self.repr {
            Repr::Empty => Fragment::empty(),
            Repr::Ring(span) => Fragment {
                repr: Repr::Ring(span.sub(index + 1, remaining)),
            },
            Repr::Owned(bytes) => Fragment::owned(bytes.slice(index + 1..)),
        })
    }

    /// Concatenates two byte-adjacent fragments.
    ///
    /// Ring fragments must come from the same arena and be adjacent in
    /// absolute positions, in either order; the result borrows both ranges.
    /// An owned side makes the result an owned copy of `self` then `other`.
    pub fn merge(self, other: Fragment) -> Result<Fragment, FragmentError> {
        match (self.repr, other.repr) {
            (Repr::Empty, repr) | (repr, Repr::Empty) => Ok(Fragment { repr }),
            (Repr::Ring(left), Repr::Ring(right)) => {
                if !Arc::ptr_eq(&left.ring, &right.ring) {
                    return Err(FragmentError::ForeignBuffer);
                }
                let (first, second) = if left.end() == right.start {
                    (left, right)
                } else if right.end() == left.start {
                    (right, left)
                } else {
                    return Err(FragmentError::NotContiguous {
                        left_start: left.start,
                        left_end: left.end(),
                        right_start: right.start,
                        right_end: right.end(),
                    });
                };
                let RingSpan {
                    ring,
                    start,
                    len,
                    mut leases,
                } = first;
                for lease in second.leases {
                    if !leases.iter().any(|held| Arc::ptr_eq(held, &lease)) {
                        leases.push(lease);
                    }
                }
                Ok(Fragment {
                    repr: Repr::Ring(RingSpan {
                        ring,
                        start,
                        len: len + second.len,
                        leases,
                    }),
                })
            }
            (left, right) => {
                let left = Fragment { repr: left };
                let right = Fragment { repr: right };
                let mut joined = BytesMut::with_capacity(left.len() + right.len());
                left.extend_into(&mut joined);
                right.extend_into(&mut joined);
                Ok(Fragment::owned(joined.freeze()))
            }
        }
    }

    /// Copies the bytes into independent storage, dropping every lease.
    pub fn to_owned_fragment(&self) -> Fragment {
        match &self.repr {
            Repr::Ring(_) => Fragment::owned(self.to_bytes()),
            _ => self.clone(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match &self.repr {
            Repr::Empty => Bytes::new(),
            Repr::Owned(bytes) => bytes.clone(),
            Repr::Ring(span) => {
                let mut out = BytesMut::with_capacity(span.len);
                self.extend_into(&mut out);
                out.freeze()
            }
        }
    }

    /// Appends the bytes to `out`.
    pub fn extend_into(&self, out: &mut BytesMut) {
        let (front, back) = self.as_slices();
        out.extend_from_slice(front);
        out.extend_from_slice(back);
    }

    fn check_index(&self, index: usize) -> Result<(), FragmentError> {
        let len = self.len();
        if index >= len {
            Err(FragmentError::OutOfRange { index, len })
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Empty => f.write_str("Fragment::Empty"),
            Repr::Ring(span) => f
                .debug_struct("Fragment::Ring")
                .field("start", &span.start)
                .field("len", &span.len)
                .field("leases", &span.leases.len())
                .finish(),
            Repr::Owned(bytes) => f
                .debug_struct("Fragment::Owned")
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ring::RingWriter;

    fn ring_with(capacity: usize, chunks: &[&[u8]]) -> (RingWriter, Vec<Fragment>) {
        let mut writer = RingWriter::new(capacity).unwrap();
        let fragments = chunks
            .iter()
            .map(|chunk| {
                writer.writable(chunk.len()).copy_from_slice(chunk);
                writer.publish(chunk.len()).unwrap()
            })
            .collect();
        (writer, fragments)
    }

    #[test]
    fn test_splice_includes_boundary_byte() {
        let fragment = Fragment::owned(&b"ab\ncd"[..]);
        let before = fragment.splice_before(2).unwrap();
        let after = fragment.splice_after(2).unwrap();
        assert_eq!(before.to_bytes().as_ref(), b"ab\n");
        assert_eq!(after.to_bytes().as_ref(), b"cd");
    }

    #[test]
    fn test_splice_after_last_byte_is_empty() {
        let fragment = Fragment::owned(&b"line\n"[..]);
        let after = fragment.splice_after(4).unwrap();
        assert!(after.is_empty());
        assert_eq!(fragment.splice_before(4).unwrap().len(), 5);
    }

    #[test]
    fn test_splice_out_of_range() {
        let fragment = Fragment::owned(&b"abc"[..]);
        assert_eq!(
            fragment.splice_before(3).unwrap_err(),
            FragmentError::OutOfRange { index: 3, len: 3 }
        );
        assert!(Fragment::empty().splice_after(0).is_err());
    }

    #[test]
    fn test_merge_adjacent_ring_fragments_without_copy() {
        let (_writer, mut parts) = ring_with(16, &[b"abc", b"def"]);
        let second = parts.pop().unwrap();
        let first = parts.pop().unwrap();

        let merged = first.merge(second).unwrap();
        assert!(!merged.is_owned());
        assert_eq!(merged.span(), Some((0, 6)));
        assert_eq!(merged.lease_count(), 2);
        assert_eq!(merged.to_bytes().as_ref(), b"abcdef");
    }

    #[test]
    fn test_merge_accepts_either_order() {
        let (_writer, mut parts) = ring_with(16, &[b"abc", b"def"]);
        let second = parts.pop().unwrap();
        let first = parts.pop().unwrap();
        let merged = second.merge(first).unwrap();
        assert_eq!(merged.to_bytes().as_ref(), b"abcdef");
    }

    #[test]
    fn test_merge_rejects_gaps_and_foreign_rings() {
        let (_writer, parts) = ring_with(16, &[b"ab", b"cd", b"ef"]);
        let err = parts[0].clone().merge(parts[2].clone()).unwrap_err();
        assert!(matches!(err, FragmentError::NotContiguous { .. }));

        let (_other_writer, other) = ring_with(16, &[b"zz"]);
        let err = parts[0].clone().merge(other[0].clone()).unwrap_err();
        assert_eq!(err, FragmentError::ForeignBuffer);
    }

    #[test]
    fn test_merge_with_owned_copies() {
        let (_writer, parts) = ring_with(16, &[b"tail"]);
        let merged = Fragment::owned(&b"head-"[..]).merge(parts[0].clone()).unwrap();
        assert!(merged.is_owned());
        assert_eq!(merged.to_bytes().as_ref(), b"head-tail");
    }

    #[test]
    fn test_empty_is_merge_identity() {
        let fragment = Fragment::owned(&b"x"[..]);
        let merged = Fragment::empty().merge(fragment.clone()).unwrap();
        assert_eq!(merged.to_bytes(), fragment.to_bytes());
        let merged = fragment.merge(Fragment::empty()).unwrap();
        assert_eq!(merged.to_bytes().as_ref(), b"x");
    }

    #[test]
    fn test_position_across_wrap() {
        let mut writer = RingWriter::new(8).unwrap();
        writer.writable(6).copy_from_slice(b"xxxxxx");
        drop(writer.publish(6).unwrap());
        writer.drain_releases().unwrap();

        writer.writable(2).copy_from_slice(b"a\n");
        let front = writer.publish(2).unwrap();
        writer.writable(3).copy_from_slice(b"b\nc");
        let back = writer.publish(3).unwrap();
        let wrapped = front.merge(back).unwrap();

        assert_eq!(wrapped.position(b'\n', 0), Some(1));
        assert_eq!(wrapped.position(b'\n', 2), Some(3));
        assert_eq!(wrapped.position(b'\n', 4), None);
        assert_eq!(wrapped.position(b'\n', 9), None);
        assert_eq!(wrapped.to_bytes().as_ref(), b"a\nb\nc");

        let line = wrapped.splice_before(3).unwrap();
        assert_eq!(line.to_bytes().as_ref(), b"a\nb\n");
    }

    #[test]
    fn test_to_owned_fragment_releases_leases() {
        let (mut writer, mut parts) = ring_with(8, &[b"abcd"]);
        let raw = parts.pop().unwrap();
        let owned = raw.to_owned_fragment();
        drop(raw);
        assert_eq!(writer.drain_releases().unwrap(), 1);
        assert!(owned.is_owned());
        assert_eq!(owned.to_bytes().as_ref(), b"abcd");
    }
}

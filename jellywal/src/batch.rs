//! Write batches.
//!
//! A batch gathers entries so they can be committed with a single write and
//! at most one fsync.

use crate::entry;
use bytes::{BufMut, BytesMut};
use std::ops::Range;

/// A group of pending entries, committed atomically by [`crate::Log::write_batch`].
#[derive(Debug, Default, Clone)]
pub struct Batch {
    sizes: Vec<usize>,
    payload: BytesMut,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry to the batch.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.sizes.push(data.len());
        self.payload.put_slice(data);
    }

    /// Returns the number of pending entries.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Returns the number of bytes the batch occupies once encoded.
    pub fn encoded_len(&self) -> usize {
        self.sizes.iter().map(|&size| entry::encoded_len(size)).sum()
    }

    /// Removes all pending entries, keeping allocated capacity.
    pub fn clear(&mut self) {
        self.sizes.clear();
        self.payload.clear();
    }

    /// Encodes every entry into `dst`.
    ///
    /// Returns the payload range of each entry relative to the start of `dst`.
    pub(crate) fn encode_into(&self, dst: &mut BytesMut) -> Vec<Range<usize>> {
        dst.clear();
        dst.reserve(self.encoded_len());

        let mut ranges = Vec::with_capacity(self.sizes.len());
        let mut pos = 0;
        for &size in &self.sizes {
            ranges.push(entry::encode(&self.payload[pos..pos + size], dst));
            pos += size;
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_accumulates() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());

        batch.write(b"alpha");
        batch.write("");
        batch.write(vec![9u8; 200]);

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.encoded_len(), 6 + 1 + 202);
    }

    #[test]
    fn test_batch_encode_into() {
        let mut batch = Batch::new();
        batch.write(b"ab");
        batch.write(b"c");

        let mut buf = BytesMut::from(&b"stale"[..]);
        let ranges = batch.encode_into(&mut buf);

        assert_eq!(&buf[..], b"\x02ab\x01c");
        assert_eq!(ranges, vec![1..3, 4..5]);
        assert_eq!(buf.len(), batch.encoded_len());
    }

    #[test]
    fn test_batch_clear_reuses() {
        let mut batch = Batch::new();
        batch.write(b"one");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.encoded_len(), 0);

        batch.write(b"two");
        let mut buf = BytesMut::new();
        batch.encode_into(&mut buf);
        assert_eq!(&buf[..], b"\x03two");
    }
}

//! Entry codec.
//!
//! Each entry has the following on-disk format:
//!
//! ```text
//! +----------------------+----------------------------------+
//! | payload length       | payload                          |
//! | uvarint, 1..10 bytes | length bytes                     |
//! +----------------------+----------------------------------+
//! ```
//!
//! Records are packed back to back with no header, footer, padding or
//! checksum. A segment file is valid iff it is empty or holds a whole number
//! of records.

use crate::error::{Result, WalError};
use bytes::{BufMut, BytesMut};
use std::ops::Range;

/// Maximum encoded width of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Returns the number of bytes `value` occupies as a uvarint.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Returns the on-disk size of an entry with a payload of `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    varint_len(payload_len as u64) + payload_len
}

/// Appends `value` to `dst` as an unsigned LEB128 varint.
pub fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Reads an unsigned LEB128 varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed.
fn read_uvarint(buf: &[u8]) -> std::result::Result<(u64, usize), &'static str> {
    let mut value = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err("length prefix overflows u64");
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err("length prefix overflows u64");
            }
            return Ok((value | ((byte as u64) << shift), i + 1));
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    Err("truncated length prefix")
}

/// Encodes `payload` onto the end of `dst`.
///
/// Returns the byte range the payload occupies inside `dst`.
pub fn encode(payload: &[u8], dst: &mut BytesMut) -> Range<usize> {
    dst.reserve(encoded_len(payload.len()));
    put_uvarint(dst, payload.len() as u64);
    let start = dst.len();
    dst.put_slice(payload);
    start..dst.len()
}

/// Decodes the entry at the front of `buf`.
///
/// `offset` is the position of `buf` within its segment and is only used for
/// error reporting. Returns `(header_len, payload_len)`; the record spans
/// `header_len + payload_len` bytes.
pub fn decode(buf: &[u8], offset: usize) -> Result<(usize, usize)> {
    let (len, header_len) =
        read_uvarint(buf).map_err(|reason| WalError::CorruptRecord { offset, reason })?;

    let remaining = buf.len() - header_len;
    if len > remaining as u64 {
        return Err(WalError::CorruptRecord {
            offset,
            reason: "declared length exceeds remaining bytes",
        });
    }

    Ok((header_len, len as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        let range = encode(b"hello", &mut buf);

        assert_eq!(&buf[..], b"\x05hello");
        assert_eq!(range, 1..6);
    }

    #[test]
    fn test_multi_byte_prefix() {
        let payload = vec![7u8; 300];
        let mut buf = BytesMut::new();
        let range = encode(&payload, &mut buf);

        assert_eq!(&buf[..2], &[0xAC, 0x02]);
        assert_eq!(range, 2..302);
        assert_eq!(encoded_len(300), 302);
        assert_eq!(decode(&buf, 0).unwrap(), (2, 300));
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        encode(b"", &mut buf);
        assert_eq!(&buf[..], &[0]);
        assert_eq!(decode(&buf, 0).unwrap(), (1, 0));
    }

    #[test]
    fn test_varint_len() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 3);
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_LEN);
    }

    #[test]
    fn test_empty_buffer_is_corrupt() {
        let result = decode(&[], 0);
        assert!(matches!(result, Err(WalError::CorruptRecord { .. })));
    }

    #[test]
    fn test_unterminated_prefix() {
        let result = decode(&[0x80, 0x80], 12);
        assert!(matches!(
            result,
            Err(WalError::CorruptRecord { offset: 12, .. })
        ));
    }

    #[test]
    fn test_declared_length_too_long() {
        let result = decode(b"\x09abc", 0);
        assert!(matches!(
            result,
            Err(WalError::CorruptRecord {
                reason: "declared length exceeds remaining bytes",
                ..
            })
        ));
    }

    #[test]
    fn test_overflowing_prefix() {
        let buf = [0xFFu8; 11];
        assert!(decode(&buf, 0).is_err());

        let mut buf = [0xFFu8; 10];
        buf[9] = 0x02;
        assert!(decode(&buf, 0).is_err());
    }

    #[test]
    fn test_decode_ignores_trailing_records() {
        let mut buf = BytesMut::new();
        encode(b"first", &mut buf);
        encode(b"second", &mut buf);
        assert_eq!(decode(&buf, 0).unwrap(), (1, 5));
        assert_eq!(decode(&buf[6..], 6).unwrap(), (1, 6));
    }

    proptest! {
        #[test]
        fn truncated_record_never_decodes(
            payload in prop::collection::vec(any::<u8>(), 1..600),
            cut in any::<prop::sample::Index>(),
        ) {
            let mut buf = BytesMut::new();
            encode(&payload, &mut buf);
            let cut = cut.index(buf.len());
            prop_assert!(decode(&buf[..cut], 0).is_err());
        }
    }
}

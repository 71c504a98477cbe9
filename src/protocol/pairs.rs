//! Name/value pair encoding.
//!
//! Used by PARAMS streams and GET_VALUES records. Each pair is encoded as
//! `len(name) len(value) name value`, where a length below 128 takes one
//! byte and anything larger takes four bytes, big-endian, with the top bit
//! set as the long-form marker.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FcgiError, Result};

/// Top bit of a 4-byte length.
const LONG_LENGTH_BIT: u32 = 1 << 31;

/// Largest length encodable in the 1-byte form.
const SHORT_LENGTH_MAX: usize = 127;

/// Append the encoded form of `len` to `out`.
///
/// Lengths of 2^31 and above cannot be represented and are rejected.
///
/// # Example
///
/// ```
/// use fcgi_backend::protocol::encode_length;
/// use bytes::BytesMut;
///
/// let mut buf = BytesMut::new();
/// encode_length(127, &mut buf).unwrap();
/// assert_eq!(buf.len(), 1);
///
/// encode_length(128, &mut buf).unwrap();
/// assert_eq!(&buf[1..], &[0x80, 0, 0, 128]);
/// ```
pub fn encode_length(len: usize, out: &mut BytesMut) -> Result<()> {
    if len <= SHORT_LENGTH_MAX {
        out.put_u8(len as u8);
        return Ok(());
    }
    if len >= LONG_LENGTH_BIT as usize {
        return Err(FcgiError::protocol(format!(
            "Name/value length {} is too large to encode",
            len
        )));
    }
    out.put_u32(len as u32 | LONG_LENGTH_BIT);
    Ok(())
}

/// Decode one length from the front of `buf`, returning it together with
/// the remaining bytes.
pub fn decode_length(buf: &[u8]) -> Result<(usize, &[u8])> {
    let Some(&first) = buf.first() else {
        return Err(truncated("pair name/value length"));
    };
    if first & 0x80 == 0 {
        return Ok((first as usize, &buf[1..]));
    }
    if buf.len() < 4 {
        return Err(truncated("pair name/value length"));
    }
    let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok(((raw & !LONG_LENGTH_BIT) as usize, &buf[4..]))
}

/// Encode a sequence of pairs, in order.
pub fn pack_pairs<I, N, V>(pairs: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (N, V)>,
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut out = BytesMut::new();
    for (name, value) in pairs {
        let (name, value) = (name.as_ref(), value.as_ref());
        encode_length(name.len(), &mut out)?;
        encode_length(value.len(), &mut out)?;
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    Ok(out.freeze())
}

/// Decode a complete pair stream.
///
/// Fails if the stream ends in the middle of a pair.
pub fn unpack_pairs(payload: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
    let mut pairs = Vec::new();
    let mut rest = payload;

    while !rest.is_empty() {
        let (name_len, after) = decode_length(rest)?;
        let (value_len, after) = decode_length(after)?;

        if after.len() < name_len {
            return Err(truncated("pair name data"));
        }
        let (name, after) = after.split_at(name_len);

        if after.len() < value_len {
            return Err(truncated("pair value data"));
        }
        let (value, after) = after.split_at(value_len);

        pairs.push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
        rest = after;
    }

    Ok(pairs)
}

fn truncated(what: &str) -> FcgiError {
    FcgiError::protocol(format!("Unexpected end of data; looking for {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(len: usize) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_length(len, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_length_form_boundary() {
        assert_eq!(&encoded(0)[..], &[0]);
        assert_eq!(&encoded(127)[..], &[127]);
        assert_eq!(&encoded(128)[..], &[0x80, 0x00, 0x00, 0x80]);
        assert_eq!(&encoded(65535)[..], &[0x80, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_length_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_length(1 << 31, &mut buf).is_err());
        assert!(buf.is_empty());
        assert!(encode_length((1 << 31) - 1, &mut buf).is_ok());
    }

    #[test]
    fn test_decode_length_inverts_both_forms() {
        for len in [0usize, 1, 127, 128, 65535, (1 << 31) - 1] {
            let mut buf = encoded(len);
            buf.extend_from_slice(b"tail");
            let (decoded, rest) = decode_length(&buf).unwrap();
            assert_eq!(decoded, len);
            assert_eq!(rest, b"tail");
        }
    }

    #[test]
    fn test_decode_length_truncated() {
        assert!(decode_length(&[]).is_err());
        assert!(decode_length(&[0x80, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_pairs_roundtrip_edge_lengths() {
        let long_name = vec![b'n'; 128];
        let huge_value = vec![b'v'; 65535];
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b"".to_vec(), b"".to_vec()),
            (b"CONTENT_LENGTH".to_vec(), b"0".to_vec()),
            (b"EMPTY".to_vec(), Vec::new()),
            (vec![b'x'; 127], vec![b'y'; 127]),
            (long_name, huge_value),
        ];

        let packed = pack_pairs(pairs.iter().map(|(n, v)| (n, v))).unwrap();
        let unpacked = unpack_pairs(&packed).unwrap();

        assert_eq!(unpacked.len(), pairs.len());
        for ((name, value), (exp_name, exp_value)) in unpacked.iter().zip(&pairs) {
            assert_eq!(&name[..], &exp_name[..]);
            assert_eq!(&value[..], &exp_value[..]);
        }
    }

    #[test]
    fn test_pack_layout() {
        let packed = pack_pairs([("AB", "c")]).unwrap();
        assert_eq!(&packed[..], &[2, 1, b'A', b'B', b'c']);
    }

    #[test]
    fn test_unpack_truncated_data() {
        let packed = pack_pairs([("NAME", "value")]).unwrap();
        for cut in 1..packed.len() {
            assert!(unpack_pairs(&packed[..cut]).is_err(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_unpack_empty_stream() {
        assert!(unpack_pairs(&[]).unwrap().is_empty());
    }
}

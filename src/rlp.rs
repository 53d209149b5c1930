//! # Minimal RLP Codec
//!
//! Recursive-length-prefix encoding for the node-database payloads whose
//! byte layout is fixed by the light-client protocol: the persisted request
//! cost statistics and the values committed into a canonical hash trie.
//!
//! Only the subset the crate needs is implemented: byte strings, unsigned
//! integers (minimal big-endian), and lists. Integers decode strictly: a
//! leading zero byte is a malformed encoding.

use anyhow::{anyhow, bail, Result};

/// RLP-encode a byte string.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = encode_length(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

/// RLP-encode an unsigned integer as a minimal big-endian byte string.
/// Zero encodes as the empty string (`0x80`).
pub fn encode_u64(value: u64) -> Vec<u8> {
    encode_bytes(&trim_leading_zeros(&value.to_be_bytes()))
}

/// As [`encode_u64`] for 128-bit values (total difficulty).
pub fn encode_u128(value: u128) -> Vec<u8> {
    encode_bytes(&trim_leading_zeros(&value.to_be_bytes()))
}

/// RLP-encode a list from already-encoded item payloads.
pub fn encode_list(encoded_items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = encoded_items.iter().map(Vec::len).sum();
    let mut out = encode_length(payload_len, 0xc0);
    for item in encoded_items {
        out.extend_from_slice(item);
    }
    out
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn encode_length(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let len_bytes = trim_leading_zeros(&(len as u64).to_be_bytes());
        let mut out = vec![offset + 55 + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out
    }
}

/// A decoded RLP item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Item::Bytes(b) => Ok(b),
            Item::List(_) => Err(anyhow!("rlp: expected byte string, found list")),
        }
    }

    pub fn as_list(&self) -> Result<&[Item]> {
        match self {
            Item::List(items) => Ok(items),
            Item::Bytes(_) => Err(anyhow!("rlp: expected list, found byte string")),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        let bytes = self.as_bytes()?;
        if bytes.len() > 8 {
            bail!("rlp: integer wider than 64 bits");
        }
        if bytes.first() == Some(&0) {
            bail!("rlp: integer has leading zero byte");
        }
        let mut buf = [0u8; 8];
        buf[8 - bytes.len()..].copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Decode a single RLP item, requiring the input to be fully consumed.
pub fn decode(data: &[u8]) -> Result<Item> {
    let (item, rest) = decode_item(data)?;
    if !rest.is_empty() {
        bail!("rlp: {} trailing bytes after item", rest.len());
    }
    Ok(item)
}

fn decode_item(data: &[u8]) -> Result<(Item, &[u8])> {
    let &first = data.first().ok_or_else(|| anyhow!("rlp: empty input"))?;
    match first {
        0x00..=0x7f => Ok((Item::Bytes(vec![first]), &data[1..])),
        0x80..=0xb7 => {
            let len = (first - 0x80) as usize;
            let payload = take(&data[1..], len)?;
            if len == 1 && payload[0] < 0x80 {
                bail!("rlp: non-canonical single-byte encoding");
            }
            Ok((Item::Bytes(payload.to_vec()), &data[1 + len..]))
        }
        0xb8..=0xbf => {
            let (len, consumed) = decode_long_length(data, first - 0xb7)?;
            let payload = take(&data[consumed..], len)?;
            Ok((Item::Bytes(payload.to_vec()), &data[consumed + len..]))
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            let payload = take(&data[1..], len)?;
            Ok((Item::List(decode_list_payload(payload)?), &data[1 + len..]))
        }
        0xf8..=0xff => {
            let (len, consumed) = decode_long_length(data, first - 0xf7)?;
            let payload = take(&data[consumed..], len)?;
            Ok((Item::List(decode_list_payload(payload)?), &data[consumed + len..]))
        }
    }
}

fn decode_long_length(data: &[u8], len_of_len: u8) -> Result<(usize, usize)> {
    let len_of_len = len_of_len as usize;
    let len_bytes = take(&data[1..], len_of_len)?;
    if len_bytes.first() == Some(&0) {
        bail!("rlp: length has leading zero byte");
    }
    let mut buf = [0u8; 8];
    buf[8 - len_of_len..].copy_from_slice(len_bytes);
    let len = u64::from_be_bytes(buf) as usize;
    if len < 56 {
        bail!("rlp: long form used for short length");
    }
    Ok((len, 1 + len_of_len))
}

fn decode_list_payload(mut payload: &[u8]) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    while !payload.is_empty() {
        let (item, rest) = decode_item(payload)?;
        items.push(item);
        payload = rest;
    }
    Ok(items)
}

fn take(data: &[u8], len: usize) -> Result<&[u8]> {
    if data.len() < len {
        bail!("rlp: input truncated, want {} bytes, have {}", len, data.len());
    }
    Ok(&data[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_vectors() {
        assert_eq!(encode_bytes(b""), vec![0x80]);
        assert_eq!(encode_bytes(b"\x0f"), vec![0x0f]);
        assert_eq!(encode_bytes(b"\x80"), vec![0x81, 0x80]);
        assert_eq!(encode_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(
            encode_list(&[encode_bytes(b"cat"), encode_bytes(b"dog")]),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        assert_eq!(encode_list(&[]), vec![0xc0]);
        assert_eq!(encode_u64(0), vec![0x80]);
        assert_eq!(encode_u64(15), vec![0x0f]);
        assert_eq!(encode_u64(1024), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn long_string_round_trip() {
        let data = vec![0xaa; 1000];
        let enc = encode_bytes(&data);
        assert_eq!(decode(&enc).unwrap(), Item::Bytes(data));
    }

    #[test]
    fn nested_list_round_trip() {
        let enc = encode_list(&[
            encode_list(&[encode_u64(7), encode_bytes(b"payload")]),
            encode_list(&[encode_u64(9), encode_bytes(&[0u8; 40])]),
        ]);
        let item = decode(&enc).unwrap();
        let outer = item.as_list().unwrap();
        assert_eq!(outer.len(), 2);
        let pair = outer[0].as_list().unwrap();
        assert_eq!(pair[0].as_u64().unwrap(), 7);
        assert_eq!(pair[1].as_bytes().unwrap(), b"payload");
    }

    #[test]
    fn u64_round_trip_extremes() {
        for v in [0u64, 1, 0x7f, 0x80, 0xff, 0x100, u64::MAX] {
            let enc = encode_u64(v);
            assert_eq!(decode(&enc).unwrap().as_u64().unwrap(), v);
        }
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x81, 0x05]).is_err()); // non-canonical single byte
        assert!(decode(&[0x83, b'a']).is_err()); // truncated
        assert!(decode(&[0xc8, 0x83, b'c']).is_err()); // truncated list payload
        // trailing garbage after a complete item
        assert!(decode(&[0x0f, 0x0f]).is_err());
    }

    #[test]
    fn integer_decode_is_strict() {
        // leading zero byte is non-minimal
        let bad = encode_bytes(&[0x00, 0x01]);
        assert!(decode(&bad).unwrap().as_u64().is_err());
    }
}

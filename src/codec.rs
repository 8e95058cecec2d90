//! Byte-level encodings: node storage format and Merkle hash input.
//!
//! Both formats frame variable-length fields with unsigned LEB128 varints.
//! The storage format is what a [`crate::Storage`] backend persists; the hash
//! input is deliberately smaller, carrying only what a proof verifier can
//! reconstruct (per child: token and ID, not the compressed key).
use crate::errors::TrieError;
use crate::key::{bytes_needed, Key};
use crate::node::{Child, Digest, Node, HASH_LEN};

const VALUE_ABSENT: u8 = 0;
const VALUE_PRESENT: u8 = 1;

pub(crate) fn encode_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    loop {
        let byte = (x & 0x7F) as u8;
        x >>= 7;
        if x == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub(crate) fn decode_uvarint(input: &mut &[u8]) -> Result<u64, TrieError> {
    let mut out: u64 = 0;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| TrieError::Codec("truncated varint".into()))?;
        *input = rest;
        out |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
    }
    Err(TrieError::Codec("varint overflows u64".into()))
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], TrieError> {
    if input.len() < n {
        return Err(TrieError::Codec("truncated input".into()));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

/// Serialised key: uvarint token count followed by the packed tokens.
pub(crate) fn encode_key(buf: &mut Vec<u8>, key: &Key, token_size: usize) {
    encode_uvarint(buf, key.token_len(token_size) as u64);
    buf.extend_from_slice(key.as_bytes());
}

pub(crate) fn decode_key(input: &mut &[u8], token_size: usize) -> Result<Key, TrieError> {
    let token_count = decode_uvarint(input)? as usize;
    let bit_len = token_count
        .checked_mul(token_size)
        .ok_or_else(|| TrieError::Codec("key length overflow".into()))?;
    let bytes = take(input, bytes_needed(bit_len))?;
    Ok(Key::from_raw(bytes.to_vec(), bit_len))
}

fn encode_maybe_bytes(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            buf.push(VALUE_PRESENT);
            encode_uvarint(buf, v.len() as u64);
            buf.extend_from_slice(v);
        }
        None => buf.push(VALUE_ABSENT),
    }
}

fn decode_maybe_bytes(input: &mut &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
    match take(input, 1)?[0] {
        VALUE_ABSENT => Ok(None),
        VALUE_PRESENT => {
            let len = decode_uvarint(input)? as usize;
            Ok(Some(take(input, len)?.to_vec()))
        }
        flag => Err(TrieError::Codec(format!("invalid presence flag {flag}"))),
    }
}

/// Storage encoding of a node: maybe-value, then uvarint child count, then
/// per child in ascending token order: token byte, compressed key, 32-byte
/// child ID, has-value flag byte.
pub fn encode_node(node: &Node, token_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_maybe_bytes(&mut buf, node.value());
    encode_uvarint(&mut buf, node.children().len() as u64);
    for (token, child) in node.children() {
        buf.push(*token);
        encode_key(&mut buf, &child.compressed_key, token_size);
        buf.extend_from_slice(&child.id.0);
        buf.push(child.has_value as u8);
    }
    buf
}

/// Decodes a node from its storage encoding.
pub fn decode_node(bytes: &[u8], token_size: usize) -> Result<Node, TrieError> {
    let mut input = bytes;
    let mut node = Node::new();
    node.set_value(decode_maybe_bytes(&mut input)?);
    let child_count = decode_uvarint(&mut input)? as usize;
    let mut previous: Option<u8> = None;
    for _ in 0..child_count {
        let token = take(&mut input, 1)?[0];
        if previous.is_some_and(|p| p >= token) {
            return Err(TrieError::Codec("children out of order".into()));
        }
        previous = Some(token);
        let compressed_key = decode_key(&mut input, token_size)?;
        let id = Digest(
            take(&mut input, HASH_LEN)?
                .try_into()
                .expect("slice length checked"),
        );
        let has_value = match take(&mut input, 1)?[0] {
            0 => false,
            1 => true,
            flag => return Err(TrieError::Codec(format!("invalid has-value flag {flag}"))),
        };
        node.set_child(
            token,
            Some(Child {
                compressed_key,
                id,
                has_value,
            }),
        );
    }
    if !input.is_empty() {
        return Err(TrieError::Codec("trailing bytes after node".into()));
    }
    Ok(node)
}

/// Merkle hash input of a node at `key`: serialised key, uvarint child
/// count, per child in ascending token order `(uvarint token, child ID)`,
/// then the maybe value-or-hash.
pub(crate) fn hash_input(key: &Key, node: &Node, token_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    encode_key(&mut buf, key, token_size);
    encode_uvarint(&mut buf, node.children().len() as u64);
    for (token, child) in node.children() {
        encode_uvarint(&mut buf, u64::from(*token));
        buf.extend_from_slice(&child.id.0);
    }
    encode_maybe_bytes(&mut buf, node.value_or_hash());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::sha256;

    #[test]
    fn uvarint_roundtrip() {
        for x in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            encode_uvarint(&mut buf, x);
            let mut input = buf.as_slice();
            assert_eq!(decode_uvarint(&mut input).unwrap(), x);
            assert!(input.is_empty());
        }
        assert_eq!(
            {
                let mut b = Vec::new();
                encode_uvarint(&mut b, 300);
                b
            },
            vec![0xAC, 0x02]
        );
    }

    #[test]
    fn node_roundtrip() {
        let ts = 4;
        let mut node = Node::new();
        node.set_value(Some(vec![9u8; 40]));
        node.set_child(
            0xa,
            Some(Child {
                compressed_key: Key::from_bytes(b"bc").skip(4),
                id: sha256(b"left"),
                has_value: true,
            }),
        );
        node.set_child(
            0x2,
            Some(Child {
                compressed_key: Key::empty(),
                id: sha256(b"right"),
                has_value: false,
            }),
        );
        let bytes = encode_node(&node, ts);
        assert_eq!(decode_node(&bytes, ts).unwrap(), node);
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(matches!(decode_node(&[], 4), Err(TrieError::Codec(_))));
        assert!(matches!(decode_node(&[2], 4), Err(TrieError::Codec(_))));
        // Valid empty node plus trailing garbage.
        let mut bytes = encode_node(&Node::new(), 4);
        bytes.push(0);
        assert!(matches!(decode_node(&bytes, 4), Err(TrieError::Codec(_))));
    }

    #[test]
    fn empty_node_hash_input_is_minimal() {
        // Empty key, no children, no value: two zero varints and an absence
        // flag.
        assert_eq!(hash_input(&Key::empty(), &Node::new(), 4), vec![0, 0, 0]);
    }

    #[test]
    fn hash_input_uses_value_digest() {
        let ts = 4;
        let key = Key::from_bytes(b"k");
        let mut node = Node::new();
        let long_value = vec![7u8; 64];
        node.set_value(Some(long_value.clone()));
        let input = hash_input(&key, &node, ts);
        let digest = sha256(&long_value);
        assert!(input
            .windows(digest.len())
            .any(|w| w == &digest[..]));
        assert!(!input.windows(long_value.len()).any(|w| w == &long_value[..]));
    }
}

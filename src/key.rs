//! Trie keys as packed token sequences.
//!
//! A [`Key`] is an immutable sequence of *tokens* — sub-byte symbols of a
//! fixed size (1, 2, 4 or 8 bits) chosen per trie via [`BranchFactor`].
//! Tokens are packed MSB-first; the trailing partial byte, if any, is
//! zero-padded. Because the padding is canonical, the derived lexicographic
//! order over `(bytes, bit_len)` coincides with token-wise order.
use serde::{Deserialize, Serialize};

/// Branching factor of the trie, fixing the token size of every key in it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchFactor {
    /// 1-bit tokens.
    Two,
    /// 2-bit tokens.
    Four,
    /// 4-bit tokens (nibbles).
    #[default]
    Sixteen,
    /// 8-bit tokens (whole bytes).
    TwoFiftySix,
}

impl BranchFactor {
    /// Token size in bits.
    pub const fn token_size(self) -> usize {
        match self {
            BranchFactor::Two => 1,
            BranchFactor::Four => 2,
            BranchFactor::Sixteen => 4,
            BranchFactor::TwoFiftySix => 8,
        }
    }

    /// Number of distinct tokens, i.e. the maximum child count of a node.
    pub const fn arity(self) -> usize {
        1 << self.token_size()
    }
}

/// Number of bytes needed to store `bits` bits.
pub(crate) const fn bytes_needed(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// An immutable trie key: `bit_len` bits packed MSB-first into `bytes`.
///
/// All bits past `bit_len` in the last byte are zero. The field order makes
/// the derived `Ord` lexicographic over tokens. Deserialisation goes through
/// [`Key::from_raw`], so a hostile length or dirty padding cannot produce a
/// non-canonical key.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "KeyRepr", into = "KeyRepr")]
pub struct Key {
    bytes: Vec<u8>,
    bit_len: usize,
}

/// Serde-facing representation of [`Key`].
#[derive(Serialize, Deserialize)]
struct KeyRepr {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl From<KeyRepr> for Key {
    fn from(repr: KeyRepr) -> Self {
        Key::from_raw(repr.bytes, repr.bit_len)
    }
}

impl From<Key> for KeyRepr {
    fn from(key: Key) -> Self {
        KeyRepr {
            bytes: key.bytes,
            bit_len: key.bit_len,
        }
    }
}

impl Key {
    /// The empty key (the root's key).
    pub fn empty() -> Self {
        Self::default()
    }

    /// A key covering every bit of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            bit_len: bytes.len() * 8,
        }
    }

    /// A key of exactly one token.
    pub fn singleton(token: u8, token_size: usize) -> Self {
        if token_size == 0 {
            return Self::empty();
        }
        Self {
            bytes: vec![token << (8 - token_size)],
            bit_len: token_size,
        }
    }

    /// Builds a key from raw parts, clamping the length, truncating `bytes`
    /// and masking the trailing padding so the representation stays
    /// canonical.
    pub(crate) fn from_raw(mut bytes: Vec<u8>, bit_len: usize) -> Self {
        let bit_len = bit_len.min(bytes.len() * 8);
        bytes.truncate(bytes_needed(bit_len));
        let rem = bit_len % 8;
        if rem != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= 0xFF << (8 - rem);
            }
        }
        Self { bytes, bit_len }
    }

    /// Length in bits.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// Length in tokens of the given size.
    pub fn token_len(&self, token_size: usize) -> usize {
        self.bit_len / token_size
    }

    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// True when the key does not end on a byte boundary.
    pub fn has_partial_byte(&self) -> bool {
        self.bit_len % 8 != 0
    }

    /// The packed token bytes. The final partial byte, if any, is
    /// zero-padded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The token starting at `bit_index`. The index is always a multiple of
    /// the token size, so a token never straddles a byte boundary.
    pub fn token(&self, bit_index: usize, token_size: usize) -> u8 {
        let byte = self.bytes[bit_index / 8];
        let shift = (8 - (bit_index + token_size) % 8) % 8;
        (byte >> shift) & (0xFF >> (8 - token_size))
    }

    /// The first `bits` bits of this key.
    pub fn take(&self, bits: usize) -> Key {
        if bits >= self.bit_len {
            return self.clone();
        }
        Key::from_raw(self.bytes[..bytes_needed(bits)].to_vec(), bits)
    }

    /// This key with its first `bits` bits removed.
    pub fn skip(&self, bits: usize) -> Key {
        if bits >= self.bit_len {
            return Key::empty();
        }
        let new_len = self.bit_len - bits;
        let src = &self.bytes[bits / 8..];
        let rem = bits % 8;
        if rem == 0 {
            return Key::from_raw(src.to_vec(), new_len);
        }
        let mut out = vec![0u8; bytes_needed(new_len)];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = src[i] << rem;
            if i + 1 < src.len() {
                *slot |= src[i + 1] >> (8 - rem);
            }
        }
        Key::from_raw(out, new_len)
    }

    /// This key followed by `suffix`.
    pub fn extend(&self, suffix: &Key) -> Key {
        let total = self.bit_len + suffix.bit_len;
        let mut bytes = vec![0u8; bytes_needed(total)];
        bytes[..self.bytes.len()].copy_from_slice(&self.bytes);
        append_bits(&mut bytes, self.bit_len, suffix);
        Key::from_raw(bytes, total)
    }

    /// This key followed by a single token and then `suffix` — the shape of
    /// every child key in the trie.
    pub fn extend_token(&self, token: u8, token_size: usize, suffix: &Key) -> Key {
        let total = self.bit_len + token_size + suffix.bit_len;
        let mut bytes = vec![0u8; bytes_needed(total)];
        bytes[..self.bytes.len()].copy_from_slice(&self.bytes);
        append_bits(&mut bytes, self.bit_len, &Key::singleton(token, token_size));
        append_bits(&mut bytes, self.bit_len + token_size, suffix);
        Key::from_raw(bytes, total)
    }

    /// True when `prefix` is a (non-strict) bit prefix of this key.
    pub fn has_prefix(&self, prefix: &Key) -> bool {
        if prefix.bit_len > self.bit_len {
            return false;
        }
        let full = prefix.bit_len / 8;
        if self.bytes[..full] != prefix.bytes[..full] {
            return false;
        }
        let rem = prefix.bit_len % 8;
        rem == 0 || (self.bytes[full] ^ prefix.bytes[full]) & (0xFF << (8 - rem)) == 0
    }

    /// True when `prefix` is a strict bit prefix of this key.
    pub fn has_strict_prefix(&self, prefix: &Key) -> bool {
        prefix.bit_len < self.bit_len && self.has_prefix(prefix)
    }

    /// Token-wise prefix test of `prefix` against `self[offset..]`.
    ///
    /// A `prefix` longer than the remaining key is not a match.
    pub fn iterated_has_prefix(&self, prefix: &Key, offset: usize, token_size: usize) -> bool {
        if self.bit_len < offset + prefix.bit_len {
            return false;
        }
        (0..prefix.bit_len)
            .step_by(token_size)
            .all(|i| self.token(offset + i, token_size) == prefix.token(i, token_size))
    }
}

/// ORs `k`'s bits into `buf` starting at bit `offset`. The target region of
/// `buf` must be zero.
fn append_bits(buf: &mut [u8], offset: usize, k: &Key) {
    if k.bit_len == 0 {
        return;
    }
    let byte_off = offset / 8;
    let rem = offset % 8;
    if rem == 0 {
        buf[byte_off..byte_off + k.bytes.len()].copy_from_slice(&k.bytes);
        return;
    }
    buf[byte_off] |= k.bytes[0] >> rem;
    let shift = 8 - rem;
    for i in 1..k.bytes.len() {
        buf[byte_off + i] = (k.bytes[i - 1] << shift) | (k.bytes[i] >> rem);
    }
    let tail = byte_off + k.bytes.len();
    if tail < buf.len() {
        buf[tail] = k.bytes[k.bytes.len() - 1] << shift;
    }
}

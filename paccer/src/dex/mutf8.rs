//! Modified UTF-8 as stored in `string_data_item`
//!
//! DEX strings are UTF-16 at heart: NUL is written as `C0 80` and
//! supplementary characters as two encoded surrogates. Pool entries keep the
//! raw bytes so unpaired surrogates survive a decode/encode cycle.

use std::{borrow::Cow, fmt};

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DexString {
    data: Vec<u8>,
    utf16_len: u32,
}

impl DexString {
    pub fn new(s: &str) -> Self {
        let data = encode(s);
        let utf16_len = s.encode_utf16().count() as u32;
        DexString { data, utf16_len }
    }

    pub fn from_raw(data: Vec<u8>, utf16_len: u32) -> Self {
        DexString { data, utf16_len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn utf16_len(&self) -> u32 {
        self.utf16_len
    }

    pub fn to_utf16(&self) -> Vec<u16> {
        to_utf16(&self.data)
    }

    /// Borrowed when the bytes are plain UTF-8, which covers every descriptor
    /// and member name in practice.
    pub fn to_str(&self) -> Cow<'_, str> {
        match std::str::from_utf8(&self.data) {
            Ok(s) => Cow::Borrowed(s),
            Err(_) => Cow::Owned(String::from_utf16_lossy(&self.to_utf16())),
        }
    }

    pub fn eq_str(&self, s: &str) -> bool {
        self.to_str() == s
    }
}

impl fmt::Display for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl fmt::Debug for DexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_str())
    }
}

pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

/// Lenient: malformed sequences become U+FFFD instead of failing the decode.
pub fn to_utf16(data: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        let continuation = |at: usize| data.get(at).map(|c| u16::from(c & 0x3f));
        let unit = if b < 0x80 {
            i += 1;
            Some(u16::from(b))
        } else if b & 0xe0 == 0xc0 {
            i += 2;
            continuation(i - 1).map(|c1| (u16::from(b & 0x1f) << 6) | c1)
        } else if b & 0xf0 == 0xe0 {
            i += 3;
            continuation(i - 2)
                .zip(continuation(i - 1))
                .map(|(c1, c2)| (u16::from(b & 0x0f) << 12) | (c1 << 6) | c2)
        } else {
            i += 1;
            None
        };
        out.push(unit.unwrap_or(0xfffd));
    }
    out
}

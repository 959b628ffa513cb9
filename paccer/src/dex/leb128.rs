//! LEB128 variants used by class data, debug info and encoded values

use super::DecodeError;

pub fn read_uleb128(data: &[u8], pos: &mut usize) -> Result<u32, DecodeError> {
    let start = *pos;
    let mut result = 0u32;
    for shift in (0..35).step_by(7) {
        let byte = *data
            .get(*pos)
            .ok_or(DecodeError::UnexpectedEof { offset: *pos })?;
        *pos += 1;
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(DecodeError::Malformed {
        what: "uleb128",
        offset: start,
    })
}

pub fn read_sleb128(data: &[u8], pos: &mut usize) -> Result<i32, DecodeError> {
    let start = *pos;
    let mut result = 0i32;
    let mut shift = 0;
    while shift < 35 {
        let byte = *data
            .get(*pos)
            .ok_or(DecodeError::UnexpectedEof { offset: *pos })?;
        *pos += 1;
        result |= i32::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 32 && byte & 0x40 != 0 {
                result |= -1 << shift;
            }
            return Ok(result);
        }
    }
    Err(DecodeError::Malformed {
        what: "sleb128",
        offset: start,
    })
}

/// `uleb128p1`: zero encodes [`NO_INDEX`](super::NO_INDEX), read back as `None`
pub fn read_uleb128p1(data: &[u8], pos: &mut usize) -> Result<Option<u32>, DecodeError> {
    Ok(read_uleb128(data, pos)?.checked_sub(1))
}

pub fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_sleb128(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_uleb128p1(out: &mut Vec<u8>, value: Option<u32>) {
    write_uleb128(out, value.map_or(0, |v| v.wrapping_add(1)));
}

//! Dalvik opcode table: instruction formats and which pool an operand indexes
//!
//! Only what is needed to walk an instruction stream and rewrite its pool
//! references is modelled here; the semantics of individual opcodes are not.

use super::EncodeError;

pub const NOP: u8 = 0x00;
pub const MOVE_RESULT_OBJECT: u8 = 0x0c;
pub const RETURN_VOID: u8 = 0x0e;
pub const RETURN: u8 = 0x0f;
pub const RETURN_WIDE: u8 = 0x10;
pub const RETURN_OBJECT: u8 = 0x11;
pub const CONST_4: u8 = 0x12;
pub const THROW: u8 = 0x27;
pub const GOTO: u8 = 0x28;
pub const GOTO_16: u8 = 0x29;
pub const GOTO_32: u8 = 0x2a;
pub const SGET_OBJECT: u8 = 0x62;
pub const INVOKE_STATIC: u8 = 0x71;

const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

/// Instruction formats, named as in the Dalvik bytecode reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F32x,
    F30t,
    F31t,
    F31i,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
}

impl Format {
    /// Width in 16-bit code units
    pub fn units(self) -> usize {
        use Format::*;
        match self {
            F10x | F12x | F11n | F11x | F10t => 1,
            F20t | F22x | F21t | F21s | F21h | F21c | F23x | F22b | F22t | F22s | F22c => 2,
            F32x | F30t | F31t | F31i | F31c | F35c | F3rc => 3,
            F45cc | F4rcc => 4,
            F51l => 5,
        }
    }
}

/// The pool an instruction's index operand points into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    None,
    String,
    Type,
    Field,
    Method,
    /// `invoke-polymorphic`: method at unit 1, proto at unit 3
    MethodAndProto,
    Proto,
    CallSite,
    MethodHandle,
}

pub fn format_of(op: u8) -> Format {
    use Format::*;
    match op {
        0x00 | 0x0e => F10x,
        0x01 | 0x04 | 0x07 => F12x,
        0x02 | 0x05 | 0x08 => F22x,
        0x03 | 0x06 | 0x09 => F32x,
        0x0a..=0x0d | 0x0f..=0x11 => F11x,
        0x12 => F11n,
        0x13 | 0x16 => F21s,
        0x14 | 0x17 => F31i,
        0x15 | 0x19 => F21h,
        0x18 => F51l,
        0x1a | 0x1c | 0x1f | 0x22 => F21c,
        0x1b => F31c,
        0x1d | 0x1e | 0x27 => F11x,
        0x20 | 0x23 => F22c,
        0x21 => F12x,
        0x24 => F35c,
        0x25 => F3rc,
        0x26 | 0x2b | 0x2c => F31t,
        0x28 => F10t,
        0x29 => F20t,
        0x2a => F30t,
        0x2d..=0x31 => F23x,
        0x32..=0x37 => F22t,
        0x38..=0x3d => F21t,
        0x3e..=0x43 => F10x,
        0x44..=0x51 => F23x,
        0x52..=0x5f => F22c,
        0x60..=0x6d => F21c,
        0x6e..=0x72 => F35c,
        0x73 => F10x,
        0x74..=0x78 => F3rc,
        0x79 | 0x7a => F10x,
        0x7b..=0x8f => F12x,
        0x90..=0xaf => F23x,
        0xb0..=0xcf => F12x,
        0xd0..=0xd7 => F22s,
        0xd8..=0xe2 => F22b,
        0xe3..=0xf9 => F10x,
        0xfa => F45cc,
        0xfb => F4rcc,
        0xfc => F35c,
        0xfd => F3rc,
        0xfe | 0xff => F21c,
    }
}

pub fn index_kind(op: u8) -> IndexKind {
    match op {
        0x1a | 0x1b => IndexKind::String,
        0x1c | 0x1f | 0x20 | 0x22..=0x25 => IndexKind::Type,
        0x52..=0x6d => IndexKind::Field,
        0x6e..=0x72 | 0x74..=0x78 => IndexKind::Method,
        0xfa | 0xfb => IndexKind::MethodAndProto,
        0xfc | 0xfd => IndexKind::CallSite,
        0xfe => IndexKind::MethodHandle,
        0xff => IndexKind::Proto,
        _ => IndexKind::None,
    }
}

/// Instructions after which control never falls through
pub fn is_terminal(op: u8) -> bool {
    matches!(
        op,
        RETURN_VOID | RETURN | RETURN_WIDE | RETURN_OBJECT | THROW | GOTO | GOTO_16 | GOTO_32
    )
}

/// Number of argument registers an invoke passes, `None` for non-invokes
pub fn invoke_arg_count(first_unit: u16) -> Option<u16> {
    match (first_unit & 0xff) as u8 {
        0x24 | 0x6e..=0x72 | 0xfa | 0xfc => Some(first_unit >> 12),
        0x25 | 0x74..=0x78 | 0xfb | 0xfd => Some(first_unit >> 8),
        _ => None,
    }
}

/// Width of the instruction (or data payload) starting at `pc`
pub fn width_at(insns: &[u16], pc: usize) -> Result<usize, EncodeError> {
    let first = *insns.get(pc).ok_or(EncodeError::MalformedCode { pc })?;
    let unit = |at: usize| {
        insns
            .get(pc + at)
            .copied()
            .map(usize::from)
            .ok_or(EncodeError::MalformedCode { pc })
    };
    let width = match first {
        PACKED_SWITCH_PAYLOAD => unit(1)? * 2 + 4,
        SPARSE_SWITCH_PAYLOAD => unit(1)? * 4 + 2,
        FILL_ARRAY_DATA_PAYLOAD => {
            let element_width = unit(1)?;
            let size = unit(2)? | (unit(3)? << 16);
            (size * element_width + 1) / 2 + 4
        }
        _ => format_of((first & 0xff) as u8).units(),
    };
    if pc + width > insns.len() {
        return Err(EncodeError::MalformedCode { pc });
    }
    Ok(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_opcodes_have_expected_formats() {
        assert_eq!(format_of(CONST_4), Format::F11n);
        assert_eq!(format_of(RETURN), Format::F11x);
        assert_eq!(format_of(RETURN_OBJECT), Format::F11x);
        assert_eq!(format_of(MOVE_RESULT_OBJECT), Format::F11x);
        assert_eq!(format_of(INVOKE_STATIC), Format::F35c);
        assert_eq!(format_of(SGET_OBJECT), Format::F21c);
        assert_eq!(index_kind(INVOKE_STATIC), IndexKind::Method);
        assert_eq!(index_kind(SGET_OBJECT), IndexKind::Field);
    }

    #[test]
    fn payload_widths_are_computed_from_their_headers() {
        // packed-switch with two targets
        let packed = [0x0100, 2, 0, 0, 0, 0, 0, 0];
        assert_eq!(width_at(&packed, 0).unwrap(), 8);

        // fill-array-data of three bytes
        let fill = [0x0300, 1, 3, 0, 0, 0];
        assert_eq!(width_at(&fill, 0).unwrap(), 6);
    }

    #[test]
    fn truncated_instruction_is_rejected() {
        // invoke-static needs three units
        assert!(width_at(&[0x0071, 0x0000], 0).is_err());
    }

    #[test]
    fn invoke_arg_counts() {
        assert_eq!(invoke_arg_count(0x0071), Some(0));
        assert_eq!(invoke_arg_count(0x2071), Some(2));
        assert_eq!(invoke_arg_count(0x0377), Some(3));
        assert_eq!(invoke_arg_count(0x000f), None);
    }
}

//! Android DEX container support
//!
//! This module is the container layer the patch engine works through:
//!
//! - `reader`: decoding a DEX image into the in-memory [`DexFile`] IR
//! - `ir`: the IR itself, plus interning of strings, types, protos and members
//! - `code`: editable instruction lists and the assembler that finalizes them
//! - `writer`: re-sorting the pools, remapping every index and laying out a
//!   fresh image with map list, signature and checksum
//! - `opcode`, `leb128`, `mutf8`: format primitives shared by the above
//!
//! # Example Usage
//!
//! ```no_run
//! let bytes = std::fs::read("classes.dex")?;
//! let dex = paccer::dex::decode(&bytes)?;
//! for record in dex.method_records() {
//!     println!("{}", record.signature());
//! }
//! let again = paccer::dex::encode(&dex)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod code;
pub mod ir;
pub mod leb128;
pub mod mutf8;
pub mod opcode;
pub mod reader;
pub mod writer;

use thiserror::Error;

pub use code::{AssemblyError, CodeIr, Instruction};
pub use ir::{
    CatchHandler, ClassData, ClassDef, CodeItem, DebugInfo, DebugOp, DexFile, EncodedField,
    EncodedMethod, EncodedValue, MethodKey, MethodKind, MethodRecord, TryItem, TypeAddrPair,
};
pub use mutf8::DexString;
pub use reader::decode;
pub use writer::encode;

/// Marks an absent index in id tables (superclass, source file, ...)
pub const NO_INDEX: u32 = 0xffff_ffff;

pub const HEADER_SIZE: usize = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a dex file (bad magic)")]
    BadMagic,
    #[error("unsupported dex version {0:?}")]
    UnsupportedVersion(String),
    #[error("unsupported endian tag {0:#010x}")]
    BadEndianTag(u32),
    #[error("unexpected end of data at offset {offset:#x}")]
    UnexpectedEof { offset: usize },
    #[error("malformed {what} at offset {offset:#x}")]
    Malformed { what: &'static str, offset: usize },
    #[error("{kind} index {index} out of range")]
    IndexOutOfRange { kind: &'static str, index: u32 },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("{kind} index {index} does not exist")]
    DanglingIndex { kind: &'static str, index: u32 },
    #[error("{kind} index {index} does not fit a {bits}-bit operand")]
    IndexOverflow {
        kind: &'static str,
        index: u32,
        bits: u8,
    },
    #[error("malformed instruction stream at code unit {pc}")]
    MalformedCode { pc: usize },
    #[error("catch handler list of {size} bytes exceeds 16-bit offsets")]
    HandlerOffsetOverflow { size: usize },
}

/// `map_item` type codes
pub(crate) mod item_type {
    pub const HEADER: u16 = 0x0000;
    pub const STRING_ID: u16 = 0x0001;
    pub const TYPE_ID: u16 = 0x0002;
    pub const PROTO_ID: u16 = 0x0003;
    pub const FIELD_ID: u16 = 0x0004;
    pub const METHOD_ID: u16 = 0x0005;
    pub const CLASS_DEF: u16 = 0x0006;
    pub const CALL_SITE_ID: u16 = 0x0007;
    pub const METHOD_HANDLE: u16 = 0x0008;
    pub const MAP_LIST: u16 = 0x1000;
    pub const TYPE_LIST: u16 = 0x1001;
    pub const ANNOTATION_SET_REF_LIST: u16 = 0x1002;
    pub const ANNOTATION_SET: u16 = 0x1003;
    pub const CLASS_DATA: u16 = 0x2000;
    pub const CODE: u16 = 0x2001;
    pub const STRING_DATA: u16 = 0x2002;
    pub const DEBUG_INFO: u16 = 0x2003;
    pub const ANNOTATION: u16 = 0x2004;
    pub const ENCODED_ARRAY: u16 = 0x2005;
    pub const ANNOTATIONS_DIRECTORY: u16 = 0x2006;
    pub const HIDDENAPI_CLASS_DATA: u16 = 0xf000;
}

/// Adler-32 over everything past the magic and checksum fields
pub fn checksum(image: &[u8]) -> u32 {
    adler::adler32_slice(image.get(12..).unwrap_or_default())
}

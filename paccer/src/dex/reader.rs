//! Decoding of DEX images into [`DexFile`]

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use super::{
    checksum, item_type,
    ir::{
        AnnotationElement, AnnotationItem, AnnotationSet, AnnotationSetRefList,
        AnnotationsDirectory, CatchHandler, ClassData, ClassDef, CodeItem, DebugInfo, DebugOp,
        DexFile, EncodedAnnotation, EncodedField, EncodedMethod, EncodedValue, FieldId,
        MethodHandleItem, MethodId, ProtoId, TryItem, TypeAddrPair,
    },
    leb128::{read_sleb128, read_uleb128, read_uleb128p1},
    mutf8::DexString,
    DecodeError, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX,
};

const MIN_VERSION: u32 = 35;
const MAX_VERSION: u32 = 40;

/// Bounds-checked little-endian view of the image
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(DecodeError::UnexpectedEof {
                offset: offset.saturating_add(len),
            })
    }

    fn u8(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.bytes(offset, 1)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16, DecodeError> {
        Ok(LittleEndian::read_u16(self.bytes(offset, 2)?))
    }

    fn u32(&self, offset: usize) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.bytes(offset, 4)?))
    }

    /// `(size, offset)` pair of a header section
    fn section(&self, at: usize) -> Result<(usize, usize), DecodeError> {
        Ok((self.u32(at)? as usize, self.u32(at + 4)? as usize))
    }
}

fn check(kind: &'static str, index: u32, len: usize) -> Result<u32, DecodeError> {
    if (index as usize) < len {
        Ok(index)
    } else {
        Err(DecodeError::IndexOutOfRange { kind, index })
    }
}

fn optional(index: u32) -> Option<u32> {
    (index != NO_INDEX).then_some(index)
}

/// Decodes a complete DEX image.
///
/// A checksum mismatch is logged, not rejected: images produced by other
/// tools are sometimes re-signed without fixing it up.
pub fn decode(bytes: &[u8]) -> Result<DexFile, DecodeError> {
    let r = Reader { data: bytes };
    let header = r.bytes(0, HEADER_SIZE)?;

    if &header[0..4] != b"dex\n" || header[7] != 0 {
        return Err(DecodeError::BadMagic);
    }
    let version = [header[4], header[5], header[6]];
    let version_str = String::from_utf8_lossy(&version).into_owned();
    match version_str.parse::<u32>() {
        Ok(v) if (MIN_VERSION..=MAX_VERSION).contains(&v) => {}
        _ => return Err(DecodeError::UnsupportedVersion(version_str)),
    }
    let endian = r.u32(0x28)?;
    if endian != ENDIAN_CONSTANT {
        return Err(DecodeError::BadEndianTag(endian));
    }
    let header_size = r.u32(0x24)? as usize;
    if header_size < HEADER_SIZE {
        return Err(DecodeError::Malformed {
            what: "header size",
            offset: 0x24,
        });
    }
    let stored = r.u32(0x08)?;
    let file_size = (r.u32(0x20)? as usize).min(bytes.len());
    let computed = checksum(&bytes[..file_size]);
    if stored != computed {
        warn!(stored, computed, "dex checksum mismatch");
    }

    let mut dex = DexFile {
        version,
        ..DexFile::new()
    };

    let (count, offset) = r.section(0x38)?;
    dex.strings = (0..count)
        .map(|i| read_string(&r, r.u32(offset + i * 4)? as usize))
        .collect::<Result<_, _>>()?;

    let (count, offset) = r.section(0x40)?;
    dex.types = (0..count)
        .map(|i| check("string", r.u32(offset + i * 4)?, dex.strings.len()))
        .collect::<Result<_, _>>()?;

    let (count, offset) = r.section(0x48)?;
    dex.protos = (0..count)
        .map(|i| {
            let at = offset + i * 12;
            Ok(ProtoId {
                shorty: check("string", r.u32(at)?, dex.strings.len())?,
                return_type: check("type", r.u32(at + 4)?, dex.types.len())?,
                parameters: read_type_list(&r, r.u32(at + 8)? as usize, dex.types.len())?,
            })
        })
        .collect::<Result<_, DecodeError>>()?;

    let (count, offset) = r.section(0x50)?;
    dex.fields = (0..count)
        .map(|i| {
            let at = offset + i * 8;
            Ok(FieldId {
                class: check("type", r.u16(at)?.into(), dex.types.len())?,
                field_type: check("type", r.u16(at + 2)?.into(), dex.types.len())?,
                name: check("string", r.u32(at + 4)?, dex.strings.len())?,
            })
        })
        .collect::<Result<_, DecodeError>>()?;

    let (count, offset) = r.section(0x58)?;
    dex.methods = (0..count)
        .map(|i| {
            let at = offset + i * 8;
            Ok(MethodId {
                class: check("type", r.u16(at)?.into(), dex.types.len())?,
                proto: check("proto", r.u16(at + 2)?.into(), dex.protos.len())?,
                name: check("string", r.u32(at + 4)?, dex.strings.len())?,
            })
        })
        .collect::<Result<_, DecodeError>>()?;

    let map_off = r.u32(0x34)? as usize;
    if map_off != 0 {
        read_map_sections(&r, map_off, &mut dex)?;
    }

    let (count, offset) = r.section(0x60)?;
    dex.classes = (0..count)
        .map(|i| read_class_def(&r, offset + i * 32, &dex))
        .collect::<Result<_, _>>()?;

    debug!(
        strings = dex.strings.len(),
        types = dex.types.len(),
        methods = dex.methods.len(),
        classes = dex.classes.len(),
        "decoded dex {}",
        String::from_utf8_lossy(&dex.version)
    );
    Ok(dex)
}

fn read_string(r: &Reader, offset: usize) -> Result<DexString, DecodeError> {
    let mut pos = offset;
    let utf16_len = read_uleb128(r.data, &mut pos)?;
    let rest = r.data.get(pos..).ok_or(DecodeError::UnexpectedEof { offset: pos })?;
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::Malformed {
            what: "string_data_item",
            offset,
        })?;
    Ok(DexString::from_raw(rest[..end].to_vec(), utf16_len))
}

fn read_type_list(r: &Reader, offset: usize, types: usize) -> Result<Vec<u32>, DecodeError> {
    if offset == 0 {
        return Ok(Vec::new());
    }
    let size = r.u32(offset)? as usize;
    (0..size)
        .map(|i| check("type", r.u16(offset + 4 + i * 2)?.into(), types))
        .collect()
}

fn read_map_sections(r: &Reader, map_off: usize, dex: &mut DexFile) -> Result<(), DecodeError> {
    let size = r.u32(map_off)? as usize;
    for i in 0..size {
        let at = map_off + 4 + i * 12;
        let kind = r.u16(at)?;
        let count = r.u32(at + 4)? as usize;
        let offset = r.u32(at + 8)? as usize;
        match kind {
            item_type::CALL_SITE_ID => {
                dex.call_sites = (0..count)
                    .map(|i| {
                        let mut pos = r.u32(offset + i * 4)? as usize;
                        read_encoded_array(r, &mut pos)
                    })
                    .collect::<Result<_, _>>()?;
            }
            item_type::METHOD_HANDLE => {
                dex.method_handles = (0..count)
                    .map(|i| {
                        let at = offset + i * 8;
                        Ok(MethodHandleItem {
                            kind: r.u16(at)?,
                            target: r.u16(at + 4)?.into(),
                        })
                    })
                    .collect::<Result<_, DecodeError>>()?;
            }
            item_type::HIDDENAPI_CLASS_DATA => {
                let len = r.u32(offset)? as usize;
                dex.hiddenapi = Some(r.bytes(offset, len)?.to_vec());
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_class_def(r: &Reader, at: usize, dex: &DexFile) -> Result<ClassDef, DecodeError> {
    let types = dex.types.len();
    let superclass = optional(r.u32(at + 8)?)
        .map(|t| check("type", t, types))
        .transpose()?;
    let source_file = optional(r.u32(at + 16)?)
        .map(|s| check("string", s, dex.strings.len()))
        .transpose()?;

    let annotations_off = r.u32(at + 20)? as usize;
    let class_data_off = r.u32(at + 24)? as usize;
    let static_values_off = r.u32(at + 28)? as usize;

    Ok(ClassDef {
        class_type: check("type", r.u32(at)?, types)?,
        access_flags: r.u32(at + 4)?,
        superclass,
        interfaces: read_type_list(r, r.u32(at + 12)? as usize, types)?,
        source_file,
        annotations: (annotations_off != 0)
            .then(|| read_annotations_directory(r, annotations_off))
            .transpose()?,
        class_data: (class_data_off != 0)
            .then(|| read_class_data(r, class_data_off, dex))
            .transpose()?,
        static_values: (static_values_off != 0)
            .then(|| {
                let mut pos = static_values_off;
                read_encoded_array(r, &mut pos)
            })
            .transpose()?,
    })
}

fn read_class_data(r: &Reader, offset: usize, dex: &DexFile) -> Result<ClassData, DecodeError> {
    let data = r.data;
    let mut pos = offset;
    let static_fields = read_uleb128(data, &mut pos)?;
    let instance_fields = read_uleb128(data, &mut pos)?;
    let direct_methods = read_uleb128(data, &mut pos)?;
    let virtual_methods = read_uleb128(data, &mut pos)?;

    let fields = |count: u32, pos: &mut usize| -> Result<Vec<EncodedField>, DecodeError> {
        let mut idx = 0u32;
        (0..count)
            .map(|_| {
                idx = idx.wrapping_add(read_uleb128(data, pos)?);
                Ok(EncodedField {
                    field: check("field", idx, dex.fields.len())?,
                    access_flags: read_uleb128(data, pos)?,
                })
            })
            .collect()
    };
    let static_fields = fields(static_fields, &mut pos)?;
    let instance_fields = fields(instance_fields, &mut pos)?;

    let methods = |count: u32, pos: &mut usize| -> Result<Vec<EncodedMethod>, DecodeError> {
        let mut idx = 0u32;
        (0..count)
            .map(|_| {
                idx = idx.wrapping_add(read_uleb128(data, pos)?);
                let access_flags = read_uleb128(data, pos)?;
                let code_off = read_uleb128(data, pos)? as usize;
                Ok(EncodedMethod {
                    method: check("method", idx, dex.methods.len())?,
                    access_flags,
                    code: (code_off != 0)
                        .then(|| read_code_item(r, code_off))
                        .transpose()?,
                })
            })
            .collect()
    };
    let direct_methods = methods(direct_methods, &mut pos)?;
    let virtual_methods = methods(virtual_methods, &mut pos)?;

    Ok(ClassData {
        static_fields,
        instance_fields,
        direct_methods,
        virtual_methods,
    })
}

fn read_code_item(r: &Reader, offset: usize) -> Result<CodeItem, DecodeError> {
    let registers_size = r.u16(offset)?;
    let ins_size = r.u16(offset + 2)?;
    let outs_size = r.u16(offset + 4)?;
    let tries_size = r.u16(offset + 6)? as usize;
    let debug_off = r.u32(offset + 8)? as usize;
    let insns_size = r.u32(offset + 12)? as usize;

    let insns_at = offset + 16;
    let insns = r
        .bytes(insns_at, insns_size * 2)?
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();

    let mut tries = Vec::with_capacity(tries_size);
    let mut handlers = Vec::new();
    if tries_size > 0 {
        let padding = if insns_size % 2 == 1 { 2 } else { 0 };
        let tries_at = insns_at + insns_size * 2 + padding;
        let list_at = tries_at + tries_size * 8;

        let data = r.data;
        let mut pos = list_at;
        let list_size = read_uleb128(data, &mut pos)?;
        let mut handler_offsets = Vec::with_capacity(list_size as usize);
        for _ in 0..list_size {
            handler_offsets.push(pos - list_at);
            let size = read_sleb128(data, &mut pos)?;
            let mut handler = CatchHandler::default();
            for _ in 0..size.unsigned_abs() {
                handler.catches.push(TypeAddrPair {
                    type_idx: read_uleb128(data, &mut pos)?,
                    addr: read_uleb128(data, &mut pos)?,
                });
            }
            if size <= 0 {
                handler.catch_all = Some(read_uleb128(data, &mut pos)?);
            }
            handlers.push(handler);
        }

        for i in 0..tries_size {
            let at = tries_at + i * 8;
            let handler_off = r.u16(at + 6)? as usize;
            let handler = handler_offsets
                .iter()
                .position(|&o| o == handler_off)
                .ok_or(DecodeError::Malformed {
                    what: "try_item handler offset",
                    offset: at,
                })?;
            tries.push(TryItem {
                start_addr: r.u32(at)?,
                insn_count: r.u16(at + 4)?,
                handler,
            });
        }
    }

    Ok(CodeItem {
        registers_size,
        ins_size,
        outs_size,
        debug_info: (debug_off != 0)
            .then(|| read_debug_info(r, debug_off))
            .transpose()?,
        insns,
        tries,
        handlers,
    })
}

fn read_debug_info(r: &Reader, offset: usize) -> Result<DebugInfo, DecodeError> {
    let data = r.data;
    let mut pos = offset;
    let line_start = read_uleb128(data, &mut pos)?;
    let parameters = read_uleb128(data, &mut pos)?;
    let parameter_names = (0..parameters)
        .map(|_| read_uleb128p1(data, &mut pos))
        .collect::<Result<_, _>>()?;

    let mut ops = Vec::new();
    loop {
        let opcode = r.u8(pos)?;
        pos += 1;
        let op = match opcode {
            0x00 => break,
            0x01 => DebugOp::AdvancePc(read_uleb128(data, &mut pos)?),
            0x02 => DebugOp::AdvanceLine(read_sleb128(data, &mut pos)?),
            0x03 => DebugOp::StartLocal {
                register: read_uleb128(data, &mut pos)?,
                name: read_uleb128p1(data, &mut pos)?,
                type_idx: read_uleb128p1(data, &mut pos)?,
            },
            0x04 => DebugOp::StartLocalExtended {
                register: read_uleb128(data, &mut pos)?,
                name: read_uleb128p1(data, &mut pos)?,
                type_idx: read_uleb128p1(data, &mut pos)?,
                signature: read_uleb128p1(data, &mut pos)?,
            },
            0x05 => DebugOp::EndLocal(read_uleb128(data, &mut pos)?),
            0x06 => DebugOp::RestartLocal(read_uleb128(data, &mut pos)?),
            0x07 => DebugOp::SetPrologueEnd,
            0x08 => DebugOp::SetEpilogueBegin,
            0x09 => DebugOp::SetFile(read_uleb128p1(data, &mut pos)?),
            special => DebugOp::Special(special),
        };
        ops.push(op);
    }

    Ok(DebugInfo {
        line_start,
        parameter_names,
        ops,
    })
}

fn read_annotations_directory(
    r: &Reader,
    offset: usize,
) -> Result<AnnotationsDirectory, DecodeError> {
    let class_off = r.u32(offset)? as usize;
    let fields = r.u32(offset + 4)? as usize;
    let methods = r.u32(offset + 8)? as usize;
    let parameters = r.u32(offset + 12)? as usize;

    let mut at = offset + 16;
    let mut pairs = |count: usize| -> Result<Vec<(u32, usize)>, DecodeError> {
        let list = (0..count)
            .map(|i| Ok((r.u32(at + i * 8)?, r.u32(at + i * 8 + 4)? as usize)))
            .collect::<Result<Vec<_>, DecodeError>>()?;
        at += count * 8;
        Ok(list)
    };
    let field_pairs = pairs(fields)?;
    let method_pairs = pairs(methods)?;
    let parameter_pairs = pairs(parameters)?;

    let sets = |pairs: Vec<(u32, usize)>| -> Result<Vec<(u32, AnnotationSet)>, DecodeError> {
        pairs
            .into_iter()
            .map(|(idx, off)| Ok((idx, read_annotation_set(r, off)?)))
            .collect()
    };

    Ok(AnnotationsDirectory {
        class_annotations: (class_off != 0)
            .then(|| read_annotation_set(r, class_off))
            .transpose()?,
        fields: sets(field_pairs)?,
        methods: sets(method_pairs)?,
        parameters: parameter_pairs
            .into_iter()
            .map(|(idx, off)| Ok((idx, read_annotation_set_ref_list(r, off)?)))
            .collect::<Result<_, DecodeError>>()?,
    })
}

fn read_annotation_set(r: &Reader, offset: usize) -> Result<AnnotationSet, DecodeError> {
    let size = r.u32(offset)? as usize;
    (0..size)
        .map(|i| {
            let item_off = r.u32(offset + 4 + i * 4)? as usize;
            let mut pos = item_off + 1;
            Ok(AnnotationItem {
                visibility: r.u8(item_off)?,
                annotation: read_encoded_annotation(r, &mut pos)?,
            })
        })
        .collect()
}

fn read_annotation_set_ref_list(
    r: &Reader,
    offset: usize,
) -> Result<AnnotationSetRefList, DecodeError> {
    let size = r.u32(offset)? as usize;
    (0..size)
        .map(|i| {
            let set_off = r.u32(offset + 4 + i * 4)? as usize;
            (set_off != 0)
                .then(|| read_annotation_set(r, set_off))
                .transpose()
        })
        .collect()
}

fn read_encoded_annotation(r: &Reader, pos: &mut usize) -> Result<EncodedAnnotation, DecodeError> {
    let type_idx = read_uleb128(r.data, pos)?;
    let size = read_uleb128(r.data, pos)?;
    let elements = (0..size)
        .map(|_| {
            Ok(AnnotationElement {
                name: read_uleb128(r.data, pos)?,
                value: read_encoded_value(r, pos)?,
            })
        })
        .collect::<Result<_, DecodeError>>()?;
    Ok(EncodedAnnotation { type_idx, elements })
}

fn read_encoded_array(r: &Reader, pos: &mut usize) -> Result<Vec<EncodedValue>, DecodeError> {
    let size = read_uleb128(r.data, pos)?;
    (0..size).map(|_| read_encoded_value(r, pos)).collect()
}

fn read_encoded_value(r: &Reader, pos: &mut usize) -> Result<EncodedValue, DecodeError> {
    let at = *pos;
    let header = r.u8(at)?;
    *pos += 1;
    let value_type = header & 0x1f;
    let arg = header >> 5;
    let width = usize::from(arg) + 1;

    let mut raw = || -> Result<u64, DecodeError> {
        let bytes = r.bytes(*pos, width)?;
        *pos += width;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    };
    let signed = |value: u64| {
        let shift = 64 - 8 * width as u32;
        ((value << shift) as i64) >> shift
    };
    let index = |value: u64| {
        u32::try_from(value).map_err(|_| DecodeError::Malformed {
            what: "encoded_value index",
            offset: at,
        })
    };

    let value = match value_type {
        0x00 => EncodedValue::Byte(signed(raw()?) as i8),
        0x02 => EncodedValue::Short(signed(raw()?) as i16),
        0x03 => EncodedValue::Char(raw()? as u16),
        0x04 => EncodedValue::Int(signed(raw()?) as i32),
        0x06 => EncodedValue::Long(signed(raw()?)),
        // right-zero-extended: stored bytes are the high-order ones
        0x10 => EncodedValue::Float((raw()? << (8 * (4 - width.min(4)))) as u32),
        0x11 => EncodedValue::Double(raw()? << (8 * (8 - width))),
        0x15 => EncodedValue::MethodType(index(raw()?)?),
        0x16 => EncodedValue::MethodHandle(index(raw()?)?),
        0x17 => EncodedValue::String(index(raw()?)?),
        0x18 => EncodedValue::Type(index(raw()?)?),
        0x19 => EncodedValue::Field(index(raw()?)?),
        0x1a => EncodedValue::Method(index(raw()?)?),
        0x1b => EncodedValue::Enum(index(raw()?)?),
        0x1c => EncodedValue::Array(read_encoded_array(r, pos)?),
        0x1d => EncodedValue::Annotation(read_encoded_annotation(r, pos)?),
        0x1e => EncodedValue::Null,
        0x1f => EncodedValue::Boolean(arg != 0),
        _ => {
            return Err(DecodeError::Malformed {
                what: "encoded_value type",
                offset: at,
            })
        }
    };
    Ok(value)
}

//! Serialization of a [`DexFile`] into a fresh image
//!
//! Every pool is sorted into canonical order first and all references are
//! rewritten through a [`Remap`], then sections are laid out in dependency
//! order so each offset is known before anything points at it. Only the id
//! tables are back-patched.

use std::collections::HashMap;

use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};
use tracing::debug;

use super::{
    checksum, item_type,
    ir::{
        AnnotationItem, AnnotationSet, AnnotationSetRefList, AnnotationsDirectory, ClassData,
        CodeItem, DebugInfo, DebugOp, DexFile, EncodedAnnotation, EncodedField, EncodedMethod,
        EncodedValue,
    },
    leb128::{write_sleb128, write_uleb128, write_uleb128p1},
    opcode::{self, IndexKind},
    EncodeError, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX,
};

/// Old index to new index, per pool
struct Remap {
    strings: Vec<u32>,
    types: Vec<u32>,
    protos: Vec<u32>,
    fields: Vec<u32>,
    methods: Vec<u32>,
    call_sites: usize,
    method_handles: usize,
}

fn lookup(table: &[u32], kind: &'static str, index: u32) -> Result<u32, EncodeError> {
    table
        .get(index as usize)
        .copied()
        .ok_or(EncodeError::DanglingIndex { kind, index })
}

/// Inverse of a sort order: `ranks[old] = new`
fn ranks(order: &[usize]) -> Vec<u32> {
    let mut ranks = vec![0; order.len()];
    for (new, &old) in order.iter().enumerate() {
        ranks[old] = new as u32;
    }
    ranks
}

impl Remap {
    fn string(&self, idx: u32) -> Result<u32, EncodeError> {
        lookup(&self.strings, "string", idx)
    }

    fn type_(&self, idx: u32) -> Result<u32, EncodeError> {
        lookup(&self.types, "type", idx)
    }

    fn proto(&self, idx: u32) -> Result<u32, EncodeError> {
        lookup(&self.protos, "proto", idx)
    }

    fn field(&self, idx: u32) -> Result<u32, EncodeError> {
        lookup(&self.fields, "field", idx)
    }

    fn method(&self, idx: u32) -> Result<u32, EncodeError> {
        lookup(&self.methods, "method", idx)
    }

    fn call_site(&self, idx: u32) -> Result<u32, EncodeError> {
        self.check_len(idx, self.call_sites, "call site")
    }

    fn method_handle(&self, idx: u32) -> Result<u32, EncodeError> {
        self.check_len(idx, self.method_handles, "method handle")
    }

    fn check_len(&self, idx: u32, len: usize, kind: &'static str) -> Result<u32, EncodeError> {
        if (idx as usize) < len {
            Ok(idx)
        } else {
            Err(EncodeError::DanglingIndex { kind, index: idx })
        }
    }
}

/// Sort orders of every pool, as old indices in new position order
struct Orders {
    strings: Vec<usize>,
    types: Vec<usize>,
    protos: Vec<usize>,
    fields: Vec<usize>,
    methods: Vec<usize>,
}

fn build_remap(dex: &DexFile) -> Result<(Remap, Orders), EncodeError> {
    let utf16: Vec<Vec<u16>> = dex.strings.iter().map(|s| s.to_utf16()).collect();
    let mut strings: Vec<usize> = (0..dex.strings.len()).collect();
    strings.sort_by(|&a, &b| utf16[a].cmp(&utf16[b]));
    let string_ranks = ranks(&strings);

    let type_keys = dex
        .types
        .iter()
        .map(|&s| lookup(&string_ranks, "string", s))
        .collect::<Result<Vec<_>, _>>()?;
    let mut types: Vec<usize> = (0..dex.types.len()).collect();
    types.sort_by_key(|&t| type_keys[t]);
    let type_ranks = ranks(&types);

    let proto_keys = dex
        .protos
        .iter()
        .map(|p| {
            lookup(&string_ranks, "string", p.shorty)?;
            let params = p
                .parameters
                .iter()
                .map(|&t| lookup(&type_ranks, "type", t))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((lookup(&type_ranks, "type", p.return_type)?, params))
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    let mut protos: Vec<usize> = (0..dex.protos.len()).collect();
    protos.sort_by(|&a, &b| proto_keys[a].cmp(&proto_keys[b]));
    let proto_ranks = ranks(&protos);

    let field_keys = dex
        .fields
        .iter()
        .map(|f| {
            Ok((
                lookup(&type_ranks, "type", f.class)?,
                lookup(&string_ranks, "string", f.name)?,
                lookup(&type_ranks, "type", f.field_type)?,
            ))
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    let mut fields: Vec<usize> = (0..dex.fields.len()).collect();
    fields.sort_by_key(|&f| field_keys[f]);

    let method_keys = dex
        .methods
        .iter()
        .map(|m| {
            Ok((
                lookup(&type_ranks, "type", m.class)?,
                lookup(&string_ranks, "string", m.name)?,
                lookup(&proto_ranks, "proto", m.proto)?,
            ))
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    let mut methods: Vec<usize> = (0..dex.methods.len()).collect();
    methods.sort_by_key(|&m| method_keys[m]);

    let remap = Remap {
        fields: ranks(&fields),
        methods: ranks(&methods),
        strings: string_ranks,
        types: type_ranks,
        protos: proto_ranks,
        call_sites: dex.call_sites.len(),
        method_handles: dex.method_handles.len(),
    };
    let orders = Orders {
        strings,
        types,
        protos,
        fields,
        methods,
    };
    Ok((remap, orders))
}

/// Growable little-endian output buffer
#[derive(Default)]
struct Out {
    buf: Vec<u8>,
}

impl Out {
    fn pos(&self) -> u32 {
        self.buf.len() as u32
    }

    fn align(&mut self, to: usize) {
        while self.buf.len() % to != 0 {
            self.buf.push(0);
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn uleb(&mut self, v: u32) {
        write_uleb128(&mut self.buf, v);
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        LittleEndian::write_u32(&mut self.buf[at..at + 4], v);
    }
}

/// `map_list` entries, in layout order
#[derive(Default)]
struct MapList {
    items: Vec<(u16, u32, u32)>,
}

impl MapList {
    fn add(&mut self, kind: u16, count: usize, offset: u32) {
        if count > 0 {
            self.items.push((kind, count as u32, offset));
        }
    }
}

fn fits_u16(kind: &'static str, index: u32) -> Result<u16, EncodeError> {
    u16::try_from(index).map_err(|_| EncodeError::IndexOverflow {
        kind,
        index,
        bits: 16,
    })
}

/// Serializes `dex`, producing a complete image with a valid signature and
/// checksum.
pub fn encode(dex: &DexFile) -> Result<Vec<u8>, EncodeError> {
    let (remap, orders) = build_remap(dex)?;
    let mut out = Out::default();
    let mut map = MapList::default();
    out.buf.resize(HEADER_SIZE, 0);
    map.add(item_type::HEADER, 1, 0);

    // id tables, sized now and filled once data offsets are known
    let string_ids_off = reserve(&mut out, &mut map, item_type::STRING_ID, dex.strings.len(), 4);
    let type_ids_off = reserve(&mut out, &mut map, item_type::TYPE_ID, dex.types.len(), 4);
    let proto_ids_off = reserve(&mut out, &mut map, item_type::PROTO_ID, dex.protos.len(), 12);
    let field_ids_off = reserve(&mut out, &mut map, item_type::FIELD_ID, dex.fields.len(), 8);
    let method_ids_off = reserve(&mut out, &mut map, item_type::METHOD_ID, dex.methods.len(), 8);
    let class_defs_off = reserve(&mut out, &mut map, item_type::CLASS_DEF, dex.classes.len(), 32);
    let call_site_ids_off = reserve(
        &mut out,
        &mut map,
        item_type::CALL_SITE_ID,
        dex.call_sites.len(),
        4,
    );
    let method_handles_off = reserve(
        &mut out,
        &mut map,
        item_type::METHOD_HANDLE,
        dex.method_handles.len(),
        8,
    );
    let data_off = out.pos();

    // string_data_item
    let start = out.pos();
    let mut string_data = vec![0u32; dex.strings.len()];
    for &old in &orders.strings {
        let s = &dex.strings[old];
        string_data[old] = out.pos();
        out.uleb(s.utf16_len());
        out.buf.extend_from_slice(s.as_bytes());
        out.u8(0);
    }
    map.add(item_type::STRING_DATA, dex.strings.len(), start);

    // type_list, shared between identical lists
    out.align(4);
    let start = out.pos();
    let mut type_lists: HashMap<Vec<u16>, u32> = HashMap::new();
    let mut type_list = |out: &mut Out, list: &[u32]| -> Result<u32, EncodeError> {
        if list.is_empty() {
            return Ok(0);
        }
        let mapped = list
            .iter()
            .map(|&t| fits_u16("type", remap.type_(t)?))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(&offset) = type_lists.get(&mapped) {
            return Ok(offset);
        }
        out.align(4);
        let offset = out.pos();
        out.u32(mapped.len() as u32);
        for &t in &mapped {
            out.u16(t);
        }
        type_lists.insert(mapped, offset);
        Ok(offset)
    };
    let mut proto_params = vec![0u32; dex.protos.len()];
    for &old in &orders.protos {
        proto_params[old] = type_list(&mut out, &dex.protos[old].parameters)?;
    }
    let interfaces = dex
        .classes
        .iter()
        .map(|c| type_list(&mut out, &c.interfaces))
        .collect::<Result<Vec<_>, _>>()?;
    map.add(item_type::TYPE_LIST, type_lists.len(), start);

    // annotations: items, then sets, then ref lists, then directories
    let prepared = dex
        .classes
        .iter()
        .map(|class| {
            class
                .annotations
                .as_ref()
                .map(|dir| PreparedDirectory::new(dir, &remap))
                .transpose()
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut annotations = AnnotationWriter::new(&remap);

    let start = out.pos();
    for dir in prepared.iter().flatten() {
        annotations.write_items(&mut out, dir)?;
    }
    map.add(item_type::ANNOTATION, annotations.items.len(), start);

    out.align(4);
    let start = out.pos();
    for dir in prepared.iter().flatten() {
        annotations.write_sets(&mut out, dir)?;
    }
    map.add(item_type::ANNOTATION_SET, annotations.sets.len(), start);

    out.align(4);
    let start = out.pos();
    let ref_lists = prepared
        .iter()
        .map(|dir| match dir {
            Some(dir) => annotations.write_ref_lists(&mut out, dir),
            None => Ok(Vec::new()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let ref_list_count = ref_lists.iter().map(Vec::len).sum();
    map.add(item_type::ANNOTATION_SET_REF_LIST, ref_list_count, start);

    out.align(4);
    let start = out.pos();
    let directories = prepared
        .iter()
        .zip(&ref_lists)
        .map(|(dir, ref_lists)| match dir {
            Some(dir) => annotations.write_directory(&mut out, dir, ref_lists),
            None => Ok(0),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let directory_count = prepared.iter().flatten().count();
    map.add(item_type::ANNOTATIONS_DIRECTORY, directory_count, start);

    // debug_info_item, then code_item, in class and method order
    let sorted_data = dex
        .classes
        .iter()
        .map(|class| {
            class
                .class_data
                .as_ref()
                .map(|data| SortedClassData::new(data, &remap))
                .transpose()
        })
        .collect::<Result<Vec<_>, _>>()?;
    let bodies: Vec<&CodeItem> = sorted_data
        .iter()
        .flatten()
        .flat_map(|data| data.direct_methods.iter().chain(&data.virtual_methods))
        .filter_map(|method| method.code)
        .collect();

    let start = out.pos();
    let mut debug_count = 0;
    let debug_offsets = bodies
        .iter()
        .map(|code| match &code.debug_info {
            Some(info) => {
                debug_count += 1;
                let offset = out.pos();
                write_debug_info(&mut out, info, &remap)?;
                Ok(offset)
            }
            None => Ok(0),
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    map.add(item_type::DEBUG_INFO, debug_count, start);

    out.align(4);
    let start = out.pos();
    let code_offsets = bodies
        .iter()
        .zip(&debug_offsets)
        .map(|(code, &debug_off)| {
            out.align(4);
            let offset = out.pos();
            write_code_item(&mut out, code, debug_off, &remap)?;
            Ok(offset)
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    map.add(item_type::CODE, bodies.len(), start);

    // class_data_item
    let start = out.pos();
    let mut code_offsets = code_offsets.into_iter();
    let mut class_data_count = 0;
    let class_data: Vec<u32> = sorted_data
        .iter()
        .map(|data| match data {
            Some(data) => {
                class_data_count += 1;
                let offset = out.pos();
                data.write(&mut out, &mut code_offsets);
                offset
            }
            None => 0,
        })
        .collect();
    map.add(item_type::CLASS_DATA, class_data_count, start);

    // encoded_array_item: call sites, then static values
    let start = out.pos();
    let call_site_data = dex
        .call_sites
        .iter()
        .map(|values| {
            let offset = out.pos();
            write_encoded_array(&mut out.buf, values, &remap)?;
            Ok(offset)
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    let mut static_count = 0;
    let static_values = dex
        .classes
        .iter()
        .map(|class| match &class.static_values {
            Some(values) => {
                static_count += 1;
                let offset = out.pos();
                write_encoded_array(&mut out.buf, values, &remap)?;
                Ok(offset)
            }
            None => Ok(0),
        })
        .collect::<Result<Vec<_>, EncodeError>>()?;
    map.add(
        item_type::ENCODED_ARRAY,
        dex.call_sites.len() + static_count,
        start,
    );

    if let Some(hiddenapi) = &dex.hiddenapi {
        out.align(4);
        map.add(item_type::HIDDENAPI_CLASS_DATA, 1, out.pos());
        out.buf.extend_from_slice(hiddenapi);
    }

    out.align(4);
    let map_off = out.pos();
    map.add(item_type::MAP_LIST, 1, map_off);
    out.u32(map.items.len() as u32);
    for &(kind, count, offset) in &map.items {
        out.u16(kind);
        out.u16(0);
        out.u32(count);
        out.u32(offset);
    }

    // id tables
    for (new, &old) in orders.strings.iter().enumerate() {
        out.patch_u32(string_ids_off + new * 4, string_data[old]);
    }
    for (new, &old) in orders.types.iter().enumerate() {
        out.patch_u32(type_ids_off + new * 4, remap.string(dex.types[old])?);
    }
    for (new, &old) in orders.protos.iter().enumerate() {
        let proto = &dex.protos[old];
        let at = proto_ids_off + new * 12;
        out.patch_u32(at, remap.string(proto.shorty)?);
        out.patch_u32(at + 4, remap.type_(proto.return_type)?);
        out.patch_u32(at + 8, proto_params[old]);
    }
    for (new, &old) in orders.fields.iter().enumerate() {
        let field = &dex.fields[old];
        let at = field_ids_off + new * 8;
        LittleEndian::write_u16(&mut out.buf[at..], fits_u16("type", remap.type_(field.class)?)?);
        LittleEndian::write_u16(
            &mut out.buf[at + 2..],
            fits_u16("type", remap.type_(field.field_type)?)?,
        );
        out.patch_u32(at + 4, remap.string(field.name)?);
    }
    for (new, &old) in orders.methods.iter().enumerate() {
        let method = &dex.methods[old];
        let at = method_ids_off + new * 8;
        LittleEndian::write_u16(&mut out.buf[at..], fits_u16("type", remap.type_(method.class)?)?);
        LittleEndian::write_u16(
            &mut out.buf[at + 2..],
            fits_u16("proto", remap.proto(method.proto)?)?,
        );
        out.patch_u32(at + 4, remap.string(method.name)?);
    }
    for (i, class) in dex.classes.iter().enumerate() {
        let at = class_defs_off + i * 32;
        out.patch_u32(at, remap.type_(class.class_type)?);
        out.patch_u32(at + 4, class.access_flags);
        let superclass = class.superclass.map(|t| remap.type_(t)).transpose()?;
        out.patch_u32(at + 8, superclass.unwrap_or(NO_INDEX));
        out.patch_u32(at + 12, interfaces[i]);
        let source_file = class.source_file.map(|s| remap.string(s)).transpose()?;
        out.patch_u32(at + 16, source_file.unwrap_or(NO_INDEX));
        out.patch_u32(at + 20, directories[i]);
        out.patch_u32(at + 24, class_data[i]);
        out.patch_u32(at + 28, static_values[i]);
    }
    for (i, &offset) in call_site_data.iter().enumerate() {
        out.patch_u32(call_site_ids_off + i * 4, offset);
    }
    for (i, handle) in dex.method_handles.iter().enumerate() {
        let target = if handle.targets_field() {
            remap.field(handle.target)?
        } else {
            remap.method(handle.target)?
        };
        let at = method_handles_off + i * 8;
        LittleEndian::write_u16(&mut out.buf[at..], handle.kind);
        LittleEndian::write_u16(&mut out.buf[at + 4..], fits_u16("method handle target", target)?);
    }

    let file_size = out.pos();
    write_header(
        &mut out,
        dex,
        &[
            (0x38, dex.strings.len(), string_ids_off),
            (0x40, dex.types.len(), type_ids_off),
            (0x48, dex.protos.len(), proto_ids_off),
            (0x50, dex.fields.len(), field_ids_off),
            (0x58, dex.methods.len(), method_ids_off),
            (0x60, dex.classes.len(), class_defs_off),
        ],
        map_off,
        data_off,
    );

    let signature = Sha1::digest(&out.buf[0x20..]);
    out.buf[0x0c..0x20].copy_from_slice(&signature);
    let sum = checksum(&out.buf);
    out.patch_u32(0x08, sum);

    debug!(file_size, sections = map.items.len(), "encoded dex");
    Ok(out.buf)
}

fn reserve(out: &mut Out, map: &mut MapList, kind: u16, count: usize, item: usize) -> usize {
    let offset = out.buf.len();
    map.add(kind, count, offset as u32);
    out.buf.resize(offset + count * item, 0);
    offset
}

fn write_header(
    out: &mut Out,
    dex: &DexFile,
    sections: &[(usize, usize, usize)],
    map_off: u32,
    data_off: u32,
) {
    let file_size = out.pos();
    let header = &mut out.buf[..HEADER_SIZE];
    header[0..4].copy_from_slice(b"dex\n");
    header[4..7].copy_from_slice(&dex.version);
    header[7] = 0;
    LittleEndian::write_u32(&mut header[0x20..], file_size);
    LittleEndian::write_u32(&mut header[0x24..], HEADER_SIZE as u32);
    LittleEndian::write_u32(&mut header[0x28..], ENDIAN_CONSTANT);
    LittleEndian::write_u32(&mut header[0x34..], map_off);
    for &(at, count, offset) in sections {
        let offset = if count == 0 { 0 } else { offset as u32 };
        LittleEndian::write_u32(&mut header[at..], count as u32);
        LittleEndian::write_u32(&mut header[at + 4..], offset);
    }
    LittleEndian::write_u32(&mut header[0x68..], file_size - data_off);
    LittleEndian::write_u32(&mut header[0x6c..], data_off);
}

/// Directory entries remapped and sorted by member index
struct PreparedDirectory<'d> {
    class_annotations: Option<&'d AnnotationSet>,
    fields: Vec<(u32, &'d AnnotationSet)>,
    methods: Vec<(u32, &'d AnnotationSet)>,
    parameters: Vec<(u32, &'d AnnotationSetRefList)>,
}

impl<'d> PreparedDirectory<'d> {
    fn new(dir: &'d AnnotationsDirectory, remap: &Remap) -> Result<Self, EncodeError> {
        let mut fields = dir
            .fields
            .iter()
            .map(|(idx, set)| Ok((remap.field(*idx)?, set)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        let mut methods = dir
            .methods
            .iter()
            .map(|(idx, set)| Ok((remap.method(*idx)?, set)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        let mut parameters = dir
            .parameters
            .iter()
            .map(|(idx, list)| Ok((remap.method(*idx)?, list)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        fields.sort_by_key(|&(idx, _)| idx);
        methods.sort_by_key(|&(idx, _)| idx);
        parameters.sort_by_key(|&(idx, _)| idx);

        Ok(PreparedDirectory {
            class_annotations: dir.class_annotations.as_ref(),
            fields,
            methods,
            parameters,
        })
    }

    fn sets(&self) -> impl Iterator<Item = &'d AnnotationSet> + '_ {
        self.class_annotations
            .into_iter()
            .chain(self.fields.iter().map(|&(_, set)| set))
            .chain(self.methods.iter().map(|&(_, set)| set))
            .chain(
                self.parameters
                    .iter()
                    .flat_map(|&(_, list)| list.iter().flatten()),
            )
    }
}

/// Writes annotation items and sets, sharing identical ones
struct AnnotationWriter<'a> {
    remap: &'a Remap,
    items: HashMap<Vec<u8>, u32>,
    sets: HashMap<Vec<u32>, u32>,
}

impl<'a> AnnotationWriter<'a> {
    fn new(remap: &'a Remap) -> Self {
        AnnotationWriter {
            remap,
            items: HashMap::new(),
            sets: HashMap::new(),
        }
    }

    /// Item bytes of a set, in annotation type order
    fn sorted_items(&self, set: &AnnotationSet) -> Result<Vec<Vec<u8>>, EncodeError> {
        let mut items = set
            .iter()
            .map(|item| {
                let type_idx = self.remap.type_(item.annotation.type_idx)?;
                Ok((type_idx, self.item_bytes(item)?))
            })
            .collect::<Result<Vec<_>, EncodeError>>()?;
        items.sort_by_key(|&(type_idx, _)| type_idx);
        Ok(items.into_iter().map(|(_, bytes)| bytes).collect())
    }

    fn item_bytes(&self, item: &AnnotationItem) -> Result<Vec<u8>, EncodeError> {
        let mut bytes = vec![item.visibility];
        write_encoded_annotation(&mut bytes, &item.annotation, self.remap)?;
        Ok(bytes)
    }

    fn write_items(&mut self, out: &mut Out, dir: &PreparedDirectory) -> Result<(), EncodeError> {
        for set in dir.sets() {
            for bytes in self.sorted_items(set)? {
                if !self.items.contains_key(&bytes) {
                    let offset = out.pos();
                    out.buf.extend_from_slice(&bytes);
                    self.items.insert(bytes, offset);
                }
            }
        }
        Ok(())
    }

    fn set_entries(&self, set: &AnnotationSet) -> Result<Vec<u32>, EncodeError> {
        self.sorted_items(set)?
            .iter()
            .map(|bytes| {
                self.items
                    .get(bytes)
                    .copied()
                    .ok_or(EncodeError::DanglingIndex {
                        kind: "annotation",
                        index: bytes.len() as u32,
                    })
            })
            .collect()
    }

    fn write_sets(&mut self, out: &mut Out, dir: &PreparedDirectory) -> Result<(), EncodeError> {
        for set in dir.sets() {
            let entries = self.set_entries(set)?;
            if !self.sets.contains_key(&entries) {
                out.align(4);
                let offset = out.pos();
                out.u32(entries.len() as u32);
                for &entry in &entries {
                    out.u32(entry);
                }
                self.sets.insert(entries, offset);
            }
        }
        Ok(())
    }

    fn set_offset(&self, set: &AnnotationSet) -> Result<u32, EncodeError> {
        let entries = self.set_entries(set)?;
        self.sets
            .get(&entries)
            .copied()
            .ok_or(EncodeError::DanglingIndex {
                kind: "annotation set",
                index: entries.len() as u32,
            })
    }

    /// One ref list offset per annotated parameter list, in directory order
    fn write_ref_lists(
        &self,
        out: &mut Out,
        dir: &PreparedDirectory,
    ) -> Result<Vec<u32>, EncodeError> {
        dir.parameters
            .iter()
            .map(|&(_, list)| {
                out.align(4);
                let offset = out.pos();
                out.u32(list.len() as u32);
                for set in list {
                    let set_off = set.as_ref().map(|s| self.set_offset(s)).transpose()?;
                    out.u32(set_off.unwrap_or(0));
                }
                Ok(offset)
            })
            .collect()
    }

    fn write_directory(
        &self,
        out: &mut Out,
        dir: &PreparedDirectory,
        ref_lists: &[u32],
    ) -> Result<u32, EncodeError> {
        let class_off = dir
            .class_annotations
            .map(|set| self.set_offset(set))
            .transpose()?
            .unwrap_or(0);
        let fields = dir
            .fields
            .iter()
            .map(|&(idx, set)| Ok((idx, self.set_offset(set)?)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        let methods = dir
            .methods
            .iter()
            .map(|&(idx, set)| Ok((idx, self.set_offset(set)?)))
            .collect::<Result<Vec<_>, EncodeError>>()?;
        let parameters = dir.parameters.iter().map(|&(idx, _)| idx).zip(ref_lists.iter().copied());

        out.align(4);
        let offset = out.pos();
        out.u32(class_off);
        out.u32(fields.len() as u32);
        out.u32(methods.len() as u32);
        out.u32(dir.parameters.len() as u32);
        for (idx, off) in fields.into_iter().chain(methods).chain(parameters) {
            out.u32(idx);
            out.u32(off);
        }
        Ok(offset)
    }
}

fn write_encoded_annotation(
    out: &mut Vec<u8>,
    annotation: &EncodedAnnotation,
    remap: &Remap,
) -> Result<(), EncodeError> {
    let mut elements = annotation
        .elements
        .iter()
        .map(|e| Ok((remap.string(e.name)?, &e.value)))
        .collect::<Result<Vec<_>, EncodeError>>()?;
    elements.sort_by_key(|&(name, _)| name);

    write_uleb128(out, remap.type_(annotation.type_idx)?);
    write_uleb128(out, elements.len() as u32);
    for (name, value) in elements {
        write_uleb128(out, name);
        write_encoded_value(out, value, remap)?;
    }
    Ok(())
}

fn write_encoded_array(
    out: &mut Vec<u8>,
    values: &[EncodedValue],
    remap: &Remap,
) -> Result<(), EncodeError> {
    write_uleb128(out, values.len() as u32);
    for value in values {
        write_encoded_value(out, value, remap)?;
    }
    Ok(())
}

fn write_encoded_value(
    out: &mut Vec<u8>,
    value: &EncodedValue,
    remap: &Remap,
) -> Result<(), EncodeError> {
    match value {
        EncodedValue::Byte(v) => {
            out.push(0x00);
            out.push(*v as u8);
        }
        EncodedValue::Short(v) => write_signed(out, 0x02, i64::from(*v)),
        EncodedValue::Char(v) => write_unsigned(out, 0x03, u64::from(*v)),
        EncodedValue::Int(v) => write_signed(out, 0x04, i64::from(*v)),
        EncodedValue::Long(v) => write_signed(out, 0x06, *v),
        EncodedValue::Float(bits) => write_right_zero_extended(out, 0x10, &bits.to_le_bytes()),
        EncodedValue::Double(bits) => write_right_zero_extended(out, 0x11, &bits.to_le_bytes()),
        EncodedValue::MethodType(idx) => write_unsigned(out, 0x15, remap.proto(*idx)?.into()),
        EncodedValue::MethodHandle(idx) => {
            write_unsigned(out, 0x16, remap.method_handle(*idx)?.into())
        }
        EncodedValue::String(idx) => write_unsigned(out, 0x17, remap.string(*idx)?.into()),
        EncodedValue::Type(idx) => write_unsigned(out, 0x18, remap.type_(*idx)?.into()),
        EncodedValue::Field(idx) => write_unsigned(out, 0x19, remap.field(*idx)?.into()),
        EncodedValue::Method(idx) => write_unsigned(out, 0x1a, remap.method(*idx)?.into()),
        EncodedValue::Enum(idx) => write_unsigned(out, 0x1b, remap.field(*idx)?.into()),
        EncodedValue::Array(values) => {
            out.push(0x1c);
            write_encoded_array(out, values, remap)?;
        }
        EncodedValue::Annotation(annotation) => {
            out.push(0x1d);
            write_encoded_annotation(out, annotation, remap)?;
        }
        EncodedValue::Null => out.push(0x1e),
        EncodedValue::Boolean(v) => out.push((u8::from(*v) << 5) | 0x1f),
    }
    Ok(())
}

fn write_sized(out: &mut Vec<u8>, value_type: u8, bytes: &[u8]) {
    out.push(((bytes.len() as u8 - 1) << 5) | value_type);
    out.extend_from_slice(bytes);
}

/// Shortest sign-extended form
fn write_signed(out: &mut Vec<u8>, value_type: u8, value: i64) {
    let bytes = value.to_le_bytes();
    let mut len = 8;
    while len > 1 {
        let top = bytes[len - 1];
        let next_sign = bytes[len - 2] & 0x80;
        if (top == 0x00 && next_sign == 0) || (top == 0xff && next_sign != 0) {
            len -= 1;
        } else {
            break;
        }
    }
    write_sized(out, value_type, &bytes[..len]);
}

/// Shortest zero-extended form, at least one byte
fn write_unsigned(out: &mut Vec<u8>, value_type: u8, value: u64) {
    let bytes = value.to_le_bytes();
    let len = bytes.iter().rposition(|&b| b != 0).map_or(1, |i| i + 1);
    write_sized(out, value_type, &bytes[..len]);
}

/// Drops low-order zero bytes, keeping at least one
fn write_right_zero_extended(out: &mut Vec<u8>, value_type: u8, le_bytes: &[u8]) {
    let skip = le_bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(le_bytes.len() - 1);
    write_sized(out, value_type, &le_bytes[skip..]);
}

fn write_debug_info(out: &mut Out, info: &DebugInfo, remap: &Remap) -> Result<(), EncodeError> {
    let string = |idx: Option<u32>| idx.map(|s| remap.string(s)).transpose();
    let type_ = |idx: Option<u32>| idx.map(|t| remap.type_(t)).transpose();

    out.uleb(info.line_start);
    out.uleb(info.parameter_names.len() as u32);
    for &name in &info.parameter_names {
        write_uleb128p1(&mut out.buf, string(name)?);
    }
    for op in &info.ops {
        match *op {
            DebugOp::AdvancePc(delta) => {
                out.u8(0x01);
                out.uleb(delta);
            }
            DebugOp::AdvanceLine(delta) => {
                out.u8(0x02);
                write_sleb128(&mut out.buf, delta);
            }
            DebugOp::StartLocal {
                register,
                name,
                type_idx,
            } => {
                out.u8(0x03);
                out.uleb(register);
                write_uleb128p1(&mut out.buf, string(name)?);
                write_uleb128p1(&mut out.buf, type_(type_idx)?);
            }
            DebugOp::StartLocalExtended {
                register,
                name,
                type_idx,
                signature,
            } => {
                out.u8(0x04);
                out.uleb(register);
                write_uleb128p1(&mut out.buf, string(name)?);
                write_uleb128p1(&mut out.buf, type_(type_idx)?);
                write_uleb128p1(&mut out.buf, string(signature)?);
            }
            DebugOp::EndLocal(register) => {
                out.u8(0x05);
                out.uleb(register);
            }
            DebugOp::RestartLocal(register) => {
                out.u8(0x06);
                out.uleb(register);
            }
            DebugOp::SetPrologueEnd => out.u8(0x07),
            DebugOp::SetEpilogueBegin => out.u8(0x08),
            DebugOp::SetFile(name) => {
                out.u8(0x09);
                write_uleb128p1(&mut out.buf, string(name)?);
            }
            DebugOp::Special(opcode) => out.u8(opcode),
        }
    }
    out.u8(0x00);
    Ok(())
}

/// Rewrites the pool operands of an instruction stream
fn remap_insns(insns: &[u16], remap: &Remap) -> Result<Vec<u16>, EncodeError> {
    let mut out = insns.to_vec();
    let mut pc = 0;
    while pc < out.len() {
        let width = opcode::width_at(&out, pc)?;
        let op = (out[pc] & 0xff) as u8;
        let is_payload = op == opcode::NOP && out[pc] >> 8 != 0;
        if !is_payload {
            let narrow = |kind: &'static str, index: u32| fits_u16(kind, index);
            let operand = out.get(pc + 1).copied().map_or(0, u32::from);
            match opcode::index_kind(op) {
                IndexKind::None => {}
                IndexKind::String if op == 0x1b => {
                    let old = u32::from(out[pc + 1]) | (u32::from(out[pc + 2]) << 16);
                    let new = remap.string(old)?;
                    out[pc + 1] = new as u16;
                    out[pc + 2] = (new >> 16) as u16;
                }
                IndexKind::String => out[pc + 1] = narrow("string", remap.string(operand)?)?,
                IndexKind::Type => out[pc + 1] = narrow("type", remap.type_(operand)?)?,
                IndexKind::Field => out[pc + 1] = narrow("field", remap.field(operand)?)?,
                IndexKind::Method => out[pc + 1] = narrow("method", remap.method(operand)?)?,
                IndexKind::MethodAndProto => {
                    out[pc + 1] = narrow("method", remap.method(operand)?)?;
                    let proto = u32::from(out[pc + 3]);
                    out[pc + 3] = narrow("proto", remap.proto(proto)?)?;
                }
                IndexKind::Proto => out[pc + 1] = narrow("proto", remap.proto(operand)?)?,
                IndexKind::CallSite => {
                    out[pc + 1] = narrow("call site", remap.call_site(operand)?)?
                }
                IndexKind::MethodHandle => {
                    out[pc + 1] = narrow("method handle", remap.method_handle(operand)?)?
                }
            }
        }
        pc += width;
    }
    Ok(out)
}

fn write_code_item(
    out: &mut Out,
    code: &CodeItem,
    debug_off: u32,
    remap: &Remap,
) -> Result<(), EncodeError> {
    let insns = remap_insns(&code.insns, remap)?;

    out.u16(code.registers_size);
    out.u16(code.ins_size);
    out.u16(code.outs_size);
    out.u16(code.tries.len() as u16);
    out.u32(debug_off);
    out.u32(insns.len() as u32);
    for &unit in &insns {
        out.u16(unit);
    }
    if code.tries.is_empty() {
        return Ok(());
    }
    if insns.len() % 2 == 1 {
        out.u16(0);
    }

    let mut list = Vec::new();
    write_uleb128(&mut list, code.handlers.len() as u32);
    let mut handler_offsets = Vec::with_capacity(code.handlers.len());
    for handler in &code.handlers {
        handler_offsets.push(list.len());
        let count = handler.catches.len() as i32;
        write_sleb128(
            &mut list,
            if handler.catch_all.is_some() {
                -count
            } else {
                count
            },
        );
        for pair in &handler.catches {
            write_uleb128(&mut list, remap.type_(pair.type_idx)?);
            write_uleb128(&mut list, pair.addr);
        }
        if let Some(addr) = handler.catch_all {
            write_uleb128(&mut list, addr);
        }
    }

    for try_item in &code.tries {
        let handler_off = handler_offsets
            .get(try_item.handler)
            .copied()
            .ok_or(EncodeError::DanglingIndex {
                kind: "catch handler",
                index: try_item.handler as u32,
            })?;
        let handler_off = u16::try_from(handler_off)
            .map_err(|_| EncodeError::HandlerOffsetOverflow { size: list.len() })?;
        out.u32(try_item.start_addr);
        out.u16(try_item.insn_count);
        out.u16(handler_off);
    }
    out.buf.extend_from_slice(&list);
    Ok(())
}

/// `class_data_item` contents remapped and sorted by member index
struct SortedClassData<'d> {
    static_fields: Vec<(u32, u32)>,
    instance_fields: Vec<(u32, u32)>,
    direct_methods: Vec<SortedMethod<'d>>,
    virtual_methods: Vec<SortedMethod<'d>>,
}

struct SortedMethod<'d> {
    method: u32,
    access_flags: u32,
    code: Option<&'d CodeItem>,
}

impl<'d> SortedClassData<'d> {
    fn new(data: &'d ClassData, remap: &Remap) -> Result<Self, EncodeError> {
        let fields = |list: &[EncodedField]| {
            let mut mapped = list
                .iter()
                .map(|f| Ok((remap.field(f.field)?, f.access_flags)))
                .collect::<Result<Vec<_>, EncodeError>>()?;
            mapped.sort_by_key(|&(idx, _)| idx);
            Ok::<_, EncodeError>(mapped)
        };
        let methods = |list: &'d [EncodedMethod]| {
            let mut mapped = list
                .iter()
                .map(|m| {
                    Ok(SortedMethod {
                        method: remap.method(m.method)?,
                        access_flags: m.access_flags,
                        code: m.code.as_ref(),
                    })
                })
                .collect::<Result<Vec<_>, EncodeError>>()?;
            mapped.sort_by_key(|m| m.method);
            Ok::<_, EncodeError>(mapped)
        };

        Ok(SortedClassData {
            static_fields: fields(&data.static_fields)?,
            instance_fields: fields(&data.instance_fields)?,
            direct_methods: methods(&data.direct_methods)?,
            virtual_methods: methods(&data.virtual_methods)?,
        })
    }

    /// `code_offsets` yields one offset per method with a body, in order
    fn write(&self, out: &mut Out, code_offsets: &mut impl Iterator<Item = u32>) {
        out.uleb(self.static_fields.len() as u32);
        out.uleb(self.instance_fields.len() as u32);
        out.uleb(self.direct_methods.len() as u32);
        out.uleb(self.virtual_methods.len() as u32);
        for list in [&self.static_fields, &self.instance_fields] {
            let mut prev = 0;
            for &(idx, access) in list {
                out.uleb(idx - prev);
                out.uleb(access);
                prev = idx;
            }
        }
        for list in [&self.direct_methods, &self.virtual_methods] {
            let mut prev = 0;
            for method in list {
                let code_off = match method.code {
                    Some(_) => code_offsets.next().unwrap_or(0),
                    None => 0,
                };
                out.uleb(method.method - prev);
                out.uleb(method.access_flags);
                out.uleb(code_off);
                prev = method.method;
            }
        }
    }
}

use std::borrow::Cow;

use super::mutf8::DexString;

/// In-memory form of a DEX image.
///
/// Pools keep the index space of the image they were decoded from; interning
/// appends new entries at the end. [`encode`](super::encode) re-sorts every
/// pool and remaps all references, so callers never have to keep pools in
/// canonical order themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct DexFile {
    /// The three version digits of the magic, e.g. `*b"035"`
    pub version: [u8; 3],
    pub strings: Vec<DexString>,
    /// Descriptor string index per type
    pub types: Vec<u32>,
    pub protos: Vec<ProtoId>,
    pub fields: Vec<FieldId>,
    pub methods: Vec<MethodId>,
    pub classes: Vec<ClassDef>,
    /// One encoded array (bootstrap arguments) per call site
    pub call_sites: Vec<Vec<EncodedValue>>,
    pub method_handles: Vec<MethodHandleItem>,
    /// `hiddenapi_class_data_item`, carried verbatim
    pub hiddenapi: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtoId {
    pub shorty: u32,
    pub return_type: u32,
    pub parameters: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: u32,
    pub field_type: u32,
    pub name: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub class: u32,
    pub proto: u32,
    pub name: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodHandleItem {
    pub kind: u16,
    /// Field index for the accessor kinds, method index otherwise
    pub target: u32,
}

impl MethodHandleItem {
    pub fn targets_field(&self) -> bool {
        self.kind <= 0x03
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub class_type: u32,
    pub access_flags: u32,
    pub superclass: Option<u32>,
    pub interfaces: Vec<u32>,
    pub source_file: Option<u32>,
    pub annotations: Option<AnnotationsDirectory>,
    pub class_data: Option<ClassData>,
    pub static_values: Option<Vec<EncodedValue>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassData {
    pub static_fields: Vec<EncodedField>,
    pub instance_fields: Vec<EncodedField>,
    pub direct_methods: Vec<EncodedMethod>,
    pub virtual_methods: Vec<EncodedMethod>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField {
    pub field: u32,
    pub access_flags: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedMethod {
    pub method: u32,
    pub access_flags: u32,
    /// Absent for abstract and native methods
    pub code: Option<CodeItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeItem {
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub debug_info: Option<DebugInfo>,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<CatchHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    /// Position in [`CodeItem::handlers`]
    pub handler: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchHandler {
    pub catches: Vec<TypeAddrPair>,
    pub catch_all: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeAddrPair {
    pub type_idx: u32,
    pub addr: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub line_start: u32,
    pub parameter_names: Vec<Option<u32>>,
    /// Everything up to, not including, `DBG_END_SEQUENCE`
    pub ops: Vec<DebugOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugOp {
    AdvancePc(u32),
    AdvanceLine(i32),
    StartLocal {
        register: u32,
        name: Option<u32>,
        type_idx: Option<u32>,
    },
    StartLocalExtended {
        register: u32,
        name: Option<u32>,
        type_idx: Option<u32>,
        signature: Option<u32>,
    },
    EndLocal(u32),
    RestartLocal(u32),
    SetPrologueEnd,
    SetEpilogueBegin,
    SetFile(Option<u32>),
    Special(u8),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotationsDirectory {
    pub class_annotations: Option<AnnotationSet>,
    pub fields: Vec<(u32, AnnotationSet)>,
    pub methods: Vec<(u32, AnnotationSet)>,
    pub parameters: Vec<(u32, AnnotationSetRefList)>,
}

pub type AnnotationSet = Vec<AnnotationItem>;
pub type AnnotationSetRefList = Vec<Option<AnnotationSet>>;

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationItem {
    pub visibility: u8,
    pub annotation: EncodedAnnotation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAnnotation {
    pub type_idx: u32,
    pub elements: Vec<AnnotationElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationElement {
    pub name: u32,
    pub value: EncodedValue,
}

/// `encoded_value`; floating point values are kept as raw bits
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    MethodType(u32),
    MethodHandle(u32),
    String(u32),
    Type(u32),
    Field(u32),
    Method(u32),
    Enum(u32),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Direct,
    Virtual,
}

/// Stable address of an encoded method inside [`DexFile::classes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodKey {
    pub class: usize,
    pub kind: MethodKind,
    pub position: usize,
}

/// Read-only view of one method declaration and its body
#[derive(Debug, Clone)]
pub struct MethodRecord<'a> {
    pub key: MethodKey,
    pub method_idx: u32,
    pub declaring_type: Cow<'a, str>,
    pub name: Cow<'a, str>,
    pub return_type: Cow<'a, str>,
    pub parameter_types: Vec<Cow<'a, str>>,
    pub access_flags: u32,
    pub code: Option<&'a CodeItem>,
}

impl MethodRecord<'_> {
    pub fn has_body(&self) -> bool {
        self.code.is_some()
    }

    pub fn ins_count(&self) -> Option<u16> {
        self.code.map(|code| code.ins_size)
    }

    /// `Lcom/Foo;->bar(I)Z`
    pub fn signature(&self) -> String {
        format!(
            "{}->{}({}){}",
            self.declaring_type,
            self.name,
            self.parameter_types.concat(),
            self.return_type
        )
    }
}

impl Default for DexFile {
    fn default() -> Self {
        Self::new()
    }
}

impl DexFile {
    pub fn new() -> Self {
        DexFile {
            version: *b"035",
            strings: Vec::new(),
            types: Vec::new(),
            protos: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            classes: Vec::new(),
            call_sites: Vec::new(),
            method_handles: Vec::new(),
            hiddenapi: None,
        }
    }

    pub fn string(&self, idx: u32) -> Cow<'_, str> {
        self.strings
            .get(idx as usize)
            .map(DexString::to_str)
            .unwrap_or(Cow::Borrowed("<bad string>"))
    }

    pub fn type_descriptor(&self, idx: u32) -> Cow<'_, str> {
        match self.types.get(idx as usize) {
            Some(&string_idx) => self.string(string_idx),
            None => Cow::Borrowed("<bad type>"),
        }
    }

    pub fn find_string(&self, s: &str) -> Option<u32> {
        self.strings
            .iter()
            .position(|existing| existing.eq_str(s))
            .map(|idx| idx as u32)
    }

    pub fn find_type(&self, descriptor: &str) -> Option<u32> {
        let string_idx = self.find_string(descriptor)?;
        self.types
            .iter()
            .position(|&t| t == string_idx)
            .map(|idx| idx as u32)
    }

    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.find_string(s) {
            return idx;
        }
        self.strings.push(DexString::new(s));
        (self.strings.len() - 1) as u32
    }

    pub fn intern_type(&mut self, descriptor: &str) -> u32 {
        let string_idx = self.intern_string(descriptor);
        if let Some(idx) = self.types.iter().position(|&t| t == string_idx) {
            return idx as u32;
        }
        self.types.push(string_idx);
        (self.types.len() - 1) as u32
    }

    pub fn intern_proto(&mut self, return_type: &str, parameters: &[&str]) -> u32 {
        let shorty: String = std::iter::once(return_type)
            .chain(parameters.iter().copied())
            .map(shorty_char)
            .collect();
        let return_type = self.intern_type(return_type);
        let parameters: Vec<u32> = parameters.iter().map(|p| self.intern_type(p)).collect();

        if let Some(idx) = self
            .protos
            .iter()
            .position(|p| p.return_type == return_type && p.parameters == parameters)
        {
            return idx as u32;
        }
        let shorty = self.intern_string(&shorty);
        self.protos.push(ProtoId {
            shorty,
            return_type,
            parameters,
        });
        (self.protos.len() - 1) as u32
    }

    pub fn intern_field(&mut self, class: &str, name: &str, field_type: &str) -> u32 {
        let id = FieldId {
            class: self.intern_type(class),
            field_type: self.intern_type(field_type),
            name: self.intern_string(name),
        };
        if let Some(idx) = self.fields.iter().position(|f| *f == id) {
            return idx as u32;
        }
        self.fields.push(id);
        (self.fields.len() - 1) as u32
    }

    pub fn intern_method(
        &mut self,
        class: &str,
        name: &str,
        return_type: &str,
        parameters: &[&str],
    ) -> u32 {
        let id = MethodId {
            class: self.intern_type(class),
            proto: self.intern_proto(return_type, parameters),
            name: self.intern_string(name),
        };
        if let Some(idx) = self.methods.iter().position(|m| *m == id) {
            return idx as u32;
        }
        self.methods.push(id);
        (self.methods.len() - 1) as u32
    }

    /// All encoded methods in declaration order: class definitions in file
    /// order, direct methods before virtual ones.
    pub fn method_records(&self) -> impl Iterator<Item = MethodRecord<'_>> + '_ {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(class, def)| def.class_data.as_ref().map(|data| (class, data)))
            .flat_map(|(class, data)| {
                let direct = data
                    .direct_methods
                    .iter()
                    .enumerate()
                    .map(move |(position, method)| {
                        let key = MethodKey {
                            class,
                            kind: MethodKind::Direct,
                            position,
                        };
                        (key, method)
                    });
                let virtuals = data
                    .virtual_methods
                    .iter()
                    .enumerate()
                    .map(move |(position, method)| {
                        let key = MethodKey {
                            class,
                            kind: MethodKind::Virtual,
                            position,
                        };
                        (key, method)
                    });
                direct.chain(virtuals)
            })
            .map(|(key, method)| self.method_record(key, method))
    }

    fn method_record<'a>(&'a self, key: MethodKey, encoded: &'a EncodedMethod) -> MethodRecord<'a> {
        let id = self.methods.get(encoded.method as usize);
        let proto = id.and_then(|id| self.protos.get(id.proto as usize));

        MethodRecord {
            key,
            method_idx: encoded.method,
            declaring_type: id.map_or(Cow::Borrowed("<bad method>"), |id| {
                self.type_descriptor(id.class)
            }),
            name: id.map_or(Cow::Borrowed("<bad method>"), |id| self.string(id.name)),
            return_type: proto.map_or(Cow::Borrowed("<bad proto>"), |p| {
                self.type_descriptor(p.return_type)
            }),
            parameter_types: proto
                .map(|p| {
                    p.parameters
                        .iter()
                        .map(|&t| self.type_descriptor(t))
                        .collect()
                })
                .unwrap_or_default(),
            access_flags: encoded.access_flags,
            code: encoded.code.as_ref(),
        }
    }

    pub fn encoded_method(&self, key: MethodKey) -> Option<&EncodedMethod> {
        let data = self.classes.get(key.class)?.class_data.as_ref()?;
        match key.kind {
            MethodKind::Direct => data.direct_methods.get(key.position),
            MethodKind::Virtual => data.virtual_methods.get(key.position),
        }
    }

    pub fn encoded_method_mut(&mut self, key: MethodKey) -> Option<&mut EncodedMethod> {
        let data = self.classes.get_mut(key.class)?.class_data.as_mut()?;
        match key.kind {
            MethodKind::Direct => data.direct_methods.get_mut(key.position),
            MethodKind::Virtual => data.virtual_methods.get_mut(key.position),
        }
    }

    pub fn record(&self, key: MethodKey) -> Option<MethodRecord<'_>> {
        self.encoded_method(key)
            .map(|method| self.method_record(key, method))
    }
}

fn shorty_char(descriptor: &str) -> char {
    match descriptor.as_bytes().first() {
        Some(b'[') | Some(b'L') => 'L',
        Some(&c) => c as char,
        None => 'V',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_reuses_existing_entries() {
        let mut dex = DexFile::new();
        let list = dex.intern_type("Ljava/util/List;");
        assert_eq!(dex.intern_type("Ljava/util/List;"), list);
        assert_eq!(dex.find_type("Ljava/util/List;"), Some(list));

        let m1 = dex.intern_method("Ljava/util/Collections;", "emptyList", "Ljava/util/List;", &[]);
        let m2 = dex.intern_method("Ljava/util/Collections;", "emptyList", "Ljava/util/List;", &[]);
        assert_eq!(m1, m2);
        assert_eq!(dex.methods.len(), 1);
        assert_eq!(dex.protos.len(), 1);
        assert_eq!(dex.string(dex.protos[0].shorty), "L");
    }

    #[test]
    fn shorty_collapses_references() {
        let mut dex = DexFile::new();
        let proto = dex.intern_proto("Z", &["I", "[J", "Ljava/lang/String;"]);
        assert_eq!(dex.string(dex.protos[proto as usize].shorty), "ZILL");
    }

    #[test]
    fn records_walk_direct_then_virtual() {
        let mut dex = DexFile::new();
        let class_type = dex.intern_type("LFoo;");
        let init = dex.intern_method("LFoo;", "<init>", "V", &[]);
        let run = dex.intern_method("LFoo;", "run", "Z", &["I"]);
        dex.classes.push(ClassDef {
            class_type,
            access_flags: 0x1,
            superclass: None,
            interfaces: Vec::new(),
            source_file: None,
            annotations: None,
            class_data: Some(ClassData {
                direct_methods: vec![EncodedMethod {
                    method: init,
                    access_flags: 0x10001,
                    code: Some(CodeItem::default()),
                }],
                virtual_methods: vec![EncodedMethod {
                    method: run,
                    access_flags: 0x401,
                    code: None,
                }],
                ..Default::default()
            }),
            static_values: None,
        });

        let records: Vec<_> = dex.method_records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "<init>");
        assert_eq!(records[0].key.kind, MethodKind::Direct);
        assert_eq!(records[1].signature(), "LFoo;->run(I)Z");
        assert!(!records[1].has_body());
        assert_eq!(dex.record(records[1].key).unwrap().name, "run");
    }
}

#![allow(dead_code)]

use std::{
    fs,
    io::{Cursor, Write},
    path::PathBuf,
};

use paccer::dex::{
    self, ClassData, ClassDef, CodeItem, DebugInfo, DebugOp, DexFile, EncodedMethod,
};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

pub const WMS: &str = "Lcom/android/server/wm/WindowManagerService;";
pub const LOCK_SETTINGS: &str = "Lcom/android/internal/widget/ILockSettings;";

const ACC_PUBLIC: u32 = 0x1;
const ACC_ABSTRACT: u32 = 0x400;
const ACC_INTERFACE: u32 = 0x200;

fn body(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> Option<CodeItem> {
    Some(CodeItem {
        registers_size,
        ins_size,
        insns,
        ..Default::default()
    })
}

/// A framework-like image: an interface declaring `isSecureLocked` without a
/// body, then the service implementing it alongside a list-returning method.
pub fn framework_dex() -> DexFile {
    let mut dex = DexFile::new();

    let iface = dex.intern_type(LOCK_SETTINGS);
    let abstract_locked = dex.intern_method(LOCK_SETTINGS, "isSecureLocked", "Z", &[]);
    dex.classes.push(ClassDef {
        class_type: iface,
        access_flags: ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT,
        superclass: None,
        interfaces: Vec::new(),
        source_file: None,
        annotations: None,
        class_data: Some(ClassData {
            virtual_methods: vec![EncodedMethod {
                method: abstract_locked,
                access_flags: ACC_PUBLIC | ACC_ABSTRACT,
                code: None,
            }],
            ..Default::default()
        }),
        static_values: None,
    });

    let service = dex.intern_type(WMS);
    let object = dex.intern_type("Ljava/lang/Object;");
    let source = dex.intern_string("WindowManagerService.java");
    let locked = dex.intern_method(WMS, "isSecureLocked", "Z", &[]);
    let listeners = dex.intern_method(
        WMS,
        "notifyScreenshotListeners",
        "Ljava/util/List;",
        &["I"],
    );
    let display_id = dex.intern_string("displayId");
    let count = dex.intern_method(WMS, "getWindowCount", "I", &[]);

    let mut locked_body = body(2, 1, vec![0x1012, 0x000f]);
    if let Some(code) = locked_body.as_mut() {
        code.debug_info = Some(DebugInfo {
            line_start: 42,
            parameter_names: Vec::new(),
            ops: vec![DebugOp::SetPrologueEnd, DebugOp::Special(0x0e)],
        });
    }
    let mut listeners_body = body(3, 2, vec![0x0012, 0x0011]);
    if let Some(code) = listeners_body.as_mut() {
        code.debug_info = Some(DebugInfo {
            line_start: 100,
            parameter_names: vec![Some(display_id)],
            ops: Vec::new(),
        });
    }

    dex.classes.push(ClassDef {
        class_type: service,
        access_flags: ACC_PUBLIC,
        superclass: Some(object),
        interfaces: vec![iface],
        source_file: Some(source),
        annotations: None,
        class_data: Some(ClassData {
            // method_idx order, as class_data requires
            virtual_methods: vec![
                EncodedMethod {
                    method: count,
                    access_flags: ACC_PUBLIC,
                    code: body(2, 1, vec![0x3012, 0x000f]),
                },
                EncodedMethod {
                    method: locked,
                    access_flags: ACC_PUBLIC,
                    code: locked_body,
                },
                EncodedMethod {
                    method: listeners,
                    access_flags: ACC_PUBLIC,
                    code: listeners_body,
                },
            ],
            ..Default::default()
        }),
        static_values: None,
    });
    dex
}

pub fn framework_image() -> Vec<u8> {
    dex::encode(&framework_dex()).unwrap()
}

/// A jar with `classes.dex`, an untouched resource and a manifest
pub fn framework_jar(dex_compression: CompressionMethod) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
    writer
        .start_file(
            "classes.dex",
            SimpleFileOptions::default().compression_method(dex_compression),
        )
        .unwrap();
    writer.write_all(&framework_image()).unwrap();
    writer
        .start_file("res/values.txt", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"untouched").unwrap();
    writer.finish().unwrap().into_inner()
}

/// A second dex holding one class that `framework_dex` lacks
pub fn extra_image() -> Vec<u8> {
    let class = "Lcom/android/server/ExtraService;";
    let mut dex = DexFile::new();
    let class_type = dex.intern_type(class);
    let method = dex.intern_method(class, "isScreenCaptureDisabled", "Z", &["I"]);
    dex.classes.push(ClassDef {
        class_type,
        access_flags: ACC_PUBLIC,
        superclass: None,
        interfaces: Vec::new(),
        source_file: None,
        annotations: None,
        class_data: Some(ClassData {
            virtual_methods: vec![EncodedMethod {
                method,
                access_flags: ACC_PUBLIC,
                code: body(3, 2, vec![0x1012, 0x000f]),
            }],
            ..Default::default()
        }),
        static_values: None,
    });
    dex::encode(&dex).unwrap()
}

/// `classes.dex` from `framework_image`, `classes2.dex` from `extra_image`
pub fn multidex_jar() -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("classes.dex", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&framework_image()).unwrap();
    writer
        .start_file("classes2.dex", SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&extra_image()).unwrap();
    writer.finish().unwrap().into_inner()
}

/// A fresh scratch directory under the system temp dir
pub fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("paccer-{}-{}", test, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Resolves `method_idx` to `Lclass;->name` in `dex`
pub fn method_ref(dex: &DexFile, method_idx: u32) -> String {
    let id = &dex.methods[method_idx as usize];
    format!("{}->{}", dex.type_descriptor(id.class), dex.string(id.name))
}

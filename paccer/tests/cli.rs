mod common;

use std::{
    fs,
    path::Path,
    process::{Command, Output},
};

use paccer::dex::{self, CodeIr, Instruction};

use common::*;

fn paccer(args: &[&dyn AsRef<std::ffi::OsStr>]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_paccer"));
    for arg in args {
        command.arg(arg);
    }
    command.env_remove("RUST_LOG").output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn patched_body(path: &Path, method: &str) -> (dex::DexFile, CodeIr, u16) {
    let dex = dex::decode(&fs::read(path).unwrap()).unwrap();
    let (ir, registers) = {
        let record = dex
            .method_records()
            .find(|r| r.name == method && r.has_body())
            .unwrap();
        let code = record.code.unwrap();
        (CodeIr::decode(code).unwrap(), code.registers_size)
    };
    (dex, ir, registers)
}

#[test]
fn ret_false_replaces_body() {
    let dir = scratch_dir("ret-false");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[&input, &output, &"isSecureLocked:RET_FALSE;"]);
    assert!(run.status.success());
    assert!(stdout(&run).contains("Patched: isSecureLocked"));

    let (_, ir, registers) = patched_body(&output, "isSecureLocked");
    assert_eq!(
        ir.iter().cloned().collect::<Vec<_>>(),
        vec![
            Instruction::Const4 { dst: 0, value: 0 },
            Instruction::Return { src: 0 }
        ]
    );
    assert_eq!(registers, 2);
}

#[test]
fn ret_empty_list_calls_collections() {
    let dir = scratch_dir("ret-empty-list");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[&input, &output, &"notifyScreenshotListeners:RET_EMPTY_LIST;"]);
    assert!(run.status.success());
    assert!(stdout(&run).contains("Patched: notifyScreenshotListeners"));

    let (dex, ir, registers) = patched_body(&output, "notifyScreenshotListeners");
    let instructions: Vec<_> = ir.iter().cloned().collect();
    assert_eq!(instructions.len(), 3);
    match &instructions[0] {
        Instruction::InvokeStatic { method, args } => {
            assert!(args.is_empty());
            assert_eq!(
                method_ref(&dex, *method),
                "Ljava/util/Collections;->emptyList"
            );
        }
        other => panic!("expected invoke-static, got {other:?}"),
    }
    assert_eq!(instructions[1], Instruction::MoveResultObject { dst: 0 });
    assert_eq!(instructions[2], Instruction::ReturnObject { src: 0 });
    assert_eq!(registers, 3);
}

#[test]
fn field_form_reads_empty_list_constant() {
    let dir = scratch_dir("field-form");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[
        &input,
        &output,
        &"notifyScreenshotListeners:RET_EMPTY_LIST",
        &"--empty-list-form",
        &"field",
    ]);
    assert!(run.status.success());

    let (dex, ir, _) = patched_body(&output, "notifyScreenshotListeners");
    let instructions: Vec<_> = ir.iter().cloned().collect();
    let Instruction::SgetObject { dst: 0, field } = instructions[0] else {
        panic!("expected sget-object, got {:?}", instructions[0]);
    };
    assert_eq!(dex.string(dex.fields[field as usize].name), "EMPTY_LIST");
    assert_eq!(instructions[1], Instruction::ReturnObject { src: 0 });
}

#[test]
fn unknown_method_is_a_no_op() {
    let dir = scratch_dir("unknown-method");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[&input, &output, &"doesNotExist:RET_TRUE;"]);
    assert!(run.status.success());
    assert!(stdout(&run).contains("Method not found: doesNotExist(...)"));
    assert!(!output.exists());
}

#[test]
fn return_type_mismatch_is_not_found() {
    let dir = scratch_dir("type-mismatch");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[&input, &output, &"getWindowCount:RET_TRUE;"]);
    assert!(run.status.success());
    assert!(stdout(&run).contains("Method not found: getWindowCount(...)"));
    assert!(!output.exists());
}

#[test]
fn bad_behavior_fails_without_output() {
    let dir = scratch_dir("bad-behavior");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, framework_image()).unwrap();

    let run = paccer(&[&input, &output, &"foo:BOGUS;"]);
    assert_eq!(run.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&run.stderr).contains("BOGUS"));
    assert!(!output.exists());
}

#[test]
fn directory_input_fails() {
    let dir = scratch_dir("directory-input");
    let output = dir.join("out.dex");

    let run = paccer(&[&dir, &output, &"isSecureLocked:RET_FALSE;"]);
    assert_eq!(run.status.code(), Some(1));
    assert!(stdout(&run).is_empty());
    assert!(!output.exists());
}

#[test]
fn garbage_input_fails_to_decode() {
    let dir = scratch_dir("garbage-input");
    let input = dir.join("classes.dex");
    let output = dir.join("out.dex");
    fs::write(&input, b"definitely not a dex file").unwrap();

    let run = paccer(&[&input, &output, &"isSecureLocked:RET_FALSE;"]);
    assert_eq!(run.status.code(), Some(1));
    assert!(!output.exists());
}

#[test]
fn missing_arguments_fail_and_help_succeeds() {
    let run = paccer(&[&"only-one-arg"]);
    assert_eq!(run.status.code(), Some(1));

    let help = paccer(&[&"--help"]);
    assert!(help.status.success());
    assert!(stdout(&help).contains("--jar"));
}

#[test]
fn jar_table_applies_to_archive() {
    let dir = scratch_dir("jar-table");
    let input = dir.join("services.jar");
    let output = dir.join("services-patched.jar");
    fs::write(&input, framework_jar(zip::CompressionMethod::Deflated)).unwrap();

    let run = paccer(&[&input, &output, &"--jar", &"services.jar"]);
    assert!(run.status.success());
    let out = stdout(&run);
    assert!(out.contains("classes.dex: Patched: isSecureLocked"));
    assert!(out.contains("classes.dex: Patched: notifyScreenshotListeners"));
    assert!(out.contains("classes.dex: Method not found: isAllowAudioPlaybackCapture(...)"));

    let entries = paccer::archive::dex_entries(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    let dex = dex::decode(&entries[0].bytes).unwrap();
    let record = dex
        .method_records()
        .find(|r| r.name == "isSecureLocked" && r.has_body())
        .unwrap();
    assert_eq!(record.code.unwrap().insns, vec![0x0012, 0x000f]);
}

#[test]
fn multidex_outcomes_name_their_entry() {
    let dir = scratch_dir("multidex");
    let input = dir.join("services.jar");
    let output = dir.join("services-patched.jar");
    fs::write(&input, multidex_jar()).unwrap();

    let run = paccer(&[&input, &output, &"isScreenCaptureDisabled:RET_FALSE;isSecureLocked:RET_FALSE"]);
    assert!(run.status.success());
    let lines: Vec<String> = stdout(&run).lines().map(str::to_owned).collect();
    assert_eq!(
        lines,
        vec![
            "classes.dex: Method not found: isScreenCaptureDisabled(...)",
            "classes.dex: Patched: isSecureLocked",
            "classes2.dex: Patched: isScreenCaptureDisabled",
            "classes2.dex: Method not found: isSecureLocked(...)",
        ]
    );
    assert!(output.exists());
}

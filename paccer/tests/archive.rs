mod common;

use std::io::{Cursor, Read};

use paccer::{archive, dex, Behavior, PatchRequest, Patcher};
use zip::{CompressionMethod, ZipArchive};

use common::*;

fn entry_names(bytes: &[u8]) -> Vec<String> {
    let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
    archive.file_names().map(str::to_owned).collect::<Vec<_>>()
}

#[test]
fn patched_entry_is_replaced_and_the_rest_copied() {
    let jar = framework_jar(CompressionMethod::Deflated);
    let requests = [PatchRequest::new("isSecureLocked", Behavior::ReturnFalse)];
    let mut reported = Vec::new();
    let run = archive::patch_archive(&jar, &Patcher::default(), &requests, |entry, outcome| {
        reported.push(format!("{entry}: {outcome}"))
    })
    .unwrap();
    assert_eq!(reported, vec!["classes.dex: Patched: isSecureLocked"]);

    let output = run.output.unwrap();
    let mut names = entry_names(&output);
    names.sort();
    assert_eq!(
        names,
        vec!["META-INF/MANIFEST.MF", "classes.dex", "res/values.txt"]
    );

    let mut zip = ZipArchive::new(Cursor::new(output.as_slice())).unwrap();
    let mut untouched = String::new();
    zip.by_name("res/values.txt")
        .unwrap()
        .read_to_string(&mut untouched)
        .unwrap();
    assert_eq!(untouched, "untouched");

    let classes = zip.by_name("classes.dex").unwrap();
    assert_eq!(classes.compression(), CompressionMethod::Deflated);
    drop(classes);

    let entries = archive::dex_entries(&output).unwrap();
    let dex = dex::decode(&entries[0].bytes).unwrap();
    let record = dex
        .method_records()
        .find(|r| r.name == "isSecureLocked" && r.has_body())
        .unwrap();
    assert_eq!(record.code.unwrap().insns, vec![0x0012, 0x000f]);
}

#[test]
fn stored_entries_stay_stored() {
    let jar = framework_jar(CompressionMethod::Stored);
    let requests = [PatchRequest::new("isSecureLocked", Behavior::ReturnTrue)];
    let run = archive::patch_archive(&jar, &Patcher::default(), &requests, |_, _| {}).unwrap();

    let output = run.output.unwrap();
    let mut zip = ZipArchive::new(Cursor::new(output.as_slice())).unwrap();
    let classes = zip.by_name("classes.dex").unwrap();
    assert_eq!(classes.compression(), CompressionMethod::Stored);
}

#[test]
fn unmatched_archive_produces_nothing() {
    let jar = framework_jar(CompressionMethod::Deflated);
    let requests = [PatchRequest::new("nothingHere", Behavior::ReturnTrue)];
    let run = archive::patch_archive(&jar, &Patcher::default(), &requests, |_, _| {}).unwrap();
    assert!(run.output.is_none());
    assert_eq!(run.outcomes.len(), 1);
    assert_eq!(run.outcomes[0].0, "classes.dex");
}

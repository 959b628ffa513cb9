//! Patching of jar/apk archives that carry `classes*.dex` entries
//!
//! Patched entries are rewritten with their original compression method;
//! every other entry is copied raw.

use std::{
    collections::HashMap,
    io::{Cursor, Read, Write},
};

use thiserror::Error;
use tracing::{debug, info};
use zip::{result::ZipError, write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    patch::{PatchError, Patcher},
    types::{PatchOutcome, PatchRequest},
};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive error: {0}")]
    Zip(#[from] ZipError),
    #[error("archive i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("entry {name}: {source}")]
    Entry {
        name: String,
        #[source]
        source: PatchError,
    },
}

#[derive(Debug, Clone)]
pub struct ArchiveRun {
    pub output: Option<Vec<u8>>,
    /// Entry name and outcome, per dex entry and request
    pub outcomes: Vec<(String, PatchOutcome)>,
}

pub fn is_archive(input: &[u8]) -> bool {
    input.starts_with(ZIP_MAGIC)
}

/// `classes.dex`, `classes2.dex`, ... at the archive root
pub fn is_dex_entry(name: &str) -> bool {
    name.strip_prefix("classes")
        .and_then(|rest| rest.strip_suffix(".dex"))
        .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()))
}

/// One `classes*.dex` entry, decompressed
#[derive(Debug, Clone)]
pub struct DexEntry {
    pub name: String,
    pub bytes: Vec<u8>,
    pub compression: CompressionMethod,
}

/// Reads every dex entry of the archive, in archive order
pub fn dex_entries(input: &[u8]) -> Result<Vec<DexEntry>, ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(input))?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if !is_dex_entry(file.name()) {
            continue;
        }
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        entries.push(DexEntry {
            name: file.name().to_owned(),
            bytes,
            compression: file.compression(),
        });
    }
    Ok(entries)
}

pub fn patch_archive(
    input: &[u8],
    patcher: &Patcher,
    requests: &[PatchRequest],
    mut report: impl FnMut(&str, &PatchOutcome),
) -> Result<ArchiveRun, ArchiveError> {
    let mut patched: HashMap<String, (Vec<u8>, CompressionMethod)> = HashMap::new();
    let mut outcomes = Vec::new();

    for entry in dex_entries(input)? {
        let name = entry.name;
        debug!("patching {}", name);
        let run = patcher
            .run(&entry.bytes, requests, |outcome| report(&name, outcome))
            .map_err(|source| ArchiveError::Entry {
                name: name.clone(),
                source,
            })?;
        outcomes.extend(run.outcomes.into_iter().map(|o| (name.clone(), o)));
        if let Some(output) = run.output {
            patched.insert(name, (output, entry.compression));
        }
    }

    if patched.is_empty() {
        return Ok(ArchiveRun {
            output: None,
            outcomes,
        });
    }

    let mut archive = ZipArchive::new(Cursor::new(input))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i)?;
        match patched.remove(file.name()) {
            Some((bytes, compression)) => {
                let method = match compression {
                    CompressionMethod::Stored => CompressionMethod::Stored,
                    _ => CompressionMethod::Deflated,
                };
                let options = SimpleFileOptions::default().compression_method(method);
                writer.start_file(file.name(), options)?;
                writer.write_all(&bytes)?;
            }
            None => writer.raw_copy_file(file)?,
        }
    }
    let output = writer.finish()?.into_inner();
    info!("rewrote archive, {} bytes", output.len());

    Ok(ArchiveRun {
        output: Some(output),
        outcomes,
    })
}

//! The patch command behind the `paccer` binary

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use thiserror::Error;
use tracing::info;

use crate::{
    archive::{self, ArchiveError},
    config::{ConfigError, PatchTables},
    patch::{spec, PatchError, PatchOptions, Patcher, SpecError},
    types::{EmptyListForm, PatchOutcome, PatchRequest},
};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0} is not a regular file")]
    InputNotRegularFile(String),
    #[error("cannot read {path}: {source}")]
    InputUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed patch spec: {0}")]
    MalformedSpec(#[from] SpecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("cannot write {path}: {source}")]
    OutputUnwritable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(EXIT_FAILURE)
    }
}

/// Everything the patch command needs, independent of how it was parsed
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub input: PathBuf,
    pub output: PathBuf,
    pub spec: Option<String>,
    pub jar: Option<String>,
    pub tables: Option<PathBuf>,
    pub empty_list_form: EmptyListForm,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub requests: usize,
    pub patched: usize,
    pub written: bool,
}

/// Spec entries first, then the jar table's requests
pub fn collect_requests(invocation: &Invocation) -> Result<Vec<PatchRequest>, CliError> {
    if invocation.spec.is_none() && invocation.jar.is_none() {
        return Err(CliError::InvalidArguments(
            "a patch spec or --jar is required".into(),
        ));
    }
    if invocation.tables.is_some() && invocation.jar.is_none() {
        return Err(CliError::InvalidArguments(
            "--tables needs --jar to pick a table".into(),
        ));
    }

    let mut requests = match &invocation.spec {
        Some(text) => spec::parse(text)?,
        None => Vec::new(),
    };
    if let Some(jar) = &invocation.jar {
        let tables = match &invocation.tables {
            Some(path) => PatchTables::from_path(path)?,
            None => PatchTables::defaults(),
        };
        requests.extend_from_slice(tables.for_jar(jar)?);
    }
    Ok(requests)
}

fn read_input(path: &Path) -> Result<Vec<u8>, CliError> {
    let unreadable = |source| CliError::InputUnreadable {
        path: path.display().to_string(),
        source,
    };
    let metadata = fs::metadata(path).map_err(unreadable)?;
    if !metadata.is_file() {
        return Err(CliError::InputNotRegularFile(path.display().to_string()));
    }
    fs::read(path).map_err(unreadable)
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    let unwritable = |source| CliError::OutputUnwritable {
        path: path.display().to_string(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(unwritable)?;
    file.write_all(bytes).map_err(unwritable)?;
    file.sync_all().map_err(unwritable)
}

/// Runs the patch command. `report` is called once per request outcome, and
/// once per request and dex entry for archives, with the entry name. The
/// output file is only created when something was patched.
pub fn execute(
    invocation: &Invocation,
    mut report: impl FnMut(Option<&str>, &PatchOutcome),
) -> Result<Summary, CliError> {
    let requests = collect_requests(invocation)?;
    let input = read_input(&invocation.input)?;
    let patcher = Patcher::new(PatchOptions {
        empty_list_form: invocation.empty_list_form,
    });

    let (output, outcomes) = if archive::is_archive(&input) {
        let run = archive::patch_archive(&input, &patcher, &requests, |entry, outcome| {
            info!("{}: {}", entry, outcome);
            report(Some(entry), outcome)
        })?;
        let outcomes: Vec<_> = run.outcomes.into_iter().map(|(_, o)| o).collect();
        (run.output, outcomes)
    } else {
        let run = patcher.run(&input, &requests, |outcome| report(None, outcome))?;
        (run.output, run.outcomes)
    };

    let summary = Summary {
        requests: requests.len(),
        patched: outcomes.iter().filter(|o| o.is_patched()).count(),
        written: output.is_some(),
    };
    if let Some(bytes) = output {
        write_output(&invocation.output, &bytes)?;
        info!("wrote {}", invocation.output.display());
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Behavior;

    fn invocation(spec: Option<&str>, jar: Option<&str>) -> Invocation {
        Invocation {
            spec: spec.map(str::to_owned),
            jar: jar.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn spec_requests_come_before_table_requests() {
        let requests =
            collect_requests(&invocation(Some("foo:RET_TRUE"), Some("semwifi-service.jar"))).unwrap();
        assert_eq!(
            requests,
            vec![
                PatchRequest::new("foo", Behavior::ReturnTrue),
                PatchRequest::new("isSecureLocked", Behavior::ReturnFalse),
            ]
        );
    }

    #[test]
    fn request_source_is_required() {
        assert!(matches!(
            collect_requests(&invocation(None, None)),
            Err(CliError::InvalidArguments(_))
        ));
        assert!(matches!(
            collect_requests(&invocation(None, Some("unknown.jar"))),
            Err(CliError::Config(ConfigError::UnknownJar(_)))
        ));
    }

    #[test]
    fn spec_is_checked_before_input() {
        let inv = Invocation {
            input: PathBuf::from("/nonexistent/classes.dex"),
            ..invocation(Some("foo:BOGUS"), None)
        };
        assert!(matches!(
            execute(&inv, |_, _| {}),
            Err(CliError::MalformedSpec(_))
        ));
    }

    #[test]
    fn directory_input_is_rejected() {
        let inv = Invocation {
            input: std::env::temp_dir(),
            ..invocation(Some("foo:RET_TRUE"), None)
        };
        assert!(matches!(
            execute(&inv, |_, _| {}),
            Err(CliError::InputNotRegularFile(_))
        ));
    }
}

//! The compact patch-spec mini-language
//!
//! ```text
//! isSecureLocked:RET_FALSE; notifyScreenshotListeners:RET_EMPTY_LIST;
//! ```
//!
//! Entries are `methodName:BEHAVIOR` separated by `;`. Whitespace around
//! tokens is ignored, as are empty entries. A single malformed entry fails
//! the whole spec.

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::types::{Behavior, PatchRequest};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("entry {position} ({entry:?}) has no ':' between method name and behavior")]
    MissingSeparator { position: usize, entry: String },
    #[error("entry {position} ({entry:?}) has an empty method name")]
    MissingMethodName { position: usize, entry: String },
    #[error(
        "entry {position} ({entry:?}) has unknown behavior {behavior:?}, \
         expected RET_EMPTY_LIST, RET_FALSE or RET_TRUE"
    )]
    UnknownBehavior {
        position: usize,
        entry: String,
        behavior: String,
    },
}

/// Parses a patch spec into requests, in the order written.
///
/// Positions in errors count non-empty entries from 1.
pub fn parse(spec: &str) -> Result<Vec<PatchRequest>, SpecError> {
    let requests = spec
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| parse_entry(i + 1, entry))
        .collect::<Result<Vec<_>, _>>()?;
    debug!("parsed {} patch requests", requests.len());
    Ok(requests)
}

fn parse_entry(position: usize, entry: &str) -> Result<PatchRequest, SpecError> {
    let Some((name, behavior)) = entry.split_once(':') else {
        return Err(SpecError::MissingSeparator {
            position,
            entry: entry.to_owned(),
        });
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(SpecError::MissingMethodName {
            position,
            entry: entry.to_owned(),
        });
    }
    let behavior = behavior.trim();
    let behavior = Behavior::from_str(behavior).map_err(|_| SpecError::UnknownBehavior {
        position,
        entry: entry.to_owned(),
        behavior: behavior.to_owned(),
    })?;
    Ok(PatchRequest::new(name, behavior))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_parse_in_order() {
        let requests =
            parse(" isSecureLocked : RET_FALSE ;notifyScreenshotListeners:RET_EMPTY_LIST;").unwrap();
        assert_eq!(
            requests,
            vec![
                PatchRequest::new("isSecureLocked", Behavior::ReturnFalse),
                PatchRequest::new("notifyScreenshotListeners", Behavior::ReturnEmptyList),
            ]
        );
    }

    #[test]
    fn empty_segments_are_skipped() {
        assert_eq!(parse("").unwrap(), vec![]);
        assert_eq!(parse("  ;; ").unwrap(), vec![]);
        assert_eq!(
            parse(";;a:RET_TRUE;;").unwrap(),
            vec![PatchRequest::new("a", Behavior::ReturnTrue)]
        );
    }

    #[test]
    fn one_bad_entry_fails_everything() {
        assert_eq!(
            parse("isSecureLocked:RET_FALSE;foo:BOGUS;"),
            Err(SpecError::UnknownBehavior {
                position: 2,
                entry: "foo:BOGUS".into(),
                behavior: "BOGUS".into(),
            })
        );
        assert!(matches!(
            parse("foo"),
            Err(SpecError::MissingSeparator { position: 1, .. })
        ));
        assert!(matches!(
            parse(":RET_TRUE"),
            Err(SpecError::MissingMethodName { position: 1, .. })
        ));
    }

    #[test]
    fn behavior_tokens_are_case_sensitive() {
        assert!(matches!(
            parse("foo:ret_true"),
            Err(SpecError::UnknownBehavior { .. })
        ));
    }
}

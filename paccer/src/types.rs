use std::fmt;

use serde::{Deserialize, Serialize};

pub const LIST_DESCRIPTOR: &str = "Ljava/util/List;";
pub const BOOLEAN_DESCRIPTOR: &str = "Z";

/// Canned replacement semantics for a method body
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum_macros::EnumIter,
    strum_macros::EnumString,
    strum_macros::Display,
)]
pub enum Behavior {
    #[serde(rename = "RET_EMPTY_LIST")]
    #[strum(serialize = "RET_EMPTY_LIST")]
    ReturnEmptyList,
    #[serde(rename = "RET_FALSE")]
    #[strum(serialize = "RET_FALSE")]
    ReturnFalse,
    #[serde(rename = "RET_TRUE")]
    #[strum(serialize = "RET_TRUE")]
    ReturnTrue,
}

impl Behavior {
    /// The only return descriptor a method may have for this behavior to apply
    pub fn required_return_type(self) -> &'static str {
        match self {
            Behavior::ReturnEmptyList => LIST_DESCRIPTOR,
            Behavior::ReturnFalse | Behavior::ReturnTrue => BOOLEAN_DESCRIPTOR,
        }
    }
}

/// How `RET_EMPTY_LIST` obtains its list
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum_macros::EnumIter,
    strum_macros::EnumString,
    strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EmptyListForm {
    /// `Collections.emptyList()`
    #[default]
    Invoke,
    /// `Collections.EMPTY_LIST`
    Field,
}

/// One method to patch and what to put in it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatchRequest {
    pub method_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declaring_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_types: Option<Vec<String>>,
    pub behavior: Behavior,
}

impl PatchRequest {
    pub fn new(method_name: impl Into<String>, behavior: Behavior) -> Self {
        PatchRequest {
            method_name: method_name.into(),
            declaring_type: None,
            parameter_types: None,
            behavior,
        }
    }

    pub fn with_declaring_type(mut self, descriptor: impl Into<String>) -> Self {
        self.declaring_type = Some(descriptor.into());
        self
    }

    pub fn with_parameter_types<I, S>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameter_types = Some(descriptors.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStatus {
    /// Carries the signature of the rewritten method
    Patched(String),
    NotFound,
    AssemblyFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub method_name: String,
    pub status: PatchStatus,
}

impl PatchOutcome {
    pub fn is_patched(&self) -> bool {
        matches!(self.status, PatchStatus::Patched(_))
    }
}

/// The line printed for each request
impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            PatchStatus::Patched(_) => write!(f, "Patched: {}", self.method_name),
            PatchStatus::NotFound => write!(f, "Method not found: {}(...)", self.method_name),
            PatchStatus::AssemblyFailed(reason) => {
                write!(f, "Patch failed: {}: {}", self.method_name, reason)
            }
        }
    }
}

pub fn any_patched<'a>(outcomes: impl IntoIterator<Item = &'a PatchOutcome>) -> bool {
    outcomes.into_iter().any(PatchOutcome::is_patched)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator as _;

    use super::*;

    #[test]
    fn behavior_names_match_both_encodings() {
        for behavior in Behavior::iter() {
            let text = behavior.to_string();
            assert_eq!(Behavior::from_str(&text).unwrap(), behavior);
            let json = serde_json::to_string(&behavior).unwrap();
            assert_eq!(json, format!("\"{text}\""));
        }
        assert!(Behavior::from_str("ret_false").is_err());
    }

    #[test]
    fn request_json_omits_absent_qualifiers() {
        let plain = PatchRequest::new("isSecureLocked", Behavior::ReturnFalse);
        assert_eq!(
            serde_json::to_string(&plain).unwrap(),
            r#"{"method_name":"isSecureLocked","behavior":"RET_FALSE"}"#
        );

        let qualified: PatchRequest = serde_json::from_str(
            r#"{"method_name":"notifyScreenshotListeners","parameter_types":["I"],"behavior":"RET_EMPTY_LIST"}"#,
        )
        .unwrap();
        assert_eq!(
            qualified,
            PatchRequest::new("notifyScreenshotListeners", Behavior::ReturnEmptyList)
                .with_parameter_types(["I"])
        );
    }

    #[test]
    fn outcome_lines() {
        let outcome = |status| PatchOutcome {
            method_name: "isSecureLocked".into(),
            status,
        };
        assert_eq!(
            outcome(PatchStatus::Patched("LFoo;->isSecureLocked()Z".into())).to_string(),
            "Patched: isSecureLocked"
        );
        assert_eq!(
            outcome(PatchStatus::NotFound).to_string(),
            "Method not found: isSecureLocked(...)"
        );
        assert_eq!(
            outcome(PatchStatus::AssemblyFailed("boom".into())).to_string(),
            "Patch failed: isSecureLocked: boom"
        );
    }

    #[test]
    fn empty_list_form_parses_kebab_case() {
        assert_eq!(EmptyListForm::from_str("field").unwrap(), EmptyListForm::Field);
        assert_eq!(EmptyListForm::default().to_string(), "invoke");
    }
}

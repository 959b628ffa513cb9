//! Patch tables: named request lists for specific framework jars

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{Behavior, PatchRequest};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read patch tables from {path}: {source}")]
    TablesUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed patch tables: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no patch table for jar {0:?}")]
    UnknownJar(String),
    #[error("patch table {jar:?} has an entry without a method name")]
    EmptyMethodName { jar: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatchTable {
    pub jar_name: String,
    pub methods: Vec<PatchRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct PatchTables {
    pub tables: Vec<PatchTable>,
}

impl PatchTables {
    /// Tables for the stock framework jars
    pub fn defaults() -> Self {
        let services = PatchTable {
            jar_name: "services.jar".into(),
            methods: vec![
                PatchRequest::new("isSecureLocked", Behavior::ReturnFalse),
                PatchRequest::new("notifyScreenshotListeners", Behavior::ReturnEmptyList)
                    .with_parameter_types(["I"]),
                PatchRequest::new("isAllowAudioPlaybackCapture", Behavior::ReturnTrue),
            ],
        };
        let semwifi = PatchTable {
            jar_name: "semwifi-service.jar".into(),
            methods: vec![PatchRequest::new("isSecureLocked", Behavior::ReturnFalse)],
        };
        let miui = PatchTable {
            jar_name: "miui-services.jar".into(),
            methods: vec![PatchRequest::new(
                "notAllowCaptureDisplay",
                Behavior::ReturnFalse,
            )],
        };
        PatchTables {
            tables: vec![services, semwifi, miui],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let tables: Self = serde_json::from_str(json)?;
        tables.validate()?;
        Ok(tables)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for table in &self.tables {
            if table.methods.iter().any(|m| m.method_name.trim().is_empty()) {
                return Err(ConfigError::EmptyMethodName {
                    jar: table.jar_name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::TablesUnreadable {
            path: path.display().to_string(),
            source,
        })?;
        let tables = Self::from_json(&json)?;
        debug!("loaded {} patch tables from {}", tables.tables.len(), path.display());
        Ok(tables)
    }

    /// Requests of the table for `jar_name`, which may be given as a path
    pub fn for_jar(&self, jar_name: &str) -> Result<&[PatchRequest], ConfigError> {
        let file_name = Path::new(jar_name)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(jar_name);
        self.tables
            .iter()
            .find(|table| table.jar_name == file_name)
            .map(|table| table.methods.as_slice())
            .ok_or_else(|| ConfigError::UnknownJar(jar_name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_stock_jars() {
        let tables = PatchTables::defaults();
        let services = tables.for_jar("services.jar").unwrap();
        assert_eq!(services.len(), 3);
        assert_eq!(services[1].behavior, Behavior::ReturnEmptyList);
        assert_eq!(services[1].parameter_types.as_deref(), Some(&["I".to_string()][..]));

        let by_path = tables.for_jar("/system/framework/miui-services.jar").unwrap();
        assert_eq!(by_path[0].method_name, "notAllowCaptureDisplay");

        assert!(matches!(
            tables.for_jar("framework.jar"),
            Err(ConfigError::UnknownJar(name)) if name == "framework.jar"
        ));
    }

    #[test]
    fn tables_round_trip_through_json() {
        let tables = PatchTables::defaults();
        let json = serde_json::to_string_pretty(&tables).unwrap();
        assert!(json.contains("\"RET_EMPTY_LIST\""));
        assert_eq!(PatchTables::from_json(&json).unwrap(), tables);
    }

    #[test]
    fn bad_tables_are_rejected() {
        assert!(matches!(
            PatchTables::from_json(r#"{"tables":[{"jar_name":"a.jar","methods":[{"method_name":"x","behavior":"RET_MAYBE"}]}]}"#),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            PatchTables::from_json(r#"{"tables":[{"jar_name":"a.jar","methods":[{"method_name":" ","behavior":"RET_TRUE"}]}]}"#),
            Err(ConfigError::EmptyMethodName { jar }) if jar == "a.jar"
        ));
        assert!(matches!(
            PatchTables::from_path("/nonexistent/tables.json"),
            Err(ConfigError::TablesUnreadable { .. })
        ));
    }
}

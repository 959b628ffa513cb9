pub mod archive;
pub mod cli;
pub mod config;
pub mod dex;
pub mod patch;
pub mod types;

pub use cli::{execute, CliError, Invocation, Summary};
pub use config::{ConfigError, PatchTable, PatchTables};
pub use patch::{PatchOptions, PatchRun, Patcher};
pub use types::{Behavior, EmptyListForm, PatchOutcome, PatchRequest, PatchStatus};

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use paccer::{
    cli::{self, CliError, Invocation},
    EmptyListForm,
};

/// Rewrites selected DEX method bodies to canned constant returns
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input .dex, .jar or .apk
    input: PathBuf,

    /// Where the patched container is written
    output: PathBuf,

    /// Patch spec, e.g. "isSecureLocked:RET_FALSE;"
    spec: Option<String>,

    /// Append the patch table for this framework jar
    #[arg(long)]
    jar: Option<String>,

    /// JSON patch tables replacing the built-in ones
    #[arg(long, requires = "jar")]
    tables: Option<PathBuf>,

    /// How RET_EMPTY_LIST obtains its list
    #[arg(long, default_value_t = EmptyListForm::Invoke)]
    empty_list_form: EmptyListForm,

    /// Log more (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    let invocation = Invocation {
        input: args.input,
        output: args.output,
        spec: args.spec,
        jar: args.jar,
        tables: args.tables,
        empty_list_form: args.empty_list_form,
    };
    let summary = cli::execute(&invocation, |entry, outcome| match entry {
        Some(entry) => println!("{entry}: {outcome}"),
        None => println!("{outcome}"),
    })?;
    tracing::info!(
        "{} of {} requests patched",
        summary.patched,
        summary.requests
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(cli::EXIT_FAILURE)
            } else {
                ExitCode::from(cli::EXIT_SUCCESS)
            };
        }
    };
    init_logging(args.verbose);

    match run(args) {
        Ok(()) => ExitCode::from(cli::EXIT_SUCCESS),
        Err(err) => {
            eprintln!("Error: {err:#}");
            match err.downcast_ref::<CliError>() {
                Some(cli_err) => cli_err.exit_code(),
                None => ExitCode::from(cli::EXIT_FAILURE),
            }
        }
    }
}

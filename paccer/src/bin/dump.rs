use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use strum::IntoEnumIterator as _;

use paccer::{
    archive,
    dex::{self, DexFile, MethodRecord},
    Behavior,
};

/// Lists the methods of a DEX container and which behaviors fit them
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input .dex, .jar or .apk
    input: PathBuf,

    /// Also list methods no behavior applies to
    #[arg(long)]
    all: bool,
}

fn fitting_behaviors(record: &MethodRecord) -> Vec<Behavior> {
    if !record.has_body() {
        return Vec::new();
    }
    Behavior::iter()
        .filter(|behavior| behavior.required_return_type() == record.return_type)
        .collect()
}

fn dump(dex: &DexFile, all: bool) {
    let mut listed = 0;
    for record in dex.method_records() {
        let behaviors = fitting_behaviors(&record);
        if behaviors.is_empty() && !all {
            continue;
        }
        listed += 1;

        let frame = match record.code {
            Some(code) => format!(
                "regs={} ins={} units={}",
                code.registers_size,
                code.ins_size,
                code.insns.len()
            ),
            None => "no body".to_string(),
        };
        let names = behaviors
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{} {} {} {}",
            format!("{:#06x}", record.access_flags).dimmed(),
            record.signature().cyan(),
            frame.dimmed(),
            names.green()
        );
    }
    println!(
        "{}",
        format!("{} of {} methods", listed, dex.method_records().count()).bold()
    );
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let input = fs::read(&args.input)
        .with_context(|| format!("cannot read {}", args.input.display()))?;

    if archive::is_archive(&input) {
        for entry in archive::dex_entries(&input)? {
            println!("{}", entry.name.yellow().bold());
            let dex = dex::decode(&entry.bytes).with_context(|| entry.name.clone())?;
            dump(&dex, args.all);
        }
    } else {
        let dex = dex::decode(&input)?;
        dump(&dex, args.all);
    }
    Ok(())
}

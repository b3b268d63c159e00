mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patchkit")]
#[command(about = "Offline checker for runtime patch tables")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find a byte pattern in a module image
    Scan {
        /// Module image file
        image: PathBuf,

        /// Pattern such as "48 8D 0D ?? ?? ?? ??"
        pattern: String,

        /// Explicit bitwise mask, same length as the pattern
        #[arg(short, long)]
        mask: Option<String>,

        /// Print every non-overlapping match instead of the first
        #[arg(short, long)]
        all: bool,

        /// Load address used when printing absolute addresses
        #[arg(short, long, default_value = "0")]
        base: String,
    },

    /// Run a patch table against a copy of a module image
    Check {
        /// Module image file
        image: PathBuf,

        /// JSON patch table
        table: PathBuf,

        /// Load address of the image
        #[arg(short, long, default_value = "0")]
        base: String,

        /// JSON object of symbol name -> hex address
        #[arg(short, long)]
        symbols: Option<PathBuf>,

        /// Write the patched image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let directive = if args.verbose {
        "patchkit=debug"
    } else {
        "patchkit=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Scan {
            image,
            pattern,
            mask,
            all,
            base,
        } => commands::scan::run(&image, &pattern, mask.as_deref(), all, &base),
        Command::Check {
            image,
            table,
            base,
            symbols,
            output,
        } => commands::check::run(
            &image,
            &table,
            &base,
            symbols.as_deref(),
            output.as_deref(),
        ),
    }
}

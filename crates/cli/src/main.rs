//! orchbench report viewer
//!
//! Renders suite reports written by `orchbench` and compares results from
//! several platforms side by side.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{compare, show};
use std::path::PathBuf;

/// orchbench report viewer
#[derive(Parser)]
#[command(name = "obr")]
#[command(author, version, about = "Report viewer for orchbench results", long_about = None)]
pub struct Cli {
    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the results of one report
    Show {
        /// Report JSON file
        report: PathBuf,
    },

    /// Compare several reports side by side
    Compare {
        /// Report JSON files, typically one per platform
        #[arg(required = true, num_args = 1..)]
        reports: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Show { report } => show::show_report(&report, cli.format)?,
        Commands::Compare { reports } => compare::compare_reports(&reports, cli.format)?,
    }

    Ok(())
}

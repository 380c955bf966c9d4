//! Command line front end for aurora-packer

use anyhow::{Context, Result};
use aurora_packer::{PackConfig, Packer, PackerKind};
use clap::Parser;
use std::path::PathBuf;

/// Pack protected scripts into one bundle with py2exe, py2app, cx_Freeze
/// or PyInstaller.
#[derive(Parser)]
#[command(name = "aurora-pack")]
#[command(version)]
struct Cli {
    /// Packer: py2exe, py2app, cx_Freeze, PyInstaller
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    kind: Option<PackerKind>,

    /// Setup script (default: setup.py beside the entry script)
    #[arg(short, long)]
    setup: Option<PathBuf>,

    /// Directory to put the final bundle in
    #[arg(short = 'O', long)]
    output: Option<PathBuf>,

    /// Python interpreter running setup scripts and PyInstaller
    #[arg(long)]
    python: Option<String>,

    /// Protector command line, e.g. "pyarmor"
    #[arg(long, num_args = 1.., value_delimiter = ' ')]
    protector: Option<Vec<String>>,

    /// Directory for intermediate protected projects
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep intermediate projects
    #[arg(long)]
    keep_temp: bool,

    /// JSON config file, command line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Entry script
    #[arg(value_name = "SCRIPT")]
    entry: Option<PathBuf>,

    /// Extra options for the pack command, after `--`
    #[arg(last = true)]
    options: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<PackConfig> {
        let mut config = match &self.config {
            Some(path) => PackConfig::from_json_file(path)?,
            None => {
                let entry = self.entry.clone().context("missing entry script")?;
                PackConfig::new(entry)
            }
        };

        if let Some(entry) = self.entry {
            config.entry = entry;
        }
        if let Some(kind) = self.kind {
            config.kind = kind;
        }
        if let Some(setup) = self.setup {
            config.setup = Some(setup);
        }
        if let Some(output) = self.output {
            config.output = Some(output);
        }
        if let Some(python) = self.python {
            config.python_path = Some(python);
        }
        if let Some(protector) = self.protector {
            config.protector = protector;
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = Some(work_dir);
        }
        config.keep_temp |= self.keep_temp;
        config.options.extend(self.options);
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_config()?;
    let report = Packer::new(config).pack()?;
    println!("{}", report.output.display());
    Ok(())
}

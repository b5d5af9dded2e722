//! Configuration module.
//!
//! This module defines the command-line interfaces of the packer and the loader using
//! `clap`, and the plain option values the pipeline components are constructed with.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::error::Error;

pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;
pub const DEFAULT_KEY: u64 = 0x5a17_c0de_9e37_79b9;
pub const DEFAULT_OUTPUT: &str = "packed";

/// Parses a `u64` given in decimal or as `0x`-prefixed hex.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

/// A protector for static x86_64 ELF executables.
///
/// Encrypts the first executable segment, appends a decoding stub in place of the
/// PT_NOTE segment and points the entry at the stub.
#[derive(Parser, Debug)]
#[command(name = "elfpack", author, version, about, long_about = None)]
pub struct PackArgs {
    /// Input ELF64 executable
    pub input: PathBuf,

    /// Output file
    #[arg(short, long, default_value = DEFAULT_OUTPUT, help = "Path to the packed executable")]
    pub output: PathBuf,

    /// XOR key, decimal or 0x-prefixed hex
    #[arg(short, long, default_value = "0x5a17c0de9e3779b9", value_parser = parse_u64)]
    pub key: u64,

    /// Page size of the target platform
    #[arg(long, default_value = "4096", value_parser = parse_u64)]
    pub page_size: u64,

    /// Raw machine-code stub to use instead of the built-in decoder
    #[arg(long)]
    pub stub: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", help = "Set the logging level")]
    pub log_level: String,
}

impl PackArgs {
    pub fn options(&self) -> PackOptions {
        PackOptions { page_size: self.page_size, key: self.key, output: self.output.clone() }
    }
}

/// A minimal loader that maps a static ELF64 executable and jumps to its entry point.
#[derive(Parser, Debug)]
#[command(name = "elfload", author, version, about, long_about = None)]
pub struct LoadArgs {
    /// ELF64 executable to run
    pub input: PathBuf,

    /// Log and continue when the final mprotect of a segment fails
    #[arg(long)]
    pub lenient_protect: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", help = "Set the logging level")]
    pub log_level: String,
}

impl LoadArgs {
    pub fn options(&self) -> LoadOptions {
        LoadOptions { strict_protect: !self.lenient_protect }
    }
}

/// Options for one pack operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOptions {
    pub page_size: u64,
    pub key: u64,
    pub output: PathBuf,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, key: DEFAULT_KEY, output: PathBuf::from(DEFAULT_OUTPUT) }
    }
}

/// Options for the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Treat a failed final `mprotect` as fatal.
    pub strict_protect: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { strict_protect: true }
    }
}

/// Parses the command line, printing help or a usage error.
///
/// On failure the returned exit code is what the process should exit with.
pub fn parse_args<T: Parser>() -> Result<T, ExitCode> {
    T::try_parse().map_err(|e| {
        let _ = e.print();
        if e.use_stderr() {
            ExitCode::from(Error::Usage(e.kind().to_string()).exit_code())
        } else {
            ExitCode::SUCCESS
        }
    })
}

/// Installs the stderr `tracing` subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

//! Entry point for the elfload loader.
//!
//! 1. Parse command-line arguments using `clap`.
//! 2. Read the image and validate its header.
//! 3. Map every `PT_LOAD` segment.
//! 4. Jump to the entry point. Control does not come back on success.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::process::ExitCode;

use elfpack::config::{self, LoadArgs};
use elfpack::error::exit_code_of;
use elfpack::image::{open_file, read_file, ExecutableImage};
use elfpack::loader::{self, LoadPlan};

fn main() -> ExitCode {
    let args: LoadArgs = match config::parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };
    config::init_logging(&args.log_level);

    match run(&args) {
        Ok(entry) => {
            // Safety: `entry` lies in the image just mapped by `run`.
            unsafe { loader::dispatch(entry) }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_of(&err))
        }
    }
}

/// Maps the image and returns its entry address.
fn run(args: &LoadArgs) -> Result<u64> {
    let path = &args.input;
    let file = open_file(path)?;

    let data = read_file(&file, path)?;
    loader::validate_header(&data)?;
    let image = ExecutableImage::parse(data)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let plan = LoadPlan::compute(&image, loader::page_size())?;
    let loaded = loader::map_image(&file, &image, &plan, &args.options())
        .with_context(|| format!("failed to load {}", path.display()))?;
    drop(file);

    println!("Loaded image at base=0x{:x} entry=0x{:x}", loaded.base, loaded.entry);
    println!("jumping to entry point... (control may not return)");
    io::stdout().flush().context("failed to flush stdout")?;
    Ok(loaded.entry)
}

//! Entry point for the elfpack packer.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Read and parse the input image.
//! 3. Pack it with the `X86_64` backend (the only supported architecture).
//! 4. Write the packed executable.
//!
//! Error handling is done via `anyhow`; the exit status comes from the underlying
//! `elfpack::Error`.

use anyhow::{Context, Result};
use std::process::ExitCode;

use elfpack::arch::x86_64::X86_64;
use elfpack::config::{self, PackArgs};
use elfpack::error::exit_code_of;
use elfpack::image::{read_image, ExecutableImage};
use elfpack::packer::Packer;
use elfpack::stub::StubBlob;
use elfpack::writer;

fn main() -> ExitCode {
    let args: PackArgs = match config::parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };
    config::init_logging(&args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_of(&err))
        }
    }
}

fn run(args: &PackArgs) -> Result<()> {
    let options = args.options();

    let data = read_image(&args.input)
        .with_context(|| format!("failed to load {}", args.input.display()))?;
    let image = ExecutableImage::parse(data)
        .with_context(|| format!("failed to parse {}", args.input.display()))?;

    let mut packer = Packer::new(X86_64, options.clone());
    if let Some(path) = &args.stub {
        packer = packer.with_stub(StubBlob::load(path).context("failed to load stub")?);
    }

    let packed = packer.pack(image).context("failed to pack")?;
    writer::write_packed_file(&options.output, &packed)?;

    println!("Packed {} -> {}", args.input.display(), options.output.display());
    Ok(())
}

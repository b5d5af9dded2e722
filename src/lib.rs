//! Minimal ELF64 packer and loader library.
//!
//! This library provides the core components for the `elfpack` and `elfload` binaries.
//! It is organized into several modules:
//! - `config`: CLI configuration and component options.
//! - `error`: The error taxonomy and exit codes.
//! - `image`: Reading and parsing ELF64 images.
//! - `arch`: Architecture-specific backend (decoder stub).
//! - `plan`: Placement of the stub.
//! - `encrypt`: XOR encryption of the code segment.
//! - `stub`: Stub templates and patching.
//! - `packer`: The packing orchestration and header rewriting.
//! - `writer`: Output serialization.
//! - `loader`: Mapping an image into the current process.

pub mod arch;
pub mod config;
pub mod encrypt;
pub mod error;
pub mod image;
pub mod loader;
pub mod packer;
pub mod plan;
pub mod stub;
pub mod utils;
pub mod writer;

pub use error::{Error, Result};

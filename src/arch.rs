//! Architecture abstraction.
//!
//! This module defines the `Architecture` trait, which keeps the machine-specific pieces
//! of packing (the `e_machine` value, byte order, and the decoder stub's machine code)
//! out of the packing pipeline.

use object::Endianness;

use crate::stub::StubBlob;

pub mod x86_64;

/// A target architecture whose executables can be packed.
pub trait Architecture {
    /// The object crate's endianness for this architecture.
    fn endianness(&self) -> Endianness;

    /// The `e_machine` value of executables for this architecture.
    fn machine(&self) -> u16;

    /// The built-in decoder stub template.
    ///
    /// The template contains exactly one occurrence of [`crate::stub::ENTRY_PLACEHOLDER`].
    fn decoder_stub(&self) -> StubBlob;
}

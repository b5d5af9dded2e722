//! Error taxonomy.
//!
//! Every stage of the packer and loader fails with a specific variant of [`Error`]
//! so the binaries can report which stage failed and exit with a distinct code.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reason an image failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Malformation {
    /// The buffer is shorter than an ELF64 header.
    TooShort { len: usize },
    /// The first four bytes are not `\x7fELF`.
    BadMagic,
    /// `EI_CLASS` is not `ELFCLASS64`.
    UnsupportedClass(u8),
    /// `EI_DATA` is neither little nor big endian.
    UnsupportedEncoding(u8),
    /// A header table entry size is smaller than the ELF64 structure it describes.
    EntrySize { table: &'static str, size: u16 },
    /// A header table would read past the end of the buffer.
    TableOutOfBounds { table: &'static str, offset: u64, len: u64 },
    /// A load segment's `p_filesz` exceeds its `p_memsz`.
    FileSizeExceedsMemSize { segment: usize },
    /// A segment's file bytes lie outside the buffer.
    SegmentOutOfBounds { segment: usize },
    /// `p_offset` and `p_vaddr` disagree modulo the page size.
    SegmentMisaligned { segment: usize },
    /// An address computation overflowed 64 bits.
    AddressOverflow,
}

impl fmt::Display for Malformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformation::TooShort { len } => {
                write!(f, "buffer of {} bytes is shorter than an ELF64 header", len)
            }
            Malformation::BadMagic => write!(f, "bad ELF magic"),
            Malformation::UnsupportedClass(class) => write!(f, "unsupported ELF class {}", class),
            Malformation::UnsupportedEncoding(data) => {
                write!(f, "unsupported ELF data encoding {}", data)
            }
            Malformation::EntrySize { table, size } => {
                write!(f, "{} entry size {} is too small", table, size)
            }
            Malformation::TableOutOfBounds { table, offset, len } => write!(
                f,
                "{} at 0x{:x} (0x{:x} bytes) extends past end of file",
                table, offset, len
            ),
            Malformation::FileSizeExceedsMemSize { segment } => {
                write!(f, "segment {} has p_filesz > p_memsz", segment)
            }
            Malformation::SegmentOutOfBounds { segment } => {
                write!(f, "segment {} extends past end of file", segment)
            }
            Malformation::SegmentMisaligned { segment } => {
                write!(f, "segment {} offset and vaddr are not congruent modulo page size", segment)
            }
            Malformation::AddressOverflow => write!(f, "address computation overflowed"),
        }
    }
}

/// A precondition of the packer that the input image does not meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidInput {
    MissingEntryPoint,
    NoNoteSegment,
    NoExecutableSegment,
    UnsupportedMachine(u16),
    BadPageSize(u64),
    /// The stub's parameter block does not fit inside the stub.
    StubParamsOutOfBounds { offset: usize, stub_len: usize },
}

impl fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidInput::MissingEntryPoint => write!(f, "image has no entry point"),
            InvalidInput::NoNoteSegment => write!(f, "image has no PT_NOTE segment to reuse"),
            InvalidInput::NoExecutableSegment => {
                write!(f, "image has no executable PT_LOAD segment")
            }
            InvalidInput::UnsupportedMachine(machine) => {
                write!(f, "unsupported machine {}", machine)
            }
            InvalidInput::BadPageSize(size) => {
                write!(f, "page size {} is not a power of two", size)
            }
            InvalidInput::StubParamsOutOfBounds { offset, stub_len } => write!(
                f,
                "stub parameter block at 0x{:x} does not fit in a {}-byte stub",
                offset, stub_len
            ),
        }
    }
}

/// The stage of the image writer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Header,
    Padding,
    Stub,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteStage::Header => "header",
            WriteStage::Padding => "padding",
            WriteStage::Stub => "stub",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("usage: {0}")]
    Usage(String),

    #[error("{}: file not found", .path.display())]
    FileNotFound { path: PathBuf },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed image: {0}")]
    Malformed(Malformation),

    #[error("not an ELF file")]
    NotElf,

    #[error("only 64-bit ELF is supported (class {0})")]
    UnsupportedClass(u8),

    #[error("failed to allocate {size} bytes")]
    AllocationFailure { size: usize },

    #[error("invalid input: {0}")]
    InvalidInput(InvalidInput),

    #[error("entry placeholder not found in stub")]
    PlaceholderNotFound,

    #[error("{stage} write failed")]
    WriteFailure {
        stage: WriteStage,
        #[source]
        source: io::Error,
    },

    #[error("no PT_LOAD segments")]
    NoLoadSegments,

    #[error("failed to map segment {segment}")]
    MapFailure {
        segment: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to reserve 0x{size:x} bytes of address space")]
    ReserveFailure {
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to set protection on segment {segment}")]
    ProtectFailure {
        segment: usize,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Usage(_) => 2,
            Error::FileNotFound { .. } => 3,
            Error::Io { .. } => 4,
            Error::Malformed(_) => 5,
            Error::NotElf => 6,
            Error::UnsupportedClass(_) => 7,
            Error::AllocationFailure { .. } => 8,
            Error::InvalidInput(_) => 9,
            Error::PlaceholderNotFound => 10,
            Error::NoLoadSegments => 11,
            Error::MapFailure { .. } => 12,
            Error::ProtectFailure { .. } => 13,
            Error::ReserveFailure { .. } => 14,
            Error::WriteFailure { stage: WriteStage::Header, .. } => 20,
            Error::WriteFailure { stage: WriteStage::Padding, .. } => 21,
            Error::WriteFailure { stage: WriteStage::Stub, .. } => 22,
        }
    }
}

/// Exit status for an error returned by a binary: the status of the first crate error in
/// its chain, or 1.
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map_or(1, Error::exit_code)
}

impl From<Malformation> for Error {
    fn from(m: Malformation) -> Self {
        Error::Malformed(m)
    }
}

impl From<InvalidInput> for Error {
    fn from(i: InvalidInput) -> Self {
        Error::InvalidInput(i)
    }
}

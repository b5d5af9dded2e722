//! In-memory ELF64 image.
//!
//! This module owns the byte buffer of an executable and the typed views over it:
//! 1. Image Reader: maps a file with `memmap2` and copies it into an owned buffer.
//! 2. Header Parser: validates the ELF header and every header table against the buffer.
//! 3. Views: program headers (and section headers, for inspection) are decoded on demand
//!    from offsets recorded at parse time, so mutating the buffer never leaves a dangling view.

use memmap2::Mmap;
use object::elf::{self, FileHeader64, ProgramHeader64, SectionHeader64};
use object::pod;
use object::Endianness;
use std::fmt;
use std::fs::File;
use std::io;
use std::mem::size_of;
use std::ops::BitOr;
use std::path::Path;

use crate::error::{Error, Malformation, Result};

pub const EHDR_SIZE: usize = size_of::<FileHeader64<Endianness>>();
pub const PHDR_SIZE: usize = size_of::<ProgramHeader64<Endianness>>();
pub const SHDR_SIZE: usize = size_of::<SectionHeader64<Endianness>>();

/// Opens `path` for reading, reporting a missing file as [`Error::FileNotFound`].
pub fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::FileNotFound { path: path.to_path_buf() }
        } else {
            Error::io(format!("failed to open {}", path.display()), e)
        }
    })
}

/// Reads the whole file at `path` into an owned buffer.
pub fn read_image(path: &Path) -> Result<Vec<u8>> {
    let file = open_file(path)?;
    read_file(&file, path)
}

/// Reads an already opened file into an owned buffer.
///
/// The buffer is reserved up front so that an oversized input is reported as
/// [`Error::AllocationFailure`] rather than aborting the process.
pub fn read_file(file: &File, path: &Path) -> Result<Vec<u8>> {
    let metadata = file
        .metadata()
        .map_err(|e| Error::io(format!("failed to stat {}", path.display()), e))?;
    let len = usize::try_from(metadata.len())
        .map_err(|_| Error::AllocationFailure { size: usize::MAX })?;

    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| Error::AllocationFailure { size: len })?;
    if len == 0 {
        return Ok(buffer);
    }

    let mmap = unsafe { Mmap::map(file) }
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    buffer.extend_from_slice(&mmap);
    tracing::debug!("read {} ({} bytes)", path.display(), buffer.len());
    Ok(buffer)
}

/// Program header type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Null,
    Load,
    Dynamic,
    Interp,
    Note,
    Shlib,
    Phdr,
    Tls,
    GnuEhFrame,
    GnuStack,
    GnuRelro,
    GnuProperty,
    Other(u32),
}

impl SegmentKind {
    pub fn from_raw(p_type: u32) -> Self {
        match p_type {
            elf::PT_NULL => SegmentKind::Null,
            elf::PT_LOAD => SegmentKind::Load,
            elf::PT_DYNAMIC => SegmentKind::Dynamic,
            elf::PT_INTERP => SegmentKind::Interp,
            elf::PT_NOTE => SegmentKind::Note,
            elf::PT_SHLIB => SegmentKind::Shlib,
            elf::PT_PHDR => SegmentKind::Phdr,
            elf::PT_TLS => SegmentKind::Tls,
            elf::PT_GNU_EH_FRAME => SegmentKind::GnuEhFrame,
            elf::PT_GNU_STACK => SegmentKind::GnuStack,
            elf::PT_GNU_RELRO => SegmentKind::GnuRelro,
            elf::PT_GNU_PROPERTY => SegmentKind::GnuProperty,
            other => SegmentKind::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            SegmentKind::Null => elf::PT_NULL,
            SegmentKind::Load => elf::PT_LOAD,
            SegmentKind::Dynamic => elf::PT_DYNAMIC,
            SegmentKind::Interp => elf::PT_INTERP,
            SegmentKind::Note => elf::PT_NOTE,
            SegmentKind::Shlib => elf::PT_SHLIB,
            SegmentKind::Phdr => elf::PT_PHDR,
            SegmentKind::Tls => elf::PT_TLS,
            SegmentKind::GnuEhFrame => elf::PT_GNU_EH_FRAME,
            SegmentKind::GnuStack => elf::PT_GNU_STACK,
            SegmentKind::GnuRelro => elf::PT_GNU_RELRO,
            SegmentKind::GnuProperty => elf::PT_GNU_PROPERTY,
            SegmentKind::Other(raw) => raw,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Null => f.write_str("PT_NULL"),
            SegmentKind::Load => f.write_str("PT_LOAD"),
            SegmentKind::Dynamic => f.write_str("PT_DYNAMIC"),
            SegmentKind::Interp => f.write_str("PT_INTERP"),
            SegmentKind::Note => f.write_str("PT_NOTE"),
            SegmentKind::Shlib => f.write_str("PT_SHLIB"),
            SegmentKind::Phdr => f.write_str("PT_PHDR"),
            SegmentKind::Tls => f.write_str("PT_TLS"),
            SegmentKind::GnuEhFrame => f.write_str("PT_GNU_EH_FRAME"),
            SegmentKind::GnuStack => f.write_str("PT_GNU_STACK"),
            SegmentKind::GnuRelro => f.write_str("PT_GNU_RELRO"),
            SegmentKind::GnuProperty => f.write_str("PT_GNU_PROPERTY"),
            SegmentKind::Other(raw) => write!(f, "UNKNOWN(0x{:x})", raw),
        }
    }
}

/// Segment permission bits (`p_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags(u32);

impl SegmentFlags {
    pub const NONE: Self = SegmentFlags(0);
    pub const EXEC: Self = SegmentFlags(elf::PF_X);
    pub const WRITE: Self = SegmentFlags(elf::PF_W);
    pub const READ: Self = SegmentFlags(elf::PF_R);

    pub fn from_raw(raw: u32) -> Self {
        SegmentFlags(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_executable(self) -> bool {
        self.contains(Self::EXEC)
    }
}

impl BitOr for SegmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        SegmentFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for SegmentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.is_readable() { 'R' } else { '-' };
        let w = if self.is_writable() { 'W' } else { '-' };
        let x = if self.is_executable() { 'X' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// One program header, decoded to native integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Position in the program header table.
    pub index: usize,
    pub kind: SegmentKind,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub file_size: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl SegmentDescriptor {
    pub fn is_load(&self) -> bool {
        self.kind == SegmentKind::Load
    }

    /// End of the segment in memory, `None` on overflow.
    pub fn mem_end(&self) -> Option<u64> {
        self.vaddr.checked_add(self.mem_size)
    }
}

/// One section header, kept for inspection and trace output only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDescriptor {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

/// The validated ELF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub class: u8,
    pub endian: Endianness,
    pub e_type: u16,
    pub machine: u16,
    pub entry: u64,
    pub ehsize: u16,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shoff: u64,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl Header {
    /// Validates the identification bytes and decodes the ELF header.
    ///
    /// No header table is checked here; see [`ExecutableImage::parse`].
    pub fn parse(data: &[u8]) -> Result<Header, Malformation> {
        if data.len() < EHDR_SIZE {
            return Err(Malformation::TooShort { len: data.len() });
        }
        let (ehdr, _) = pod::from_bytes::<FileHeader64<Endianness>>(data)
            .map_err(|()| Malformation::TooShort { len: data.len() })?;
        let ident = &ehdr.e_ident;
        if ident.magic != elf::ELFMAG {
            return Err(Malformation::BadMagic);
        }
        if ident.class != elf::ELFCLASS64 {
            return Err(Malformation::UnsupportedClass(ident.class));
        }
        let endian = match ident.data {
            elf::ELFDATA2LSB => Endianness::Little,
            elf::ELFDATA2MSB => Endianness::Big,
            other => return Err(Malformation::UnsupportedEncoding(other)),
        };

        Ok(Header {
            class: ident.class,
            endian,
            e_type: ehdr.e_type.get(endian),
            machine: ehdr.e_machine.get(endian),
            entry: ehdr.e_entry.get(endian),
            ehsize: ehdr.e_ehsize.get(endian),
            phoff: ehdr.e_phoff.get(endian),
            phentsize: ehdr.e_phentsize.get(endian),
            phnum: ehdr.e_phnum.get(endian),
            shoff: ehdr.e_shoff.get(endian),
            shentsize: ehdr.e_shentsize.get(endian),
            shnum: ehdr.e_shnum.get(endian),
            shstrndx: ehdr.e_shstrndx.get(endian),
        })
    }

    pub fn is_position_independent(&self) -> bool {
        self.e_type == elf::ET_DYN
    }

    /// File range `[start, end)` covered by the program header table.
    pub fn phdr_table_range(&self) -> (u64, u64) {
        let len = self.phnum as u64 * self.phentsize as u64;
        (self.phoff, self.phoff.saturating_add(len))
    }

    fn check_table(
        table: &'static str,
        offset: u64,
        entsize: u16,
        count: u16,
        min_entsize: usize,
        data_len: usize,
    ) -> Result<(), Malformation> {
        if count == 0 {
            return Ok(());
        }
        if (entsize as usize) < min_entsize {
            return Err(Malformation::EntrySize { table, size: entsize });
        }
        let len = entsize as u64 * count as u64;
        match offset.checked_add(len) {
            Some(end) if end <= data_len as u64 => Ok(()),
            _ => Err(Malformation::TableOutOfBounds { table, offset, len }),
        }
    }
}

/// An executable held in memory: the owned bytes plus the header describing them.
pub struct ExecutableImage {
    data: Vec<u8>,
    header: Header,
}

impl ExecutableImage {
    /// Parses `data` as an ELF64 image.
    ///
    /// Every header table and every segment's file range is checked against the buffer
    /// before the image is returned; nothing is returned on failure.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let header = Header::parse(&data)?;
        Header::check_table(
            "program header table",
            header.phoff,
            header.phentsize,
            header.phnum,
            PHDR_SIZE,
            data.len(),
        )?;
        if header.shoff != 0 {
            Header::check_table(
                "section header table",
                header.shoff,
                header.shentsize,
                header.shnum,
                SHDR_SIZE,
                data.len(),
            )?;
        }

        let image = ExecutableImage { data, header };
        for segment in image.segments() {
            if segment.is_load() && segment.file_size > segment.mem_size {
                return Err(Malformation::FileSizeExceedsMemSize { segment: segment.index }.into());
            }
            let in_bounds = segment
                .offset
                .checked_add(segment.file_size)
                .is_some_and(|end| end <= image.data.len() as u64);
            if segment.file_size > 0 && !in_bounds {
                return Err(Malformation::SegmentOutOfBounds { segment: segment.index }.into());
            }
        }

        tracing::debug!(
            "ELF entry 0x{:x}, {} program headers, {} section headers",
            header.entry,
            header.phnum,
            header.shnum
        );
        for segment in image.segments() {
            tracing::debug!(
                "segment {}: {} {} offset=0x{:x} vaddr=0x{:x} filesz=0x{:x} memsz=0x{:x}",
                segment.index,
                segment.kind,
                segment.flags,
                segment.offset,
                segment.vaddr,
                segment.file_size,
                segment.mem_size
            );
        }
        for (i, section) in image.sections().iter().enumerate() {
            tracing::trace!(
                "section {}: {} type={} addr=0x{:x} offset=0x{:x} size=0x{:x}",
                i,
                section.name,
                section.sh_type,
                section.addr,
                section.offset,
                section.size
            );
        }

        Ok(image)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn phdr_offset(&self, index: usize) -> usize {
        self.header.phoff as usize + index * self.header.phentsize as usize
    }

    /// Decodes program header `index`.
    pub fn segment(&self, index: usize) -> Option<SegmentDescriptor> {
        if index >= self.header.phnum as usize {
            return None;
        }
        let endian = self.header.endian;
        let (phdr, _) =
            pod::from_bytes::<ProgramHeader64<Endianness>>(&self.data[self.phdr_offset(index)..])
                .ok()?;
        Some(SegmentDescriptor {
            index,
            kind: SegmentKind::from_raw(phdr.p_type.get(endian)),
            flags: SegmentFlags::from_raw(phdr.p_flags.get(endian)),
            offset: phdr.p_offset.get(endian),
            file_size: phdr.p_filesz.get(endian),
            vaddr: phdr.p_vaddr.get(endian),
            paddr: phdr.p_paddr.get(endian),
            mem_size: phdr.p_memsz.get(endian),
            align: phdr.p_align.get(endian),
        })
    }

    /// All program headers in table order.
    pub fn segments(&self) -> impl Iterator<Item = SegmentDescriptor> + '_ {
        (0..self.header.phnum as usize).filter_map(move |i| self.segment(i))
    }

    /// Overwrites program header `segment.index` in place.
    pub fn set_segment(&mut self, segment: &SegmentDescriptor) -> Option<()> {
        if segment.index >= self.header.phnum as usize {
            return None;
        }
        let endian = self.header.endian;
        let offset = self.phdr_offset(segment.index);
        let (phdr, _) =
            pod::from_bytes_mut::<ProgramHeader64<Endianness>>(&mut self.data[offset..]).ok()?;
        phdr.p_type.set(endian, segment.kind.raw());
        phdr.p_flags.set(endian, segment.flags.raw());
        phdr.p_offset.set(endian, segment.offset);
        phdr.p_vaddr.set(endian, segment.vaddr);
        phdr.p_paddr.set(endian, segment.paddr);
        phdr.p_filesz.set(endian, segment.file_size);
        phdr.p_memsz.set(endian, segment.mem_size);
        phdr.p_align.set(endian, segment.align);
        Some(())
    }

    /// Rewrites `e_entry` in the buffer and the parsed header.
    pub fn set_entry(&mut self, entry: u64) {
        let endian = self.header.endian;
        if let Ok((ehdr, _)) = pod::from_bytes_mut::<FileHeader64<Endianness>>(&mut self.data) {
            ehdr.e_entry.set(endian, entry);
            self.header.entry = entry;
        }
    }

    /// Mutable access to a file range, `None` if it lies outside the buffer.
    pub fn bytes_mut(&mut self, offset: u64, len: u64) -> Option<&mut [u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        self.data.get_mut(start..end)
    }

    /// Decodes the section header table, resolving names through `e_shstrndx`.
    ///
    /// Names that cannot be resolved are left empty.
    pub fn sections(&self) -> Vec<SectionDescriptor> {
        if self.header.shoff == 0 {
            return Vec::new();
        }
        let endian = self.header.endian;
        let headers: Vec<&SectionHeader64<Endianness>> = (0..self.header.shnum as usize)
            .filter_map(|i| {
                let offset =
                    self.header.shoff as usize + i * self.header.shentsize as usize;
                pod::from_bytes::<SectionHeader64<Endianness>>(&self.data[offset..])
                    .ok()
                    .map(|(shdr, _)| shdr)
            })
            .collect();

        let strtab = headers
            .get(self.header.shstrndx as usize)
            .and_then(|shdr| {
                let start = usize::try_from(shdr.sh_offset.get(endian)).ok()?;
                let len = usize::try_from(shdr.sh_size.get(endian)).ok()?;
                self.data.get(start..start.checked_add(len)?)
            })
            .unwrap_or(&[]);

        headers
            .iter()
            .map(|shdr| {
                let name_off = shdr.sh_name.get(endian) as usize;
                let name = strtab
                    .get(name_off..)
                    .and_then(|s| s.split(|&b| b == 0).next())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .unwrap_or_default();
                SectionDescriptor {
                    name,
                    sh_type: shdr.sh_type.get(endian),
                    addr: shdr.sh_addr.get(endian),
                    offset: shdr.sh_offset.get(endian),
                    size: shdr.sh_size.get(endian),
                }
            })
            .collect()
    }
}

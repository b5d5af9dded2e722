//! Synthetic ELF64 images for tests.

#![allow(dead_code)]

use object::elf::{self, FileHeader64, Ident, ProgramHeader64};
use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

pub const LE: Endianness = Endianness::Little;
pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

/// One program header of a fixture.
#[derive(Debug, Clone, Copy)]
pub struct Seg {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

impl Seg {
    pub fn load(flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> Self {
        Seg { p_type: elf::PT_LOAD, flags, offset, vaddr, filesz, memsz }
    }

    pub fn note(offset: u64, size: u64) -> Self {
        Seg { p_type: elf::PT_NOTE, flags: elf::PF_R, offset, vaddr: 0, filesz: size, memsz: size }
    }
}

/// Builds an image of exactly `file_len` bytes: ELF header, program headers at offset 64,
/// and every other byte set to `i as u8`.
pub fn build_elf(e_type: u16, entry: u64, segs: &[Seg], file_len: usize) -> Vec<u8> {
    build_elf_at(e_type, entry, segs, file_len, EHDR_SIZE)
}

/// Like [`build_elf`], with the program header table at `phoff`.
pub fn build_elf_at(e_type: u16, entry: u64, segs: &[Seg], file_len: usize, phoff: usize) -> Vec<u8> {
    let header = FileHeader64::<Endianness> {
        e_ident: Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS64,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(LE, e_type),
        e_machine: U16::new(LE, elf::EM_X86_64),
        e_version: U32::new(LE, elf::EV_CURRENT as u32),
        e_entry: U64::new(LE, entry),
        e_phoff: U64::new(LE, phoff as u64),
        e_shoff: U64::new(LE, 0),
        e_flags: U32::new(LE, 0),
        e_ehsize: U16::new(LE, EHDR_SIZE as u16),
        e_phentsize: U16::new(LE, PHDR_SIZE as u16),
        e_phnum: U16::new(LE, segs.len() as u16),
        e_shentsize: U16::new(LE, 64),
        e_shnum: U16::new(LE, 0),
        e_shstrndx: U16::new(LE, 0),
    };

    let mut data: Vec<u8> = (0..file_len).map(|i| i as u8).collect();
    let mut table = Vec::new();
    for seg in segs {
        let phdr = ProgramHeader64::<Endianness> {
            p_type: U32::new(LE, seg.p_type),
            p_flags: U32::new(LE, seg.flags),
            p_offset: U64::new(LE, seg.offset),
            p_vaddr: U64::new(LE, seg.vaddr),
            p_paddr: U64::new(LE, seg.vaddr),
            p_filesz: U64::new(LE, seg.filesz),
            p_memsz: U64::new(LE, seg.memsz),
            p_align: U64::new(LE, 0x1000),
        };
        table.extend_from_slice(bytes_of(&phdr));
    }
    let ehdr = bytes_of(&header);
    assert!(phoff >= ehdr.len(), "program headers overlap the ELF header");
    assert!(phoff + table.len() <= file_len, "headers do not fit in {} bytes", file_len);
    data[..ehdr.len()].copy_from_slice(ehdr);
    data[phoff..phoff + table.len()].copy_from_slice(&table);
    data
}

/// The minimal executable: one R-X load segment of 0x78 bytes at offset 0 and a
/// PT_NOTE of 0xad bytes at 0x5000.
pub fn minimal_exec() -> Vec<u8> {
    build_elf(
        elf::ET_EXEC,
        0x400040,
        &[
            Seg::load(elf::PF_R | elf::PF_X, 0, 0x400000, 0x78, 0x78),
            Seg::note(0x5000, 0xad),
        ],
        0x5000 + 0xad,
    )
}

//! x86_64 Architecture backend.
//!
//! Implements the `Architecture` trait for 64-bit x86 Linux executables (ELF64).

use super::Architecture;
use object::{elf, Endianness};

use crate::stub::StubBlob;

/// Offset of the parameter block inside [`DECODER_STUB`].
const PARAMS_OFFSET: usize = 0x88;

/// Decoder stub.
///
/// On entry the stub makes the encrypted range writable, XORs it with the cyclic key,
/// restores the range's protection and jumps to the original entry point. Only `rdx`
/// (the kernel's `atexit` pointer) and `rsp` are preserved.
///
/// The range is rounded to pages with a fixed `0xfff` mask. x86-64 Linux maps with 4 KiB
/// base pages, and any `--page-size` used to lay out the file is a multiple of that, so
/// the mask holds for every packed image.
///
/// Parameter block at `PARAMS_OFFSET`:
/// `[delta: i64][length: u64][key: u64][restore_prot: u64]`, where `delta` is the
/// encrypted range's address relative to the start of the stub.
#[rustfmt::skip]
static DECODER_STUB: [u8; PARAMS_OFFSET + 32] = [
    0x52,                                     // 00: push rdx
    0x4c, 0x8d, 0x05, 0x80, 0x00, 0x00, 0x00, // 01: lea  r8, [rip + 0x80]    ; params
    0x4c, 0x8d, 0x0d, 0xf1, 0xff, 0xff, 0xff, // 08: lea  r9, [rip - 0x0f]    ; stub start
    0x4d, 0x03, 0x08,                         // 0f: add  r9, [r8]            ; r9 = range start
    // mprotect(page_down(r9), len + (r9 & 0xfff), PROT_READ | PROT_WRITE | PROT_EXEC)
    0x4c, 0x89, 0xcf,                         // 12: mov  rdi, r9
    0x49, 0x8b, 0x70, 0x08,                   // 15: mov  rsi, [r8 + 8]
    0x48, 0x89, 0xf9,                         // 19: mov  rcx, rdi
    0x81, 0xe1, 0xff, 0x0f, 0x00, 0x00,       // 1c: and  ecx, 0xfff
    0x48, 0x29, 0xcf,                         // 22: sub  rdi, rcx
    0x48, 0x01, 0xce,                         // 25: add  rsi, rcx
    0xba, 0x07, 0x00, 0x00, 0x00,             // 28: mov  edx, 7
    0xb8, 0x0a, 0x00, 0x00, 0x00,             // 2d: mov  eax, SYS_mprotect
    0x0f, 0x05,                               // 32: syscall
    // for (rdx = 0; rdx < len; rdx++) r9[rdx] ^= key[rdx & 7]
    0x49, 0x8b, 0x48, 0x08,                   // 34: mov  rcx, [r8 + 8]
    0x31, 0xd2,                               // 38: xor  edx, edx
    0x48, 0x39, 0xca,                         // 3a: cmp  rdx, rcx
    0x73, 0x14,                               // 3d: jae  0x53
    0x48, 0x89, 0xd0,                         // 3f: mov  rax, rdx
    0x83, 0xe0, 0x07,                         // 42: and  eax, 7
    0x41, 0x8a, 0x44, 0x00, 0x10,             // 45: mov  al, [r8 + rax + 0x10]
    0x41, 0x30, 0x04, 0x11,                   // 4a: xor  [r9 + rdx], al
    0x48, 0xff, 0xc2,                         // 4e: inc  rdx
    0xeb, 0xe7,                               // 51: jmp  0x3a
    // mprotect(page_down(r9), len + (r9 & 0xfff), restore_prot)
    0x4c, 0x89, 0xcf,                         // 53: mov  rdi, r9
    0x49, 0x8b, 0x70, 0x08,                   // 56: mov  rsi, [r8 + 8]
    0x48, 0x89, 0xf9,                         // 5a: mov  rcx, rdi
    0x81, 0xe1, 0xff, 0x0f, 0x00, 0x00,       // 5d: and  ecx, 0xfff
    0x48, 0x29, 0xcf,                         // 63: sub  rdi, rcx
    0x48, 0x01, 0xce,                         // 66: add  rsi, rcx
    0x49, 0x8b, 0x50, 0x18,                   // 69: mov  rdx, [r8 + 0x18]
    0xb8, 0x0a, 0x00, 0x00, 0x00,             // 6d: mov  eax, SYS_mprotect
    0x0f, 0x05,                               // 72: syscall
    0x5a,                                     // 74: pop  rdx
    0x48, 0xb8,                               // 75: movabs rax, ENTRY_PLACEHOLDER
    0xef, 0xbe, 0xad, 0xde, 0xbe, 0xba, 0xfe, 0xca,
    0xff, 0xe0,                               // 7f: jmp  rax
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // 81: nop padding
    // 88: parameter block
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// The x86_64 architecture backend.
pub struct X86_64;

impl Architecture for X86_64 {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn machine(&self) -> u16 {
        elf::EM_X86_64
    }

    fn decoder_stub(&self) -> StubBlob {
        StubBlob::from_static(&DECODER_STUB, Some(PARAMS_OFFSET))
    }
}

//! Core packing logic.
//!
//! This module contains the `Packer` struct which orchestrates one pack operation:
//! 1. Plan: locate the `PT_NOTE` cavity and place the stub past every `PT_LOAD` segment.
//! 2. Encrypt: XOR the first executable segment.
//! 3. Patch: copy the stub template and fill in the original entry and decoding parameters.
//! 4. Rewrite: turn the `PT_NOTE` header into a `PT_LOAD` for the stub and redirect the entry.
//!
//! The result is a [`PackedImage`], which the writer serializes.

use std::io::Write;

use crate::arch::Architecture;
use crate::config::PackOptions;
use crate::encrypt::{self, EncryptedRange};
use crate::error::{Error, InvalidInput, Result};
use crate::image::{ExecutableImage, SegmentFlags, SegmentKind};
use crate::loader::prot_from_flags;
use crate::plan::PackingPlan;
use crate::stub::{StubBlob, StubParams};
use crate::writer;

/// A packed executable, ready to be written.
pub struct PackedImage {
    /// The original bytes with rewritten headers and the encrypted segment.
    pub image: ExecutableImage,
    pub plan: PackingPlan,
    pub encrypted: EncryptedRange,
    /// The patched stub, appended after `plan.padding_size` zero bytes.
    pub stub: Vec<u8>,
}

impl PackedImage {
    /// Length of the output file.
    pub fn output_len(&self) -> u64 {
        self.plan.new_file_offset + self.stub.len() as u64
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<u64> {
        writer::write_image(out, self.image.data(), self.plan.padding_size, &self.stub)
    }
}

pub struct Packer<A: Architecture> {
    arch: A,
    options: PackOptions,
    stub: StubBlob,
}

impl<A: Architecture> Packer<A> {
    pub fn new(arch: A, options: PackOptions) -> Self {
        let stub = arch.decoder_stub();
        Self { arch, options, stub }
    }

    /// Replaces the built-in decoder stub.
    pub fn with_stub(mut self, stub: StubBlob) -> Self {
        self.stub = stub;
        self
    }

    pub fn pack(&self, mut image: ExecutableImage) -> Result<PackedImage> {
        let machine = image.header().machine;
        if machine != self.arch.machine() {
            return Err(InvalidInput::UnsupportedMachine(machine).into());
        }
        if image.header().is_position_independent() {
            tracing::warn!("position-independent image: the stub jumps to an absolute entry");
        }

        let plan = PackingPlan::compute(&image, self.options.page_size)?;
        let encrypted = encrypt::encrypt_segment(&mut image, self.options.key)?;

        let params = StubParams {
            delta: encrypted.vaddr.wrapping_sub(plan.stub_vaddr) as i64,
            length: encrypted.len,
            key: self.options.key,
            restore_prot: prot_from_flags(encrypted.flags) as u64,
        };
        let stub = self.stub.patch(plan.original_entry, Some(&params), self.arch.endianness())?;

        rewrite_headers(&mut image, &plan, stub.len() as u64)?;
        tracing::info!(
            "stub of {} bytes at vaddr 0x{:x}, file offset 0x{:x} (0x{:x} bytes padding)",
            stub.len(),
            plan.stub_vaddr,
            plan.new_file_offset,
            plan.padding_size
        );

        Ok(PackedImage { image, plan, encrypted, stub })
    }
}

/// Converts the planned `PT_NOTE` slot into an RWX `PT_LOAD` covering the stub and points
/// the entry at the stub.
pub fn rewrite_headers(image: &mut ExecutableImage, plan: &PackingPlan, stub_len: u64) -> Result<()> {
    let mut segment = image
        .segment(plan.note_index)
        .filter(|s| s.kind == SegmentKind::Note)
        .ok_or(InvalidInput::NoNoteSegment)?;

    segment.kind = SegmentKind::Load;
    segment.flags = SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::EXEC;
    segment.offset = plan.new_file_offset;
    segment.vaddr = plan.stub_vaddr;
    segment.paddr = plan.stub_vaddr;
    segment.file_size = stub_len;
    segment.mem_size = stub_len;
    segment.align = plan.page_size;
    image
        .set_segment(&segment)
        .ok_or(Error::from(InvalidInput::NoNoteSegment))?;

    image.set_entry(plan.stub_vaddr);
    tracing::debug!(
        "segment {} is now {} {} at 0x{:x}, entry 0x{:x} -> 0x{:x}",
        segment.index,
        segment.kind,
        segment.flags,
        segment.vaddr,
        plan.original_entry,
        plan.stub_vaddr
    );
    Ok(())
}

//! Packing planner.
//!
//! Decides where the stub goes: in memory, just past the highest `PT_LOAD` segment,
//! and in the file, at the first page boundary past the end of the original bytes.

use crate::error::{InvalidInput, Malformation, Result};
use crate::image::{ExecutableImage, SegmentKind};
use crate::utils::align_up;

/// Placement of the stub for one pack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingPlan {
    pub original_entry: u64,
    /// Highest `vaddr + memsz` over all `PT_LOAD` segments.
    pub max_load_vaddr: u64,
    pub stub_vaddr: u64,
    pub new_file_offset: u64,
    pub padding_size: u64,
    /// The `PT_NOTE` slot that will carry the stub.
    pub note_index: usize,
    pub page_size: u64,
}

impl PackingPlan {
    pub fn compute(image: &ExecutableImage, page_size: u64) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(InvalidInput::BadPageSize(page_size).into());
        }
        let original_entry = image.header().entry;
        if original_entry == 0 {
            return Err(InvalidInput::MissingEntryPoint.into());
        }
        let note_index = image
            .segments()
            .find(|s| s.kind == SegmentKind::Note)
            .map(|s| s.index)
            .ok_or(InvalidInput::NoNoteSegment)?;

        // Load segments are not necessarily sorted by address.
        let mut max_load_vaddr = 0;
        for segment in image.segments().filter(|s| s.is_load()) {
            let end = segment.mem_end().ok_or(Malformation::AddressOverflow)?;
            max_load_vaddr = max_load_vaddr.max(end);
        }

        let stub_vaddr = align_up(max_load_vaddr, page_size).ok_or(Malformation::AddressOverflow)?;
        let original_size = image.len() as u64;
        let new_file_offset =
            align_up(original_size, page_size).ok_or(Malformation::AddressOverflow)?;

        let plan = PackingPlan {
            original_entry,
            max_load_vaddr,
            stub_vaddr,
            new_file_offset,
            padding_size: new_file_offset - original_size,
            note_index,
            page_size,
        };
        tracing::debug!("packing plan: {:x?}", plan);
        Ok(plan)
    }
}

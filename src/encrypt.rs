//! Segment encryptor.
//!
//! XORs the file-resident bytes of the first executable `PT_LOAD` segment with a
//! repeating 8-byte key. The ELF header and program header table are never touched,
//! even when the segment starts at file offset 0.

use crate::error::{InvalidInput, Result};
use crate::image::{ExecutableImage, SegmentDescriptor, SegmentFlags, EHDR_SIZE};

/// The part of a segment that was encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedRange {
    /// Index of the segment in the program header table.
    pub segment: usize,
    pub offset: u64,
    pub vaddr: u64,
    pub len: u64,
    /// Flags of the segment, used to restore its protection after decoding.
    pub flags: SegmentFlags,
}

/// XORs `data` in place with the little-endian bytes of `key`, repeated cyclically.
///
/// Applying it twice with the same key restores the input.
pub fn xor_in_place(data: &mut [u8], key: u64) {
    let key = key.to_le_bytes();
    for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// First `PT_LOAD` segment with the executable flag, in table order.
pub fn select_segment(image: &ExecutableImage) -> Result<SegmentDescriptor> {
    image
        .segments()
        .find(|s| s.is_load() && s.flags.is_executable())
        .ok_or_else(|| InvalidInput::NoExecutableSegment.into())
}

/// The file range of `segment` that may be encrypted.
///
/// The range is the tail of the segment past every header structure that overlaps it:
/// the ELF header and the program header table. Bytes between the two structures stay
/// in plain text when the table lies inside the segment.
pub fn encryptable_range(image: &ExecutableImage, segment: &SegmentDescriptor) -> EncryptedRange {
    let header = image.header();
    let end = segment.offset + segment.file_size;

    let ehdr = (0, (header.ehsize as u64).max(EHDR_SIZE as u64));
    let mut protected = vec![ehdr];
    if header.phnum > 0 {
        protected.push(header.phdr_table_range());
    }
    protected.sort_unstable();

    let mut start = segment.offset;
    for (lo, hi) in protected {
        if lo < end && hi > start {
            start = start.max(hi);
        }
    }
    let start = start.min(end);

    EncryptedRange {
        segment: segment.index,
        offset: start,
        vaddr: segment.vaddr + (start - segment.offset),
        len: end - start,
        flags: segment.flags,
    }
}

/// Encrypts the selected segment of `image` in place.
pub fn encrypt_segment(image: &mut ExecutableImage, key: u64) -> Result<EncryptedRange> {
    let segment = select_segment(image)?;
    let range = encryptable_range(image, &segment);
    if range.offset != segment.offset {
        tracing::debug!(
            "segment {} overlaps headers, encrypting from 0x{:x} instead of 0x{:x}",
            segment.index,
            range.offset,
            segment.offset
        );
    }

    // Segment file ranges were bounds-checked when the image was parsed.
    if let Some(bytes) = image.bytes_mut(range.offset, range.len) {
        xor_in_place(bytes, key);
    }
    tracing::info!(
        "encrypted segment {}: 0x{:x} bytes at offset 0x{:x}",
        segment.index,
        range.len,
        range.offset
    );
    Ok(range)
}

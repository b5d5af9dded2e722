//! Decoder stub templates and patching.
//!
//! A stub template is machine code containing one 64-bit [`ENTRY_PLACEHOLDER`]. Patching
//! copies the template and overwrites the placeholder with the original entry point.
//! Templates built into an architecture backend also carry a parameter block describing
//! the encrypted range.

use object::{Endian, Endianness};
use std::borrow::Cow;
use std::path::Path;

use crate::error::{Error, InvalidInput, Result};
use crate::image::read_image;

/// Sentinel the stub's final jump target is initialised with.
pub const ENTRY_PLACEHOLDER: u64 = 0xCAFE_BABE_DEAD_BEEF;

/// Size of the parameter block: delta, length, key and restore protection.
pub const PARAMS_SIZE: usize = 32;

/// What the stub needs to know to decode the protected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubParams {
    /// Address of the encrypted range relative to the stub's load address.
    pub delta: i64,
    pub length: u64,
    pub key: u64,
    /// `PROT_*` bits the range is restored to after decoding.
    pub restore_prot: u64,
}

impl StubParams {
    fn encode(&self, endian: Endianness) -> [u8; PARAMS_SIZE] {
        let mut block = [0u8; PARAMS_SIZE];
        block[0..8].copy_from_slice(&endian.write_u64_bytes(self.delta as u64));
        block[8..16].copy_from_slice(&endian.write_u64_bytes(self.length));
        // Key bytes are consumed in memory order, matching the encryptor's key stream.
        block[16..24].copy_from_slice(&self.key.to_le_bytes());
        block[24..32].copy_from_slice(&endian.write_u64_bytes(self.restore_prot));
        block
    }
}

/// A stub template. Never mutated; [`StubBlob::patch`] works on a copy.
#[derive(Debug, Clone)]
pub struct StubBlob {
    template: Cow<'static, [u8]>,
    params_offset: Option<usize>,
}

impl StubBlob {
    pub fn from_static(template: &'static [u8], params_offset: Option<usize>) -> Self {
        Self { template: Cow::Borrowed(template), params_offset }
    }

    /// An externally supplied stub. It has no parameter block.
    pub fn from_bytes(template: Vec<u8>) -> Self {
        Self { template: Cow::Owned(template), params_offset: None }
    }

    /// Reads an external stub from a raw machine-code file.
    pub fn load(path: &Path) -> Result<Self> {
        let template = read_image(path)?;
        tracing::info!("using stub {} ({} bytes)", path.display(), template.len());
        Ok(Self::from_bytes(template))
    }

    pub fn template(&self) -> &[u8] {
        &self.template
    }

    pub fn params_offset(&self) -> Option<usize> {
        self.params_offset
    }

    pub fn len(&self) -> usize {
        self.template.len()
    }

    pub fn is_empty(&self) -> bool {
        self.template.is_empty()
    }

    /// Returns a patched copy of the template.
    ///
    /// The placeholder is replaced with `entry`. When the template has a parameter block
    /// and `params` is given, the block is filled in as well.
    pub fn patch(
        &self,
        entry: u64,
        params: Option<&StubParams>,
        endian: Endianness,
    ) -> Result<Vec<u8>> {
        let mut stub = self.template.to_vec();
        let at = patch_entry(&mut stub, entry, endian)?;
        tracing::debug!("patched entry 0x{:x} into stub at offset 0x{:x}", entry, at);

        if let (Some(offset), Some(params)) = (self.params_offset, params) {
            let stub_len = stub.len();
            let block = offset
                .checked_add(PARAMS_SIZE)
                .and_then(|end| stub.get_mut(offset..end))
                .ok_or(InvalidInput::StubParamsOutOfBounds { offset, stub_len })?;
            block.copy_from_slice(&params.encode(endian));
            tracing::debug!("stub parameters: {:x?}", params);
        }
        Ok(stub)
    }
}

/// Finds the first byte offset where the placeholder occurs, at any alignment.
pub fn find_placeholder(bytes: &[u8], endian: Endianness) -> Option<usize> {
    let needle = endian.write_u64_bytes(ENTRY_PLACEHOLDER);
    bytes.windows(needle.len()).position(|window| window == needle)
}

/// Overwrites the first placeholder in `stub` with `entry`, returning its offset.
pub fn patch_entry(stub: &mut [u8], entry: u64, endian: Endianness) -> Result<usize> {
    let at = find_placeholder(stub, endian).ok_or(Error::PlaceholderNotFound)?;
    stub[at..at + 8].copy_from_slice(&endian.write_u64_bytes(entry));
    Ok(at)
}

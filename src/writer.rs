//! Packed image writer.
//!
//! Serializes the rewritten original bytes, the zero padding up to the stub's page and
//! the patched stub. Each stage is reported separately when it fails.

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Error, Result, WriteStage};
use crate::packer::PackedImage;

fn write_stage<W: Write>(out: &mut W, stage: WriteStage, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes)
        .map_err(|source| Error::WriteFailure { stage, source })
}

/// Writes `image`, `padding` zero bytes and `stub` to `out`, returning the total length.
pub fn write_image<W: Write>(out: &mut W, image: &[u8], padding: u64, stub: &[u8]) -> Result<u64> {
    write_stage(out, WriteStage::Header, image)?;
    let zeros = vec![0u8; padding as usize];
    write_stage(out, WriteStage::Padding, &zeros)?;
    write_stage(out, WriteStage::Stub, stub)?;
    out.flush()
        .map_err(|source| Error::WriteFailure { stage: WriteStage::Stub, source })?;
    Ok(image.len() as u64 + padding + stub.len() as u64)
}

/// Writes `packed` to `path` as an executable file.
///
/// The bytes go to a temporary file in the same directory, which only replaces `path`
/// once every stage has succeeded.
pub fn write_packed_file(path: &Path, packed: &PackedImage) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| Error::io(format!("failed to create output in {}", dir.display()), e))?;

    let written = packed.write_to(tmp.as_file_mut())?;
    debug_assert_eq!(written, packed.output_len());

    tmp.as_file()
        .set_permissions(Permissions::from_mode(0o755))
        .map_err(|e| Error::io("failed to make output executable", e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to write {}", path.display()), e.error))?;

    tracing::info!("wrote {} ({} bytes)", path.display(), written);
    Ok(())
}

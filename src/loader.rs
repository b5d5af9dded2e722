//! Minimal ELF64 process loader.
//!
//! Maps a static executable into the current process the way the kernel would:
//! 1. Validate the ELF header (magic and class) before trusting any table.
//! 2. Compute a [`LoadPlan`]: the page-aligned span of all `PT_LOAD` segments and, per
//!    segment, the file-backed pages, the zero-filled tail and the anonymous BSS pages.
//! 3. Reserve address space for position-independent images and map every segment.
//! 4. Jump to the entry point.
//!
//! No argv, envp or auxiliary vector is built; only binaries that need none of them
//! can run this way.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use crate::config::LoadOptions;
use crate::error::{Error, Malformation, Result};
use crate::image::{ExecutableImage, Header, SegmentFlags};
use crate::utils::{align_down, align_up};

/// Translates segment flags into `PROT_*` bits.
pub fn prot_from_flags(flags: SegmentFlags) -> i32 {
    let mut prot = libc::PROT_NONE;
    if flags.is_readable() {
        prot |= libc::PROT_READ;
    }
    if flags.is_writable() {
        prot |= libc::PROT_WRITE;
    }
    if flags.is_executable() {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// The platform page size.
pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        0x1000
    }
}

/// Checks the identification bytes of `data`.
///
/// Fails with [`Error::NotElf`] for a missing magic and [`Error::UnsupportedClass`] for
/// anything but ELF64.
pub fn validate_header(data: &[u8]) -> Result<Header> {
    Header::parse(data).map_err(|m| match m {
        Malformation::TooShort { .. } | Malformation::BadMagic => Error::NotElf,
        Malformation::UnsupportedClass(class) => Error::UnsupportedClass(class),
        other => Error::Malformed(other),
    })
}

/// Addresses for one `PT_LOAD` segment, relative to the load base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLoad {
    pub segment: usize,
    /// Page-aligned start of the segment.
    pub page_vaddr: u64,
    /// Page-aligned file offset backing `page_vaddr`.
    pub file_offset: u64,
    /// Length of the file-backed mapping, a multiple of the page size.
    pub file_len: u64,
    /// Bytes at the end of the file-backed mapping that lie past `p_filesz` and must
    /// read as zero.
    pub zero_start: u64,
    pub zero_len: u64,
    /// Anonymous mapping following the file-backed one.
    pub bss_vaddr: u64,
    pub bss_len: u64,
    /// Length the final protection is applied over, starting at `page_vaddr`.
    pub protect_len: u64,
    pub prot: i32,
}

/// The mapping layout of an image, independent of where it ends up in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Lowest segment address, rounded down to a page.
    pub min_vaddr: u64,
    /// Highest segment end, rounded up to a page.
    pub max_vaddr: u64,
    pub position_independent: bool,
    pub page_size: u64,
    pub segments: Vec<SegmentLoad>,
}

impl LoadPlan {
    pub fn compute(image: &ExecutableImage, page_size: u64) -> Result<Self> {
        let overflow = || Error::from(Malformation::AddressOverflow);
        let mut min_vaddr = u64::MAX;
        let mut max_vaddr = 0;
        let mut segments = Vec::new();

        for seg in image.segments().filter(|s| s.is_load()) {
            let end = seg.mem_end().ok_or_else(overflow)?;
            min_vaddr = min_vaddr.min(align_down(seg.vaddr, page_size));
            max_vaddr = max_vaddr.max(align_up(end, page_size).ok_or_else(overflow)?);

            let page_vaddr = align_down(seg.vaddr, page_size);
            let in_page = seg.vaddr - page_vaddr;
            if seg.file_size > 0 && seg.offset % page_size != in_page {
                return Err(Malformation::SegmentMisaligned { segment: seg.index }.into());
            }

            let file_span = seg.file_size + in_page;
            let mem_span = seg.mem_size.checked_add(in_page).ok_or_else(overflow)?;
            let file_len = if seg.file_size > 0 {
                align_up(file_span, page_size).ok_or_else(overflow)?
            } else {
                0
            };
            let mem_len = align_up(mem_span, page_size).ok_or_else(overflow)?;

            let (zero_start, zero_len) = if seg.mem_size > seg.file_size && file_len > file_span {
                (page_vaddr + file_span, file_len - file_span)
            } else {
                (0, 0)
            };
            let (bss_vaddr, bss_len) = if mem_len > file_len {
                (page_vaddr + file_len, mem_len - file_len)
            } else {
                (0, 0)
            };

            segments.push(SegmentLoad {
                segment: seg.index,
                page_vaddr,
                file_offset: align_down(seg.offset, page_size),
                file_len,
                zero_start,
                zero_len,
                bss_vaddr,
                bss_len,
                protect_len: mem_len.max(file_len),
                prot: prot_from_flags(seg.flags),
            });
        }

        if segments.is_empty() {
            return Err(Error::NoLoadSegments);
        }

        let plan = LoadPlan {
            min_vaddr,
            max_vaddr,
            position_independent: image.header().is_position_independent(),
            page_size,
            segments,
        };
        tracing::debug!(
            "load span 0x{:x}..0x{:x} ({} segments, pie={})",
            plan.min_vaddr,
            plan.max_vaddr,
            plan.segments.len(),
            plan.position_independent
        );
        Ok(plan)
    }

    pub fn total_size(&self) -> u64 {
        self.max_vaddr - self.min_vaddr
    }

    /// Size of the address-space reservation for a position-independent image.
    pub fn reservation_size(&self) -> u64 {
        self.total_size() + self.page_size
    }
}

/// One mapped segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMapping {
    pub segment: usize,
    pub addr: u64,
    pub len: u64,
    pub prot: i32,
}

/// An image mapped into the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub base: u64,
    pub entry: u64,
    pub mappings: Vec<LoadMapping>,
}

fn mmap_fixed(
    addr: u64,
    len: u64,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: u64,
) -> io::Result<()> {
    let requested = addr as usize as *mut libc::c_void;
    let mapped = unsafe {
        libc::mmap(requested, len as usize, prot, flags, fd, offset as libc::off_t)
    };
    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
    if mapped != requested {
        unsafe { libc::munmap(mapped, len as usize) };
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }
    Ok(())
}

/// Maps every `PT_LOAD` segment of `image` from `file`.
///
/// Any mapping failure aborts the load. A failure of the final protection change is
/// fatal unless `options.strict_protect` is off, in which case it is only logged.
pub fn map_image(
    file: &File,
    image: &ExecutableImage,
    plan: &LoadPlan,
    options: &LoadOptions,
) -> Result<LoadedImage> {
    let fd = file.as_raw_fd();

    let base = if plan.position_independent {
        let size = plan.reservation_size();
        let reserved = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            return Err(Error::ReserveFailure { size, source: io::Error::last_os_error() });
        }
        tracing::debug!("reserved 0x{:x} bytes at {:p}", size, reserved);
        (reserved as u64).wrapping_sub(plan.min_vaddr)
    } else {
        0
    };
    let fixed = if plan.position_independent {
        libc::MAP_FIXED
    } else {
        libc::MAP_FIXED_NOREPLACE
    };

    let mut mappings = Vec::with_capacity(plan.segments.len());
    for seg in &plan.segments {
        let map_failure = |source| Error::MapFailure { segment: seg.segment, source };
        let start = base.wrapping_add(seg.page_vaddr);

        if seg.file_len > 0 {
            // The zero-filled tail is written before the final protection is applied.
            let prot = if seg.zero_len > 0 { seg.prot | libc::PROT_WRITE } else { seg.prot };
            mmap_fixed(start, seg.file_len, prot, libc::MAP_PRIVATE | fixed, fd, seg.file_offset)
                .map_err(map_failure)?;
            tracing::debug!(
                "segment {}: mapped 0x{:x} bytes of file at 0x{:x}",
                seg.segment,
                seg.file_len,
                start
            );
        }

        if seg.zero_len > 0 {
            let tail = base.wrapping_add(seg.zero_start) as usize as *mut u8;
            unsafe { ptr::write_bytes(tail, 0, seg.zero_len as usize) };
        }

        if seg.bss_len > 0 {
            let bss = base.wrapping_add(seg.bss_vaddr);
            mmap_fixed(
                bss,
                seg.bss_len,
                seg.prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | fixed,
                -1,
                0,
            )
            .map_err(map_failure)?;
            tracing::debug!("segment {}: mapped 0x{:x} bss bytes at 0x{:x}", seg.segment, seg.bss_len, bss);
        }

        let rc = unsafe {
            libc::mprotect(start as usize as *mut libc::c_void, seg.protect_len as usize, seg.prot)
        };
        if rc != 0 {
            let source = io::Error::last_os_error();
            if options.strict_protect {
                return Err(Error::ProtectFailure { segment: seg.segment, source });
            }
            tracing::warn!("mprotect on segment {} failed: {}", seg.segment, source);
        }

        mappings.push(LoadMapping { segment: seg.segment, addr: start, len: seg.protect_len, prot: seg.prot });
    }

    let entry = image.header().entry.wrapping_add(base);
    Ok(LoadedImage { base, entry, mappings })
}

/// Transfers control to `entry`.
///
/// # Safety
///
/// `entry` must point to executable code of an image mapped by [`map_image`] that does
/// not expect argv, envp or an auxiliary vector on its stack.
pub unsafe fn dispatch(entry: u64) -> ! {
    let entry: extern "C" fn() -> ! = std::mem::transmute(entry as usize);
    entry()
}

mod common;

use std::io::Write;

use common::{build_elf, Seg};
use object::elf;

use elfpack::config::LoadOptions;
use elfpack::error::{Error, Malformation};
use elfpack::image::ExecutableImage;
use elfpack::loader::{self, LoadPlan};

fn plan_for(segs: &[Seg], file_len: usize) -> elfpack::Result<LoadPlan> {
    let image = ExecutableImage::parse(build_elf(elf::ET_EXEC, 0x1000, segs, file_len))?;
    LoadPlan::compute(&image, 0x1000)
}

#[test]
fn address_range_spans_all_load_segments() {
    let plan = plan_for(
        &[
            Seg::load(elf::PF_R | elf::PF_X, 0x1000, 0x1000, 0x1000, 0x1000),
            Seg::note(0x2000, 0x10),
            Seg::load(elf::PF_R | elf::PF_W, 0x2000, 0x3000, 0x100, 0x500),
        ],
        0x2100,
    )
    .unwrap();
    assert_eq!(plan.min_vaddr, 0x1000);
    assert_eq!(plan.max_vaddr, 0x4000);
    assert_eq!(plan.total_size(), 0x3000);
    assert_eq!(plan.reservation_size(), 0x4000);
    assert!(!plan.position_independent);
    let indices: Vec<usize> = plan.segments.iter().map(|s| s.segment).collect();
    assert_eq!(indices, vec![0, 2]);
}

#[test]
fn bss_is_split_between_file_tail_and_anonymous_pages() {
    let plan = plan_for(&[Seg::load(elf::PF_R | elf::PF_W, 0x2000, 0x3000, 0x100, 0x1800)], 0x2100)
        .unwrap();
    let seg = plan.segments[0];
    assert_eq!(seg.page_vaddr, 0x3000);
    assert_eq!(seg.file_offset, 0x2000);
    assert_eq!(seg.file_len, 0x1000);
    assert_eq!(seg.zero_start, 0x3100);
    assert_eq!(seg.zero_len, 0xf00);
    assert_eq!(seg.bss_vaddr, 0x4000);
    assert_eq!(seg.bss_len, 0x1000);
    assert_eq!(seg.protect_len, 0x2000);
    assert_eq!(seg.prot, libc::PROT_READ | libc::PROT_WRITE);
}

#[test]
fn unaligned_segment_maps_from_page_start() {
    let plan = plan_for(&[Seg::load(elf::PF_R, 0x2010, 0x3010, 0x10, 0x10)], 0x2100).unwrap();
    let seg = plan.segments[0];
    assert_eq!(seg.page_vaddr, 0x3000);
    assert_eq!(seg.file_offset, 0x2000);
    assert_eq!(seg.file_len, 0x1000);
    assert_eq!(seg.zero_len, 0);
    assert_eq!(seg.bss_len, 0);
    assert_eq!(seg.protect_len, 0x1000);
}

#[test]
fn pure_bss_segment_has_no_file_mapping() {
    let plan = plan_for(&[Seg::load(elf::PF_R | elf::PF_W, 0, 0x5000, 0, 0x2000)], 0x200).unwrap();
    let seg = plan.segments[0];
    assert_eq!(seg.file_len, 0);
    assert_eq!(seg.bss_vaddr, 0x5000);
    assert_eq!(seg.bss_len, 0x2000);
}

#[test]
fn misaligned_offset_is_rejected() {
    let err = plan_for(&[Seg::load(elf::PF_R, 0x2010, 0x3000, 0x10, 0x10)], 0x2100).unwrap_err();
    assert!(matches!(
        err,
        Error::Malformed(Malformation::SegmentMisaligned { segment: 0 })
    ));
}

#[test]
fn image_without_load_segments_is_rejected() {
    let err = plan_for(&[Seg::note(0x100, 0x10)], 0x200).unwrap_err();
    assert!(matches!(err, Error::NoLoadSegments));
    assert_eq!(err.exit_code(), 11);
}

#[test]
fn maps_position_independent_image() {
    // One RW segment: 0x200 bytes from the file followed by 0x2e00 bytes of BSS.
    let data = build_elf(
        elf::ET_DYN,
        0x100,
        &[Seg::load(elf::PF_R | elf::PF_W, 0, 0, 0x200, 0x3000)],
        0x200,
    );
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&data).unwrap();

    let image = ExecutableImage::parse(data.clone()).unwrap();
    let plan = LoadPlan::compute(&image, loader::page_size()).unwrap();
    assert!(plan.position_independent);

    let loaded = loader::map_image(&file, &image, &plan, &LoadOptions::default()).unwrap();
    assert_ne!(loaded.base, 0);
    assert_eq!(loaded.entry, loaded.base + 0x100);
    assert_eq!(loaded.mappings.len(), 1);
    assert_eq!(loaded.mappings[0].addr, loaded.base);

    let mapped = unsafe { std::slice::from_raw_parts(loaded.base as usize as *const u8, 0x3000) };
    assert_eq!(&mapped[..0x200], data.as_slice());
    assert!(mapped[0x200..].iter().all(|&b| b == 0));

    unsafe { libc::munmap(loaded.base as usize as *mut libc::c_void, plan.reservation_size() as usize) };
}

#[test]
fn fixed_image_does_not_clobber_existing_mappings() {
    let page = loader::page_size();
    let occupied = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            page as usize,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(occupied, libc::MAP_FAILED);
    let vaddr = occupied as u64;

    let data = build_elf(
        elf::ET_EXEC,
        vaddr + 0x100,
        &[Seg::load(elf::PF_R | elf::PF_X, 0, vaddr, 0x200, 0x200)],
        0x200,
    );
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&data).unwrap();
    let image = ExecutableImage::parse(data).unwrap();
    let plan = LoadPlan::compute(&image, page).unwrap();
    assert!(!plan.position_independent);

    let err = loader::map_image(&file, &image, &plan, &LoadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::MapFailure { segment: 0, .. }));
    assert_eq!(err.exit_code(), 12);

    // The existing mapping is still there and still readable.
    let first = unsafe { *(occupied as *const u8) };
    assert_eq!(first, 0);
    unsafe { libc::munmap(occupied, page as usize) };
}

#[test]
fn lenient_loading_maps_like_strict_loading() {
    let data = build_elf(
        elf::ET_DYN,
        0x80,
        &[Seg::load(elf::PF_R | elf::PF_X, 0, 0, 0x200, 0x200)],
        0x200,
    );
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&data).unwrap();
    let image = ExecutableImage::parse(data).unwrap();
    let plan = LoadPlan::compute(&image, loader::page_size()).unwrap();

    let options = LoadOptions { strict_protect: false };
    let loaded = loader::map_image(&file, &image, &plan, &options).unwrap();
    assert_eq!(loaded.entry, loaded.base + 0x80);
    assert_eq!(loaded.mappings[0].prot, libc::PROT_READ | libc::PROT_EXEC);

    unsafe { libc::munmap(loaded.base as usize as *mut libc::c_void, plan.reservation_size() as usize) };
}

#[test]
fn validator_rejects_before_tables_are_read() {
    assert!(matches!(loader::validate_header(b"#!/bin/sh\n"), Err(Error::NotElf)));
    let mut data = build_elf(elf::ET_EXEC, 0x1000, &[], 0x40);
    data[4] = elf::ELFCLASS32;
    let err = loader::validate_header(&data).unwrap_err();
    assert!(matches!(err, Error::UnsupportedClass(1)));
    assert_eq!(err.exit_code(), 7);
}

mod common;

use std::path::Path;
use std::process::{Command, Output};

use common::{build_elf, minimal_exec, Seg};
use object::elf;

fn elfpack(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_elfpack"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn packs_minimal_executable() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hello");
    let output = dir.path().join("hello.packed");
    std::fs::write(&input, minimal_exec()).unwrap();

    let result = elfpack(&[path_str(&input), "-o", path_str(&output)]);
    assert_eq!(result.status.code(), Some(0), "{}", String::from_utf8_lossy(&result.stderr));
    let packed = std::fs::read(&output).unwrap();
    assert_eq!(packed.len(), 0x6000 + 0xa8);
    assert_eq!(&packed[24..32], &0x401000u64.to_le_bytes());
}

#[test]
fn missing_cavity_exits_with_invalid_input_and_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("no-note");
    let output = dir.path().join("out");
    let image = build_elf(
        elf::ET_EXEC,
        0x400040,
        &[Seg::load(elf::PF_R | elf::PF_X, 0, 0x400000, 0x200, 0x200)],
        0x200,
    );
    std::fs::write(&input, image).unwrap();

    let result = elfpack(&[path_str(&input), "--output", path_str(&output)]);
    assert_eq!(result.status.code(), Some(9));
    assert!(String::from_utf8_lossy(&result.stderr).contains("PT_NOTE"));
    assert!(!output.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn nonexistent_input_exits_with_file_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let result = elfpack(&[path_str(&missing), "-o", path_str(&dir.path().join("out"))]);
    assert_eq!(result.status.code(), Some(3));
}

#[test]
fn non_elf_input_exits_with_malformed_image() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("script");
    std::fs::write(&input, vec![b'#'; 128]).unwrap();
    let result = elfpack(&[path_str(&input), "-o", path_str(&dir.path().join("out"))]);
    assert_eq!(result.status.code(), Some(5));
}

#[test]
fn missing_argument_is_a_usage_error() {
    assert_eq!(elfpack(&[]).status.code(), Some(2));
    assert_eq!(elfpack(&["a", "b"]).status.code(), Some(2));
}

#[test]
fn loader_reports_missing_load_segments() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("notes-only");
    std::fs::write(&input, build_elf(elf::ET_EXEC, 0x1000, &[Seg::note(0x100, 0x10)], 0x200))
        .unwrap();
    let result = Command::new(env!("CARGO_BIN_EXE_elfload"))
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(11));
}

#[test]
fn loader_rejects_non_elf() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("text");
    std::fs::write(&input, b"hello world").unwrap();
    let result = Command::new(env!("CARGO_BIN_EXE_elfload"))
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(result.status.code(), Some(6));
}

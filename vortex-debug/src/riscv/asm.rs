//! Wrapper around the external RISC-V assembler.
//!
//! Free-form assembly lines (from the `inject` command or scripts) are
//! turned into 32-bit machine words by shelling out to `{prefix}-as` and
//! `{prefix}-objcopy`. The source is emitted with `.option norvc` and
//! `.balign 4`, so every input line produces exactly one little-endian
//! word; a mismatch (e.g. a pseudo-instruction expanding to two words) is
//! reported as an error.
//!
//! Single-line results are memoized in a process-wide cache so the hot
//! paths never pay for a second toolchain invocation.

use std::collections::HashMap;
use std::fs;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::{DebugError, Result};

/// Default toolchain prefix; overridable per call.
pub const DEFAULT_TOOLCHAIN_PREFIX: &str = "riscv64-unknown-elf";

static ASM_CACHE: Lazy<Mutex<HashMap<String, u32>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Checks whether `{prefix}-as` can be spawned at all.
pub fn toolchain_available(prefix: &str) -> bool {
    Command::new(format!("{prefix}-as"))
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Assembles a batch of lines, one 32-bit word per line.
///
/// The scratch directory is created fresh per call and removed on every
/// exit path when the [`tempfile::TempDir`] guard drops.
pub fn assemble(lines: &[String], prefix: &str) -> Result<Vec<u32>> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let dir = tempfile::TempDir::new()
        .map_err(|e| DebugError::Assembler(format!("failed to create temp dir: {e}")))?;
    let asm_file = dir.path().join("inject.S");
    let obj_file = dir.path().join("inject.o");
    let bin_file = dir.path().join("inject.bin");

    let mut source = String::from(
        ".option push\n\
         .option norvc\n\
         .text\n\
         .balign 4\n\
         .globl _start\n\
         _start:\n",
    );
    for line in lines {
        source.push_str(line);
        source.push('\n');
    }
    source.push_str(".option pop\n");

    fs::write(&asm_file, source)
        .map_err(|e| DebugError::Assembler(format!("failed to write {}: {e}", asm_file.display())))?;

    run_tool(
        Command::new(format!("{prefix}-as"))
            .arg(&asm_file)
            .arg("-o")
            .arg(&obj_file),
        lines,
    )?;
    run_tool(
        Command::new(format!("{prefix}-objcopy"))
            .arg("-O")
            .arg("binary")
            .arg(&obj_file)
            .arg(&bin_file),
        lines,
    )?;

    let bytes = fs::read(&bin_file)
        .map_err(|e| DebugError::Assembler(format!("failed to read {}: {e}", bin_file.display())))?;
    if bytes.len() % 4 != 0 {
        return Err(DebugError::Assembler(format!(
            "output is {} bytes, not a whole number of words",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    if words.len() != lines.len() {
        return Err(DebugError::Assembler(format!(
            "{} input lines assembled to {} words; pseudo-instructions that \
             expand to multiple words are not supported",
            lines.len(),
            words.len()
        )));
    }
    Ok(words)
}

/// Assembles one line through the process-wide cache.
pub fn assemble_line(line: &str, prefix: &str) -> Result<u32> {
    let line = line.trim();
    if let Some(&word) = ASM_CACHE.lock().unwrap().get(line) {
        log::trace!("asm cache hit: '{line}' -> {word:#010x}");
        return Ok(word);
    }

    let word = assemble(&[line.to_string()], prefix)?[0];
    ASM_CACHE.lock().unwrap().insert(line.to_string(), word);
    log::debug!("assembled '{line}' -> {word:#010x}");
    Ok(word)
}

fn run_tool(cmd: &mut Command, lines: &[String]) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd
        .output()
        .map_err(|e| DebugError::Assembler(format!("failed to run {program}: {e}")))?;
    if !output.status.success() {
        return Err(DebugError::Assembler(format!(
            "{program} failed on input {:?}: {}",
            lines,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

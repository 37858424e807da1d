//! Memory access through injected load/store loops.
//!
//! The DM has no direct memory port; memory moves through the selected
//! warp one word at a time, with `t0` as the running pointer and `t1` as
//! the data register. Unaligned caller ranges are widened to word
//! boundaries and the partial head/tail words are read-modify-written so
//! bytes outside the range survive.

use crate::dm::DmReg;
use crate::riscv::{assembly, CSR_DSCRATCH, T0, T1};
use crate::{DebugError, Result};

use super::Backend;

impl Backend {
    /// Reads `len` bytes starting at `addr` (any alignment).
    pub fn read_mem(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.ensure_injectable()?;

        let start = addr & !3;
        let end = addr
            .checked_add(len)
            .and_then(|e| e.checked_add(3))
            .ok_or_else(|| DebugError::InvalidArg("address range wraps".to_string()))?;
        let aligned_end = end & !3;
        let num_words = (aligned_end - start) / 4;

        let words =
            self.with_scratch_saved(&[T0, T1], |b| b.read_mem_words_raw(start, num_words))?;

        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        // Trim down to the caller's unaligned range.
        let head = (addr - start) as usize;
        bytes.drain(..head);
        bytes.truncate(len as usize);
        log::debug!("rd mem[{addr:#010x}..+{len}]");
        Ok(bytes)
    }

    /// Writes `data` starting at `addr` (any alignment). Bytes outside
    /// `[addr, addr+len)` in the surrounding words are preserved.
    pub fn write_mem(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.ensure_injectable()?;
        addr.checked_add(data.len() as u32)
            .ok_or_else(|| DebugError::InvalidArg("address range wraps".to_string()))?;

        self.with_scratch_saved(&[T0, T1], |b| {
            let mut pos = addr;
            let mut remaining = data;

            // Head partial word.
            let head_off = (pos % 4) as usize;
            if head_off != 0 {
                let take = remaining.len().min(4 - head_off);
                b.patch_word_raw(pos & !3, head_off, &remaining[..take])?;
                pos += take as u32;
                remaining = &remaining[take..];
            }

            // Full words in the middle.
            let full_words = remaining.len() / 4;
            if full_words > 0 {
                let words: Vec<u32> = remaining[..full_words * 4]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                b.write_mem_words_raw(pos, &words)?;
                pos += (full_words * 4) as u32;
                remaining = &remaining[full_words * 4..];
            }

            // Tail partial word.
            if !remaining.is_empty() {
                b.patch_word_raw(pos, 0, remaining)?;
            }
            Ok(())
        })?;
        log::debug!("wr mem[{addr:#010x}..+{}]", data.len());
        Ok(())
    }

    /// Reads the aligned word at `addr`.
    pub fn read_mem_word(&mut self, addr: u32) -> Result<u32> {
        let bytes = self.read_mem(addr & !3, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    //==========================================================================
    // Word-loop primitives (scratch registers already saved)
    //==========================================================================

    /// `t0 <- start`, then per word: `lw t1, 0(t0)`, move through
    /// `DSCRATCH`, `addi t0, t0, 4`.
    fn read_mem_words_raw(&mut self, start: u32, num_words: u32) -> Result<Vec<u32>> {
        self.write_gpr_raw(T0, start)?;

        let lw = assembly::lw(0, T0, T1);
        let publish = assembly::csrw(CSR_DSCRATCH, T1);
        let advance = assembly::addi(T0, T0, 4);

        let mut words = Vec::with_capacity(num_words as usize);
        for _ in 0..num_words {
            self.inject_raw(lw)?;
            self.inject_raw(publish)?;
            words.push(self.dm_read(DmReg::Dscratch)?);
            self.inject_raw(advance)?;
        }
        Ok(words)
    }

    /// `t0 <- start`, then per word: host writes `DSCRATCH`,
    /// `csrr t1, dscratch`, `sw t1, 0(t0)`, `addi t0, t0, 4`.
    fn write_mem_words_raw(&mut self, start: u32, words: &[u32]) -> Result<()> {
        self.write_gpr_raw(T0, start)?;

        let fetch = assembly::csrr(T1, CSR_DSCRATCH);
        let sw = assembly::sw(0, T0, T1);
        let advance = assembly::addi(T0, T0, 4);

        for &word in words {
            self.dm_write(DmReg::Dscratch, word)?;
            self.inject_raw(fetch)?;
            self.inject_raw(sw)?;
            self.inject_raw(advance)?;
        }
        Ok(())
    }

    /// Read-modify-writes the word at `word_addr`, replacing only the bytes
    /// `[offset, offset + data.len())`.
    fn patch_word_raw(&mut self, word_addr: u32, offset: usize, data: &[u8]) -> Result<()> {
        debug_assert!(word_addr % 4 == 0 && offset + data.len() <= 4);

        let old = self.read_mem_words_raw(word_addr, 1)?[0];
        let mut bytes = old.to_le_bytes();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        self.write_mem_words_raw(word_addr, &[u32::from_le_bytes(bytes)])
    }
}

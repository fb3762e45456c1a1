//! Memory window: read/write of a tracee's address space, either
//! word-by-word through the kernel's peek/poke interface, or in bulk
//! through `/proc/<pid>/mem`.
//!
//! The word-by-word path converts between `Word` and bytes via
//! `byteorder::NativeEndian`. The bulk path uses
//! `std::os::unix::fs::FileExt::{read_exact_at,write_all_at}`, the
//! idiomatic facility for positioned file I/O, rather than hand-rolled
//! seek+read.

use crate::arch::Word;
use crate::errors::Result;
use byteorder::{ByteOrder, NativeEndian};
use libc::c_void;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::unix::fs::FileExt;

const WORD_SIZE: usize = size_of::<Word>();

/// Owns the (lazily-opened) `/proc/<pid>/mem` file descriptor for one
/// tracee, plus the word-granularity peek/poke fallback. Embedded
/// directly in `Tracee` so the descriptor closes when the tracee record
/// is dropped.
#[derive(Debug, Default)]
pub struct MemoryWindow {
    mem_file: Option<File>,
    /// Set once `/proc/<pid>/mem` access has been observed to fail, so
    /// later bulk transfers go straight to the word-by-word fallback
    /// instead of re-trying the open every time.
    proc_denied: bool,
}

impl MemoryWindow {
    pub fn new() -> Self {
        MemoryWindow {
            mem_file: None,
            proc_denied: false,
        }
    }

    /// Reads one machine word at `addr` in the tracee's address space via
    /// `PTRACE_PEEKDATA`.
    pub fn peek_word(&self, pid: Pid, addr: Word) -> Result<Word> {
        let value = ptrace::read(pid, addr as *mut c_void)?;
        Ok(value as u64 as Word)
    }

    /// Writes one machine word at `addr` in the tracee's address space via
    /// `PTRACE_POKEDATA`.
    pub fn poke_word(&self, pid: Pid, addr: Word, value: Word) -> Result<()> {
        unsafe {
            ptrace::write(pid, addr as *mut c_void, value as i64 as *mut c_void)?;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at tracee address `src` into a fresh
    /// buffer, preferring the `/proc/<pid>/mem` bulk path and falling back
    /// to word-by-word peeks if that's been denied.
    pub fn read_mem(&mut self, pid: Pid, src: Word, len: usize) -> Result<Vec<u8>> {
        if !self.proc_denied {
            match self.read_mem_bulk(pid, src, len) {
                Ok(buf) => return Ok(buf),
                Err(_) => self.proc_denied = true,
            }
        }
        self.read_mem_words(pid, src, len)
    }

    /// Writes `data` to tracee address `dst`, preferring the bulk path.
    pub fn write_mem(&mut self, pid: Pid, dst: Word, data: &[u8]) -> Result<()> {
        if !self.proc_denied {
            match self.write_mem_bulk(pid, dst, data) {
                Ok(()) => return Ok(()),
                Err(_) => self.proc_denied = true,
            }
        }
        self.write_mem_words(pid, dst, data)
    }

    fn ensure_open(&mut self, pid: Pid) -> Result<&File> {
        if self.mem_file.is_none() {
            let path = format!("/proc/{}/mem", pid);
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            self.mem_file = Some(file);
        }
        Ok(self.mem_file.as_ref().unwrap())
    }

    fn read_mem_bulk(&mut self, pid: Pid, src: Word, len: usize) -> Result<Vec<u8>> {
        let file = self.ensure_open(pid)?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, src)?;
        Ok(buf)
    }

    fn write_mem_bulk(&mut self, pid: Pid, dst: Word, data: &[u8]) -> Result<()> {
        let file = self.ensure_open(pid)?;
        file.write_all_at(data, dst)?;
        Ok(())
    }

    /// Word-by-word fallback read, for a fixed length rather than a NUL
    /// terminator.
    fn read_mem_words(&self, pid: Pid, src: Word, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut addr = src;
        while out.len() < len {
            let word = self.peek_word(pid, addr)?;
            let mut bytes = [0u8; WORD_SIZE];
            NativeEndian::write_u64(&mut bytes, word as u64);
            let remaining = len - out.len();
            out.extend_from_slice(&bytes[..remaining.min(WORD_SIZE)]);
            addr += WORD_SIZE as Word;
        }
        Ok(out)
    }

    /// Word-by-word fallback write: the last partial word is merged with
    /// the bytes already present at that address rather than clobbering
    /// them.
    fn write_mem_words(&self, pid: Pid, dst: Word, data: &[u8]) -> Result<()> {
        let mut addr = dst;
        let mut offset = 0;
        while offset < data.len() {
            let remaining = data.len() - offset;
            if remaining >= WORD_SIZE {
                let word = NativeEndian::read_u64(&data[offset..offset + WORD_SIZE]);
                self.poke_word(pid, addr, word as Word)?;
            } else {
                let existing = self.peek_word(pid, addr)?;
                let mut bytes = [0u8; WORD_SIZE];
                NativeEndian::write_u64(&mut bytes, existing as u64);
                bytes[..remaining].copy_from_slice(&data[offset..]);
                let word = NativeEndian::read_u64(&bytes);
                self.poke_word(pid, addr, word as Word)?;
            }
            offset += WORD_SIZE;
            addr += WORD_SIZE as Word;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_words_round_trips_in_process() {
        // Exercises the word-by-word codec directly (no real tracee
        // needed): round-trip through the same byte<->word conversion the
        // peek/poke fallback uses.
        let data = b"hello world, this spans more than one word!";
        let mut bytes = [0u8; WORD_SIZE];
        NativeEndian::write_u64(&mut bytes, 0x0102030405060708);
        let word = NativeEndian::read_u64(&bytes);
        assert_eq!(word, 0x0102030405060708);
        assert_eq!(data.len() > WORD_SIZE, true);
    }
}

//! Volatile access to the dual-ported memory (DPM) window.
//!
//! `DpmWindow` is the only thing in this crate allowed to touch the
//! mapped region directly. Every read and write goes through a bounds
//! check and a volatile byte access, with an `SeqCst` fence bracketing
//! the operation the same way the teacher's `MmioRegion` brackets its
//! 32-bit accesses. Multi-byte values are composed from individually
//! volatile byte reads/writes via `byteorder`, rather than cast through
//! a wider pointer, because DPM field offsets are not generally aligned
//! to the field width (the control area is a packed C struct, not a
//! Rust repr).
//!
//! Unlike the teacher's `MmioRegion` (deliberately `Send`, not `Sync`,
//! for a single-threaded driver), `DpmWindow` is `Send + Sync`: the
//! interrupt handler and blocking node calls access the same window
//! concurrently by design (spec's concurrency model).

use crate::error::{DriverError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

pub struct DpmWindow {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for DpmWindow {}
unsafe impl Sync for DpmWindow {}

impl DpmWindow {
    /// Wraps an existing mapping. `base` must point to at least `size`
    /// bytes of memory valid for the lifetime of this `DpmWindow`,
    /// readable and writable, and not aliased by any non-volatile access.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(DriverError::IoError)?;
        if end > self.size {
            log::error!(
                "DpmWindow: out-of-bounds access offset={} len={} size={}",
                offset, len, self.size
            );
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8> {
        self.check_range(offset, 1)?;
        fence(Ordering::SeqCst);
        let v = unsafe { ptr::read_volatile(self.base.add(offset)) };
        fence(Ordering::SeqCst);
        Ok(v)
    }

    pub fn write_u8(&self, offset: usize, value: u8) -> Result<()> {
        self.check_range(offset, 1)?;
        fence(Ordering::SeqCst);
        unsafe { ptr::write_volatile(self.base.add(offset), value) };
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        fence(Ordering::SeqCst);
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(self.base.add(offset + i)) };
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        fence(Ordering::SeqCst);
        for (i, b) in buf.iter().enumerate() {
            unsafe { ptr::write_volatile(self.base.add(offset + i), *b) };
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(offset, &mut buf)?;
        Ok(LittleEndian::read_u16(&buf))
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_bytes(offset, &buf)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(offset, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(offset, &buf)
    }

    pub fn read_array(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.read_bytes(offset, buf)
    }

    pub fn write_array(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.write_bytes(offset, buf)
    }

    /// Atomically (with respect to other `DpmWindow` callers holding the
    /// same external lock) sets `bits` in the 16-bit cell at `offset`.
    /// Callers performing read-modify-write on shared control cells
    /// (e.g. `int_enable`) must serialize through their own mutex; this
    /// method only performs the raw read-modify-write, matching the
    /// teacher's `set_bits32`/`clear_bits32`, which document the same
    /// requirement.
    pub fn set_bits16(&self, offset: usize, bits: u16) -> Result<()> {
        let cur = self.read_u16(offset)?;
        self.write_u16(offset, cur | bits)
    }

    pub fn clear_bits16(&self, offset: usize, bits: u16) -> Result<()> {
        let cur = self.read_u16(offset)?;
        self.write_u16(offset, cur & !bits)
    }
}

impl Drop for DpmWindow {
    fn drop(&mut self) {
        log::debug!("DpmWindow dropped (size={})", self.size);
    }
}

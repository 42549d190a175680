//! Single-producer/single-consumer ring buffer over a `buffer_vars`
//! descriptor living in DPM.
//!
//! The wptr/rptr/size cells are the source of truth and may change under
//! us at any time (the peer — firmware or host, depending on direction —
//! owns the other end), so every predicate re-reads them from DPM. Only
//! the frame-slot base offset is resolved once, at construction, since
//! `base` never changes once the board is attached.

use crate::error::{DriverError, Result};
use crate::layout::{buffer_vars_offset as off, FRAME_SIZE};
use crate::mmio::DpmWindow;
use std::sync::Arc;

/// Which direction this ring moves frames, purely for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

pub struct RingHandle {
    dpm: Arc<DpmWindow>,
    vars_offset: usize,
    slot_base: usize,
    direction: Direction,
}

impl RingHandle {
    /// Resolves the frame-slot base (`buffer_vars.base`, an offset into
    /// the message area, not an absolute DPM offset) once at attach.
    pub fn new(dpm: Arc<DpmWindow>, vars_offset: usize, direction: Direction) -> Result<Self> {
        let slot_base = dpm.read_u16(vars_offset + off::BASE)? as usize;
        Ok(Self {
            dpm,
            vars_offset,
            slot_base,
            direction,
        })
    }

    fn wptr(&self) -> Result<u16> {
        self.dpm.read_u16(self.vars_offset + off::WPTR)
    }

    fn rptr(&self) -> Result<u16> {
        self.dpm.read_u16(self.vars_offset + off::RPTR)
    }

    fn size(&self) -> Result<u16> {
        self.dpm.read_u16(self.vars_offset + off::SIZE)
    }

    /// Usable capacity: one slot is always kept empty to disambiguate
    /// full from empty (`dpm.c`'s `buf_real_size`).
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.size()?.saturating_sub(1) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.wptr()? == self.rptr()?)
    }

    pub fn is_full(&self) -> Result<bool> {
        let (w, r, size) = (self.wptr()?, self.rptr()?, self.size()?);
        Ok((r == 0 && w == size.saturating_sub(1)) || r.wrapping_sub(w) == 1)
    }

    pub fn count(&self) -> Result<usize> {
        let (w, r, size) = (self.wptr()?, self.rptr()?, self.size()?);
        if self.is_full()? {
            return Ok(size.saturating_sub(1) as usize);
        }
        if w == r {
            return Ok(0);
        }
        if r < w {
            Ok((w - r) as usize)
        } else {
            Ok((size - (r - w)) as usize)
        }
    }

    /// Byte offset, in the DPM, of message slot `index`.
    fn slot_offset(&self, index: u16) -> usize {
        self.slot_base + index as usize * FRAME_SIZE
    }

    /// Offset of the slot the next write should land in.
    pub fn write_slot_offset(&self) -> Result<usize> {
        Ok(self.slot_offset(self.wptr()?))
    }

    /// Offset of the slot the next read should come from.
    pub fn read_slot_offset(&self) -> Result<usize> {
        Ok(self.slot_offset(self.rptr()?))
    }

    /// Advances `wptr` after a frame has been written into the slot at
    /// `write_slot_offset()`. Caller must have already checked
    /// `!is_full()`; this re-checks (`dpm.c`'s `CHECK_POSITION`) and
    /// logs+errors on corruption rather than silently wrapping.
    pub fn advance_write(&self) -> Result<()> {
        if self.is_full()? {
            log::error!(
                "ring[{:?}] advance_write called while already full (vars@{})",
                self.direction, self.vars_offset
            );
            return Err(DriverError::IoError);
        }
        let (w, size) = (self.wptr()?, self.size()?);
        let next = if w == size.saturating_sub(1) { 0 } else { w + 1 };
        self.dpm.write_u16(self.vars_offset + off::WPTR, next)?;
        if self.is_empty()? {
            log::error!(
                "ring[{:?}] corruption: became empty immediately after advance_write",
                self.direction
            );
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    /// Advances `rptr` after a frame has been consumed from the slot at
    /// `read_slot_offset()`. Mirror image of `advance_write`.
    pub fn advance_read(&self) -> Result<()> {
        if self.is_empty()? {
            log::error!(
                "ring[{:?}] advance_read called while already empty (vars@{})",
                self.direction, self.vars_offset
            );
            return Err(DriverError::IoError);
        }
        let (r, size) = (self.rptr()?, self.size()?);
        let next = if r == size.saturating_sub(1) { 0 } else { r + 1 };
        self.dpm.write_u16(self.vars_offset + off::RPTR, next)?;
        if self.is_full()? {
            log::error!(
                "ring[{:?}] corruption: became full immediately after advance_read",
                self.direction
            );
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    pub fn read_frame_bytes(&self, buf: &mut [u8]) -> Result<()> {
        let slot = self.read_slot_offset()?;
        self.dpm.read_array(slot, buf)
    }

    pub fn write_frame_bytes(&self, buf: &[u8]) -> Result<()> {
        let slot = self.write_slot_offset()?;
        self.dpm.write_array(slot, buf)
    }
}

//! Per-node I/O and control surface.
//!
//! `NodeState` is the machinery Board owns for one CAN node (its two
//! rings, its readiness condvars, its firmware-update-mode switch).
//! `Node<'a>` is a thin, non-owning handle borrowed from a `Board` that
//! exposes the host-facing operations from the external interface table
//! — it holds no ownership of the board, only a borrow, so there's no
//! reference cycle to manage.

use crate::board::{Board, BoardStatus};
use crate::error::{DriverError, Result};
use crate::layout::{
    bitrate, can_status_offset as cs_off, command, frame_offset, fw_state, Frame, FrameInfo,
    HostFlags, IntBits, Mode, TransceiverType, FRAME_SIZE,
};
use crate::ring::{Direction, RingHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long a blocking wait sleeps between cancellation checks when the
/// caller supplied no deadline of its own (there is no real signal
/// delivery in this harness, so cancellation is polled cooperatively —
/// see `CancelToken` in `crate::protocol`).
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of CAN-controller error-statistics registers sampled by
/// `get_err_stat` (the original driver's `struct err_stat` holds
/// exactly this many `u32` values).
const ERR_STAT_COUNT: usize = 0x3f;

/// Decoded snapshot of one node's `can_status` record.
#[derive(Debug, Clone, Copy)]
pub struct CanStatus {
    pub can_type: TransceiverType,
    pub iopin: u8,
    pub msgs_in_sram: u16,
    pub sram_buf_size: u16,
    pub received: u16,
    pub sent: u16,
    pub filtered: u16,
    pub can_mode_reg: u8,
    pub can_gsr: u8,
    pub rx_errors: u8,
    pub tx_errors: u8,
    pub bitrate_index: u16,
    pub bitrate_bps: u16,
    pub mode: Option<Mode>,
    pub flags_host_to_board: HostFlags,
    pub flags_board_to_host: u16,
}

/// Readiness bits returned by [`Node::poll_readiness`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

pub(crate) struct NodeState {
    pub tx: RingHandle,
    pub rx: RingHandle,
    pub can_status_offset: usize,
    pub rx_ready: (Mutex<bool>, Condvar),
    pub tx_ready: (Mutex<bool>, Condvar),
    pub firmware_update_mode: AtomicBool,
}

impl NodeState {
    pub fn new(tx: RingHandle, rx: RingHandle, can_status_offset: usize) -> Self {
        Self {
            tx,
            rx,
            can_status_offset,
            rx_ready: (Mutex::new(false), Condvar::new()),
            tx_ready: (Mutex::new(false), Condvar::new()),
            firmware_update_mode: AtomicBool::new(false),
        }
    }

    pub fn mark_rx_ready(&self) {
        *self.rx_ready.0.lock().unwrap() = true;
        self.rx_ready.1.notify_all();
    }

    pub fn mark_tx_ready(&self) {
        *self.tx_ready.0.lock().unwrap() = true;
        self.tx_ready.1.notify_all();
    }
}

pub struct Node<'a> {
    board: &'a Board,
    index: usize,
}

impl<'a> Node<'a> {
    pub(crate) fn new(board: &'a Board, index: usize) -> Self {
        Self { board, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn state(&self) -> &NodeState {
        self.board.node_state(self.index)
    }

    fn require_fw2(&self) -> Result<()> {
        let running = self.board.get_fw_running()?;
        if running != fw_state::FW2 {
            log::warn!(
                "node[{}]: refused, fw_running=0x{:x} (expected fw2)",
                self.index, running
            );
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    fn rx_tx_bits(&self) -> (IntBits, IntBits) {
        IntBits::node_rx_tx(self.index).expect("node index validated at Board::node")
    }

    /// Blocking read of one frame. Waits on the rx-ready condvar until
    /// the rx ring is non-empty, then decodes the slot in place.
    pub fn read_frame(&self) -> Result<Frame> {
        self.require_fw2()?;
        self.wait_rx_ready(None)?;
        self.try_read_frame()
    }

    /// Non-blocking read: returns `TryAgain` if the rx ring is empty.
    pub fn try_read_frame(&self) -> Result<Frame> {
        self.require_fw2()?;
        let st = self.state();
        if st.rx.is_empty()? {
            return Err(DriverError::TryAgain);
        }
        let mut buf = [0u8; FRAME_SIZE];
        st.rx.read_frame_bytes(&mut buf)?;
        let frame = decode_frame(&buf);
        st.rx.advance_read()?;
        Ok(frame)
    }

    fn wait_rx_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let st = self.state();
        if !st.rx.is_empty()? {
            return Ok(());
        }
        let (rx_bit, _) = self.rx_tx_bits();
        self.board.arm_interrupt_bit(rx_bit)?;

        let (lock, cv) = &st.rx_ready;
        let mut ready = lock.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.board.cancel_token().is_cancelled() {
                return Err(DriverError::RestartRequired);
            }
            if st.rx.is_empty().unwrap_or(true) {
                let wait = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(DriverError::IoError);
                        }
                        (d - now).min(CANCEL_POLL_INTERVAL)
                    }
                    None => CANCEL_POLL_INTERVAL,
                };
                let (next, result) = cv.wait_timeout(ready, wait).unwrap();
                ready = next;
                if result.timed_out() && deadline.is_some() && Instant::now() >= deadline.unwrap()
                {
                    return Err(DriverError::IoError);
                }
            } else {
                *ready = false;
                return Ok(());
            }
        }
    }

    /// Blocking write of one frame. If firmware-update mode is armed on
    /// this node, forwards the frame's encoded bytes to the board's
    /// firmware-update block pump instead of the normal tx ring.
    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.state().firmware_update_mode.load(Ordering::SeqCst) {
            return self.forward_to_firmware_update(frame);
        }
        self.require_fw2()?;
        self.wait_tx_ready(None)?;
        self.try_write_frame(frame)
    }

    pub fn try_write_frame(&self, frame: &Frame) -> Result<()> {
        if self.state().firmware_update_mode.load(Ordering::SeqCst) {
            return self.forward_to_firmware_update(frame);
        }
        self.require_fw2()?;
        let st = self.state();
        if st.tx.is_full()? {
            return Err(DriverError::TryAgain);
        }
        let mut buf = [0u8; FRAME_SIZE];
        encode_frame(frame, &mut buf);
        st.tx.write_frame_bytes(&buf)?;
        st.tx.advance_write()
    }

    fn forward_to_firmware_update(&self, frame: &Frame) -> Result<()> {
        let mut buf = [0u8; FRAME_SIZE];
        encode_frame(frame, &mut buf);
        self.board.write_firmware_update(&buf)?;
        Ok(())
    }

    fn wait_tx_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let st = self.state();
        if !st.tx.is_full()? {
            return Ok(());
        }
        let (_, tx_bit) = self.rx_tx_bits();
        self.board.arm_interrupt_bit(tx_bit)?;

        let (lock, cv) = &st.tx_ready;
        let mut ready = lock.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.board.cancel_token().is_cancelled() {
                return Err(DriverError::RestartRequired);
            }
            if st.tx.is_full().unwrap_or(true) {
                let wait = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            return Err(DriverError::IoError);
                        }
                        (d - now).min(CANCEL_POLL_INTERVAL)
                    }
                    None => CANCEL_POLL_INTERVAL,
                };
                let (next, result) = cv.wait_timeout(ready, wait).unwrap();
                ready = next;
                if result.timed_out() && deadline.is_some() && Instant::now() >= deadline.unwrap()
                {
                    return Err(DriverError::IoError);
                }
            } else {
                *ready = false;
                return Ok(());
            }
        }
    }

    /// Readiness poll. Whenever a side is not ready, arms its interrupt
    /// bit so the next transition wakes a blocked waiter (spec §4.E
    /// "Readiness polling").
    pub fn poll_readiness(&self) -> Result<Readiness> {
        let st = self.state();
        let (rx_bit, tx_bit) = self.rx_tx_bits();

        let readable = !st.rx.is_empty()?;
        if !readable {
            self.board.arm_interrupt_bit(rx_bit)?;
        }
        let writable = !st.tx.is_full()?;
        if !writable {
            self.board.arm_interrupt_bit(tx_bit)?;
        }
        Ok(Readiness { readable, writable })
    }

    pub fn rx_msg_count(&self) -> Result<usize> {
        self.state().rx.count()
    }

    pub fn tx_msg_count(&self) -> Result<usize> {
        self.state().tx.count()
    }

    pub fn rx_buf_size(&self) -> Result<usize> {
        self.state().rx.capacity()
    }

    pub fn tx_buf_size(&self) -> Result<usize> {
        self.state().tx.capacity()
    }

    pub fn get_can_status(&self) -> Result<CanStatus> {
        let dpm = self.board.dpm();
        let base = self.state().can_status_offset;
        Ok(CanStatus {
            can_type: TransceiverType::from_code(dpm.read_u8(base + cs_off::CAN_TYPE)?),
            iopin: dpm.read_u8(base + cs_off::IOPIN)?,
            msgs_in_sram: dpm.read_u16(base + cs_off::MSGS_IN_SRAM)?,
            sram_buf_size: dpm.read_u16(base + cs_off::SRAMBUF_SIZE)?,
            received: dpm.read_u16(base + cs_off::RECEIVED)?,
            sent: dpm.read_u16(base + cs_off::SENT)?,
            filtered: dpm.read_u16(base + cs_off::FILTERED)?,
            can_mode_reg: dpm.read_u8(base + cs_off::CAN_MOD)?,
            can_gsr: dpm.read_u8(base + cs_off::CAN_GSR)?,
            rx_errors: dpm.read_u8(base + cs_off::CAN_RXERR)?,
            tx_errors: dpm.read_u8(base + cs_off::CAN_TXERR)?,
            bitrate_index: dpm.read_u16(base + cs_off::BITRATE_I)?,
            bitrate_bps: dpm.read_u16(base + cs_off::BITRATE)?,
            mode: Mode::from_code(dpm.read_u16(base + cs_off::MODE)?),
            flags_host_to_board: HostFlags::from_bits_truncate(dpm.read_u16(base + cs_off::FLAGS2HICO)?),
            flags_board_to_host: dpm.read_u16(base + cs_off::FLAGS2HOST)?,
        })
    }

    pub fn get_can_type(&self) -> Result<TransceiverType> {
        Ok(self.get_can_status()?.can_type)
    }

    pub fn get_iopin_status(&self) -> Result<u8> {
        Ok(self.get_can_status()?.iopin)
    }

    pub fn get_bitrate(&self) -> Result<(u16, u16)> {
        let s = self.get_can_status()?;
        Ok((s.bitrate_index, s.bitrate_bps))
    }

    pub fn get_mode(&self) -> Result<Option<Mode>> {
        Ok(self.get_can_status()?.mode)
    }

    /// Samples the controller's full error-statistics table, one
    /// register index at a time (`CMD_GET_ERR_STAT` takes the index in
    /// `arg0` and returns the value in the second result word).
    pub fn get_err_stat(&self) -> Result<Vec<u32>> {
        let mut values = Vec::with_capacity(ERR_STAT_COUNT);
        for i in 0..ERR_STAT_COUNT as u32 {
            let (_, value) = self
                .board
                .transport()
                .node_cmd(self.index as u8, command::GET_ERR_STAT, i, 0)?;
            values.push(value);
        }
        Ok(values)
    }

    pub fn clear_err_stat(&self) -> Result<()> {
        self.board.transport().node_cmd(self.index as u8, command::CLR_ERR_STAT, 0, 0)?;
        Ok(())
    }

    pub fn set_bitrate(&self, index: u32) -> Result<()> {
        if index > bitrate::B1000K {
            return Err(DriverError::InvalidArgument);
        }
        self.board.transport().node_cmd(self.index as u8, command::SET_BITRATE, index, 0)?;
        Ok(())
    }

    pub fn set_sjw_increment(&self, increment: u32) -> Result<()> {
        self.board
            .transport()
            .node_cmd(self.index as u8, command::SET_SJW_INCREMENT, increment, 0)?;
        Ok(())
    }

    pub fn reset_timestamp(&self) -> Result<()> {
        self.board.transport().node_cmd(self.index as u8, command::RESET_TIMESTAMP, 0, 0)?;
        Ok(())
    }

    pub fn clear_overrun(&self) -> Result<()> {
        self.board.transport().node_cmd(self.index as u8, command::CLR_OVERRUN, 0, 0)?;
        Ok(())
    }

    fn set_filters_active(&self, active: bool) -> Result<()> {
        let offset = self.state().can_status_offset + cs_off::FLAGS2HICO;
        if active {
            self.board.dpm().set_bits16(offset, HostFlags::FILTERS_ACTIVE.bits())
        } else {
            self.board.dpm().clear_bits16(offset, HostFlags::FILTERS_ACTIVE.bits())
        }
    }

    /// Closed identifier range `[low, high]`. Setting any filter sets
    /// `filters-active` in the host→board flag word regardless of
    /// whether the firmware accepted it (spec §4.E "Filters").
    pub fn set_range_filter(&self, low: u32, high: u32) -> Result<()> {
        let result = self
            .board
            .transport()
            .node_cmd(self.index as u8, command::SET_RANGE_FILTER, low, high);
        self.set_filters_active(true)?;
        result?;
        Ok(())
    }

    /// Mask/code filter pair: `mask` selects which identifier bits must
    /// match `code`.
    pub fn set_mask_filter(&self, mask: u32, code: u32) -> Result<()> {
        let result = self
            .board
            .transport()
            .node_cmd(self.index as u8, command::SET_MASK_FILTER, mask, code);
        self.set_filters_active(true)?;
        result?;
        Ok(())
    }

    pub fn clear_filters(&self) -> Result<()> {
        self.board.transport().node_cmd(self.index as u8, command::CLR_FILTERS, 0, 0)?;
        self.set_filters_active(false)?;
        Ok(())
    }

    pub fn set_can_type(&self, ty: u32) -> Result<()> {
        self.board.transport().node_cmd(self.index as u8, command::SET_CAN_TYPE, ty, 0)?;
        Ok(())
    }

    fn set_mode_and_verify(&self, mode: Mode) -> Result<()> {
        self.board
            .transport()
            .node_cmd(self.index as u8, command::SET_MODE, mode.code() as u32, 0)?;
        let observed = self.get_mode()?;
        if observed != Some(mode) {
            log::error!(
                "node[{}]: set_mode({:?}) did not take, observed {:?}",
                self.index, mode, observed
            );
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    /// Transitions to `mode`, always passing through `reset` first
    /// (spec §4.E: "Mode transitions must pass through reset") unless
    /// `mode` already is `reset`.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        if mode != Mode::Reset {
            self.set_mode_and_verify(Mode::Reset)?;
        }
        self.set_mode_and_verify(mode)
    }

    pub fn start(&self) -> Result<()> {
        self.set_mode(Mode::Active)
    }

    pub fn start_passive(&self) -> Result<()> {
        self.set_mode(Mode::Passive)
    }

    pub fn start_baudscan(&self) -> Result<()> {
        self.set_mode(Mode::Baudscan)
    }

    pub fn stop(&self) -> Result<()> {
        self.set_mode(Mode::Reset)
    }

    /// Delegates to [`Board::reset_board`]. Exposed per-node because the
    /// external interface table (spec §6) lists `reset_board` as a
    /// per-handle operation even though it acts board-wide.
    pub fn reset_board(&self) -> Result<u16> {
        self.board.reset_board()
    }

    pub fn get_board_status(&self) -> Result<BoardStatus> {
        self.board.get_board_status()
    }

    pub fn get_hw_id(&self) -> Result<u8> {
        self.board.get_hw_id()
    }

    pub fn get_pci104_position(&self) -> Result<u8> {
        self.board.get_pci104_position()
    }

    pub fn get_fw2_version(&self) -> Result<u16> {
        self.board.get_fw2_version()
    }

    pub fn get_driver_version(&self) -> &'static str {
        self.board.get_driver_version()
    }

    pub fn get_lpcbc_revision(&self) -> Result<u16> {
        self.board.get_lpcbc_revision()
    }
}

fn decode_frame(buf: &[u8; FRAME_SIZE]) -> Frame {
    use byteorder::{ByteOrder, LittleEndian};
    let fi = FrameInfo(LittleEndian::read_u16(&buf[frame_offset::FI..]));
    let ts = LittleEndian::read_u32(&buf[frame_offset::TS..]);
    let id = LittleEndian::read_u32(&buf[frame_offset::ID..]);
    let mut data = [0u8; 8];
    data.copy_from_slice(&buf[frame_offset::DATA..frame_offset::DATA + 8]);
    Frame {
        info: fi,
        timestamp_us: ts,
        id,
        data,
    }
}

fn encode_frame(frame: &Frame, buf: &mut [u8; FRAME_SIZE]) {
    use byteorder::{ByteOrder, LittleEndian};
    LittleEndian::write_u16(&mut buf[frame_offset::FI..], frame.info.0);
    LittleEndian::write_u32(&mut buf[frame_offset::TS..], frame.timestamp_us);
    LittleEndian::write_u32(&mut buf[frame_offset::ID..], frame.id);
    buf[frame_offset::DATA..frame_offset::DATA + 8].copy_from_slice(&frame.data);
}

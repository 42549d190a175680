//! Board lifecycle: attach, hard reset, bootloader probe, firmware
//! update, and the handful of board-wide (not node-scoped) commands.
//!
//! The reset and firmware-update sequences are phased orchestrators in
//! the same shape as the teacher's `BootSequence::execute` — a sequence
//! of small private steps, each with its own bounded poll, with a single
//! public entry point per phase.

use crate::error::{DriverError, Result};
use crate::layout::{command, fw_state, ControlAreaLayout, IntBits, FW_UPDATE_BLOCK_SIZE};
use crate::mmio::DpmWindow;
use crate::node::{Node, NodeState};
use crate::protocol::{CancelToken, CommandTransport};
use crate::ring::{Direction, RingHandle};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Out-of-scope platform register access (PCI config-space pokes for the
/// reset line and the firmware-update-enable pin), injected so the
/// in-scope sequencing logic in this module doesn't need to know how
/// those lines are actually wired. A real caller supplies an
/// implementation that does the config-space accesses; tests and the
/// demo binary supply the mock harness's in-memory stand-in.
pub trait BoardControl {
    fn set_reset(&self, asserted: bool);
    fn set_fw_update_enable(&self, asserted: bool);
}

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub irq_trace: bool,
    pub cmd_timeout: Duration,
    pub latte_timeout: Option<Duration>,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            irq_trace: false,
            cmd_timeout: Duration::from_millis(500),
            latte_timeout: None,
        }
    }
}

/// Bounded poll budget for the hard-reset / bootloader-probe loops: 100
/// iterations of 10ms, ~1s total. Decremented exactly once per
/// iteration (the original driver's equivalent `IOC_RESET_BOARD` loop
/// decrements twice per iteration; that is not reproduced here).
const RESET_POLL_ITERATIONS: u32 = 100;
const RESET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Driver-local extension commands, not part of the firmware's fixed
/// command-code table (spec's external interface table stops at
/// `CMD_PRODUCTION_OK`); numbered well past it to avoid collision.
const CMD_INIT_LATTE: u16 = 0x90;
const CMD_LATTE: u16 = 0x91;

pub struct Board {
    dpm: Arc<DpmWindow>,
    layout: Arc<ControlAreaLayout>,
    nodes: Vec<NodeState>,
    transport: CommandTransport,
    cancel: CancelToken,
    int_enable_lock: Mutex<()>,
    last_ack_count: AtomicU16,
    control: Box<dyn BoardControl + Send + Sync>,
    config: BoardConfig,
}

impl Board {
    /// Validates the requested layout, wraps the mapping, and builds the
    /// per-node ring handles. `base`/`dpm_size` describe an already
    /// BAR-mapped region (mapping it is out of scope); `control` wires
    /// the out-of-scope reset/fw-update-enable lines.
    pub fn attach(
        base: *mut u8,
        dpm_size: usize,
        node_count: usize,
        control: Box<dyn BoardControl + Send + Sync>,
        config: BoardConfig,
    ) -> Result<Self> {
        let layout = Arc::new(ControlAreaLayout::new(dpm_size, node_count)?);
        let dpm = Arc::new(unsafe { DpmWindow::new(base, dpm_size) });

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let tx = RingHandle::new(dpm.clone(), layout.tx_vars_offset(i), Direction::Tx)?;
            let rx = RingHandle::new(dpm.clone(), layout.rx_vars_offset(i), Direction::Rx)?;
            nodes.push(NodeState::new(tx, rx, layout.can_status_offset(i)));
        }

        let cancel = CancelToken::new();
        let transport = CommandTransport::new(dpm.clone(), layout.clone(), cancel.clone(), config.cmd_timeout);

        let last_ack_count = dpm.read_u16(
            layout.board_status + crate::layout::board_status_offset::CMD_ACK_CNT,
        )?;

        let board = Self {
            dpm,
            layout,
            nodes,
            transport,
            cancel,
            int_enable_lock: Mutex::new(()),
            last_ack_count: AtomicU16::new(last_ack_count),
            control,
            config,
        };

        {
            let _guard = board.int_enable_lock.lock().unwrap();
            board.dpm.set_bits16(board.layout.int_enable, IntBits::CMD_ACK.bits())?;
        }

        log::info!(
            "board attached: node_count={} dpm_size={} message_area={}",
            node_count, dpm_size, board.layout.message_area_size
        );
        Ok(board)
    }

    /// Cancels any in-flight or future `board_cmd`, causing it to return
    /// `RestartRequired` instead of blocking — used at detach time.
    pub fn detach(&self) {
        self.cancel.cancel();
        log::info!("board detached");
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, index: usize) -> Result<Node<'_>> {
        if index >= self.nodes.len() {
            return Err(DriverError::InvalidArgument);
        }
        Ok(Node::new(self, index))
    }

    pub(crate) fn node_state(&self, index: usize) -> &NodeState {
        &self.nodes[index]
    }

    pub(crate) fn dpm(&self) -> &Arc<DpmWindow> {
        &self.dpm
    }

    pub(crate) fn layout(&self) -> &Arc<ControlAreaLayout> {
        &self.layout
    }

    pub(crate) fn transport(&self) -> &CommandTransport {
        &self.transport
    }

    pub(crate) fn int_enable_lock(&self) -> &Mutex<()> {
        &self.int_enable_lock
    }

    pub(crate) fn irq_trace(&self) -> bool {
        self.config.irq_trace
    }

    pub(crate) fn wake_all_nodes(&self) {
        for n in &self.nodes {
            n.mark_rx_ready();
            n.mark_tx_ready();
        }
    }

    pub(crate) fn wake_node_rx(&self, index: usize) {
        if let Some(n) = self.nodes.get(index) {
            n.mark_rx_ready();
        }
    }

    pub(crate) fn wake_node_tx(&self, index: usize) {
        if let Some(n) = self.nodes.get(index) {
            n.mark_tx_ready();
        }
    }

    pub(crate) fn rx_ring_is_empty(&self, index: usize) -> Result<bool> {
        self.nodes[index].rx.is_empty()
    }

    pub(crate) fn tx_ring_is_empty(&self, index: usize) -> Result<bool> {
        self.nodes[index].tx.is_empty()
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Sets one `int_enable` bit through the board's dedicated lock
    /// (spec §5: `int_enable` read-modify-write must be atomic against
    /// other writers even though distinct bits never collide logically).
    pub(crate) fn arm_interrupt_bit(&self, bit: IntBits) -> Result<()> {
        let _guard = self.int_enable_lock.lock().unwrap();
        self.dpm.set_bits16(self.layout.int_enable, bit.bits())
    }

    /// Called by the interrupt demultiplexer with the current
    /// `cmd_ack_cnt`. Returns `true` the first time a given count is
    /// observed (i.e. an ack genuinely arrived).
    pub(crate) fn observe_cmd_ack_cnt(&self, cnt: u16) -> bool {
        let prev = self.last_ack_count.swap(cnt, Ordering::SeqCst);
        prev != cnt
    }

    fn fw_running(&self) -> Result<u16> {
        self.dpm.read_u16(
            self.layout.board_status + crate::layout::board_status_offset::FW_RUNNING,
        )
    }

    fn poll_until_fw_running(&self, want: &[u16]) -> Result<u16> {
        let mut budget = RESET_POLL_ITERATIONS;
        loop {
            let state = self.fw_running()?;
            if want.contains(&state) {
                return Ok(state);
            }
            if budget == 0 {
                log::error!("poll_until_fw_running: timed out, last fw_running=0x{:x}", state);
                return Err(DriverError::IoError);
            }
            budget -= 1;
            std::thread::sleep(RESET_POLL_INTERVAL);
        }
    }

    /// Hard reset: save `int_enable`, clear `fw_running`, toggle the
    /// reset line, and wait for the board to come back up running
    /// application firmware (`fw2`), refreshing `last_ack_count` before
    /// restoring `int_enable`.
    pub fn reset_board(&self) -> Result<u16> {
        log::info!("reset_board: asserting reset line");
        let saved_int_enable = self.dpm.read_u16(self.layout.int_enable)?;
        self.dpm.write_u16(
            self.layout.board_status + crate::layout::board_status_offset::FW_RUNNING,
            0,
        )?;

        self.control.set_reset(true);
        std::thread::sleep(Duration::from_millis(10));
        self.control.set_reset(false);

        let state = self.poll_until_fw_running(&[fw_state::FW2])?;
        log::info!("reset_board: fw_running=0x{:x}", state);

        let ack_cnt = self.dpm.read_u16(
            self.layout.board_status + crate::layout::board_status_offset::CMD_ACK_CNT,
        )?;
        self.last_ack_count.store(ack_cnt, Ordering::SeqCst);

        {
            let _guard = self.int_enable_lock.lock().unwrap();
            self.dpm.write_u16(self.layout.int_enable, saved_int_enable)?;
        }
        Ok(state)
    }

    /// Bootloader-only probe: raises the firmware-update-enable pin,
    /// hard-resets, waits specifically for `fw1`, reads the bootloader's
    /// version/date, lowers the pin, and hard-resets again so the board
    /// proceeds to application firmware normally.
    pub fn probe_bootloader_version(&self) -> Result<(u16, [u8; 4])> {
        self.control.set_fw_update_enable(true);
        let result = (|| -> Result<(u16, [u8; 4])> {
            self.control.set_reset(true);
            std::thread::sleep(Duration::from_millis(10));
            self.control.set_reset(false);
            self.poll_until_fw_running(&[fw_state::FW1])?;

            let version = self.dpm.read_u16(
                self.layout.board_status + crate::layout::board_status_offset::FW_VERSION,
            )?;
            let mut date = [0u8; 4];
            self.dpm.read_array(
                self.layout.board_status + crate::layout::board_status_offset::FW_DATE,
                &mut date,
            )?;
            Ok((version, date))
        })();

        self.control.set_fw_update_enable(false);
        self.control.set_reset(true);
        std::thread::sleep(Duration::from_millis(10));
        self.control.set_reset(false);
        let _ = self.poll_until_fw_running(&[fw_state::FW1, fw_state::FW2]);

        result
    }

    /// Pumps a firmware image into the board over the message area, one
    /// `FW_UPDATE_BLOCK_SIZE` block at a time, padding the final block
    /// with zeros. The firmware-update-enable pin is always lowered on
    /// exit, success or failure.
    pub fn write_firmware_update(&self, image: &[u8]) -> Result<usize> {
        self.control.set_fw_update_enable(true);
        let result = self.write_firmware_update_inner(image);
        self.control.set_fw_update_enable(false);
        result
    }

    fn write_firmware_update_inner(&self, image: &[u8]) -> Result<usize> {
        self.control.set_reset(true);
        std::thread::sleep(Duration::from_millis(10));
        self.control.set_reset(false);
        self.poll_until_fw_running(&[fw_state::FW1])?;

        let total_blocks = (image.len() + FW_UPDATE_BLOCK_SIZE - 1) / FW_UPDATE_BLOCK_SIZE;
        if self.layout.message_area_size < FW_UPDATE_BLOCK_SIZE {
            log::error!("write_firmware_update: message area too small for a full block");
            return Err(DriverError::IoError);
        }

        for block_idx in 0..total_blocks {
            let start = block_idx * FW_UPDATE_BLOCK_SIZE;
            let end = (start + FW_UPDATE_BLOCK_SIZE).min(image.len());
            let mut block = [0u8; FW_UPDATE_BLOCK_SIZE];
            block[..end - start].copy_from_slice(&image[start..end]);

            self.dpm.write_array(0, &block)?;
            self.dpm.write_u16(self.layout.mb_board2host, 0)?;
            self.dpm.write_u16(self.layout.mb_host2board, (block_idx + 1) as u16)?;

            self.transport.wait_for_ack(Duration::from_secs(1))?;
            log::info!("write_firmware_update: block {}/{} sent", block_idx + 1, total_blocks);
        }

        self.poll_until_fw_running(&[fw_state::FW2])?;
        log::info!("write_firmware_update: complete, board running fw2");
        Ok(image.len())
    }

    /// Installs a command-timeout override for the next `CMD_LATTE`
    /// sample, used by the latency-test harness. `timeout` takes
    /// precedence; when `None`, falls back to `BoardConfig::latte_timeout`
    /// and finally to whatever timeout is currently installed.
    pub fn init_latency_test(&self, timeout: Option<Duration>) -> Result<()> {
        let effective = timeout
            .or(self.config.latte_timeout)
            .unwrap_or_else(|| self.transport.timeout());
        self.transport.set_timeout(effective);
        self.transport.board_cmd(CMD_INIT_LATTE, effective.as_micros() as u32, 0)?;
        Ok(())
    }

    /// Samples two raw timestamp words from the start of the message
    /// area, used by the latency-test harness to measure round-trip time.
    pub fn sample_latency(&self) -> Result<(u32, u32)> {
        self.transport.board_cmd(CMD_LATTE, 0, 0)?;
        let t1 = self.dpm.read_u32(0)?;
        let t2 = self.dpm.read_u32(4)?;
        Ok((t1, t2))
    }

    fn read_message_area_string(&self) -> Result<String> {
        let len = self.layout.message_area_size.min(256);
        let mut buf = vec![0u8; len];
        self.dpm.read_array(0, &mut buf)?;
        let nul = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..nul]).into_owned())
    }

    pub fn print_exception(&self) -> Result<String> {
        self.transport.board_cmd(command::PRINT_EXCEPTION, 0, 0)?;
        self.read_message_area_string()
    }

    pub fn serial_debug(&self, code: u32) -> Result<String> {
        self.transport.board_cmd(command::SERIAL_DEBUG, code, 0)?;
        self.read_message_area_string()
    }

    pub fn mark_production_ok(&self) -> Result<()> {
        self.transport.board_cmd(command::PRODUCTION_OK, 0, 0)?;
        Ok(())
    }

    pub fn get_hw_id(&self) -> Result<u8> {
        self.dpm.read_u8(self.layout.board_status + crate::layout::board_status_offset::HW_ID)
    }

    pub fn get_pci104_position(&self) -> Result<u8> {
        self.dpm
            .read_u8(self.layout.board_status + crate::layout::board_status_offset::PCI104_POS)
    }

    pub fn get_fw2_version(&self) -> Result<u16> {
        self.dpm
            .read_u16(self.layout.board_status + crate::layout::board_status_offset::FW_VERSION)
    }

    pub fn get_lpcbc_revision(&self) -> Result<u16> {
        self.dpm
            .read_u16(self.layout.board_status + crate::layout::board_status_offset::LPCBC_REV)
    }

    pub fn get_board_error(&self) -> Result<u16> {
        self.dpm.read_u16(self.layout.board_status + crate::layout::board_status_offset::ERROR)
    }

    pub fn get_fw_running(&self) -> Result<u16> {
        self.fw_running()
    }

    /// Decoded snapshot of the `board_status` record (spec's Data Model
    /// §3 "Board status").
    pub fn get_board_status(&self) -> Result<BoardStatus> {
        use crate::layout::board_status_offset as off;
        let base = self.layout.board_status;
        let mut fw_date = [0u8; 4];
        self.dpm.read_array(base + off::FW_DATE, &mut fw_date)?;
        Ok(BoardStatus {
            lpcbc_revision: self.dpm.read_u16(base + off::LPCBC_REV)?,
            pci104_position: self.dpm.read_u8(base + off::PCI104_POS)?,
            hw_id: self.dpm.read_u8(base + off::HW_ID)?,
            cmd_ack_cnt: self.dpm.read_u16(base + off::CMD_ACK_CNT)?,
            error: self.dpm.read_u16(base + off::ERROR)?,
            fw_version: self.dpm.read_u16(base + off::FW_VERSION)?,
            fw_date,
            fw_running: self.dpm.read_u16(base + off::FW_RUNNING)?,
        })
    }

    /// The host driver's own version, distinct from the board firmware's
    /// (spec's host-facing `get_driver_version` vs `get_fw2_version`).
    pub fn get_driver_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

/// Decoded snapshot of the DPM `board_status` record.
#[derive(Debug, Clone, Copy)]
pub struct BoardStatus {
    pub lpcbc_revision: u16,
    pub pci104_position: u8,
    pub hw_id: u8,
    pub cmd_ack_cnt: u16,
    pub error: u16,
    pub fw_version: u16,
    /// `[day, month, year, hour]`, matching the firmware ABI's packing.
    pub fw_date: [u8; 4],
    pub fw_running: u16,
}

//! In-memory DPM plus a firmware-simulator thread, standing in for the
//! out-of-scope PCI/BAR-mapping layer so the ring/protocol/interrupt
//! logic can be exercised without real hardware.
//!
//! Grounded in the teacher's `pci::discover_mock`/`dma::alloc_mock`
//! pattern: a heap-allocated region pre-populated with plausible
//! register values, freed on drop. The simulator also plays the part of
//! the CAN bus itself: it consumes each active node's tx ring and
//! re-delivers accepted frames into every other active node's rx ring,
//! honouring whatever range/mask filter that node last installed.

use crate::board::{Board, BoardConfig, BoardControl};
use crate::error::Result;
use crate::irq;
use crate::layout::{
    bitrate, board_status_offset as bs_off, can_status_offset as cs_off, command,
    firmware_status, frame_offset, fw_state, ControlAreaLayout, FRAME_SIZE,
};
use crate::mmio::DpmWindow;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

struct MockLines {
    reset_asserted: AtomicBool,
    fw_update_enable: AtomicBool,
}

struct MockControl {
    lines: Arc<MockLines>,
}

impl BoardControl for MockControl {
    fn set_reset(&self, asserted: bool) {
        self.lines.reset_asserted.store(asserted, Ordering::SeqCst);
    }

    fn set_fw_update_enable(&self, asserted: bool) {
        self.lines.fw_update_enable.store(asserted, Ordering::SeqCst);
    }
}

/// One node's firmware-tracked filter state. Unlike mode/bitrate, the
/// firmware ABI has no DPM cell for "current filter" — it is
/// command-sourced state the real controller keeps internally, so the
/// simulator mirrors that by keeping it out of DPM too.
#[derive(Clone, Copy)]
enum FilterRule {
    Range(u32, u32),
    Mask(u32, u32),
}

impl FilterRule {
    fn accepts(&self, id: u32) -> bool {
        match *self {
            FilterRule::Range(lo, hi) => id >= lo && id <= hi,
            FilterRule::Mask(mask, code) => (id & mask) == (code & mask),
        }
    }
}

/// Owns the mock DPM allocation and the firmware-simulator thread.
/// Dropping it stops the simulator and frees the allocation.
pub struct MockBoard {
    pub board: Arc<Board>,
    dpm_buf: *mut u8,
    dpm_size: usize,
    stop: Arc<AtomicBool>,
    sim_thread: Option<JoinHandle<()>>,
}

unsafe impl Send for MockBoard {}

impl MockBoard {
    pub fn new(node_count: usize, message_area_size: usize) -> Result<Self> {
        let per_node = crate::layout::BUFFER_VARS_SIZE * 2 + crate::layout::CAN_STATUS_SIZE;
        let control_area_size =
            node_count * per_node + crate::layout::BOARD_STATUS_SIZE + 8 + 2 + 2 + 2 + 2;
        let dpm_size = message_area_size + control_area_size;

        let alloc_layout =
            std::alloc::Layout::array::<u8>(dpm_size).map_err(|_| crate::error::DriverError::IoError)?;
        let dpm_buf = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
        if dpm_buf.is_null() {
            return Err(crate::error::DriverError::IoError);
        }

        let lines = Arc::new(MockLines {
            reset_asserted: AtomicBool::new(false),
            fw_update_enable: AtomicBool::new(false),
        });

        // `Board::attach` constructs a `RingHandle` per ring, which caches
        // `buffer_vars.base` by reading it out of DPM right then. So every
        // descriptor field (and anything else read once at attach) has to
        // land in the backing memory before attach runs, not after.
        let control_area_layout = crate::layout::ControlAreaLayout::new(dpm_size, node_count)?;
        {
            let setup = unsafe { DpmWindow::new(dpm_buf, dpm_size) };
            seed_mock_dpm(&setup, &control_area_layout, node_count, message_area_size)?;
        }

        let control = Box::new(MockControl { lines: lines.clone() });
        let board = Board::attach(dpm_buf, dpm_size, node_count, control, BoardConfig::default())?;
        let board = Arc::new(board);

        let stop = Arc::new(AtomicBool::new(false));
        let sim_board = board.clone();
        let sim_lines = lines.clone();
        let sim_stop = stop.clone();
        let sim_thread = std::thread::spawn(move || firmware_sim_loop(sim_board, sim_lines, sim_stop));

        Ok(Self {
            board,
            dpm_buf,
            dpm_size,
            stop,
            sim_thread: Some(sim_thread),
        })
    }
}

impl Drop for MockBoard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sim_thread.take() {
            let _ = handle.join();
        }
        self.board.detach();
        unsafe {
            let layout = std::alloc::Layout::array::<u8>(self.dpm_size).unwrap();
            std::alloc::dealloc(self.dpm_buf, layout);
        }
    }
}

/// Pokes every DPM cell `Board::attach` reads during construction:
/// ring descriptors (base/wptr/rptr/size), `fw_running`, `hw_id`, and
/// each node's mode. Runs against a scratch [`DpmWindow`] over the same
/// allocation, before the real `Board` (and its `RingHandle`s) exist.
fn seed_mock_dpm(
    dpm: &DpmWindow,
    layout: &ControlAreaLayout,
    node_count: usize,
    message_area_size: usize,
) -> Result<()> {
    let per_node_slots = message_area_size / (node_count * 2).max(1);
    let ring_size = (per_node_slots / FRAME_SIZE).max(2) as u16;

    let mut base = 0usize;
    for i in 0..node_count {
        dpm.write_u16(layout.tx_vars_offset(i) + crate::layout::buffer_vars_offset::BASE, base as u16)?;
        dpm.write_u16(layout.tx_vars_offset(i) + crate::layout::buffer_vars_offset::WPTR, 0)?;
        dpm.write_u16(layout.tx_vars_offset(i) + crate::layout::buffer_vars_offset::RPTR, 0)?;
        dpm.write_u16(layout.tx_vars_offset(i) + crate::layout::buffer_vars_offset::SIZE, ring_size)?;
        base += ring_size as usize * FRAME_SIZE;

        dpm.write_u16(layout.rx_vars_offset(i) + crate::layout::buffer_vars_offset::BASE, base as u16)?;
        dpm.write_u16(layout.rx_vars_offset(i) + crate::layout::buffer_vars_offset::WPTR, 0)?;
        dpm.write_u16(layout.rx_vars_offset(i) + crate::layout::buffer_vars_offset::RPTR, 0)?;
        dpm.write_u16(layout.rx_vars_offset(i) + crate::layout::buffer_vars_offset::SIZE, ring_size)?;
        base += ring_size as usize * FRAME_SIZE;

        dpm.write_u16(layout.can_status_offset(i) + cs_off::MODE, crate::layout::Mode::RESET)?;
    }

    dpm.write_u16(layout.board_status + bs_off::FW_RUNNING, fw_state::FW2)?;
    dpm.write_u8(layout.board_status + bs_off::HW_ID, 0x11)?;
    Ok(())
}

fn bitrate_kbps(index: u16) -> u16 {
    match index as u32 {
        bitrate::B10K => 10,
        bitrate::B20K => 20,
        bitrate::B50K => 50,
        bitrate::B100K => 100,
        bitrate::B125K => 125,
        bitrate::B250K => 250,
        bitrate::B500K => 500,
        bitrate::B800K => 800,
        bitrate::B1000K => 1000,
        _ => 0,
    }
}

/// Applies one node-scoped command's effect to DPM/filter state and
/// returns the firmware status word to leave in the first argument cell.
fn apply_node_command(
    board: &Board,
    node: usize,
    cmd: u16,
    arg0: u32,
    arg1: u32,
    filters: &mut [Option<FilterRule>],
) -> u32 {
    let dpm = board.dpm();
    let base = board.layout().can_status_offset(node);
    match cmd {
        command::SET_MODE => {
            let _ = dpm.write_u16(base + cs_off::MODE, arg0 as u16);
        }
        command::SET_BITRATE => {
            if arg0 > bitrate::B1000K {
                return firmware_status::INVALID_ARGUMENT;
            }
            let _ = dpm.write_u16(base + cs_off::BITRATE_I, arg0 as u16);
            let _ = dpm.write_u16(base + cs_off::BITRATE, bitrate_kbps(arg0 as u16));
        }
        command::SET_RANGE_FILTER => {
            filters[node] = Some(FilterRule::Range(arg0, arg1));
        }
        command::SET_MASK_FILTER => {
            filters[node] = Some(FilterRule::Mask(arg0, arg1));
        }
        command::CLR_FILTERS => {
            filters[node] = None;
        }
        command::SET_CAN_TYPE => {
            let _ = dpm.write_u8(base + cs_off::CAN_TYPE, arg0 as u8);
        }
        command::CLR_OVERRUN
        | command::RESET_TIMESTAMP
        | command::SET_BTR
        | command::SET_SJW_INCREMENT
        | command::GET_ERR_STAT
        | command::CLR_ERR_STAT => {}
        _ => return firmware_status::INVALID_COMMAND,
    }
    firmware_status::OK
}

/// One tick of the simulated CAN bus: pops one frame from every active
/// node's tx ring and re-delivers it to every other active node whose
/// filter (if any) accepts the identifier. Nodes outside `Active` mode
/// neither send nor receive.
fn run_bus_step(board: &Board, filters: &[Option<FilterRule>]) -> u16 {
    use crate::layout::{IntBits, Mode};
    let dpm = board.dpm();
    let mut reason = 0u16;

    for src in 0..board.node_count() {
        let src_mode = dpm
            .read_u16(board.layout().can_status_offset(src) + cs_off::MODE)
            .unwrap_or(0);
        if src_mode != Mode::ACTIVE {
            continue;
        }
        let st = board.node_state(src);
        if st.tx.is_empty().unwrap_or(true) {
            continue;
        }
        let mut buf = [0u8; FRAME_SIZE];
        if st.tx.read_frame_bytes(&mut buf).is_err() {
            continue;
        }
        if st.tx.advance_read().is_err() {
            continue;
        }
        if let Some((_, tx_bit)) = IntBits::node_rx_tx(src) {
            reason |= tx_bit.bits();
        }
        let _ = dpm.write_u16(
            board.layout().can_status_offset(src) + cs_off::SENT,
            dpm.read_u16(board.layout().can_status_offset(src) + cs_off::SENT)
                .unwrap_or(0)
                .wrapping_add(1),
        );

        let id = LittleEndian::read_u32(&buf[frame_offset::ID..]);

        for dst in 0..board.node_count() {
            if dst == src {
                continue;
            }
            let dst_mode = dpm
                .read_u16(board.layout().can_status_offset(dst) + cs_off::MODE)
                .unwrap_or(0);
            if dst_mode != Mode::ACTIVE {
                continue;
            }
            let accepted = filters[dst].map(|f| f.accepts(id)).unwrap_or(true);
            let dst_base = board.layout().can_status_offset(dst);
            if !accepted {
                let _ = dpm.write_u16(
                    dst_base + cs_off::FILTERED,
                    dpm.read_u16(dst_base + cs_off::FILTERED).unwrap_or(0).wrapping_add(1),
                );
                continue;
            }
            let dst_state = board.node_state(dst);
            if dst_state.rx.is_full().unwrap_or(true) {
                continue;
            }
            if dst_state.rx.write_frame_bytes(&buf).is_err() {
                continue;
            }
            if dst_state.rx.advance_write().is_err() {
                continue;
            }
            let _ = dpm.write_u16(
                dst_base + cs_off::RECEIVED,
                dpm.read_u16(dst_base + cs_off::RECEIVED).unwrap_or(0).wrapping_add(1),
            );
            if let Some((rx_bit, _)) = IntBits::node_rx_tx(dst) {
                reason |= rx_bit.bits();
            }
        }
    }
    reason
}

fn firmware_sim_loop(board: Arc<Board>, lines: Arc<MockLines>, stop: Arc<AtomicBool>) {
    let dpm = board.dpm();
    let layout = board.layout();
    let fw_blocks_received = AtomicU32::new(0);
    let mut last_reset = false;
    let mut filters: Vec<Option<FilterRule>> = vec![None; board.node_count()];
    let sim_clock = AtomicU32::new(0);

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(2));

        let reset_now = lines.reset_asserted.load(Ordering::SeqCst);
        if last_reset && !reset_now {
            let enable = lines.fw_update_enable.load(Ordering::SeqCst);
            let target = if enable { fw_state::FW1 } else { fw_state::FW2 };
            let _ = dpm.write_u16(layout.board_status + bs_off::FW_RUNNING, target);
            fw_blocks_received.store(0, Ordering::SeqCst);
            if enable {
                let _ = dpm.write_u16(layout.board_status + bs_off::FW_VERSION, 0x0102);
                let _ = dpm.write_array(layout.board_status + bs_off::FW_DATE, &[1, 6, 26, 9]);
            } else {
                for f in filters.iter_mut() {
                    *f = None;
                }
            }
        }
        last_reset = reset_now;

        let mut reason = 0u16;

        let mailbox = dpm.read_u16(layout.mb_host2board).unwrap_or(0);
        if mailbox != 0 {
            let fw_running = dpm.read_u16(layout.board_status + bs_off::FW_RUNNING).unwrap_or(0);
            if fw_running == fw_state::FW1 && lines.fw_update_enable.load(Ordering::SeqCst) {
                let n = fw_blocks_received.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 2 {
                    let _ = dpm.write_u16(layout.board_status + bs_off::FW_RUNNING, fw_state::FW2);
                }
            } else {
                let cmd = mailbox & 0xff;
                let node = ((mailbox >> 8) & 0x3) as usize;
                let arg0 = dpm.read_u32(layout.args).unwrap_or(0);
                let arg1 = dpm.read_u32(layout.args + 4).unwrap_or(0);
                let status = match cmd {
                    command::PRINT_EXCEPTION | command::SERIAL_DEBUG => {
                        let _ = dpm.write_array(0, b"mock firmware debug dump\0");
                        firmware_status::OK
                    }
                    command::PRODUCTION_OK => firmware_status::OK,
                    0x90 => firmware_status::OK, // driver-local CMD_INIT_LATTE
                    0x91 => {
                        // driver-local CMD_LATTE: stamp two monotonically
                        // increasing words so the host sees a round trip.
                        let t = sim_clock.fetch_add(1, Ordering::SeqCst);
                        let _ = dpm.write_u32(0, t);
                        let _ = dpm.write_u32(4, t + 1);
                        firmware_status::OK
                    }
                    _ if node < board.node_count() => {
                        apply_node_command(&board, node, cmd, arg0, arg1, &mut filters)
                    }
                    _ => firmware_status::INVALID_COMMAND,
                };
                let _ = dpm.write_u32(layout.args, status);
            }

            let _ = dpm.write_u16(layout.mb_host2board, 0);
            let cnt = dpm.read_u16(layout.board_status + bs_off::CMD_ACK_CNT).unwrap_or(0);
            let _ = dpm.write_u16(layout.board_status + bs_off::CMD_ACK_CNT, cnt.wrapping_add(1));
            reason |= crate::layout::IntBits::CMD_ACK.bits();
        }

        reason |= run_bus_step(&board, &filters);

        if reason != 0 {
            let _ = dpm.set_bits16(layout.mb_board2host, reason);
            let _ = irq::handle_interrupt(&board);
        }
    }
}

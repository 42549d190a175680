//! Shared harness for integration tests: attaches a `Board` over a
//! plain heap buffer (no mock bus, no simulator thread) so each test
//! controls the DPM content directly through its own `DpmWindow` handle.

use hicocan::board::{Board, BoardConfig, BoardControl};
use hicocan::layout::{board_status_offset as bs_off, buffer_vars_offset as bv_off, fw_state, ControlAreaLayout};
use hicocan::mmio::DpmWindow;
use std::sync::Arc;
use std::time::Duration;

pub struct NoopControl;

impl BoardControl for NoopControl {
    fn set_reset(&self, _asserted: bool) {}
    fn set_fw_update_enable(&self, _asserted: bool) {}
}

pub struct Harness {
    pub board: Arc<Board>,
    pub dpm: Arc<DpmWindow>,
    pub layout: ControlAreaLayout,
    buf: *mut u8,
    buf_size: usize,
}

unsafe impl Send for Harness {}

impl Drop for Harness {
    fn drop(&mut self) {
        self.board.detach();
        unsafe {
            let layout = std::alloc::Layout::array::<u8>(self.buf_size).unwrap();
            std::alloc::dealloc(self.buf, layout);
        }
    }
}

/// Attaches a board with `node_count` nodes, each ring carved at a fixed
/// slot size, starting in `fw2` with a clean `int_enable`.
pub fn attach(node_count: usize, cmd_timeout: Duration) -> Harness {
    attach_with_control(node_count, cmd_timeout, |_dpm, _layout| Box::new(NoopControl))
}

/// Same as [`attach`] but lets the caller build the `BoardControl` from
/// the harness's own DPM handle and layout, so a test can simulate the
/// reset/fw-update-enable lines by writing back into the same buffer
/// `Board::attach` is about to map.
pub fn attach_with_control(
    node_count: usize,
    cmd_timeout: Duration,
    make_control: impl FnOnce(Arc<DpmWindow>, ControlAreaLayout) -> Box<dyn BoardControl + Send + Sync>,
) -> Harness {
    let buf_size = 0x2000;
    let layout = ControlAreaLayout::new(buf_size, node_count).unwrap();
    let alloc_layout = std::alloc::Layout::array::<u8>(buf_size).unwrap();
    let buf = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
    assert!(!buf.is_null());

    let dpm = Arc::new(unsafe { DpmWindow::new(buf, buf_size) });
    let ring_slots = 4u16;
    let mut base = 0usize;
    for i in 0..node_count {
        dpm.write_u16(layout.tx_vars_offset(i) + bv_off::BASE, base as u16).unwrap();
        dpm.write_u16(layout.tx_vars_offset(i) + bv_off::SIZE, ring_slots).unwrap();
        base += ring_slots as usize * hicocan::layout::FRAME_SIZE;

        dpm.write_u16(layout.rx_vars_offset(i) + bv_off::BASE, base as u16).unwrap();
        dpm.write_u16(layout.rx_vars_offset(i) + bv_off::SIZE, ring_slots).unwrap();
        base += ring_slots as usize * hicocan::layout::FRAME_SIZE;
    }
    dpm.write_u16(layout.board_status + bs_off::FW_RUNNING, fw_state::FW2).unwrap();

    let config = BoardConfig {
        cmd_timeout,
        ..BoardConfig::default()
    };
    let control = make_control(dpm.clone(), layout);
    let board = Board::attach(buf, buf_size, node_count, control, config).unwrap();
    Harness {
        board: Arc::new(board),
        dpm,
        layout,
        buf,
        buf_size,
    }
}

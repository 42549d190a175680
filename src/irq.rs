//! Interrupt demultiplexer.
//!
//! Called from whatever context fields the board's interrupt line (a
//! real IRQ handler, or the mock firmware simulator in tests). Reads the
//! board→host mailbox as a hint — not an atomically-consistent snapshot,
//! since the firmware can still be updating bits underneath us — masks
//! it against the current firmware state to suppress spurious wakeups
//! during reset/update, then wakes whichever node waiters and command
//! waiter the remaining bits call for.

use crate::board::Board;
use crate::error::Result;
use crate::layout::{fw_state, IntBits};

/// Demultiplexes one interrupt. Returns `true` if this board claims the
/// interrupt (some recognised bit was set), `false` if it looks like it
/// belongs to another device sharing the line.
pub fn handle_interrupt(board: &Board) -> Result<bool> {
    let dpm = board.dpm();
    let layout = board.layout();

    let raw = dpm.read_u16(layout.mb_board2host)?;
    if raw != 0 {
        dpm.write_u16(layout.mb_board2host, 0)?;
    }

    if raw == 0 {
        return Ok(false);
    }

    let fw_running = dpm.read_u16(
        layout.board_status + crate::layout::board_status_offset::FW_RUNNING,
    )?;

    let masked = match fw_running {
        fw_state::FW2 => IntBits::from_bits_truncate(raw),
        fw_state::FW1 | fw_state::EXCEPTION => {
            let bits = IntBits::from_bits_truncate(raw) & IntBits::CMD_ACK;
            if bits.is_empty() && raw != 0 {
                log::warn!(
                    "irq: suppressing non-cmd_ack bits 0x{:x} while fw_running=0x{:x}",
                    raw, fw_running
                );
            }
            bits
        }
        other => {
            log::warn!("irq: dropping all bits 0x{:x}, unexpected fw_running=0x{:x}", raw, other);
            IntBits::empty()
        }
    };

    if board.irq_trace() {
        log::trace!("irq: raw=0x{:x} fw_running=0x{:x} masked={:?}", raw, fw_running, masked);
    }

    if masked.is_empty() {
        return Ok(false);
    }

    if masked.contains(IntBits::ERROR) || masked.contains(IntBits::EXCEPTION) {
        log::error!("irq: board error/exception bit set (raw=0x{:x})", raw);
        board.wake_all_nodes();
    }

    for i in 0..board.node_count() {
        if let Some((rx_bit, tx_bit)) = IntBits::node_rx_tx(i) {
            if masked.contains(rx_bit) && !board.rx_ring_is_empty(i)? {
                board.wake_node_rx(i);
                clear_enable_bit(board, rx_bit)?;
            }
            if masked.contains(tx_bit) {
                board.wake_node_tx(i);
                if board.tx_ring_is_empty(i)? {
                    clear_enable_bit(board, tx_bit)?;
                }
            }
        }
    }

    if masked.contains(IntBits::CMD_ACK) {
        let cmd_ack_cnt = dpm.read_u16(
            layout.board_status + crate::layout::board_status_offset::CMD_ACK_CNT,
        )?;
        if board.observe_cmd_ack_cnt(cmd_ack_cnt) {
            board.transport().notify_ack();
        }
    }

    Ok(true)
}

/// Selectively clears one `int_enable` bit through the board's
/// dedicated lock, matching spec's atomicity requirement for this
/// shared register (the teacher's equivalent bit-twiddling helpers are
/// non-atomic, which is fine for its single-threaded domain but not
/// for this one — see DESIGN.md).
fn clear_enable_bit(board: &Board, bit: IntBits) -> Result<()> {
    let _guard = board.int_enable_lock().lock().unwrap();
    board.dpm().clear_bits16(board.layout().int_enable, bit.bits())
}

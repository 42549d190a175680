//! Tests for the command/ack mailbox protocol and the board-wide
//! operations built on top of it, against a hand-rolled fake firmware
//! thread rather than the full mock bus simulator.

mod common;

use common::Harness;
use hicocan::layout::board_status_offset as bs_off;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Spawns a thread that waits for the mailbox to go non-zero, writes the
/// given status/result words into the argument cells, clears the
/// mailbox, bumps `cmd_ack_cnt`, and calls the public interrupt
/// demultiplexer — exactly what a real ISR observing the board's
/// interrupt line would do.
fn spawn_fake_ack(h: &Harness, status: u32, result: u32) -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let board = h.board.clone();
    let dpm = h.dpm.clone();
    let layout = h.layout;
    let done = stop.clone();
    std::thread::spawn(move || {
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) {
                return;
            }
            let mailbox = dpm.read_u16(layout.mb_host2board).unwrap();
            if mailbox != 0 {
                dpm.write_u32(layout.args, status).unwrap();
                dpm.write_u32(layout.args + 4, result).unwrap();
                dpm.write_u16(layout.mb_host2board, 0).unwrap();
                let cnt = dpm.read_u16(layout.board_status + bs_off::CMD_ACK_CNT).unwrap();
                dpm.write_u16(layout.board_status + bs_off::CMD_ACK_CNT, cnt.wrapping_add(1))
                    .unwrap();
                dpm.set_bits16(layout.mb_board2host, hicocan::layout::IntBits::CMD_ACK.bits())
                    .unwrap();
                hicocan::irq::handle_interrupt(&board).unwrap();
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    });
    stop
}

#[test]
fn production_ok_round_trips_through_ack() {
    let h = common::attach(1, Duration::from_secs(2));
    let _stop = spawn_fake_ack(&h, hicocan::layout::firmware_status::OK, 0);
    h.board.mark_production_ok().unwrap();
}

#[test]
fn oversized_bitrate_index_is_rejected_locally() {
    let h = common::attach(1, Duration::from_secs(2));
    let node = h.board.node(0).unwrap();
    // rejected before any mailbox traffic — no fake firmware needed
    let err = node.set_bitrate(999).unwrap_err();
    assert_eq!(err, hicocan::DriverError::InvalidArgument);
}

#[test]
fn invalid_command_status_maps_to_driver_error() {
    let h = common::attach(1, Duration::from_secs(2));
    let _stop = spawn_fake_ack(&h, hicocan::layout::firmware_status::INVALID_COMMAND, 0);
    let err = h.board.mark_production_ok().unwrap_err();
    assert_eq!(err, hicocan::DriverError::InvalidArgument);
}

#[test]
fn ignored_status_maps_to_busy() {
    let h = common::attach(1, Duration::from_secs(2));
    let _stop = spawn_fake_ack(&h, hicocan::layout::firmware_status::IGNORED, 0);
    let err = h.board.mark_production_ok().unwrap_err();
    assert_eq!(err, hicocan::DriverError::Busy);
}

#[test]
fn command_times_out_when_nothing_acks() {
    let h = common::attach(1, Duration::from_millis(150));
    let err = h.board.mark_production_ok().unwrap_err();
    assert_eq!(err, hicocan::DriverError::IoError);
}

#[test]
fn node_cmd_refuses_outside_fw2() {
    let h = common::attach(1, Duration::from_secs(2));
    h.dpm
        .write_u16(h.layout.board_status + bs_off::FW_RUNNING, hicocan::layout::fw_state::FW1)
        .unwrap();
    let node = h.board.node(0).unwrap();
    let err = node.reset_timestamp().unwrap_err();
    assert_eq!(err, hicocan::DriverError::IoError);
}

#[test]
fn detach_unblocks_in_flight_command_with_restart_required() {
    let h = common::attach(1, Duration::from_secs(30));
    let board = h.board.clone();
    let handle = std::thread::spawn(move || board.mark_production_ok());

    // give the command time to start waiting, then detach
    std::thread::sleep(Duration::from_millis(50));
    h.board.detach();

    let result = handle.join().unwrap();
    assert_eq!(result.unwrap_err(), hicocan::DriverError::RestartRequired);
}

//! Tests for the interrupt demultiplexer: masking by firmware state,
//! "not my interrupt" reporting, and the per-node enable-bit clearing
//! rules (rx clears only once non-empty, tx clears only once drained).

mod common;

use hicocan::layout::{buffer_vars_offset as bv_off, fw_state, Frame, FrameInfo, IntBits};
use std::time::Duration;

fn sample_frame(id: u32) -> Frame {
    Frame {
        info: FrameInfo::new(8, false, false, false, false, 0),
        timestamp_us: 0,
        id,
        data: [0; 8],
    }
}

#[test]
fn no_interrupt_reported_as_not_mine() {
    let h = common::attach(1, Duration::from_secs(1));
    let handled = hicocan::irq::handle_interrupt(&h.board).unwrap();
    assert!(!handled);
}

#[test]
fn raw_bits_are_cleared_even_when_not_handled() {
    let h = common::attach(1, Duration::from_secs(1));
    h.dpm
        .set_bits16(h.layout.mb_board2host, IntBits::CAN1_RX.bits())
        .unwrap();
    h.dpm
        .write_u16(h.layout.board_status + hicocan::layout::board_status_offset::FW_RUNNING, fw_state::FW1)
        .unwrap();

    // fw1 masks everything but cmd_ack, so this bit alone isn't "ours"
    let handled = hicocan::irq::handle_interrupt(&h.board).unwrap();
    assert!(!handled);
    assert_eq!(h.dpm.read_u16(h.layout.mb_board2host).unwrap(), 0);
}

#[test]
fn cmd_ack_survives_fw1_mask() {
    let h = common::attach(1, Duration::from_secs(1));
    h.dpm
        .write_u16(h.layout.board_status + hicocan::layout::board_status_offset::FW_RUNNING, fw_state::FW1)
        .unwrap();
    h.dpm
        .set_bits16(h.layout.mb_board2host, IntBits::CMD_ACK.bits() | IntBits::CAN1_RX.bits())
        .unwrap();

    let handled = hicocan::irq::handle_interrupt(&h.board).unwrap();
    assert!(handled);
}

#[test]
fn rx_enable_bit_stays_armed_while_ring_is_empty() {
    let h = common::attach(1, Duration::from_secs(1));
    let (rx_bit, _) = IntBits::node_rx_tx(0).unwrap();
    h.dpm.set_bits16(h.layout.int_enable, rx_bit.bits()).unwrap();
    h.dpm.set_bits16(h.layout.mb_board2host, rx_bit.bits()).unwrap();

    hicocan::irq::handle_interrupt(&h.board).unwrap();

    let enabled = h.dpm.read_u16(h.layout.int_enable).unwrap();
    assert_ne!(enabled & rx_bit.bits(), 0, "rx bit must stay armed while the ring is still empty");
}

#[test]
fn rx_enable_bit_clears_once_a_frame_arrives() {
    let h = common::attach(1, Duration::from_secs(1));
    let (rx_bit, _) = IntBits::node_rx_tx(0).unwrap();
    h.dpm.set_bits16(h.layout.int_enable, rx_bit.bits()).unwrap();

    // place one frame directly into node 0's rx ring, as firmware would
    let rx_vars = h.layout.rx_vars_offset(0);
    let base = h.dpm.read_u16(rx_vars + bv_off::BASE).unwrap() as usize;
    let frame = sample_frame(0x42);
    let mut buf = [0u8; hicocan::layout::FRAME_SIZE];
    encode(&frame, &mut buf);
    h.dpm.write_array(base, &buf).unwrap();
    h.dpm.write_u16(rx_vars + bv_off::WPTR, 1).unwrap();

    h.dpm.set_bits16(h.layout.mb_board2host, rx_bit.bits()).unwrap();
    let handled = hicocan::irq::handle_interrupt(&h.board).unwrap();
    assert!(handled);

    let enabled = h.dpm.read_u16(h.layout.int_enable).unwrap();
    assert_eq!(enabled & rx_bit.bits(), 0, "rx bit should be cleared once woken with data present");

    let node = h.board.node(0).unwrap();
    let received = node.try_read_frame().unwrap();
    assert_eq!(received.id, 0x42);
}

#[test]
fn tx_enable_bit_only_clears_once_ring_drains() {
    let h = common::attach(1, Duration::from_secs(1));
    let (_, tx_bit) = IntBits::node_rx_tx(0).unwrap();
    h.dpm.set_bits16(h.layout.int_enable, tx_bit.bits()).unwrap();

    // two frames in the tx ring; draining one still leaves it non-empty
    let tx_vars = h.layout.tx_vars_offset(0);
    h.dpm.write_u16(tx_vars + bv_off::WPTR, 2).unwrap();
    h.dpm.write_u16(tx_vars + bv_off::RPTR, 1).unwrap();

    h.dpm.set_bits16(h.layout.mb_board2host, tx_bit.bits()).unwrap();
    hicocan::irq::handle_interrupt(&h.board).unwrap();
    let enabled = h.dpm.read_u16(h.layout.int_enable).unwrap();
    assert_ne!(enabled & tx_bit.bits(), 0, "tx bit must stay armed while frames remain queued");

    // now drain the last frame
    h.dpm.write_u16(tx_vars + bv_off::RPTR, 2).unwrap();
    h.dpm.set_bits16(h.layout.mb_board2host, tx_bit.bits()).unwrap();
    hicocan::irq::handle_interrupt(&h.board).unwrap();
    let enabled = h.dpm.read_u16(h.layout.int_enable).unwrap();
    assert_eq!(enabled & tx_bit.bits(), 0, "tx bit clears once the ring is fully drained");
}

#[test]
fn blocked_reader_wakes_once_irq_delivers_a_frame() {
    let h = common::attach(1, Duration::from_secs(2));
    let board = h.board.clone();
    let handle = std::thread::spawn(move || board.node(0).unwrap().read_frame());

    std::thread::sleep(Duration::from_millis(60));

    let (rx_bit, _) = IntBits::node_rx_tx(0).unwrap();
    let rx_vars = h.layout.rx_vars_offset(0);
    let base = h.dpm.read_u16(rx_vars + bv_off::BASE).unwrap() as usize;
    let frame = sample_frame(0x77);
    let mut buf = [0u8; hicocan::layout::FRAME_SIZE];
    encode(&frame, &mut buf);
    h.dpm.write_array(base, &buf).unwrap();
    h.dpm.write_u16(rx_vars + bv_off::WPTR, 1).unwrap();
    h.dpm.set_bits16(h.layout.mb_board2host, rx_bit.bits()).unwrap();
    hicocan::irq::handle_interrupt(&h.board).unwrap();

    let result = handle.join().unwrap();
    assert_eq!(result.unwrap().id, 0x77);
}

fn encode(frame: &Frame, buf: &mut [u8; hicocan::layout::FRAME_SIZE]) {
    use byteorder::{ByteOrder, LittleEndian};
    use hicocan::layout::frame_offset;
    LittleEndian::write_u16(&mut buf[frame_offset::FI..], frame.info.0);
    LittleEndian::write_u32(&mut buf[frame_offset::TS..], frame.timestamp_us);
    LittleEndian::write_u32(&mut buf[frame_offset::ID..], frame.id);
    buf[frame_offset::DATA..frame_offset::DATA + 8].copy_from_slice(&frame.data);
}

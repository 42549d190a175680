//! Demo binary: attaches a mock board (no real PCI/BAR mapping — that
//! layer is out of scope for this crate) and walks through the phases a
//! real caller would exercise: reset, mode transitions, and a frame
//! round-trip.

use hicocan::layout::{Frame, FrameInfo};
use hicocan::mock::MockBoard;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    log::warn!("running against a mock board — no real hardware is attached");

    match run() {
        Ok(()) => {
            println!("demo completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("demo failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> hicocan::Result<()> {
    log::info!("Phase 1: attach");
    let mock = MockBoard::new(2, 0x4000)?;
    let board = &mock.board;
    log::info!(
        "attached: {} nodes, hw_id=0x{:x}, fw_running=0x{:x}",
        board.node_count(),
        board.get_hw_id()?,
        board.get_fw_running()?
    );

    log::info!("Phase 2: reset");
    let state = board.reset_board()?;
    log::info!("reset complete, fw_running=0x{:x}", state);

    log::info!("Phase 3: bring node 0 up");
    let node0 = board.node(0)?;
    node0.set_bitrate(hicocan::layout::bitrate::B500K)?;
    node0.start()?;
    log::info!("node 0 mode={:?}", node0.get_mode()?);

    log::info!("Phase 4: send and receive a frame");
    let frame = Frame {
        info: FrameInfo::new(8, false, false, false, false, 0),
        timestamp_us: 0,
        id: 0x123,
        data: [1, 2, 3, 4, 5, 6, 7, 8],
    };
    node0.try_write_frame(&frame)?;
    log::info!("wrote frame id=0x{:x}", frame.id);

    match node0.try_read_frame() {
        Ok(received) => log::info!("read back frame id=0x{:x}", received.id),
        Err(e) => log::info!("no frame available to read back ({}, as expected for a loopback-less mock)", e),
    }

    log::info!("Phase 5: stop node 0");
    node0.stop()?;
    log::info!("node 0 mode={:?}", node0.get_mode()?);

    Ok(())
}

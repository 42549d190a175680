//! Single-flight command/ack transport over the mailbox cells.
//!
//! One board-wide command may be in flight at a time. Callers serialize
//! through `CommandTransport`'s internal lock (analogous to
//! `hcan_board.sem` in the original driver); the interrupt handler
//! (`crate::irq`) observes the ack and wakes whoever is waiting.

use crate::error::{DriverError, Result};
use crate::layout::{firmware_status, fw_state, ControlAreaLayout};
use crate::mmio::DpmWindow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Grace period observed after seeing an ack before trusting the status
/// cells, absorbing a known firmware race (documented quirk, not an
/// invariant: nothing else in this crate depends on its exact value).
const POST_ACK_GRACE: Duration = Duration::from_millis(1);

/// Longest slice a command wait blocks for between cancellation checks.
/// `board_cmd`/`wait_for_ack` chop their overall timeout into slices of
/// at most this long so `Board::detach` is observed promptly rather than
/// only after the full timeout elapses.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative substitute for the POSIX interruptible semaphore wait in
/// the original driver: a thread waiting in [`CommandTransport::board_cmd`]
/// observes cancellation and returns `RestartRequired` instead of
/// blocking forever, the way the kernel driver's signal-interrupted
/// `down_interruptible` would abort the syscall for the caller to retry.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct AckState {
    seen: bool,
}

pub struct CommandTransport {
    dpm: Arc<DpmWindow>,
    layout: Arc<ControlAreaLayout>,
    board_lock: Mutex<()>,
    ack_state: Mutex<AckState>,
    ack_cv: Condvar,
    cancel: CancelToken,
    cmd_timeout: Mutex<Duration>,
}

impl CommandTransport {
    pub fn new(
        dpm: Arc<DpmWindow>,
        layout: Arc<ControlAreaLayout>,
        cancel: CancelToken,
        cmd_timeout: Duration,
    ) -> Self {
        Self {
            dpm,
            layout,
            board_lock: Mutex::new(()),
            ack_state: Mutex::new(AckState::default()),
            ack_cv: Condvar::new(),
            cancel,
            cmd_timeout: Mutex::new(cmd_timeout),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.cmd_timeout.lock().unwrap() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.cmd_timeout.lock().unwrap()
    }

    /// Called by the interrupt demultiplexer when it observes
    /// `cmd_ack_cnt` advance. Wakes exactly one in-flight `board_cmd`.
    pub fn notify_ack(&self) {
        let mut state = self.ack_state.lock().unwrap();
        state.seen = true;
        self.ack_cv.notify_all();
    }

    /// Blocks for an ack without issuing a command of its own — used by
    /// the firmware-update block pump, which writes the mailbox cells
    /// directly rather than through `board_cmd`'s argument-cell protocol.
    pub fn wait_for_ack(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.ack_state.lock().unwrap();
            state.seen = false;
        }
        self.block_for_ack(Instant::now() + timeout)
    }

    /// Waits for `ack_state.seen`, cooperatively cancellable, in slices
    /// no longer than [`CANCEL_POLL_INTERVAL`] so a concurrent
    /// `CancelToken::cancel` is noticed well before `deadline`.
    fn block_for_ack(&self, deadline: Instant) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(DriverError::RestartRequired);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::IoError);
            }
            let slice = (deadline - now).min(CANCEL_POLL_INTERVAL);
            let (mut state, _) = self
                .ack_cv
                .wait_timeout_while(self.ack_state.lock().unwrap(), slice, |s| !s.seen)
                .unwrap();
            if state.seen {
                state.seen = false;
                return Ok(());
            }
        }
    }

    /// Issues a board-wide command and waits for the firmware's ack,
    /// returning the two status/result words left in the argument cells.
    ///
    /// Steps mirror the original `board_cmd`: acquire the single-flight
    /// lock (bailing out with `RestartRequired` if cancelled), write the
    /// argument cells, arm the ack waiter, fence, ring the mailbox,
    /// block for the ack (timing out as `IoError`), map the firmware's
    /// status word, sleep the documented grace period, then read back
    /// the second argument cell.
    pub fn board_cmd(&self, code: u16, arg0: u32, arg1: u32) -> Result<(u32, u32)> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::RestartRequired);
        }
        let _guard = self.board_lock.lock().unwrap();
        if self.cancel.is_cancelled() {
            return Err(DriverError::RestartRequired);
        }

        log::debug!("board_cmd: code=0x{:x} arg0=0x{:x} arg1=0x{:x}", code, arg0, arg1);

        self.dpm.write_u32(self.layout.args, arg0)?;
        self.dpm.write_u32(self.layout.args + 4, arg1)?;

        {
            let mut state = self.ack_state.lock().unwrap();
            state.seen = false;
        }

        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        self.dpm.write_u16(self.layout.mb_host2board, code)?;

        let deadline = Instant::now() + self.timeout();
        if let Err(e) = self.block_for_ack(deadline) {
            if e == DriverError::IoError {
                log::error!("board_cmd: timed out waiting for ack (code=0x{:x})", code);
            }
            return Err(e);
        }

        let status = self.dpm.read_u32(self.layout.args)?;
        map_firmware_status(status)?;

        std::thread::sleep(POST_ACK_GRACE);

        let result = self.dpm.read_u32(self.layout.args + 4)?;
        Ok((status, result))
    }

    /// Node-scoped command: ORs the node index into the high byte of
    /// the command code and refuses to issue anything while the board
    /// is not running its application firmware (`fw2`).
    pub fn node_cmd(&self, node: u8, code: u16, arg0: u32, arg1: u32) -> Result<(u32, u32)> {
        let running = self.dpm.read_u16(self.layout.board_status + crate::layout::board_status_offset::FW_RUNNING)?;
        if running != fw_state::FW2 {
            log::warn!("node_cmd: refused, fw_running=0x{:x} (expected fw2)", running);
            return Err(DriverError::IoError);
        }
        let coded = code | ((node as u16) << 8);
        self.board_cmd(coded, arg0, arg1)
    }
}

/// Maps the firmware's status word (left in the first argument cell
/// after an ack) onto the driver's error taxonomy.
pub fn map_firmware_status(status: u32) -> Result<()> {
    match status {
        firmware_status::OK => Ok(()),
        firmware_status::INVALID_ARGUMENT => Err(DriverError::InvalidArgument),
        firmware_status::INVALID_COMMAND => Err(DriverError::InvalidArgument),
        firmware_status::IGNORED => Err(DriverError::Busy),
        other => {
            log::error!("board_cmd: unrecognised firmware status 0x{:x}", other);
            Err(DriverError::IoError)
        }
    }
}

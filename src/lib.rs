//! Host-side driver core for a PCI/MiniPCI dual-ported-memory CAN-bus
//! adapter: DPM layout, ring buffers, the command/ack mailbox protocol,
//! the interrupt demultiplexer, and the board reset/firmware-update
//! state machine. PCI enumeration, BAR mapping, and OS-specific device
//! registration are out of scope; callers supply an already-mapped DPM
//! region and a [`board::BoardControl`] implementation for the reset
//! and firmware-update-enable lines.

pub mod board;
pub mod error;
pub mod irq;
pub mod layout;
pub mod mmio;
pub mod mock;
pub mod node;
pub mod protocol;
pub mod ring;

pub use board::{Board, BoardConfig, BoardControl, BoardStatus};
pub use error::{DriverError, Result};
pub use layout::{Frame, FrameInfo, Mode, TransceiverType};
pub use node::{CanStatus, Node, Readiness};

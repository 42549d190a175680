//! DPM control-area layout and wire-format constants.
//!
//! Mirrors the firmware ABI byte-for-byte: field order, field widths, and
//! constant values here are fixed by the board's firmware and must not be
//! renumbered. Nothing in this module touches memory directly — it only
//! computes byte offsets and decodes/encodes values; [`crate::mmio::DpmWindow`]
//! is the sole thing that reads or writes DPM.

use crate::error::{DriverError, Result};
use bitflags::bitflags;

/// Size in bytes of one `buffer_vars` record: base, wptr, rptr, size (all u16).
pub const BUFFER_VARS_SIZE: usize = 8;
/// Size in bytes of one `can_status` record.
pub const CAN_STATUS_SIZE: usize = 48;
/// Size in bytes of the `board_status` record.
pub const BOARD_STATUS_SIZE: usize = 36;
/// Size in bytes of one frame slot (`can_msg`).
pub const FRAME_SIZE: usize = 18;
/// Size in bytes of the control-area tail that isn't per-node (board_status,
/// args[2], int_enable, int_count, mb_board2host, mb_host2board).
const CONTROL_AREA_TAIL_SIZE: usize = BOARD_STATUS_SIZE + 4 + 4 + 2 + 2 + 2 + 2;

/// Largest node count this layout can address (bounded by the fixed
/// per-node interrupt bit assignment in spec/GLOSSARY terms, §6).
pub const MAX_NODES: usize = 4;

/// Byte offsets of every field inside one `buffer_vars` record, relative
/// to that record's start.
pub mod buffer_vars_offset {
    pub const BASE: usize = 0;
    pub const WPTR: usize = 2;
    pub const RPTR: usize = 4;
    pub const SIZE: usize = 6;
}

/// Byte offsets of every field inside one `can_status` record.
pub mod can_status_offset {
    pub const CAN_TYPE: usize = 22;
    pub const IOPIN: usize = 23;
    pub const MSGS_IN_SRAM: usize = 24;
    pub const SRAMBUF_SIZE: usize = 26;
    pub const RECEIVED: usize = 28;
    pub const SENT: usize = 30;
    pub const FILTERED: usize = 32;
    pub const CAN_MOD: usize = 34;
    pub const CAN_GSR: usize = 35;
    pub const CAN_RXERR: usize = 36;
    pub const CAN_TXERR: usize = 37;
    pub const BITRATE_I: usize = 38;
    pub const BITRATE: usize = 40;
    pub const MODE: usize = 42;
    pub const FLAGS2HICO: usize = 44;
    pub const FLAGS2HOST: usize = 46;
}

/// Byte offsets of every field inside the `board_status` record.
pub mod board_status_offset {
    pub const LPCBC_REV: usize = 18;
    pub const PCI104_POS: usize = 20;
    pub const HW_ID: usize = 21;
    pub const CMD_ACK_CNT: usize = 22;
    pub const ERROR: usize = 24;
    pub const FW_VERSION: usize = 26;
    pub const FW_DATE: usize = 28;
    pub const FW_RUNNING: usize = 32;
    pub const DEVICE_ID: usize = 34;
}

/// Byte offsets of every field inside one `can_msg` (frame) slot.
pub mod frame_offset {
    pub const FI: usize = 0;
    pub const TS: usize = 2;
    pub const ID: usize = 6;
    pub const DATA: usize = 10;
}

/// Fully resolved byte offsets of the DPM control area, computed once at
/// attach from the node count and DPM size (spec's Open Question #3: DPM
/// size is a runtime value, not a compile-time 2CH/4CH constant).
#[derive(Debug, Clone, Copy)]
pub struct ControlAreaLayout {
    pub node_count: usize,
    pub message_area_size: usize,
    pub tx_buffers: usize,
    pub rx_buffers: usize,
    pub can_status: usize,
    pub board_status: usize,
    pub args: usize,
    pub int_enable: usize,
    pub int_count: usize,
    pub mb_board2host: usize,
    pub mb_host2board: usize,
}

impl ControlAreaLayout {
    /// Computes the control-area layout for a DPM of `dpm_size` bytes
    /// carrying `node_count` CAN nodes. The control area is overlaid at
    /// `dpm_size - control_area_size`; everything before it is the
    /// message-slot area (spec §4.A).
    pub fn new(dpm_size: usize, node_count: usize) -> Result<Self> {
        if node_count == 0 || node_count > MAX_NODES {
            log::error!("ControlAreaLayout: unsupported node_count {}", node_count);
            return Err(DriverError::IoError);
        }
        let per_node = BUFFER_VARS_SIZE * 2 + CAN_STATUS_SIZE;
        let control_area_size = node_count * per_node + CONTROL_AREA_TAIL_SIZE;
        if control_area_size > dpm_size {
            log::error!(
                "ControlAreaLayout: dpm_size {} too small for control area {}",
                dpm_size, control_area_size
            );
            return Err(DriverError::IoError);
        }

        let control_area = dpm_size - control_area_size;
        let tx_buffers = control_area;
        let rx_buffers = tx_buffers + node_count * BUFFER_VARS_SIZE;
        let can_status = rx_buffers + node_count * BUFFER_VARS_SIZE;
        let board_status = can_status + node_count * CAN_STATUS_SIZE;
        let args = board_status + BOARD_STATUS_SIZE;
        let int_enable = args + 8;
        let int_count = int_enable + 2;
        let mb_board2host = int_count + 2;
        let mb_host2board = mb_board2host + 2;

        Ok(Self {
            node_count,
            message_area_size: control_area,
            tx_buffers,
            rx_buffers,
            can_status,
            board_status,
            args,
            int_enable,
            int_count,
            mb_board2host,
            mb_host2board,
        })
    }

    pub fn tx_vars_offset(&self, node: usize) -> usize {
        self.tx_buffers + node * BUFFER_VARS_SIZE
    }

    pub fn rx_vars_offset(&self, node: usize) -> usize {
        self.rx_buffers + node * BUFFER_VARS_SIZE
    }

    pub fn can_status_offset(&self, node: usize) -> usize {
        self.can_status + node * CAN_STATUS_SIZE
    }
}

/// A fixed-size CAN frame record, decoded from the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub info: FrameInfo,
    pub timestamp_us: u32,
    pub id: u32,
    pub data: [u8; 8],
}

/// The 16-bit frame-info word: dlc(4) | rtr(1) | ff(1) | dos(1) | iopin(1)
/// | node(2) | reserved(6), bit 0 upward — fixed by the firmware ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo(pub u16);

impl FrameInfo {
    pub fn new(dlc: u8, rtr: bool, extended: bool, overrun: bool, iopin: bool, node: u8) -> Self {
        let mut word = (dlc as u16 & 0xf)
            | ((rtr as u16) << 4)
            | ((extended as u16) << 5)
            | ((overrun as u16) << 6)
            | ((iopin as u16) << 7);
        word |= ((node as u16) & 0x3) << 8;
        Self(word)
    }

    pub fn dlc(&self) -> u8 {
        (self.0 & 0xf) as u8
    }
    pub fn rtr(&self) -> bool {
        (self.0 >> 4) & 1 != 0
    }
    pub fn extended(&self) -> bool {
        (self.0 >> 5) & 1 != 0
    }
    pub fn data_overrun(&self) -> bool {
        (self.0 >> 6) & 1 != 0
    }
    pub fn iopin(&self) -> bool {
        (self.0 >> 7) & 1 != 0
    }
    pub fn node(&self) -> u8 {
        ((self.0 >> 8) & 0x3) as u8
    }
}

// ---------------------------------------------------------------------
// Command codes (spec §6)
// ---------------------------------------------------------------------

pub mod command {
    pub const SET_BITRATE: u16 = 2;
    pub const SET_MODE: u16 = 3;
    pub const CLR_OVERRUN: u16 = 4;
    pub const CLR_FILTERS: u16 = 5;
    pub const SET_RANGE_FILTER: u16 = 6;
    pub const SET_MASK_FILTER: u16 = 7;
    pub const RESET_TIMESTAMP: u16 = 8;
    pub const SET_BTR: u16 = 9;
    pub const SET_SJW_INCREMENT: u16 = 10;
    pub const GET_ERR_STAT: u16 = 11;
    pub const CLR_ERR_STAT: u16 = 12;
    pub const SET_CAN_TYPE: u16 = 13;
    pub const PRINT_EXCEPTION: u16 = 0x81;
    pub const SERIAL_DEBUG: u16 = 0x82;
    pub const PRODUCTION_OK: u16 = 0x83;
}

/// Firmware status codes returned in the first argument cell after a
/// command ack (spec §4.C step 7).
pub mod firmware_status {
    pub const OK: u32 = 1;
    pub const INVALID_ARGUMENT: u32 = 2;
    pub const INVALID_COMMAND: u32 = 3;
    pub const IGNORED: u32 = 4;
}

/// Bitrate indices recognised by `CMD_SET_BITRATE`.
pub mod bitrate {
    pub const B10K: u32 = 0;
    pub const B20K: u32 = 1;
    pub const B50K: u32 = 2;
    pub const B100K: u32 = 3;
    pub const B125K: u32 = 4;
    pub const B250K: u32 = 5;
    pub const B500K: u32 = 6;
    pub const B800K: u32 = 7;
    pub const B1000K: u32 = 8;
}

/// Node operating modes, recognised by `CMD_SET_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Baudscan,
    Passive,
    Active,
    Reset,
    Disabled,
}

impl Mode {
    pub const BAUDSCAN: u16 = 1;
    pub const PASSIVE: u16 = 2;
    pub const ACTIVE: u16 = 3;
    pub const RESET: u16 = 4;
    pub const DISABLED: u16 = 0xdead;

    pub fn code(self) -> u16 {
        match self {
            Self::Baudscan => Self::BAUDSCAN,
            Self::Passive => Self::PASSIVE,
            Self::Active => Self::ACTIVE,
            Self::Reset => Self::RESET,
            Self::Disabled => Self::DISABLED,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            Self::BAUDSCAN => Some(Self::Baudscan),
            Self::PASSIVE => Some(Self::Passive),
            Self::ACTIVE => Some(Self::Active),
            Self::RESET => Some(Self::Reset),
            Self::DISABLED => Some(Self::Disabled),
            _ => None,
        }
    }
}

bitflags! {
    /// Interrupt-reason bits, shared by `mb_board2host` and `int_enable`.
    pub struct IntBits: u16 {
        const CAN1_RX    = 1 << 0;
        const CAN1_TX    = 1 << 1;
        const CAN2_RX    = 1 << 4;
        const CAN2_TX    = 1 << 5;
        const CMD_ACK    = 1 << 8;
        const ERROR      = 1 << 9;
        const EXCEPTION  = 1 << 10;
        const CAN3_RX    = 1 << 11;
        const CAN3_TX    = 1 << 12;
        const CAN4_RX    = 1 << 13;
        const CAN4_TX    = 1 << 14;
    }
}

impl IntBits {
    /// rx/tx bit pair for node index `i` (0-based), per the fixed
    /// per-node assignment in spec §6.
    pub fn node_rx_tx(i: usize) -> Option<(IntBits, IntBits)> {
        match i {
            0 => Some((IntBits::CAN1_RX, IntBits::CAN1_TX)),
            1 => Some((IntBits::CAN2_RX, IntBits::CAN2_TX)),
            2 => Some((IntBits::CAN3_RX, IntBits::CAN3_TX)),
            3 => Some((IntBits::CAN4_RX, IntBits::CAN4_TX)),
            _ => None,
        }
    }
}

bitflags! {
    /// Host→board flag word (`flags2hico` / `can_status.flags2hico`).
    pub struct HostFlags: u16 {
        const AUTOCLR_OVERRUN = 1 << 0;
        const FILTERS_ACTIVE  = 1 << 1;
    }
}

/// Firmware-state codes (`board_status.fw_running`).
pub mod fw_state {
    pub const FW1: u16 = 0xf1f1;
    pub const FW2: u16 = 0xf2f2;
    pub const EXCEPTION: u16 = 0xfefe;
}

/// Board error codes (`board_status.error`).
pub mod board_error {
    pub const OK: u16 = 0;
    pub const INVALID_FW_IMAGE_IN_DPM: u16 = 2;
    pub const INVALID_FW2_IMAGE: u16 = 3;
    pub const EXCEPT_WATCHDOG: u16 = 0x8001;
    pub const EXCEPT_SOFTWARE: u16 = 0x8002;
    pub const EXCEPT_DATA_ABORT: u16 = 0x8003;
    pub const EXCEPT_UNDEF_INSTR: u16 = 0x8004;
    pub const EXCEPT_INVALID: u16 = 0x80ff;
}

/// CAN-node transceiver types (`can_status.can_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverType {
    Empty,
    HighSpeed,
    FaultTolerant,
    Reserved,
    Unknown,
}

impl TransceiverType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Empty,
            1 => Self::HighSpeed,
            2 => Self::FaultTolerant,
            3 => Self::Reserved,
            _ => Self::Unknown,
        }
    }
}

/// Size in bytes when updating firmware via the DPM block pump.
pub const FW_UPDATE_BLOCK_SIZE: usize = 0x1000;

//! The CR30 command set.

use serde::{Deserialize, Serialize};

use crate::{
    packet::{Frame, PacketCodec, START_COMMAND, START_INFO},
    spd::ChunkType,
};

pub const CMD_INFO: u8 = 0x0A;
pub const CMD_MEASURE: u8 = 0x01;
pub const CMD_BLACK_CALIBRATION: u8 = 0x10;
pub const CMD_WHITE_CALIBRATION: u8 = 0x11;
pub const CMD_CHECK: u8 = 0x13;
pub const CMD_INIT: u8 = 0x17;
pub const CMD_PARAMETER: u8 = 0x28;

pub const SUBCMD_TRIGGER: u8 = 0x00;
pub const SUBCMD_HEADER: u8 = 0x09;

/// Parameter indices queried at the end of the handshake.
pub const PARAMETER_INDICES: [u8; 6] = [0x00, 0x01, 0x02, 0x03, 0x04, 0xFF];

const CHECK_PAYLOAD: &[u8; 12] = b"Check\0\0\0\0\0\0\0";

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InfoKind {
    Name = 0x00,
    Serial = 0x01,
    Firmware = 0x02,
    Build = 0x03,
}

impl InfoKind {
    pub const ALL: [InfoKind; 4] = [
        InfoKind::Name,
        InfoKind::Serial,
        InfoKind::Firmware,
        InfoKind::Build,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationTarget {
    Black,
    White,
}

impl core::fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CalibrationTarget::Black => write!(f, "black"),
            CalibrationTarget::White => write!(f, "white"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Info(InfoKind),
    Init,
    Check,
    Parameter(u8),
    Calibrate(CalibrationTarget),
    Trigger,
    ReadChunk(ChunkType),
}

impl Command {
    /// `(start, cmd, subcmd, param)` header bytes.
    pub fn header(&self) -> (u8, u8, u8, u8) {
        match self {
            Command::Info(kind) => (START_INFO, CMD_INFO, *kind as u8, 0x00),
            Command::Init => (START_COMMAND, CMD_INIT, 0x00, 0x00),
            Command::Check => (START_COMMAND, CMD_CHECK, 0x00, 0x00),
            Command::Parameter(index) => (START_COMMAND, CMD_PARAMETER, 0x00, *index),
            Command::Calibrate(CalibrationTarget::Black) => {
                (START_COMMAND, CMD_BLACK_CALIBRATION, 0x00, 0x00)
            }
            Command::Calibrate(CalibrationTarget::White) => {
                (START_COMMAND, CMD_WHITE_CALIBRATION, 0x00, 0x00)
            }
            Command::Trigger => (START_COMMAND, CMD_MEASURE, SUBCMD_TRIGGER, 0x00),
            Command::ReadChunk(chunk) => (START_COMMAND, CMD_MEASURE, *chunk as u8, 0x00),
        }
    }

    pub fn data(&self) -> &'static [u8] {
        match self {
            Command::Check => &CHECK_PAYLOAD[..],
            _ => &[],
        }
    }

    pub fn frame(&self, codec: &PacketCodec) -> Result<Frame, crate::Error> {
        let (start, cmd, subcmd, param) = self.header();
        codec.build(start, cmd, subcmd, param, self.data())
    }

    /// Whether `reply` answers this command. Parameter replies are told
    /// apart by their index byte.
    pub fn matches_reply(&self, reply: &Frame) -> bool {
        let (start, cmd, subcmd, param) = self.header();
        let same_header = reply.start == start && reply.cmd == cmd && reply.subcmd == subcmd;
        match self {
            Command::Parameter(_) => same_header && reply.param == param,
            _ => same_header,
        }
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (start, cmd, subcmd, param) = self.header();
        write!(f, "{start:02X} {cmd:02X} {subcmd:02X} {param:02X}")
    }
}

/// True for a measurement header frame (`BB 01 09`).
pub fn is_measurement_header(frame: &Frame) -> bool {
    frame.start == START_COMMAND && frame.cmd == CMD_MEASURE && frame.subcmd == SUBCMD_HEADER
}

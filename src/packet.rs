//! Fixed 60 byte CR30 frames.
//!
//! ```text
//! [0]      start    0xAA (info query) or 0xBB (command)
//! [1]      cmd
//! [2]      subcmd
//! [3]      param
//! [4..56)  payload, zero padded
//! [56..58) unused, zero
//! [58]     marker   0xFF, or 0x00 on 0xBB frames
//! [59]     checksum over [0..58)
//! ```

pub const FRAME_SIZE: usize = 60;
pub const PAYLOAD_OFFSET: usize = 4;
pub const PAYLOAD_SIZE: usize = 52;
pub const MARKER_OFFSET: usize = 58;
pub const CHECKSUM_OFFSET: usize = 59;

pub const START_INFO: u8 = 0xAA;
pub const START_COMMAND: u8 = 0xBB;

pub const MARKER_SENTINEL: u8 = 0xFF;
pub const MARKER_ALTERNATE: u8 = 0x00;

pub type FrameBytes = [u8; FRAME_SIZE];

/// Computes the checksum byte from the first 58 bytes of a frame.
pub type ChecksumFn = fn(&[u8]) -> u8;

/// Byte sum mod 256 over `[0..58)`; command frames (start `0xBB`) subtract one.
pub fn device_checksum(bytes: &[u8]) -> u8 {
    let end = bytes.len().min(MARKER_OFFSET);
    let sum = bytes[..end]
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte));

    match bytes.first() {
        Some(&START_COMMAND) => sum.wrapping_sub(1),
        _ => sum,
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame must be {FRAME_SIZE} bytes, got {0}")]
    Length(usize),
    #[error("unknown start byte 0x{0:02X}")]
    StartByte(u8),
    #[error("bad marker 0x{marker:02X} for start byte 0x{start:02X}")]
    Marker { start: u8, marker: u8 },
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },
}

impl FrameError {
    /// True when the bytes had a valid frame shape and only the checksum failed.
    pub fn is_checksum(&self) -> bool {
        matches!(self, FrameError::Checksum { .. })
    }
}

/// A decoded frame. The checksum is not stored; it is recomputed on encode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub start: u8,
    pub cmd: u8,
    pub subcmd: u8,
    pub param: u8,
    pub payload: [u8; PAYLOAD_SIZE],
    pub marker: u8,
}

impl Frame {
    /// The header triple used to route replies.
    pub fn header(&self) -> (u8, u8, u8) {
        (self.start, self.cmd, self.subcmd)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// NUL-trimmed ASCII text from `payload[range]`.
    pub fn ascii(&self, range: core::ops::Range<usize>) -> String {
        let end = range.end.min(PAYLOAD_SIZE);
        let start = range.start.min(end);
        self.payload[start..end]
            .iter()
            .filter(|byte| byte.is_ascii() && !byte.is_ascii_control())
            .map(|byte| *byte as char)
            .collect::<String>()
            .trim()
            .to_string()
    }

    fn unchecked_bytes(&self) -> FrameBytes {
        let mut bytes = [0u8; FRAME_SIZE];
        bytes[0] = self.start;
        bytes[1] = self.cmd;
        bytes[2] = self.subcmd;
        bytes[3] = self.param;
        bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_SIZE].copy_from_slice(&self.payload);
        bytes[MARKER_OFFSET] = self.marker;
        bytes
    }
}

fn marker_allowed(start: u8, marker: u8) -> bool {
    match start {
        START_INFO => marker == MARKER_SENTINEL,
        START_COMMAND => marker == MARKER_SENTINEL || marker == MARKER_ALTERNATE,
        _ => false,
    }
}

/// Builds and parses frames. The checksum algorithm is injected so it can be
/// corrected without touching the framing.
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    checksum: ChecksumFn,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(device_checksum)
    }
}

impl PacketCodec {
    pub fn new(checksum: ChecksumFn) -> Self {
        Self { checksum }
    }

    /// Builds a frame, right-padding `data` with zeros.
    pub fn build(
        &self,
        start: u8,
        cmd: u8,
        subcmd: u8,
        param: u8,
        data: &[u8],
    ) -> Result<Frame, crate::Error> {
        if data.len() > PAYLOAD_SIZE {
            return Err(crate::Error::PayloadTooLarge(data.len()));
        }

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[..data.len()].copy_from_slice(data);

        Ok(Frame {
            start,
            cmd,
            subcmd,
            param,
            payload,
            marker: MARKER_SENTINEL,
        })
    }

    /// Encodes a frame to wire bytes with its checksum appended.
    pub fn encode(&self, frame: &Frame) -> FrameBytes {
        let mut bytes = frame.unchecked_bytes();
        bytes[CHECKSUM_OFFSET] = (self.checksum)(&bytes[..MARKER_OFFSET]);
        bytes
    }

    /// Shape checks only: length, start byte and marker.
    pub fn check_structure(&self, bytes: &[u8]) -> Result<(), FrameError> {
        if bytes.len() != FRAME_SIZE {
            return Err(FrameError::Length(bytes.len()));
        }
        let start = bytes[0];
        if start != START_INFO && start != START_COMMAND {
            return Err(FrameError::StartByte(start));
        }
        let marker = bytes[MARKER_OFFSET];
        if !marker_allowed(start, marker) {
            return Err(FrameError::Marker { start, marker });
        }
        Ok(())
    }

    pub fn is_valid(&self, bytes: &[u8]) -> bool {
        self.check_structure(bytes).is_ok()
    }

    /// True only for a structurally valid frame whose checksum byte matches.
    pub fn verify_checksum(&self, bytes: &[u8]) -> bool {
        self.check_structure(bytes).is_ok()
            && (self.checksum)(&bytes[..MARKER_OFFSET]) == bytes[CHECKSUM_OFFSET]
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        self.check_structure(bytes)?;

        let expected = (self.checksum)(&bytes[..MARKER_OFFSET]);
        let actual = bytes[CHECKSUM_OFFSET];
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[PAYLOAD_OFFSET..PAYLOAD_OFFSET + PAYLOAD_SIZE]);

        Ok(Frame {
            start: bytes[0],
            cmd: bytes[1],
            subcmd: bytes[2],
            param: bytes[3],
            payload,
            marker: bytes[MARKER_OFFSET],
        })
    }
}

/// Splits a raw byte stream into frames.
///
/// Bytes before a plausible start byte are skipped. When 60 buffered bytes do
/// not form a valid frame the first byte is dropped and the scan resumes, so a
/// single corrupt byte costs at most one frame.
#[derive(Debug, Default)]
pub struct FrameReader {
    codec: PacketCodec,
    buffer: Vec<u8>,
    dropped: usize,
}

impl FrameReader {
    pub fn new(codec: PacketCodec) -> Self {
        Self {
            codec,
            buffer: Vec::with_capacity(FRAME_SIZE * 2),
            dropped: 0,
        }
    }

    /// Number of bytes discarded while resynchronising.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Feeds received bytes and returns every complete, valid frame.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if self.buffer.is_empty() && byte != START_INFO && byte != START_COMMAND {
                self.dropped += 1;
                continue;
            }
            self.buffer.push(byte);

            while self.buffer.len() >= FRAME_SIZE {
                match self.codec.parse(&self.buffer[..FRAME_SIZE]) {
                    Ok(frame) => {
                        log::trace!("received frame: {:02X?}", &self.buffer[..4]);
                        self.buffer.drain(..FRAME_SIZE);
                        frames.push(frame);
                    }
                    Err(e) => {
                        log::trace!("dropping byte while resynchronising: {}", e);
                        self.buffer.remove(0);
                        self.dropped += 1;
                        let skip = self
                            .buffer
                            .iter()
                            .position(|b| *b == START_INFO || *b == START_COMMAND)
                            .unwrap_or(self.buffer.len());
                        self.buffer.drain(..skip);
                        self.dropped += skip;
                    }
                }
            }
        }

        frames
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = FrameError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        PacketCodec::default().parse(bytes)
    }
}

impl From<&Frame> for FrameBytes {
    fn from(frame: &Frame) -> Self {
        PacketCodec::default().encode(frame)
    }
}

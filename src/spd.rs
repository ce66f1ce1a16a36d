//! Reassembly of a spectral measurement from its four chunk frames.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    color::Xyz,
    command::CMD_MEASURE,
    packet::{Frame, START_COMMAND},
};

pub const SPD_BAND_COUNT: usize = 31;
pub const SPD_FIRST_WAVELENGTH: f64 = 400.0;
pub const SPD_STEP: f64 = 10.0;

/// Bytes of float data decoded into the 31 bands.
const SPD_USABLE_BYTES: usize = SPD_BAND_COUNT * 4;
const SPD_BUFFER_SIZE: usize = 126;

/// Chunk data starts two bytes into the frame payload.
const CHUNK_DATA_OFFSET: usize = 2;
const XYZ_COPY_SIZE: usize = 6;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkType {
    SpdLow = 0x10,
    SpdMid = 0x11,
    SpdHigh = 0x12,
    Xyz = 0x13,
}

impl ChunkType {
    pub const ALL: [ChunkType; 4] = [
        ChunkType::SpdLow,
        ChunkType::SpdMid,
        ChunkType::SpdHigh,
        ChunkType::Xyz,
    ];

    pub fn from_subcmd(subcmd: u8) -> Option<Self> {
        match subcmd {
            0x10 => Some(ChunkType::SpdLow),
            0x11 => Some(ChunkType::SpdMid),
            0x12 => Some(ChunkType::SpdHigh),
            0x13 => Some(ChunkType::Xyz),
            _ => None,
        }
    }

    /// Number of data bytes the chunk carries.
    pub fn data_len(&self) -> usize {
        match self {
            ChunkType::SpdLow | ChunkType::SpdMid => 48,
            ChunkType::SpdHigh => 30,
            ChunkType::Xyz => XYZ_COPY_SIZE,
        }
    }

    /// Destination range in the SPD buffer, `None` for the XYZ copy.
    fn buffer_range(&self) -> Option<core::ops::Range<usize>> {
        match self {
            ChunkType::SpdLow => Some(0..48),
            ChunkType::SpdMid => Some(48..96),
            ChunkType::SpdHigh => Some(96..126),
            ChunkType::Xyz => None,
        }
    }
}

impl core::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "chunk 0x{:02X}", *self as u8)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpdChunk {
    pub chunk_type: ChunkType,
    pub bytes: Vec<u8>,
}

impl SpdChunk {
    pub fn new(chunk_type: ChunkType, bytes: &[u8]) -> Self {
        let len = chunk_type.data_len().min(bytes.len());
        Self {
            chunk_type,
            bytes: bytes[..len].to_vec(),
        }
    }

    /// Extracts the chunk carried by a `BB 01 1x` frame.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.start != START_COMMAND || frame.cmd != CMD_MEASURE {
            return None;
        }
        let chunk_type = ChunkType::from_subcmd(frame.subcmd)?;
        let start = CHUNK_DATA_OFFSET;
        Some(Self::new(
            chunk_type,
            &frame.payload[start..start + chunk_type.data_len()],
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblyState {
    NotStarted,
    Collecting(BTreeSet<ChunkType>),
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Chunk stored; `remaining` chunk types still outstanding.
    Accepted { remaining: usize },
    /// Chunk type was already stored; nothing changed.
    Duplicate,
    Complete,
}

/// Accumulates chunks of one in-flight measurement.
///
/// Chunks may arrive in any order. A repeated chunk type is ignored.
#[derive(Clone, Debug)]
pub struct SpdAssembler {
    state: AssemblyState,
    buffer: [u8; SPD_BUFFER_SIZE],
    xyz_copy: Option<Xyz>,
}

impl Default for SpdAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl SpdAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblyState::NotStarted,
            buffer: [0u8; SPD_BUFFER_SIZE],
            xyz_copy: None,
        }
    }

    pub fn state(&self) -> &AssemblyState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = AssemblyState::NotStarted;
        self.buffer = [0u8; SPD_BUFFER_SIZE];
        self.xyz_copy = None;
    }

    pub fn received(&self) -> BTreeSet<ChunkType> {
        match &self.state {
            AssemblyState::NotStarted => BTreeSet::new(),
            AssemblyState::Collecting(received) => received.clone(),
            AssemblyState::Complete => ChunkType::ALL.into_iter().collect(),
        }
    }

    pub fn missing(&self) -> Vec<ChunkType> {
        let received = self.received();
        ChunkType::ALL
            .into_iter()
            .filter(|chunk| !received.contains(chunk))
            .collect()
    }

    pub fn ingest(&mut self, chunk: &SpdChunk) -> Progress {
        let mut received = match &self.state {
            AssemblyState::Complete => return Progress::Duplicate,
            AssemblyState::NotStarted => BTreeSet::new(),
            AssemblyState::Collecting(received) => received.clone(),
        };

        if !received.insert(chunk.chunk_type) {
            log::trace!("ignoring duplicate {}", chunk.chunk_type);
            return Progress::Duplicate;
        }

        match chunk.chunk_type.buffer_range() {
            Some(range) => {
                let len = chunk.bytes.len().min(range.len());
                self.buffer[range.start..range.start + len].copy_from_slice(&chunk.bytes[..len]);
            }
            None => self.xyz_copy = decode_xyz_copy(&chunk.bytes),
        }

        let remaining = ChunkType::ALL.len() - received.len();
        if remaining == 0 {
            self.state = AssemblyState::Complete;
            Progress::Complete
        } else {
            self.state = AssemblyState::Collecting(received);
            Progress::Accepted { remaining }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == AssemblyState::Complete
    }

    /// The 31 bands, 400 nm to 700 nm in 10 nm steps.
    pub fn extract_spd(&self) -> Result<[f32; SPD_BAND_COUNT], crate::Error> {
        if !self.is_complete() {
            return Err(crate::Error::IncompleteData {
                missing: self.missing(),
            });
        }

        let mut spd = [0f32; SPD_BAND_COUNT];
        for (band, bytes) in self.buffer[..SPD_USABLE_BYTES].chunks_exact(4).enumerate() {
            spd[band] = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(spd)
    }

    /// XYZ copy carried by chunk 0x13, once received.
    pub fn xyz_copy(&self) -> Option<Xyz> {
        self.xyz_copy
    }
}

/// Wavelengths of the device bands.
pub fn spd_wavelengths() -> Vec<f64> {
    (0..SPD_BAND_COUNT)
        .map(|band| SPD_FIRST_WAVELENGTH + band as f64 * SPD_STEP)
        .collect()
}

/// Three little-endian u16 values in hundredths.
fn decode_xyz_copy(bytes: &[u8]) -> Option<Xyz> {
    if bytes.len() < XYZ_COPY_SIZE {
        return None;
    }
    let component = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]) as f64 / 100.0;
    Some(Xyz::new(component(0), component(2), component(4)))
}

/// Inverse of the chunk 0x13 encoding, used by simulators and tests.
pub fn encode_xyz_copy(xyz: &Xyz) -> [u8; XYZ_COPY_SIZE] {
    let mut bytes = [0u8; XYZ_COPY_SIZE];
    for (i, value) in [xyz.x, xyz.y, xyz.z].into_iter().enumerate() {
        let scaled = (value * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
        bytes[i * 2..i * 2 + 2].copy_from_slice(&scaled.to_le_bytes());
    }
    bytes
}

/// Splits 31 bands into the three SPD chunks as the device sends them.
pub fn encode_spd_chunks(spd: &[f32; SPD_BAND_COUNT]) -> [SpdChunk; 3] {
    let mut buffer = [0u8; SPD_BUFFER_SIZE];
    for (band, value) in spd.iter().enumerate() {
        buffer[band * 4..band * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
    [
        SpdChunk::new(ChunkType::SpdLow, &buffer[0..48]),
        SpdChunk::new(ChunkType::SpdMid, &buffer[48..96]),
        SpdChunk::new(ChunkType::SpdHigh, &buffer[96..126]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spd() -> [f32; SPD_BAND_COUNT] {
        let mut spd = [0f32; SPD_BAND_COUNT];
        for (i, value) in spd.iter_mut().enumerate() {
            *value = 10.0 + i as f32 * 2.5;
        }
        spd
    }

    fn chunks(spd: &[f32; SPD_BAND_COUNT]) -> Vec<SpdChunk> {
        let mut chunks = encode_spd_chunks(spd).to_vec();
        chunks.push(SpdChunk::new(
            ChunkType::Xyz,
            &encode_xyz_copy(&Xyz::new(41.24, 21.26, 1.93)),
        ));
        chunks
    }

    #[test]
    fn test_chunk_frames_need_command_start() {
        let codec = crate::packet::PacketCodec::default();
        let frame = codec.build(0xBB, 0x01, 0x12, 0x00, &[0u8; 32]).unwrap();
        assert_eq!(SpdChunk::from_frame(&frame).map(|c| c.chunk_type), Some(ChunkType::SpdHigh));

        let info = codec.build(0xAA, 0x01, 0x12, 0x00, &[0u8; 32]).unwrap();
        assert!(SpdChunk::from_frame(&info).is_none());
    }

    #[test]
    fn test_chunk_sizes() {
        let lens: Vec<usize> = chunks(&sample_spd()).iter().map(|c| c.bytes.len()).collect();
        assert_eq!(lens, vec![48, 48, 30, 6]);
    }

    #[test]
    fn test_complete_in_any_order() {
        let spd = sample_spd();
        let all = chunks(&spd);
        let orders: [[usize; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [1, 3, 0, 2], [2, 0, 3, 1]];

        for order in orders {
            let mut assembler = SpdAssembler::new();
            for (step, index) in order.iter().enumerate() {
                assert!(!assembler.is_complete());
                let progress = assembler.ingest(&all[*index]);
                if step == 3 {
                    assert_eq!(progress, Progress::Complete);
                } else {
                    assert_eq!(progress, Progress::Accepted { remaining: 3 - step });
                }
            }
            assert!(assembler.is_complete());
            assert_eq!(assembler.extract_spd().unwrap(), spd);
        }
    }

    #[test]
    fn test_duplicate_chunk_is_ignored() {
        let spd = sample_spd();
        let all = chunks(&spd);

        let mut once = SpdAssembler::new();
        for chunk in &all {
            once.ingest(chunk);
        }

        let mut twice = SpdAssembler::new();
        twice.ingest(&all[0]);
        let mut altered = all[0].clone();
        altered.bytes.iter_mut().for_each(|b| *b = 0xEE);
        assert_eq!(twice.ingest(&altered), Progress::Duplicate);
        for chunk in &all[1..] {
            twice.ingest(chunk);
        }
        assert_eq!(twice.ingest(&all[2]), Progress::Duplicate);

        assert_eq!(once.extract_spd().unwrap(), twice.extract_spd().unwrap());
    }

    #[test]
    fn test_extract_before_complete_fails() {
        let all = chunks(&sample_spd());
        let mut assembler = SpdAssembler::new();
        assembler.ingest(&all[0]);
        assembler.ingest(&all[3]);

        match assembler.extract_spd() {
            Err(crate::Error::IncompleteData { missing }) => {
                assert_eq!(missing, vec![ChunkType::SpdMid, ChunkType::SpdHigh]);
            }
            other => panic!("expected IncompleteData, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_discards_partial_data() {
        let all = chunks(&sample_spd());
        let mut assembler = SpdAssembler::new();
        assembler.ingest(&all[0]);
        assembler.ingest(&all[3]);
        assembler.reset();

        assert_eq!(assembler.state(), &AssemblyState::NotStarted);
        assert!(assembler.xyz_copy().is_none());
        assert_eq!(assembler.missing().len(), 4);
    }

    #[test]
    fn test_xyz_copy_decodes() {
        let all = chunks(&sample_spd());
        let mut assembler = SpdAssembler::new();
        assembler.ingest(&all[3]);
        let xyz = assembler.xyz_copy().unwrap();
        assert!((xyz.x - 41.24).abs() < 1e-9);
        assert!((xyz.y - 21.26).abs() < 1e-9);
        assert!((xyz.z - 1.93).abs() < 1e-9);
    }

    #[test]
    fn test_wavelengths() {
        let wavelengths = spd_wavelengths();
        assert_eq!(wavelengths.len(), 31);
        assert_eq!(wavelengths[0], 400.0);
        assert_eq!(wavelengths[30], 700.0);
    }
}

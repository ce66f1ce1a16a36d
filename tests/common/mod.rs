//! An in-memory CR30 that answers commands from a script.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use cr30::{
    color::Xyz,
    packet::{Frame, PacketCodec},
    session::{header_payload, SessionOptions},
    spd::{encode_spd_chunks, encode_xyz_copy, ChunkType, SPD_BAND_COUNT},
    Transport,
};
use tokio::time::Instant;

pub const NAME: &str = "CR30";
pub const MODEL: &str = "SD6870B667";
pub const SERIAL: &str = "M443L0787-V11.3";
pub const FIRMWARE: &str = "V10.0.0.0";

pub fn options() -> SessionOptions {
    SessionOptions {
        settle: Duration::ZERO,
        handshake_timeout: Duration::from_millis(200),
        calibration_timeout: Duration::from_millis(500),
        step_timeout: Duration::from_millis(300),
        button_timeout: Duration::from_secs(2),
        xyz_tolerance: 0.1,
    }
}

pub fn flat(value: f32) -> [f32; SPD_BAND_COUNT] {
    [value; SPD_BAND_COUNT]
}

/// What the simulated instrument reports.
#[derive(Clone, Debug)]
pub struct DeviceScript {
    pub name: &'static str,
    pub model: &'static str,
    pub serial: &'static str,
    pub firmware: &'static str,
    /// One spectrum per capture, reused cyclically.
    pub spectra: Vec<[f32; SPD_BAND_COUNT]>,
    pub header_xyz: Xyz,
    pub chunk_xyz: Xyz,
    pub calibration_status: u8,
    /// `(cmd, subcmd)` pairs the device never answers.
    pub silent: HashSet<(u8, u8)>,
    /// Sent in reply to the first chunk request of each capture instead of
    /// the requested chunk.
    pub burst: Option<Vec<ChunkType>>,
    /// `(cmd, subcmd)` pairs the device answers twice.
    pub repeated: HashSet<(u8, u8)>,
    /// How long the device takes to answer each `(cmd, subcmd)`.
    pub delays: HashMap<(u8, u8), Duration>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            name: NAME,
            model: MODEL,
            serial: SERIAL,
            firmware: FIRMWARE,
            spectra: vec![flat(50.0)],
            header_xyz: Xyz::new(41.25, 35.5, 12.0),
            chunk_xyz: Xyz::new(41.24, 35.5, 12.0),
            calibration_status: 0x01,
            silent: HashSet::new(),
            burst: None,
            repeated: HashSet::new(),
            delays: HashMap::new(),
        }
    }
}

impl DeviceScript {
    pub fn silence(mut self, cmd: u8, subcmd: u8) -> Self {
        self.silent.insert((cmd, subcmd));
        self
    }

    pub fn repeat(mut self, cmd: u8, subcmd: u8) -> Self {
        self.repeated.insert((cmd, subcmd));
        self
    }

    pub fn delay(mut self, cmd: u8, subcmd: u8, delay: Duration) -> Self {
        self.delays.insert((cmd, subcmd), delay);
        self
    }
}

struct Device {
    script: DeviceScript,
    captures: usize,
    burst_sent: bool,
    /// Replies with the instant they reach the host.
    queue: VecDeque<(Instant, Frame)>,
    sent: Vec<Frame>,
    button_presses: usize,
}

pub struct ScriptedTransport {
    codec: PacketCodec,
    connected: AtomicBool,
    device: Mutex<Device>,
}

impl ScriptedTransport {
    pub fn new(script: DeviceScript) -> Self {
        Self {
            codec: PacketCodec::default(),
            connected: AtomicBool::new(false),
            device: Mutex::new(Device {
                script,
                captures: 0,
                burst_sent: false,
                queue: VecDeque::new(),
                sent: Vec::new(),
                button_presses: 0,
            }),
        }
    }

    /// Queues `count` presses of the measure button; each one surfaces as an
    /// unsolicited measurement header once the queue runs dry.
    pub fn press_button(&self, count: usize) {
        self.device.lock().unwrap().button_presses += count;
    }

    /// Headers of every frame the host has sent.
    pub fn sent(&self) -> Vec<(u8, u8, u8, u8)> {
        self.device
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|f| (f.start, f.cmd, f.subcmd, f.param))
            .collect()
    }

    pub fn sent_count(&self, cmd: u8, subcmd: u8) -> usize {
        self.sent()
            .iter()
            .filter(|(_, c, s, _)| *c == cmd && *s == subcmd)
            .count()
    }
}

impl Device {
    fn frame(&self, start: u8, cmd: u8, subcmd: u8, param: u8, data: &[u8]) -> Frame {
        PacketCodec::default().build(start, cmd, subcmd, param, data).unwrap()
    }

    fn text(&self, subcmd: u8, fields: &[(usize, &str)]) -> Frame {
        let mut data = [0u8; 52];
        for (offset, text) in fields {
            data[*offset..*offset + text.len()].copy_from_slice(text.as_bytes());
        }
        self.frame(0xAA, 0x0A, subcmd, 0x00, &data)
    }

    fn header(&mut self) -> Frame {
        self.burst_sent = false;
        self.frame(0xBB, 0x01, 0x09, 0x00, &header_payload(&self.script.header_xyz))
    }

    fn chunk(&self, chunk_type: ChunkType) -> Frame {
        let spectra = &self.script.spectra;
        let spd = spectra[self.captures.saturating_sub(1) % spectra.len()];
        let bytes = match chunk_type {
            ChunkType::Xyz => encode_xyz_copy(&self.script.chunk_xyz).to_vec(),
            other => encode_spd_chunks(&spd)
                .into_iter()
                .find(|c| c.chunk_type == other)
                .unwrap()
                .bytes,
        };
        let mut data = vec![0u8, 0u8];
        data.extend(bytes);
        self.frame(0xBB, 0x01, chunk_type as u8, 0x00, &data)
    }

    fn respond(&mut self, request: &Frame) -> Vec<Frame> {
        if self.script.silent.contains(&(request.cmd, request.subcmd)) {
            return Vec::new();
        }
        match (request.start, request.cmd, request.subcmd) {
            (0xAA, 0x0A, 0x00) => vec![self.text(0x00, &[(5, self.script.name), (35, self.script.model)])],
            (0xAA, 0x0A, 0x01) => vec![self.text(0x01, &[(5, self.script.serial)])],
            (0xAA, 0x0A, 0x02) => vec![self.text(0x02, &[(5, self.script.firmware)])],
            (0xAA, 0x0A, 0x03) => vec![self.text(0x03, &[(5, "2021-06-01")])],
            (0xBB, 0x17, _) | (0xBB, 0x13, _) => vec![self.frame(0xBB, request.cmd, 0x00, 0x00, &[0x00, 0x01])],
            (0xBB, 0x28, _) => vec![self.frame(0xBB, 0x28, 0x00, request.param, &[request.param, 0x01])],
            (0xBB, 0x10, _) | (0xBB, 0x11, _) => {
                let status = self.script.calibration_status;
                vec![self.frame(0xBB, request.cmd, 0x00, 0x00, &[0x00, status])]
            }
            (0xBB, 0x01, 0x00) => {
                self.captures += 1;
                vec![self.header()]
            }
            (0xBB, 0x01, subcmd) => {
                let Some(requested) = ChunkType::from_subcmd(subcmd) else {
                    return Vec::new();
                };
                match self.script.burst.clone() {
                    Some(burst) if !self.burst_sent => {
                        self.burst_sent = true;
                        burst.into_iter().map(|c| self.chunk(c)).collect()
                    }
                    _ => vec![self.chunk(requested)],
                }
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    async fn connect(&self) -> Result<(), cr30::Error> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), cr30::Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), cr30::Error> {
        if !self.is_connected() {
            return Err(cr30::Error::Connection("not connected".to_string()));
        }
        let request = self.codec.parse(bytes)?;
        let mut device = self.device.lock().unwrap();
        device.sent.push(request.clone());
        let key = (request.cmd, request.subcmd);
        let mut replies = device.respond(&request);
        if device.script.repeated.contains(&key) {
            replies.extend(replies.clone());
        }
        let ready = Instant::now() + device.script.delays.get(&key).copied().unwrap_or_default();
        device.queue.extend(replies.into_iter().map(|frame| (ready, frame)));
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Frame>, cr30::Error> {
        if !self.is_connected() {
            return Err(cr30::Error::Connection("not connected".to_string()));
        }
        let deadline = Instant::now() + timeout;
        let next = {
            let mut device = self.device.lock().unwrap();
            match device.queue.front() {
                Some((ready, _)) if *ready > deadline => None,
                Some(_) => device.queue.pop_front(),
                None if device.button_presses > 0 => {
                    device.button_presses -= 1;
                    device.captures += 1;
                    Some((Instant::now(), device.header()))
                }
                None => None,
            }
        };
        match next {
            Some((ready, frame)) => {
                tokio::time::sleep_until(ready).await;
                Ok(Some(frame))
            }
            None => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    async fn flush(&self) -> Result<usize, cr30::Error> {
        let mut device = self.device.lock().unwrap();
        let dropped = device.queue.len();
        device.queue.clear();
        Ok(dropped)
    }
}

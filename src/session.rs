//! The command/response state machine for one CR30.
//!
//! A [`DeviceSession`] owns its transport for its whole lifetime. Every
//! exchange is a suspension point bounded by its own timeout; nothing is
//! retried. A failed calibration or measurement returns the session to
//! [`SessionState::Idle`], a lost link to [`SessionState::Disconnected`].

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    color::Xyz,
    command::{self, CalibrationTarget, Command, InfoKind, PARAMETER_INDICES},
    config::Config,
    packet::Frame,
    spd::{spd_wavelengths, ChunkType, Progress, SpdAssembler, SpdChunk},
    transport::Transport,
    Warning,
};

/// Offset of the device XYZ estimate inside the measurement header payload.
const HEADER_XYZ_OFFSET: usize = 2;
const CALIBRATION_STATUS_OK: u8 = 0x01;

pub const UNKNOWN: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaken,
    Idle,
    Calibrating,
    Measuring,
}

impl SessionState {
    fn is_ready(&self) -> bool {
        matches!(self, SessionState::Handshaken | SessionState::Idle)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub build: String,
    /// Hex payload of each `BB 28` parameter reply, by index.
    pub parameters: BTreeMap<u8, String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            model: UNKNOWN.to_string(),
            serial: UNKNOWN.to_string(),
            firmware: UNKNOWN.to_string(),
            build: UNKNOWN.to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

impl core::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.name, self.model, self.serial, self.firmware
        )
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Pause after opening the port before the first command.
    pub settle: Duration,
    pub handshake_timeout: Duration,
    pub calibration_timeout: Duration,
    pub step_timeout: Duration,
    pub button_timeout: Duration,
    /// Largest per-component difference tolerated between the header XYZ
    /// and the chunk 0x13 copy.
    pub xyz_tolerance: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            settle: Duration::from_millis(config.device.settle_ms),
            handshake_timeout: Duration::from_millis(config.device.handshake_timeout_ms),
            calibration_timeout: Duration::from_millis(config.device.calibration_timeout_ms),
            step_timeout: Duration::from_millis(config.device.step_timeout_ms),
            button_timeout: Duration::from_millis(config.device.button_timeout_ms),
            xyz_tolerance: config.measurement.xyz_tolerance,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub target: CalibrationTarget,
    pub success: bool,
    pub status: u8,
    pub raw: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementTrigger {
    Host,
    Button,
}

/// A measurement the device has announced but whose data has not been read.
#[derive(Debug)]
pub struct PendingMeasurement {
    header: Frame,
    trigger: MeasurementTrigger,
}

impl PendingMeasurement {
    pub fn trigger(&self) -> MeasurementTrigger {
        self.trigger
    }

    /// The device's own XYZ estimate from the header.
    pub fn device_xyz(&self) -> Option<Xyz> {
        header_xyz(&self.header)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralMeasurement {
    /// Percent reflectance, one value per wavelength.
    pub spd: Vec<f64>,
    pub wavelengths: Vec<f64>,
    pub device_xyz: Option<Xyz>,
    pub chunk_xyz: Option<Xyz>,
    pub trigger: MeasurementTrigger,
    pub warnings: Vec<Warning>,
    /// Hex dumps of the header and chunk payloads.
    pub raw: BTreeMap<String, String>,
}

impl SpectralMeasurement {
    pub fn has_integrity_warning(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, Warning::DataIntegrity { .. }))
    }
}

/// Decodes the device XYZ estimate from a measurement header.
pub fn header_xyz(frame: &Frame) -> Option<Xyz> {
    let bytes = &frame.payload[HEADER_XYZ_OFFSET..HEADER_XYZ_OFFSET + 12];
    let component = |i: usize| {
        f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as f64
    };
    let xyz = Xyz::new(component(0), component(4), component(8));
    xyz.to_array().iter().all(|c| c.is_finite()).then_some(xyz)
}

/// Header payload carrying `xyz`, as the device lays it out.
pub fn header_payload(xyz: &Xyz) -> [u8; HEADER_XYZ_OFFSET + 12] {
    let mut payload = [0u8; HEADER_XYZ_OFFSET + 12];
    for (i, value) in xyz.to_array().into_iter().enumerate() {
        let start = HEADER_XYZ_OFFSET + i * 4;
        payload[start..start + 4].copy_from_slice(&(value as f32).to_le_bytes());
    }
    payload
}

pub struct DeviceSession<T> {
    transport: T,
    options: SessionOptions,
    state: SessionState,
    info: Option<DeviceInfo>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, options: SessionOptions) -> Self {
        let state = if transport.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        Self {
            transport,
            options,
            state,
            info: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("session {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn require(&self, expected: &'static str, ok: bool) -> Result<(), crate::Error> {
        if ok {
            Ok(())
        } else {
            Err(crate::Error::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Settles the session after an operation: a lost link is terminal,
    /// anything else leaves the device idle.
    fn settle<R>(&mut self, result: Result<R, crate::Error>) -> Result<R, crate::Error> {
        match &result {
            Err(crate::Error::Connection(_)) => self.set_state(SessionState::Disconnected),
            _ => self.set_state(SessionState::Idle),
        }
        result
    }

    pub async fn connect(&mut self) -> Result<(), crate::Error> {
        self.require("Disconnected", self.state == SessionState::Disconnected)?;
        self.transport.connect().await?;
        if !self.options.settle.is_zero() {
            tokio::time::sleep(self.options.settle).await;
        }
        self.set_state(SessionState::Connected);
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), crate::Error> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        let result = self.transport.disconnect().await;
        self.set_state(SessionState::Disconnected);
        result
    }

    /// Waits until `deadline` for a frame matching `wanted`, dropping others.
    async fn await_frame(
        &self,
        deadline: Instant,
        wanted: impl Fn(&Frame) -> bool + Send,
    ) -> Result<Option<Frame>, crate::Error> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.recv(remaining).await? {
                Some(frame) if wanted(&frame) => return Ok(Some(frame)),
                Some(frame) => log::trace!("ignoring unexpected frame {:02X?}", frame.header()),
                None => return Ok(None),
            }
        }
    }

    /// Sends `command` and waits for its reply. Late or repeated answers to
    /// earlier commands are dropped until the deadline.
    async fn exchange(&self, command: Command, timeout: Duration) -> Result<Option<Frame>, crate::Error> {
        let frame = command.frame(self.transport.codec())?;
        let deadline = Instant::now() + timeout;
        match self.transport.send_recv(&frame, timeout).await? {
            Some(reply) if command.matches_reply(&reply) => Ok(Some(reply)),
            Some(reply) => {
                log::trace!("ignoring unexpected frame {:02X?} after {command}", reply.header());
                self.await_frame(deadline, move |reply| command.matches_reply(reply))
                    .await
            }
            None => Ok(None),
        }
    }

    /// Queries name, model, serial and firmware, then runs the init, check and
    /// parameter exchanges the device expects before it accepts commands.
    pub async fn handshake(&mut self) -> Result<&DeviceInfo, crate::Error> {
        self.require(
            "Connected",
            matches!(
                self.state,
                SessionState::Connected | SessionState::Handshaken | SessionState::Idle
            ),
        )?;
        let timeout = self.options.handshake_timeout;
        if let Err(e) = self.transport.flush().await {
            return self.fail_handshake(e);
        }

        let mut info = DeviceInfo::default();
        for kind in InfoKind::ALL {
            let reply = match self.exchange(Command::Info(kind), timeout).await {
                Ok(reply) => reply,
                Err(e) => return self.fail_handshake(e),
            };
            let Some(reply) = reply else {
                if kind == InfoKind::Name {
                    return self.fail_handshake(crate::Error::Handshake(format!(
                        "no answer to {} within {timeout:?}",
                        Command::Info(kind)
                    )));
                }
                log::warn!("no answer to {}", Command::Info(kind));
                continue;
            };
            match kind {
                InfoKind::Name => {
                    info.name = non_empty(reply.ascii(5..30));
                    info.model = non_empty(reply.ascii(35..45));
                    if info.name == UNKNOWN {
                        return self.fail_handshake(crate::Error::Handshake(format!(
                            "unrecognized info response {}",
                            hex::encode(reply.payload())
                        )));
                    }
                }
                InfoKind::Serial => info.serial = non_empty(reply.ascii(5..25)),
                InfoKind::Firmware => info.firmware = non_empty(reply.ascii(5..25)),
                InfoKind::Build => info.build = non_empty(reply.ascii(5..25)),
            }
        }

        for command in [Command::Init, Command::Check] {
            match self.exchange(command, timeout).await {
                Ok(Some(_)) => {}
                Ok(None) => log::debug!("no answer to {command}"),
                Err(e) => return self.fail_handshake(e),
            }
        }
        for index in PARAMETER_INDICES {
            match self.exchange(Command::Parameter(index), timeout).await {
                Ok(Some(reply)) => {
                    info.parameters.insert(index, hex::encode(reply.payload()));
                }
                Ok(None) => log::debug!("no answer to parameter {index:#04x}"),
                Err(e) => return self.fail_handshake(e),
            }
        }

        log::info!("Handshake complete: {info}");
        self.set_state(SessionState::Handshaken);
        let info: &DeviceInfo = self.info.insert(info);
        Ok(info)
    }

    fn fail_handshake<R>(&mut self, e: crate::Error) -> Result<R, crate::Error> {
        if let crate::Error::Connection(_) = e {
            self.set_state(SessionState::Disconnected);
        }
        Err(e)
    }

    /// Runs the requested calibrations, white first.
    pub async fn calibrate(&mut self, white: bool, black: bool) -> Result<Vec<CalibrationReport>, crate::Error> {
        let mut targets = Vec::new();
        if white {
            targets.push(CalibrationTarget::White);
        }
        if black {
            targets.push(CalibrationTarget::Black);
        }
        self.calibrate_sequence(&targets).await
    }

    /// Runs calibrations in the given order, stopping at the first timeout.
    pub async fn calibrate_sequence(
        &mut self,
        targets: &[CalibrationTarget],
    ) -> Result<Vec<CalibrationReport>, crate::Error> {
        let mut reports = Vec::with_capacity(targets.len());
        for target in targets {
            reports.push(self.calibrate_one(*target).await?);
        }
        Ok(reports)
    }

    pub async fn calibrate_one(&mut self, target: CalibrationTarget) -> Result<CalibrationReport, crate::Error> {
        self.require("Idle", self.state.is_ready())?;
        self.set_state(SessionState::Calibrating);
        log::info!("Starting {target} calibration");
        let result = self.run_calibration(target).await;
        self.settle(result)
    }

    async fn run_calibration(&self, target: CalibrationTarget) -> Result<CalibrationReport, crate::Error> {
        self.transport.flush().await?;
        let timeout = self.options.calibration_timeout;
        let reply = self
            .exchange(Command::Calibrate(target), timeout)
            .await?
            .ok_or_else(|| crate::Error::Calibration {
                target,
                reason: format!("no response within {timeout:?}"),
            })?;

        let status = reply.payload[1];
        let report = CalibrationReport {
            target,
            success: status == CALIBRATION_STATUS_OK,
            status,
            raw: hex::encode(reply.payload()),
        };
        if report.success {
            log::info!("{target} calibration successful");
        } else {
            log::warn!("{target} calibration failed (status {status:#04x})");
        }
        Ok(report)
    }

    /// Asks the device to measure now.
    pub async fn trigger_measurement(&mut self) -> Result<PendingMeasurement, crate::Error> {
        self.require("Idle", self.state.is_ready())?;
        self.set_state(SessionState::Measuring);
        let result = self.await_header(Some(Command::Trigger), self.options.step_timeout).await;
        self.settle_pending(result, MeasurementTrigger::Host)
    }

    /// Waits for the header the device sends when its button is pressed.
    pub async fn wait_for_button(&mut self, timeout: Duration) -> Result<PendingMeasurement, crate::Error> {
        self.require("Idle", self.state.is_ready())?;
        self.set_state(SessionState::Measuring);
        log::info!("Waiting up to {timeout:?} for a button press");
        let result = self.await_header(None, timeout).await;
        self.settle_pending(result, MeasurementTrigger::Button)
    }

    async fn await_header(&self, command: Option<Command>, timeout: Duration) -> Result<Frame, crate::Error> {
        let deadline = Instant::now() + timeout;
        if let Some(command) = command {
            self.transport.flush().await?;
            self.transport.send(&command.frame(self.transport.codec())?).await?;
        }
        let step = match command {
            Some(_) => "measurement header",
            None => "button press",
        };
        self.await_frame(deadline, command::is_measurement_header)
            .await?
            .ok_or_else(|| crate::Error::MeasurementTimeout {
                step: step.to_string(),
            })
    }

    fn settle_pending(
        &mut self,
        result: Result<Frame, crate::Error>,
        trigger: MeasurementTrigger,
    ) -> Result<PendingMeasurement, crate::Error> {
        match result {
            Ok(header) => {
                log::debug!("measurement header received ({trigger:?})");
                Ok(PendingMeasurement { header, trigger })
            }
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Reads the chunks of a pending measurement. Each chunk must arrive
    /// within `timeout_per_step` of its request; chunks are matched by type,
    /// so one that turns up early satisfies its later request.
    pub async fn read_measurement(
        &mut self,
        pending: PendingMeasurement,
        timeout_per_step: Duration,
    ) -> Result<SpectralMeasurement, crate::Error> {
        self.require("Measuring", self.state == SessionState::Measuring)?;
        let result = self.read_chunks(pending, timeout_per_step).await;
        self.settle(result)
    }

    async fn read_chunks(
        &self,
        pending: PendingMeasurement,
        timeout_per_step: Duration,
    ) -> Result<SpectralMeasurement, crate::Error> {
        self.transport.flush().await?;
        let mut assembler = SpdAssembler::new();
        let mut raw = BTreeMap::new();
        raw.insert("header".to_string(), hex::encode(pending.header.payload()));

        for chunk_type in ChunkType::ALL {
            if !assembler.missing().contains(&chunk_type) {
                continue;
            }
            let deadline = Instant::now() + timeout_per_step;
            let request = Command::ReadChunk(chunk_type).frame(self.transport.codec())?;
            self.transport.send(&request).await?;

            while assembler.missing().contains(&chunk_type) {
                let frame = self
                    .await_frame(deadline, |frame| SpdChunk::from_frame(frame).is_some())
                    .await?
                    .ok_or_else(|| crate::Error::MeasurementTimeout {
                        step: chunk_type.to_string(),
                    })?;
                let Some(chunk) = SpdChunk::from_frame(&frame) else {
                    continue;
                };
                raw.entry(chunk.chunk_type.to_string())
                    .or_insert_with(|| hex::encode(frame.payload()));
                if assembler.ingest(&chunk) == Progress::Duplicate {
                    log::trace!("duplicate {}", chunk.chunk_type);
                }
            }
        }

        let spd = assembler.extract_spd()?;
        let device_xyz = pending.device_xyz();
        let chunk_xyz = assembler.xyz_copy();

        let mut warnings = Vec::new();
        if let (Some(header), Some(chunk)) = (device_xyz, chunk_xyz) {
            let difference = header.max_difference(&chunk);
            if difference > self.options.xyz_tolerance {
                let warning = Warning::DataIntegrity {
                    header,
                    chunk,
                    difference,
                };
                log::warn!("{warning}");
                warnings.push(warning);
            }
        }

        Ok(SpectralMeasurement {
            spd: spd.iter().map(|v| *v as f64).collect(),
            wavelengths: spd_wavelengths(),
            device_xyz,
            chunk_xyz,
            trigger: pending.trigger,
            warnings,
            raw,
        })
    }

    /// Triggers a measurement and reads it.
    pub async fn measure(&mut self) -> Result<SpectralMeasurement, crate::Error> {
        let pending = self.trigger_measurement().await?;
        self.read_measurement(pending, self.options.step_timeout).await
    }
}

fn non_empty(text: String) -> String {
    if text.is_empty() {
        UNKNOWN.to_string()
    } else {
        text
    }
}

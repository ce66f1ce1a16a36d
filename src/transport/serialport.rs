use std::{
    collections::HashSet,
    io::{ErrorKind, Read as _, Write as _},
    sync::{mpsc as std_mpsc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};
use tokio::{
    sync::{
        broadcast::{self, error::TryRecvError},
        mpsc, Mutex as AsyncMutex, RwLock,
    },
    task::JoinHandle,
};

use crate::{
    packet::{Frame, FrameReader, PacketCodec},
    transport::{Transport, FRAME_CHANNEL_SIZE},
};

pub const DEFAULT_BAUD_RATE: u32 = 19_200;

const READ_BUFFER_SIZE: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_millis(10);

impl From<serialport::Error> for crate::Error {
    fn from(e: serialport::Error) -> Self {
        crate::Error::Connection(format!("serialport error: {e}"))
    }
}

/// Ports held by live connections in this process.
static OPEN_PORTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Advisory claim on a port name, released on drop.
#[derive(Debug)]
struct PortLock {
    port_name: String,
}

impl PortLock {
    fn acquire(port_name: &str) -> Result<Self, crate::Error> {
        let mut open = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(port_name.to_string()) {
            return Err(crate::Error::PortBusy(port_name.to_string()));
        }
        Ok(Self {
            port_name: port_name.to_string(),
        })
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        let mut open = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        open.remove(&self.port_name);
    }
}

/// A closed channel means the connection was dropped without `close()`.
fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Closed) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) => false,
    }
}

#[derive(Debug)]
struct SerialConnection {
    serial_tx: std_mpsc::Sender<Vec<u8>>,
    reader_task: JoinHandle<Result<(), crate::Error>>,
    shutdown: broadcast::Sender<()>,
    _lock: PortLock,
}

impl SerialConnection {
    fn open_port(port_name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, crate::Error> {
        log::debug!("Opening serial device {port_name} at {baud_rate} baud");

        let builder = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One);

        #[cfg(unix)]
        let mut port: Box<dyn SerialPort> = {
            let mut port = builder
                .open_native()
                .map_err(|e| crate::Error::Connection(format!("{port_name}: {e}")))?;
            port.set_exclusive(true)?;
            Box::new(port)
        };
        #[cfg(not(unix))]
        let mut port = builder
            .open()
            .map_err(|e| crate::Error::Connection(format!("{port_name}: {e}")))?;

        port.write_data_terminal_ready(true)?;
        port.clear(serialport::ClearBuffer::All)?;
        Ok(port)
    }

    fn reader_closure(
        mut serial_port: Box<dyn SerialPort>,
        codec: PacketCodec,
        frame_tx: mpsc::Sender<Frame>,
        serial_rx: std_mpsc::Receiver<Vec<u8>>,
        mut task_shutdown: broadcast::Receiver<()>,
    ) -> impl FnOnce() -> Result<(), crate::Error> {
        move || {
            let mut reader = FrameReader::new(codec);
            let mut read_buffer = [0u8; READ_BUFFER_SIZE];

            loop {
                while let Ok(payload) = serial_rx.try_recv() {
                    if let Err(e) = serial_port.write_all(&payload) {
                        log::warn!("serial write error: {e:?}");
                        return Err(crate::Error::Connection(e.to_string()));
                    }
                    if let Err(e) = serial_port.flush() {
                        log::warn!("serial flush error: {e:?}");
                        return Err(crate::Error::Connection(e.to_string()));
                    }
                }

                match serial_port.read(&mut read_buffer) {
                    Ok(0) => {}
                    Ok(bytes_read) => {
                        log::trace!("rx {}", hex::encode(&read_buffer[..bytes_read]));
                        for frame in reader.push(&read_buffer[..bytes_read]) {
                            if frame_tx.try_send(frame).is_err() {
                                log::trace!("frame queue full, dropping frame");
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        log::warn!("serial read error: {e:?}");
                        return Err(crate::Error::Connection(e.to_string()));
                    }
                }

                if shutdown_requested(&mut task_shutdown) {
                    log::trace!(
                        "Serial reader shutdown, {} stray bytes dropped",
                        reader.dropped()
                    );
                    return Ok(());
                }
            }
        }
    }

    fn open(
        port_name: &str,
        baud_rate: u32,
        codec: PacketCodec,
    ) -> Result<(Self, mpsc::Receiver<Frame>), crate::Error> {
        let lock = PortLock::acquire(port_name)?;
        let serial_port = Self::open_port(port_name, baud_rate)?;
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        let (serial_tx, serial_rx) = std_mpsc::channel::<Vec<u8>>();
        let (shutdown, _) = broadcast::channel(1);
        let task_shutdown = shutdown.subscribe();

        let reader = Self::reader_closure(serial_port, codec, frame_tx, serial_rx, task_shutdown);
        let reader_task = tokio::task::spawn_blocking(reader);

        let connection = Self {
            serial_tx,
            reader_task,
            shutdown,
            _lock: lock,
        };
        Ok((connection, frame_rx))
    }

    async fn close(self) -> Result<(), crate::Error> {
        let _ = self.shutdown.send(());
        self.reader_task
            .await
            .map_err(|_| crate::Error::Connection("failed to join serial reader task".to_string()))?
    }

    fn send_payload(&self, payload: Vec<u8>) -> Result<(), crate::Error> {
        self.serial_tx
            .send(payload)
            .map_err(|_| crate::Error::Connection("serial reader task has stopped".to_string()))
    }
}

/// A CR30 on a serial port.
#[derive(Debug)]
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    codec: PacketCodec,
    connection: RwLock<Option<SerialConnection>>,
    frame_rx: AsyncMutex<Option<mpsc::Receiver<Frame>>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            codec: PacketCodec::default(),
            connection: RwLock::new(None),
            frame_rx: AsyncMutex::new(None),
        }
    }

    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Creates and connects in one step.
    pub async fn open(port_name: impl Into<String>, baud_rate: u32) -> Result<Self, crate::Error> {
        let transport = Self::new(port_name, baud_rate);
        transport.connect().await?;
        Ok(transport)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn is_connected(&self) -> bool {
        self.connection
            .try_read()
            .map(|connection| connection.is_some())
            .unwrap_or(false)
    }

    fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    async fn connect(&self) -> Result<(), crate::Error> {
        let mut connection = self.connection.write().await;
        if connection.is_some() {
            return Ok(());
        }

        let (opened, frame_rx) = SerialConnection::open(&self.port_name, self.baud_rate, self.codec)?;
        *connection = Some(opened);
        drop(connection);

        let mut rx = self.frame_rx.lock().await;
        *rx = Some(frame_rx);
        log::info!("Connected to {}", self.port_name);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), crate::Error> {
        let connection = {
            let mut connection = self.connection.write().await;
            connection.take()
        };

        let Some(connection) = connection else {
            return Err(crate::Error::Connection(format!(
                "{} is not connected",
                self.port_name
            )));
        };
        connection.close().await?;

        let mut rx = self.frame_rx.lock().await;
        *rx = None;
        log::info!("Disconnected from {}", self.port_name);
        Ok(())
    }

    async fn send_raw(&self, bytes: &[u8]) -> Result<(), crate::Error> {
        let connection = self.connection.read().await;
        let Some(connection) = connection.as_ref() else {
            return Err(crate::Error::Connection("No active connection".to_string()));
        };
        connection.send_payload(bytes.to_vec())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Frame>, crate::Error> {
        let mut rx = self.frame_rx.lock().await;
        let Some(rx) = rx.as_mut() else {
            return Err(crate::Error::Connection("No active connection".to_string()));
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(crate::Error::Connection(
                "serial reader task has stopped".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }

    async fn flush(&self) -> Result<usize, crate::Error> {
        let mut rx = self.frame_rx.lock().await;
        let Some(rx) = rx.as_mut() else {
            return Err(crate::Error::Connection("No active connection".to_string()));
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("Flushed {dropped} stale frame(s)");
        }
        Ok(dropped)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// Serial ports present on the system, USB adapters described by id.
pub fn available_ports() -> Result<Vec<PortInfo>, crate::Error> {
    let ports = serialport::available_ports()?;
    let infos: Vec<PortInfo> = ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                SerialPortType::UsbPort(info) => format!(
                    "USB {:04x}:{:04x} {}",
                    info.vid,
                    info.pid,
                    info.product.as_deref().unwrap_or_default()
                )
                .trim_end()
                .to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortInfo {
                name: port.port_name,
                description,
            }
        })
        .collect();
    log::debug!("Found {} serial port(s)", infos.len());
    Ok(infos)
}

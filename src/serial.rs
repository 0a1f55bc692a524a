//! The serial side of the bridge.
//!
//! [`SerialTransport`] owns the port and runs on its own thread, so blocking reads never stall the
//! async side. Frames reach it through a [`SerialWriter`], which only [`Channel`](crate::lease::Channel)
//! holds, and everything seen on the wire is handed to an injected [`FrameSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use embedded_io::Error as _;
use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{self, RtuBuffer};

/// Sleep between reads while waiting for the rest of a frame.
const READ_BACKOFF: Duration = Duration::from_millis(1);

/// Which way a frame travelled on the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written by us to the PSU.
    ToDevice,
    /// Received from the PSU.
    FromDevice,
}

/// Tags a queued request. The transport reports the request and the response it read for it
/// under the same ticket, so an answer can never be taken for somebody else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// A request waiting for the transport thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFrame {
    pub ticket: Ticket,
    pub bytes: RtuBuffer,
}

/// A frame observed on the serial line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub direction: Direction,
    /// The request this frame belongs to. `None` for frames the device sent on its own.
    pub ticket: Option<Ticket>,
    pub bytes: RtuBuffer,
}

impl SerialFrame {
    pub fn request(queued: &QueuedFrame) -> Self {
        Self {
            direction: Direction::ToDevice,
            ticket: Some(queued.ticket),
            bytes: queued.bytes.clone(),
        }
    }

    pub fn response(ticket: Ticket, bytes: RtuBuffer) -> Self {
        Self {
            direction: Direction::FromDevice,
            ticket: Some(ticket),
            bytes,
        }
    }

    pub fn unsolicited(bytes: RtuBuffer) -> Self {
        Self {
            direction: Direction::FromDevice,
            ticket: None,
            bytes,
        }
    }
}

/// Receives every frame the transport writes or reads.
pub trait FrameSink: Send + Sync {
    fn on_serial_frame(&self, frame: &SerialFrame);
}

/// Write half of the link to the transport thread.
pub struct SerialWriter {
    tx: mpsc::Sender<QueuedFrame>,
    next_ticket: AtomicU64,
}

impl SerialWriter {
    pub(crate) fn send(&self, bytes: RtuBuffer) -> Result<Ticket> {
        let ticket = Ticket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(QueuedFrame { ticket, bytes })
            .map_err(|_| Error::ChannelClosed)?;
        Ok(ticket)
    }
}

/// Frames waiting to be written by the transport thread.
pub struct SerialQueue {
    rx: mpsc::Receiver<QueuedFrame>,
}

impl SerialQueue {
    /// Take the next queued frame without waiting.
    pub fn try_next(&self) -> Option<QueuedFrame> {
        self.rx.try_recv().ok()
    }
}

/// Create the writer/queue pair connecting a [`Channel`](crate::lease::Channel) to a transport.
pub fn link() -> (SerialWriter, SerialQueue) {
    let (tx, rx) = mpsc::channel();
    (
        SerialWriter {
            tx,
            next_ticket: AtomicU64::new(0),
        },
        SerialQueue { rx },
    )
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,
    pub baud_rate: u32,
    /// Timeout of a single blocking read on the port.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// How long the transport waits for a complete response frame.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// How often an idle transport checks the port for device-originated data.
    #[serde(with = "humantime_serde")]
    pub idle_poll: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(50),
            response_timeout: Duration::from_millis(500),
            idle_poll: Duration::from_millis(20),
        }
    }
}

/// Drives the half-duplex serial line: one frame out, one frame back.
pub struct SerialTransport<S: embedded_io::Read + embedded_io::Write> {
    interface: S,
    queue: SerialQueue,
    sink: Arc<dyn FrameSink>,
    response_timeout: Duration,
    idle_poll: Duration,
}

impl<S> SerialTransport<S>
where
    S: embedded_io::Read + embedded_io::Write + Send + 'static,
{
    pub fn new(interface: S, queue: SerialQueue, sink: Arc<dyn FrameSink>, config: &SerialConfig) -> Self {
        Self {
            interface,
            queue,
            sink,
            response_timeout: config.response_timeout,
            idle_poll: config.idle_poll,
        }
    }

    /// Run the transport on a dedicated thread until every [`SerialWriter`] is gone.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("serial-transport".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        info!("serial transport running");
        loop {
            match self.queue.rx.recv_timeout(self.idle_poll) {
                Ok(request) => self.exchange(&request),
                Err(mpsc::RecvTimeoutError::Timeout) => self.poll_unsolicited(),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("serial transport stopped");
    }

    /// Write one request and hand back whatever answer arrives in time.
    fn exchange(&mut self, request: &QueuedFrame) {
        trace!(frame = ?request.bytes.as_slice(), "serial tx");
        if let Err(err) = self.write_frame(&request.bytes) {
            warn!(%err, "serial write failed");
            return;
        }
        self.sink.on_serial_frame(&SerialFrame::request(request));

        match self.read_frame(RtuBuffer::new(), self.response_timeout) {
            Ok(Some(response)) => {
                trace!(frame = ?response.as_slice(), "serial rx");
                self.sink
                    .on_serial_frame(&SerialFrame::response(request.ticket, response));
            }
            Ok(None) => debug!("no response from device"),
            Err(err) => warn!(%err, "serial read failed"),
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.interface
            .write_all(frame)
            .map_err(|e| Error::SerialError(e.kind()))?;
        self.interface
            .flush()
            .map_err(|e| Error::SerialError(e.kind()))
    }

    /// Pick up frames the device sends without being asked.
    fn poll_unsolicited(&mut self) {
        let mut temp_buf = [0u8; 32];
        let bytes_read = match self.interface.read(&mut temp_buf) {
            Ok(0) => return,
            Ok(bytes_read) => bytes_read,
            Err(e) if is_idle(e.kind()) => return,
            Err(e) => {
                warn!(kind = ?e.kind(), "serial read failed while idle");
                return;
            }
        };

        let mut partial = RtuBuffer::new();
        if partial.extend_from_slice(&temp_buf[..bytes_read]).is_err() {
            return;
        }
        match self.read_frame(partial, self.response_timeout) {
            Ok(Some(frame)) => {
                debug!(frame = ?frame.as_slice(), "device-originated frame");
                self.sink.on_serial_frame(&SerialFrame::unsolicited(frame));
            }
            Ok(None) => {}
            Err(err) => debug!(%err, "discarding unsolicited bytes"),
        }
    }

    /// Keep reading until a complete RTU frame is assembled or `timeout` passes.
    fn read_frame(&mut self, mut frame: RtuBuffer, timeout: Duration) -> Result<Option<RtuBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut temp_buf = [0u8; 32];
        loop {
            if let Some(expected) = frame::expected_response_len(&frame)? {
                if frame.len() >= expected {
                    // Anything past the frame is line noise.
                    frame.truncate(expected);
                    return Ok(Some(frame));
                }
            }
            if Instant::now() >= deadline {
                if !frame.is_empty() {
                    debug!(received = frame.len(), "incomplete frame dropped");
                }
                return Ok(None);
            }
            match self.interface.read(&mut temp_buf) {
                Ok(0) => std::thread::sleep(READ_BACKOFF),
                Ok(bytes_read) => {
                    frame
                        .extend_from_slice(&temp_buf[..bytes_read])
                        .map_err(|_| Error::InvalidFrame)?;
                }
                Err(e) if is_idle(e.kind()) => std::thread::sleep(READ_BACKOFF),
                Err(e) => return Err(Error::SerialError(e.kind())),
            }
        }
    }
}

/// Port read errors that only mean "nothing to read right now".
fn is_idle(kind: embedded_io::ErrorKind) -> bool {
    matches!(
        kind,
        embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut
    )
}

/// A `serialport` port usable through [`embedded_io`].
pub struct SerialPortIo(Box<dyn serialport::SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialPortIo {
    type Error = IoError;
}

impl embedded_io::Read for SerialPortIo {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for SerialPortIo {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

/// Open the PSU's serial port: 8 data bits, no parity, 1 stop bit.
pub fn open_port(config: &SerialConfig) -> Result<SerialPortIo> {
    let port = serialport::new(&config.port, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(config.read_timeout)
        .open()
        .map_err(|source| Error::PortOpen {
            path: config.port.clone(),
            source,
        })?;
    info!(port = %config.port, baud_rate = config.baud_rate, "serial port open");
    Ok(SerialPortIo(port))
}

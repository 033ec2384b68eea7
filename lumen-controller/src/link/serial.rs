//! POSIX tty implementation of the serial link.
//!
//! [`SerialStream`] keeps shared ownership of the file descriptor so that
//! after it has been split into reader and writer halves, the
//! [`SerialControl`] handle can still drain or flush the port. Each session
//! spawns a reader task that decodes ack lines and forwards them to the
//! controller while the link is active.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{StreamExt, ready};
use rustix::fs::{Mode, OFlags, open};
use rustix::termios::{OptionalActions, QueueSelector, tcdrain, tcflush, tcgetattr, tcsetattr};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use super::codec::AckCodec;
use super::{DeviceInfo, LinkConnector, LinkError, LinkEvent, SerialLink};
use crate::tracing::prelude::*;

/// Depth of the ack channel between the reader task and the controller.
const EVENT_QUEUE: usize = 64;

/// Serial port configuration. Always raw 8N1.
#[derive(Debug, Clone, Copy)]
pub struct SerialConfig {
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { baud_rate: 115200 }
    }
}

/// Serial port error types.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to open serial port: {0}")]
    OpenError(#[source] io::Error),

    #[error("Configuration failed: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Serial port disconnected")]
    Disconnected,

    #[error("Hardware error on serial port")]
    HardwareError,
}

/// Byte counters for a serial port.
#[derive(Debug, Clone, Copy)]
pub struct SerialStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// An open tty, before it is split.
pub struct SerialStream {
    inner: Arc<SerialInner>,
}

struct SerialInner {
    fd: AsyncFd<OwnedFd>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Reader half of a split serial stream.
pub struct SerialReader {
    inner: Arc<SerialInner>,
}

/// Writer half of a split serial stream.
pub struct SerialWriter {
    inner: Arc<SerialInner>,
}

/// Control handle for a split serial stream.
#[derive(Clone)]
pub struct SerialControl {
    inner: Arc<SerialInner>,
}

fn apply_serial_config<Fd: AsFd>(fd: &Fd, config: &SerialConfig) -> Result<(), SerialError> {
    let mut termios = tcgetattr(fd)
        .map_err(|e| SerialError::ConfigError(format!("Failed to get termios: {}", e)))?;

    // make_raw already selects CS8 with parity off
    termios.make_raw();
    termios
        .set_speed(config.baud_rate)
        .map_err(|e| SerialError::ConfigError(format!("Failed to set baud rate: {}", e)))?;

    tcsetattr(fd, OptionalActions::Now, &termios)
        .map_err(|e| SerialError::ConfigError(format!("Failed to apply termios: {}", e)))?;

    Ok(())
}

impl SerialStream {
    /// Open `path` in raw mode at `config.baud_rate`.
    pub fn open(path: &str, config: SerialConfig) -> Result<Self, SerialError> {
        let fd = open(
            path,
            OFlags::RDWR | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| SerialError::OpenError(e.into()))?;

        apply_serial_config(&fd, &config)?;
        Self::from_configured(fd)
    }

    /// Wrap a descriptor from a pseudo-terminal pair.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: OwnedFd, config: SerialConfig) -> Result<Self, SerialError> {
        use rustix::fs::{fcntl_getfl, fcntl_setfl};

        apply_serial_config(&fd, &config)?;
        let flags = fcntl_getfl(&fd)
            .map_err(|e| SerialError::ConfigError(format!("Failed to get fd flags: {}", e)))?;
        fcntl_setfl(&fd, flags | OFlags::NONBLOCK)
            .map_err(|e| SerialError::ConfigError(format!("Failed to set fd flags: {}", e)))?;

        Self::from_configured(fd)
    }

    fn from_configured(fd: OwnedFd) -> Result<Self, SerialError> {
        Ok(Self {
            inner: Arc::new(SerialInner {
                fd: AsyncFd::new(fd)?,
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        })
    }

    /// Split into reader, writer, and control handles.
    pub fn split(self) -> (SerialReader, SerialWriter, SerialControl) {
        (
            SerialReader {
                inner: self.inner.clone(),
            },
            SerialWriter {
                inner: self.inner.clone(),
            },
            SerialControl { inner: self.inner },
        )
    }
}

fn map_errno(errno: rustix::io::Errno) -> io::Error {
    match errno {
        rustix::io::Errno::AGAIN => io::Error::from(io::ErrorKind::WouldBlock),
        // EIO covers a range of hardware faults, not only unplugging
        rustix::io::Errno::IO => io::Error::other(SerialError::HardwareError),
        rustix::io::Errno::PIPE => {
            io::Error::new(io::ErrorKind::BrokenPipe, SerialError::Disconnected)
        }
        e => e.into(),
    }
}

impl AsyncRead for SerialReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.fd.poll_read_ready(cx))?;

            match guard.try_io(|fd| {
                let n = rustix::io::read(fd.get_ref(), buf.initialize_unfilled())
                    .map_err(map_errno)?;
                buf.advance(n);
                self.inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.fd.poll_write_ready(cx))?;

            match guard.try_io(|fd| {
                let n = rustix::io::write(fd.get_ref(), buf).map_err(map_errno)?;
                self.inner
                    .bytes_written
                    .fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the kernel; draining is SerialControl's job.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl SerialControl {
    /// Block until the kernel has transmitted everything written so far.
    pub fn drain(&self) -> Result<(), SerialError> {
        tcdrain(self.inner.fd.get_ref()).map_err(|e| SerialError::IoError(e.into()))
    }

    /// Drop bytes received by the kernel but not yet read.
    pub fn discard_input(&self) -> Result<(), SerialError> {
        tcflush(self.inner.fd.get_ref(), QueueSelector::IFlush)
            .map_err(|e| SerialError::IoError(e.into()))
    }

    pub fn stats(&self) -> SerialStats {
        SerialStats {
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SerialInner {
    fn drop(&mut self) {
        // Best effort; the descriptor closes either way
        let _ = tcdrain(self.fd.get_ref());
    }
}

/// A device session over a tty.
pub struct SerialPortLink {
    name: String,
    writer: SerialWriter,
    control: SerialControl,
    active: Arc<AtomicBool>,
    events: mpsc::Receiver<LinkEvent>,
    reader_task: JoinHandle<()>,
}

impl SerialPortLink {
    /// Take ownership of an open stream and start its reader task.
    pub fn new(name: impl Into<String>, stream: SerialStream) -> Self {
        let (reader, writer, control) = stream.split();
        let active = Arc::new(AtomicBool::new(true));
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let reader_task = tokio::spawn(ack_reader_task(reader, active.clone(), event_tx));

        Self {
            name: name.into(),
            writer,
            control,
            active,
            events,
            reader_task,
        }
    }

    pub fn stats(&self) -> SerialStats {
        self.control.stats()
    }
}

/// Decode ack lines and forward them until the port or the receiver goes away.
async fn ack_reader_task(
    reader: SerialReader,
    active: Arc<AtomicBool>,
    event_tx: mpsc::Sender<LinkEvent>,
) {
    let mut lines = FramedRead::new(reader, AckCodec::new());

    while let Some(result) = lines.next().await {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                let _ = event_tx.send(LinkEvent::Error(e.to_string())).await;
                break;
            }
        };

        if !active.load(Ordering::Acquire) {
            trace!(event = ?event, "Dropped link event while inactive");
            continue;
        }

        trace!(event = ?event, "RX");
        if event_tx.send(event).await.is_err() {
            break;
        }
    }

    debug!("Serial reader exiting");
}

fn to_link_error(e: SerialError) -> LinkError {
    match e {
        SerialError::IoError(io) => LinkError::Io(io),
        other => LinkError::Io(io::Error::other(other)),
    }
}

#[async_trait]
impl SerialLink for SerialPortLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        trace!(port = %self.name, len = frame.len(), "TX frame");
        self.writer.write_all(frame).await.map_err(LinkError::Write)
    }

    fn configure(&mut self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    async fn drain(&mut self) -> Result<(), LinkError> {
        // tcdrain blocks the calling thread
        let control = self.control.clone();
        tokio::task::spawn_blocking(move || control.drain())
            .await
            .map_err(|e| LinkError::Io(io::Error::other(e)))?
            .map_err(to_link_error)
    }

    async fn flush(&mut self) -> Result<(), LinkError> {
        self.control.discard_input().map_err(to_link_error)?;
        while self.events.try_recv().is_ok() {}
        Ok(())
    }

    async fn stop(&mut self) {
        self.active.store(false, Ordering::Release);
        self.reader_task.abort();
        self.events.close();
        debug!(port = %self.name, "Serial link stopped");
    }

    async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

impl Drop for SerialPortLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Opens tty sessions at a fixed baud rate.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    config: SerialConfig,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            config: SerialConfig { baud_rate },
        }
    }
}

#[async_trait]
impl LinkConnector for SerialConnector {
    async fn open(&self, port: &str) -> Result<Box<dyn SerialLink>, LinkError> {
        let stream = SerialStream::open(port, self.config).map_err(|e| LinkError::Open {
            port: port.to_string(),
            source: match e {
                SerialError::OpenError(io) | SerialError::IoError(io) => io,
                other => io::Error::other(other),
            },
        })?;
        info!(port, baud = self.config.baud_rate, "Opened serial port");
        Ok(Box::new(SerialPortLink::new(port, stream)))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, LinkError> {
        let ports =
            tokio_serial::available_ports().map_err(|e| LinkError::Enumerate(e.to_string()))?;

        Ok(ports
            .into_iter()
            .map(|port| DeviceInfo {
                description: describe(&port.port_type),
                port: port.port_name,
            })
            .collect())
    }
}

fn describe(port_type: &tokio_serial::SerialPortType) -> Option<String> {
    use tokio_serial::SerialPortType;

    match port_type {
        SerialPortType::UsbPort(usb) => {
            let name = usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| "USB serial".to_string());
            Some(format!("{} ({:04x}:{:04x})", name, usb.vid, usb.pid))
        }
        SerialPortType::PciPort => Some("PCI serial".to_string()),
        SerialPortType::BluetoothPort => Some("Bluetooth serial".to_string()),
        SerialPortType::Unknown => None,
    }
}

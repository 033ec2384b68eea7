//! Serial link to the lighting device.
//!
//! The controller talks to the device through the [`SerialLink`] trait and
//! opens sessions through a [`LinkConnector`]. Production code uses the tty
//! implementation in [`serial`]; tests use the channel-backed mock in this
//! module, which works with `tokio::time::pause()` because it performs no
//! real I/O.

pub mod codec;
pub mod serial;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Inbound notification from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The device accepted a frame. The id is opaque to the controller.
    Ack { id: Bytes },
    /// The device or the receive path reported a failure.
    Error(String),
}

/// A serial port that could be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub port: String,
    pub description: Option<String>,
}

/// Link-level failures.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    #[error("Device enumeration failed: {0}")]
    Enumerate(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens device sessions and lists candidate ports.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    async fn open(&self, port: &str) -> Result<Box<dyn SerialLink>, LinkError>;

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, LinkError>;
}

/// One open device session.
///
/// `next_event` must be cancel-safe: the controller polls it inside
/// `tokio::select!` alongside its command channel.
#[async_trait]
pub trait SerialLink: Send {
    /// Port name the session was opened on.
    fn name(&self) -> &str;

    /// Write one frame verbatim.
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// While inactive, inbound acks are discarded instead of delivered.
    fn configure(&mut self, active: bool);

    /// Wait until queued output has been transmitted.
    async fn drain(&mut self) -> Result<(), LinkError>;

    /// Discard received but undelivered input.
    async fn flush(&mut self) -> Result<(), LinkError>;

    /// Tear the session down. Events stop after this returns.
    async fn stop(&mut self);

    /// Next inbound event, or `None` once the receive path has closed.
    async fn next_event(&mut self) -> Option<LinkEvent>;
}

#[cfg(test)]
pub(crate) use mock::{MockCall, MockConnector, MockLinkHandle};

#[cfg(test)]
mod mock {
    use std::collections::HashSet;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// Everything the controller did to the mock link, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum MockCall {
        Write(Bytes),
        Configure(bool),
        Drain,
        Flush,
        Stop,
    }

    #[derive(Default)]
    struct Shared {
        good_ports: HashSet<String>,
        calls: Vec<MockCall>,
        failing_writes: usize,
        failed_writes: usize,
        active: bool,
        event_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    }

    /// Connector that only opens ports it was told about.
    pub(crate) struct MockConnector {
        shared: Arc<Mutex<Shared>>,
    }

    /// Test-side handle for links opened through a [`MockConnector`].
    #[derive(Clone)]
    pub(crate) struct MockLinkHandle {
        shared: Arc<Mutex<Shared>>,
    }

    struct MockLink {
        name: String,
        shared: Arc<Mutex<Shared>>,
        event_rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    impl MockConnector {
        pub fn new(good_ports: &[&str]) -> (Self, MockLinkHandle) {
            let shared = Arc::new(Mutex::new(Shared {
                good_ports: good_ports.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            }));
            (
                Self {
                    shared: shared.clone(),
                },
                MockLinkHandle { shared },
            )
        }
    }

    #[async_trait]
    impl LinkConnector for MockConnector {
        async fn open(&self, port: &str) -> Result<Box<dyn SerialLink>, LinkError> {
            let mut shared = self.shared.lock();
            if !shared.good_ports.contains(port) {
                return Err(LinkError::Open {
                    port: port.to_string(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            shared.event_tx = Some(event_tx);
            shared.active = true;
            Ok(Box::new(MockLink {
                name: port.to_string(),
                shared: self.shared.clone(),
                event_rx,
            }))
        }

        fn list_devices(&self) -> Result<Vec<DeviceInfo>, LinkError> {
            let mut ports: Vec<_> = self.shared.lock().good_ports.iter().cloned().collect();
            ports.sort();
            Ok(ports
                .into_iter()
                .map(|port| DeviceInfo {
                    port,
                    description: Some("mock".into()),
                })
                .collect())
        }
    }

    #[async_trait]
    impl SerialLink for MockLink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
            let mut shared = self.shared.lock();
            if shared.failing_writes > 0 {
                shared.failing_writes -= 1;
                shared.failed_writes += 1;
                return Err(LinkError::Write(io::Error::other("scripted failure")));
            }
            shared.calls.push(MockCall::Write(Bytes::copy_from_slice(frame)));
            Ok(())
        }

        fn configure(&mut self, active: bool) {
            let mut shared = self.shared.lock();
            shared.active = active;
            shared.calls.push(MockCall::Configure(active));
        }

        async fn drain(&mut self) -> Result<(), LinkError> {
            self.shared.lock().calls.push(MockCall::Drain);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), LinkError> {
            while self.event_rx.try_recv().is_ok() {}
            self.shared.lock().calls.push(MockCall::Flush);
            Ok(())
        }

        async fn stop(&mut self) {
            let mut shared = self.shared.lock();
            shared.event_tx = None;
            shared.calls.push(MockCall::Stop);
        }

        async fn next_event(&mut self) -> Option<LinkEvent> {
            self.event_rx.recv().await
        }
    }

    impl MockLinkHandle {
        /// Deliver an ack. Dropped while the link is configured inactive.
        pub fn ack(&self, id: &str) {
            self.deliver(LinkEvent::Ack {
                id: Bytes::copy_from_slice(id.as_bytes()),
            });
        }

        /// Deliver `n` acks with sequential ids.
        pub fn ack_n(&self, n: usize) {
            for i in 0..n {
                self.ack(&i.to_string());
            }
        }

        pub fn error(&self, message: &str) {
            self.deliver(LinkEvent::Error(message.to_string()));
        }

        /// Make the next `n` writes fail.
        pub fn fail_writes(&self, n: usize) {
            self.shared.lock().failing_writes = n;
        }

        pub fn failed_writes(&self) -> usize {
            self.shared.lock().failed_writes
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.shared.lock().calls.clone()
        }

        /// Frames successfully written, in order.
        pub fn written(&self) -> Vec<Bytes> {
            self.shared
                .lock()
                .calls
                .iter()
                .filter_map(|call| match call {
                    MockCall::Write(frame) => Some(frame.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn clear_calls(&self) {
            self.shared.lock().calls.clear();
        }

        fn deliver(&self, event: LinkEvent) {
            let shared = self.shared.lock();
            if !shared.active {
                return;
            }
            if let Some(tx) = &shared.event_tx {
                let _ = tx.send(event);
            }
        }
    }
}

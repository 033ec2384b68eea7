//! Connection controller: the single owner of the device session.
//!
//! [`Controller`] is a cheap-to-clone facade. Every method sends a command
//! to a background actor over a channel; request-style commands carry a
//! oneshot for the reply. The actor owns the link and all session data and
//! processes one command or link event at a time, so no locking is needed
//! for session state.
//!
//! ## Flow control
//!
//! While running, at most `window_size` frames are outstanding. Each ack
//! releases one slot. When the loaded program has been sent and fully
//! acknowledged, the next queued program is loaded with a clear-all frame
//! in front of it.
//!
//! ## Retry
//!
//! A failed write turns the frame into the resend probe and arms a timer.
//! When it fires the probe is written again, and on success the window is
//! refilled. A device-reported error arms the same timer with the stage
//! marker as the probe. The probe occupies a window slot like any frame; if
//! the window is full when the timer fires, it is written on the next ack.
//! Each armed timer carries an epoch; a firing whose epoch no longer
//! matches the pending resend is ignored.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::link::{DeviceInfo, LinkConnector, LinkEvent, SerialLink};
use crate::program::{Frame, Program, clear_all_frame, stage_frame};
use crate::store::{MergePolicy, MergeReport, ProgramStore};
use crate::tracing::prelude::*;

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No device session.
    Open,
    /// Link open, nothing loaded.
    Connected,
    /// Program loaded, not streaming.
    Ready,
    /// Streaming frames.
    Running,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by [`Controller::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub device: Option<String>,
    pub current_program: Option<String>,
    /// Frames loaded but not yet written.
    pub pending_frames: usize,
    /// Frames written and not yet acknowledged.
    pub in_flight: usize,
    pub queue: Vec<String>,
    pub resend_pending: bool,
}

impl ControllerStatus {
    /// Running with nothing left to send, acknowledge, or pull from the queue.
    pub fn is_idle(&self) -> bool {
        self.pending_frames == 0
            && self.in_flight == 0
            && self.queue.is_empty()
            && !self.resend_pending
    }
}

/// Tunables for the actor.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub window_size: usize,
    pub resend_delay: Duration,
    pub teardown_timeout: Duration,
    /// Directory used by `save`/`load_file` when the caller gives none.
    pub store_dir: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_size: config.controller.window_size.max(1),
            resend_delay: config.controller.resend_delay(),
            teardown_timeout: config.controller.teardown_timeout(),
            store_dir: config.store.dir.clone(),
        }
    }
}

enum Command {
    Connect {
        port: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ListDevices {
        reply: oneshot::Sender<Result<Vec<DeviceInfo>>>,
    },
    Load {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Enqueue {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Run,
    AdvanceToNext {
        reply: oneshot::Sender<Result<()>>,
    },
    End,
    Save {
        file: PathBuf,
        dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadFile {
        file: PathBuf,
        dir: Option<PathBuf>,
        policy: MergePolicy,
        reply: oneshot::Sender<Result<MergeReport>>,
    },
    Status {
        reply: oneshot::Sender<ControllerStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the controller actor.
///
/// Dropping every clone stops the actor and closes the link.
#[derive(Clone)]
pub struct Controller {
    command_tx: mpsc::Sender<Command>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

impl Controller {
    /// Start the actor on the current runtime.
    pub fn spawn(
        store: ProgramStore,
        connector: Arc<dyn LinkConnector>,
        settings: ControllerSettings,
    ) -> Self {
        let (command_tx, cmd_rx) = mpsc::channel(32);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let actor = ControllerActor {
            cmd_rx,
            timer_tx,
            timer_rx,
            store,
            connector,
            settings,
            session: Session::default(),
            resend_epoch: 0,
        };
        tokio::spawn(actor.run());

        Self { command_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::ControllerOffline)?;
        rx.await.map_err(|_| Error::ControllerOffline)
    }

    async fn notify(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::ControllerOffline)
    }

    /// Open the device on `port`. Only valid before any session exists.
    pub async fn connect(&self, port: impl Into<String>) -> Result<()> {
        let port = port.into();
        self.request(|reply| Command::Connect { port, reply }).await?
    }

    /// Connect, then load `program`.
    pub async fn connect_and_load(&self, port: impl Into<String>, program: &str) -> Result<()> {
        self.connect(port).await?;
        self.load(program).await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.request(|reply| Command::ListDevices { reply }).await?
    }

    /// Make `name` the current program.
    ///
    /// While running, a clear-all frame is queued ahead of the new program.
    /// It takes a window slot like any frame, so with a full window it goes
    /// out on the next ack, still before the first frame of the program.
    pub async fn load(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::Load { name, reply }).await?
    }

    /// Append `name` to the run queue.
    pub async fn enqueue(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Command::Enqueue { name, reply }).await?
    }

    /// Start streaming the loaded program. No reply; rejections are logged.
    pub async fn run(&self) -> Result<()> {
        self.notify(Command::Run).await
    }

    /// Abandon the current program and start the head of the run queue.
    pub async fn advance_to_next(&self) -> Result<()> {
        self.request(|reply| Command::AdvanceToNext { reply }).await?
    }

    /// Stop streaming and clear the device. No reply; rejections are logged.
    pub async fn end(&self) -> Result<()> {
        self.notify(Command::End).await
    }

    /// Save the store to `dir/file`, defaulting `dir` to the configured one.
    pub async fn save(&self, file: impl Into<PathBuf>, dir: Option<PathBuf>) -> Result<()> {
        let file = file.into();
        self.request(|reply| Command::Save { file, dir, reply }).await?
    }

    /// Merge `dir/file` into the store.
    pub async fn load_file(
        &self,
        file: impl Into<PathBuf>,
        dir: Option<PathBuf>,
        policy: MergePolicy,
    ) -> Result<MergeReport> {
        let file = file.into();
        self.request(|reply| Command::LoadFile {
            file,
            dir,
            policy,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Close the link and stop the actor. Returns once the link is closed.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Posted by a resend timer task when it fires.
#[derive(Debug)]
struct ResendDue {
    epoch: u64,
}

struct PendingResend {
    frame: Frame,
    epoch: u64,
    /// Timer fired while the window was full; the write waits for an ack.
    due: bool,
    timer: JoinHandle<()>,
}

/// Everything tied to the current device session.
struct Session {
    state: ControllerState,
    link: Option<Box<dyn SerialLink>>,
    /// Cleared when the link's event stream ends so the actor stops polling it.
    events_open: bool,
    device_name: Option<String>,
    current_program: Option<String>,
    pending: VecDeque<Frame>,
    run_queue: VecDeque<String>,
    in_flight: usize,
    resend: Option<PendingResend>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ControllerState::Open,
            link: None,
            events_open: false,
            device_name: None,
            current_program: None,
            pending: VecDeque::new(),
            run_queue: VecDeque::new(),
            in_flight: 0,
            resend: None,
        }
    }
}

struct ControllerActor {
    cmd_rx: mpsc::Receiver<Command>,
    timer_tx: mpsc::UnboundedSender<ResendDue>,
    timer_rx: mpsc::UnboundedReceiver<ResendDue>,
    store: ProgramStore,
    connector: Arc<dyn LinkConnector>,
    settings: ControllerSettings,
    session: Session,
    resend_epoch: u64,
}

async fn next_link_event(link: &mut Option<Box<dyn SerialLink>>) -> Option<LinkEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

impl ControllerActor {
    /// Main loop. Runs until shutdown or until every facade is dropped.
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(due) = self.timer_rx.recv() => {
                    self.handle_resend_due(due).await;
                }
                event = next_link_event(&mut self.session.link), if self.session.events_open => {
                    match event {
                        Some(event) => self.handle_link_event(event).await,
                        None => {
                            warn!("Link event stream closed");
                            self.session.events_open = false;
                        }
                    }
                }
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { port, reply } => {
                let _ = reply.send(self.connect(&port).await);
            }
            Command::ListDevices { reply } => {
                let _ = reply.send(self.connector.list_devices().map_err(Error::from));
            }
            Command::Load { name, reply } => {
                let _ = reply.send(self.load(&name).await);
            }
            Command::Enqueue { name, reply } => {
                let _ = reply.send(self.enqueue(name));
            }
            Command::Run => {
                if let Err(e) = self.start().await {
                    warn!(error = %e, "Run rejected");
                }
            }
            Command::AdvanceToNext { reply } => {
                let _ = reply.send(self.advance_to_next().await);
            }
            Command::End => {
                if let Err(e) = self.end().await {
                    warn!(error = %e, "End rejected");
                }
            }
            Command::Save { file, dir, reply } => {
                let path = self.resolve(file, dir);
                let store = self.store.clone();
                let _ = reply.send(blocking(move || store.save(path)).await);
            }
            Command::LoadFile {
                file,
                dir,
                policy,
                reply,
            } => {
                let path = self.resolve(file, dir);
                let store = self.store.clone();
                let _ = reply.send(blocking(move || store.merge_from_file(path, policy)).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                // Normally intercepted by run()
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    fn require(&self, allowed: &[ControllerState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.session.state) {
            Ok(())
        } else {
            Err(Error::InvalidArgument {
                state: self.session.state,
                operation,
            })
        }
    }

    fn transition(&mut self, to: ControllerState) {
        if self.session.state != to {
            debug!(from = %self.session.state, to = %to, "State change");
            self.session.state = to;
        }
    }

    fn resolve(&self, file: PathBuf, dir: Option<PathBuf>) -> PathBuf {
        dir.unwrap_or_else(|| self.settings.store_dir.clone()).join(file)
    }

    fn status(&self) -> ControllerStatus {
        let s = &self.session;
        ControllerStatus {
            state: s.state,
            device: s.device_name.clone(),
            current_program: s.current_program.clone(),
            pending_frames: s.pending.len(),
            in_flight: s.in_flight,
            queue: s.run_queue.iter().cloned().collect(),
            resend_pending: s.resend.is_some(),
        }
    }

    async fn connect(&mut self, port: &str) -> Result<()> {
        self.require(&[ControllerState::Open], "connect")?;

        let link = self.connector.open(port).await.inspect_err(|e| {
            warn!(port, error = %e, "Connect failed");
        })?;

        info!(port, "Connected");
        self.session.device_name = Some(link.name().to_string());
        self.session.link = Some(link);
        self.session.events_open = true;
        self.transition(ControllerState::Connected);
        Ok(())
    }

    async fn load(&mut self, name: &str) -> Result<()> {
        use ControllerState::*;
        self.require(&[Connected, Ready, Running], "load")?;

        let program = self
            .store
            .lookup(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if self.session.state == Running {
            self.cancel_resend();
            self.replace_program(name, program, true);
            self.fill_window().await;
        } else {
            self.replace_program(name, program, false);
            self.transition(Ready);
        }
        info!(program = name, "Loaded");
        Ok(())
    }

    fn enqueue(&mut self, name: String) -> Result<()> {
        use ControllerState::*;
        self.require(&[Connected, Ready, Running], "enqueue")?;

        if !self.store.exists(&name) {
            return Err(Error::NotFound(name));
        }
        debug!(program = %name, position = self.session.run_queue.len(), "Queued");
        self.session.run_queue.push_back(name);
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.require(&[ControllerState::Ready], "run")?;

        self.session.in_flight = 0;
        self.transition(ControllerState::Running);
        info!(
            program = self.session.current_program.as_deref(),
            frames = self.session.pending.len(),
            "Running"
        );
        self.fill_window().await;
        Ok(())
    }

    async fn advance_to_next(&mut self) -> Result<()> {
        self.require(&[ControllerState::Running], "advance_to_next")?;

        let Some(head) = self.session.run_queue.front().cloned() else {
            return Err(Error::NotFound("run queue is empty".to_string()));
        };
        let Some(program) = self.store.lookup(&head) else {
            // Deleted since it was queued; drop it so the queue can move on
            self.session.run_queue.pop_front();
            return Err(Error::NotFound(head));
        };

        self.cancel_resend();
        self.quiesce_link(false).await;

        self.session.run_queue.pop_front();
        self.replace_program(&head, program, false);
        // The flush discarded any acks still owed for the old program
        self.session.in_flight = 0;
        info!(program = %head, "Skipped to next queued program");
        self.fill_window().await;
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.require(&[ControllerState::Running], "end")?;

        self.cancel_resend();
        self.quiesce_link(true).await;

        self.session.pending.clear();
        self.session.current_program = None;
        self.session.in_flight = 0;
        self.transition(ControllerState::Ready);
        info!("Run ended");
        Ok(())
    }

    /// Pause ack delivery, let output drain, optionally clear the LEDs,
    /// then drop buffered input and resume ack delivery.
    async fn quiesce_link(&mut self, clear: bool) {
        let timeout = self.settings.teardown_timeout;
        let Some(link) = self.session.link.as_mut() else {
            return;
        };

        link.configure(false);
        match tokio::time::timeout(timeout, link.drain()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Drain failed"),
            Err(_) => warn!(?timeout, "Drain timed out"),
        }
        if clear {
            if let Err(e) = link.write(&clear_all_frame()).await {
                warn!(error = %e, "Failed to send clear-all");
            }
        }
        match tokio::time::timeout(timeout, link.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Flush failed"),
            Err(_) => warn!(?timeout, "Flush timed out"),
        }
        link.configure(true);
    }

    fn replace_program(&mut self, name: &str, program: Program, clear_first: bool) {
        let mut pending: VecDeque<Frame> = program.into_frames().into();
        if clear_first {
            pending.push_front(clear_all_frame());
        }
        self.session.pending = pending;
        self.session.current_program = Some(name.to_string());
    }

    /// Write pending frames until the window is full, the program is
    /// exhausted, or a write fails.
    async fn fill_window(&mut self) {
        while self.session.resend.is_none() && self.session.in_flight < self.settings.window_size {
            let Some(frame) = self.session.pending.pop_front() else {
                break;
            };
            if !self.send(frame).await {
                break;
            }
        }
    }

    /// Write one frame. A failed frame becomes the resend probe.
    async fn send(&mut self, frame: Frame) -> bool {
        let Some(link) = self.session.link.as_mut() else {
            return false;
        };
        match link.write(&frame).await {
            Ok(()) => {
                self.session.in_flight += 1;
                trace!(len = frame.len(), in_flight = self.session.in_flight, "Sent frame");
                true
            }
            Err(e) => {
                warn!(error = %e, "Frame write failed");
                self.schedule_resend(frame);
                false
            }
        }
    }

    fn schedule_resend(&mut self, frame: Frame) {
        self.cancel_resend();
        self.resend_epoch += 1;
        let epoch = self.resend_epoch;
        let delay = self.settings.resend_delay;
        let timer_tx = self.timer_tx.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(ResendDue { epoch });
        });

        debug!(epoch, ?delay, "Resend scheduled");
        self.session.resend = Some(PendingResend {
            frame,
            epoch,
            due: false,
            timer,
        });
    }

    fn cancel_resend(&mut self) {
        if let Some(resend) = self.session.resend.take() {
            resend.timer.abort();
            trace!(epoch = resend.epoch, "Resend cancelled");
        }
    }

    async fn handle_resend_due(&mut self, due: ResendDue) {
        let current = matches!(&self.session.resend, Some(r) if r.epoch == due.epoch);
        if !current || self.session.state != ControllerState::Running {
            trace!(epoch = due.epoch, "Ignoring stale resend timer");
            return;
        }

        if self.session.in_flight >= self.settings.window_size {
            if let Some(resend) = self.session.resend.as_mut() {
                resend.due = true;
            }
            trace!(epoch = due.epoch, "Window full, resend waits for an ack");
            return;
        }
        self.fire_resend().await;
    }

    /// Write the pending resend frame and resume streaming on success.
    async fn fire_resend(&mut self) {
        let Some(resend) = self.session.resend.take() else {
            return;
        };
        let Some(link) = self.session.link.as_mut() else {
            return;
        };

        match link.write(&resend.frame).await {
            Ok(()) => {
                self.session.in_flight += 1;
                debug!(
                    epoch = resend.epoch,
                    in_flight = self.session.in_flight,
                    "Resend succeeded"
                );
                self.resume().await;
            }
            Err(e) => {
                warn!(error = %e, "Resend failed, retrying");
                self.schedule_resend(resend.frame);
            }
        }
    }

    /// Keep the run moving: refill the window, or once the current program
    /// is fully acknowledged, pull the next one from the queue.
    async fn resume(&mut self) {
        if !self.session.pending.is_empty() {
            self.fill_window().await;
        } else if self.session.in_flight == 0 {
            self.advance_from_queue().await;
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        if self.session.state != ControllerState::Running {
            trace!(?event, state = %self.session.state, "Link event outside a run");
            return;
        }

        match event {
            LinkEvent::Ack { id } => self.handle_ack(id).await,
            LinkEvent::Error(message) => {
                if self.session.resend.is_some() {
                    debug!(error = %message, "Device error while resend pending");
                    return;
                }
                warn!(error = %message, "Device reported error");
                self.schedule_resend(stage_frame());
            }
        }
    }

    async fn handle_ack(&mut self, id: Bytes) {
        self.session.in_flight = self.session.in_flight.saturating_sub(1);
        trace!(id = ?id, in_flight = self.session.in_flight, "Ack");

        match self.session.resend.as_ref().map(|r| r.due) {
            Some(true) => self.fire_resend().await,
            // Hold new frames back until the resend goes out
            Some(false) => {}
            None => self.resume().await,
        }
    }

    /// Load the next queued program that still exists, clear-all first.
    async fn advance_from_queue(&mut self) {
        while let Some(name) = self.session.run_queue.pop_front() {
            match self.store.lookup(&name) {
                Some(program) => {
                    info!(program = %name, "Advancing to queued program");
                    self.replace_program(&name, program, true);
                    self.fill_window().await;
                    return;
                }
                None => warn!(program = %name, "Queued program no longer exists"),
            }
        }
        debug!(program = self.session.current_program.as_deref(), "Program complete, queue empty");
    }

    async fn teardown(&mut self) {
        self.cancel_resend();
        if let Some(mut link) = self.session.link.take() {
            link.stop().await;
            info!(port = link.name(), "Disconnected");
        }
        self.session = Session::default();
    }
}

/// Run blocking store I/O off the actor's thread.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

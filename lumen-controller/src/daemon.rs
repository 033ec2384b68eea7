//! Daemon lifecycle for lumend.
//!
//! Restores the program store, starts the controller, optionally connects
//! and starts a program, then waits for SIGINT/SIGTERM and shuts down.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::controller::{Controller, ControllerSettings};
use crate::error::{Error, Result};
use crate::link::serial::SerialConnector;
use crate::store::ProgramStore;
use crate::tracing::prelude::*;

/// Restore the store named by the config.
///
/// A missing file starts an empty store; an unreadable or corrupt one is
/// an error so a bad file is never silently replaced by the next save.
pub fn open_store(config: &Config) -> Result<ProgramStore> {
    if !config.store.restore_on_start {
        return Ok(ProgramStore::new());
    }

    let path = config.store_path();
    match ProgramStore::restore(&path) {
        Ok(store) => {
            info!(path = %path.display(), programs = store.len(), "Restored programs");
            Ok(store)
        }
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No store file yet, starting empty");
            Ok(ProgramStore::new())
        }
        Err(e) => Err(e),
    }
}

/// Connect to the configured port and, if one is named, start a program.
async fn autostart(controller: &Controller, port: &str, program: Option<&str>) -> Result<()> {
    match program {
        Some(program) => {
            controller.connect_and_load(port, program).await?;
            controller.run().await?;
            info!(port, program, "Autostarted");
        }
        None => controller.connect(port).await?,
    }
    Ok(())
}

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let store = open_store(&self.config)?;
        let connector = Arc::new(SerialConnector::new(self.config.serial.baud_rate));
        let controller = Controller::spawn(
            store,
            connector,
            ControllerSettings::from_config(&self.config),
        );

        if let Some(port) = self.config.serial.default_port.clone() {
            let program = self.config.serial.autorun_program.clone();
            let controller = controller.clone();
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    result = autostart(&controller, &port, program.as_deref()) => {
                        if let Err(e) = result {
                            error!(port = %port, error = %e, "Autostart failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Autostart abandoned");
                    }
                }
            });
        }
        self.tracker.close();

        info!("Started.");
        info!("Set RUST_LOG=lumen_controller=trace to see every frame and ack");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();
        self.tracker.wait().await;

        if let Err(e) = controller.shutdown().await {
            warn!(error = %e, "Controller already stopped");
        }
        info!("Exiting.");

        Ok(())
    }
}

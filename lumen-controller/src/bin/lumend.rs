//! Main entry point for the lumen daemon.

use lumen_controller::{config::Config, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::discover(|key| std::env::var(key).ok())?;
    Daemon::new(config).run().await
}

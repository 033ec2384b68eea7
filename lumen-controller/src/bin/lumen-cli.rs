//! Command-line tool for lumen program files and one-off playback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use lumen_controller::config::Config;
use lumen_controller::controller::{Controller, ControllerSettings, ControllerState};
use lumen_controller::link::LinkConnector;
use lumen_controller::link::serial::SerialConnector;
use lumen_controller::store::{MergePolicy, ProgramStore};

#[derive(Parser, Debug)]
#[command(name = "lumen-cli", version, about = "Inspect program files and drive a device")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports a device could be attached to
    Devices,

    /// List the programs in a store file
    Programs {
        store: PathBuf,
    },

    /// Merge one store file into another and write the result back
    Merge {
        target: PathBuf,
        source: PathBuf,
        /// Keep programs already in the target instead of replacing them
        #[arg(long)]
        keep_existing: bool,
    },

    /// Play programs in order on a device, then clear it
    Play {
        port: String,
        store: PathBuf,
        #[arg(required = true)]
        programs: Vec<String>,
        #[arg(long, default_value_t = 115200)]
        baud: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    lumen_controller::tracing::init_journald_or_stdout();
    let args = Args::parse();

    match args.command {
        Command::Devices => cmd_devices(),
        Command::Programs { store } => cmd_programs(&store),
        Command::Merge {
            target,
            source,
            keep_existing,
        } => cmd_merge(&target, &source, keep_existing),
        Command::Play {
            port,
            store,
            programs,
            baud,
        } => cmd_play(&port, &store, &programs, baud).await,
    }
}

fn cmd_devices() -> Result<()> {
    let devices = SerialConnector::new(115200).list_devices()?;
    if devices.is_empty() {
        println!("No serial ports found");
    }
    for device in devices {
        match device.description {
            Some(description) => println!("{}  {}", device.port, description),
            None => println!("{}", device.port),
        }
    }
    Ok(())
}

fn cmd_programs(path: &Path) -> Result<()> {
    let store = ProgramStore::restore(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut names = store.list_names();
    names.sort();
    for name in names {
        let frames = store.lookup(&name).map_or(0, |p| p.len());
        println!("{:<24} {:>6} frames", name, frames);
    }
    Ok(())
}

fn cmd_merge(target: &Path, source: &Path, keep_existing: bool) -> Result<()> {
    let store = if target.exists() {
        ProgramStore::restore(target).with_context(|| format!("reading {}", target.display()))?
    } else {
        ProgramStore::new()
    };
    let policy = if keep_existing {
        MergePolicy::KeepExisting
    } else {
        MergePolicy::Overwrite
    };

    let report = store
        .merge_from_file(source, policy)
        .with_context(|| format!("merging {}", source.display()))?;
    store.save(target)?;

    println!(
        "added {}, replaced {}, skipped {}",
        report.added.len(),
        report.replaced.len(),
        report.skipped.len()
    );
    for name in &report.skipped {
        println!("  kept existing: {}", name);
    }
    Ok(())
}

async fn cmd_play(port: &str, store: &Path, programs: &[String], baud: u32) -> Result<()> {
    let store = ProgramStore::restore(store)
        .with_context(|| format!("reading {}", store.display()))?;
    let Some((first, rest)) = programs.split_first() else {
        bail!("no programs given");
    };

    let config = Config::default();
    let controller = Controller::spawn(
        store,
        Arc::new(SerialConnector::new(baud)),
        ControllerSettings::from_config(&config),
    );

    controller.connect_and_load(port, first).await?;
    for name in rest {
        controller.enqueue(name.as_str()).await?;
    }
    controller.run().await?;

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = controller.status().await?;
        if status.state != ControllerState::Running || status.is_idle() {
            break;
        }
    }

    controller.end().await?;
    controller.shutdown().await?;
    Ok(())
}

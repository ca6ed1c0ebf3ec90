//! Live upgrade: how an engine instance starts, and how it hands its store to the next one.
//!
//! The outgoing instance publishes a checkpoint after every connection has drained; the incoming
//! instance consumes it before it starts listening. Nobody can therefore observe a store that is
//! fresh or half-copied in between.

use std::{ffi::OsString, fmt, path::Path, str::FromStr};

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::persist::SnapshotStore;
use crate::snapshot::Snapshot;

/// Why the engine is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    Fresh,
    /// Replacing a previous instance that published its store.
    LiveUpdate,
    /// Coming back after a crash; nothing was handed over.
    Restart,
}

impl FromStr for InitMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(InitMode::Fresh),
            "live-update" => Ok(InitMode::LiveUpdate),
            "restart" => Ok(InitMode::Restart),
            _ => Err(format!("unknown init mode {s:?} (fresh, live-update, restart)")),
        }
    }
}

impl fmt::Display for InitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitMode::Fresh => "fresh",
            InitMode::LiveUpdate => "live-update",
            InitMode::Restart => "restart",
        })
    }
}

/// What the outgoing instance does once its store is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMode {
    /// Replace the process image with the binary on disk.
    Exec,
    /// Exit and leave the restart to a supervisor.
    Exit,
}

impl FromStr for UpgradeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exec" => Ok(UpgradeMode::Exec),
            "exit" => Ok(UpgradeMode::Exit),
            _ => Err(format!("unknown upgrade mode {s:?} (exec, exit)")),
        }
    }
}

impl fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpgradeMode::Exec => "exec",
            UpgradeMode::Exit => "exit",
        })
    }
}

pub async fn start(mode: InitMode, store: &SnapshotStore, device: &str) -> Result<Engine> {
    match mode {
        InitMode::Fresh => {
            info!(device, "starting with an empty automaton");
            Ok(Engine::new())
        }
        InitMode::Restart => {
            warn!(device, "restarted without handover, automaton state is lost");
            Ok(Engine::new())
        }
        // No fallback: a missing or damaged snapshot fails the upgrade.
        InitMode::LiveUpdate => Ok(Engine::restore(store.take(device).await?)),
    }
}

/// Publish the engine's store for the next instance. Call only after serving has stopped.
pub async fn hand_off(engine: &Engine, store: &SnapshotStore, device: &str) -> Result<Snapshot> {
    let snapshot = engine.checkpoint();
    store.publish(device, &snapshot).await?;
    info!(
        device,
        generation = snapshot.generation,
        current = snapshot.automaton.current(),
        "store handed off"
    );
    Ok(snapshot)
}

/// Replace the running process with `exe`. Only returns on failure.
#[cfg(unix)]
pub fn reexec(exe: &Path, args: Vec<OsString>) -> Error {
    use std::os::unix::process::CommandExt;

    info!(exe = %exe.display(), "re-executing");
    Error::Io(std::process::Command::new(exe).args(args).exec())
}

#[cfg(not(unix))]
pub fn reexec(_exe: &Path, _args: Vec<OsString>) -> Error {
    Error::NotSupported("in-place re-exec on this platform, use --upgrade exit".to_string())
}

use std::{ffi::OsString, net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use dfadev::{
    http::{self, App, Limits, DEFAULT_LIMIT},
    persist::SnapshotStore,
    upgrade::{self, InitMode, UpgradeMode},
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "dfa-server", about = "Serve a DFA device over HTTP")]
struct Args {
    #[clap(long, env = "DFA_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// SQLite file the store is handed over through on upgrade.
    #[clap(long, env = "DFA_STATE_DB", default_value = "dfa-state.sqlite3")]
    state_db: PathBuf,

    #[clap(long, env = "DFA_DEVICE", default_value = "dfa")]
    device: String,

    /// fresh, live-update or restart.
    #[clap(long, default_value = "fresh")]
    init: InitMode,

    /// exec (replace this process) or exit (a supervisor restarts us).
    #[clap(long, env = "DFA_UPGRADE", default_value = "exec")]
    upgrade: UpgradeMode,

    #[clap(long, default_value_t = DEFAULT_LIMIT)]
    max_write: usize,

    #[clap(long, default_value_t = DEFAULT_LIMIT)]
    max_read: usize,
}

impl Args {
    // The command line of the instance that takes over.
    fn successor(&self) -> Vec<OsString> {
        vec![
            "--listen".into(), self.listen.to_string().into(),
            "--state-db".into(), self.state_db.clone().into(),
            "--device".into(), self.device.clone().into(),
            "--init".into(), InitMode::LiveUpdate.to_string().into(),
            "--upgrade".into(), self.upgrade.to_string().into(),
            "--max-write".into(), self.max_write.to_string().into(),
            "--max-read".into(), self.max_read.to_string().into(),
        ]
    }
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Resolved now: once the binary is replaced on disk the running image no longer has a path.
    let exe = std::env::current_exe()?;
    let args = Args::parse();

    let store = SnapshotStore::open(&args.state_db).await?;
    let engine = Arc::new(upgrade::start(args.init, &store, &args.device).await?);

    let listener = TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, device = %args.device, generation = engine.generation(), "serving");

    let limits = Limits { max_write: args.max_write, max_read: args.max_read };
    let app = Arc::new(App::new(engine.clone(), args.device.clone(), limits));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let trigger = app.upgrade.clone();
        tokio::task::spawn(async move {
            if hangup.recv().await.is_some() {
                info!("SIGHUP received");
                trigger.notify_one();
            }
        });
    }

    http::serve(listener, app).await;

    upgrade::hand_off(&engine, &store, &args.device).await?;
    store.close().await?;

    match args.upgrade {
        UpgradeMode::Exec => Err(upgrade::reexec(&exe, args.successor()).into()),
        UpgradeMode::Exit => {
            warn!("exiting for upgrade, restart with --init live-update");
            Ok(())
        }
    }
}

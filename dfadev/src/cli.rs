use std::{io::{Read, Write}, time::Duration};

use clap::{Parser, Subcommand};
use dfadev::{client, command, Command, Device};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "dfa-cli", about = "Talk to a DFA device")]
struct Args {
    #[clap(short, long, env = "DFA_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Check the device answers.
    Ping,
    /// Clear the table and accept set, restart the run from state 0.
    Reset,
    /// Define the transition p --a--> q.
    Add {
        #[clap(allow_hyphen_values = true)]
        p: i64,
        #[clap(allow_hyphen_values = true)]
        a: i64,
        #[clap(allow_hyphen_values = true)]
        q: i64,
    },
    Accept {
        #[clap(allow_hyphen_values = true)]
        p: i64,
    },
    Reject {
        #[clap(allow_hyphen_values = true)]
        p: i64,
    },
    /// Point every transition at 0 and reject every state.
    Clear,
    /// Configure the automaton accepting inputs of odd length.
    OddLength,
    /// Apply a JSON list of commands from a file.
    Load { file: String },
    /// Feed bytes through the automaton; stdin when DATA is absent.
    Write { data: Option<String> },
    /// Print N status bytes.
    Read { n: usize },
    /// Print Y or N and exit 0 on accept, 1 on reject.
    Fin,
    /// Send a raw ioctl, e.g. `ioctl 0x80016103 1`.
    Ioctl { request: String, arg: Vec<u8> },
    /// Live-upgrade the engine and wait for the new instance.
    Update {
        #[clap(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut dev = Device::open(&args.addr).await?;
    match args.action {
        Action::Ping => {
            dev.ping().await?;
            println!("pong");
        }
        Action::Reset => dev.reset().await?,
        Action::Add { p, a, q } => dev.add(p, a, q).await?,
        Action::Accept { p } => dev.accept(p).await?,
        Action::Reject { p } => dev.reject(p).await?,
        Action::Clear => dev.reset_device().await?,
        Action::OddLength => dev.control(&command::odd_length()).await?,
        Action::Load { file } => {
            let text = std::fs::read_to_string(file)?;
            let commands: Vec<Command> = serde_json::from_str(&text)?;
            dev.control(&commands).await?;
        }
        Action::Write { data } => {
            let data = match data {
                Some(data) => data.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let written = dev.write(&data).await?;
            println!("{written}");
        }
        Action::Read { n } => {
            let status = dev.read(n).await?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&status)?;
            stdout.write_all(b"\n")?;
        }
        Action::Fin => {
            let accepting = dev.fin().await?;
            println!("{}", if accepting { "Y" } else { "N" });
            if !accepting {
                dev.close();
                std::process::exit(1);
            }
        }
        Action::Ioctl { request, arg } => {
            let request = match request.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16)?,
                None => request.parse()?,
            };
            dev.ioctl(request, &arg).await?;
        }
        Action::Update { timeout_secs } => {
            dev.close();
            let instance = client::update(&args.addr, Duration::from_secs(timeout_secs)).await?;
            println!("{} is at generation {}", instance.device, instance.generation);
        }
    }
    Ok(())
}

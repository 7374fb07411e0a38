//! `gatewayd`: the distributed caching gateway binary. Mutually exclusive
//! actions are exposed as `clap` derive subcommands; every non-`start`
//! action opens a loopback connection to a live instance's client port and
//! speaks the admin-verb subset of the ASCII protocol.
//!
//! Grounded on `agentgateway`'s `main.rs` (clap-derive CLI + `tracing-subscriber`
//! `EnvFilter` init) generalized to this gateway's mutually-exclusive-action
//! shape instead of a single long-running proxy command.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use gatewayd::app::App;
use gatewayd::config;

#[derive(Parser)]
#[command(name = "gatewayd", version, about = "Distributed consistent-hash caching gateway")]
struct Cli {
    /// Config file, `key = value` format with `include` support.
    #[arg(short = 'f', long = "config", global = true, default_value = "gatewayd.conf")]
    config: PathBuf,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand)]
enum Action {
    /// Starts the gateway in the foreground (default action).
    Start,
    /// Asks a running instance to shut down.
    Stop,
    /// Reports the status of every backend in the fleet.
    Status,
    /// Adds a backend to the fleet.
    Add { ip: String, port: u16, scale: u32 },
    /// Removes a backend from the fleet.
    Remove { ip: String, port: u16 },
    /// Clears a LOCKED status on a backend.
    Unlock { ip: String, port: u16 },
    /// Reports which backend owns each given key.
    Hash { keys: Vec<String> },
    /// Bulk-loads records from a file through the running instance.
    Import { path: PathBuf },
}

fn init_logging(trace_flag: bool) {
    let default_filter = if trace_flag { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_ansi(false)
        .init();
}

/// Not `#[tokio::main]`: `worker_threads` comes from the config file, and
/// the runtime has to be sized before anything async runs.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.worker_threads.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(run(cli, cfg))
}

async fn run(cli: Cli, cfg: config::Config) -> anyhow::Result<()> {
    match cli.action.unwrap_or(Action::Start) {
        Action::Start => {
            init_logging(cfg.trace_flag);
            let app = std::sync::Arc::new(App::build(cfg)?);
            let cancel = app.cancel_token();
            let ctrl_c = async {
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
            };
            tokio::select! {
                result = app.run() => result?,
                _ = ctrl_c => {}
            }
            Ok(())
        }
        Action::Stop => admin_call(&cfg, "__/shutdown/__", &[]).await,
        Action::Status => admin_call(&cfg, "__/status/__", &[]).await,
        Action::Add { ip, port, scale } => admin_call(&cfg, "__/addserver/__", &[ip, port.to_string(), scale.to_string()]).await,
        Action::Remove { ip, port } => admin_call(&cfg, "__/removeserver/__", &[ip, port.to_string()]).await,
        Action::Unlock { ip, port } => admin_call(&cfg, "__/unlockserver/__", &[ip, port.to_string()]).await,
        Action::Hash { keys } => admin_call(&cfg, "__/hashserver/__", &keys).await,
        Action::Import { path } => admin_call(&cfg, "__/importdata/__", &[path.display().to_string()]).await,
    }
}

/// Opens a loopback connection to the configured client port and issues one
/// admin command, printing the gateway's reply line.
async fn admin_call(cfg: &config::Config, verb: &str, args: &[String]) -> anyhow::Result<()> {
    let addr = format!("127.0.0.1:{}", cfg.port_no);
    let mut stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(&addr)).await??;

    let mut line = verb.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line.push_str("\r\n");
    stream.write_all(line.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"\r\n") {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await??;

    print!("{}", String::from_utf8_lossy(&buf));
    Ok(())
}

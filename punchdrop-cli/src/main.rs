mod command;
mod event;
mod ui;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use punchdrop_core::config::{Context, Storage};

/// punchdrop: send a file straight to a peer behind NAT.
///
/// The downloader registers with a rendezvous service ("puncher") and gets
/// a short code.  The uploader looks the code up, both sides punch through
/// their NATs, and the file travels directly between them over QUIC.
#[derive(Parser, Debug)]
#[command(name = "punchdrop", version, about)]
struct Args {
    /// Directory holding config.toml and the certificate pair.
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    /// Log engine internals at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a file to the downloader registered under UID.
    Upload {
        uid: String,
        file: PathBuf,

        /// Password the downloader expects.
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Register with the rendezvous service and receive one file.
    Download {
        /// Directory where the received file is stored.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Only accept uploads carrying this password.
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Run the rendezvous service.
    Puncher {
        /// Address to listen on.
        #[arg(short, long, default_value = "0.0.0.0:50977")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with progress output on
    // stdout.  Library crates stay at "warn" unless --verbose is given.
    let default_filter = if args.verbose {
        "punchdrop_cli=debug,punchdrop_engine=debug,punchdrop_core=debug,warn"
    } else {
        "punchdrop_cli=info,warn"
    };
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let storage = Storage::new(args.app_dir)?;
    let context = Context::load(&storage)?;
    tracing::debug!(dir = %storage.dir().display(), "Configuration loaded");

    match args.command {
        Command::Upload {
            uid,
            file,
            password,
        } => command::upload(&context, &uid, &file, password).await,
        Command::Download { output, password } => {
            command::download(&context, output, password).await
        }
        Command::Puncher { listen } => command::puncher(&context, listen).await,
    }
}

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use punchdrop_core::config::Context;
use punchdrop_core::digest;
use punchdrop_core::transport::Listener;
use punchdrop_engine::pipeline::{ReceiveOptions, ReceiveOutcome};
use punchdrop_engine::quic::QuicEndpoint;
use punchdrop_engine::rendezvous_server::RendezvousServer;
use punchdrop_engine::session::{self, DownloadOptions, UploadOptions};

use crate::event::spawn_progress_printer;
use crate::ui::format_size;

/// How long to let connection teardown reach the peer before exiting.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handles `upload <uid> <file>`.
pub async fn upload(
    context: &Context,
    uid: &str,
    file: &Path,
    password: Option<String>,
) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a regular file", file.display());
    }

    let endpoint = pin_rendezvous(QuicEndpoint::client(&context.identity, any_addr())?, context)?;
    println!(
        "Sending {} ({}) to {uid}...",
        file.display(),
        format_size(metadata.len())
    );

    let (events, rx) = mpsc::unbounded_channel();
    let printer = spawn_progress_printer(rx);
    let options = UploadOptions {
        password,
        events: Some(events),
        cancel: cancel_on_ctrl_c(),
    };

    let result = session::upload(endpoint.clone(), &context.config, uid, file, options).await;
    let _ = printer.await;
    drain(&endpoint).await;

    let report = result?;
    println!(
        "Done: {} sent in {} chunks, verified by the receiver.",
        format_size(report.bytes_sent),
        report.chunks
    );
    Ok(())
}

/// Handles `download`.
pub async fn download(
    context: &Context,
    output: PathBuf,
    password: Option<String>,
) -> anyhow::Result<()> {
    let endpoint = pin_rendezvous(QuicEndpoint::server(&context.identity, any_addr())?, context)?;

    let (events, rx) = mpsc::unbounded_channel();
    let printer = spawn_progress_printer(rx);
    let options = DownloadOptions {
        receive: ReceiveOptions {
            output_dir: output,
            password_hash: password.as_deref().map(digest::hash_password),
            max_file_size: context.config.transfer.max_file_size,
        },
        events: Some(events),
        cancel: cancel_on_ctrl_c(),
    };

    let result = session::download(
        endpoint.clone(),
        endpoint.clone(),
        &context.config,
        options,
        |uid| {
            println!("Share this code with the sender: {uid}");
            println!("Waiting for the upload to start...");
        },
    )
    .await;
    let _ = printer.await;
    drain(&endpoint).await;

    match result? {
        ReceiveOutcome::Received(report) => {
            println!(
                "Done: {} ({}) saved to {}",
                report.file_name,
                format_size(report.bytes_received),
                report.path.display()
            );
            Ok(())
        }
        ReceiveOutcome::Rejected(reason) => bail!("transfer rejected: {reason}"),
    }
}

/// Handles `puncher`.
pub async fn puncher(context: &Context, listen: SocketAddr) -> anyhow::Result<()> {
    let endpoint = QuicEndpoint::server(&context.identity, listen)?;
    println!("Rendezvous service listening on {}", endpoint.local_addr());
    println!(
        "Certificate fingerprint (set as rendezvous.fingerprint on clients): {}",
        context.identity.fingerprint()
    );

    let shutdown = cancel_on_ctrl_c();
    RendezvousServer::new().serve(endpoint.clone(), shutdown).await;
    drain(&endpoint).await;
    Ok(())
}

/// Pins the configured rendezvous certificate, if any.
fn pin_rendezvous(endpoint: QuicEndpoint, context: &Context) -> anyhow::Result<QuicEndpoint> {
    let rendezvous = &context.config.rendezvous;
    match &rendezvous.fingerprint {
        Some(fingerprint) => endpoint.with_pinned_server(&context.identity, rendezvous.addr(), fingerprint),
        None => {
            warn!(
                addr = %rendezvous.addr(),
                "rendezvous.fingerprint is not set, the service's certificate is not checked"
            );
            Ok(endpoint)
        }
    }
}

fn any_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            cancel.cancel();
        }
    });
    token
}

async fn drain(endpoint: &QuicEndpoint) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, endpoint.wait_idle()).await;
}

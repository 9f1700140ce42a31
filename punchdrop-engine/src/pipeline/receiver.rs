use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use punchdrop_core::digest::ContentDigest;
use punchdrop_core::message::{ChunkInfo, MetaInfo};
use punchdrop_core::protocol::{Message, Packet};
use punchdrop_core::{Error, Result};

use super::{Events, ReceiverState, TransferEvent};
use crate::channel::{MessageChannel, unexpected};

const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Directory completed files are placed in.  Created if missing.
    pub output_dir: PathBuf,
    /// Expected password hash.  `None` accepts any sender.
    pub password_hash: Option<Vec<u8>>,
    /// Largest accepted file in bytes; `0` means no limit.
    pub max_file_size: u64,
}

/// Summary of a verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveReport {
    /// Name announced by the sender.
    pub file_name: String,
    /// Where the file was stored; differs from the announced name after a
    /// collision rename.
    pub path: PathBuf,
    pub bytes_received: u64,
    pub chunks: u64,
}

/// How a transfer that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Received(ReceiveReport),
    /// We declined the file; the reason was sent to the sender.
    Rejected(String),
}

/// Receiving side of the pipeline.  Owns the channel for the whole transfer.
pub struct FileReceiver {
    channel: MessageChannel,
    options: ReceiveOptions,
    state: ReceiverState,
    events: Events,
    /// Partial file on disk, removed unless the transfer verifies.
    part: Option<PathBuf>,
    cancel: CancellationToken,
}

impl FileReceiver {
    #[must_use]
    pub fn new(channel: MessageChannel, options: ReceiveOptions) -> Self {
        Self {
            channel,
            options,
            state: ReceiverState::AwaitingMeta,
            events: Events::default(),
            part: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Reports state changes and progress on `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Events::new(tx);
        self
    }

    /// Abandons the transfer when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Receives one file.
    ///
    /// # Errors
    ///
    /// - [`Error::ChecksumMismatch`] if the received bytes do not match the
    ///   announced digest or size; the sender is told so.
    /// - [`Error::UnexpectedPacket`] / [`Error::MalformedMessage`] on
    ///   protocol violations, reported to the sender as a protocol error.
    /// - [`Error::Internal`] on local I/O failures, reported to the sender
    ///   as an internal error.
    /// - [`Error::Cancelled`] if the cancellation token fires; the partial
    ///   file is removed and the channel dropped without waiting for the peer.
    pub async fn receive(mut self) -> Result<ReceiveOutcome> {
        self.transition(ReceiverState::AwaitingMeta);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run() => result,
        };

        if let Some(part) = self.part.take() {
            if let Err(e) = fs::remove_file(&part).await {
                warn!(path = %part.display(), error = %e, "Could not remove partial file");
            }
        }

        match &result {
            Ok(ReceiveOutcome::Received(report)) => {
                self.transition(ReceiverState::Done);
                info!(
                    peer = %self.channel.peer(),
                    path = %report.path.display(),
                    bytes = report.bytes_received,
                    "Download verified"
                );
            }
            Ok(ReceiveOutcome::Rejected(reason)) => {
                self.transition(ReceiverState::Rejected);
                info!(peer = %self.channel.peer(), reason = %reason, "Transfer rejected");
            }
            Err(e) => {
                self.transition(ReceiverState::Failed);
                warn!(peer = %self.channel.peer(), error = %e, "Download failed");
                self.channel.notify_failure(e).await;
            }
        }

        if matches!(result, Err(Error::Cancelled)) {
            drop(self.channel);
        } else {
            self.channel.close().await;
        }
        result
    }

    async fn run(&mut self) -> Result<ReceiveOutcome> {
        let meta = self.read_meta().await?;
        debug!(?meta, "File info received");

        let (destination, mut file) = match self.accept(&meta).await? {
            Ok(accepted) => accepted,
            Err(reason) => {
                self.channel.send(Packet::Reject, reason.as_bytes()).await?;
                return Ok(ReceiveOutcome::Rejected(reason));
            }
        };
        let part = part_path(&destination);

        self.channel.send_bare(Packet::ReadyAck).await?;
        self.transition(ReceiverState::AwaitingChunks);

        let (received, chunks, digest) = self.read_chunks(&mut file, meta.file_size).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if received != meta.file_size || digest.finalize_hex() != meta.file_hash {
            warn!(
                expected_bytes = meta.file_size,
                received_bytes = received,
                "Received data does not match the announced file"
            );
            self.channel.send_bare(Packet::ChecksumMismatch).await?;
            return Err(Error::ChecksumMismatch);
        }

        fs::rename(&part, &destination).await?;
        self.part = None;
        self.channel.send_bare(Packet::ChecksumMatch).await?;

        Ok(ReceiveOutcome::Received(ReceiveReport {
            file_name: meta.file_name,
            path: destination,
            bytes_received: received,
            chunks,
        }))
    }

    /// The single `MetaInfo` packet, or the older split announcement.
    async fn read_meta(&mut self) -> Result<MetaInfo> {
        let first = self.channel.recv().await?;
        match first.packet {
            Packet::MetaInfo => MetaInfo::decode(&first.body),
            Packet::FileNameAnnounce => {
                let file_name = String::from_utf8(first.body.to_vec())
                    .map_err(|_| Error::MalformedMessage("file name is not valid UTF-8".into()))?;

                let size = self.expect(Packet::FileSizeAnnounce).await?;
                let size: [u8; 8] = size.body[..].try_into().map_err(|_| {
                    Error::MalformedMessage(format!("file size of {} bytes", size.body.len()))
                })?;

                let hash = self.expect(Packet::FileHashAnnounce).await?;

                Ok(MetaInfo {
                    password_hash: Vec::new(),
                    file_name,
                    file_size: u64::from_be_bytes(size),
                    file_hash: hash.body.to_vec(),
                })
            }
            _ => Err(unexpected(&first)),
        }
    }

    async fn expect(&mut self, packet: Packet) -> Result<Message> {
        let message = self.channel.recv().await?;
        if message.packet == packet {
            Ok(message)
        } else {
            Err(unexpected(&message))
        }
    }

    /// Applies the acceptance policy.  The inner `Err` is a reject reason
    /// for the sender; the outer one a local failure.
    ///
    /// On acceptance the partial file exists with the announced size and is
    /// returned open for writing, along with the final destination.
    async fn accept(
        &mut self,
        meta: &MetaInfo,
    ) -> Result<std::result::Result<(PathBuf, File), String>> {
        if let Some(expected) = &self.options.password_hash {
            if &meta.password_hash != expected {
                return Ok(Err("wrong password".into()));
            }
        }

        let Some(name) = sanitize_file_name(&meta.file_name) else {
            return Ok(Err(format!("invalid file name {:?}", meta.file_name)));
        };

        if self.options.max_file_size > 0 && meta.file_size > self.options.max_file_size {
            return Ok(Err(format!(
                "file too large ({} bytes, limit {})",
                meta.file_size, self.options.max_file_size
            )));
        }

        fs::create_dir_all(&self.options.output_dir).await?;
        if let Some(available) = available_space(&self.options.output_dir) {
            if available < meta.file_size {
                warn!(size = meta.file_size, available, "Not enough free space");
                return Ok(Err("insufficient storage".into()));
            }
        }

        let (destination, file) = claim_destination(&self.options.output_dir, name).await?;
        self.part = Some(part_path(&destination));
        if let Err(e) = file.set_len(meta.file_size).await {
            warn!(size = meta.file_size, error = %e, "Could not reserve space");
            return Ok(Err("insufficient storage".into()));
        }

        Ok(Ok((destination, file)))
    }

    async fn read_chunks(
        &mut self,
        file: &mut File,
        file_size: u64,
    ) -> Result<(u64, u64, ContentDigest)> {
        let mut digest = ContentDigest::new();
        let mut chunks: u64 = 0;

        loop {
            let message = self.channel.recv().await?;
            if message.packet != Packet::ChunkData {
                return Err(unexpected(&message));
            }
            let chunk = ChunkInfo::decode(&message.body)?;

            if digest.len() + chunk.data.len() as u64 > file_size {
                return Err(Error::MalformedMessage(format!(
                    "sender exceeded the announced {file_size} bytes"
                )));
            }

            file.write_all(&chunk.data).await?;
            digest.update(&chunk.data);
            chunks += 1;
            self.events.emit(TransferEvent::Progress {
                transferred: digest.len(),
                total: file_size,
            });

            if chunk.is_final {
                return Ok((digest.len(), chunks, digest));
            }
        }
    }

    fn transition(&mut self, next: ReceiverState) {
        debug!(from = ?self.state, to = ?next, "Receiver state");
        self.state = next;
        self.events.emit(TransferEvent::Receiver(next));
    }
}

/// The announced name if it is a plain file name, `None` if it would escape
/// the output directory or name no file at all.
fn sanitize_file_name(name: &str) -> Option<&str> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    (!invalid).then_some(name)
}

/// Picks `dir/name`, or `dir/stem (n).ext` for the first `n` with no
/// finished file, and creates its partial file.  The partial file is created
/// exclusively, so two receivers never share one.
async fn claim_destination(dir: &Path, name: &str) -> Result<(PathBuf, File)> {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };

    let mut n: u32 = 0;
    loop {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{stem} ({n}){ext}"))
        };
        n += 1;

        if fs::try_exists(&candidate).await? {
            continue;
        }
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(part_path(&candidate))
            .await;
        match opened {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Free bytes on the filesystem holding `dir`, if the platform can tell.
#[cfg(unix)]
#[allow(clippy::useless_conversion, clippy::unnecessary_cast)]
fn available_space(dir: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(dir) {
        Ok(stat) => {
            Some(u64::from(stat.blocks_available()).saturating_mul(stat.fragment_size() as u64))
        }
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "statvfs failed, skipping space check");
            None
        }
    }
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Option<u64> {
    None
}

fn part_path(destination: &Path) -> PathBuf {
    let mut part = destination.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    PathBuf::from(part)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use punchdrop_core::digest;

    use super::*;
    use crate::memory;
    use crate::pipeline::{FileSender, SendOptions};

    const CS: usize = 16;

    fn channels() -> (MessageChannel, MessageChannel) {
        let (a, b) = memory::pair("uploader", "downloader");
        (MessageChannel::new(a), MessageChannel::new(b))
    }

    fn options(dir: &Path) -> ReceiveOptions {
        ReceiveOptions {
            output_dir: dir.to_path_buf(),
            password_hash: None,
            max_file_size: 0,
        }
    }

    fn send_options(password: &str) -> SendOptions {
        SendOptions {
            chunk_size: CS,
            password_hash: digest::hash_password(password),
        }
    }

    fn meta(name: &str, content: &[u8]) -> MetaInfo {
        let mut digest = ContentDigest::new();
        digest.update(content);
        MetaInfo {
            password_hash: digest::hash_password(""),
            file_name: name.to_string(),
            file_size: content.len() as u64,
            file_hash: digest.finalize_hex(),
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn given_real_sender_when_receiving_then_file_stored_and_verified() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..=255u8).cycle().take(10 * CS + 3).collect();
        let path = src.path().join("photo.jpg");
        std::fs::write(&path, &content).unwrap();

        let (local, remote) = channels();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(
            FileReceiver::new(remote, options(out.path()))
                .with_events(tx)
                .receive(),
        );

        let sent = FileSender::new(local, send_options("")).send(&path).await.unwrap();
        let outcome = receiver.await.unwrap().unwrap();

        let ReceiveOutcome::Received(report) = outcome else {
            panic!("expected a received file, got {outcome:?}");
        };
        assert_eq!(report.path, out.path().join("photo.jpg"));
        assert_eq!(report.bytes_received, content.len() as u64);
        assert_eq!(report.chunks, sent.chunks);
        assert_eq!(std::fs::read(&report.path).unwrap(), content);
        assert_eq!(dir_entries(out.path()), vec!["photo.jpg"]);

        let mut last_progress = None;
        let mut done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::Progress { transferred, total } => last_progress = Some((transferred, total)),
                TransferEvent::Receiver(ReceiverState::Done) => done = true,
                _ => {}
            }
        }
        let total = content.len() as u64;
        assert_eq!(last_progress, Some((total, total)));
        assert!(done);
    }

    #[tokio::test]
    async fn given_altered_byte_in_transit_when_receiving_then_checksum_mismatch() {
        let out = tempfile::tempdir().unwrap();
        let content = b"0123456789abcdef0123".to_vec();

        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local
            .send(Packet::MetaInfo, &meta("data.bin", &content).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(local.recv().await.unwrap().packet, Packet::ReadyAck);

        let mut tampered = BytesMut::from(&content[..]);
        tampered[7] ^= 0x01;
        let chunk = ChunkInfo::new(true, tampered.freeze());
        local.send(Packet::ChunkData, &chunk.encode()).await.unwrap();

        assert_eq!(local.recv().await.unwrap().packet, Packet::ChecksumMismatch);
        drop(local);

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch));
        assert!(dir_entries(out.path()).is_empty());
    }

    #[tokio::test]
    async fn given_final_chunk_before_announced_size_when_receiving_then_checksum_mismatch() {
        let out = tempfile::tempdir().unwrap();
        let content = b"only part of it".to_vec();

        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local
            .send(Packet::MetaInfo, &meta("short.bin", &content).encode().unwrap())
            .await
            .unwrap();
        local.recv().await.unwrap();
        let chunk = ChunkInfo::new(true, content[..4].to_vec());
        local.send(Packet::ChunkData, &chunk.encode()).await.unwrap();

        assert_eq!(local.recv().await.unwrap().packet, Packet::ChecksumMismatch);
        drop(local);
        assert!(matches!(receiver.await.unwrap(), Err(Error::ChecksumMismatch)));
        assert!(dir_entries(out.path()).is_empty());
    }

    #[tokio::test]
    async fn given_wrong_password_when_receiving_then_rejected_and_sender_told() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = src.path().join("secret.txt");
        std::fs::write(&path, b"classified").unwrap();

        let (local, remote) = channels();
        let receive_options = ReceiveOptions {
            password_hash: Some(digest::hash_password("hunter2")),
            ..options(out.path())
        };
        let receiver = tokio::spawn(FileReceiver::new(remote, receive_options).receive());

        let err = FileSender::new(local, send_options("guess"))
            .send(&path)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RejectedByPeer(reason) if reason == "wrong password"));
        assert_eq!(
            receiver.await.unwrap().unwrap(),
            ReceiveOutcome::Rejected("wrong password".into())
        );
        assert!(dir_entries(out.path()).is_empty());
    }

    #[tokio::test]
    async fn given_file_over_limit_when_receiving_then_rejected() {
        let out = tempfile::tempdir().unwrap();
        let (mut local, remote) = channels();
        let receive_options = ReceiveOptions {
            max_file_size: 8,
            ..options(out.path())
        };
        let receiver = tokio::spawn(FileReceiver::new(remote, receive_options).receive());

        local
            .send(Packet::MetaInfo, &meta("big.bin", &[0u8; 9]).encode().unwrap())
            .await
            .unwrap();
        let reply = local.recv().await.unwrap();
        assert_eq!(reply.packet, Packet::Reject);
        assert!(reply.body_text().contains("too large"));
        drop(local);

        assert!(matches!(receiver.await.unwrap(), Ok(ReceiveOutcome::Rejected(_))));
    }

    #[tokio::test]
    async fn given_path_in_file_name_when_receiving_then_rejected() {
        let out = tempfile::tempdir().unwrap();
        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local
            .send(Packet::MetaInfo, &meta("../escape.sh", b"rm").encode().unwrap())
            .await
            .unwrap();
        assert_eq!(local.recv().await.unwrap().packet, Packet::Reject);
        drop(local);

        assert!(matches!(receiver.await.unwrap(), Ok(ReceiveOutcome::Rejected(_))));
        assert!(dir_entries(out.path()).is_empty());
    }

    #[tokio::test]
    async fn given_existing_file_when_receiving_then_stored_under_new_name() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("notes.txt"), b"old").unwrap();
        std::fs::write(out.path().join("notes (1).txt"), b"older").unwrap();
        let path = src.path().join("notes.txt");
        std::fs::write(&path, b"new").unwrap();

        let (local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());
        FileSender::new(local, send_options("")).send(&path).await.unwrap();

        let Ok(ReceiveOutcome::Received(report)) = receiver.await.unwrap() else {
            panic!("expected a received file");
        };
        assert_eq!(report.path, out.path().join("notes (2).txt"));
        assert_eq!(std::fs::read(out.path().join("notes.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(&report.path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn given_split_announcement_when_receiving_then_file_accepted() {
        let out = tempfile::tempdir().unwrap();
        let content = b"legacy".to_vec();
        let info = meta("old.txt", &content);

        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local.send(Packet::FileNameAnnounce, b"old.txt").await.unwrap();
        local
            .send(Packet::FileSizeAnnounce, &info.file_size.to_be_bytes())
            .await
            .unwrap();
        local.send(Packet::FileHashAnnounce, &info.file_hash).await.unwrap();
        assert_eq!(local.recv().await.unwrap().packet, Packet::ReadyAck);

        let chunk = ChunkInfo::new(true, content.clone());
        local.send(Packet::ChunkData, &chunk.encode()).await.unwrap();
        assert_eq!(local.recv().await.unwrap().packet, Packet::ChecksumMatch);
        drop(local);

        assert!(matches!(receiver.await.unwrap(), Ok(ReceiveOutcome::Received(_))));
        assert_eq!(std::fs::read(out.path().join("old.txt")).unwrap(), content);
    }

    #[tokio::test]
    async fn given_chunk_before_file_info_when_receiving_then_protocol_error_sent() {
        let out = tempfile::tempdir().unwrap();
        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local
            .send(Packet::ChunkData, &ChunkInfo::new(true, Vec::new()).encode())
            .await
            .unwrap();

        assert_eq!(local.recv().await.unwrap().packet, Packet::ProtocolError);
        drop(local);
        assert!(matches!(
            receiver.await.unwrap(),
            Err(Error::UnexpectedPacket(Packet::ChunkData))
        ));
    }

    #[tokio::test]
    async fn given_sender_vanishes_mid_stream_when_receiving_then_partial_file_removed() {
        let out = tempfile::tempdir().unwrap();
        let content = vec![5u8; 4 * CS];

        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        local
            .send(Packet::MetaInfo, &meta("cut.bin", &content).encode().unwrap())
            .await
            .unwrap();
        local.recv().await.unwrap();
        let chunk = ChunkInfo::new(false, content[..CS].to_vec());
        local.send(Packet::ChunkData, &chunk.encode()).await.unwrap();
        drop(local);

        assert!(matches!(receiver.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(dir_entries(out.path()).is_empty());
    }

    #[test]
    fn given_announced_names_when_sanitizing_then_only_plain_names_pass() {
        assert_eq!(sanitize_file_name("report.pdf"), Some("report.pdf"));
        assert_eq!(sanitize_file_name(".bashrc"), Some(".bashrc"));
        for bad in ["", ".", "..", "a/b", "..\\win", "nul\0byte"] {
            assert_eq!(sanitize_file_name(bad), None, "{bad:?}");
        }
    }

    #[tokio::test]
    async fn given_dotfile_collision_when_renaming_then_suffix_goes_at_end() {
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join(".env"), b"").unwrap();
        let (path, _file) = claim_destination(out.path(), ".env").await.unwrap();
        assert_eq!(path, out.path().join(".env (1)"));
        assert!(out.path().join(".env (1).part").exists());
    }

    #[tokio::test]
    async fn given_partial_file_of_another_transfer_when_claiming_then_left_untouched() {
        let out = tempfile::tempdir().unwrap();
        std::fs::write(out.path().join("movie.mkv.part"), b"in flight").unwrap();

        let (first, _a) = claim_destination(out.path(), "movie.mkv").await.unwrap();
        let (second, _b) = claim_destination(out.path(), "movie.mkv").await.unwrap();

        assert_eq!(first, out.path().join("movie (1).mkv"));
        assert_eq!(second, out.path().join("movie (2).mkv"));
        assert_eq!(std::fs::read(out.path().join("movie.mkv.part")).unwrap(), b"in flight");
    }

    #[cfg(unix)]
    #[test]
    fn given_existing_dir_when_checking_space_then_reports_free_bytes() {
        let out = tempfile::tempdir().unwrap();
        assert!(available_space(out.path()).is_some_and(|free| free > 0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn given_file_larger_than_disk_when_receiving_then_rejected_for_storage() {
        let out = tempfile::tempdir().unwrap();
        let (mut local, remote) = channels();
        let receiver = tokio::spawn(FileReceiver::new(remote, options(out.path())).receive());

        let info = MetaInfo {
            file_size: u64::MAX / 2,
            ..meta("huge.bin", b"")
        };
        local.send(Packet::MetaInfo, &info.encode().unwrap()).await.unwrap();
        let reply = local.recv().await.unwrap();
        assert_eq!(reply.packet, Packet::Reject);
        assert_eq!(reply.body_text(), "insufficient storage");
        drop(local);

        assert!(matches!(receiver.await.unwrap(), Ok(ReceiveOutcome::Rejected(_))));
        assert!(dir_entries(out.path()).is_empty());
    }

    #[tokio::test]
    async fn given_sender_stalls_mid_stream_when_cancelled_then_partial_file_removed() {
        let out = tempfile::tempdir().unwrap();
        let content = vec![6u8; 4 * CS];

        let (mut local, remote) = channels();
        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(
            FileReceiver::new(remote, options(out.path()))
                .with_cancellation(cancel.clone())
                .receive(),
        );

        local
            .send(Packet::MetaInfo, &meta("stall.bin", &content).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(local.recv().await.unwrap().packet, Packet::ReadyAck);
        let chunk = ChunkInfo::new(false, content[..CS].to_vec());
        local.send(Packet::ChunkData, &chunk.encode()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(dir_entries(out.path()), vec!["stall.bin.part"]);

        cancel.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(3), receiver)
            .await
            .expect("receive did not stop after cancellation")
            .unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(dir_entries(out.path()).is_empty());
        assert!(matches!(local.recv().await, Err(Error::ConnectionClosed)));
    }
}

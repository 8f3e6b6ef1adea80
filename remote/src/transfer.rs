//! GET/PUT transfer engine: manifest building, the framed file stream and
//! the overwrite arbitration handshake.
//!
//! Both directions run the same wire shape (see [`crate::protocol`]); GET
//! streams server→client with arbitration applied locally on the client,
//! PUT streams client→server with a probe/verdict exchange before every
//! file. Files finalise in manifest order and the trailing summary is the
//! last frame on the wire.

use anyhow::Context;
use async_recursion::async_recursion;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{
    FileDecision, FileEntry, FileHeader, Manifest, OverwritePolicy, PutGo, PutProbe,
    TransferFileError, TransferFrame, TransferOutcome, TransferSummary,
};
use crate::streams::Channel;
use common::errors::ErrorCode;
use common::list::{EntryKind, full_mtime_nsec};

/// Copy buffer for file payloads.
pub const COPY_BUFFER: usize = 128 * 1024;

/// Live counters a UI can poll while a transfer runs.
#[derive(Debug, Default)]
pub struct Progress {
    pub total_bytes: AtomicU64,
    pub bytes: AtomicU64,
    pub files: AtomicU64,
}

impl Progress {
    fn add_file(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Resolves overwrite arbitration for entries the policy cannot decide
/// alone (`prompt`).
///
/// The GET client prompts its operator directly; the PUT server parks
/// until the matching `put_decision` RPC lands on the control channel.
pub trait OverwriteDecider: Send {
    fn decide(
        &mut self,
        idx: u64,
        entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<FileDecision>> + Send;
}

/// Fixed-answer decider for batch mode and tests.
pub struct AutoDecider(pub FileDecision);

impl OverwriteDecider for AutoDecider {
    fn decide(
        &mut self,
        _idx: u64,
        _entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<FileDecision>> + Send {
        std::future::ready(Ok(self.0))
    }
}

/// Reacts to an `Undecided` verdict on the sending side of a PUT: surfaces
/// the question to the operator and forwards the answer over the control
/// channel as `put_decision`.
pub trait UndecidedHandler: Send {
    fn resolve(
        &mut self,
        idx: u64,
        entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// Handler for flows that can never see `Undecided` (non-prompt policies).
pub struct NoPrompt;

impl UndecidedHandler for NoPrompt {
    fn resolve(
        &mut self,
        _idx: u64,
        _entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        std::future::ready(Err(anyhow::anyhow!(
            "receiver answered Undecided for a non-prompt transfer"
        )))
    }
}

/// Builds the ordered manifest for the requested roots.
///
/// Returns the manifest plus, aligned with its entries, the absolute
/// source path for every entry that carries a payload. A symlink is
/// promoted to a regular file when it resolves inside `boundary` to one;
/// otherwise it travels as a symlink entry with its literal target.
pub async fn build_manifest(
    roots: &[(std::path::PathBuf, String)],
    boundary: &std::path::Path,
) -> anyhow::Result<(Manifest, Vec<Option<std::path::PathBuf>>)> {
    let mut files = vec![];
    let mut sources = vec![];
    let mut total_bytes = 0u64;
    for (abs, rel) in roots {
        walk_manifest(abs, rel, boundary, &mut files, &mut sources, &mut total_bytes).await?;
    }
    Ok((Manifest { files, total_bytes }, sources))
}

#[async_recursion]
async fn walk_manifest(
    abs: &std::path::Path,
    rel: &str,
    boundary: &std::path::Path,
    files: &mut Vec<FileEntry>,
    sources: &mut Vec<Option<std::path::PathBuf>>,
    total_bytes: &mut u64,
) -> anyhow::Result<()> {
    let metadata = tokio::fs::symlink_metadata(abs)
        .await
        .with_context(|| format!("cannot stat {abs:?}"))?;
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        if let Ok(resolved) = tokio::fs::canonicalize(abs).await {
            if resolved.starts_with(boundary) {
                if let Ok(target_md) = tokio::fs::metadata(&resolved).await {
                    if target_md.is_file() {
                        files.push(FileEntry {
                            path: rel.to_string(),
                            kind: EntryKind::File,
                            size: target_md.len(),
                            mtime_nsec: full_mtime_nsec(&target_md),
                            mode: target_md.permissions().mode(),
                            symlink_target: None,
                        });
                        sources.push(Some(resolved));
                        *total_bytes += target_md.len();
                        return Ok(());
                    }
                }
            }
        }
        let target = tokio::fs::read_link(abs)
            .await
            .with_context(|| format!("cannot read symlink {abs:?}"))?;
        files.push(FileEntry {
            path: rel.to_string(),
            kind: EntryKind::Symlink,
            size: 0,
            mtime_nsec: full_mtime_nsec(&metadata),
            mode: metadata.permissions().mode(),
            symlink_target: Some(target.to_string_lossy().into_owned()),
        });
        sources.push(None);
        return Ok(());
    }
    if file_type.is_dir() {
        files.push(FileEntry {
            path: rel.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            mtime_nsec: full_mtime_nsec(&metadata),
            mode: metadata.permissions().mode(),
            symlink_target: None,
        });
        sources.push(None);
        let mut names = vec![];
        let mut entries = tokio::fs::read_dir(abs)
            .await
            .with_context(|| format!("cannot open directory {abs:?} for reading"))?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        names.sort();
        for name in names {
            let child_rel = format!("{}/{}", rel, name.to_string_lossy());
            walk_manifest(&abs.join(&name), &child_rel, boundary, files, sources, total_bytes)
                .await?;
        }
        return Ok(());
    }
    files.push(FileEntry {
        path: rel.to_string(),
        kind: EntryKind::File,
        size: metadata.len(),
        mtime_nsec: full_mtime_nsec(&metadata),
        mode: metadata.permissions().mode(),
        symlink_target: None,
    });
    sources.push(Some(abs.to_path_buf()));
    *total_bytes += metadata.len();
    Ok(())
}

fn record_error(summary: &mut TransferSummary, path: &str, code: ErrorCode, message: String) {
    summary.files_err += 1;
    summary.errors.push(TransferFileError {
        path: path.to_string(),
        error: code,
        message,
    });
}

async fn send_one_file(
    channel: &mut Channel,
    idx: u64,
    entry: &FileEntry,
    source: &std::path::Path,
    summary: &mut TransferSummary,
    progress: Option<&Progress>,
) -> anyhow::Result<()> {
    let mut file = match tokio::fs::File::open(source).await {
        Ok(file) => file,
        Err(error) => {
            // nothing hit the wire for this entry yet, so the receiver just
            // sees the idx gap and the error in the trailing summary
            record_error(summary, &entry.path, error.kind().into(), error.to_string());
            return Ok(());
        }
    };
    channel
        .send
        .send_message_with_data(
            &TransferFrame::File(FileHeader {
                idx,
                len: entry.size,
            }),
            &mut file,
            entry.size,
        )
        .await
        .with_context(|| format!("failed streaming {:?}", entry.path))?;
    summary.files_ok += 1;
    summary.bytes_ok += entry.size;
    if let Some(progress) = progress {
        progress.add_file(entry.size);
    }
    Ok(())
}

/// GET sender: manifest, files in order, trailing summary. No arbitration
/// frames; the receiver applies its policy locally.
pub async fn send_tree(
    channel: &mut Channel,
    manifest: &Manifest,
    sources: &[Option<std::path::PathBuf>],
    progress: Option<&Progress>,
) -> anyhow::Result<TransferSummary> {
    if let Some(progress) = progress {
        progress.total_bytes.store(manifest.total_bytes, Ordering::Relaxed);
    }
    channel.send.send_message(manifest).await?;
    let mut summary = TransferSummary::new();
    for (idx, entry) in manifest.files.iter().enumerate() {
        let Some(source) = sources[idx].as_deref() else {
            continue;
        };
        send_one_file(channel, idx as u64, entry, source, &mut summary, progress).await?;
    }
    channel
        .send
        .send_message(&TransferFrame::Done(summary.clone()))
        .await?;
    Ok(summary)
}

/// PUT sender: like [`send_tree`] but every file is preceded by a probe
/// and gated on the receiver's verdict.
pub async fn send_tree_arbitrated<H: UndecidedHandler>(
    channel: &mut Channel,
    manifest: &Manifest,
    sources: &[Option<std::path::PathBuf>],
    undecided: &mut H,
    progress: Option<&Progress>,
) -> anyhow::Result<TransferSummary> {
    if let Some(progress) = progress {
        progress.total_bytes.store(manifest.total_bytes, Ordering::Relaxed);
    }
    channel.send.send_message(manifest).await?;
    let mut summary = TransferSummary::new();
    for (idx, entry) in manifest.files.iter().enumerate() {
        let Some(source) = sources[idx].as_deref() else {
            continue;
        };
        let idx = idx as u64;
        channel
            .send
            .send_message(&TransferFrame::Probe(PutProbe { idx }))
            .await?;
        let decision = loop {
            let go: PutGo = channel
                .recv
                .recv_message()
                .await?
                .ok_or_else(|| anyhow::Error::new(ErrorCode::Truncated))?;
            match go.decision {
                FileDecision::Undecided => undecided.resolve(idx, entry).await?,
                decided => break decided,
            }
        };
        if decision == FileDecision::Skip {
            summary.files_skipped += 1;
            continue;
        }
        send_one_file(channel, idx, entry, source, &mut summary, progress).await?;
    }
    channel
        .send
        .send_message(&TransferFrame::Done(summary.clone()))
        .await?;
    Ok(summary)
}

/// Receiver configuration.
#[derive(Clone, Copy, Debug)]
pub struct RecvOptions {
    pub policy: OverwritePolicy,
    /// PUT receivers answer probes on the wire; GET receivers decide
    /// locally and drain skipped payloads.
    pub arbitrate: bool,
}

fn policy_verdict(
    policy: OverwritePolicy,
    entry: &FileEntry,
    existing: &std::fs::Metadata,
) -> FileDecision {
    match policy {
        OverwritePolicy::Yes => FileDecision::Accept,
        OverwritePolicy::No => FileDecision::Skip,
        OverwritePolicy::Newer => {
            if entry.mtime_nsec > full_mtime_nsec(existing) {
                FileDecision::Accept
            } else {
                FileDecision::Skip
            }
        }
        OverwritePolicy::DifferentSize => {
            if entry.size != existing.size() {
                FileDecision::Accept
            } else {
                FileDecision::Skip
            }
        }
        OverwritePolicy::Prompt => FileDecision::Undecided,
    }
}

/// Receives a transfer into `dest_base`, containing every entry path
/// inside `boundary` via the path resolver.
///
/// Returns our summary plus the sender's trailing one when the stream
/// completed cleanly. A truncated stream aborts the transfer with the
/// in-flight file marked `Truncated`.
pub async fn recv_tree<D: OverwriteDecider>(
    channel: &mut Channel,
    boundary: &std::path::Path,
    dest_base: &std::path::Path,
    options: &RecvOptions,
    decider: &mut D,
    progress: Option<&Progress>,
) -> anyhow::Result<(TransferSummary, Option<TransferSummary>)> {
    let manifest: Manifest = channel
        .recv
        .recv_message()
        .await
        .map_err(|_| anyhow::Error::new(ErrorCode::ProtocolError))?
        .ok_or_else(|| anyhow::Error::new(ErrorCode::Truncated))?;
    if let Some(progress) = progress {
        progress.total_bytes.store(manifest.total_bytes, Ordering::Relaxed);
    }
    let mut summary = TransferSummary::new();
    // structure pass: directories and symlinks never carry payload
    for (idx, entry) in manifest.files.iter().enumerate() {
        match entry.kind {
            EntryKind::Directory => {
                apply_directory(boundary, dest_base, entry, &mut summary).await;
            }
            EntryKind::Symlink => {
                apply_symlink(boundary, dest_base, idx as u64, entry, options, decider, &mut summary)
                    .await?;
            }
            EntryKind::File => {}
        }
    }
    // payload pass: probes, file frames, trailing summary
    loop {
        let frame = match channel.recv.recv_message::<TransferFrame>().await {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => {
                summary.outcome = TransferOutcome::Aborted;
                return Ok((summary, None));
            }
        };
        match frame {
            TransferFrame::Probe(probe) => {
                let Some(entry) = manifest.files.get(probe.idx as usize) else {
                    return Err(anyhow::Error::new(ErrorCode::ProtocolError));
                };
                let verdict = match resolve_target(boundary, dest_base, entry).await {
                    Err(code) => {
                        record_error(&mut summary, &entry.path, code, "path rejected".to_string());
                        channel
                            .send
                            .send_message(&PutGo {
                                decision: FileDecision::Skip,
                            })
                            .await?;
                        continue;
                    }
                    Ok(target) => match tokio::fs::symlink_metadata(&target).await {
                        Ok(existing) => policy_verdict(options.policy, entry, &existing),
                        Err(_) => FileDecision::Accept,
                    },
                };
                match verdict {
                    FileDecision::Undecided => {
                        channel
                            .send
                            .send_message(&PutGo {
                                decision: FileDecision::Undecided,
                            })
                            .await?;
                        let final_decision = match decider.decide(probe.idx, entry).await? {
                            FileDecision::Undecided => FileDecision::Skip,
                            decided => decided,
                        };
                        channel
                            .send
                            .send_message(&PutGo {
                                decision: final_decision,
                            })
                            .await?;
                        if final_decision == FileDecision::Skip {
                            summary.files_skipped += 1;
                        }
                    }
                    decided => {
                        channel.send.send_message(&PutGo { decision: decided }).await?;
                        if decided == FileDecision::Skip {
                            summary.files_skipped += 1;
                        }
                    }
                }
            }
            TransferFrame::File(header) => {
                let Some(entry) = manifest.files.get(header.idx as usize) else {
                    return Err(anyhow::Error::new(ErrorCode::ProtocolError));
                };
                if entry.kind != EntryKind::File {
                    return Err(anyhow::Error::new(ErrorCode::ProtocolError));
                }
                if !receive_file(channel, boundary, dest_base, &header, entry, options, decider, &mut summary, progress)
                    .await?
                {
                    summary.outcome = TransferOutcome::Aborted;
                    return Ok((summary, None));
                }
            }
            TransferFrame::Done(sender_summary) => {
                return Ok((summary, Some(sender_summary)));
            }
        }
    }
}

async fn resolve_target(
    boundary: &std::path::Path,
    dest_base: &std::path::Path,
    entry: &FileEntry,
) -> Result<std::path::PathBuf, ErrorCode> {
    common::resolver::resolve(boundary, dest_base, &entry.path).await
}

async fn apply_directory(
    boundary: &std::path::Path,
    dest_base: &std::path::Path,
    entry: &FileEntry,
    summary: &mut TransferSummary,
) {
    let target = match resolve_target(boundary, dest_base, entry).await {
        Ok(target) => target,
        Err(code) => {
            record_error(summary, &entry.path, code, "path rejected".to_string());
            return;
        }
    };
    if let Err(error) = tokio::fs::create_dir_all(&target).await {
        record_error(summary, &entry.path, error.kind().into(), error.to_string());
        return;
    }
    let _ = tokio::fs::set_permissions(
        &target,
        std::fs::Permissions::from_mode(entry.mode & 0o7777),
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn apply_symlink<D: OverwriteDecider>(
    boundary: &std::path::Path,
    dest_base: &std::path::Path,
    idx: u64,
    entry: &FileEntry,
    options: &RecvOptions,
    decider: &mut D,
    summary: &mut TransferSummary,
) -> anyhow::Result<()> {
    let Some(target_value) = entry.symlink_target.as_deref() else {
        record_error(
            summary,
            &entry.path,
            ErrorCode::InvalidArgument,
            "symlink entry without target".to_string(),
        );
        return Ok(());
    };
    let target = match resolve_target(boundary, dest_base, entry).await {
        Ok(target) => target,
        Err(code) => {
            record_error(summary, &entry.path, code, "path rejected".to_string());
            return Ok(());
        }
    };
    if let Ok(existing) = tokio::fs::symlink_metadata(&target).await {
        let mut verdict = policy_verdict(options.policy, entry, &existing);
        if verdict == FileDecision::Undecided {
            // probes only cover regular files, so there is no counterpart
            // to ask on an arbitrated (PUT) stream; skip is the safe answer
            verdict = if options.arbitrate {
                FileDecision::Skip
            } else {
                match decider.decide(idx, entry).await? {
                    FileDecision::Accept => FileDecision::Accept,
                    _ => FileDecision::Skip,
                }
            };
        }
        if verdict == FileDecision::Skip {
            summary.files_skipped += 1;
            return Ok(());
        }
        if let Err(error) = tokio::fs::remove_file(&target).await {
            record_error(summary, &entry.path, error.kind().into(), error.to_string());
            return Ok(());
        }
    }
    if let Some(parent) = target.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::symlink(target_value, &target).await {
        Ok(()) => summary.files_ok += 1,
        Err(error) => {
            record_error(summary, &entry.path, error.kind().into(), error.to_string());
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn receive_file<D: OverwriteDecider>(
    channel: &mut Channel,
    boundary: &std::path::Path,
    dest_base: &std::path::Path,
    header: &FileHeader,
    entry: &FileEntry,
    options: &RecvOptions,
    decider: &mut D,
    summary: &mut TransferSummary,
    progress: Option<&Progress>,
) -> anyhow::Result<bool> {
    let target = match resolve_target(boundary, dest_base, entry).await {
        Ok(target) => target,
        Err(code) => {
            record_error(summary, &entry.path, code, "path rejected".to_string());
            return drain_payload(channel, header, summary).await;
        }
    };
    if !options.arbitrate {
        // GET: arbitration is local; the bytes are on the wire either way
        if let Ok(existing) = tokio::fs::symlink_metadata(&target).await {
            let mut verdict = policy_verdict(options.policy, entry, &existing);
            if verdict == FileDecision::Undecided {
                verdict = match decider.decide(header.idx, entry).await? {
                    FileDecision::Accept => FileDecision::Accept,
                    _ => FileDecision::Skip,
                };
            }
            if verdict == FileDecision::Skip {
                summary.files_skipped += 1;
                return drain_payload(channel, header, summary).await;
            }
        }
    }
    if let Some(parent) = target.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let mut file = match tokio::fs::File::create(&target).await {
        Ok(file) => file,
        Err(error) => {
            record_error(summary, &entry.path, error.kind().into(), error.to_string());
            return drain_payload(channel, header, summary).await;
        }
    };
    match channel
        .recv
        .copy_exact_to(&mut file, header.len, COPY_BUFFER)
        .await
    {
        Ok(_) => {}
        Err(_) => {
            record_error(
                summary,
                &entry.path,
                ErrorCode::Truncated,
                "stream ended mid-file".to_string(),
            );
            return Ok(false);
        }
    }
    drop(file);
    if let Err(error) = common::copy::set_mode_and_time(&target, entry.mode, entry.mtime_nsec).await
    {
        tracing::debug!("cannot apply metadata to {:?}: {:#}", target, error);
    }
    summary.files_ok += 1;
    summary.bytes_ok += header.len;
    if let Some(progress) = progress {
        progress.add_file(header.len);
    }
    Ok(true)
}

/// Discards a payload we decided not to keep; a truncated drain still
/// aborts the transfer.
async fn drain_payload(
    channel: &mut Channel,
    header: &FileHeader,
    summary: &mut TransferSummary,
) -> anyhow::Result<bool> {
    match channel.recv.drain_exact(header.len, COPY_BUFFER).await {
        Ok(_) => Ok(true),
        Err(_) => {
            summary.errors.push(TransferFileError {
                path: String::new(),
                error: ErrorCode::Truncated,
                message: "stream ended mid-file".to_string(),
            });
            Ok(false)
        }
    }
}

/// A transfer (or rexec) endpoint: an ephemeral listener that accepts
/// exactly one connection, which must come from the control channel's
/// peer.
pub struct Endpoint {
    listener: tokio::net::TcpListener,
}

impl Endpoint {
    pub async fn bind(address: std::net::IpAddr) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((address, 0)).await?;
        Ok(Endpoint { listener })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accepts the one expected connection, dropping any peer whose
    /// address does not match the session's, until `timeout` expires.
    pub async fn accept_from(
        self,
        expected_peer: std::net::IpAddr,
        tls: Option<tokio_rustls::TlsAcceptor>,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Channel> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("transfer endpoint accept timed out");
            }
            let accepted = tokio::time::timeout(remaining, self.listener.accept()).await;
            let (stream, peer) = match accepted {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => anyhow::bail!("transfer endpoint accept timed out"),
            };
            if peer.ip() != expected_peer {
                tracing::warn!(
                    "dropping transfer connection from {} (expected {})",
                    peer,
                    expected_peer
                );
                continue;
            }
            return match &tls {
                Some(acceptor) => {
                    let tls_stream = acceptor.accept(stream).await?;
                    let (read_half, write_half) = tokio::io::split(tls_stream);
                    Ok(Channel::from_parts(read_half, write_half))
                }
                None => Ok(Channel::from_tcp(stream)),
            };
        }
    }
}

/// Connects to a transfer/rexec/control endpoint, wrapping in TLS when a
/// client config is given.
pub async fn connect(
    addr: std::net::SocketAddr,
    tls: Option<std::sync::Arc<rustls::ClientConfig>>,
) -> anyhow::Result<Channel> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;
    match tls {
        Some(config) => {
            let connector = tokio_rustls::TlsConnector::from(config);
            let server_name = rustls::pki_types::ServerName::try_from("esd")
                .map_err(|error| anyhow::anyhow!("invalid server name: {error}"))?;
            let tls_stream = connector.connect(server_name, stream).await?;
            let (read_half, write_half) = tokio::io::split(tls_stream);
            Ok(Channel::from_parts(read_half, write_half))
        }
        None => Ok(Channel::from_tcp(stream)),
    }
}

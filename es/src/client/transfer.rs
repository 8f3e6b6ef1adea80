//! Client-side transfer drivers: issue the RPC, connect to the endpoint,
//! run the engine, narrate progress.

use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use remote::protocol::{
    FileDecision, FileEntry, Manifest, OverwritePolicy, Request, TransferSummary, TransferTicket,
};
use remote::transfer::{
    AutoDecider, Progress, RecvOptions, UndecidedHandler, recv_tree, send_tree_arbitrated,
};

use crate::client::connection::Connection;
use crate::client::prompt;

/// Spawns the progress-bar ticker over the engine's shared counters.
fn spawn_progress_bar(progress: Arc<Progress>) -> tokio::task::JoinHandle<()> {
    let bar_progress = progress;
    tokio::spawn(async move {
        let bar = indicatif::ProgressBar::new(0);
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{bytes}/{total_bytes} [{bar:30}] {bytes_per_sec}",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
        );
        loop {
            bar.set_length(bar_progress.total_bytes.load(Ordering::Relaxed));
            bar.set_position(bar_progress.bytes.load(Ordering::Relaxed));
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    })
}

/// Downloads `paths` from the bound sharing into `dest`.
pub async fn get(
    connection: &mut Connection,
    paths: &[String],
    policy: OverwritePolicy,
    dest: &std::path::Path,
    show_progress: bool,
) -> anyhow::Result<(TransferSummary, Option<TransferSummary>)> {
    let ticket: TransferTicket = connection
        .call_as(&Request::Get {
            paths: paths.to_vec(),
            policy,
        })
        .await?;
    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("cannot create destination {dest:?}"))?;
    let dest = tokio::fs::canonicalize(dest).await?;
    let mut channel = connection.open_endpoint(ticket.port).await?;
    let progress = Arc::new(Progress::default());
    let bar = show_progress.then(|| spawn_progress_bar(progress.clone()));
    let options = RecvOptions {
        policy,
        arbitrate: false,
    };
    let result = if policy == OverwritePolicy::Prompt {
        recv_tree(
            &mut channel,
            &dest,
            &dest,
            &options,
            &mut prompt::ConsoleDecider,
            Some(&progress),
        )
        .await
    } else {
        recv_tree(
            &mut channel,
            &dest,
            &dest,
            &options,
            &mut AutoDecider(FileDecision::Skip),
            Some(&progress),
        )
        .await
    };
    if let Some(task) = bar {
        task.abort();
    }
    result
}

/// Answers `Undecided` probes by asking the operator and forwarding the
/// verdict over the control channel.
struct ControlPrompter<'a> {
    connection: &'a mut Connection,
    transfer_id: u64,
}

impl UndecidedHandler for ControlPrompter<'_> {
    fn resolve(
        &mut self,
        idx: u64,
        entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send {
        let path = entry.path.clone();
        async move {
            let decision = if prompt::ask_overwrite(&path).await? {
                FileDecision::Accept
            } else {
                FileDecision::Skip
            };
            self.connection
                .call(&Request::PutDecision {
                    transfer_id: self.transfer_id,
                    file_id: idx,
                    decision,
                })
                .await?;
            Ok(())
        }
    }
}

/// Builds one merged manifest over several local roots, each contained to
/// its own tree for symlink promotion.
pub async fn local_manifest(
    local_paths: &[std::path::PathBuf],
) -> anyhow::Result<(Manifest, Vec<Option<std::path::PathBuf>>)> {
    let mut files = vec![];
    let mut sources = vec![];
    let mut total_bytes = 0u64;
    for path in local_paths {
        let abs = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("cannot resolve local path {path:?}"))?;
        let rel = abs
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow::anyhow!("cannot send a filesystem root"))?;
        let (manifest, mut part_sources) =
            remote::transfer::build_manifest(&[(abs.clone(), rel)], &abs).await?;
        files.extend(manifest.files);
        sources.append(&mut part_sources);
        total_bytes += manifest.total_bytes;
    }
    Ok((Manifest { files, total_bytes }, sources))
}

/// Uploads local paths into the sharing's current directory.
pub async fn put(
    connection: &mut Connection,
    local_paths: &[std::path::PathBuf],
    policy: OverwritePolicy,
    show_progress: bool,
) -> anyhow::Result<TransferSummary> {
    let (manifest, sources) = local_manifest(local_paths).await?;
    let ticket: TransferTicket = connection.call_as(&Request::Put { policy }).await?;
    let mut channel = connection.open_endpoint(ticket.port).await?;
    let progress = Arc::new(Progress::default());
    let bar = show_progress.then(|| spawn_progress_bar(progress.clone()));
    let mut handler = ControlPrompter {
        connection,
        transfer_id: ticket.transfer_id,
    };
    let result =
        send_tree_arbitrated(&mut channel, &manifest, &sources, &mut handler, Some(&progress))
            .await;
    if let Some(task) = bar {
        task.abort();
    }
    result
}

/// One-line rendering of a transfer summary.
pub fn summarize(summary: &TransferSummary) -> String {
    format!(
        "{:?}: files ok {}, skipped {}, failed {}, {} transferred",
        summary.outcome,
        summary.files_ok,
        summary.files_skipped,
        summary.files_err,
        bytesize::ByteSize(summary.bytes_ok)
    )
}

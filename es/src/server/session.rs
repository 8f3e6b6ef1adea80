//! Per-connection session state and the RPC dispatch table.

use std::sync::Arc;

use common::errors::ErrorCode;
use common::list::{FindFlags, LsFlags};
use common::sharing::{Sharing, SharingKind};
use remote::protocol::{
    BatchOutcome, FileDecision, Pong, Request, Response, TransferDirection, TransferState,
    TransferTicket,
};
use remote::streams::Channel;
use remote::transfer::{Endpoint, OverwriteDecider, RecvOptions};

use crate::server::daemon::Shared;
use crate::server::rexec;

/// A decision slot for one PUT file awaiting `put_decision`; the RPC may
/// land before or after the transfer task starts waiting.
pub(crate) enum DecisionSlot {
    Waiting(tokio::sync::oneshot::Sender<FileDecision>),
    Ready(FileDecision),
}

type PendingDecisions = Arc<tokio::sync::Mutex<std::collections::HashMap<u64, DecisionSlot>>>;

struct TransferHandle {
    direction: TransferDirection,
    state: Arc<tokio::sync::Mutex<TransferState>>,
    pending: PendingDecisions,
    cancel: tokio_util::sync::CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Waits for the control channel to deliver the operator's verdict.
struct SessionDecider {
    pending: PendingDecisions,
}

impl OverwriteDecider for SessionDecider {
    fn decide(
        &mut self,
        idx: u64,
        _entry: &remote::protocol::FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<FileDecision>> + Send {
        let pending = self.pending.clone();
        async move {
            let receiver;
            {
                let mut map = pending.lock().await;
                match map.remove(&idx) {
                    Some(DecisionSlot::Ready(decision)) => return Ok(decision),
                    _ => {
                        let (sender, new_receiver) = tokio::sync::oneshot::channel();
                        map.insert(idx, DecisionSlot::Waiting(sender));
                        receiver = new_receiver;
                    }
                }
            }
            Ok(receiver.await.unwrap_or(FileDecision::Skip))
        }
    }
}

struct Session {
    id: u64,
    peer: std::net::SocketAddr,
    authenticated: bool,
    sharing: Option<Arc<Sharing>>,
    cwd: std::path::PathBuf,
    transfers: std::collections::HashMap<u64, TransferHandle>,
    next_transfer_id: u64,
    rexec_tasks: Vec<(tokio_util::sync::CancellationToken, tokio::task::JoinHandle<()>)>,
    shared: Arc<Shared>,
}

/// Runs one control connection to completion.
pub async fn handle_connection(
    shared: Arc<Shared>,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
) {
    let channel = match &shared.tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let (read_half, write_half) = tokio::io::split(tls_stream);
                Channel::from_parts(read_half, write_half)
            }
            Err(error) => {
                tracing::warn!("TLS handshake with {} failed: {}", peer, error);
                return;
            }
        },
        None => Channel::from_tcp(stream),
    };
    let id = shared.next_session_id();
    shared.sessions.lock().await.insert(id, peer);
    let mut session = Session {
        id,
        peer,
        authenticated: false,
        sharing: None,
        cwd: std::path::PathBuf::new(),
        transfers: std::collections::HashMap::new(),
        next_transfer_id: 1,
        rexec_tasks: vec![],
        shared: shared.clone(),
    };
    session.serve(channel).await;
    session.teardown().await;
    shared.sessions.lock().await.remove(&id);
    tracing::debug!("session {} from {} closed", id, peer);
}

impl Session {
    async fn serve(&mut self, mut channel: Channel) {
        loop {
            let frame = tokio::time::timeout(
                self.shared.config.idle_timeout,
                channel.recv.recv_message::<serde_json::Value>(),
            )
            .await;
            let value = match frame {
                Err(_) => {
                    tracing::info!("session {} idle for too long, closing", self.id);
                    break;
                }
                // malformed frame or JSON: drop the connection without reply
                Ok(Err(error)) => {
                    tracing::warn!("session {}: protocol error: {:#}", self.id, error);
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(value))) => value,
            };
            let response = match serde_json::from_value::<Request>(value) {
                Ok(request) => {
                    tracing::debug!("session {}: {:?}", self.id, request_name(&request));
                    self.dispatch(request).await
                }
                Err(_) => Response::err(ErrorCode::InvalidArgument),
            };
            if let Err(error) = channel.send.send_message(&response).await {
                tracing::warn!("session {}: send failed: {:#}", self.id, error);
                break;
            }
        }
    }

    /// Aborts everything the session owns; sockets close with the tasks.
    async fn teardown(&mut self) {
        for (transfer_id, handle) in self.transfers.drain() {
            handle.cancel.cancel();
            handle.task.abort();
            let state = *handle.state.lock().await;
            tracing::debug!("transfer {} torn down in state {:?}", transfer_id, state);
        }
        for (cancel, task) in self.rexec_tasks.drain(..) {
            cancel.cancel();
            task.abort();
        }
    }

    async fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Ping { payload } => json_ok(&Pong {
                payload,
                timestamp: chrono::Utc::now().to_rfc3339(),
            }),
            Request::Info => json_ok(&self.shared.descriptor),
            Request::List => json_ok(&self.shared.descriptor.sharings),
            Request::Auth { password } => self.auth(&password),
            Request::Open { name } => self.open(&name),
            Request::Close => self.close(),
            Request::Rpwd => match self.bound() {
                Ok(sharing) => {
                    let display = common::resolver::display_path(&sharing.root, &self.cwd);
                    json_ok(&display)
                }
                Err(code) => Response::err(code),
            },
            Request::Rcd { path } => self.rcd(&path).await,
            Request::Rls { path, flags } => self.rls(&path, &flags).await,
            Request::Rtree {
                path,
                max_depth,
                flags,
            } => self.rtree(&path, max_depth, &flags).await,
            Request::Rmkdir { path } => self.rmkdir(&path).await,
            Request::Rmv { sources, dest } => self.rmv_or_rcp(&sources, &dest, true).await,
            Request::Rcp { sources, dest } => self.rmv_or_rcp(&sources, &dest, false).await,
            Request::Rrm { paths } => self.rrm(&paths).await,
            Request::Rfind { pattern, flags } => self.rfind(&pattern, &flags).await,
            Request::Get { paths, policy: _ } => self.start_get(&paths).await,
            Request::Put { policy } => self.start_put(policy).await,
            Request::PutDecision {
                transfer_id,
                file_id,
                decision,
            } => self.put_decision(transfer_id, file_id, decision).await,
            Request::Rexec { cmd } => self.start_rexec(Some(cmd)).await,
            Request::Rshell => self.start_rexec(None).await,
        }
    }

    fn auth(&mut self, password: &str) -> Response {
        let Some(credentials) = &self.shared.config.credentials else {
            self.authenticated = true;
            return Response::ok_empty();
        };
        if credentials.verify(password) {
            self.authenticated = true;
            Response::ok_empty()
        } else {
            tracing::info!("session {}: authentication failed", self.id);
            Response::err(ErrorCode::AuthFailed)
        }
    }

    fn open(&mut self, name: &str) -> Response {
        if self.shared.config.credentials.is_some() && !self.authenticated {
            return Response::err(ErrorCode::AuthRequired);
        }
        if self.sharing.is_some() {
            return Response::err(ErrorCode::AlreadyBound);
        }
        let Some(sharing) = self.shared.sharings.get(name) else {
            return Response::err(ErrorCode::NoSuchSharing);
        };
        self.cwd = sharing.root.clone();
        self.sharing = Some(sharing.clone());
        Response::ok_empty()
    }

    fn close(&mut self) -> Response {
        if self.sharing.take().is_none() {
            return Response::err(ErrorCode::NotBound);
        }
        self.cwd = std::path::PathBuf::new();
        Response::ok_empty()
    }

    fn bound(&self) -> Result<Arc<Sharing>, ErrorCode> {
        self.sharing.clone().ok_or(ErrorCode::NotBound)
    }

    fn writable(&self) -> Result<Arc<Sharing>, ErrorCode> {
        let sharing = self.bound()?;
        if sharing.read_only {
            return Err(ErrorCode::ReadOnly);
        }
        Ok(sharing)
    }

    async fn resolve(&self, sharing: &Sharing, input: &str) -> Result<std::path::PathBuf, ErrorCode> {
        common::resolver::resolve(&sharing.root, &self.cwd, input).await
    }

    async fn rcd(&mut self, path: &str) -> Response {
        let sharing = match self.bound() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let resolved = match self.resolve(&sharing, path).await {
            Ok(resolved) => resolved,
            Err(code) => return Response::err(code),
        };
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_dir() => {
                self.cwd = resolved;
                json_ok(&common::resolver::display_path(&sharing.root, &self.cwd))
            }
            Ok(_) => Response::err(ErrorCode::NotADirectory),
            Err(error) => Response::err(error.into()),
        }
    }

    async fn rls(&self, path: &str, flags: &LsFlags) -> Response {
        let sharing = match self.bound() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let resolved = match self.resolve(&sharing, path).await {
            Ok(resolved) => resolved,
            Err(code) => return Response::err(code),
        };
        match tokio::fs::metadata(&resolved).await {
            Ok(metadata) if metadata.is_dir() => match common::list::ls(&resolved, flags).await {
                Ok(entries) => json_ok(&entries),
                Err(error) => Response::err(fs_error_code(&error)),
            },
            Ok(metadata) => {
                let name = resolved
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| sharing.name.clone());
                json_ok(&vec![common::list::EntryInfo {
                    name,
                    kind: common::list::EntryKind::of(&metadata.file_type()),
                    size: metadata.len(),
                    mtime_nsec: common::list::full_mtime_nsec(&metadata),
                    mode: {
                        use std::os::unix::fs::PermissionsExt;
                        metadata.permissions().mode()
                    },
                    depth: None,
                }])
            }
            Err(error) => Response::err(error.into()),
        }
    }

    async fn rtree(&self, path: &str, max_depth: Option<u32>, flags: &LsFlags) -> Response {
        let sharing = match self.bound() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let resolved = match self.resolve(&sharing, path).await {
            Ok(resolved) => resolved,
            Err(code) => return Response::err(code),
        };
        match common::list::tree(&resolved, max_depth, flags).await {
            Ok(entries) => json_ok(&entries),
            Err(error) => Response::err(fs_error_code(&error)),
        }
    }

    async fn rmkdir(&self, path: &str) -> Response {
        let sharing = match self.writable() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let resolved = match self.resolve(&sharing, path).await {
            Ok(resolved) => resolved,
            Err(code) => return Response::err(code),
        };
        match common::copy::mkdir(&resolved).await {
            Ok(()) => Response::ok_empty(),
            Err(error) => Response::err(fs_error_code(&error)),
        }
    }

    async fn rmv_or_rcp(&self, sources: &[String], dest: &str, is_move: bool) -> Response {
        let sharing = match self.writable() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        if sources.is_empty() {
            return Response::err(ErrorCode::InvalidArgument);
        }
        let dest_resolved = match self.resolve(&sharing, dest).await {
            Ok(resolved) => resolved,
            Err(code) => return Response::err(code),
        };
        let dest_is_dir = tokio::fs::metadata(&dest_resolved)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if sources.len() > 1 && !dest_is_dir {
            return Response::err(ErrorCode::NotADirectory);
        }
        let mut outcomes = vec![];
        for source in sources {
            let outcome = self
                .move_or_copy_one(&sharing, source, &dest_resolved, dest_is_dir, is_move)
                .await;
            outcomes.push(match outcome {
                Ok(()) => BatchOutcome {
                    path: source.clone(),
                    ok: true,
                    error: None,
                    message: None,
                },
                Err((code, message)) => BatchOutcome {
                    path: source.clone(),
                    ok: false,
                    error: Some(code),
                    message: Some(message),
                },
            });
        }
        json_ok(&outcomes)
    }

    async fn move_or_copy_one(
        &self,
        sharing: &Sharing,
        source: &str,
        dest_resolved: &std::path::Path,
        dest_is_dir: bool,
        is_move: bool,
    ) -> Result<(), (ErrorCode, String)> {
        let src_resolved = self
            .resolve(sharing, source)
            .await
            .map_err(|code| (code, "path rejected".to_string()))?;
        tokio::fs::symlink_metadata(&src_resolved)
            .await
            .map_err(|error| (error.kind().into(), error.to_string()))?;
        let target = if dest_is_dir {
            match src_resolved.file_name() {
                Some(name) => dest_resolved.join(name),
                None => return Err((ErrorCode::InvalidArgument, "cannot move a root".to_string())),
            }
        } else {
            dest_resolved.to_path_buf()
        };
        let result = if is_move {
            common::copy::mv(&src_resolved, &target).await
        } else {
            common::copy::cp(&src_resolved, &target).await
        };
        result.map_err(|error| (fs_error_code(&error), format!("{error:#}")))
    }

    async fn rrm(&self, paths: &[String]) -> Response {
        let sharing = match self.writable() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let mut outcomes = vec![];
        for path in paths {
            let outcome = match self.resolve(&sharing, path).await {
                Ok(resolved) if resolved == sharing.root => Err((
                    ErrorCode::InvalidArgument,
                    "refusing to remove the sharing root".to_string(),
                )),
                Ok(resolved) => common::rm::rm(&resolved)
                    .await
                    .map_err(|error| (fs_error_code(&error), format!("{error:#}"))),
                Err(code) => Err((code, "path rejected".to_string())),
            };
            outcomes.push(match outcome {
                Ok(()) => BatchOutcome {
                    path: path.clone(),
                    ok: true,
                    error: None,
                    message: None,
                },
                Err((code, message)) => BatchOutcome {
                    path: path.clone(),
                    ok: false,
                    error: Some(code),
                    message: Some(message),
                },
            });
        }
        json_ok(&outcomes)
    }

    async fn rfind(&self, pattern: &str, flags: &FindFlags) -> Response {
        let sharing = match self.bound() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        if sharing.kind == SharingKind::File {
            return Response::err(ErrorCode::NotADirectory);
        }
        match common::list::find(&self.cwd, pattern, flags).await {
            Ok(entries) => json_ok(&entries),
            Err(error) => {
                if error.downcast_ref::<std::io::Error>().is_some() {
                    Response::err(fs_error_code(&error))
                } else {
                    Response::err(ErrorCode::InvalidArgument)
                }
            }
        }
    }

    async fn start_get(&mut self, paths: &[String]) -> Response {
        let sharing = match self.bound() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let requested = if paths.is_empty() {
            vec![String::new()]
        } else {
            paths.to_vec()
        };
        let mut roots = vec![];
        for path in &requested {
            let resolved = match self.resolve(&sharing, path).await {
                Ok(resolved) => resolved,
                Err(code) => return Response::err(code),
            };
            if tokio::fs::symlink_metadata(&resolved).await.is_err() {
                return Response::err(ErrorCode::NotFound);
            }
            let rel = resolved
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| sharing.name.clone());
            roots.push((resolved, rel));
        }
        let endpoint = match Endpoint::bind(self.shared.bind_ip).await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::error!("cannot bind transfer endpoint: {:#}", error);
                return Response::err(ErrorCode::TransportError);
            }
        };
        let port = match endpoint.port() {
            Ok(port) => port,
            Err(_) => return Response::err(ErrorCode::TransportError),
        };
        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        let state = Arc::new(tokio::sync::Mutex::new(TransferState::Created));
        let pending: PendingDecisions = Arc::default();
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = {
            let state = state.clone();
            let cancel = cancel.clone();
            let tls = self.shared.tls.clone();
            let peer_ip = self.peer.ip();
            let accept_timeout = self.shared.config.endpoint_timeout;
            let boundary = sharing.root.clone();
            tokio::spawn(async move {
                let work = async {
                    let mut channel = endpoint.accept_from(peer_ip, tls, accept_timeout).await?;
                    *state.lock().await = TransferState::Streaming;
                    let (manifest, sources) =
                        remote::transfer::build_manifest(&roots, &boundary).await?;
                    remote::transfer::send_tree(&mut channel, &manifest, &sources, None).await?;
                    anyhow::Ok(())
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        *state.lock().await = TransferState::Aborted;
                    }
                    result = work => {
                        *state.lock().await = match result {
                            Ok(()) => TransferState::Finalised,
                            Err(error) => {
                                tracing::warn!("get transfer failed: {:#}", error);
                                TransferState::Aborted
                            }
                        };
                    }
                }
            })
        };
        self.transfers.insert(
            transfer_id,
            TransferHandle {
                direction: TransferDirection::Get,
                state,
                pending,
                cancel,
                task,
            },
        );
        json_ok(&TransferTicket { transfer_id, port })
    }

    async fn start_put(&mut self, policy: remote::protocol::OverwritePolicy) -> Response {
        let sharing = match self.writable() {
            Ok(sharing) => sharing,
            Err(code) => return Response::err(code),
        };
        let endpoint = match Endpoint::bind(self.shared.bind_ip).await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::error!("cannot bind transfer endpoint: {:#}", error);
                return Response::err(ErrorCode::TransportError);
            }
        };
        let port = match endpoint.port() {
            Ok(port) => port,
            Err(_) => return Response::err(ErrorCode::TransportError),
        };
        let transfer_id = self.next_transfer_id;
        self.next_transfer_id += 1;
        let state = Arc::new(tokio::sync::Mutex::new(TransferState::Created));
        let pending: PendingDecisions = Arc::default();
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = {
            let state = state.clone();
            let pending = pending.clone();
            let cancel = cancel.clone();
            let tls = self.shared.tls.clone();
            let peer_ip = self.peer.ip();
            let accept_timeout = self.shared.config.endpoint_timeout;
            let boundary = sharing.root.clone();
            let dest_base = self.cwd.clone();
            tokio::spawn(async move {
                let work = async {
                    let mut channel = endpoint.accept_from(peer_ip, tls, accept_timeout).await?;
                    *state.lock().await = TransferState::Streaming;
                    let options = RecvOptions {
                        policy,
                        arbitrate: true,
                    };
                    let mut decider = SessionDecider { pending };
                    let (ours, _theirs) = remote::transfer::recv_tree(
                        &mut channel,
                        &boundary,
                        &dest_base,
                        &options,
                        &mut decider,
                        None,
                    )
                    .await?;
                    anyhow::Ok(ours.outcome)
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        *state.lock().await = TransferState::Aborted;
                    }
                    result = work => {
                        *state.lock().await = match result {
                            Ok(remote::protocol::TransferOutcome::Completed) => {
                                TransferState::Finalised
                            }
                            Ok(remote::protocol::TransferOutcome::Aborted) => TransferState::Aborted,
                            Err(error) => {
                                tracing::warn!("put transfer failed: {:#}", error);
                                TransferState::Aborted
                            }
                        };
                    }
                }
            })
        };
        self.transfers.insert(
            transfer_id,
            TransferHandle {
                direction: TransferDirection::Put,
                state,
                pending,
                cancel,
                task,
            },
        );
        json_ok(&TransferTicket { transfer_id, port })
    }

    async fn put_decision(
        &mut self,
        transfer_id: u64,
        file_id: u64,
        decision: FileDecision,
    ) -> Response {
        let Some(handle) = self.transfers.get(&transfer_id) else {
            return Response::err(ErrorCode::InvalidArgument);
        };
        if handle.direction != TransferDirection::Put || decision == FileDecision::Undecided {
            return Response::err(ErrorCode::InvalidArgument);
        }
        let mut pending = handle.pending.lock().await;
        match pending.remove(&file_id) {
            Some(DecisionSlot::Waiting(sender)) => {
                let _ = sender.send(decision);
            }
            _ => {
                pending.insert(file_id, DecisionSlot::Ready(decision));
            }
        }
        Response::ok_empty()
    }

    async fn start_rexec(&mut self, cmd: Option<String>) -> Response {
        if !self.shared.config.rexec {
            return Response::err(ErrorCode::RexecDisabled);
        }
        if self.shared.config.credentials.is_some() && !self.authenticated {
            return Response::err(ErrorCode::AuthRequired);
        }
        let endpoint = match Endpoint::bind(self.shared.bind_ip).await {
            Ok(endpoint) => endpoint,
            Err(error) => {
                tracing::error!("cannot bind rexec endpoint: {:#}", error);
                return Response::err(ErrorCode::TransportError);
            }
        };
        let port = match endpoint.port() {
            Ok(port) => port,
            Err(_) => return Response::err(ErrorCode::TransportError),
        };
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let tls = self.shared.tls.clone();
            let peer_ip = self.peer.ip();
            let accept_timeout = self.shared.config.endpoint_timeout;
            tokio::spawn(async move {
                let work = async {
                    let channel = endpoint.accept_from(peer_ip, tls, accept_timeout).await?;
                    rexec::serve(channel, cmd).await
                };
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = work => {
                        if let Err(error) = result {
                            tracing::warn!("rexec channel failed: {:#}", error);
                        }
                    }
                }
            })
        };
        self.rexec_tasks.push((cancel, task));
        json_ok(&remote::protocol::RexecTicket { port })
    }
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(json) => Response::ok(json),
        Err(error) => {
            tracing::error!("cannot serialize response payload: {}", error);
            Response::err(ErrorCode::ProtocolError)
        }
    }
}

fn fs_error_code(error: &anyhow::Error) -> ErrorCode {
    error
        .downcast_ref::<std::io::Error>()
        .map(|io_error| ErrorCode::from(io_error.kind()))
        .unwrap_or(ErrorCode::PermissionDenied)
}

fn request_name(request: &Request) -> &'static str {
    match request {
        Request::Ping { .. } => "ping",
        Request::Info => "info",
        Request::List => "list",
        Request::Auth { .. } => "auth",
        Request::Open { .. } => "open",
        Request::Close => "close",
        Request::Rpwd => "rpwd",
        Request::Rcd { .. } => "rcd",
        Request::Rls { .. } => "rls",
        Request::Rtree { .. } => "rtree",
        Request::Rmkdir { .. } => "rmkdir",
        Request::Rmv { .. } => "rmv",
        Request::Rcp { .. } => "rcp",
        Request::Rrm { .. } => "rrm",
        Request::Rfind { .. } => "rfind",
        Request::Get { .. } => "get",
        Request::Put { .. } => "put",
        Request::PutDecision { .. } => "put_decision",
        Request::Rexec { .. } => "rexec",
        Request::Rshell => "rshell",
    }
}

//! End-to-end tests driving a real server and the client library over
//! loopback sockets.

use common::errors::ErrorCode;
use common::sharing::Sharing;
use es_tools::client::connection::{ClientError, Connection};
use es_tools::client::transfer;
use es_tools::server::config::ServerConfig;
use es_tools::server::daemon::{Server, ServerHandle};
use remote::protocol::{
    OverwritePolicy, Request, ServerDescriptor, TransferOutcome, TransferTicket,
};

fn test_config(sharings: Vec<Sharing>) -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1".to_string(),
        port: 0,
        discover_port: 0,
        name: "test-server".to_string(),
        credentials: None,
        rexec: false,
        ssl: false,
        ssl_cert: None,
        ssl_privkey: None,
        sharings,
        idle_timeout: std::time::Duration::from_secs(60),
        endpoint_timeout: std::time::Duration::from_secs(10),
    }
}

async fn start_server(config: ServerConfig) -> ServerHandle {
    Server::bind(config).await.unwrap().spawn().unwrap()
}

async fn share_fixture(base: &std::path::Path) -> Sharing {
    let root = common::testutils::setup_share_tree(base).await.unwrap();
    Sharing::register(Some("s1"), &root, false).unwrap()
}

async fn connect_and_open(handle: &ServerHandle, name: &str) -> Connection {
    let mut connection = Connection::open(handle.addr, false, None).await.unwrap();
    connection
        .call(&Request::Open {
            name: name.to_string(),
        })
        .await
        .unwrap();
    connection
}

fn remote_code(error: &ClientError) -> ErrorCode {
    match error {
        ClientError::Remote(code) => *code,
        ClientError::Transport(other) => panic!("expected a remote error, got: {other:#}"),
    }
}

#[tokio::test]
async fn test_discovery_probe_then_open() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let discover_port = 21000 + (std::process::id() % 2000) as u16;
    let mut config = test_config(vec![sharing]);
    config.discover_port = discover_port;
    let handle = start_server(config).await;
    // probe the discovery daemon directly (loopback broadcast is flaky in CI)
    let probe_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe_socket
        .send_to(&[0xE5, 0x00, 0x00, 0x01], ("127.0.0.1", discover_port))
        .await
        .unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let (len, _) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        probe_socket.recv_from(&mut buf),
    )
    .await
    .unwrap()
    .unwrap();
    let descriptor: ServerDescriptor = serde_json::from_slice(&buf[..len]).unwrap();
    assert_eq!(descriptor.name, "test-server");
    assert_eq!(descriptor.sharings.len(), 1);
    assert_eq!(descriptor.sharings[0].name, "s1");
    // any sharing named in a reply must open (or fail only on auth)
    let control_addr = std::net::SocketAddr::new(
        "127.0.0.1".parse::<std::net::IpAddr>().unwrap(),
        descriptor.port,
    );
    let mut connection = Connection::open(control_addr, false, None).await.unwrap();
    connection
        .call(&Request::Open {
            name: descriptor.sharings[0].name.clone(),
        })
        .await
        .unwrap();
    let cwd: String = connection.call_as(&Request::Rpwd).await.unwrap();
    assert_eq!(cwd, "/");
    drop(handle);
}

#[tokio::test]
async fn test_path_escape_rejected_and_cwd_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let error = connection
        .call(&Request::Rcd {
            path: "../../etc".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::PathEscapesSharing);
    let cwd: String = connection.call_as(&Request::Rpwd).await.unwrap();
    assert_eq!(cwd, "/");
}

#[tokio::test]
async fn test_get_directory_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let dest = dir.path().join("downloads");
    let (ours, theirs) = transfer::get(
        &mut connection,
        &["a".to_string()],
        OverwritePolicy::Yes,
        &dest,
        false,
    )
    .await
    .unwrap();
    assert_eq!(ours.outcome, TransferOutcome::Completed);
    assert_eq!(ours.files_ok, 2);
    assert_eq!(ours.bytes_ok, 6);
    assert_eq!(theirs.unwrap().files_ok, 2);
    assert_eq!(
        tokio::fs::read(dest.join("a/f1")).await.unwrap(),
        b"hello\n"
    );
    assert_eq!(tokio::fs::read(dest.join("a/f2")).await.unwrap(), b"");
}

#[tokio::test]
async fn test_put_overwrite_no_keeps_target() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let share_root = sharing.root.clone();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    // the sharing already has top.txt; push a bigger one with policy=no
    let local = dir.path().join("local");
    tokio::fs::create_dir(&local).await.unwrap();
    tokio::fs::write(local.join("top.txt"), "much longer content")
        .await
        .unwrap();
    let summary = transfer::put(
        &mut connection,
        &[local.join("top.txt")],
        OverwritePolicy::No,
        false,
    )
    .await
    .unwrap();
    assert_eq!(summary.files_ok, 0);
    assert_eq!(summary.files_skipped, 1);
    assert_eq!(
        tokio::fs::read(share_root.join("top.txt")).await.unwrap(),
        b"top\n"
    );
}

#[tokio::test]
async fn test_put_overwrite_newer_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let share_root = sharing.root.clone();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let local = dir.path().join("local");
    tokio::fs::create_dir(&local).await.unwrap();
    tokio::fs::write(local.join("top.txt"), "fresher").await.unwrap();
    filetime::set_file_mtime(
        share_root.join("top.txt"),
        filetime::FileTime::from_unix_time(1_000_000_000, 0),
    )
    .unwrap();
    filetime::set_file_mtime(
        local.join("top.txt"),
        filetime::FileTime::from_unix_time(2_000_000_000, 0),
    )
    .unwrap();
    // incoming mtime ahead of the target: overwritten
    let summary = transfer::put(
        &mut connection,
        &[local.join("top.txt")],
        OverwritePolicy::Newer,
        false,
    )
    .await
    .unwrap();
    assert_eq!(summary.files_ok, 1);
    assert_eq!(
        tokio::fs::read(share_root.join("top.txt")).await.unwrap(),
        b"fresher"
    );
    // the received file carries the incoming mtime, so an older local
    // version is skipped on the next push
    tokio::fs::write(local.join("top.txt"), "stale").await.unwrap();
    filetime::set_file_mtime(
        local.join("top.txt"),
        filetime::FileTime::from_unix_time(1_500_000_000, 0),
    )
    .unwrap();
    let summary = transfer::put(
        &mut connection,
        &[local.join("top.txt")],
        OverwritePolicy::Newer,
        false,
    )
    .await
    .unwrap();
    assert_eq!(summary.files_ok, 0);
    assert_eq!(summary.files_skipped, 1);
    assert_eq!(
        tokio::fs::read(share_root.join("top.txt")).await.unwrap(),
        b"fresher"
    );
}

#[tokio::test]
async fn test_put_roundtrip_get() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let share_root = sharing.root.clone();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let local = dir.path().join("local/tree");
    tokio::fs::create_dir_all(local.join("deep")).await.unwrap();
    tokio::fs::write(local.join("one.bin"), vec![0xAB; 4096])
        .await
        .unwrap();
    tokio::fs::write(local.join("deep/two.txt"), "two").await.unwrap();
    let summary = transfer::put(
        &mut connection,
        &[local.clone()],
        OverwritePolicy::Yes,
        false,
    )
    .await
    .unwrap();
    assert_eq!(summary.files_ok, 2);
    common::testutils::check_dirs_identical(&local, &share_root.join("tree"))
        .await
        .unwrap();
    // and back out again
    let dest = dir.path().join("back");
    let (ours, _) = transfer::get(
        &mut connection,
        &["tree".to_string()],
        OverwritePolicy::Yes,
        &dest,
        false,
    )
    .await
    .unwrap();
    assert_eq!(ours.files_ok, 2);
    common::testutils::check_dirs_identical(&local, &dest.join("tree"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_read_only_sharing_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let root = common::testutils::setup_share_tree(dir.path()).await.unwrap();
    let sharing = Sharing::register(Some("ro"), &root, true).unwrap();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "ro").await;
    let error = connection
        .call(&Request::Put {
            policy: OverwritePolicy::Yes,
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::ReadOnly);
    let error = connection
        .call(&Request::Rmkdir {
            path: "new".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::ReadOnly);
    // reads still work
    let entries: Vec<common::list::EntryInfo> = connection
        .call_as(&Request::Rls {
            path: String::new(),
            flags: common::list::LsFlags::default(),
        })
        .await
        .unwrap();
    assert!(!entries.is_empty());
}

#[tokio::test]
async fn test_rexec_disabled_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = Connection::open(handle.addr, false, None).await.unwrap();
    let error = connection
        .call(&Request::Rexec {
            cmd: "whoami".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::RexecDisabled);
}

#[tokio::test]
async fn test_rexec_enabled_runs_command() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let mut config = test_config(vec![sharing]);
    config.rexec = true;
    let handle = start_server(config).await;
    let mut connection = Connection::open(handle.addr, false, None).await.unwrap();
    let ticket: remote::protocol::RexecTicket = connection
        .call_as(&Request::Rexec {
            cmd: "printf rexec-ok; exit 4".to_string(),
        })
        .await
        .unwrap();
    let mut channel = connection.open_endpoint(ticket.port).await.unwrap();
    let mut stdout = vec![];
    let code = loop {
        let frame = channel.recv.recv_frame().await.unwrap().unwrap();
        match frame[0] {
            1 => stdout.extend_from_slice(&frame[1..]),
            3 => break i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            other => panic!("unexpected tag {other}"),
        }
    };
    assert_eq!(String::from_utf8_lossy(&stdout), "rexec-ok");
    assert_eq!(code, 4);
}

#[tokio::test]
async fn test_auth_gates_open() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let mut config = test_config(vec![sharing]);
    config.credentials = Some(common::auth::Credentials::parse("sesame").unwrap());
    let handle = start_server(config).await;
    let mut connection = Connection::open(handle.addr, false, None).await.unwrap();
    assert!(connection.descriptor.auth);
    let error = connection
        .call(&Request::Open {
            name: "s1".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::AuthRequired);
    let error = connection
        .call(&Request::Auth {
            password: "wrong".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::AuthFailed);
    connection
        .call(&Request::Auth {
            password: "sesame".to_string(),
        })
        .await
        .unwrap();
    connection
        .call(&Request::Open {
            name: "s1".to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sharing_service_operations() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let share_root = sharing.root.clone();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    // mkdir with missing parents, twice (idempotent)
    for _ in 0..2 {
        connection
            .call(&Request::Rmkdir {
                path: "new/nested".to_string(),
            })
            .await
            .unwrap();
    }
    assert!(share_root.join("new/nested").is_dir());
    // copy a file into the new directory
    let outcomes: Vec<remote::protocol::BatchOutcome> = connection
        .call_as(&Request::Rcp {
            sources: vec!["top.txt".to_string()],
            dest: "new/nested".to_string(),
        })
        .await
        .unwrap();
    assert!(outcomes[0].ok);
    assert!(share_root.join("new/nested/top.txt").is_file());
    // move it back out under a different name
    let outcomes: Vec<remote::protocol::BatchOutcome> = connection
        .call_as(&Request::Rmv {
            sources: vec!["new/nested/top.txt".to_string()],
            dest: "renamed.txt".to_string(),
        })
        .await
        .unwrap();
    assert!(outcomes[0].ok);
    assert!(share_root.join("renamed.txt").is_file());
    // find the text files anywhere under the root
    let found: Vec<common::list::EntryInfo> = connection
        .call_as(&Request::Rfind {
            pattern: "*.txt".to_string(),
            flags: common::list::FindFlags::default(),
        })
        .await
        .unwrap();
    let names: Vec<_> = found.iter().map(|entry| entry.name.as_str()).collect();
    assert!(names.contains(&"renamed.txt"));
    assert!(names.contains(&"docs/readme.txt"));
    // remove recursively; a second rrm of the same path is a silent no-op
    for _ in 0..2 {
        let outcomes: Vec<remote::protocol::BatchOutcome> = connection
            .call_as(&Request::Rrm {
                paths: vec!["new".to_string()],
            })
            .await
            .unwrap();
        assert!(outcomes[0].ok);
    }
    assert!(!share_root.join("new").exists());
    // per-entry outcomes: one good path, one missing
    let outcomes: Vec<remote::protocol::BatchOutcome> = connection
        .call_as(&Request::Rmv {
            sources: vec!["missing-1".to_string(), "missing-2".to_string()],
            dest: "docs".to_string(),
        })
        .await
        .unwrap();
    assert!(outcomes.iter().all(|outcome| !outcome.ok));
    assert_eq!(outcomes[0].error, Some(ErrorCode::NotFound));
}

#[tokio::test]
async fn test_tree_and_ls_views() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let entries: Vec<common::list::EntryInfo> = connection
        .call_as(&Request::Rls {
            path: String::new(),
            flags: common::list::LsFlags::default(),
        })
        .await
        .unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, ["a", "docs", "top.txt"]);
    let entries: Vec<common::list::EntryInfo> = connection
        .call_as(&Request::Rtree {
            path: String::new(),
            max_depth: None,
            flags: common::list::LsFlags::default(),
        })
        .await
        .unwrap();
    let deep: Vec<_> = entries
        .iter()
        .filter(|entry| entry.depth == Some(1))
        .map(|entry| entry.name.as_str())
        .collect();
    assert!(deep.contains(&"a/f1"));
    // rcd into a subdirectory changes what relative paths mean
    connection
        .call(&Request::Rcd {
            path: "a".to_string(),
        })
        .await
        .unwrap();
    let cwd: String = connection.call_as(&Request::Rpwd).await.unwrap();
    assert_eq!(cwd, "/a");
    let entries: Vec<common::list::EntryInfo> = connection
        .call_as(&Request::Rls {
            path: String::new(),
            flags: common::list::LsFlags::default(),
        })
        .await
        .unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, ["f1", "f2"]);
}

#[tokio::test]
async fn test_connection_loss_mid_get_session_survives() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let ticket: TransferTicket = connection
        .call_as(&Request::Get {
            paths: vec!["a".to_string()],
            policy: OverwritePolicy::Yes,
        })
        .await
        .unwrap();
    // connect to the endpoint, read the manifest, then vanish mid-stream
    let mut channel = connection.open_endpoint(ticket.port).await.unwrap();
    let manifest: remote::protocol::Manifest =
        channel.recv.recv_message().await.unwrap().unwrap();
    assert_eq!(manifest.files.len(), 3);
    drop(channel);
    // the control session is unaffected by the dead transfer
    let cwd: String = connection.call_as(&Request::Rpwd).await.unwrap();
    assert_eq!(cwd, "/");
}

#[tokio::test]
async fn test_tls_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let mut config = test_config(vec![sharing]);
    config.ssl = true;
    let handle = start_server(config).await;
    let mut connection = Connection::open(handle.addr, true, None).await.unwrap();
    assert!(connection.descriptor.ssl);
    let fingerprint = connection.descriptor.ssl_fingerprint.clone().unwrap();
    assert_eq!(fingerprint.len(), 64);
    connection
        .call(&Request::Open {
            name: "s1".to_string(),
        })
        .await
        .unwrap();
    // transfers inherit TLS from the server configuration
    let dest = dir.path().join("tls-dest");
    let (ours, _) = transfer::get(
        &mut connection,
        &["a/f1".to_string()],
        OverwritePolicy::Yes,
        &dest,
        false,
    )
    .await
    .unwrap();
    assert_eq!(ours.files_ok, 1);
    assert_eq!(tokio::fs::read(dest.join("f1")).await.unwrap(), b"hello\n");
    // a second connection can pin the fingerprint it just learned
    let mut pinned = Connection::open(handle.addr, true, Some(&fingerprint))
        .await
        .unwrap();
    pinned.call(&Request::Ping { payload: String::new() }).await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_invalid_argument() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut channel = remote::transfer::connect(handle.addr, None).await.unwrap();
    channel
        .send
        .send_message(&serde_json::json!({"method": "frobnicate"}))
        .await
        .unwrap();
    let response: remote::protocol::Response =
        channel.recv.recv_message().await.unwrap().unwrap();
    assert_eq!(response.error, Some(ErrorCode::InvalidArgument));
}

#[tokio::test]
async fn test_open_unknown_sharing_and_close_state() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = Connection::open(handle.addr, false, None).await.unwrap();
    let error = connection
        .call(&Request::Open {
            name: "nope".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::NoSuchSharing);
    let error = connection.call(&Request::Close).await.unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::NotBound);
    let error = connection.call(&Request::Rpwd).await.unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::NotBound);
    connection
        .call(&Request::Open {
            name: "s1".to_string(),
        })
        .await
        .unwrap();
    let error = connection
        .call(&Request::Open {
            name: "s1".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(remote_code(&error), ErrorCode::AlreadyBound);
    connection.call(&Request::Close).await.unwrap();
}

#[tokio::test]
async fn test_put_prompt_decision_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let sharing = share_fixture(dir.path()).await;
    let share_root = sharing.root.clone();
    let handle = start_server(test_config(vec![sharing])).await;
    let mut connection = connect_and_open(&handle, "s1").await;
    let local = dir.path().join("local");
    tokio::fs::create_dir(&local).await.unwrap();
    tokio::fs::write(local.join("top.txt"), "prompted content")
        .await
        .unwrap();
    let ticket: TransferTicket = connection
        .call_as(&Request::Put {
            policy: OverwritePolicy::Prompt,
        })
        .await
        .unwrap();
    let mut channel = connection.open_endpoint(ticket.port).await.unwrap();
    let (manifest, _sources) = remote::transfer::build_manifest(
        &[(
            tokio::fs::canonicalize(local.join("top.txt")).await.unwrap(),
            "top.txt".to_string(),
        )],
        &local,
    )
    .await
    .unwrap();
    channel.send.send_message(&manifest).await.unwrap();
    channel
        .send
        .send_message(&remote::protocol::TransferFrame::Probe(
            remote::protocol::PutProbe { idx: 0 },
        ))
        .await
        .unwrap();
    // the target exists, so the prompt policy parks the file undecided
    let go: remote::protocol::PutGo = channel.recv.recv_message().await.unwrap().unwrap();
    assert_eq!(go.decision, remote::protocol::FileDecision::Undecided);
    // the operator answers on the control channel
    connection
        .call(&Request::PutDecision {
            transfer_id: ticket.transfer_id,
            file_id: 0,
            decision: remote::protocol::FileDecision::Accept,
        })
        .await
        .unwrap();
    let go: remote::protocol::PutGo = channel.recv.recv_message().await.unwrap().unwrap();
    assert_eq!(go.decision, remote::protocol::FileDecision::Accept);
    let mut cursor = std::io::Cursor::new(b"prompted content".to_vec());
    channel
        .send
        .send_message_with_data(
            &remote::protocol::TransferFrame::File(remote::protocol::FileHeader {
                idx: 0,
                len: 16,
            }),
            &mut cursor,
            16,
        )
        .await
        .unwrap();
    let mut summary = remote::protocol::TransferSummary::new();
    summary.files_ok = 1;
    summary.bytes_ok = 16;
    channel
        .send
        .send_message(&remote::protocol::TransferFrame::Done(summary))
        .await
        .unwrap();
    // give the server a moment to finalise the write
    for _ in 0..50 {
        if tokio::fs::read(share_root.join("top.txt")).await.unwrap() == b"prompted content" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(
        tokio::fs::read(share_root.join("top.txt")).await.unwrap(),
        b"prompted content"
    );
}

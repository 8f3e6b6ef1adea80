//! Wire protocol definitions for the easyshare control and transfer
//! channels.
//!
//! # Protocol overview
//!
//! Every frame is 4-byte big-endian length + UTF-8 JSON. The control
//! channel is strict request/response; a transfer channel interleaves JSON
//! frames with raw file bytes.
//!
//! ```text
//! Client                                Server
//!   |  ---- {method, args} ------------->  |
//!   |  <--- {success|error, data} -------  |
//!   |              ...                     |
//!   |  ---- get(paths, policy) ---------> |  bind transfer endpoint
//!   |  <--- {transfer_id, port} --------- |
//!   |                                     |
//!   |  ==== transfer connection ========= |
//!   |  <--- Manifest -------------------- |
//!   |  <--- FileHeader{idx,len} + bytes - |   (per regular file)
//!   |  <--- TransferSummary ------------- |   (last frame on the wire)
//! ```
//!
//! PUT runs the same shape in the other direction, with one addition:
//! before each file the sender emits a `PutProbe` and waits for a `PutGo`
//! carrying the receiver's overwrite decision. `Undecided` parks the
//! transfer until a `put_decision` RPC arrives on the control channel,
//! after which a final `PutGo` follows on the transfer channel.

use serde::{Deserialize, Serialize};

use common::errors::ErrorCode;
use common::list::{EntryKind, FindFlags, LsFlags};
use common::sharing::SharingKind;

pub const DEFAULT_CONTROL_PORT: u16 = 12020;
pub const DEFAULT_DISCOVER_PORT: u16 = 12021;

/// One sharing as advertised to clients.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SharingDescriptor {
    pub name: String,
    pub kind: SharingKind,
    pub read_only: bool,
}

/// Server self-description returned by discovery and by `info`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// 0 when discovery is disabled.
    pub discover_port: u16,
    pub ssl: bool,
    pub auth: bool,
    pub rexec: bool,
    pub version: String,
    /// Hex SHA-256 of the presented certificate, when TLS is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_fingerprint: Option<String>,
    pub sharings: Vec<SharingDescriptor>,
}

/// Control-channel requests; the wire form is `{"method": ..., "args":
/// ...}` with `args` omitted for argument-less methods.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum Request {
    Ping {
        #[serde(default)]
        payload: String,
    },
    Info,
    List,
    Auth {
        password: String,
    },
    Open {
        name: String,
    },
    Close,
    Rpwd,
    Rcd {
        path: String,
    },
    Rls {
        #[serde(default)]
        path: String,
        #[serde(default)]
        flags: LsFlags,
    },
    Rtree {
        #[serde(default)]
        path: String,
        #[serde(default)]
        max_depth: Option<u32>,
        #[serde(default)]
        flags: LsFlags,
    },
    Rmkdir {
        path: String,
    },
    Rmv {
        sources: Vec<String>,
        dest: String,
    },
    Rcp {
        sources: Vec<String>,
        dest: String,
    },
    Rrm {
        paths: Vec<String>,
    },
    Rfind {
        pattern: String,
        #[serde(default)]
        flags: FindFlags,
    },
    Get {
        paths: Vec<String>,
        #[serde(default)]
        policy: OverwritePolicy,
    },
    Put {
        #[serde(default)]
        policy: OverwritePolicy,
    },
    PutDecision {
        transfer_id: u64,
        file_id: u64,
        decision: FileDecision,
    },
    Rexec {
        cmd: String,
    },
    Rshell,
}

/// Control-channel response envelope. Exactly one of `success`/`error` is
/// meaningful per response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Response {
    pub fn ok(data: serde_json::Value) -> Self {
        Response {
            success: Some(true),
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Response {
            success: Some(true),
            data: None,
            error: None,
        }
    }

    pub fn err(code: ErrorCode) -> Self {
        Response {
            success: None,
            data: None,
            error: Some(code),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value, ErrorCode> {
        if let Some(code) = self.error {
            return Err(code);
        }
        if self.success == Some(true) {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }
        Err(ErrorCode::ProtocolError)
    }
}

/// Overwrite arbitration negotiated at transfer creation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    #[default]
    Prompt,
    Yes,
    No,
    Newer,
    DifferentSize,
}

impl std::str::FromStr for OverwritePolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompt" => Ok(OverwritePolicy::Prompt),
            "yes" | "y" => Ok(OverwritePolicy::Yes),
            "no" | "n" => Ok(OverwritePolicy::No),
            "newer" => Ok(OverwritePolicy::Newer),
            "different-size" | "size" => Ok(OverwritePolicy::DifferentSize),
            _ => Err(anyhow::anyhow!("invalid overwrite policy: {s}")),
        }
    }
}

/// One manifest entry; `path` is relative with `/` separators.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime_nsec: i64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

/// First frame of every transfer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Precedes the raw bytes of one regular file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct FileHeader {
    pub idx: u64,
    pub len: u64,
}

/// Sender → receiver arbitration request before a PUT file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PutProbe {
    pub idx: u64,
}

/// Receiver → sender arbitration verdict.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct PutGo {
    pub decision: FileDecision,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDecision {
    Accept,
    Skip,
    Undecided,
}

/// Frames a transfer sender emits after the manifest. `Probe` appears only
/// on PUT (arbitrated) transfers; `File` is followed by exactly `len` raw
/// bytes; `Done` is the last frame on the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum TransferFrame {
    Probe(PutProbe),
    File(FileHeader),
    Done(TransferSummary),
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed,
    Aborted,
}

/// Per-file failure reported inside the trailing summary.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransferFileError {
    pub path: String,
    pub error: ErrorCode,
    pub message: String,
}

/// Trailing frame of every transfer; always the last thing on the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransferSummary {
    pub outcome: TransferOutcome,
    pub files_ok: u64,
    pub files_skipped: u64,
    pub files_err: u64,
    pub bytes_ok: u64,
    pub errors: Vec<TransferFileError>,
}

impl TransferSummary {
    pub fn new() -> Self {
        TransferSummary {
            outcome: TransferOutcome::Completed,
            files_ok: 0,
            files_skipped: 0,
            files_err: 0,
            bytes_ok: 0,
            errors: vec![],
        }
    }
}

impl Default for TransferSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Server directions and lifecycle states tracked per transfer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Get,
    Put,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Created,
    Streaming,
    Finalised,
    Aborted,
}

/// RPC payload answering `get`/`put`: where to connect.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TransferTicket {
    pub transfer_id: u64,
    pub port: u16,
}

/// RPC payload answering `rexec`/`rshell`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RexecTicket {
    pub port: u16,
}

/// Per-entry outcome for batch filesystem operations (`rmv`, `rcp`,
/// `rrm`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BatchOutcome {
    pub path: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `ping` reply payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pong {
    pub payload: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_value(&Request::Open {
            name: "music".to_string(),
        })
        .unwrap();
        assert_eq!(json["method"], "open");
        assert_eq!(json["args"]["name"], "music");
        let json = serde_json::to_value(&Request::Info).unwrap();
        assert_eq!(json["method"], "info");
        assert!(json.get("args").is_none());
    }

    #[test]
    fn test_unknown_method_fails_to_parse() {
        let raw = serde_json::json!({"method": "frobnicate", "args": {}});
        assert!(serde_json::from_value::<Request>(raw).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let ok = Response::ok(serde_json::json!({"x": 1}));
        assert_eq!(ok.clone().into_result().unwrap()["x"], 1);
        let err = Response::err(ErrorCode::ReadOnly);
        assert_eq!(err.into_result().unwrap_err(), ErrorCode::ReadOnly);
        // neither success nor error set is a protocol violation
        assert_eq!(
            Response::default().into_result().unwrap_err(),
            ErrorCode::ProtocolError
        );
    }

    #[test]
    fn test_overwrite_policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&OverwritePolicy::DifferentSize).unwrap(),
            "\"different-size\""
        );
        assert_eq!(
            "newer".parse::<OverwritePolicy>().unwrap(),
            OverwritePolicy::Newer
        );
        assert!("sometimes".parse::<OverwritePolicy>().is_err());
    }

    #[test]
    fn test_rls_defaults() {
        let raw = serde_json::json!({"method": "rls", "args": {}});
        let request: Request = serde_json::from_value(raw).unwrap();
        match request {
            Request::Rls { path, flags } => {
                assert_eq!(path, "");
                assert!(!flags.reverse);
            }
            other => panic!("expected Rls, got {other:?}"),
        }
    }
}

//! Remote execution channel: a subprocess with its stdio mapped onto one
//! framed byte stream.
//!
//! Outbound frames carry a one-byte tag (`1`=stdout, `2`=stderr, `3`=exit)
//! followed by the payload; the exit frame carries a 4-byte big-endian
//! code and ends the channel. Inbound frames are stdin bytes; an empty
//! frame closes the subprocess's stdin. A client disconnect kills the
//! subprocess.

use anyhow::Context;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use remote::streams::{BoxedSendStream, Channel};

pub const TAG_STDOUT: u8 = 1;
pub const TAG_STDERR: u8 = 2;
pub const TAG_EXIT: u8 = 3;

const PUMP_BUFFER: usize = 8 * 1024;

type SharedSend = Arc<tokio::sync::Mutex<BoxedSendStream>>;

fn build_command(cmd: Option<String>) -> tokio::process::Command {
    let mut command = match cmd {
        Some(cmd) => {
            let mut command = tokio::process::Command::new("/bin/sh");
            command.arg("-c").arg(cmd);
            command
        }
        None => {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            tokio::process::Command::new(shell)
        }
    };
    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    command
}

async fn pump_output<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    tag: u8,
    send: SharedSend,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(n + 1);
        frame.push(tag);
        frame.extend_from_slice(&buf[..n]);
        send.lock().await.send_frame(frame.into()).await?;
    }
}

fn exit_frame(code: i32) -> bytes::Bytes {
    let mut frame = Vec::with_capacity(5);
    frame.push(TAG_EXIT);
    frame.extend_from_slice(&code.to_be_bytes());
    frame.into()
}

/// Runs one rexec channel to completion, returning the subprocess's exit
/// code. A command that cannot even be spawned reports exit code 127, the
/// shell's own command-not-found convention.
pub async fn serve(mut channel: Channel, cmd: Option<String>) -> anyhow::Result<i32> {
    let mut child = match build_command(cmd).spawn() {
        Ok(child) => child,
        Err(error) => {
            tracing::warn!("cannot spawn rexec subprocess: {}", error);
            channel.send.send_frame(exit_frame(127)).await?;
            return Ok(127);
        }
    };
    let mut stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("subprocess has no stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("subprocess has no stderr"))?;
    let send: SharedSend = Arc::new(tokio::sync::Mutex::new(channel.send));
    let mut recv = channel.recv;
    let stdout_task = tokio::spawn(pump_output(stdout, TAG_STDOUT, send.clone()));
    let stderr_task = tokio::spawn(pump_output(stderr, TAG_STDERR, send.clone()));
    let stdin_pump = async {
        loop {
            match recv.recv_frame().await {
                Ok(Some(frame)) if frame.is_empty() => {
                    // explicit stdin EOF; the subprocess keeps running
                    stdin.take();
                    continue;
                }
                Ok(Some(frame)) => {
                    if let Some(stdin) = stdin.as_mut() {
                        if stdin.write_all(&frame).await.is_err() {
                            return false;
                        }
                    }
                }
                // client gone
                Ok(None) | Err(_) => return true,
            }
        }
    };
    let status = tokio::select! {
        status = child.wait() => status.context("failed waiting for rexec subprocess")?,
        disconnected = stdin_pump => {
            if disconnected {
                tracing::info!("rexec client disconnected, terminating subprocess");
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(-1);
            }
            child.wait().await.context("failed waiting for rexec subprocess")?
        }
    };
    // drain whatever the pipes still hold before reporting the exit
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    let code = status.code().unwrap_or(-1);
    send.lock().await.send_frame(exit_frame(code)).await?;
    tracing::debug!("rexec subprocess exited with code {}", code);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (Channel, Channel) {
        let (a_to_b_w, a_to_b_r) = tokio::io::duplex(64 * 1024);
        let (b_to_a_w, b_to_a_r) = tokio::io::duplex(64 * 1024);
        let a = Channel::from_parts(b_to_a_r, a_to_b_w);
        let b = Channel::from_parts(a_to_b_r, b_to_a_w);
        (a, b)
    }

    async fn collect_until_exit(client: &mut Channel) -> (Vec<u8>, Vec<u8>, i32) {
        let mut stdout = vec![];
        let mut stderr = vec![];
        loop {
            let frame = client.recv.recv_frame().await.unwrap().expect("exit frame");
            match frame[0] {
                TAG_STDOUT => stdout.extend_from_slice(&frame[1..]),
                TAG_STDERR => stderr.extend_from_slice(&frame[1..]),
                TAG_EXIT => {
                    let code = i32::from_be_bytes(frame[1..5].try_into().unwrap());
                    return (stdout, stderr, code);
                }
                other => panic!("unexpected tag {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_command_output_and_exit_code() {
        let (server_side, mut client_side) = pipe();
        let server = tokio::spawn(serve(
            server_side,
            Some("echo out-data; echo err-data 1>&2; exit 3".to_string()),
        ));
        let (stdout, stderr, code) = collect_until_exit(&mut client_side).await;
        assert_eq!(String::from_utf8_lossy(&stdout), "out-data\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err-data\n");
        assert_eq!(code, 3);
        assert_eq!(server.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stdin_forwarded() {
        let (server_side, mut client_side) = pipe();
        let server = tokio::spawn(serve(server_side, Some("cat".to_string())));
        client_side
            .send
            .send_frame(bytes::Bytes::from_static(b"line one\n"))
            .await
            .unwrap();
        // empty frame closes the subprocess's stdin so `cat` finishes
        client_side
            .send
            .send_frame(bytes::Bytes::new())
            .await
            .unwrap();
        let (stdout, _, code) = collect_until_exit(&mut client_side).await;
        assert_eq!(String::from_utf8_lossy(&stdout), "line one\n");
        assert_eq!(code, 0);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_kills_subprocess() {
        let (server_side, client_side) = pipe();
        let server = tokio::spawn(serve(server_side, Some("sleep 600".to_string())));
        drop(client_side);
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server must notice the disconnect")
            .unwrap()
            .unwrap();
        assert_eq!(code, -1);
    }
}

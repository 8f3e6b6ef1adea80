//! Client side of the rexec channel: local stdin in, tagged frames out.

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

use remote::protocol::{Request, RexecTicket};

use crate::client::connection::Connection;
use crate::server::rexec::{TAG_EXIT, TAG_STDERR, TAG_STDOUT};

/// Runs a remote command (or the remote shell when `cmd` is `None`) and
/// returns its exit code.
pub async fn run(connection: &mut Connection, cmd: Option<String>) -> anyhow::Result<i32> {
    let request = match cmd {
        Some(cmd) => Request::Rexec { cmd },
        None => Request::Rshell,
    };
    let ticket: RexecTicket = connection.call_as(&request).await?;
    let channel = connection.open_endpoint(ticket.port).await?;
    let mut recv = channel.recv;
    let mut send = channel.send;
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => {
                    // local EOF: close the remote stdin, keep the channel up
                    let _ = send.send_frame(bytes::Bytes::new()).await;
                    return;
                }
                Ok(n) => {
                    if send
                        .send_frame(bytes::Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let exit_code = loop {
        let Some(frame) = recv.recv_frame().await? else {
            anyhow::bail!("rexec channel closed before the exit frame");
        };
        match frame.first() {
            Some(&TAG_STDOUT) => {
                stdout.write_all(&frame[1..]).await?;
                stdout.flush().await?;
            }
            Some(&TAG_STDERR) => {
                stderr.write_all(&frame[1..]).await?;
                stderr.flush().await?;
            }
            Some(&TAG_EXIT) if frame.len() >= 5 => {
                break i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
            }
            _ => anyhow::bail!("malformed rexec frame"),
        }
    };
    stdin_task.abort();
    Ok(exit_code)
}

//! Terminal prompts for overwrite arbitration.

use remote::protocol::{FileDecision, FileEntry};
use remote::transfer::OverwriteDecider;

/// Asks y/N on the controlling terminal.
pub async fn ask_overwrite(path: &str) -> anyhow::Result<bool> {
    let question = format!("overwrite {path}? [y/N] ");
    let answer = tokio::task::spawn_blocking(move || {
        use std::io::BufRead;
        use std::io::Write;
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(question.as_bytes());
        let _ = stdout.flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        line.trim().eq_ignore_ascii_case("y") || line.trim().eq_ignore_ascii_case("yes")
    })
    .await?;
    Ok(answer)
}

/// GET-side decider: prompt locally, default to keeping what is on disk.
pub struct ConsoleDecider;

impl OverwriteDecider for ConsoleDecider {
    fn decide(
        &mut self,
        _idx: u64,
        entry: &FileEntry,
    ) -> impl std::future::Future<Output = anyhow::Result<FileDecision>> + Send {
        let path = entry.path.clone();
        async move {
            Ok(if ask_overwrite(&path).await? {
                FileDecision::Accept
            } else {
                FileDecision::Skip
            })
        }
    }
}

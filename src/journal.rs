//! Append-only message journal.
//!
//! Every [`FrameRecord`] produced by any session is sent over one bounded
//! channel to a single writer task, which appends it as a JSON line to
//! `[logging] message_log`. Writes are batched: the task drains whatever is
//! queued before flushing. Rotation is left to external tooling.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::sessions::buffer::FrameRecord;

/// Handle to the running journal writer.
pub struct MessageJournal {
    tx: mpsc::Sender<FrameRecord>,
    /// Set to `false` if the writer task exits due to an I/O error.
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MessageJournal {
    /// Open (or create) the log file in append mode and spawn the writer.
    pub async fn open(path: &Path, capacity: usize) -> Result<Self, std::io::Error> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(journal_writer_task(
            file,
            rx,
            Arc::clone(&alive),
            shutdown.clone(),
        ));
        info!(path = %path.display(), "message journal open");

        Ok(Self {
            tx,
            alive,
            shutdown,
            task,
        })
    }

    pub fn sender(&self) -> mpsc::Sender<FrameRecord> {
        self.tx.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Write out everything already queued, flush and stop the writer.
    pub async fn close(self) {
        self.shutdown.cancel();
        drop(self.tx);
        if let Err(e) = self.task.await {
            error!("Journal writer panicked: {e}");
        }
    }
}

async fn write_record(file: &mut fs::File, record: &FrameRecord) -> Result<(), std::io::Error> {
    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line).await
}

async fn journal_writer_task(
    mut file: fs::File,
    mut rx: mpsc::Receiver<FrameRecord>,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };
        if let Err(e) = write_record(&mut file, &record).await {
            error!("Journal write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
        // Batch: drain all remaining records in channel before flushing
        while let Ok(record) = rx.try_recv() {
            if let Err(e) = write_record(&mut file, &record).await {
                error!("Journal write error: {e}");
                alive.store(false, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = file.flush().await {
            error!("Journal flush error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }

    // Shutdown: whatever is still queued goes out before the final flush.
    while let Ok(record) = rx.try_recv() {
        if let Err(e) = write_record(&mut file, &record).await {
            error!("Journal write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }
    if let Err(e) = file.flush().await {
        error!("Journal flush error: {e}");
        alive.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::{Action, Direction};
    use crate::sessions::buffer::Outcome;

    #[tokio::test]
    async fn appends_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("messages.jsonl");
        let journal = MessageJournal::open(&path, 16).await.unwrap();
        let tx = journal.sender();

        let blocked = FrameRecord::new("CP1", Direction::BackendToDevice, Outcome::Blocked)
            .action(Some(Action::ChangeConfiguration))
            .raw(r#"[2,"1","ChangeConfiguration",{"key":"K3","value":"1"}]"#)
            .rules(vec!["configuration_allow_list".into()]);
        let forwarded = FrameRecord::new("CP1", Direction::DeviceToBackend, Outcome::Unmodified)
            .raw(r#"[3,"1",{}]"#);
        tx.send(blocked).await.unwrap();
        tx.send(forwarded).await.unwrap();
        drop(tx);

        assert!(journal.is_alive());
        journal.close().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "blocked");
        assert_eq!(lines[0]["rules"][0], "configuration_allow_list");
        assert_eq!(lines[0]["session_id"], "CP1");
        assert_eq!(lines[1]["direction"], "device_to_backend");
        assert_eq!(lines[1]["raw"], r#"[3,"1",{}]"#);
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.jsonl");
        for _ in 0..2 {
            let journal = MessageJournal::open(&path, 4).await.unwrap();
            journal
                .sender()
                .send(FrameRecord::new("CP1", Direction::DeviceToBackend, Outcome::Passthrough).raw("oops"))
                .await
                .unwrap();
            journal.close().await;
        }
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}

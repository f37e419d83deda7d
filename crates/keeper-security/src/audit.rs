use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// One broker decision. Never holds secrets or token blobs.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub caller: String,
    pub action: String,
    pub command: Option<String>,
    pub details: serde_json::Value,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failed,
    Denied,
    TimedOut,
    Error,
}

enum AuditMessage {
    Entry(Box<AuditEntry>),
    /// Answered once every entry queued before it is on disk.
    Flush(oneshot::Sender<()>),
}

/// Append-only audit trail of broker decisions, written as JSON lines.
///
/// Entries are queued to a writer task. Call [`AuditLog::flush`] or
/// [`AuditLog::shutdown`] before the runtime stops, or queued entries are lost.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditMessage>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes entries to
    /// `<log_dir>/audit.jsonl`; must be called inside a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditMessage>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, "Failed to create audit directory");
            }
            let log_file = log_dir.join("audit.jsonl");

            while let Some(message) = rx.recv().await {
                let entry = match message {
                    AuditMessage::Entry(entry) => entry,
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let Ok(line) = serde_json::to_string(&entry) else {
                    continue;
                };
                let written = async {
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_file)
                        .await?;
                    file.write_all(format!("{line}\n").as_bytes()).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(error = %e, "Failed to append audit entry");
                }
            }
        });

        Self { tx }
    }

    /// Queue one entry for the writer.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            request_id = %entry.request_id,
            caller = %entry.caller,
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        if self.tx.send(AuditMessage::Entry(Box::new(entry))).is_err() {
            warn!("Audit writer is gone; entry dropped");
        }
    }

    /// Queue an entry built from its parts, stamped with the current time.
    pub fn log_action(
        &self,
        request_id: Uuid,
        caller: impl Into<String>,
        action: impl Into<String>,
        command: Option<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            request_id,
            caller: caller.into(),
            action: action.into(),
            command,
            details,
            outcome,
        });
    }

    /// Wait until every entry queued so far, from any clone, is written.
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(AuditMessage::Flush(done)).is_err() {
            warn!("Audit writer is gone; nothing to flush");
            return;
        }
        let _ = written.await;
    }

    /// Flush and release this handle. Clones held elsewhere keep the writer running.
    pub async fn shutdown(self) {
        self.flush().await;
    }
}

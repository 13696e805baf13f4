//! Append-only job log for delivery attempts.
//!
//! Writes one JSON object per line for every stage transition of every
//! delivery. The log is for post-hoc diagnosis only; nothing reads it back.
//! Access tokens never reach this module, only resolved user ids.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

/// Stage tag of a job log entry.
///
/// The final entry of a delivery is either [`JobStage::Sent`] or exactly
/// one of the failure tags, so the last line alone tells where an attempt
/// ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// The token did not resolve. Terminal.
    Unauthorized,
    /// The credential lookup itself failed. Terminal.
    AuthError,
    /// Token resolved; request accepted.
    Received,
    /// Outbound fetch starting.
    Downloading,
    /// Transport failure while fetching. Terminal.
    DownloadError,
    /// Remote answered with a non-success status. Terminal.
    DownloadBadStatus,
    /// Advertised or observed size exceeded the ceiling. Terminal.
    DownloadTooLarge,
    /// Writing the scratch artifact failed. Terminal.
    StageError,
    /// Full body staged to scratch storage.
    Downloaded,
    /// Recipient address lookup failed. Terminal.
    RecipientError,
    /// The delivery capability failed. Terminal.
    SendError,
    /// Delivered. Terminal.
    Sent,
}

impl JobStage {
    /// Returns the tag as written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::AuthError => "auth_error",
            Self::Received => "received",
            Self::Downloading => "downloading",
            Self::DownloadError => "download_error",
            Self::DownloadBadStatus => "download_bad_status",
            Self::DownloadTooLarge => "download_too_large",
            Self::StageError => "stage_error",
            Self::Downloaded => "downloaded",
            Self::RecipientError => "recipient_error",
            Self::SendError => "send_error",
            Self::Sent => "sent",
        }
    }
}

/// Stage-specific fields of an entry. Unset fields are omitted from the line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobFields {
    /// Byte count (staged or delivered).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Bytes written before a staging or transfer failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<u64>,
    /// Remote HTTP status for bad-status entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Size ceiling in force for too-large entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Scratch path of the staged artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Recipient address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Error text, verbatim from the failing collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One line of the job log.
#[derive(Debug, Serialize)]
struct JobEntry<'a> {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    #[serde(skip_serializing_if = "is_blank")]
    username: &'a str,
    url: &'a str,
    status: JobStage,
    #[serde(flatten)]
    fields: &'a JobFields,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

/// Who and what an entry is about.
#[derive(Debug, Clone, Copy)]
pub struct JobSubject<'a> {
    /// Resolved user, `None` before authentication succeeds.
    pub user_id: Option<i64>,
    /// Telegram username, may be empty.
    pub username: &'a str,
    /// Source URL as submitted.
    pub url: &'a str,
}

/// Job log writing JSON lines to an append-only sink.
pub struct JobLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog").finish_non_exhaustive()
    }
}

impl JobLog {
    /// Open a job log appending to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create a job log over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn record(
        &self,
        subject: JobSubject<'_>,
        stage: JobStage,
        fields: &JobFields,
    ) -> anyhow::Result<()> {
        let entry = JobEntry {
            timestamp: Utc::now().to_rfc3339(),
            user_id: subject.user_id,
            username: subject.username,
            url: subject.url,
            status: stage,
            fields,
        };
        let line = serde_json::to_string(&entry)?;
        debug!(status = stage.as_str(), user_id = ?subject.user_id, url = subject.url, "job log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("job log lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

//! Fakes shared by the pipeline tests: a one-shot HTTP responder, a
//! recording mailer, and an in-memory job log.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use filemailer::joblog::JobLog;
use filemailer::mail::{MailError, Mailer, OutgoingMail};
use filemailer::pipeline::{DeliveryPipeline, PipelineConfig};
use filemailer::store::{Registration, Store};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve one raw HTTP response. Returns the base URL and a hit counter.
pub async fn serve_once(head: String, body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut read_buf = [0_u8; 4096];
            let _ = socket.read(&mut read_buf).await;
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), hits)
}

/// `200 OK` with an exact `Content-Length`.
pub async fn serve_ok(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    serve_once(head, body).await
}

/// A message the fake mailer accepted.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Mailer that records messages, or fails with a fixed error text.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Delivered>>,
    pub fail_with: Option<String>,
}

impl RecordingMailer {
    pub fn failing(error: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(error.to_owned()),
        }
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.sent.lock().expect("test lock").clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        if let Some(error) = &self.fail_with {
            return Err(MailError::Smtp(error.clone()));
        }
        let attachment = mail
            .attachment
            .as_ref()
            .ok_or_else(|| MailError::Attachment("missing".to_owned()))?;
        let meta = tokio::fs::metadata(&attachment.path)
            .await
            .map_err(|e| MailError::Attachment(e.to_string()))?;
        self.sent.lock().expect("test lock").push(Delivered {
            to: mail.to.clone(),
            subject: mail.subject.clone(),
            body: mail.body.clone(),
            filename: attachment.filename.clone(),
            path: attachment.path.clone(),
            bytes: meta.len(),
        });
        Ok(())
    }
}

/// In-memory job log sink.
#[derive(Clone)]
pub struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuf {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
    }

    pub fn entries(&self) -> Vec<serde_json::Value> {
        let cursor = self.0.lock().expect("test lock");
        String::from_utf8_lossy(cursor.get_ref())
            .lines()
            .map(|line| serde_json::from_str(line).expect("job log line is JSON"))
            .collect()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.entries()
            .iter()
            .map(|e| e["status"].as_str().unwrap_or_default().to_owned())
            .collect()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Write::write(&mut *self.0.lock().expect("test lock"), buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Write::flush(&mut *self.0.lock().expect("test lock"))
    }
}

/// A pipeline over an in-memory store with one registered user.
pub struct Harness {
    pub pipeline: DeliveryPipeline,
    pub mailer: Arc<RecordingMailer>,
    pub log: SharedBuf,
    pub scratch: TempDir,
    pub token: String,
    pub user_id: i64,
}

impl Harness {
    pub async fn new(max_file_bytes: Option<u64>, mailer: RecordingMailer) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        let store = Store::from_pool(pool).await.expect("schema applies");
        let (user_id, token) = match store
            .register_telegram_user(1, "alice", "a@x.com")
            .await
            .expect("register")
        {
            Registration::Created { user_id, token } => (user_id, token.expose().to_owned()),
            Registration::AlreadyRegistered { .. } => panic!("fresh store"),
        };

        let scratch = tempfile::tempdir().expect("scratch dir");
        let log = SharedBuf::new();
        let mailer = Arc::new(mailer);
        let pipeline = DeliveryPipeline::new(
            Arc::new(store),
            Arc::clone(&mailer) as Arc<dyn Mailer>,
            Arc::new(JobLog::from_writer(Box::new(log.clone()))),
            PipelineConfig {
                scratch_dir: scratch.path().join("work"),
                max_file_bytes,
            },
        )
        .expect("pipeline builds");

        Self {
            pipeline,
            mailer,
            log,
            scratch,
            token,
            user_id,
        }
    }

    /// Files left in the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        list_files(&self.scratch.path().join("work"))
    }
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

//! Delivery pipeline: authenticate, fetch, stage, resolve recipient, mail.
//!
//! [`DeliveryPipeline::deliver`] runs the stages strictly in order for one
//! `(token, url)` pair. Each stage transition appends one job log entry;
//! the last entry names either `sent` or the stage that failed. Nothing is
//! retried, and resubmitting the same pair is a new, independent delivery.
//!
//! The scratch artifact is a [`ScratchFile`], so it is removed on every
//! exit path.

mod fetch;
pub mod scratch;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use url::Url;

use crate::auth::{AccessToken, CredentialResolver, UserIdentity};
use crate::config::{Config, RuntimePaths};
use crate::error::FailureKind;
use crate::joblog::{JobFields, JobLog, JobStage, JobSubject};
use crate::mail::{AttachmentFile, Mailer, OutgoingMail};

use self::fetch::FetchFailure;
pub use self::scratch::{attachment_name, ScratchFile, FALLBACK_FILENAME};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Pipeline policy, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory for per-delivery scratch files.
    pub scratch_dir: PathBuf,
    /// Size ceiling in bytes, `None` for no ceiling.
    pub max_file_bytes: Option<u64>,
}

impl PipelineConfig {
    /// Derive the pipeline policy from the loaded config.
    pub fn from_config(config: &Config, paths: &RuntimePaths) -> Self {
        Self {
            scratch_dir: config.scratch_dir(paths),
            max_file_bytes: config.delivery.size_limit(),
        }
    }
}

/// What a successful delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Recipient user.
    pub user_id: i64,
    /// Address the file was sent to.
    pub email: String,
    /// Attachment name.
    pub filename: String,
    /// Bytes delivered.
    pub size: u64,
}

/// Why a delivery ended without sending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The token does not belong to any user.
    #[error("invalid api key")]
    Unauthorized,

    /// The credential lookup failed.
    #[error("credential lookup failed: {0}")]
    Lookup(String),

    /// Transport failure while fetching.
    #[error("download failed: {0}")]
    Download(String),

    /// The remote answered with a non-success status.
    #[error("download bad status: {0}")]
    BadStatus(u16),

    /// The file exceeds the size ceiling.
    #[error("file too large: {size} bytes exceeds {limit} byte limit")]
    TooLarge {
        /// Advertised or observed size.
        size: u64,
        /// Ceiling in force.
        limit: u64,
    },

    /// The download could not be written to scratch storage.
    #[error("failed to stage download: {0}")]
    Staging(String),

    /// The recipient address could not be read for an authenticated user.
    #[error("recipient lookup failed: {0}")]
    Recipient(String),

    /// The delivery capability failed.
    #[error("email send failed: {0}")]
    Send(String),
}

impl DeliveryError {
    /// Job log tag of the failing stage.
    pub fn stage(&self) -> JobStage {
        match self {
            Self::Unauthorized => JobStage::Unauthorized,
            Self::Lookup(_) => JobStage::AuthError,
            Self::Download(_) => JobStage::DownloadError,
            Self::BadStatus(_) => JobStage::DownloadBadStatus,
            Self::TooLarge { .. } => JobStage::DownloadTooLarge,
            Self::Staging(_) => JobStage::StageError,
            Self::Recipient(_) => JobStage::RecipientError,
            Self::Send(_) => JobStage::SendError,
        }
    }

    /// Caller-facing failure kind.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unauthorized => FailureKind::Authorization,
            Self::Download(_) | Self::BadStatus(_) => FailureKind::TransientRemote,
            Self::TooLarge { .. } => FailureKind::SizeLimit,
            Self::Send(_) => FailureKind::Delivery,
            Self::Recipient(_) => FailureKind::InternalInconsistency,
            Self::Lookup(_) | Self::Staging(_) => FailureKind::Internal,
        }
    }

    /// Short message safe to show the caller.
    ///
    /// Internal details (database and SMTP errors) stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized => "invalid api key".to_owned(),
            Self::Download(_) => "download failed".to_owned(),
            Self::BadStatus(code) => format!("download failed: remote answered HTTP {code}"),
            Self::TooLarge { limit, .. } => format!("file is larger than {limit} bytes"),
            Self::Send(_) => "email send failed".to_owned(),
            Self::Lookup(_) | Self::Staging(_) | Self::Recipient(_) => {
                "internal error".to_owned()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Orchestrates one delivery per call. Holds no per-delivery state, so a
/// single instance serves concurrent callers.
pub struct DeliveryPipeline {
    resolver: Arc<dyn CredentialResolver>,
    mailer: Arc<dyn Mailer>,
    job_log: Arc<JobLog>,
    http: reqwest::Client,
    config: PipelineConfig,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Build a pipeline. The outbound client has no request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        resolver: Arc<dyn CredentialResolver>,
        mailer: Arc<dyn Mailer>,
        job_log: Arc<JobLog>,
        config: PipelineConfig,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("filemailer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            resolver,
            mailer,
            job_log,
            http,
            config,
        })
    }

    /// Fetch `url` and mail it to the owner of `token`.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] naming the stage that failed. Every error
    /// has already been written to the job log.
    pub async fn deliver(&self, token: &str, url: &str) -> Result<DeliveryReceipt, DeliveryError> {
        let identity = self.authenticate(token, url).await?;
        let subject = JobSubject {
            user_id: Some(identity.user_id),
            username: &identity.username,
            url,
        };
        self.record(subject, JobStage::Received, JobFields::default());

        let result = self.run_stages(&identity, subject).await;
        match &result {
            Ok(receipt) => info!(user_id = receipt.user_id, size = receipt.size, "delivery sent"),
            Err(err) => warn!(
                user_id = identity.user_id,
                stage = err.stage().as_str(),
                error = %err,
                "delivery failed"
            ),
        }
        result
    }

    /// Stage 1: resolve the token. Logs `unauthorized`/`auth_error` on failure.
    async fn authenticate(&self, token: &str, url: &str) -> Result<UserIdentity, DeliveryError> {
        let anonymous = JobSubject {
            user_id: None,
            username: "",
            url,
        };

        let resolved = match AccessToken::parse(token) {
            Some(token) => self.resolver.resolve(&token).await,
            None => Ok(None),
        };

        match resolved {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                self.record(anonymous, JobStage::Unauthorized, JobFields::default());
                Err(DeliveryError::Unauthorized)
            }
            Err(e) => {
                let error = e.to_string();
                self.record(
                    anonymous,
                    JobStage::AuthError,
                    JobFields {
                        error: Some(error.clone()),
                        ..JobFields::default()
                    },
                );
                Err(DeliveryError::Lookup(error))
            }
        }
    }

    /// Stages 2 to 6 for an authenticated user.
    async fn run_stages(
        &self,
        identity: &UserIdentity,
        subject: JobSubject<'_>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        // Fetch.
        self.record(subject, JobStage::Downloading, JobFields::default());

        let parsed = match Url::parse(subject.url) {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = format!("invalid URL: {e}");
                self.record(
                    subject,
                    JobStage::DownloadError,
                    JobFields {
                        error: Some(error.clone()),
                        ..JobFields::default()
                    },
                );
                return Err(DeliveryError::Download(error));
            }
        };

        // Stage to local storage. `scratch` is removed when it drops.
        let scratch = ScratchFile::reserve(&self.config.scratch_dir, &attachment_name(&parsed));
        let size = match fetch::fetch_to_scratch(
            &self.http,
            &parsed,
            &scratch,
            self.config.max_file_bytes,
        )
        .await
        {
            Ok(size) => size,
            Err(failure) => return Err(self.fetch_failed(subject, failure)),
        };
        self.record(
            subject,
            JobStage::Downloaded,
            JobFields {
                size: Some(size),
                path: Some(scratch.path().display().to_string()),
                ..JobFields::default()
            },
        );

        // Resolve recipient.
        let email = match self.resolver.email_of(identity.user_id).await {
            Ok(email) => email,
            Err(e) => {
                let error = e.to_string();
                self.record(
                    subject,
                    JobStage::RecipientError,
                    JobFields {
                        error: Some(error.clone()),
                        ..JobFields::default()
                    },
                );
                return Err(DeliveryError::Recipient(error));
            }
        };

        // Compose and deliver.
        let mail = compose(&parsed, &email, &scratch, size);
        if let Err(e) = self.mailer.send(&mail).await {
            let error = e.to_string();
            self.record(
                subject,
                JobStage::SendError,
                JobFields {
                    email: Some(email),
                    error: Some(error.clone()),
                    ..JobFields::default()
                },
            );
            return Err(DeliveryError::Send(error));
        }

        self.record(
            subject,
            JobStage::Sent,
            JobFields {
                size: Some(size),
                email: Some(email.clone()),
                ..JobFields::default()
            },
        );

        // Cleanup.
        let filename = scratch.name().to_owned();
        if let Err(e) = scratch.remove().await {
            warn!(error = %e, "failed to remove scratch file after delivery");
        }

        Ok(DeliveryReceipt {
            user_id: identity.user_id,
            email,
            filename,
            size,
        })
    }

    /// Log a fetch failure and translate it.
    fn fetch_failed(&self, subject: JobSubject<'_>, failure: FetchFailure) -> DeliveryError {
        match failure {
            FetchFailure::Transport { written, error } => {
                self.record(
                    subject,
                    JobStage::DownloadError,
                    JobFields {
                        written: Some(written),
                        error: Some(error.clone()),
                        ..JobFields::default()
                    },
                );
                DeliveryError::Download(error)
            }
            FetchFailure::BadStatus(code) => {
                self.record(
                    subject,
                    JobStage::DownloadBadStatus,
                    JobFields {
                        http_status: Some(code),
                        ..JobFields::default()
                    },
                );
                DeliveryError::BadStatus(code)
            }
            FetchFailure::TooLarge { size, limit } => {
                self.record(
                    subject,
                    JobStage::DownloadTooLarge,
                    JobFields {
                        size: Some(size),
                        limit: Some(limit),
                        ..JobFields::default()
                    },
                );
                DeliveryError::TooLarge { size, limit }
            }
            FetchFailure::Stage { written, error } => {
                self.record(
                    subject,
                    JobStage::StageError,
                    JobFields {
                        written: Some(written),
                        error: Some(error.clone()),
                        ..JobFields::default()
                    },
                );
                DeliveryError::Staging(error)
            }
        }
    }

    /// Append to the job log. A failing log write never fails the delivery.
    fn record(&self, subject: JobSubject<'_>, stage: JobStage, fields: JobFields) {
        if let Err(e) = self.job_log.record(subject, stage, &fields) {
            warn!(error = %e, stage = stage.as_str(), "failed to write job log entry");
        }
    }
}

/// Build the outgoing message for a staged file.
fn compose(url: &Url, email: &str, scratch: &ScratchFile, size: u64) -> OutgoingMail {
    let now = Utc::now().format("%Y-%m-%d %H:%M:%S");
    let origin = url.host_str().unwrap_or("unknown host");
    OutgoingMail {
        to: email.to_owned(),
        subject: format!(
            "Downloaded file {} from {origin} ({size} bytes) at {now}",
            scratch.name()
        ),
        body: format!("The file at {url} was downloaded successfully. Size: {size} bytes.\n"),
        attachment: Some(AttachmentFile {
            path: scratch.path().to_path_buf(),
            filename: scratch.name().to_owned(),
        }),
    }
}

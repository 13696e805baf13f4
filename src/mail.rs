//! Delivery capability: send a message with one file attachment.
//!
//! [`Mailer`] is the seam the delivery pipeline talks to. [`SmtpMailer`] is
//! the production implementation over lettre's async SMTP transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::{SmtpConfig, TlsMode};

/// Errors from the delivery capability. The text is surfaced verbatim in
/// the job log.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Required SMTP setting missing or unusable.
    #[error("smtp config incomplete: {0}")]
    MissingConfig(String),

    /// An address failed to parse.
    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    /// The staged attachment could not be read.
    #[error("attach file: {0}")]
    Attachment(String),

    /// The message could not be assembled.
    #[error("failed to build message: {0}")]
    Build(String),

    /// The SMTP exchange failed.
    #[error("smtp: {0}")]
    Smtp(String),
}

/// A file on local disk to attach under a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentFile {
    /// Where the bytes are.
    pub path: PathBuf,
    /// File name shown to the recipient.
    pub filename: String,
}

/// A message handed to the delivery capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    /// Recipient address.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Optional attachment.
    pub attachment: Option<AttachmentFile>,
}

/// Async message sending.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message.
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// SMTP-based mailer using lettre.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: Mailbox,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Build a mailer from config and the SMTP password credential.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::MissingConfig`] when host or sender are empty and
    /// [`MailError::InvalidAddress`] when the sender does not parse.
    pub fn from_config(config: &SmtpConfig, password: Option<String>) -> Result<Self, MailError> {
        if config.host.trim().is_empty() {
            return Err(MailError::MissingConfig("smtp.host".to_owned()));
        }
        if config.from.trim().is_empty() {
            return Err(MailError::MissingConfig("smtp.from".to_owned()));
        }

        let address: Address = config
            .from
            .parse()
            .map_err(|_| MailError::InvalidAddress(config.from.clone()))?;
        let from = Mailbox::new(Some(config.from_name.clone()), address);

        let mut builder = match config.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::Smtp(e.to_string()))?,
            TlsMode::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| MailError::Smtp(e.to_string()))?,
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (config.username.clone(), password) {
            builder = builder.credentials(SmtpCredentials::new(username, password));
        }

        Ok(Self {
            transport: Arc::new(builder.build()),
            from,
        })
    }

    async fn build_message(&self, mail: &OutgoingMail) -> Result<Message, MailError> {
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|_| MailError::InvalidAddress(mail.to.clone()))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&mail.subject);

        let Some(attachment) = &mail.attachment else {
            return builder
                .singlepart(SinglePart::plain(mail.body.clone()))
                .map_err(|e| MailError::Build(e.to_string()));
        };

        let bytes = tokio::fs::read(&attachment.path)
            .await
            .map_err(|e| MailError::Attachment(e.to_string()))?;
        let content_type = ContentType::parse("application/octet-stream")
            .map_err(|e| MailError::Build(e.to_string()))?;
        let part = Attachment::new(attachment.filename.clone()).body(bytes, content_type);

        builder
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(mail.body.clone()))
                    .singlepart(part),
            )
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = self.build_message(mail).await?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))?;

        debug!(to = %mail.to, "mail handed to smtp relay");
        Ok(())
    }
}

//! Secrets from the runtime `.env` file.
//!
//! Only two secrets exist: the Telegram bot token and the SMTP password.
//! `config.toml` names the keys they live under; this module resolves them.
//! Values never reach `Debug` output or error messages.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;

use crate::config::{SmtpConfig, TelegramConfig};

/// Written by `filemailer init`. Keys match the config defaults.
pub const ENV_TEMPLATE: &str = "\
# filemailer secrets. Keep this file private (0600).
FILEMAILER_TELEGRAM_TOKEN=
FILEMAILER_SMTP_PASSWORD=
";

/// Key/value pairs from the `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Wrap already-parsed pairs.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Value under `key`. Blank values count as unset, since `init` writes
    /// every key with an empty value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Value under `key`, or an error naming the key.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is absent or blank.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }

    /// Bot token under `telegram.bot_token_env`.
    ///
    /// # Errors
    ///
    /// Returns an error when the token is not set.
    pub fn bot_token(&self, telegram: &TelegramConfig) -> anyhow::Result<String> {
        self.require(&telegram.bot_token_env)
            .context("the Telegram bot needs a token")
    }

    /// SMTP password under `smtp.password_env`.
    ///
    /// Without `smtp.username` the relay is used unauthenticated and no
    /// password is read.
    ///
    /// # Errors
    ///
    /// Returns an error when a username is configured but the password is
    /// not set.
    pub fn smtp_password(&self, smtp: &SmtpConfig) -> anyhow::Result<Option<String>> {
        match smtp.username {
            Some(_) => self
                .require(&smtp.password_env)
                .context("smtp.username is set")
                .map(Some),
            None => Ok(None),
        }
    }
}

/// Read the `.env` file at `path`.
///
/// # Errors
///
/// Returns an error if the file is missing, readable by group or others, or
/// not valid `.env` syntax.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        anyhow::bail!(
            "credentials file {} does not exist; run `filemailer init`",
            path.display()
        );
    }
    validate_private_permissions(path)?;

    let vars = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?
        .collect::<Result<BTreeMap<_, _>, _>>()
        .with_context(|| format!("malformed entry in credentials file {}", path.display()))?;

    Ok(Credentials { vars })
}

/// Create `path` with [`ENV_TEMPLATE`] unless it already exists.
///
/// Returns `true` when the file was written. Either way the file ends up
/// `0600`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or its mode cannot be set.
pub fn write_env_template(path: &Path) -> anyhow::Result<bool> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let written = match options.open(path) {
        Ok(mut file) => {
            file.write_all(ENV_TEMPLATE.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create {}", path.display()));
        }
    };

    enforce_private_file_permissions(path)?;
    Ok(written)
}

/// Set `0600` on `path`. No-op off Unix.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?
        .permissions()
        .mode()
        & 0o777;

    if mode & 0o077 != 0 {
        anyhow::bail!(
            "credentials file {} must be 0600, found {mode:o}",
            path.display()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

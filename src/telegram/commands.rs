//! Telegram slash command parsing and handlers.
//!
//! Each handler returns an HTML-formatted reply, or `None` when the bot
//! must stay silent (admin commands from other chats).

use lettre::Address;
use tracing::warn;

use crate::approval::{ApprovalError, ApprovalService, Decision};
use crate::store::{Registration, Store, StoreError};
use crate::telegram::ui::{escape_html, format_pending};

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start`
    Start,
    /// `/help`
    Help,
    /// `/register <email>`
    Register(String),
    /// `/email <new_email>`
    Email(String),
    /// `/approve <id>`
    Approve(String),
    /// `/reject <id>`
    Reject(String),
    /// `/changes`
    Changes,
    /// Anything else starting with `/`.
    Unknown(String),
}

/// Parse a slash command. Returns `None` for text that is not a command.
///
/// Handles bot-mention suffixes like `/help@filemailer_bot`.
pub fn parse_command(text: &str) -> Option<Command> {
    let without_slash = text.trim().strip_prefix('/')?;
    let (full_command, args) = match without_slash.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (without_slash, ""),
    };
    let command = full_command.split('@').next().unwrap_or(full_command);
    let args = args.to_owned();

    Some(match command {
        "start" => Command::Start,
        "help" => Command::Help,
        "register" => Command::Register(args),
        "email" => Command::Email(args),
        "approve" => Command::Approve(args),
        "reject" => Command::Reject(args),
        "changes" => Command::Changes,
        other => Command::Unknown(other.to_owned()),
    })
}

/// Greeting; differs once the account is registered.
pub fn handle_start(username: Option<&str>) -> String {
    match username {
        Some(name) if !name.is_empty() => format!(
            "Hi @{}! Send me a link to a file and I will e-mail it to you.",
            escape_html(name)
        ),
        Some(_) => "Hi! Send me a link to a file and I will e-mail it to you.".to_owned(),
        None => "Hi! Register with /register email@example.com, then send me links to files."
            .to_owned(),
    }
}

/// List the commands available in this chat.
pub fn handle_help(is_admin: bool) -> String {
    let mut lines = vec![
        "<b>Available commands:</b>",
        "",
        "/register &lt;email&gt; - register and get an API key",
        "/email &lt;new_email&gt; - ask to change your address",
        "/help - show this message",
        "",
        "Any message containing a link is fetched and mailed to you.",
    ];
    if is_admin {
        lines.extend([
            "",
            "<b>Admin:</b>",
            "/changes - list pending e-mail changes",
            "/approve &lt;id&gt; - approve a change",
            "/reject &lt;id&gt; - reject a change",
        ]);
    }
    lines.join("\n")
}

/// Register the sender with `email`.
pub async fn handle_register(
    store: &Store,
    telegram_id: i64,
    username: &str,
    email: &str,
) -> String {
    if !is_email(email) {
        return "Usage: /register email@example.com".to_owned();
    }

    match store.register_telegram_user(telegram_id, username, email).await {
        Ok(Registration::Created { token, .. }) => format!(
            "Done! Now just send me a link to a file.\n\
             Your API key for the HTTP service: <code>{}</code>",
            token.expose()
        ),
        Ok(Registration::AlreadyRegistered { .. }) => {
            "You are already registered. Use /email to change your address.".to_owned()
        }
        Err(StoreError::EmailTaken) => "That address is already registered.".to_owned(),
        Err(e) => {
            warn!(telegram_id, error = %e, "registration failed");
            "Registration failed, try again later.".to_owned()
        }
    }
}

/// Ask the administrators to change the sender's address.
pub async fn handle_email_change(
    approvals: &ApprovalService,
    telegram_id: i64,
    chat_id: i64,
    new_email: &str,
) -> String {
    if !is_email(new_email) {
        return "Usage: /email new@example.com".to_owned();
    }

    match approvals.create_request(telegram_id, chat_id, new_email).await {
        Ok(request) => format!(
            "Request #{} sent to the administrators. You will be notified of the decision.",
            request.id
        ),
        Err(ApprovalError::NotRegistered) => not_registered(),
        Err(e) => {
            warn!(telegram_id, error = %e, "change request failed");
            "Could not create the request, try again later.".to_owned()
        }
    }
}

/// `/approve` or `/reject`. Silent outside the admin chat.
pub async fn handle_decision(
    approvals: &ApprovalService,
    approve: bool,
    raw_id: &str,
    chat_id: i64,
) -> Option<String> {
    if !approvals.is_admin(chat_id) {
        return None;
    }
    let verb = if approve { "approve" } else { "reject" };
    let Ok(id) = raw_id.trim().trim_start_matches('#').parse::<i64>() else {
        return Some(format!("Usage: /{verb} &lt;id&gt;"));
    };

    let outcome = if approve {
        approvals.approve(id, chat_id).await
    } else {
        approvals.reject(id, chat_id).await
    };
    format_decision(id, outcome)
}

/// Render a decision for the admin chat.
pub fn format_decision(id: i64, outcome: Result<Decision, ApprovalError>) -> Option<String> {
    match outcome {
        Ok(Decision::Ignored) => None,
        Ok(Decision::Applied(request)) => Some(format!(
            "Request #{id} {}: {} \u{2192} {}",
            request.status,
            escape_html(&request.old_email),
            escape_html(&request.new_email),
        )),
        Err(e @ (ApprovalError::NotFound(_) | ApprovalError::AlreadyProcessed { .. })) => {
            Some(escape_html(&e.to_string()))
        }
        Err(ApprovalError::EmailTaken) => Some(format!(
            "Request #{id} left pending: the new address belongs to another user."
        )),
        Err(e) => {
            warn!(id, kind = e.kind().as_str(), error = %e, "decision failed");
            Some(format!(
                "Request #{id} could not be processed: {}",
                escape_html(&e.to_string())
            ))
        }
    }
}

/// `/changes`. Silent outside the admin chat.
pub async fn handle_changes(approvals: &ApprovalService, chat_id: i64) -> Option<String> {
    match approvals.list_pending(chat_id).await {
        Ok(None) => None,
        Ok(Some(requests)) => Some(format_pending(&requests)),
        Err(e) => {
            warn!(error = %e, "listing change requests failed");
            Some("Could not list requests.".to_owned())
        }
    }
}

/// Reply for senders without an account.
pub fn not_registered() -> String {
    "You are not registered yet. Start with /register email@example.com".to_owned()
}

fn is_email(raw: &str) -> bool {
    raw.parse::<Address>().is_ok()
}

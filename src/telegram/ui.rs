//! HTML formatting and inline keyboard helpers for Telegram messages.
//!
//! All output uses HTML parse mode (never MarkdownV2).

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::pipeline::{DeliveryError, DeliveryReceipt};
use crate::store::ChangeRequest;

/// Callback data prefix for approve buttons.
pub const APPROVE_PREFIX: &str = "a:";

/// Callback data prefix for reject buttons.
pub const REJECT_PREFIX: &str = "r:";

/// Escape special HTML characters in user-provided text.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Inline keyboard with Approve and Reject buttons for a change request.
pub fn decision_keyboard(request_id: i64) -> InlineKeyboardMarkup {
    let approve = InlineKeyboardButton::callback(
        "\u{2705} Approve".to_owned(),
        format!("{APPROVE_PREFIX}{request_id}"),
    );
    let reject = InlineKeyboardButton::callback(
        "\u{274C} Reject".to_owned(),
        format!("{REJECT_PREFIX}{request_id}"),
    );
    InlineKeyboardMarkup::new(vec![vec![approve, reject]])
}

/// One-line summary of a change request.
pub fn format_change_request(request: &ChangeRequest) -> String {
    format!(
        "#{id} user {user}: {old} \u{2192} {new} ({created})",
        id = request.id,
        user = request.user_id,
        old = escape_html(&request.old_email),
        new = escape_html(&request.new_email),
        created = request.created_at.format("%Y-%m-%d %H:%M"),
    )
}

/// Listing for `/changes`.
pub fn format_pending(requests: &[ChangeRequest]) -> String {
    if requests.is_empty() {
        return "No pending e-mail changes.".to_owned();
    }
    let mut lines = vec![format!("<b>Pending e-mail changes ({}):</b>", requests.len())];
    lines.extend(requests.iter().map(format_change_request));
    lines.join("\n")
}

/// Report of a finished delivery.
pub fn format_delivery(outcome: &Result<DeliveryReceipt, DeliveryError>) -> String {
    match outcome {
        Ok(receipt) => format!(
            "\u{2705} <code>{name}</code> ({size} bytes) sent to {email}.",
            name = escape_html(&receipt.filename),
            size = receipt.size,
            email = escape_html(&receipt.email),
        ),
        Err(e) => format!(
            "\u{274C} Could not deliver the file: {}",
            escape_html(&e.user_message())
        ),
    }
}

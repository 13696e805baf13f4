//! Telegram front-end: slash commands, link submission, and admin decisions.
//!
//! Every update is handled on its own dispatcher task. Deliveries run on a
//! spawned task so a long download never blocks the chat.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalService, Notice, Notifier};
use crate::pipeline::DeliveryPipeline;
use crate::store::Store;

pub mod commands;
pub mod ui;

use commands::Command;

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Sends approval notices through the bot.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    /// Wrap a bot handle.
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notice: &Notice) -> anyhow::Result<()> {
        let mut req = self
            .bot
            .send_message(ChatId(notice.chat_id), ui::escape_html(&notice.text))
            .parse_mode(ParseMode::Html);
        if let Some(id) = notice.decide {
            req = req.reply_markup(ui::decision_keyboard(id));
        }
        req.await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared state for handler injection
// ---------------------------------------------------------------------------

/// Dependencies injected into teloxide handlers via `dptree::deps!`.
#[derive(Clone)]
pub struct BotState {
    /// User and change-request store.
    pub store: Store,
    /// Change-request state machine.
    pub approvals: ApprovalService,
    /// Delivery pipeline.
    pub pipeline: Arc<DeliveryPipeline>,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run the bot until Ctrl+C.
///
/// # Errors
///
/// Currently infallible once started; the dispatcher logs its own errors.
pub async fn run_telegram(bot: Bot, state: BotState) -> anyhow::Result<()> {
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    info!("telegram dispatcher starting");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// First `http://` or `https://` link in a message.
pub fn extract_url(text: &str) -> Option<&str> {
    static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    URL_RE
        .get_or_init(|| Regex::new(r"https?://\S+").ok())
        .as_ref()?
        .find(text)
        .map(|m| m.as_str())
}

// ---------------------------------------------------------------------------
// Message handler
// ---------------------------------------------------------------------------

async fn handle_message(bot: Bot, msg: Message, state: BotState) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    // teloxide uses u64 for user IDs; the store keeps i64.
    let Ok(telegram_id) = i64::try_from(user.id.0) else {
        return Ok(());
    };
    let username = user.username.clone().unwrap_or_default();
    let chat_id = msg.chat.id.0;
    let Some(text) = msg.text() else {
        debug!(telegram_id, "non-text message ignored");
        return Ok(());
    };

    let reply = match commands::parse_command(text) {
        Some(command) => dispatch_command(command, &state, telegram_id, &username, chat_id).await,
        None => Some(submit_link(&bot, &state, telegram_id, msg.chat.id, text).await),
    };

    if let Some(reply) = reply {
        bot.send_message(msg.chat.id, reply)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}

async fn dispatch_command(
    command: Command,
    state: &BotState,
    telegram_id: i64,
    username: &str,
    chat_id: i64,
) -> Option<String> {
    match command {
        Command::Start => match state.store.telegram_user(telegram_id).await {
            Ok(linked) => Some(commands::handle_start(
                linked.as_ref().map(|u| u.username.as_str()),
            )),
            Err(e) => {
                warn!(telegram_id, error = %e, "registration lookup failed");
                Some("Internal error, try again later.".to_owned())
            }
        },
        Command::Help => Some(commands::handle_help(state.approvals.is_admin(chat_id))),
        Command::Register(email) => Some(
            commands::handle_register(&state.store, telegram_id, username, &email).await,
        ),
        Command::Email(new_email) => Some(
            commands::handle_email_change(&state.approvals, telegram_id, chat_id, &new_email)
                .await,
        ),
        Command::Approve(raw) => {
            commands::handle_decision(&state.approvals, true, &raw, chat_id).await
        }
        Command::Reject(raw) => {
            commands::handle_decision(&state.approvals, false, &raw, chat_id).await
        }
        Command::Changes => commands::handle_changes(&state.approvals, chat_id).await,
        Command::Unknown(name) => Some(format!("Unknown command: /{}", ui::escape_html(&name))),
    }
}

/// Start a delivery for the first link in `text` and acknowledge it.
async fn submit_link(
    bot: &Bot,
    state: &BotState,
    telegram_id: i64,
    chat: ChatId,
    text: &str,
) -> String {
    let Some(url) = extract_url(text) else {
        return "I could not find a link in that message.".to_owned();
    };

    let linked = match state.store.telegram_user(telegram_id).await {
        Ok(Some(linked)) => linked,
        Ok(None) => return commands::not_registered(),
        Err(e) => {
            warn!(telegram_id, error = %e, "registration lookup failed");
            return "Internal error, try again later.".to_owned();
        }
    };
    let token = match state.store.get_token(linked.user_id).await {
        Ok(token) => token,
        Err(e) => {
            warn!(user_id = linked.user_id, error = %e, "token lookup failed");
            return "Internal error, try again later.".to_owned();
        }
    };

    let pipeline = Arc::clone(&state.pipeline);
    let bot = bot.clone();
    let url = url.to_owned();
    tokio::spawn(async move {
        let outcome = pipeline.deliver(token.expose(), &url).await;
        if let Err(e) = bot
            .send_message(chat, ui::format_delivery(&outcome))
            .parse_mode(ParseMode::Html)
            .await
        {
            warn!(error = %e, "failed to report delivery outcome");
        }
    });

    "Got it, fetching the file. I will report back when it is sent.".to_owned()
}

// ---------------------------------------------------------------------------
// Callback query handler
// ---------------------------------------------------------------------------

/// Inline keyboard decisions from the admin chat.
async fn handle_callback(bot: Bot, query: CallbackQuery, state: BotState) -> ResponseResult<()> {
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id.0) else {
        bot.answer_callback_query(&query.id).await?;
        return Ok(());
    };
    let data = query.data.as_deref().unwrap_or_default();

    let (approve, raw_id) = if let Some(id) = data.strip_prefix(ui::APPROVE_PREFIX) {
        (true, id)
    } else if let Some(id) = data.strip_prefix(ui::REJECT_PREFIX) {
        (false, id)
    } else {
        bot.answer_callback_query(&query.id)
            .text("Unknown action")
            .await?;
        return Ok(());
    };

    let reply = commands::handle_decision(&state.approvals, approve, raw_id, chat_id).await;
    bot.answer_callback_query(&query.id).await?;
    if let Some(reply) = reply {
        bot.send_message(ChatId(chat_id), reply)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}

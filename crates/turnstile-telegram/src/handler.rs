//! Telegram message and callback-query handlers registered in the teloxide Dispatcher.

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tracing::{info_span, warn, Instrument};
use turnstile_core::config::TelegramConfig;
use turnstile_core::frontend::DedupRing;
use turnstile_orchestrator::{ChatOrchestrator, StreamUpdate};
use turnstile_sessions::SessionService;

use crate::allow;
use crate::send;
use crate::typing::TypingHandle;

const START_TEXT: &str = "Hi, I'm here. Send me a message to start chatting.";
const HELP_TEXT: &str = "Commands:\n/new — start a fresh conversation\n/regenerate — redo the last reply\n/help — this message";
const REGENERATE_LABEL: &str = "Regenerate";
const REGENERATE_CALLBACK: &str = "regenerate";

/// Shared state handed to every handler invocation via `dptree::deps!`.
pub struct HandlerState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub sessions: Arc<SessionService>,
    pub dedup: Arc<DedupRing>,
}

/// Main message handler. Runs for every incoming `Message`:
/// 1. Bot-message filter
/// 2. Allowlist check (deny-by-default)
/// 3. DM guard, `require_mention` guard for groups
/// 4. Dedup by message id
/// 5. Slash command interception
/// 6. Streamed turn: typing indicator, placeholder, edit-on-emit, regenerate button
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    state: Arc<HandlerState>,
    config: TelegramConfig,
) -> ResponseResult<()> {
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let username = from.username.as_deref().unwrap_or("");
    let telegram_user_id = from.id.0.to_string();

    if !allow::is_allowed(&config.allow_users, username, &telegram_user_id) {
        return Ok(());
    }
    if msg.chat.is_private() && !config.dm_allowed {
        return Ok(());
    }
    if (msg.chat.is_group() || msg.chat.is_supergroup()) && config.require_mention {
        let bot_info = bot.get_me().await;
        let bot_username = bot_info.as_ref().ok().and_then(|me| me.user.username.as_deref()).unwrap_or("");
        let text_for_mention = msg.text().unwrap_or("");
        if !contains_mention(text_for_mention, bot_username) {
            return Ok(());
        }
    }

    if !state.dedup.observe(&msg.id.0.to_string()) {
        return Ok(());
    }

    let user_id = format!("telegram:{telegram_user_id}");
    let text = msg.text().unwrap_or("").trim().to_string();

    if text.eq_ignore_ascii_case("/regenerate") {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("telegram_turn", trace_id = %trace_id, user_id = %user_id);
        run_turn(bot, msg.chat.id, state, user_id, String::new(), true).instrument(span).await;
        return Ok(());
    }

    if let Some(response) = handle_command(&text, &state, &user_id).await {
        if let Some(response) = response {
            send::send_response(&bot, msg.chat.id, &response).await;
        }
        return Ok(());
    }

    if text.is_empty() {
        return Ok(());
    }

    let trace_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("telegram_turn", trace_id = %trace_id, user_id = %user_id);

    run_turn(bot, msg.chat.id, state, user_id, text, false).instrument(span).await;
    Ok(())
}

/// Callback-query handler: the "Regenerate" inline button.
pub async fn handle_callback(bot: Bot, query: CallbackQuery, state: Arc<HandlerState>) -> ResponseResult<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    if data != REGENERATE_CALLBACK {
        let _ = bot.answer_callback_query(query.id).await;
        return Ok(());
    }
    let Some(msg) = query.message.as_ref() else {
        let _ = bot.answer_callback_query(query.id).await;
        return Ok(());
    };
    let chat_id = msg.chat().id;
    let telegram_user_id = query.from.id.0.to_string();
    let user_id = format!("telegram:{telegram_user_id}");

    let _ = bot.answer_callback_query(query.id).await;

    let trace_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("telegram_turn", trace_id = %trace_id, user_id = %user_id);
    run_turn(bot, chat_id, state, user_id, String::new(), true).instrument(span).await;
    Ok(())
}

/// Commands local to this adapter. Returns `Some(None)` for a recognized
/// command with no direct reply (e.g. regenerate, which streams its own
/// response), `Some(Some(text))` for a static reply, `None` when `text` is
/// not a recognized command.
async fn handle_command(text: &str, state: &Arc<HandlerState>, user_id: &str) -> Option<Option<String>> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("/start") {
        return Some(Some(START_TEXT.to_string()));
    }
    if trimmed.eq_ignore_ascii_case("/help") {
        return Some(Some(HELP_TEXT.to_string()));
    }
    if trimmed.eq_ignore_ascii_case("/new") {
        return match state.sessions.reset_session_history(user_id, now_ms()).await {
            Ok(_) => Some(Some("Started a fresh conversation.".to_string())),
            Err(e) => {
                warn!(error = %e, "Telegram: /new failed");
                Some(Some("Couldn't reset the conversation, please try again.".to_string()))
            }
        };
    }
    None
}

/// Drive one streamed turn (chat or regenerate) to completion: typing
/// indicator, placeholder message, edit-on-scheduler-emit, regenerate
/// button on the terminal emit.
async fn run_turn(bot: Bot, chat_id: ChatId, state: Arc<HandlerState>, user_id: String, text: String, regenerate: bool) {
    let typing = TypingHandle::start(bot.clone(), chat_id);

    let Some(placeholder_id) = send::send_response(&bot, chat_id, "…").await else {
        typing.stop();
        return;
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamUpdate>(64);
    let orchestrator = state.orchestrator.clone();
    let run_result = if regenerate {
        tokio::spawn(async move { orchestrator.stream_regenerate(&user_id, now_ms(), tx).await })
    } else {
        tokio::spawn(async move { orchestrator.stream_chat(&user_id, &text, now_ms(), tx).await })
    };

    let mut last_text = String::new();
    while let Some(update) = rx.recv().await {
        last_text = update.text.clone();
        if update.is_final {
            edit_final(&bot, chat_id, placeholder_id, &update.text).await;
        } else {
            send::edit_response(&bot, chat_id, placeholder_id, &update.text).await;
        }
    }

    typing.stop();

    if let Ok(Err(e)) = run_result.await {
        warn!(error = %e, "Telegram: orchestrator run failed");
        if last_text.is_empty() {
            send::edit_response(&bot, chat_id, placeholder_id, "Something went wrong, please try again.").await;
        }
    }
}

async fn edit_final(bot: &Bot, chat_id: ChatId, message_id: teloxide::types::MessageId, text: &str) {
    let body = send::truncate_for_edit(text);
    let escaped = send::escape_markdown_v2(body);
    let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        REGENERATE_LABEL,
        REGENERATE_CALLBACK,
    )]]);

    let edited = bot
        .edit_message_text(chat_id, message_id, &escaped)
        .parse_mode(teloxide::types::ParseMode::MarkdownV2)
        .reply_markup(keyboard.clone())
        .await;

    if edited.is_err() {
        if let Err(e) = bot
            .edit_message_text(chat_id, message_id, body)
            .reply_markup(keyboard)
            .await
        {
            warn!(error = %e, "Telegram: final edit_message_text failed, swallowing");
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn contains_mention(text: &str, bot_username: &str) -> bool {
    if bot_username.is_empty() {
        return false;
    }
    let mention = format!("@{bot_username}");
    text.contains(&mention)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_mention_positive() {
        assert!(contains_mention("Hey @mybot, help!", "mybot"));
    }

    #[test]
    fn contains_mention_negative() {
        assert!(!contains_mention("Hello there", "mybot"));
    }

    #[test]
    fn contains_mention_empty_username() {
        assert!(!contains_mention("@foo bar", ""));
    }
}

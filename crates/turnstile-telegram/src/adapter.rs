//! Telegram channel adapter: the concrete [`turnstile_core::frontend::FrontendAdapter`].
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling event loop
//! until the process exits.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode};
use tracing::info;
use turnstile_core::config::TelegramConfig;
use turnstile_core::frontend::{DedupRing, FrontendAdapter};
use turnstile_orchestrator::ChatOrchestrator;
use turnstile_sessions::SessionService;

use crate::handler::{handle_callback, handle_message, HandlerState};
use crate::send;

/// Message-id dedup ring sized per spec (>=1000 recent ids retained).
const DEDUP_RING_CAPACITY: usize = 2000;

pub struct TelegramAdapter {
    bot: Bot,
    config: TelegramConfig,
    state: Arc<HandlerState>,
}

impl TelegramAdapter {
    pub fn new(config: TelegramConfig, orchestrator: Arc<ChatOrchestrator>, sessions: Arc<SessionService>) -> Self {
        let bot = Bot::new(&config.bot_token);
        let state = Arc::new(HandlerState {
            orchestrator,
            sessions,
            dedup: Arc::new(DedupRing::new(DEDUP_RING_CAPACITY)),
        });
        Self { bot, config, state }
    }
}

#[async_trait]
impl FrontendAdapter for TelegramAdapter {
    /// `chat_key` is a Telegram chat id encoded as a decimal string.
    /// `edit_of` is a previously returned message id; when absent a new
    /// message is sent.
    async fn deliver(&self, chat_key: &str, text: &str, edit_of: Option<&str>) -> anyhow::Result<String> {
        let chat_id: i64 = chat_key.parse()?;
        let chat_id = ChatId(chat_id);

        if let Some(raw_id) = edit_of {
            let message_id = MessageId(raw_id.parse()?);
            send::edit_response(&self.bot, chat_id, message_id, text).await;
            return Ok(raw_id.to_string());
        }

        let sent = self
            .bot
            .send_message(chat_id, send::escape_markdown_v2(text))
            .parse_mode(ParseMode::MarkdownV2)
            .await?;
        Ok(sent.id.0.to_string())
    }

    /// Connect to Telegram and drive the long-polling loop. Never returns
    /// under normal operation.
    async fn run(&self) -> anyhow::Result<()> {
        info!("Telegram: starting long-polling dispatcher");

        let bot = self.bot.clone();
        let state = self.state.clone();
        let config = self.config.clone();

        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_callback_query().endpoint(handle_callback));

        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![state, config])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

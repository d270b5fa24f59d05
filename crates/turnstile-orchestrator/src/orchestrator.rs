use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use turnstile_core::{Character, ConfigResolver, Message, MessageLogRecord, Session, TurnType};
use turnstile_pipeline::ChannelRegistry;
use turnstile_scheduler::{SchedulerState, StreamScheduler};
use turnstile_sessions::SessionService;
use turnstile_upstream::ChatRequest;

use crate::error::Result;

const DEFAULT_MAX_TOKENS: f64 = 1024.0;
const DEFAULT_INTER_CHUNK_TIMEOUT_MS: f64 = 3000.0;

const REGENERATE_EMPTY_HISTORY_MESSAGE: &str = "无法重新生成：找不到上一条用户消息。";
const UPSTREAM_EXHAUSTED_MESSAGE: &str = "抱歉，暂时无法获取回复，请稍后重试。";
const CONFIGURATION_ERROR_MESSAGE: &str = "抱歉，当前服务暂不可用。";

/// One observable step of a streaming turn, matching spec.md §4.7's
/// `{text, isFirst, isFinal, firstResponseMs?}` shape.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    pub text: String,
    pub is_first: bool,
    pub is_final: bool,
    pub first_response_ms: Option<i64>,
}

/// Wires session resolution, tier→channel routing, and the streaming
/// scheduler into the two user-facing verbs: chat and regenerate.
///
/// `active_operations` mirrors the teacher's `AppState::active_operations`:
/// one `CancellationToken` per in-flight turn, keyed by user id, dropped
/// (not explicitly cancelled) on normal completion. Nothing in this crate
/// cancels a token yet; the map exists so a future control surface (a
/// `/stop`-style command) can look one up and call `cancel()`.
pub struct ChatOrchestrator {
    sessions: Arc<SessionService>,
    registry: Arc<ChannelRegistry>,
    config: Arc<ConfigResolver>,
    active_operations: DashMap<String, CancellationToken>,
}

impl ChatOrchestrator {
    pub fn new(sessions: Arc<SessionService>, registry: Arc<ChannelRegistry>, config: Arc<ConfigResolver>) -> Self {
        Self {
            sessions,
            registry,
            config,
            active_operations: DashMap::new(),
        }
    }

    /// Cancel the in-flight turn for `user_id`, if any. Returns `true` when
    /// a flow was actually found and signalled.
    pub fn cancel(&self, user_id: &str) -> bool {
        match self.active_operations.get(user_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[instrument(skip(self, tx), fields(user_id))]
    pub async fn stream_chat(&self, user_id: &str, user_input: &str, now_ms: i64, tx: mpsc::Sender<StreamUpdate>) -> Result<()> {
        let (session, character) = self.sessions.get_or_create_session(user_id, now_ms).await?;
        self.run_stream(session, character, user_id, user_input, TurnType::Normal, true, tx).await
    }

    #[instrument(skip(self, tx), fields(user_id))]
    pub async fn stream_regenerate(&self, user_id: &str, now_ms: i64, tx: mpsc::Sender<StreamUpdate>) -> Result<()> {
        let (mut session, character) = self.sessions.get_or_create_session(user_id, now_ms).await?;
        let Some(user_input) = self.sessions.rollback_history_to_last_user(&mut session).await? else {
            let _ = tx
                .send(StreamUpdate {
                    text: REGENERATE_EMPTY_HISTORY_MESSAGE.to_string(),
                    is_first: true,
                    is_final: true,
                    first_response_ms: None,
                })
                .await;
            return Ok(());
        };
        self.run_stream(session, character, user_id, &user_input, TurnType::Regenerate, false, tx)
            .await
    }

    /// Non-streaming variant: collect the full stream and return the final text.
    pub async fn chat(&self, user_id: &str, user_input: &str, now_ms: i64) -> Result<String> {
        let (tx, mut rx) = mpsc::channel(64);
        self.stream_chat(user_id, user_input, now_ms, tx).await?;
        let mut last = String::new();
        while let Some(update) = rx.recv().await {
            last = update.text;
        }
        Ok(last)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stream(
        &self,
        mut session: Session,
        character: Character,
        user_id: &str,
        user_input: &str,
        turn_type: TurnType,
        reappend_user: bool,
        tx: mpsc::Sender<StreamUpdate>,
    ) -> Result<()> {
        let pre_generation_history = session.history.clone();

        let tier = self.sessions.get_user_model_tier(user_id).await;
        let channel = match self.registry.resolve(tier).await {
            Ok(c) => c,
            Err(e) => {
                warn!(user_id, error = %e, "channel resolution failed");
                let _ = tx
                    .send(StreamUpdate {
                        text: CONFIGURATION_ERROR_MESSAGE.to_string(),
                        is_first: true,
                        is_final: true,
                        first_response_ms: None,
                    })
                    .await;
                return Ok(());
            }
        };

        let system_instructions = self.config.get_text("system_instructions", "").await;
        let prompt = format!("##系统指令:\n{system_instructions}\n##用户指令:{user_input}");
        let max_tokens = self.config.get_number("ai_max_tokens", DEFAULT_MAX_TOKENS).await as u32;
        let inter_chunk_timeout_ms = self
            .config
            .get_number("ai_stream_inter_chunk_timeout", DEFAULT_INTER_CHUNK_TIMEOUT_MS)
            .await as u64;

        let mut messages = session.history.clone();
        messages.push(Message::user(prompt));

        let req = ChatRequest {
            system: character.system_prompt.clone(),
            messages,
            max_tokens,
        };

        let cancel = CancellationToken::new();
        self.active_operations.insert(user_id.to_string(), cancel.clone());

        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let spawn_cancel = cancel.clone();
        let channel_task = tokio::spawn(async move {
            channel
                .stream_generate(req, inter_chunk_timeout_ms, token_tx, &spawn_cancel)
                .await
        });

        let started = Instant::now();
        let mut scheduler_state = SchedulerState::default();
        let mut saw_any_token = false;

        while let Some(delta) = token_rx.recv().await {
            saw_any_token = true;
            let elapsed_ms = started.elapsed().as_millis() as i64;
            let (next_state, decision) = StreamScheduler::observe(scheduler_state, &delta, elapsed_ms);
            scheduler_state = next_state;
            let Some(decision) = decision else { continue };
            let first_response_ms = decision.is_first.then_some(elapsed_ms);
            if tx
                .send(StreamUpdate {
                    text: decision.text,
                    is_first: decision.is_first,
                    is_final: false,
                    first_response_ms,
                })
                .await
                .is_err()
            {
                channel_task.abort();
                self.active_operations.remove(user_id);
                return Ok(());
            }
        }

        let trace_result = channel_task.await;
        self.active_operations.remove(user_id);

        if !saw_any_token {
            let reason = match trace_result {
                Ok(Err(turnstile_pipeline::PipelineError::Cancelled)) => {
                    return Ok(());
                }
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(_)) => "empty upstream response".to_string(),
                Err(e) => e.to_string(),
            };
            warn!(user_id, error = %reason, "stream produced no tokens");
            let _ = tx
                .send(StreamUpdate {
                    text: UPSTREAM_EXHAUSTED_MESSAGE.to_string(),
                    is_first: true,
                    is_final: true,
                    first_response_ms: None,
                })
                .await;
            return Ok(());
        }

        let (final_state, final_decision) = StreamScheduler::finish(scheduler_state);
        let accumulated = final_state.accumulated().to_string();
        let final_text = final_decision.map(|d| d.text).unwrap_or_else(|| accumulated.clone());
        let _ = tx
            .send(StreamUpdate {
                text: final_text,
                is_first: false,
                is_final: true,
                first_response_ms: None,
            })
            .await;

        let mut to_append = Vec::new();
        if reappend_user {
            to_append.push(Message::user(user_input));
        }
        to_append.push(Message::assistant(accumulated.clone()));
        self.sessions.append_messages(&mut session, to_append).await;

        let trace = match trace_result {
            Ok(Ok(trace)) => trace,
            _ => turnstile_pipeline::Trace::default(),
        };

        self.sessions
            .save_log(MessageLogRecord {
                user_id: user_id.to_string(),
                role_id: session.role_id.clone(),
                user_input: user_input.to_string(),
                bot_reply: accumulated,
                instructions: system_instructions,
                history_at_request: pre_generation_history,
                model_name: trace.model,
                attempt_count: trace.attempt_index,
                turn_type,
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use turnstile_core::{CharacterRepo, ConfigStore, DistributedCache, MessageLogRepo, SessionStore, Snapshot, SnapshotRepo};
    use turnstile_sessions::CharacterLoader;

    #[derive(Default)]
    struct InMemoryStore {
        messages: StdMutex<HashMap<String, Vec<Message>>>,
        current_session: StdMutex<HashMap<String, String>>,
        last_session: StdMutex<HashMap<String, String>>,
        session_data: StdMutex<HashMap<String, serde_json::Value>>,
        last_active: StdMutex<HashMap<String, i64>>,
        logs: StdMutex<Vec<MessageLogRecord>>,
    }

    #[async_trait]
    impl SessionStore for InMemoryStore {
        async fn get_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
            Ok(self.messages.lock().unwrap().get(session_id).cloned().unwrap_or_default())
        }
        async fn set_messages(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
            self.messages.lock().unwrap().insert(session_id.to_string(), messages.to_vec());
            Ok(())
        }
        async fn append_message(&self, session_id: &str, message: &Message, _max: u32, _retention: u32) -> anyhow::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .entry(session_id.to_string())
                .or_default()
                .push(message.clone());
            Ok(())
        }
        async fn get_current_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.current_session.lock().unwrap().get(user_id).cloned())
        }
        async fn set_current_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
            self.current_session.lock().unwrap().insert(user_id.to_string(), session_id.to_string());
            Ok(())
        }
        async fn get_last_session_id(&self, user_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.last_session.lock().unwrap().get(user_id).cloned())
        }
        async fn set_last_session_id(&self, user_id: &str, session_id: &str) -> anyhow::Result<()> {
            self.last_session.lock().unwrap().insert(user_id.to_string(), session_id.to_string());
            Ok(())
        }
        async fn get_session_data(&self, session_id: &str) -> anyhow::Result<Option<serde_json::Value>> {
            Ok(self.session_data.lock().unwrap().get(session_id).cloned())
        }
        async fn set_session_data(&self, session_id: &str, data: serde_json::Value) -> anyhow::Result<()> {
            self.session_data.lock().unwrap().insert(session_id.to_string(), data);
            Ok(())
        }
        async fn get_user_model_mode(&self, _user_id: &str) -> anyhow::Result<turnstile_core::ModelTier> {
            Ok(turnstile_core::ModelTier::default())
        }
        async fn set_user_model_mode(&self, _user_id: &str, _tier: turnstile_core::ModelTier) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_last_active_time(&self, user_id: &str) -> anyhow::Result<Option<i64>> {
            Ok(self.last_active.lock().unwrap().get(user_id).copied())
        }
        async fn set_last_active_time(&self, user_id: &str, now_ms: i64) -> anyhow::Result<()> {
            self.last_active.lock().unwrap().insert(user_id.to_string(), now_ms);
            Ok(())
        }
    }

    #[async_trait]
    impl MessageLogRepo for InMemoryStore {
        async fn save(&self, record: MessageLogRecord) -> anyhow::Result<()> {
            self.logs.lock().unwrap().push(record);
            Ok(())
        }
    }

    #[async_trait]
    impl SnapshotRepo for InMemoryStore {
        async fn create(&self, _snapshot: Snapshot) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get(&self, _snapshot_id: &str) -> anyhow::Result<Option<Snapshot>> {
            Ok(None)
        }
        async fn list_for_user(&self, _user_id: &str) -> anyhow::Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl CharacterRepo for InMemoryStore {
        async fn get_character(&self, _role_id: &str) -> anyhow::Result<Option<Character>> {
            Ok(None)
        }
    }

    struct EmptyConfigStore;
    #[async_trait]
    impl ConfigStore for EmptyConfigStore {
        async fn get_config(&self, _key: &str) -> std::result::Result<Option<serde_json::Value>, String> {
            Ok(None)
        }
    }

    struct EmptyCache;
    #[async_trait]
    impl DistributedCache for EmptyCache {
        async fn get(&self, _key: &str) -> Option<serde_json::Value> {
            None
        }
        async fn set_with_ttl(&self, _key: &str, _value: serde_json::Value, _ttl_secs: i64) {}
    }

    fn build_orchestrator(store: Arc<InMemoryStore>) -> ChatOrchestrator {
        let config = Arc::new(ConfigResolver::new(Arc::new(EmptyCache), Arc::new(EmptyConfigStore)));
        let characters = CharacterLoader::new(store.clone(), std::env::temp_dir(), "default".to_string());
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            config.clone(),
            characters,
            "default".to_string(),
        ));
        // No channels configured: any tier resolution fails with ConfigurationError.
        let registry = Arc::new(ChannelRegistry::new(
            config.clone(),
            Arc::new(turnstile_upstream::UpstreamClient::new()),
            turnstile_core::AiConfigSource {
                channels: HashMap::new(),
                tier_mapping: HashMap::new(),
            },
        ));
        ChatOrchestrator::new(sessions, registry, config)
    }

    #[tokio::test]
    async fn regenerate_on_empty_history_yields_fixed_message_without_mutation() {
        let store = Arc::new(InMemoryStore::default());
        let orchestrator = build_orchestrator(store.clone());

        let (tx, mut rx) = mpsc::channel(8);
        orchestrator.stream_regenerate("u1", 1_000, tx).await.unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.text, REGENERATE_EMPTY_HISTORY_MESSAGE);
        assert!(update.is_first && update.is_final);
        assert!(rx.recv().await.is_none());
        assert!(store.logs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_with_unconfigured_tier_yields_configuration_error() {
        let store = Arc::new(InMemoryStore::default());
        let orchestrator = build_orchestrator(store.clone());

        let (tx, mut rx) = mpsc::channel(8);
        orchestrator.stream_chat("u1", "hello", 1_000, tx).await.unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.text, CONFIGURATION_ERROR_MESSAGE);
        assert!(update.is_final);
        assert!(store.logs.lock().unwrap().is_empty());
        // No history mutation: the session remains empty.
        assert!(store.messages.lock().unwrap().values().all(|v| v.is_empty()));
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use turnstile_upstream::{ChatRequest, StreamEvent, UpstreamDispatch};

use crate::error::{PipelineError, Result};

/// Identifies which profile ultimately produced (or last attempted) a
/// stream, for logging and for `MessageLogRecord`'s `attempt_count`/`model_name`.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub attempt_index: u32,
    pub model: String,
    pub provider: String,
}

/// An ordered list of upstream profiles attempted in turn with failover.
/// Mirrors spec.md §4.5: TTFT governs failover, everything after the first
/// token is truncate-don't-fail.
pub struct PipelineChannel {
    slots: Vec<Arc<dyn UpstreamDispatch>>,
}

impl PipelineChannel {
    pub fn new(slots: Vec<Arc<dyn UpstreamDispatch>>) -> Self {
        assert!(!slots.is_empty(), "PipelineChannel requires at least one profile");
        Self { slots }
    }

    /// Stream tokens onto `tx`, forwarding text fragments as they arrive.
    /// Returns the trace of whichever slot the stream ultimately ran on.
    /// `tx` closing early (caller dropped the receiver) ends the attempt
    /// without error.
    pub async fn stream_generate(
        &self,
        req: ChatRequest,
        inter_chunk_timeout_ms: u64,
        tx: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Trace> {
        let mut last_err: Option<String> = None;

        for (slot_idx, slot) in self.slots.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let profile = slot.profile().clone();
            let attempt_index = slot_idx as u32 + 1;
            let trace = Trace {
                attempt_index,
                model: profile.model.clone(),
                provider: profile.provider.clone(),
            };

            let (etx, mut erx) = mpsc::channel::<StreamEvent>(32);
            let total_deadline = Instant::now() + Duration::from_millis(profile.total_timeout_ms);
            let ttft = Duration::from_millis(profile.firstchunk_timeout_ms);

            let slot_handle = slot.clone();
            let req_clone = req.clone();
            let join = tokio::spawn(async move { slot_handle.stream(&req_clone, etx).await });

            let first = tokio::select! {
                _ = cancel.cancelled() => {
                    join.abort();
                    return Err(PipelineError::Cancelled);
                }
                result = timeout(ttft, erx.recv()) => match result {
                    Err(_) => {
                        warn!(provider = %profile.provider, model = %profile.model, "TTFT exceeded, failing over");
                        join.abort();
                        last_err = Some(format!("{}: TTFT exceeded", profile.provider));
                        continue;
                    }
                    Ok(None) => {
                        let reason = match join.await {
                            Ok(Err(e)) => e.to_string(),
                            Ok(Ok(())) => "stream closed before any token".to_string(),
                            Err(e) => e.to_string(),
                        };
                        warn!(provider = %profile.provider, reason = %reason, "no token before stream ended, failing over");
                        last_err = Some(reason);
                        continue;
                    }
                    Ok(Some(StreamEvent::Error { message })) => {
                        warn!(provider = %profile.provider, error = %message, "upstream error before any token, failing over");
                        join.abort();
                        last_err = Some(message);
                        continue;
                    }
                    Ok(Some(StreamEvent::Done { .. })) => {
                        info!(provider = %profile.provider, attempt_index, "stream ended with no tokens");
                        return Ok(trace);
                    }
                    Ok(Some(StreamEvent::TextDelta { text })) => text,
                },
            };

            if tx.send(first).await.is_err() {
                join.abort();
                return Ok(trace);
            }

            // TTFT met: switch to inter-chunk policing plus the overall deadline.
            loop {
                let remaining_total = total_deadline.saturating_duration_since(Instant::now());
                if remaining_total.is_zero() {
                    info!(provider = %profile.provider, attempt_index, "total timeout reached, truncating");
                    join.abort();
                    return Ok(trace);
                }
                let wait = Duration::from_millis(inter_chunk_timeout_ms).min(remaining_total);

                tokio::select! {
                    _ = cancel.cancelled() => {
                        join.abort();
                        return Ok(trace);
                    }
                    result = timeout(wait, erx.recv()) => match result {
                        Err(_) => {
                            info!(provider = %profile.provider, attempt_index, "inter-chunk timeout, truncating");
                            join.abort();
                            return Ok(trace);
                        }
                        Ok(None) => return Ok(trace),
                        Ok(Some(StreamEvent::TextDelta { text })) => {
                            if tx.send(text).await.is_err() {
                                join.abort();
                                return Ok(trace);
                            }
                        }
                        Ok(Some(StreamEvent::Done { .. })) => return Ok(trace),
                        Ok(Some(StreamEvent::Error { message })) => {
                            warn!(provider = %profile.provider, error = %message, "upstream error mid-stream, truncating");
                            return Ok(trace);
                        }
                    },
                }
            }
        }

        Err(PipelineError::UpstreamExhausted(
            last_err.unwrap_or_else(|| "no profiles configured".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use turnstile_core::Profile;
    use turnstile_upstream::error::Result as UpstreamResult;
    use turnstile_upstream::UpstreamError;

    fn profile(id: &str, ttft_ms: u64) -> Profile {
        Profile {
            id: id.to_string(),
            provider: id.to_string(),
            url: "https://example.invalid".to_string(),
            key: "sk-test".to_string(),
            model: format!("{id}-model"),
            firstchunk_timeout_ms: ttft_ms,
            total_timeout_ms: 5000,
        }
    }

    fn dummy_request() -> ChatRequest {
        ChatRequest {
            system: "s".to_string(),
            messages: vec![],
            max_tokens: 64,
        }
    }

    struct SlowThenNothing {
        profile: Profile,
        delay_ms: u64,
    }

    #[async_trait]
    impl UpstreamDispatch for SlowThenNothing {
        fn profile(&self) -> &Profile {
            &self.profile
        }
        async fn stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> UpstreamResult<()> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            let _ = tx
                .send(StreamEvent::TextDelta { text: "too-late".to_string() })
                .await;
            Ok(())
        }
    }

    struct InstantReply {
        profile: Profile,
        text: String,
    }

    #[async_trait]
    impl UpstreamDispatch for InstantReply {
        fn profile(&self) -> &Profile {
            &self.profile
        }
        async fn stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> UpstreamResult<()> {
            let _ = tx
                .send(StreamEvent::TextDelta { text: self.text.clone() })
                .await;
            let _ = tx
                .send(StreamEvent::Done {
                    model: self.profile.model.clone(),
                    tokens_in: 1,
                    tokens_out: 1,
                    stop_reason: "stop".to_string(),
                })
                .await;
            Ok(())
        }
    }

    struct AlwaysErrors {
        profile: Profile,
    }

    #[async_trait]
    impl UpstreamDispatch for AlwaysErrors {
        fn profile(&self) -> &Profile {
            &self.profile
        }
        async fn stream(&self, _req: &ChatRequest, _tx: mpsc::Sender<StreamEvent>) -> UpstreamResult<()> {
            Err(UpstreamError::Api {
                status: 500,
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn fails_over_to_second_profile_on_ttft_timeout() {
        let channel = PipelineChannel::new(vec![
            Arc::new(SlowThenNothing {
                profile: profile("a", 50),
                delay_ms: 300,
            }),
            Arc::new(InstantReply {
                profile: profile("b", 1000),
                text: "SuccessData".to_string(),
            }),
        ]);

        let (tx, mut rx) = mpsc::channel(8);
        let trace = channel
            .stream_generate(dummy_request(), 2000, tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }

        assert_eq!(collected, "SuccessData");
        assert_eq!(trace.attempt_index, 2);
        assert_eq!(trace.provider, "b");
    }

    #[tokio::test]
    async fn exhausts_and_errors_when_all_profiles_fail() {
        let channel = PipelineChannel::new(vec![
            Arc::new(AlwaysErrors { profile: profile("a", 100) }),
            Arc::new(AlwaysErrors { profile: profile("b", 100) }),
        ]);

        let (tx, _rx) = mpsc::channel(8);
        let result = channel
            .stream_generate(dummy_request(), 2000, tx, &CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    struct StaggeredThenSilent {
        profile: Profile,
    }

    #[async_trait]
    impl UpstreamDispatch for StaggeredThenSilent {
        fn profile(&self) -> &Profile {
            &self.profile
        }
        async fn stream(&self, _req: &ChatRequest, tx: mpsc::Sender<StreamEvent>) -> UpstreamResult<()> {
            let _ = tx.send(StreamEvent::TextDelta { text: "One".to_string() }).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(StreamEvent::TextDelta { text: "Two".to_string() }).await;
            tokio::time::sleep(Duration::from_millis(400)).await;
            let _ = tx
                .send(StreamEvent::TextDelta { text: "never-seen".to_string() })
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn inter_chunk_silence_after_ttft_truncates_without_failover_or_error() {
        let channel = PipelineChannel::new(vec![
            Arc::new(StaggeredThenSilent { profile: profile("a", 1000) }),
            Arc::new(InstantReply {
                profile: profile("b", 1000),
                text: "should-not-run".to_string(),
            }),
        ]);

        let (tx, mut rx) = mpsc::channel(8);
        let trace = channel
            .stream_generate(dummy_request(), 200, tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }

        assert_eq!(collected, "OneTwo");
        assert_eq!(trace.attempt_index, 1);
        assert_eq!(trace.provider, "a");
    }

    #[tokio::test]
    async fn cancellation_before_first_token_is_reported_as_cancelled() {
        let channel = PipelineChannel::new(vec![Arc::new(SlowThenNothing {
            profile: profile("a", 5000),
            delay_ms: 5000,
        })]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, _rx) = mpsc::channel(8);
        let result = channel.stream_generate(dummy_request(), 2000, tx, &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}

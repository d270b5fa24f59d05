use std::sync::Arc;

use turnstile_core::{AiConfigSource, ConfigResolver, ModelTier};
use turnstile_upstream::{ProfileDispatcher, UpstreamClient, UpstreamDispatch};

use crate::channel::PipelineChannel;
use crate::error::{PipelineError, Result};

/// Resolves a user's model tier to a [`PipelineChannel`] via the runtime
/// `ai_config_source` document, falling back to a static default when the
/// system of record and distributed cache both miss.
pub struct ChannelRegistry {
    config: Arc<ConfigResolver>,
    client: Arc<UpstreamClient>,
    static_fallback: AiConfigSource,
}

impl ChannelRegistry {
    pub fn new(config: Arc<ConfigResolver>, client: Arc<UpstreamClient>, static_fallback: AiConfigSource) -> Self {
        Self {
            config,
            client,
            static_fallback,
        }
    }

    pub async fn resolve(&self, tier: ModelTier) -> Result<PipelineChannel> {
        let source = self.config.get_ai_config_source(self.static_fallback.clone()).await;

        let channel_id = source
            .tier_mapping
            .get(&tier)
            .cloned()
            .ok_or_else(|| PipelineError::ConfigurationError { tier: tier.to_string() })?;

        let profiles = source
            .channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| PipelineError::EmptyChannel { channel_id: channel_id.clone() })?;

        if profiles.is_empty() {
            return Err(PipelineError::EmptyChannel { channel_id });
        }

        let slots: Vec<Arc<dyn UpstreamDispatch>> = profiles
            .into_iter()
            .map(|p| Arc::new(ProfileDispatcher::new(self.client.clone(), p)) as Arc<dyn UpstreamDispatch>)
            .collect();

        Ok(PipelineChannel::new(slots))
    }
}

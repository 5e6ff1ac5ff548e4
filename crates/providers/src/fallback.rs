//! Provider cascade: ordered failover with per-attempt timeouts.
//!
//! Each entry names a backend and, optionally, the model to ask it for.
//! The first entry that answers wins; errors and timeouts move on to the
//! next one. When every entry fails the last error is returned.

use async_trait::async_trait;
use opsclaw_core::error::ProviderError;
use opsclaw_core::provider::{ModelCapabilities, Provider, ProviderRequest, ProviderResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name the cascade registers under in the router.
pub const CASCADE_PROVIDER: &str = "cascade";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A provider that tries an ordered list of providers until one succeeds.
pub struct FallbackProvider {
    name: String,
    chain: Vec<FallbackEntry>,
}

struct FallbackEntry {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    timeout: Duration,
}

impl FallbackEntry {
    fn label(&self, request: &ProviderRequest) -> String {
        format!(
            "{}/{}",
            self.provider.name(),
            self.model.as_deref().unwrap_or(&request.model)
        )
    }
}

impl FallbackProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
        }
    }

    /// Append `provider`, keeping the request's model.
    pub fn add(self, provider: Arc<dyn Provider>, timeout: Duration) -> Self {
        self.add_entry(provider, None, timeout)
    }

    /// Append `provider` with the default timeout (120s).
    pub fn add_default(self, provider: Arc<dyn Provider>) -> Self {
        self.add(provider, DEFAULT_TIMEOUT)
    }

    /// Append `provider`, asking it for `model` when set.
    pub fn add_entry(mut self, provider: Arc<dyn Provider>, model: Option<String>, timeout: Duration) -> Self {
        self.chain.push(FallbackEntry {
            provider,
            model,
            timeout,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[async_trait]
impl Provider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self, model: &str) -> ModelCapabilities {
        match self.chain.first() {
            Some(entry) => entry
                .provider
                .capabilities(entry.model.as_deref().unwrap_or(model)),
            None => ModelCapabilities::default(),
        }
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut last_error = ProviderError::NotConfigured("No providers in fallback chain".into());

        for (i, entry) in self.chain.iter().enumerate() {
            let label = entry.label(&request);
            let mut attempt = request.clone();
            if let Some(model) = &entry.model {
                attempt.model = model.clone();
            }

            info!(
                backend = %label,
                attempt = i + 1,
                total = self.chain.len(),
                "Cascade: trying provider"
            );

            match tokio::time::timeout(entry.timeout, entry.provider.complete(attempt)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    warn!(backend = %label, error = %e, "Cascade: provider failed, trying next");
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        backend = %label,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "Cascade: provider timed out, trying next"
                    );
                    last_error = ProviderError::Timeout(format!(
                        "'{label}' did not answer within {}ms",
                        entry.timeout.as_millis()
                    ));
                }
            }
        }

        Err(last_error)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        for entry in &self.chain {
            if let Ok(true) = entry.provider.health_check().await {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use opsclaw_core::message::Message;

    struct HangingProvider;

    #[async_trait]
    impl Provider for HangingProvider {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ProviderError::Network("unreachable".into()))
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest::new("gpt-4o", vec![Message::user("restart web-01")])
    }

    fn failing(name: &str, error: ProviderError) -> Arc<MockProvider> {
        let mock = MockProvider::new().with_name(name);
        mock.push_error(error);
        Arc::new(mock)
    }

    #[tokio::test]
    async fn first_provider_answers() {
        let primary = Arc::new(MockProvider::scripted(vec![MockProvider::text("primary")]));
        let secondary = Arc::new(MockProvider::new());

        let cascade = FallbackProvider::new(CASCADE_PROVIDER)
            .add_default(primary.clone())
            .add_default(secondary.clone());

        let response = cascade.complete(request()).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("primary"));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn scripted_error_falls_through_to_next() {
        let primary = failing(
            "azure",
            ProviderError::ApiError {
                status_code: 500,
                message: "Internal Server Error".into(),
            },
        );
        let secondary = Arc::new(MockProvider::scripted(vec![MockProvider::text("from openai")]));

        let cascade = FallbackProvider::new(CASCADE_PROVIDER)
            .add_default(primary.clone())
            .add_entry(secondary.clone(), Some("gpt-4o-mini".into()), DEFAULT_TIMEOUT);

        let response = cascade.complete(request()).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("from openai"));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(primary.call_history()[0].model, "gpt-4o");
        assert_eq!(secondary.call_history()[0].model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn every_failure_returns_last_error() {
        let cascade = FallbackProvider::new(CASCADE_PROVIDER)
            .add_default(failing("a", ProviderError::Network("conn refused".into())))
            .add_default(failing("b", ProviderError::AuthenticationFailed("bad key".into())));

        match cascade.complete(request()).await {
            Err(ProviderError::AuthenticationFailed(_)) => {}
            other => panic!("expected AuthenticationFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_moves_on() {
        let secondary = Arc::new(MockProvider::new());
        let cascade = FallbackProvider::new(CASCADE_PROVIDER)
            .add(Arc::new(HangingProvider), Duration::from_millis(50))
            .add_default(secondary.clone());

        let response = cascade.complete(request()).await.unwrap();
        assert!(response.content.is_some());
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_chain_is_not_configured() {
        let cascade = FallbackProvider::new("empty");
        assert!(cascade.is_empty());
        assert!(matches!(
            cascade.complete(request()).await,
            Err(ProviderError::NotConfigured(_))
        ));
    }
}

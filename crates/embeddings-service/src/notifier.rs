//! Best-effort push of index configs to the search service.

use std::time::Duration;

use tracing::{debug, warn};

use embeddings_types::ApplicationIndexConfig;

/// Default timeout for a push.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts index configs to `{base_url}/internal/index/config/{applicationId}`.
#[derive(Debug, Clone)]
pub struct SearchNotifier {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl SearchNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url_for(&self, application_id: &str) -> String {
        format!("{}/internal/index/config/{}", self.base_url, application_id)
    }

    /// Push `config`. Failures are logged and swallowed.
    pub async fn push_index_config(&self, config: &ApplicationIndexConfig) {
        let url = self.url_for(&config.application_id);
        let result = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(config)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => debug!(application_id = %config.application_id, "Pushed index config"),
            Err(e) => warn!(url = %url, error = %e, "Failed to push index config to search"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> ApplicationIndexConfig {
        ApplicationIndexConfig::new("shop", "cluster-a", Vec::new())
    }

    #[tokio::test]
    async fn test_push_posts_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/index/config/shop"))
            .and(body_partial_json(serde_json::json!({"applicationId": "shop"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = SearchNotifier::new(format!("{}/", server.uri()), DEFAULT_PUSH_TIMEOUT);
        notifier.push_index_config(&config()).await;
    }

    #[tokio::test]
    async fn test_push_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = SearchNotifier::new(server.uri(), DEFAULT_PUSH_TIMEOUT);
        notifier.push_index_config(&config()).await;

        let unreachable = SearchNotifier::new("http://127.0.0.1:9", Duration::from_millis(200));
        unreachable.push_index_config(&config()).await;
    }
}

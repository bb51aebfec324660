//! Common test utilities and fixtures

use std::sync::Arc;
use std::time::Duration;

use openrouter_gateway::{AppState, Settings, create_router};
use openrouter_gateway::storage::MemoryKeyStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Settings builder for tests.
pub struct TestSettingsBuilder {
    settings: Settings,
}

impl TestSettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    pub fn with_upstream(mut self, base_url: &str) -> Self {
        self.settings.chat_url = format!("{base_url}/api/v1/chat/completions");
        self.settings.models_url = format!("{base_url}/api/v1/models");
        self
    }

    pub fn with_keys(mut self, spec: impl Into<String>) -> Self {
        self.settings.openrouter_api_keys = spec.into();
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.settings.retry_with_new_key_count = count;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout = timeout;
        self
    }

    pub fn with_app_api_key(mut self, key: impl Into<String>) -> Self {
        self.settings.app_api_key = Some(key.into());
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.settings.admin_token = Some(token.into());
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for TestSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A gateway instance listening on an ephemeral local port, backed by an
/// in-memory key store.
pub struct TestGateway {
    pub base_url: String,
    pub state: Arc<AppState>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn spawn(settings: Settings) -> Self {
        let store = Arc::new(MemoryKeyStore::new());
        let state = Arc::new(
            AppState::with_store(settings, store)
                .await
                .expect("failed to build test state"),
        );

        let app = create_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("missing local addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("test server failed");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

use std::sync::Arc;

use crate::{
    models::{EffectiveFeatureValue, FeatureConfiguration, FeatureValue},
    retry::RetryPolicy,
    store::ExternalStateStore,
    update_strategies::UpdateStrategyOptions,
    BrowserClient, Result, ServerClient,
};

/// Base URLs of the FeatureBoard service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL of the HTTP API.
    pub http: String,
    /// Address of the live (WebSocket) endpoint.
    pub ws: String,
}

impl ApiConfig {
    pub const DEFAULT_HTTP: &'static str = "https://client.featureboard.app";
    pub const DEFAULT_WS: &'static str = "wss://client-ws.featureboard.app";

    pub fn new(http: impl Into<String>, ws: impl Into<String>) -> ApiConfig {
        ApiConfig {
            http: http.into(),
            ws: ws.into(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> ApiConfig {
        ApiConfig::new(ApiConfig::DEFAULT_HTTP, ApiConfig::DEFAULT_WS)
    }
}

/// Configuration for [`BrowserClient`].
pub struct BrowserClientOptions {
    pub(crate) environment_api_key: String,
    pub(crate) api: ApiConfig,
    pub(crate) audiences: Vec<String>,
    pub(crate) initial_values: Vec<EffectiveFeatureValue>,
    pub(crate) update_strategy: Option<UpdateStrategyOptions>,
    pub(crate) external_state_store: Option<Arc<dyn ExternalStateStore<FeatureValue>>>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) debug: bool,
    pub(crate) disable_tracing: bool,
}

impl BrowserClientOptions {
    /// Default options for the environment identified by `environment_api_key`.
    ///
    /// ```
    /// # use featureboard::BrowserClientOptions;
    /// BrowserClientOptions::from_api_key("env-api-key").audiences(["plan-pro"]);
    /// ```
    pub fn from_api_key(environment_api_key: impl Into<String>) -> Self {
        BrowserClientOptions {
            environment_api_key: environment_api_key.into(),
            api: ApiConfig::default(),
            audiences: Vec::new(),
            initial_values: Vec::new(),
            update_strategy: None,
            external_state_store: None,
            retry_policy: RetryPolicy::default(),
            debug: false,
            disable_tracing: false,
        }
    }

    /// Override the service URLs. Clients should use the defaults in most cases.
    pub fn api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    /// Audiences the values are resolved for until [`BrowserClient::update_audiences`] is called.
    pub fn audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    /// Values served until the first fetch completes.
    pub fn initial_values(mut self, initial_values: Vec<EffectiveFeatureValue>) -> Self {
        self.initial_values = initial_values;
        self
    }

    /// Defaults to polling.
    pub fn update_strategy(mut self, update_strategy: impl Into<UpdateStrategyOptions>) -> Self {
        self.update_strategy = Some(update_strategy.into());
        self
    }

    pub fn external_state_store(
        mut self,
        store: impl ExternalStateStore<FeatureValue> + 'static,
    ) -> Self {
        self.external_state_store = Some(Arc::new(store));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Trace every store read and write.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Stop emitting `tracing` spans for initialization, fetches and audience changes.
    pub fn disable_tracing(mut self, disable_tracing: bool) -> Self {
        self.disable_tracing = disable_tracing;
        self
    }

    /// Create a [`BrowserClient`] and start initializing it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn to_client(self) -> Result<BrowserClient> {
        BrowserClient::new(self)
    }
}

/// Configuration for [`ServerClient`].
pub struct ServerClientOptions {
    pub(crate) environment_api_key: String,
    pub(crate) api: ApiConfig,
    pub(crate) update_strategy: Option<UpdateStrategyOptions>,
    pub(crate) external_state_store: Option<Arc<dyn ExternalStateStore<FeatureConfiguration>>>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) debug: bool,
    pub(crate) disable_tracing: bool,
}

impl ServerClientOptions {
    /// ```
    /// # use featureboard::ServerClientOptions;
    /// ServerClientOptions::from_api_key("env-api-key");
    /// ```
    pub fn from_api_key(environment_api_key: impl Into<String>) -> Self {
        ServerClientOptions {
            environment_api_key: environment_api_key.into(),
            api: ApiConfig::default(),
            update_strategy: None,
            external_state_store: None,
            retry_policy: RetryPolicy::default(),
            debug: false,
            disable_tracing: false,
        }
    }

    pub fn api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    /// Defaults to live.
    pub fn update_strategy(mut self, update_strategy: impl Into<UpdateStrategyOptions>) -> Self {
        self.update_strategy = Some(update_strategy.into());
        self
    }

    /// Used as a fallback whenever the service cannot be reached during initialization.
    pub fn external_state_store(
        mut self,
        store: impl ExternalStateStore<FeatureConfiguration> + 'static,
    ) -> Self {
        self.external_state_store = Some(Arc::new(store));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn disable_tracing(mut self, disable_tracing: bool) -> Self {
        self.disable_tracing = disable_tracing;
        self
    }

    /// Create a [`ServerClient`] and start initializing it in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn to_client(self) -> Result<ServerClient> {
        ServerClient::new(self)
    }
}

//! Policies for keeping a store in sync with the service.
//!
//! Every strategy implements [`UpdateStrategy`]. The pull strategies ([`ManualUpdateStrategy`],
//! [`PollingUpdateStrategy`], [`OnRequestUpdateStrategy`]) run the conditional fetch protocol;
//! [`LiveUpdateStrategy`] subscribes to pushed updates and pulls only to bootstrap.
mod live;
mod manual;
mod on_request;
mod polling;

use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};

use crate::{
    config::ApiConfig,
    fetcher::{CachedResponse, FeatureFetcher, FetchOutcome},
    live_connection::LiveOptions,
    single_flight::{SingleFlight, SingleFlightWithBackoff},
    store::FeatureState,
    telemetry::Telemetry,
    Error, Result,
};

pub use live::LiveUpdateStrategy;
pub use manual::ManualUpdateStrategy;
pub use on_request::OnRequestUpdateStrategy;
pub use polling::PollingUpdateStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait UpdateStrategy<S: FeatureState>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Initial sync of `store`, then arm whatever keeps it fresh.
    async fn connect(&self, store: Arc<S>) -> Result<()>;

    /// Force a refresh. A no-op before `connect`.
    async fn update_features(&self) -> Result<()>;

    async fn close(&self);

    /// Hook run before serving a request. `None` when the strategy has nothing to do per request.
    fn on_request(&self) -> Option<BoxFuture<'static, Result<()>>> {
        None
    }

    fn state(&self) -> StrategyState;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingOptions {
    pub interval: Duration,
    /// Each wait is extended by a random amount up to `jitter`.
    pub jitter: Duration,
}

impl PollingOptions {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }
}

impl Default for PollingOptions {
    fn default() -> Self {
        PollingOptions {
            interval: PollingOptions::DEFAULT_INTERVAL,
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnRequestOptions {
    /// How long fetched values are served before the next request refreshes them.
    pub max_age: Duration,
}

impl OnRequestOptions {
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}

impl Default for OnRequestOptions {
    fn default() -> Self {
        OnRequestOptions {
            max_age: OnRequestOptions::DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdateStrategyOptions {
    Manual,
    Polling(PollingOptions),
    OnRequest(OnRequestOptions),
    Live(LiveOptions),
}

impl UpdateStrategyOptions {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateStrategyOptions::Manual => "manual",
            UpdateStrategyOptions::Polling(_) => "polling",
            UpdateStrategyOptions::OnRequest(_) => "on-request",
            UpdateStrategyOptions::Live(_) => "live",
        }
    }
}

/// A bare strategy name expands to that strategy with default options.
impl FromStr for UpdateStrategyOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(UpdateStrategyOptions::Manual),
            "polling" => Ok(UpdateStrategyOptions::Polling(PollingOptions::default())),
            "on-request" => Ok(UpdateStrategyOptions::OnRequest(OnRequestOptions::default())),
            "live" => Ok(UpdateStrategyOptions::Live(LiveOptions::default())),
            other => Err(Error::UnknownUpdateStrategy(other.to_owned())),
        }
    }
}

impl From<PollingOptions> for UpdateStrategyOptions {
    fn from(value: PollingOptions) -> Self {
        UpdateStrategyOptions::Polling(value)
    }
}

impl From<OnRequestOptions> for UpdateStrategyOptions {
    fn from(value: OnRequestOptions) -> Self {
        UpdateStrategyOptions::OnRequest(value)
    }
}

impl From<LiveOptions> for UpdateStrategyOptions {
    fn from(value: LiveOptions) -> Self {
        UpdateStrategyOptions::Live(value)
    }
}

/// Build the strategy described by `options`, falling back to `default` when unspecified.
pub(crate) fn resolve_update_strategy<S: FeatureState>(
    options: Option<UpdateStrategyOptions>,
    default: UpdateStrategyOptions,
    api: &ApiConfig,
    environment_api_key: &str,
    telemetry: Telemetry,
) -> Box<dyn UpdateStrategy<S>> {
    let fetcher = Arc::new(
        FeatureFetcher::new(api.http.clone(), environment_api_key)
            .with_tracing(telemetry.is_enabled()),
    );
    match options.unwrap_or(default) {
        UpdateStrategyOptions::Manual => Box::new(ManualUpdateStrategy::new(fetcher)),
        UpdateStrategyOptions::Polling(options) => {
            Box::new(PollingUpdateStrategy::new(fetcher, options))
        }
        UpdateStrategyOptions::OnRequest(options) => {
            Box::new(OnRequestUpdateStrategy::new(fetcher, options))
        }
        UpdateStrategyOptions::Live(options) => Box::new(LiveUpdateStrategy::new(
            fetcher,
            environment_api_key,
            api.ws.clone(),
            options,
        )),
    }
}

enum Guard {
    Plain(SingleFlight<()>),
    WithBackoff(SingleFlightWithBackoff<()>),
}

/// Conditional fetches into one store, coalesced by a single-flight guard.
///
/// The cache token survives for the lifetime of the strategy; the guard is replaced on every
/// `connect` so a new connection never joins a fetch issued for a previous one.
pub(crate) struct FetchState {
    fetcher: Arc<FeatureFetcher>,
    cached: Arc<Mutex<Option<CachedResponse>>>,
    backoff: bool,
    guard: Mutex<Guard>,
}

impl FetchState {
    pub(crate) fn new(fetcher: Arc<FeatureFetcher>) -> Self {
        FetchState {
            fetcher,
            cached: Arc::new(Mutex::new(None)),
            backoff: true,
            guard: Mutex::new(Guard::WithBackoff(SingleFlightWithBackoff::new())),
        }
    }

    /// Coalesce concurrent fetches without remembering rate limits.
    pub(crate) fn without_backoff(fetcher: Arc<FeatureFetcher>) -> Self {
        FetchState {
            backoff: false,
            guard: Mutex::new(Guard::Plain(SingleFlight::new())),
            ..FetchState::new(fetcher)
        }
    }

    pub(crate) fn telemetry(&self) -> Telemetry {
        self.fetcher.telemetry()
    }

    pub(crate) fn reset_guard(&self) {
        let guard = if self.backoff {
            Guard::WithBackoff(SingleFlightWithBackoff::new())
        } else {
            Guard::Plain(SingleFlight::new())
        };
        *self
            .guard
            .lock()
            .expect("thread holding fetch guard lock should not panic") = guard;
    }

    pub(crate) fn refresh<S: FeatureState>(&self, store: Arc<S>) -> BoxFuture<'static, Result<()>> {
        let fetcher = Arc::clone(&self.fetcher);
        let cached = Arc::clone(&self.cached);
        let operation = move || async move {
            let previous = cached
                .lock()
                .expect("thread holding cache token lock should not panic")
                .clone();
            // 304 keeps the token, and a discarded response may have raced a newer fetch.
            if let FetchOutcome::Updated(next) = store.fetch(&fetcher, previous).await? {
                *cached
                    .lock()
                    .expect("thread holding cache token lock should not panic") = next;
            }
            Ok(())
        };

        match &*self
            .guard
            .lock()
            .expect("thread holding fetch guard lock should not panic")
        {
            Guard::Plain(guard) => guard.run(operation).boxed(),
            Guard::WithBackoff(guard) => guard.run(operation),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    /// Serve `/effective` with a single feature `x` set to `value`.
    pub(crate) async fn serve_effective(server: &MockServer, value: &str) {
        Mock::given(method("GET"))
            .and(path("/effective"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"featureKey": "x", "value": value}])),
            )
            .mount(server)
            .await;
    }

    /// Number of requests the server received so far.
    pub(crate) async fn request_count(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or_default()
    }
}

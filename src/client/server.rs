use std::sync::{Arc, Mutex};

use tokio::{runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::{Initialisation, InitialisationState, PendingRequest};
use crate::{
    config::ServerClientOptions,
    live_connection::LiveOptions,
    retry::{retry, RetryPolicy},
    store::{AllFeatureStore, FeatureState},
    telemetry::{add_event, record_error, traced, Telemetry},
    update_strategies::{resolve_update_strategy, UpdateStrategy, UpdateStrategyOptions},
    Error, Result,
};

/// A client for services handling many users. Holds every feature's configuration and resolves
/// values locally for the audiences of each request.
///
/// ```no_run
/// # async fn run() -> featureboard::Result<()> {
/// use featureboard::{FeatureBoardClient, ServerClientOptions};
///
/// let client = ServerClientOptions::from_api_key("env-api-key").to_client()?;
/// client.wait_for_initialised().await?;
///
/// let request = client.request(vec!["plan-pro".to_owned()]).await;
/// let enabled = request.get_boolean_value("new-dashboard", false);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServerClient {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    store: Arc<AllFeatureStore>,
    strategy: Box<dyn UpdateStrategy<AllFeatureStore>>,
    initialisation: Initialisation,
    cancellation: Mutex<CancellationToken>,
    retry_policy: RetryPolicy,
    telemetry: Telemetry,
}

impl ServerClient {
    pub(crate) fn new(options: ServerClientOptions) -> Result<ServerClient> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut store = AllFeatureStore::new().with_debug(options.debug);
        if let Some(external) = options.external_state_store {
            store = store.with_external_state_store(external);
        }
        let telemetry = Telemetry::new(!options.disable_tracing);
        let strategy = resolve_update_strategy(
            options.update_strategy,
            UpdateStrategyOptions::Live(LiveOptions::default()),
            &options.api,
            &options.environment_api_key,
            telemetry,
        );
        log::debug!(target: "featureboard", strategy = strategy.name(); "creating server client");

        let cancellation = CancellationToken::new();
        let inner = Arc::new(ServerInner {
            store: Arc::new(store),
            strategy,
            initialisation: Initialisation::new(),
            cancellation: Mutex::new(cancellation.clone()),
            retry_policy: options.retry_policy,
            telemetry,
        });
        runtime.spawn(Arc::clone(&inner).initialise(cancellation));

        Ok(ServerClient { inner })
    }

    /// Values for a request made on behalf of `audience_keys`.
    ///
    /// With the on-request update strategy the values may need a refresh first, and the returned
    /// [`PendingRequest`] must be awaited before it is read.
    pub fn request(&self, audience_keys: Vec<String>) -> PendingRequest {
        match self.inner.strategy.on_request() {
            Some(refresh) => {
                PendingRequest::refreshing(refresh, Arc::clone(&self.inner.store), audience_keys)
            }
            None => PendingRequest::ready(self.inner.store.request(audience_keys)),
        }
    }

    pub fn initialised(&self) -> bool {
        self.inner.initialisation.is_initialised()
    }

    pub async fn wait_for_initialised(&self) -> Result<()> {
        self.inner.initialisation.wait().await
    }

    pub fn subscribe_to_initialised_changed(&self) -> watch::Receiver<InitialisationState> {
        self.inner.initialisation.subscribe()
    }

    pub async fn update_features(&self) -> Result<()> {
        let span = self
            .inner
            .telemetry
            .span(|| tracing::info_span!("fbsdk-update-features"));
        traced(span, self.inner.strategy.update_features()).await
    }

    pub async fn close(&self) {
        self.inner
            .cancellation
            .lock()
            .expect("thread holding cancellation lock should not panic")
            .cancel();
        self.inner.initialisation.fail_if_pending(Error::Closed);
        self.inner.strategy.close().await;
    }
}

impl ServerInner {
    /// Connect with retries. Every failed attempt falls back to the external state store, and
    /// succeeding there counts as initialized.
    async fn initialise(self: Arc<Self>, cancellation: CancellationToken) {
        let span = self.telemetry.span(|| {
            tracing::info_span!("fbsdk-connect-with-retry", update_strategy = self.strategy.name())
        });
        let result = retry(&self.retry_policy, &cancellation, || {
            self.connect_or_fallback(&span)
        })
        .instrument(span.clone())
        .await;

        if cancellation.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => {
                log::debug!(target: "featureboard", "server client initialised");
                self.initialisation.set(InitialisationState::Initialised);
            }
            Err(err) => {
                log::error!(target: "featureboard", "server client failed to initialise: {err}");
                add_event(&span, "failed to connect after retries");
                self.initialisation.set(InitialisationState::Failed(err));
            }
        }
    }

    async fn connect_or_fallback(&self, span: &Span) -> Result<()> {
        let err = match self.strategy.connect(Arc::clone(&self.store)).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        record_error(span, &err);
        if !self.store.has_external_state_store() {
            return Err(err);
        }

        let external_span = self
            .telemetry
            .span(|| tracing::info_span!("fbsdk-initialise-from-external-store"));
        match traced(external_span, self.store.initialise_from_external_store()).await {
            Ok(true) => {
                log::warn!(target: "featureboard", "failed to connect, initialised from external state store: {err}");
                Ok(())
            }
            Ok(false) => Err(err),
            Err(external_err) => {
                log::warn!(target: "featureboard", "external state store fallback failed: {external_err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        client::FeatureBoardClient,
        config::ApiConfig,
        models::{AudienceExceptionValue, FeatureConfiguration, FeatureValue},
        store::testing::MemoryExternalStore,
        telemetry::testing::SpanRecorder,
        update_strategies::OnRequestOptions,
    };

    fn options(server: &MockServer) -> ServerClientOptions {
        ServerClientOptions::from_api_key("env-key")
            .api(ApiConfig::new(server.uri(), "ws://127.0.0.1:9"))
            .update_strategy(UpdateStrategyOptions::Manual)
            .retry_policy(RetryPolicy::new().with_max_retries(0))
    }

    async fn serve_all(server: &MockServer, default_value: &str) {
        Mock::given(method("GET"))
            .and(path("/all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "featureKey": "banner",
                "defaultValue": default_value,
                "audienceExceptions": [{"audienceKey": "beta", "value": "beta"}]
            }])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn resolves_per_request_audiences() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        serve_all(&server, "default").await;

        let client = options(&server).to_client().unwrap();
        client.wait_for_initialised().await.unwrap();

        let beta = client.request(vec!["beta".into()]);
        assert!(beta.is_ready());
        assert_eq!(
            beta.get_feature_value("banner", "x").unwrap(),
            FeatureValue::from("beta")
        );

        let everyone = client.request(vec![]).await;
        assert_eq!(everyone.get_string_value("banner", "x"), "default");
        assert_eq!(everyone.get_string_value("missing", "x"), "x");
    }

    #[tokio::test]
    async fn on_request_strategy_refreshes_expired_values() {
        let server = MockServer::start().await;
        serve_all(&server, "default").await;

        let client = options(&server)
            .update_strategy(OnRequestOptions::default().with_max_age(Duration::from_millis(1)))
            .to_client()
            .unwrap();
        client.wait_for_initialised().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let pending = client.request(vec![]);
        assert!(matches!(
            pending.get_feature_value("banner", "x"),
            Err(Error::RequestNotAwaited)
        ));
        let request = pending.await;

        assert_eq!(
            request.get_feature_value("banner", "x"),
            FeatureValue::from("default")
        );
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_external_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let external = MemoryExternalStore::new(HashMap::from([(
            "banner".to_owned(),
            FeatureConfiguration {
                feature_key: "banner".into(),
                default_value: "stored".into(),
                audience_exceptions: vec![AudienceExceptionValue {
                    audience_key: "beta".into(),
                    value: "stored-beta".into(),
                }],
            },
        )]));
        let client = options(&server)
            .external_state_store(external)
            .to_client()
            .unwrap();
        client.wait_for_initialised().await.unwrap();

        let request = client.request(vec!["beta".into()]).await;
        assert_eq!(
            request.get_feature_value("banner", "x"),
            FeatureValue::from("stored-beta")
        );
    }

    #[tokio::test]
    async fn fails_when_every_source_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = options(&server)
            .external_state_store(MemoryExternalStore::failing())
            .to_client()
            .unwrap();

        assert!(matches!(
            client.wait_for_initialised().await,
            Err(Error::UnexpectedStatus { status: 500, .. })
        ));
        assert!(!client.initialised());
    }

    #[tokio::test]
    async fn close_stops_initialisation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = options(&server)
            .retry_policy(RetryPolicy::new().with_max_retries(5))
            .to_client()
            .unwrap();
        client.close().await;

        assert!(matches!(
            client.wait_for_initialised().await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn traces_external_store_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (recorder, _guard) = SpanRecorder::install();

        let client = options(&server)
            .external_state_store(MemoryExternalStore::new(HashMap::new()))
            .to_client()
            .unwrap();
        client.wait_for_initialised().await.unwrap();

        assert_eq!(
            recorder.spans(),
            vec![
                "fbsdk-connect-with-retry",
                "fbsdk-fetch-all-values",
                "fbsdk-initialise-from-external-store",
            ]
        );
        assert_eq!(
            recorder.events_in("fbsdk-connect-with-retry"),
            vec!["exception".to_owned()]
        );
    }
}

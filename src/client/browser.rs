use std::sync::{Arc, Mutex};

use tokio::{runtime::Handle, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::{EffectiveClient, Initialisation, InitialisationState};
use crate::{
    config::BrowserClientOptions,
    models::same_audiences,
    retry::{retry, RetryPolicy},
    store::{EffectiveFeatureStore, FeatureState},
    telemetry::{add_event, record_error, traced, Telemetry},
    update_strategies::{
        resolve_update_strategy, PollingOptions, UpdateStrategy, UpdateStrategyOptions,
    },
    Error, Result,
};

/// A client for a single user whose values are resolved by the service for a fixed audience set.
///
/// Initialization runs in the background. Values from [`BrowserClientOptions::initial_values`]
/// (or the external state store) are served until it completes.
///
/// Cheap to clone; clones share the same store and update strategy.
#[derive(Clone)]
pub struct BrowserClient {
    inner: Arc<BrowserInner>,
}

struct BrowserInner {
    store: Arc<EffectiveFeatureStore>,
    strategy: Box<dyn UpdateStrategy<EffectiveFeatureStore>>,
    initialisation: Initialisation,
    /// Cancels the initialization in progress.
    cancellation: Mutex<CancellationToken>,
    retry_policy: RetryPolicy,
    runtime: Handle,
    telemetry: Telemetry,
}

impl BrowserClient {
    pub(crate) fn new(options: BrowserClientOptions) -> Result<BrowserClient> {
        if let Some(UpdateStrategyOptions::OnRequest(_)) = options.update_strategy {
            return Err(Error::UnsupportedUpdateStrategy("on-request"));
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut store = EffectiveFeatureStore::new(options.audiences, options.initial_values)
            .with_debug(options.debug);
        if let Some(external) = options.external_state_store {
            store = store.with_external_state_store(external);
        }
        let telemetry = Telemetry::new(!options.disable_tracing);
        let strategy = resolve_update_strategy(
            options.update_strategy,
            UpdateStrategyOptions::Polling(PollingOptions::default()),
            &options.api,
            &options.environment_api_key,
            telemetry,
        );
        log::debug!(target: "featureboard", strategy = strategy.name(); "creating browser client");

        let inner = Arc::new(BrowserInner {
            store: Arc::new(store),
            strategy,
            initialisation: Initialisation::new(),
            cancellation: Mutex::new(CancellationToken::new()),
            retry_policy: options.retry_policy,
            runtime,
            telemetry,
        });
        inner.start_initialisation(true);

        Ok(BrowserClient { inner })
    }

    /// A read handle over the current values.
    pub fn client(&self) -> EffectiveClient {
        EffectiveClient::new(Arc::clone(&self.inner.store))
    }

    pub fn initialised(&self) -> bool {
        self.inner.initialisation.is_initialised()
    }

    /// Wait until the current initialization settles.
    ///
    /// # Errors
    ///
    /// The last connect error once retries are exhausted, or [`Error::Closed`] if the client was
    /// closed first.
    pub async fn wait_for_initialised(&self) -> Result<()> {
        self.inner.initialisation.wait().await
    }

    pub fn subscribe_to_initialised_changed(&self) -> watch::Receiver<InitialisationState> {
        self.inner.initialisation.subscribe()
    }

    /// Switch to a new audience set and wait for values resolved for it.
    ///
    /// Values for the previous audiences are retracted before any new fetch is issued. Does
    /// nothing when `audiences` holds the same keys as the current set.
    pub async fn update_audiences(&self, audiences: Vec<String>) -> Result<()> {
        let span = self.inner.telemetry.span(|| {
            tracing::info_span!("fbsdk-update-audiences",
                audiences = ?audiences,
                update_strategy = self.inner.strategy.name())
        });
        if same_audiences(&self.inner.store.audiences(), &audiences) {
            log::debug!(target: "featureboard", "audiences unchanged");
            add_event(&span, "skipped update audiences");
            return Ok(());
        }
        log::debug!(target: "featureboard", audiences:? = audiences; "updating audiences");

        traced(span, async {
            self.inner.cancel_initialisation();
            self.inner.strategy.close().await;
            self.inner.store.set_audiences(audiences);
            self.inner.start_initialisation(false);

            self.wait_for_initialised().await
        })
        .await
    }

    /// Refresh values now.
    pub async fn update_features(&self) -> Result<()> {
        let span = self
            .inner
            .telemetry
            .span(|| tracing::info_span!("fbsdk-update-features"));
        traced(span, self.inner.strategy.update_features()).await
    }

    /// Stop all background work. Reads keep returning the last known values.
    pub async fn close(&self) {
        self.inner.cancel_initialisation();
        self.inner.initialisation.fail_if_pending(Error::Closed);
        self.inner.strategy.close().await;
    }
}

impl BrowserInner {
    fn cancel_initialisation(&self) -> CancellationToken {
        let mut cancellation = self
            .cancellation
            .lock()
            .expect("thread holding cancellation lock should not panic");
        cancellation.cancel();
        *cancellation = CancellationToken::new();
        cancellation.clone()
    }

    fn start_initialisation(self: &Arc<Self>, seed_from_external: bool) {
        let cancellation = self.cancel_initialisation();
        self.initialisation.set(InitialisationState::Pending);
        let span = self.telemetry.span(|| {
            tracing::info_span!("fbsdk-connect-with-retry",
                audiences = ?self.store.audiences(),
                update_strategy = self.strategy.name())
        });

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            if seed_from_external && inner.store.has_external_state_store() {
                let seed_span = inner
                    .telemetry
                    .span(|| tracing::info_span!("fbsdk-initialise-from-external-store"));
                match traced(seed_span, inner.store.initialise_from_external_store()).await {
                    Ok(seeded) => {
                        if seeded {
                            log::debug!(target: "featureboard", "seeded values from external state store");
                        }
                    }
                    Err(err) => {
                        log::warn!(target: "featureboard", "failed to read external state store: {err}");
                    }
                }
            }

            let result = retry(&inner.retry_policy, &cancellation, || inner.connect(&span))
                .instrument(span.clone())
                .await;

            if cancellation.is_cancelled() {
                return;
            }
            match result {
                Ok(()) => {
                    log::debug!(target: "featureboard", "browser client initialised");
                    inner.initialisation.set(InitialisationState::Initialised);
                }
                Err(err) => {
                    log::error!(target: "featureboard", "browser client failed to initialise: {err}");
                    add_event(&span, "failed to connect after retries");
                    inner.initialisation.set(InitialisationState::Failed(err));
                }
            }
        });
    }

    /// One connect attempt. A failure is recorded on the surrounding retry span.
    async fn connect(&self, span: &Span) -> Result<()> {
        let result = self.strategy.connect(Arc::clone(&self.store)).await;
        if let Err(err) = &result {
            record_error(span, err);
        }
        result
    }
}

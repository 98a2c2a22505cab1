use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::Instrument;

use super::{FetchState, OnRequestOptions, StrategyState, UpdateStrategy};
use crate::{
    fetcher::FeatureFetcher,
    store::FeatureState,
    telemetry::{add_event, record_error},
    Result,
};

struct Connected<S> {
    store: Arc<S>,
    expiry: Instant,
}

/// Refreshes lazily: a request arriving after the values are older than `max_age` fetches first.
pub struct OnRequestUpdateStrategy<S> {
    fetch: Arc<FetchState>,
    options: OnRequestOptions,
    connection: Arc<Mutex<Option<Connected<S>>>>,
}

impl<S: FeatureState> OnRequestUpdateStrategy<S> {
    pub fn new(fetcher: Arc<FeatureFetcher>, options: OnRequestOptions) -> Self {
        OnRequestUpdateStrategy {
            fetch: Arc::new(FetchState::new(fetcher)),
            options,
            connection: Arc::new(Mutex::new(None)),
        }
    }

    fn store(&self) -> Option<Arc<S>> {
        self.connection
            .lock()
            .expect("thread holding strategy lock should not panic")
            .as_ref()
            .map(|connected| Arc::clone(&connected.store))
    }

    fn set_expiry(&self, expiry: Instant) {
        if let Some(connected) = self
            .connection
            .lock()
            .expect("thread holding strategy lock should not panic")
            .as_mut()
        {
            connected.expiry = expiry;
        }
    }
}

#[async_trait]
impl<S: FeatureState> UpdateStrategy<S> for OnRequestUpdateStrategy<S> {
    fn name(&self) -> &'static str {
        "on-request"
    }

    async fn connect(&self, store: Arc<S>) -> Result<()> {
        self.fetch.reset_guard();
        *self
            .connection
            .lock()
            .expect("thread holding strategy lock should not panic") = Some(Connected {
            store: Arc::clone(&store),
            // Expired until the first fetch succeeds.
            expiry: Instant::now(),
        });

        let started = Instant::now();
        self.fetch.refresh(store).await?;
        self.set_expiry(started + self.options.max_age);
        Ok(())
    }

    async fn update_features(&self) -> Result<()> {
        let Some(store) = self.store() else {
            return Ok(());
        };
        let started = Instant::now();
        self.fetch.refresh(store).await?;
        self.set_expiry(started + self.options.max_age);
        Ok(())
    }

    async fn close(&self) {
        self.connection
            .lock()
            .expect("thread holding strategy lock should not panic")
            .take();
    }

    fn on_request(&self) -> Option<BoxFuture<'static, Result<()>>> {
        let max_age_ms = self.options.max_age.as_millis() as u64;
        let span = self
            .fetch
            .telemetry()
            .span(|| tracing::info_span!("fbsdk-on-request", max_age_ms));
        let store = {
            let connection = self
                .connection
                .lock()
                .expect("thread holding strategy lock should not panic");
            match &*connection {
                Some(connected) if Instant::now() >= connected.expiry => {
                    Arc::clone(&connected.store)
                }
                Some(_) => {
                    add_event(&span, "response not expired");
                    return Some(futures::future::ready(Ok(())).boxed());
                }
                None => return Some(futures::future::ready(Ok(())).boxed()),
            }
        };

        log::debug!(target: "featureboard", "values expired, refreshing before request");
        add_event(&span, "response expired, fetching updates");
        let started = Instant::now();
        let max_age = self.options.max_age;
        let refresh = self.fetch.refresh(store);
        let connection = Arc::clone(&self.connection);
        Some(
            async move {
                match refresh.instrument(span.clone()).await {
                    Ok(()) => {
                        if let Some(connected) = connection
                            .lock()
                            .expect("thread holding strategy lock should not panic")
                            .as_mut()
                        {
                            connected.expiry = started + max_age;
                        }
                        add_event(&span, "successfully updated features");
                    }
                    Err(err) => {
                        log::warn!(target: "featureboard", "failed to refresh features for request: {err}");
                        record_error(&span, &err);
                    }
                }
                Ok(())
            }
            .boxed(),
        )
    }

    fn state(&self) -> StrategyState {
        match self.store() {
            Some(_) => StrategyState::Connected,
            None => StrategyState::Disconnected,
        }
    }
}

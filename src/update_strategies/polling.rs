use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use tokio_util::sync::CancellationToken;

use super::{FetchState, PollingOptions, StrategyState, UpdateStrategy};
use crate::{fetcher::FeatureFetcher, store::FeatureState, Result};

/// Fetches on `connect`, then again every polling interval.
pub struct PollingUpdateStrategy<S> {
    fetch: Arc<FetchState>,
    options: PollingOptions,
    connection: Mutex<Option<(Arc<S>, CancellationToken)>>,
}

impl<S: FeatureState> PollingUpdateStrategy<S> {
    pub fn new(fetcher: Arc<FeatureFetcher>, options: PollingOptions) -> Self {
        PollingUpdateStrategy {
            fetch: Arc::new(FetchState::new(fetcher)),
            options,
            connection: Mutex::new(None),
        }
    }

    fn store(&self) -> Option<Arc<S>> {
        self.connection
            .lock()
            .expect("thread holding strategy lock should not panic")
            .as_ref()
            .map(|(store, _)| Arc::clone(store))
    }

    fn stop(&self) {
        if let Some((_, stop)) = self
            .connection
            .lock()
            .expect("thread holding strategy lock should not panic")
            .take()
        {
            stop.cancel();
        }
    }
}

#[async_trait]
impl<S: FeatureState> UpdateStrategy<S> for PollingUpdateStrategy<S> {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn connect(&self, store: Arc<S>) -> Result<()> {
        self.stop();
        self.fetch.reset_guard();

        let stop = CancellationToken::new();
        *self
            .connection
            .lock()
            .expect("thread holding strategy lock should not panic") =
            Some((Arc::clone(&store), stop.clone()));

        tokio::spawn(poll(
            Arc::clone(&self.fetch),
            Arc::clone(&store),
            self.options.clone(),
            stop,
        ));

        self.fetch.refresh(store).await
    }

    async fn update_features(&self) -> Result<()> {
        match self.store() {
            Some(store) => self.fetch.refresh(store).await,
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.stop();
    }

    fn state(&self) -> StrategyState {
        match self.store() {
            Some(_) => StrategyState::Connected,
            None => StrategyState::Disconnected,
        }
    }
}

async fn poll<S: FeatureState>(
    fetch: Arc<FetchState>,
    store: Arc<S>,
    options: PollingOptions,
    stop: CancellationToken,
) {
    loop {
        let timeout = jitter(options.interval, options.jitter);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = stop.cancelled() => {
                log::debug!(target: "featureboard", "polling stopped");
                return;
            }
        }

        // A failed tick is retried on the next one.
        if let Err(err) = fetch.refresh(Arc::clone(&store)).await {
            log::warn!(target: "featureboard", "failed to update features while polling: {err}");
        }
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        models::FeatureValue,
        store::EffectiveFeatureStore,
        update_strategies::testing::{request_count, serve_effective},
    };

    fn strategy(server: &MockServer, interval: Duration) -> PollingUpdateStrategy<EffectiveFeatureStore> {
        PollingUpdateStrategy::new(
            Arc::new(FeatureFetcher::new(server.uri(), "key")),
            PollingOptions::default().with_interval(interval),
        )
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let interval = Duration::from_secs(30);
        assert_eq!(jitter(interval, Duration::ZERO), interval);
        for _ in 0..100 {
            let value = jitter(interval, Duration::from_secs(3));
            assert!(value >= interval && value < interval + Duration::from_secs(3));
        }
    }

    #[tokio::test]
    async fn polls_until_closed() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        serve_effective(&server, "on").await;

        let strategy = strategy(&server, Duration::from_millis(50));
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));
        strategy.connect(Arc::clone(&store)).await.unwrap();
        assert_eq!(store.get("x"), Some(FeatureValue::from("on")));

        tokio::time::sleep(Duration::from_millis(180)).await;
        strategy.close().await;
        let polled = request_count(&server).await;
        assert!(polled >= 3, "only {polled} requests");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(request_count(&server).await, polled);
        assert_eq!(strategy.state(), StrategyState::Disconnected);
    }

    #[tokio::test]
    async fn failing_tick_does_not_stop_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/effective"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        serve_effective(&server, "recovered").await;

        let strategy = strategy(&server, Duration::from_millis(30));
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));
        assert!(strategy.connect(Arc::clone(&store)).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        strategy.close().await;

        assert_eq!(store.get("x"), Some(FeatureValue::from("recovered")));
    }

    #[tokio::test]
    async fn concurrent_updates_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/effective"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(100))
                    .set_body_json(serde_json::json!([])),
            )
            .mount(&server)
            .await;

        let strategy = strategy(&server, Duration::from_secs(60));
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));
        strategy.connect(store).await.unwrap();

        let (a, b, c) = tokio::join!(
            strategy.update_features(),
            strategy.update_features(),
            strategy.update_features()
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(request_count(&server).await, 2);
        strategy.close().await;
    }
}

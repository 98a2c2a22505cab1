use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{FetchState, StrategyState, UpdateStrategy};
use crate::{fetcher::FeatureFetcher, store::FeatureState, Result};

/// Fetches once on `connect` and then only when asked to.
pub struct ManualUpdateStrategy<S> {
    fetch: FetchState,
    store: Mutex<Option<Arc<S>>>,
}

impl<S> ManualUpdateStrategy<S> {
    pub fn new(fetcher: Arc<FeatureFetcher>) -> Self {
        ManualUpdateStrategy {
            fetch: FetchState::without_backoff(fetcher),
            store: Mutex::new(None),
        }
    }

    fn store(&self) -> Option<Arc<S>> {
        self.store
            .lock()
            .expect("thread holding strategy lock should not panic")
            .clone()
    }
}

#[async_trait]
impl<S: FeatureState> UpdateStrategy<S> for ManualUpdateStrategy<S> {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn connect(&self, store: Arc<S>) -> Result<()> {
        *self
            .store
            .lock()
            .expect("thread holding strategy lock should not panic") = Some(Arc::clone(&store));
        self.fetch.reset_guard();
        self.fetch.refresh(store).await
    }

    async fn update_features(&self) -> Result<()> {
        match self.store() {
            Some(store) => self.fetch.refresh(store).await,
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.store
            .lock()
            .expect("thread holding strategy lock should not panic")
            .take();
    }

    fn state(&self) -> StrategyState {
        match self.store() {
            Some(_) => StrategyState::Connected,
            None => StrategyState::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::MockServer;

    use super::*;
    use crate::{
        models::FeatureValue,
        store::EffectiveFeatureStore,
        update_strategies::testing::{request_count, serve_effective},
    };

    #[tokio::test]
    async fn fetches_on_connect_and_on_demand_only() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        serve_effective(&server, "on").await;

        let strategy = ManualUpdateStrategy::<EffectiveFeatureStore>::new(Arc::new(
            FeatureFetcher::new(server.uri(), "key"),
        ));
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));

        strategy.update_features().await.unwrap();
        assert_eq!(request_count(&server).await, 0);

        strategy.connect(Arc::clone(&store)).await.unwrap();
        assert_eq!(store.get("x"), Some(FeatureValue::from("on")));
        assert_eq!(request_count(&server).await, 1);
        assert_eq!(strategy.state(), StrategyState::Connected);

        strategy.update_features().await.unwrap();
        assert_eq!(request_count(&server).await, 2);

        strategy.close().await;
        assert_eq!(strategy.state(), StrategyState::Disconnected);
    }
}

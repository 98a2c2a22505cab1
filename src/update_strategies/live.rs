use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{FetchState, StrategyState, UpdateStrategy};
use crate::{
    fetcher::FeatureFetcher,
    live_connection::{ConnectionState, LiveConnection, LiveOptions, MessageHandler},
    notifications::SubscriptionMode,
    store::FeatureState,
    Error, Result,
};

/// Keeps the store in sync from pushed notifications.
///
/// When the initial connection fails, an empty store is bootstrapped with one pull and the
/// connection is retried in the background.
pub struct LiveUpdateStrategy<S> {
    connection: LiveConnection,
    fetch: FetchState,
    store: Mutex<Option<Arc<S>>>,
    background: Mutex<CancellationToken>,
}

impl<S: FeatureState> LiveUpdateStrategy<S> {
    pub fn new(
        fetcher: Arc<FeatureFetcher>,
        environment_api_key: &str,
        ws_endpoint: impl Into<String>,
        options: LiveOptions,
    ) -> Self {
        LiveUpdateStrategy {
            // The mode is replaced with the store's own on every connect.
            connection: LiveConnection::new(
                environment_api_key,
                SubscriptionMode::AllValues,
                ws_endpoint,
                options,
            ),
            fetch: FetchState::new(fetcher),
            store: Mutex::new(None),
            background: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn connection(&self) -> &LiveConnection {
        &self.connection
    }

    fn stop_background(&self) -> CancellationToken {
        let mut background = self
            .background
            .lock()
            .expect("thread holding strategy lock should not panic");
        background.cancel();
        *background = CancellationToken::new();
        background.clone()
    }
}

#[async_trait]
impl<S: FeatureState> UpdateStrategy<S> for LiveUpdateStrategy<S> {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn connect(&self, store: Arc<S>) -> Result<()> {
        let background = self.stop_background();
        *self
            .store
            .lock()
            .expect("thread holding strategy lock should not panic") = Some(Arc::clone(&store));

        self.connection.set_mode(store.subscription_mode());
        let handler: MessageHandler = {
            let store = Arc::clone(&store);
            Arc::new(move |message| store.apply_notification(message))
        };

        let err = match self.connection.connect(Arc::clone(&handler)).await {
            Ok(()) => return Ok(()),
            // Retrying a rejected subscription cannot succeed.
            Err(err @ Error::SubscriptionError(_)) => return Err(err),
            Err(err) => err,
        };

        log::warn!(target: "featureboard", "live connection failed, reconnecting in the background: {err}");
        if store.is_empty() {
            self.fetch.reset_guard();
            self.fetch.refresh(Arc::clone(&store)).await?;
        }

        let connection = self.connection.clone();
        tokio::spawn(async move {
            connection
                .try_reconnect_in_background(handler, &background)
                .await;
        });
        Ok(())
    }

    /// Pushed updates keep the store fresh while subscribed; otherwise this pulls once.
    async fn update_features(&self) -> Result<()> {
        if self.connection.state() == ConnectionState::Subscribed {
            return Ok(());
        }
        let store = self
            .store
            .lock()
            .expect("thread holding strategy lock should not panic")
            .clone();
        match store {
            Some(store) => self.fetch.refresh(store).await,
            None => Ok(()),
        }
    }

    async fn close(&self) {
        self.stop_background();
        self.connection.close("update strategy closed");
        self.store
            .lock()
            .expect("thread holding strategy lock should not panic")
            .take();
    }

    fn state(&self) -> StrategyState {
        match self.connection.state() {
            ConnectionState::Subscribed => StrategyState::Connected,
            _ => StrategyState::Disconnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use wiremock::MockServer;

    use super::*;
    use crate::{
        models::FeatureValue,
        store::EffectiveFeatureStore,
        transport::testing::{ChannelTransportFactory, ServerEnd},
        update_strategies::testing::{request_count, serve_effective},
    };

    fn strategy(
        http: String,
    ) -> (
        LiveUpdateStrategy<EffectiveFeatureStore>,
        mpsc::UnboundedReceiver<ServerEnd>,
    ) {
        let (factory, ends) = ChannelTransportFactory::new();
        let strategy = LiveUpdateStrategy::new(
            Arc::new(FeatureFetcher::new(http, "env-key")),
            "env-key",
            "wss://client-ws.example",
            LiveOptions::new()
                .with_connect_timeout(Duration::from_millis(200))
                .with_transport_factory(Arc::new(factory)),
        );
        (strategy, ends)
    }

    #[tokio::test]
    async fn applies_pushed_values() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (strategy, mut ends) = strategy("http://127.0.0.1:9".to_owned());
        let strategy = Arc::new(strategy);
        let store = Arc::new(EffectiveFeatureStore::new(vec!["beta".into()], vec![]));

        let connect = tokio::spawn({
            let strategy = Arc::clone(&strategy);
            let store = Arc::clone(&store);
            async move { strategy.connect(store).await }
        });
        let mut end = ends.recv().await.unwrap();
        end.open();

        let subscribe = end.received.recv().await.unwrap();
        assert!(matches!(
            subscribe,
            crate::transport::OutgoingFrame::Text(ref text) if text.contains(r#""audiences":["beta"]"#)
        ));

        end.send(r#"{"kind": "feature-value-updated", "featureKey": "x", "value": "pushed"}"#);
        connect.await.unwrap().unwrap();

        assert_eq!(store.get("x"), Some(FeatureValue::from("pushed")));
        assert_eq!(strategy.state(), StrategyState::Connected);

        strategy.close().await;
        assert_eq!(strategy.state(), StrategyState::Disconnected);
    }

    #[tokio::test]
    async fn bootstraps_with_a_pull_when_connection_fails() {
        let server = MockServer::start().await;
        serve_effective(&server, "pulled").await;

        let (strategy, mut ends) = strategy(server.uri());
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));

        // Nobody answers on the transport, so connect times out.
        strategy.connect(Arc::clone(&store)).await.unwrap();

        assert_eq!(store.get("x"), Some(FeatureValue::from("pulled")));
        assert_eq!(request_count(&server).await, 1);
        assert!(ends.try_recv().is_ok());

        // The background loop opens another connection after its first backoff.
        let retried = tokio::time::timeout(Duration::from_secs(3), ends.recv()).await;
        assert!(matches!(retried, Ok(Some(_))));
        strategy.close().await;
    }

    #[tokio::test]
    async fn skips_bootstrap_when_store_has_values() {
        let server = MockServer::start().await;
        serve_effective(&server, "pulled").await;

        let (strategy, _ends) = strategy(server.uri());
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));
        store.set("x", Some("cached".into()));

        strategy.connect(Arc::clone(&store)).await.unwrap();
        strategy.close().await;

        assert_eq!(request_count(&server).await, 0);
        assert_eq!(store.get("x"), Some(FeatureValue::from("cached")));
    }

    #[tokio::test]
    async fn rejected_subscription_is_an_error() {
        let (strategy, mut ends) = strategy("http://127.0.0.1:9".to_owned());
        let strategy = Arc::new(strategy);
        let store = Arc::new(EffectiveFeatureStore::new(vec![], vec![]));

        let connect = tokio::spawn({
            let strategy = Arc::clone(&strategy);
            async move { strategy.connect(store).await }
        });
        let end = ends.recv().await.unwrap();
        end.open();
        end.send(r#"{"kind": "subscription-error", "error": "unknown environment"}"#);

        assert!(matches!(
            connect.await.unwrap(),
            Err(Error::SubscriptionError(_))
        ));
    }
}

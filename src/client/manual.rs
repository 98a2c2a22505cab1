use std::sync::Arc;

use super::{EffectiveClient, FeatureBoardClient};
use crate::{
    models::{EffectiveFeatureValue, EffectiveValues, FeatureValue},
    store::{EffectiveFeatureStore, Subscription},
};

/// A client whose values are set directly by the caller. Useful in tests and for local
/// development; it never talks to the service.
#[derive(Clone)]
pub struct ManualClient {
    store: Arc<EffectiveFeatureStore>,
    client: EffectiveClient,
}

impl ManualClient {
    pub fn new(audiences: Vec<String>, values: Vec<EffectiveFeatureValue>) -> Self {
        let store = Arc::new(EffectiveFeatureStore::new(audiences, values));
        ManualClient {
            client: EffectiveClient::new(Arc::clone(&store)),
            store,
        }
    }

    /// Set a value, or make the feature unavailable with `None`. Subscribers are notified.
    pub fn set(&self, feature_key: &str, value: Option<FeatureValue>) {
        self.store.set(feature_key, value);
    }
}

impl FeatureBoardClient for ManualClient {
    fn get_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
    ) -> FeatureValue {
        self.client.get_feature_value(feature_key, default_value)
    }

    fn subscribe_to_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
        on_value: impl Fn(FeatureValue) + Send + Sync + 'static,
    ) -> Subscription {
        self.client
            .subscribe_to_feature_value(feature_key, default_value, on_value)
    }

    fn get_effective_values(&self) -> EffectiveValues {
        self.client.get_effective_values()
    }
}

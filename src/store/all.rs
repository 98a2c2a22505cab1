use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use super::{ExternalMirror, ExternalStateStore, FeatureState, Listeners, Subscription};
use crate::{
    client::RequestClient,
    fetcher::{CachedResponse, FeatureFetcher, FetchOutcome},
    models::FeatureConfiguration,
    notifications::{NotificationMessage, SubscriptionMode},
    Error, Result,
};

/// Immutable view of every feature configuration at one point in time.
pub type FeatureSnapshot = Arc<HashMap<String, Arc<FeatureConfiguration>>>;

/// Raw configuration for every feature, resolved locally against per-request audiences.
///
/// Writes are copy-on-write: a [`FeatureSnapshot`] taken before a write never observes it.
pub struct AllFeatureStore {
    features: RwLock<FeatureSnapshot>,
    listeners: Listeners<FeatureConfiguration>,
    external: Option<ExternalMirror<FeatureConfiguration>>,
    debug: bool,
}

impl Default for AllFeatureStore {
    fn default() -> Self {
        AllFeatureStore::new()
    }
}

impl AllFeatureStore {
    pub fn new() -> Self {
        AllFeatureStore {
            features: RwLock::new(Arc::new(HashMap::new())),
            listeners: Listeners::new(),
            external: None,
            debug: false,
        }
    }

    pub fn with_external_state_store(
        mut self,
        external: Arc<dyn ExternalStateStore<FeatureConfiguration>>,
    ) -> Self {
        self.external = Some(ExternalMirror::new(external));
        self
    }

    pub(crate) fn has_external_state_store(&self) -> bool {
        self.external.is_some()
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn all(&self) -> FeatureSnapshot {
        // Cloning the Arc is the shallow copy.
        self.features
            .read()
            .expect("thread holding store lock should not panic")
            .clone()
    }

    pub fn get(&self, feature_key: &str) -> Option<Arc<FeatureConfiguration>> {
        let configuration = self
            .features
            .read()
            .expect("thread holding store lock should not panic")
            .get(feature_key)
            .cloned();
        if self.debug {
            log::trace!(target: "featureboard", feature_key, found = configuration.is_some(); "get");
        }
        configuration
    }

    /// Set or retract a configuration. Listeners are notified on every call.
    pub fn set(&self, feature_key: &str, configuration: Option<FeatureConfiguration>) {
        let configuration = configuration.map(Arc::new);
        {
            let mut features = self
                .features
                .write()
                .expect("thread holding store lock should not panic");
            let map = Arc::make_mut(&mut features);
            match &configuration {
                Some(configuration) => {
                    map.insert(feature_key.to_owned(), Arc::clone(configuration));
                }
                None => {
                    map.remove(feature_key);
                }
            }
            if let Some(external) = &self.external {
                external.push(
                    map.iter()
                        .map(|(key, configuration)| {
                            (key.clone(), FeatureConfiguration::clone(configuration))
                        })
                        .collect(),
                );
            }
        }

        if self.debug {
            log::trace!(target: "featureboard", feature_key, configuration:serde = configuration.as_deref(); "set");
        }
        self.listeners.notify(feature_key, configuration.as_deref());
    }

    pub fn on_feature_updated(
        &self,
        callback: impl Fn(&str, Option<&FeatureConfiguration>) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(Arc::new(callback))
    }

    /// A client that resolves against the current contents for `audience_keys`. Later writes to
    /// the store are not visible through it.
    pub fn request(&self, audience_keys: Vec<String>) -> RequestClient {
        RequestClient::new(self.all(), audience_keys)
    }

    fn replace_all(&self, configurations: impl IntoIterator<Item = FeatureConfiguration>) {
        let existing = self.all();
        let mut removed: Vec<&String> = existing.keys().collect();
        for configuration in configurations {
            removed.retain(|key| **key != configuration.feature_key);
            let feature_key = configuration.feature_key.clone();
            self.set(&feature_key, Some(configuration));
        }
        for feature_key in removed {
            self.set(feature_key, None);
        }
    }
}

#[async_trait]
impl FeatureState for AllFeatureStore {
    async fn fetch(
        &self,
        fetcher: &FeatureFetcher,
        cached: Option<CachedResponse>,
    ) -> Result<FetchOutcome> {
        fetcher.fetch_all_values(self, cached).await
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::AllValues
    }

    fn apply_notification(&self, message: NotificationMessage) {
        match message {
            NotificationMessage::StateOfTheWorld { features } => self.replace_all(features),
            NotificationMessage::FeatureUpdated(configuration)
            | NotificationMessage::FeatureAvailable(configuration) => {
                let feature_key = configuration.feature_key.clone();
                self.set(&feature_key, Some(configuration));
            }
            NotificationMessage::FeatureUnavailable { feature_key } => {
                self.set(&feature_key, None);
            }
            other => {
                log::debug!(target: "featureboard", "ignoring notification for effective-values subscription: {other:?}");
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.features
            .read()
            .expect("thread holding store lock should not panic")
            .is_empty()
    }

    async fn initialise_from_external_store(&self) -> Result<bool> {
        let Some(external) = &self.external else {
            return Ok(false);
        };
        let configurations = external
            .external()
            .all()
            .await
            .map_err(|err| Error::ExternalStateStore(err.to_string()))?;
        log::debug!(target: "featureboard", count = configurations.len(); "initialising from external state store");
        self.replace_all(configurations.into_values());
        Ok(true)
    }
}

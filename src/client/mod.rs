//! Client façades over the stores and update strategies.
mod browser;
mod manual;
mod request;
mod server;

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    models::{EffectiveFeatureValue, EffectiveValues, FeatureValue},
    store::{EffectiveFeatureStore, Subscription},
    Error, Result,
};

pub use browser::BrowserClient;
pub use manual::ManualClient;
pub use request::{PendingRequest, RequestClient};
pub use server::ServerClient;

/// Read access to feature values.
pub trait FeatureBoardClient {
    /// The current value of `feature_key`, or `default_value` if the feature is not available.
    fn get_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
    ) -> FeatureValue;

    /// Call `on_value` with the current value right away, then on every change until the
    /// returned [`Subscription`] is dropped.
    fn subscribe_to_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
        on_value: impl Fn(FeatureValue) + Send + Sync + 'static,
    ) -> Subscription;

    /// Every available feature, resolved for the client's audiences.
    fn get_effective_values(&self) -> EffectiveValues;

    /// Like [`FeatureBoardClient::get_feature_value`], falling back to `default_value` when the
    /// feature holds a non-boolean value.
    fn get_boolean_value(&self, feature_key: &str, default_value: bool) -> bool {
        let value = self.get_feature_value(feature_key, default_value);
        value.as_boolean().unwrap_or_else(|| {
            log::warn!(target: "featureboard", feature_key; "feature is not a boolean");
            default_value
        })
    }

    fn get_number_value(&self, feature_key: &str, default_value: f64) -> f64 {
        let value = self.get_feature_value(feature_key, default_value);
        value.as_number().unwrap_or_else(|| {
            log::warn!(target: "featureboard", feature_key; "feature is not a number");
            default_value
        })
    }

    fn get_string_value(&self, feature_key: &str, default_value: &str) -> String {
        match self.get_feature_value(feature_key, default_value) {
            FeatureValue::String(value) => value,
            _ => {
                log::warn!(target: "featureboard", feature_key; "feature is not a string");
                default_value.to_owned()
            }
        }
    }
}

/// Client reading from an [`EffectiveFeatureStore`]. Values change as the store is updated.
#[derive(Clone)]
pub struct EffectiveClient {
    store: Arc<EffectiveFeatureStore>,
}

impl EffectiveClient {
    pub(crate) fn new(store: Arc<EffectiveFeatureStore>) -> Self {
        EffectiveClient { store }
    }
}

impl FeatureBoardClient for EffectiveClient {
    fn get_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
    ) -> FeatureValue {
        self.store
            .get(feature_key)
            .unwrap_or_else(|| default_value.into())
    }

    fn subscribe_to_feature_value(
        &self,
        feature_key: &str,
        default_value: impl Into<FeatureValue>,
        on_value: impl Fn(FeatureValue) + Send + Sync + 'static,
    ) -> Subscription {
        let default_value = default_value.into();
        on_value(
            self.store
                .get(feature_key)
                .unwrap_or_else(|| default_value.clone()),
        );

        let feature_key = feature_key.to_owned();
        self.store.on_feature_updated(move |updated_key, value| {
            if updated_key == feature_key {
                on_value(value.cloned().unwrap_or_else(|| default_value.clone()));
            }
        })
    }

    fn get_effective_values(&self) -> EffectiveValues {
        let mut effective_values: Vec<EffectiveFeatureValue> = self
            .store
            .all()
            .into_iter()
            .map(|(feature_key, value)| EffectiveFeatureValue { feature_key, value })
            .collect();
        effective_values.sort_by(|a, b| a.feature_key.cmp(&b.feature_key));
        EffectiveValues {
            audiences: self.store.audiences(),
            effective_values,
        }
    }
}

#[derive(Debug, Clone)]
pub enum InitialisationState {
    Pending,
    Initialised,
    /// Initialization gave up. Holds the last error.
    Failed(Error),
}

/// Initialization progress, observable through a watch channel.
pub(crate) struct Initialisation {
    state: watch::Sender<InitialisationState>,
}

impl Initialisation {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(InitialisationState::Pending);
        Initialisation { state }
    }

    pub(crate) fn set(&self, state: InitialisationState) {
        self.state.send_replace(state);
    }

    /// Mark as failed with `err` unless already settled.
    pub(crate) fn fail_if_pending(&self, err: Error) {
        self.state.send_if_modified(|state| match state {
            InitialisationState::Pending => {
                *state = InitialisationState::Failed(err);
                true
            }
            _ => false,
        });
    }

    pub(crate) fn is_initialised(&self) -> bool {
        matches!(*self.state.borrow(), InitialisationState::Initialised)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<InitialisationState> {
        self.state.subscribe()
    }

    pub(crate) async fn wait(&self) -> Result<()> {
        let mut receiver = self.state.subscribe();
        let state = receiver
            .wait_for(|state| !matches!(state, InitialisationState::Pending))
            .await
            .map_err(|_| Error::Closed)?;
        match &*state {
            InitialisationState::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

//! The Rust SDK for FeatureBoard, a feature flag service.
//!
//! # Overview
//!
//! The SDK keeps a local copy of feature values in sync with the service and serves reads from
//! it without blocking. Two clients cover the two ways values are resolved:
//!
//! - [`BrowserClient`] represents a single user. The service resolves every feature for the
//!   client's audiences and the client stores the resulting [effective
//!   values](EffectiveFeatureValue). Changing the audiences with
//!   [`BrowserClient::update_audiences`] retracts every value before new ones are fetched.
//! - [`ServerClient`] serves many users. It stores the raw [`FeatureConfiguration`] of every
//!   feature and resolves values locally for the audiences of each
//!   [request](ServerClient::request).
//!
//! Both read through the [`FeatureBoardClient`] trait and are kept fresh by an update strategy,
//! chosen with [`UpdateStrategyOptions`]:
//!
//! - manual: fetch on initialization and on [`BrowserClient::update_features`] only;
//! - polling: fetch on a fixed interval (the default for browser clients);
//! - on-request: refresh expired values before serving a server request;
//! - live: subscribe to pushed updates over a WebSocket (the default for server clients).
//!
//! Pull strategies use conditional requests, so unchanged values cost a `304 Not Modified`.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Once a client is initialized, background failures (a failed polling tick, a dropped live
//! connection) are logged and retried without surfacing to readers, who keep getting the last
//! known values. Errors are returned only from calls that explicitly asked for network work,
//! such as [`BrowserClient::wait_for_initialised`] or [`ServerClient::update_features`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! all under the `featureboard` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations. Per-key store tracing is enabled
//! with the `debug` client option.
//!
//! # Tracing
//!
//! Initialization, fetches, on-request refreshes, external store reads and audience changes run
//! inside [`tracing`](https://docs.rs/tracing/latest/tracing/) spans named `fbsdk-*`. Failures
//! are recorded on the span as `exception` events. Install a `tracing` subscriber (for example
//! an OpenTelemetry layer) to collect them, or turn them off with
//! [`BrowserClientOptions::disable_tracing`] and [`ServerClientOptions::disable_tracing`].

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod error;
mod fetcher;
mod live_connection;
mod models;
mod notifications;
mod retry;
mod single_flight;
mod store;
mod telemetry;
mod transport;
mod update_strategies;

pub use client::{
    BrowserClient, EffectiveClient, FeatureBoardClient, InitialisationState, ManualClient,
    PendingRequest, RequestClient, ServerClient,
};
pub use config::{ApiConfig, BrowserClientOptions, ServerClientOptions};
pub use error::{Error, Result};
pub use fetcher::{CacheToken, CachedResponse, FeatureFetcher, FetchOutcome};
pub use live_connection::{ConnectionState, LiveConnection, LiveOptions, MessageHandler};
pub use models::{
    AudienceExceptionValue, EffectiveFeatureValue, EffectiveValues, FeatureConfiguration,
    FeatureValue,
};
pub use notifications::{ClientMessage, NotificationMessage, SubscriptionMode};
pub use retry::RetryPolicy;
pub use single_flight::{SingleFlight, SingleFlightWithBackoff};
pub use store::{
    AllFeatureStore, EffectiveFeatureStore, ExternalStateStore, FeatureSnapshot, FeatureState,
    FeatureUpdatedCallback, Subscription,
};
pub use transport::{
    OutgoingFrame, TransportConnection, TransportEvent, TransportFactory,
    WebSocketTransportFactory,
};
pub use update_strategies::{
    LiveUpdateStrategy, ManualUpdateStrategy, OnRequestOptions, OnRequestUpdateStrategy,
    PollingOptions, PollingUpdateStrategy, StrategyState, UpdateStrategy, UpdateStrategyOptions,
};

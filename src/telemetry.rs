//! Spans around the SDK's network work.
//!
//! Spans are emitted with `tracing`, so any subscriber the application installs (for example an
//! OpenTelemetry exporter) picks them up. Plain log records still go through `log`. Clients
//! created with `disable_tracing(true)` emit no spans and no span events.
use std::{fmt::Display, future::Future};

use tracing::{Instrument, Span};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Telemetry {
    enabled: bool,
}

impl Telemetry {
    pub(crate) const fn new(enabled: bool) -> Telemetry {
        Telemetry { enabled }
    }

    pub(crate) fn is_enabled(self) -> bool {
        self.enabled
    }

    /// The span built by `make`, or a disabled span when tracing is off.
    pub(crate) fn span(self, make: impl FnOnce() -> Span) -> Span {
        if self.enabled {
            make()
        } else {
            Span::none()
        }
    }
}

impl Default for Telemetry {
    fn default() -> Telemetry {
        Telemetry::new(true)
    }
}

/// Run `future` inside `span`, recording its error on the span.
pub(crate) async fn traced<T>(span: Span, future: impl Future<Output = Result<T>>) -> Result<T> {
    let result = future.instrument(span.clone()).await;
    if let Err(err) = &result {
        record_error(&span, err);
    }
    result
}

pub(crate) fn record_error(span: &Span, err: &impl Display) {
    if !span.is_disabled() {
        tracing::error!(parent: span, exception.message = %err, "exception");
    }
}

pub(crate) fn add_event(span: &Span, message: &str) {
    if !span.is_disabled() {
        tracing::info!(parent: span, "{message}");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        fmt,
        sync::{Arc, Mutex},
    };

    use tracing::{
        field::{Field, Visit},
        span, subscriber::DefaultGuard, Event, Subscriber,
    };
    use tracing_subscriber::{
        layer::{Context, SubscriberExt},
        registry::LookupSpan,
        Layer,
    };

    /// Records span names and the messages of events attached to them.
    #[derive(Clone, Default)]
    pub(crate) struct SpanRecorder {
        spans: Arc<Mutex<Vec<&'static str>>>,
        events: Arc<Mutex<Vec<(Option<&'static str>, String)>>>,
    }

    impl SpanRecorder {
        /// Record everything emitted on the current thread until the guard is dropped.
        pub(crate) fn install() -> (SpanRecorder, DefaultGuard) {
            let recorder = SpanRecorder::default();
            let guard = tracing::subscriber::set_default(
                tracing_subscriber::registry().with(recorder.clone()),
            );
            (recorder, guard)
        }

        /// Names of the SDK's own spans, in creation order.
        pub(crate) fn spans(&self) -> Vec<&'static str> {
            self.spans
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|name| name.starts_with("fbsdk-"))
                .collect()
        }

        pub(crate) fn event_count(&self) -> usize {
            self.events.lock().unwrap().len()
        }

        pub(crate) fn events_in(&self, span: &str) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(parent, _)| *parent == Some(span))
                .map(|(_, message)| message.clone())
                .collect()
        }
    }

    struct Message(String);

    impl Visit for Message {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S> Layer<S> for SpanRecorder
    where
        S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    {
        fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
            self.spans.lock().unwrap().push(attrs.metadata().name());
        }

        fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
            let mut message = Message(String::new());
            event.record(&mut message);
            let parent = ctx.event_span(event).map(|span| span.name());
            self.events.lock().unwrap().push((parent, message.0));
        }
    }
}

//! Process-wide `tracing` subscriber setup for hosts embedding the dispatcher.
//!
//! The library only emits through `tracing` macros and the `metrics` facade; installing a
//! subscriber and a metrics recorder is left to the host. These helpers cover compact console
//! output and newline-delimited JSON.

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// One JSON object per event, with the current span's fields flattened in.
fn json_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(writer)
}

/// Installs a compact stderr subscriber. `RUST_LOG` overrides `default_level`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Installs a stderr subscriber that writes newline-delimited JSON, for hosts that ship logs
/// to a collector. `RUST_LOG` overrides `default_level`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_json_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(json_layer(std::io::stderr))
        .init();
}

/// Like [`init_tracing`], but returns an error instead of panicking when a subscriber is
/// already installed.
///
/// # Errors
///
/// Returns [`TryInitError`] if a global subscriber was set earlier.
pub fn try_init_tracing(default_level: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_test_writer(),
        )
        .try_init()
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn json_layer_writes_one_object_per_event() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(json_layer(captured.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(topic = "orders", "relayed");
            tracing::warn!(attempt = 2, "retrying");
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.starts_with('{') && l.ends_with('}')));
        assert!(lines[0].contains(r#""message":"relayed""#));
        assert!(lines[0].contains(r#""topic":"orders""#));
        assert!(lines[1].contains(r#""level":"WARN""#));
    }

    #[test]
    fn second_install_is_reported_not_panicked() {
        let _ = try_init_tracing("debug");
        assert!(try_init_tracing("debug").is_err());
    }
}

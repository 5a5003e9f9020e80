//! Tracing subscriber setup
//!
//! Hosts embedding the engine usually install their own subscriber; this is
//! for binaries and tests that want the same output the backend produces.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Output is JSON lines when `json` is
/// set, human-readable otherwise. A second call is a no-op.
pub fn init_tracing(default_filter: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json_layer = json.then(|| tracing_subscriber::fmt::layer().json().boxed());
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().boxed());

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok()
}

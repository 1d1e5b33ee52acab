//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn default_filter(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    // Wire traffic stays off unless asked for explicitly through RUST_LOG.
    format!("xqbridge={base_level},xqbridge_cli={base_level},xqbridge::wire=off")
}

/// Initialize tracing with XQBRIDGE_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` wins when set. Output goes to stderr; `LOG_FORMAT=json` switches
/// to one JSON object per line. Calling this more than once is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(std::env::var("XQBRIDGE_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_map_to_filters() {
        assert_eq!(
            default_filter(Some("debug")),
            "xqbridge=debug,xqbridge_cli=debug,xqbridge::wire=off"
        );
        assert!(default_filter(Some("warning")).starts_with("xqbridge=warn,"));
        assert!(default_filter(Some("loud")).starts_with("xqbridge=info,"));
        assert!(default_filter(None).starts_with("xqbridge=info,"));
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tether_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// One JSON object per line instead of the compact human format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from loose strings, ignoring unparseable levels.
    pub fn from_strings<'a>(
        level: &str,
        modules: impl IntoIterator<Item = (&'a String, &'a String)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: parse_level(level).unwrap_or(Level::INFO),
            module_levels: modules
                .into_iter()
                .filter_map(|(m, l)| parse_level(l).map(|l| (m.clone(), l)))
                .collect(),
            json,
        }
    }

    /// Directive string handed to [`EnvFilter`] when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

/// Returned by [`init_telemetry`].
#[derive(Debug)]
pub struct TelemetryGuard {
    installed: bool,
}

impl TelemetryGuard {
    /// False when a global subscriber was already set by someone else.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();
    TelemetryGuard { installed }
}

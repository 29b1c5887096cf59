//! Event group configuration.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```toml
//! daemon = false
//! monitor_interval_ms = 50
//!
//! [core_pauser]
//! kind = "busy"
//!
//! [routes]
//! high = "core"
//! monitor = "monitor"
//! blocking = "blocking"
//! ```

use crate::defaults;
use crate::group::RoutingTable;
use crate::pauser::{AdaptivePauser, BusyPauser, Pauser, SleepyPauser, YieldingPauser};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Pauser selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PauserConfig {
    /// Spin continuously
    Busy,
    /// Spin for `spin_us`, then sleep with backoff from `min_sleep_us` to
    /// `max_sleep_us`
    Adaptive {
        /// Spin window in microseconds
        #[serde(default)]
        spin_us: u64,
        /// First sleep in microseconds
        #[serde(default = "default_min_sleep_us")]
        min_sleep_us: u64,
        /// Longest sleep in microseconds
        max_sleep_us: u64,
    },
    /// Spin for `spin_us`, then yield
    Yielding {
        /// Spin window in microseconds
        #[serde(default)]
        spin_us: u64,
    },
    /// Sleep a fixed `sleep_us` per pause
    Sleepy {
        /// Sleep in microseconds
        sleep_us: u64,
    },
}

fn default_min_sleep_us() -> u64 {
    defaults::MIN_SLEEP.as_micros() as u64
}

impl PauserConfig {
    /// Adaptive pauser with the default minimum sleep
    pub fn adaptive(spin: Duration, max_sleep: Duration) -> Self {
        PauserConfig::Adaptive {
            spin_us: spin.as_micros() as u64,
            min_sleep_us: default_min_sleep_us(),
            max_sleep_us: max_sleep.as_micros() as u64,
        }
    }

    /// Build a fresh pauser
    pub fn build(&self) -> Arc<dyn Pauser> {
        match *self {
            PauserConfig::Busy => Arc::new(BusyPauser),
            PauserConfig::Adaptive {
                spin_us,
                min_sleep_us,
                max_sleep_us,
            } => Arc::new(AdaptivePauser::new(
                Duration::from_micros(spin_us),
                Duration::from_micros(min_sleep_us),
                Duration::from_micros(max_sleep_us),
            )),
            PauserConfig::Yielding { spin_us } => {
                Arc::new(YieldingPauser::new(Duration::from_micros(spin_us)))
            }
            PauserConfig::Sleepy { sleep_us } => {
                Arc::new(SleepyPauser::new(Duration::from_micros(sleep_us)))
            }
        }
    }
}

/// Configuration of an [`EventGroup`](crate::EventGroup)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventGroupConfig {
    /// Daemon semantics for the core loop thread
    pub daemon: bool,
    /// Core loop pauser
    pub core_pauser: PauserConfig,
    /// Monitor loop pauser
    pub monitor_pauser: PauserConfig,
    /// Pauser given to each blocking-loop worker
    pub blocking_pauser: PauserConfig,
    /// Nominal monitor period in milliseconds
    pub monitor_interval_ms: u64,
    /// Bounded join used when stopping loops, in milliseconds
    pub join_timeout_ms: u64,
    /// Priority to loop routing
    pub routes: RoutingTable,
}

impl Default for EventGroupConfig {
    fn default() -> Self {
        Self {
            daemon: true,
            core_pauser: PauserConfig::adaptive(defaults::CORE_SPIN, defaults::CORE_MAX_SLEEP),
            monitor_pauser: PauserConfig::adaptive(defaults::MONITOR_SPIN, defaults::MONITOR_MAX_SLEEP),
            blocking_pauser: PauserConfig::adaptive(Duration::ZERO, defaults::BLOCKING_MAX_SLEEP),
            monitor_interval_ms: defaults::MONITOR_INTERVAL.as_millis() as u64,
            join_timeout_ms: defaults::JOIN_TIMEOUT.as_millis() as u64,
            routes: RoutingTable::standard(),
        }
    }
}

impl EventGroupConfig {
    /// Defaults with the given daemon flag
    pub fn with_daemon(daemon: bool) -> Self {
        Self {
            daemon,
            ..Self::default()
        }
    }

    /// Parse a TOML document; absent fields keep their defaults
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Monitor period as a duration (at least 2 ms)
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(2))
    }

    /// Join timeout as a duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LoopKind;
    use crate::handler::HandlerPriority;

    #[test]
    fn test_defaults() {
        let config = EventGroupConfig::default();
        assert!(config.daemon);
        assert_eq!(config.monitor_interval(), Duration::from_millis(100));
        assert_eq!(
            config.core_pauser,
            PauserConfig::Adaptive {
                spin_us: 20,
                min_sleep_us: 10,
                max_sleep_us: 200
            }
        );
        assert_eq!(
            config.monitor_pauser,
            PauserConfig::Adaptive {
                spin_us: 0,
                min_sleep_us: 10,
                max_sleep_us: 1_000_000
            }
        );
        assert_eq!(config.routes, RoutingTable::standard());
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = EventGroupConfig::from_toml_str("").unwrap();
        assert_eq!(config, EventGroupConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let text = r#"
            daemon = false
            monitor_interval_ms = 50

            [core_pauser]
            kind = "busy"

            [blocking_pauser]
            kind = "sleepy"
            sleep_us = 500

            [monitor_pauser]
            kind = "adaptive"
            max_sleep_us = 250000
        "#;
        let config = EventGroupConfig::from_toml_str(text).unwrap();

        assert!(!config.daemon);
        assert_eq!(config.monitor_interval(), Duration::from_millis(50));
        assert_eq!(config.core_pauser, PauserConfig::Busy);
        assert_eq!(config.blocking_pauser, PauserConfig::Sleepy { sleep_us: 500 });
        assert_eq!(
            config.monitor_pauser,
            PauserConfig::Adaptive {
                spin_us: 0,
                min_sleep_us: 10,
                max_sleep_us: 250_000
            }
        );
    }

    #[test]
    fn test_parse_routes() {
        let text = r#"
            [routes]
            high = "core"
            monitor = "core"
        "#;
        let config = EventGroupConfig::from_toml_str(text).unwrap();

        assert_eq!(config.routes.route(HandlerPriority::High), Some(LoopKind::Core));
        assert_eq!(config.routes.route(HandlerPriority::Monitor), Some(LoopKind::Core));
        assert_eq!(config.routes.route(HandlerPriority::Blocking), None);
    }

    #[test]
    fn test_parse_error() {
        let result = EventGroupConfig::from_toml_str("[core_pauser]\nkind = \"warp\"\n");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_build_pausers() {
        assert_eq!(PauserConfig::Busy.build().pause_duration(), Duration::ZERO);
        assert_eq!(
            PauserConfig::Sleepy { sleep_us: 300 }.build().pause_duration(),
            Duration::from_micros(300)
        );
    }
}

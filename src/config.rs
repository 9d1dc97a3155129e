//! Bridge configuration.

use std::time::Duration;

/// Tunables for an [`Env`](crate::Env).
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use refbridge::BridgeConfig;
///
/// let config = BridgeConfig::default()
///     .with_type_check(false)
///     .with_watchdog(Duration::from_secs(5));
/// assert!(!config.type_check);
/// assert_eq!(config.watchdog_timeout, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Report script values that do not match the declared property kind.
    pub type_check: bool,
    /// Reuse one parameter buffer per function for non-reentrant calls.
    pub persistent_param_buffer: bool,
    /// Invalidate aliases handed to script callbacks once they return.
    pub dangling_check: bool,
    /// Interrupt script that runs longer than this. `None` disables the watchdog.
    pub watchdog_timeout: Option<Duration>,
    /// How often the watchdog samples.
    pub watchdog_tick: Duration,
    /// Script call nesting limit.
    pub max_call_depth: u32,
    /// How many diagnostics the environment keeps before dropping the oldest.
    pub max_diagnostics: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            type_check: true,
            persistent_param_buffer: true,
            dangling_check: true,
            watchdog_timeout: None,
            watchdog_tick: Duration::from_secs(1),
            max_call_depth: 200,
            max_diagnostics: 256,
        }
    }
}

impl BridgeConfig {
    /// Enable or disable soft type checking.
    pub fn with_type_check(mut self, enabled: bool) -> Self {
        self.type_check = enabled;
        self
    }

    /// Enable or disable persistent parameter buffers.
    pub fn with_persistent_param_buffer(mut self, enabled: bool) -> Self {
        self.persistent_param_buffer = enabled;
        self
    }

    /// Enable or disable alias invalidation after callbacks.
    pub fn with_dangling_check(mut self, enabled: bool) -> Self {
        self.dangling_check = enabled;
        self
    }

    /// Enable the watchdog with the given timeout.
    pub fn with_watchdog(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = Some(timeout);
        self
    }

    /// Set the watchdog sampling interval.
    pub fn with_watchdog_tick(mut self, tick: Duration) -> Self {
        self.watchdog_tick = tick;
        self
    }

    /// Set the script call nesting limit.
    pub fn with_max_call_depth(mut self, depth: u32) -> Self {
        self.max_call_depth = depth;
        self
    }
}

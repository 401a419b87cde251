//! Pool configuration.
//!
//! # Environment Variables
//!
//! Applied by [`PoolConfig::with_env_overrides`]:
//!
//! - `PROCPOOL_MAX_CONCURRENCY` - maximum number of live workers
//! - `PROCPOOL_CHILD_TIMEOUT` - per-worker deadline in seconds (`0` disables)
//! - `PROCPOOL_RAISE` - `true` to escalate generic task failures, `false` to collect them

use crate::error::{PoolError, Result};
use nix::unistd::Pid;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked around `fork`.
pub type ForkHook = Arc<dyn Fn(Pid) + Send + Sync>;

/// What the pool does with a generic task failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RaisePolicy {
    /// Signal every live worker and return the failure from `wait`.
    #[default]
    Raise,
    /// Record the failure in the results list and keep going.
    Swallow,
}

/// Standard streams of a worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildStdio {
    /// Share the parent's stdin, stdout and stderr.
    #[default]
    Inherit,
    /// Point stdin, stdout and stderr at `/dev/null`.
    Null,
}

/// Configuration for a [`Pool`](crate::Pool). Immutable once the pool is built.
#[derive(Clone)]
pub struct PoolConfig {
    /// Maximum number of workers alive at once.
    pub max_concurrency: usize,
    pub raise_policy: RaisePolicy,
    /// Deadline for a single task, measured inside the worker. `None` disables it.
    pub child_timeout: Option<Duration>,
    pub child_stdio: ChildStdio,
    /// Forward termination signals received by this process to the workers.
    pub signal_relay: bool,
    /// Runs in the parent before each fork, with the parent's pid.
    pub before_fork: Option<ForkHook>,
    /// Runs twice per fork: in the parent with the child's pid, and in the
    /// child with its own pid.
    pub after_fork: Option<ForkHook>,
    invalid_timeout: Option<f64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            raise_policy: RaisePolicy::Raise,
            child_timeout: None,
            child_stdio: ChildStdio::Inherit,
            signal_relay: true,
            before_fork: None,
            after_fork: None,
            invalid_timeout: None,
        }
    }
}

/// One less than the number of logical CPUs, and at least one.
pub fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .saturating_sub(1)
        .max(1)
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// `true` selects [`RaisePolicy::Raise`], `false` selects [`RaisePolicy::Swallow`].
    pub fn raise_exceptions(mut self, raise: bool) -> Self {
        self.raise_policy = if raise {
            RaisePolicy::Raise
        } else {
            RaisePolicy::Swallow
        };
        self
    }

    pub fn with_child_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.child_timeout = timeout;
        self.invalid_timeout = None;
        self
    }

    /// Set the child deadline in seconds. Zero or negative disables it.
    ///
    /// NaN, infinity and values too large for a [`Duration`] are rejected
    /// when the pool is built.
    pub fn child_timeout_secs(mut self, secs: f64) -> Self {
        self.invalid_timeout = None;
        self.child_timeout = None;
        if secs.is_finite() && secs <= 0.0 {
            return self;
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => self.child_timeout = Some(timeout),
            Err(_) => self.invalid_timeout = Some(secs),
        }
        self
    }

    pub fn with_child_stdio(mut self, stdio: ChildStdio) -> Self {
        self.child_stdio = stdio;
        self
    }

    pub fn with_signal_relay(mut self, enabled: bool) -> Self {
        self.signal_relay = enabled;
        self
    }

    pub fn before_fork<F>(mut self, hook: F) -> Self
    where
        F: Fn(Pid) + Send + Sync + 'static,
    {
        self.before_fork = Some(Arc::new(hook));
        self
    }

    pub fn after_fork<F>(mut self, hook: F) -> Self
    where
        F: Fn(Pid) + Send + Sync + 'static,
    {
        self.after_fork = Some(Arc::new(hook));
        self
    }

    /// Apply `PROCPOOL_*` environment variable overrides.
    ///
    /// Unparseable values are ignored and the current setting is kept.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("PROCPOOL_MAX_CONCURRENCY")
            && let Ok(max) = value.trim().parse::<usize>()
        {
            self.max_concurrency = max;
        }

        if let Ok(value) = std::env::var("PROCPOOL_CHILD_TIMEOUT")
            && let Ok(secs) = value.trim().parse::<f64>()
        {
            self = self.child_timeout_secs(secs);
        }

        if let Ok(value) = std::env::var("PROCPOOL_RAISE")
            && let Some(raise) = parse_bool(&value)
        {
            self = self.raise_exceptions(raise);
        }

        self
    }

    /// Check the configuration before a pool is built from it.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(PoolError::Configuration(
                "max_concurrency must be a positive integer".into(),
            ));
        }
        if let Some(secs) = self.invalid_timeout {
            return Err(PoolError::Configuration(format!(
                "child_timeout must be a representable number of seconds, got {}",
                secs
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_concurrency", &self.max_concurrency)
            .field("raise_policy", &self.raise_policy)
            .field("child_timeout", &self.child_timeout)
            .field("child_stdio", &self.child_stdio)
            .field("signal_relay", &self.signal_relay)
            .field("before_fork", &self.before_fork.is_some())
            .field("after_fork", &self.after_fork.is_some())
            .finish()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.max_concurrency >= 1);
        assert_eq!(config.raise_policy, RaisePolicy::Raise);
        assert_eq!(config.child_timeout, None);
        assert_eq!(config.child_stdio, ChildStdio::Inherit);
        assert!(config.signal_relay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let err = PoolConfig::new().with_max_concurrency(0).validate().unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[test]
    fn test_child_timeout_secs() {
        let config = PoolConfig::new().child_timeout_secs(1.5);
        assert_eq!(config.child_timeout, Some(Duration::from_millis(1500)));

        assert_eq!(PoolConfig::new().child_timeout_secs(0.0).child_timeout, None);
        assert_eq!(PoolConfig::new().child_timeout_secs(-3.0).child_timeout, None);

        let config = PoolConfig::new().child_timeout_secs(f64::NAN);
        assert!(matches!(
            config.validate(),
            Err(PoolError::Configuration(_))
        ));
        // A later valid setting clears the error.
        assert!(config.child_timeout_secs(2.0).validate().is_ok());

        assert!(PoolConfig::new().child_timeout_secs(f64::INFINITY).validate().is_err());
        assert!(PoolConfig::new().child_timeout_secs(f64::NEG_INFINITY).validate().is_err());
    }

    #[test]
    fn test_huge_child_timeout_is_rejected() {
        let config = PoolConfig::new().child_timeout_secs(1e30);
        assert_eq!(config.child_timeout, None);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert!(err.to_string().contains("child_timeout"));

        let config = PoolConfig::new().child_timeout_secs(86_400.0 * 365.0);
        assert!(config.validate().is_ok());
        assert!(config.child_timeout.is_some());
    }

    #[test]
    fn test_raise_exceptions_builder() {
        assert_eq!(
            PoolConfig::new().raise_exceptions(false).raise_policy,
            RaisePolicy::Swallow
        );
        assert_eq!(
            PoolConfig::new().raise_exceptions(true).raise_policy,
            RaisePolicy::Raise
        );
    }

    #[test]
    fn test_debug_hides_hooks() {
        let config = PoolConfig::new().after_fork(|_| {});
        let debug = format!("{:?}", config);
        assert!(debug.contains("after_fork: true"));
        assert!(debug.contains("before_fork: false"));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with the other env-mutating tests.
        unsafe {
            std::env::set_var("PROCPOOL_MAX_CONCURRENCY", "7");
            std::env::set_var("PROCPOOL_CHILD_TIMEOUT", "2.5");
            std::env::set_var("PROCPOOL_RAISE", "false");
        }
        let config = PoolConfig::new().with_env_overrides();
        unsafe {
            std::env::remove_var("PROCPOOL_MAX_CONCURRENCY");
            std::env::remove_var("PROCPOOL_CHILD_TIMEOUT");
            std::env::remove_var("PROCPOOL_RAISE");
        }

        assert_eq!(config.max_concurrency, 7);
        assert_eq!(config.child_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.raise_policy, RaisePolicy::Swallow);
    }

    #[test]
    #[serial]
    fn test_env_overrides_ignore_garbage() {
        unsafe {
            std::env::set_var("PROCPOOL_MAX_CONCURRENCY", "many");
        }
        let config = PoolConfig::new().with_max_concurrency(3).with_env_overrides();
        unsafe {
            std::env::remove_var("PROCPOOL_MAX_CONCURRENCY");
        }
        assert_eq!(config.max_concurrency, 3);
    }
}

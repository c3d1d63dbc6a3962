//! Tunables for a [`Reactor`](crate::reactor::Reactor), collected into one
//! place so constructing one doesn't take half a dozen positional
//! arguments.

use crate::context::DEFAULT_STACK_SIZE;

/// Upper bound on how long a worker's idle loop will block in the notifier
/// wait when there is no nearer timer deadline (spec §4.4 "idle-fiber
/// override": the wait is `min(next_timeout, this cap)`).
pub const DEFAULT_IDLE_WAIT_CAP_MS: u64 = 5_000;

/// Maximum number of readiness events drained from the notifier per wait
/// call.
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Configuration for a [`Reactor`](crate::reactor::Reactor) / `Scheduler`
/// pair.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) name: String,
    pub(crate) worker_threads: usize,
    pub(crate) use_caller_thread: bool,
    pub(crate) stack_size: usize,
    pub(crate) idle_wait_cap_ms: u64,
    pub(crate) max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "corort".to_string(),
            worker_threads: 1,
            use_caller_thread: false,
            stack_size: DEFAULT_STACK_SIZE,
            idle_wait_cap_ms: DEFAULT_IDLE_WAIT_CAP_MS,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`]; all fields default to the values documented on
/// [`Config::default`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Total number of OS threads the scheduler drives, including the
    /// caller thread if `use_caller_thread` is set.
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "corort: worker_threads must be at least 1");
        self.config.worker_threads = n;
        self
    }

    /// If set, one of the `worker_threads` slots is the thread that calls
    /// `Reactor::stop`, rather than a dedicated pool thread (spec §4.2
    /// "caller thread mode").
    pub fn use_caller_thread(mut self, yes: bool) -> Self {
        self.config.use_caller_thread = yes;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    pub fn idle_wait_cap_ms(mut self, ms: u64) -> Self {
        self.config.idle_wait_cap_ms = ms;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        assert!(n > 0, "corort: max_events must be at least 1");
        self.config.max_events = n;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_threads, 1);
        assert!(!cfg.use_caller_thread);
        assert_eq!(cfg.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = Config::builder()
            .name("io-pool")
            .worker_threads(4)
            .use_caller_thread(true)
            .idle_wait_cap_ms(1_000)
            .max_events(64)
            .build();
        assert_eq!(cfg.name, "io-pool");
        assert_eq!(cfg.worker_threads, 4);
        assert!(cfg.use_caller_thread);
        assert_eq!(cfg.idle_wait_cap_ms, 1_000);
        assert_eq!(cfg.max_events, 64);
    }
}

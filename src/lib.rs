//! An M:N stackful-fiber concurrency runtime: a cooperative fiber scheduler
//! multiplexed over a fixed pool of worker threads, an epoll-based I/O
//! reactor, and a hierarchical timer manager.
//!
//! - [Machine context save/restore](context)
//! - [Stackful coroutines](fiber)
//! - [Thread pool + task queue scheduler](scheduler)
//! - [Ordered timer set](timer)
//! - [I/O reactor combining scheduler, timers, and epoll](reactor)
//! - [Runtime configuration](config)
//! - [Error types](error)
//! - [Time sources](clock)
//!
//! ### Features
//!
//! - `hooks` - enables [`hook`], a set of blocking-call-shaped wrappers
//!   (`connect`/`read`/`write`/`accept`/`recv`/`send`/`sleep`) that suspend
//!   the calling fiber on the current thread's reactor instead of blocking
//!   the worker, plus the process-wide per-fd attribute table they share.
//!
//! ### Example
//!
//! ```no_run
//! use corort::config::Config;
//! use corort::reactor::Reactor;
//! use corort::fiber::Fiber;
//! use corort::scheduler::Task;
//!
//! let reactor = Reactor::new(Config::builder().worker_threads(2).build());
//! reactor.start();
//! reactor.scheduler().schedule(
//!     Task::Fiber(Fiber::new("greeter", || println!("hello from a fiber"))),
//!     -1,
//! );
//! reactor.stop();
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod log;
pub mod reactor;
pub mod scheduler;
pub mod timer;

#[cfg(feature = "hooks")]
pub mod hook;

pub use config::Config;
pub use error::{Error, Result};
pub use reactor::Reactor;

//! Callguard shares caching, admission control and retry policies for outbound calls between
//! any number of processes.
//!
//! # Introduction
//! Services talking to external APIs usually face the same three problems: identical requests
//! are sent over and over again, the API only tolerates a limited number of parallel requests or
//! requests per minute, and some responses (a **503** or a timeout) simply call for another
//! attempt. Solving these within a single process is easy. Solving them for a fleet of workers
//! requires shared state.
//!
//! **Callguard** keeps all of this state in a Redis (or any RESP compatible) server. Each worker
//! only holds a connection pool and some settings, all coordination happens within the store.
//!
//! # Modules
//! * **Fingerprints**: stable, order independent digests of named values. See [fingerprint].
//! * **Invocations**: describe a single call (method, url, headers, cookies, params, body,
//!   arguments). See [invocation].
//! * **Cache**: stores results under segmented keys which can be invalidated by any subset of
//!   their fields. See [cache].
//! * **Limiter**: grants leases via an atomic script, limiting either the number of concurrent
//!   calls or the number of calls per window. See [limiter].
//! * **Validator**: retries or ignores outcomes based on their status or fault. See [validator].
//! * **Guard**: combines all of the above around a single call. See [guard].
//!
//! All components are async. Synchronous code can use the `call_blocking` variants which run
//! the same logic on a dedicated runtime (see [blocking]).
//!
//! # Examples
//! The simplest way of setting everything up is the [Builder](builder::Builder). Still, each
//! component can be created on its own:
//!
//! ```
//! # use std::time::Duration;
//! # use callguard::invocation::Invocation;
//! # use callguard::limiter::Limiter;
//! # use callguard::store::Store;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = Store::memory();
//! let limiter = Limiter::rate(store, 100, Duration::from_secs(60));
//!
//! let invocation = Invocation::new("weather::forecast").method("GET").url("https://api/forecast");
//! let forecast = limiter.call(&invocation, async { Ok("sunny".to_owned()) }).await?;
//! assert_eq!(forecast, "sunny");
//! # Ok(())
//! # }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod blocking;
pub mod builder;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod fmt;
pub mod guard;
pub mod invocation;
pub mod limiter;
pub mod reply;
pub mod store;
pub mod validator;

/// Contains the version of the Callguard library.
pub const CALLGUARD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) which will
/// also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests and embedding applications may call this several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

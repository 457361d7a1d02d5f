//! Runs the async core from synchronous code.
//!
//! All components are implemented as async code. Synchronous callers use the `call_blocking`
//! variants, which drive the very same future to completion on a dedicated single threaded
//! runtime. Calling them from within a runtime would block its worker, therefore this is
//! rejected with an error.
use std::future::Future;

use anyhow::Context;

/// Drives the given future to completion on a dedicated runtime.
///
/// Fails if invoked from within an async runtime.
///
/// # Examples
///
/// ```
/// let answer = callguard::blocking::run(async { 6 * 7 }).unwrap();
/// assert_eq!(answer, 42);
/// ```
pub fn run<F: Future>(future: F) -> anyhow::Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        anyhow::bail!(
            "Cannot perform a blocking call within an async runtime. Use the async variant instead."
        );
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to set up a runtime for a blocking call.")?;

    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    #[test]
    fn timers_work_on_the_dedicated_runtime() {
        let started = Instant::now();
        let result = crate::blocking::run(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            "done"
        });

        assert_eq!(result.unwrap(), "done");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn blocking_within_a_runtime_is_rejected() {
        crate::testing::test_async(async {
            assert!(crate::blocking::run(async { 1 }).is_err());
        });
    }
}

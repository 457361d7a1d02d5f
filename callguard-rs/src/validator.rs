//! Decides whether the outcome of a call is returned, replaced or retried.
//!
//! A [Validator] wraps a repeatable call and inspects each outcome:
//!
//! 1. If the [IgnoreCondition] matches (by status or by fault category), its transformation is
//!    applied and the result is returned immediately. This takes precedence over retrying.
//! 2. If the [RetryCondition] matches, any network resource held by the result is released
//!    (see [Reply::release]) and the call is repeated after the configured delay. Once the
//!    maximal number of retries has been performed, [RetriesExhausted] is reported instead.
//! 3. Otherwise the outcome is returned as is.
//!
//! Faults are matched by their type, see [FaultCategory].
//!
//! # Examples
//!
//! ```
//! # use std::time::Duration;
//! # use callguard::reply::HttpReply;
//! # use callguard::validator::{RetryCondition, Validator};
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let retry = RetryCondition::on_status([429, 503])?
//!     .with_delay(Duration::from_millis(5))
//!     .with_max_count(3);
//! let validator = Validator::new(None, Some(retry))?;
//!
//! let mut attempts = 0;
//! let reply = validator
//!     .call(|| {
//!         attempts += 1;
//!         let status = if attempts < 3 { 503 } else { 200 };
//!         async move { Ok(HttpReply::new(status, "")) }
//!     })
//!     .await?;
//!
//! assert_eq!(reply.status, 200);
//! assert_eq!(attempts, 3);
//! # Ok(())
//! # }
//! ```
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::fmt::format_duration;
use crate::reply::{Observation, Reply};

/// Reported if a condition or validator is misconfigured.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// A condition has neither statuses nor fault categories.
    #[error("the {0} condition needs at least one status or fault category")]
    EmptyCondition(&'static str),

    /// A validator has neither an ignore nor a retry condition.
    #[error("a validator needs an ignore or a retry condition")]
    NoConditions,
}

/// Identifies a kind of fault by its error type.
///
/// # Examples
///
/// ```
/// # use callguard::validator::FaultCategory;
/// let io = FaultCategory::of::<std::io::Error>();
///
/// let fault = anyhow::Error::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
/// assert!(io.matches(&fault));
/// assert!(io.matches(&fault.context("while fetching the customers")));
/// assert!(!io.matches(&anyhow::anyhow!("something else")));
/// ```
#[derive(Clone, Copy)]
pub struct FaultCategory {
    name: &'static str,
    matcher: fn(&anyhow::Error) -> bool,
}

fn is_caused_by<E: Error + Send + Sync + 'static>(error: &anyhow::Error) -> bool {
    error.downcast_ref::<E>().is_some() || error.chain().any(|cause| cause.is::<E>())
}

impl FaultCategory {
    /// Matches every fault which is or has been caused by an error of type **E**.
    pub fn of<E: Error + Send + Sync + 'static>() -> Self {
        FaultCategory {
            name: std::any::type_name::<E>(),
            matcher: is_caused_by::<E>,
        }
    }

    /// Matches every fault accepted by the given function.
    pub fn custom(name: &'static str, matcher: fn(&anyhow::Error) -> bool) -> Self {
        FaultCategory { name, matcher }
    }

    /// Returns the name of this category.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Determines if the given fault belongs to this category.
    pub fn matches(&self, error: &anyhow::Error) -> bool {
        (self.matcher)(error)
    }
}

impl fmt::Debug for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[derive(Clone, Debug)]
struct Matcher {
    statuses: Vec<u16>,
    faults: Vec<FaultCategory>,
}

impl Matcher {
    fn new(
        kind: &'static str,
        statuses: impl IntoIterator<Item = u16>,
        faults: impl IntoIterator<Item = FaultCategory>,
    ) -> Result<Self, PolicyError> {
        let matcher = Matcher {
            statuses: statuses.into_iter().collect(),
            faults: faults.into_iter().collect(),
        };

        if matcher.statuses.is_empty() && matcher.faults.is_empty() {
            Err(PolicyError::EmptyCondition(kind))
        } else {
            Ok(matcher)
        }
    }

    fn matches<T>(&self, observation: &Observation, outcome: &anyhow::Result<T>) -> bool {
        match outcome {
            Ok(_) => observation
                .status
                .map(|status| self.statuses.contains(&status))
                .unwrap_or(false),
            Err(error) => self.faults.iter().any(|category| category.matches(error)),
        }
    }
}

/// Describes which outcomes are repeated and how often.
#[derive(Clone, Debug)]
pub struct RetryCondition {
    matcher: Matcher,
    delay: Duration,
    max_count: u32,
}

impl RetryCondition {
    /// Creates a condition matching the given statuses and fault categories.
    ///
    /// By default, a matching call is retried once and without any delay.
    pub fn new(
        statuses: impl IntoIterator<Item = u16>,
        faults: impl IntoIterator<Item = FaultCategory>,
    ) -> Result<Self, PolicyError> {
        Ok(RetryCondition {
            matcher: Matcher::new("retry", statuses, faults)?,
            delay: Duration::ZERO,
            max_count: 1,
        })
    }

    /// Creates a condition matching the given statuses.
    pub fn on_status(statuses: impl IntoIterator<Item = u16>) -> Result<Self, PolicyError> {
        RetryCondition::new(statuses, [])
    }

    /// Creates a condition matching the given fault categories.
    pub fn on_faults(
        faults: impl IntoIterator<Item = FaultCategory>,
    ) -> Result<Self, PolicyError> {
        RetryCondition::new([], faults)
    }

    /// Specifies the pause between two attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Specifies the maximal number of retries (not counting the first attempt).
    pub fn with_max_count(mut self, max_count: u32) -> Self {
        self.max_count = max_count;
        self
    }

    /// Returns the pause between two attempts.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns the maximal number of retries.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }
}

type Transform<T> = Arc<dyn Fn(anyhow::Result<T>) -> anyhow::Result<T> + Send + Sync>;

/// Describes which outcomes are accepted (and possibly replaced) without retrying.
pub struct IgnoreCondition<T> {
    matcher: Matcher,
    transform: Transform<T>,
}

impl<T> Clone for IgnoreCondition<T> {
    fn clone(&self) -> Self {
        IgnoreCondition {
            matcher: self.matcher.clone(),
            transform: self.transform.clone(),
        }
    }
}

impl<T> fmt::Debug for IgnoreCondition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreCondition")
            .field("statuses", &self.matcher.statuses)
            .field("faults", &self.matcher.faults)
            .finish()
    }
}

impl<T: 'static> IgnoreCondition<T> {
    /// Creates a condition matching the given statuses and fault categories.
    ///
    /// By default, a matching outcome is returned unchanged.
    pub fn new(
        statuses: impl IntoIterator<Item = u16>,
        faults: impl IntoIterator<Item = FaultCategory>,
    ) -> Result<Self, PolicyError> {
        Ok(IgnoreCondition {
            matcher: Matcher::new("ignore", statuses, faults)?,
            transform: Arc::new(|outcome| outcome),
        })
    }

    /// Creates a condition matching the given statuses.
    pub fn on_status(statuses: impl IntoIterator<Item = u16>) -> Result<Self, PolicyError> {
        IgnoreCondition::new(statuses, [])
    }

    /// Creates a condition matching the given fault categories.
    pub fn on_faults(
        faults: impl IntoIterator<Item = FaultCategory>,
    ) -> Result<Self, PolicyError> {
        IgnoreCondition::new([], faults)
    }

    /// Specifies how a matching outcome is transformed before it is returned.
    pub fn returning(
        mut self,
        transform: impl Fn(anyhow::Result<T>) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Arc::new(transform);
        self
    }
}

/// Reported once a call still matched the retry condition after all retries were used up.
///
/// Carries what was observed last: the status and text of the last result or the last fault
/// (available as [source](Error::source)).
#[derive(Debug)]
pub struct RetriesExhausted {
    retries: u32,
    status: Option<u16>,
    text: Option<String>,
    source: Option<anyhow::Error>,
}

impl RetriesExhausted {
    /// Returns the number of retries which were performed.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the status of the last result.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Returns the text of the last result.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Returns the last fault.
    pub fn fault(&self) -> Option<&anyhow::Error> {
        self.source.as_ref()
    }
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Giving up after {} retries.", self.retries)?;
        if let Some(status) = self.status {
            write!(f, " Last status: {}.", status)?;
        }
        if let Some(text) = &self.text {
            write!(f, " Last text: {}", text)?;
        }
        if let Some(error) = &self.source {
            write!(f, " Last fault: {}", error)?;
        }

        Ok(())
    }
}

impl Error for RetriesExhausted {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.source {
            Some(error) => {
                let error: &(dyn Error + 'static) = &**error;
                Some(error)
            }
            None => None,
        }
    }
}

/// Applies an ignore and a retry condition to a repeatable call.
pub struct Validator<T> {
    ignore: Option<IgnoreCondition<T>>,
    retry: Option<RetryCondition>,
}

impl<T> fmt::Debug for Validator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("ignore", &self.ignore)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<T: Reply> Validator<T> {
    /// Creates a new validator. At least one of the conditions has to be present.
    pub fn new(
        ignore: Option<IgnoreCondition<T>>,
        retry: Option<RetryCondition>,
    ) -> Result<Self, PolicyError> {
        if ignore.is_none() && retry.is_none() {
            return Err(PolicyError::NoConditions);
        }

        Ok(Validator { ignore, retry })
    }

    /// Invokes the given call until its outcome no longer matches the retry condition.
    ///
    /// Each invocation of `attempt` has to start a fresh call.
    pub async fn call<F, Fut>(&self, mut attempt: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut retries = 0;
        loop {
            let mut outcome = attempt().await;
            let observation = Observation::of(&outcome);

            if let Some(ignore) = &self.ignore {
                if ignore.matcher.matches(&observation, &outcome) {
                    log::debug!("Ignoring outcome with status {:?}.", observation.status);
                    return (ignore.transform)(outcome);
                }
            }

            let retry = match &self.retry {
                Some(retry) if retry.matcher.matches(&observation, &outcome) => retry,
                _ => return outcome,
            };

            if observation.releasable {
                if let Ok(reply) = &mut outcome {
                    reply.release().await;
                }
            }

            if retries >= retry.max_count {
                log::warn!(
                    "Giving up after {} retries (last status: {:?}).",
                    retries,
                    observation.status
                );
                return Err(RetriesExhausted {
                    retries,
                    status: observation.status,
                    text: observation.text,
                    source: outcome.err(),
                }
                .into());
            }

            retries += 1;
            log::info!(
                "Retrying call (attempt {} of {}) in {}...",
                retries,
                retry.max_count,
                format_duration(retry.delay)
            );
            if !retry.delay.is_zero() {
                tokio::time::sleep(retry.delay).await;
            }
        }
    }

    /// Provides a synchronous version of [Validator::call] for code outside of an async runtime.
    pub fn call_blocking<F>(&self, mut attempt: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        crate::blocking::run(self.call(move || std::future::ready(attempt())))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::reply::{HttpReply, Reply};
    use crate::validator::{
        FaultCategory, IgnoreCondition, PolicyError, RetriesExhausted, RetryCondition, Validator,
    };

    #[derive(Debug, thiserror::Error)]
    #[error("the upstream timed out")]
    struct Timeout;

    fn retrying(max_count: u32) -> RetryCondition {
        RetryCondition::new([503], [FaultCategory::of::<Timeout>()])
            .unwrap()
            .with_delay(Duration::from_millis(1))
            .with_max_count(max_count)
    }

    #[test]
    fn empty_conditions_are_rejected() {
        assert_eq!(
            RetryCondition::new([], []).unwrap_err(),
            PolicyError::EmptyCondition("retry")
        );
        assert_eq!(
            IgnoreCondition::<HttpReply>::new([], []).unwrap_err(),
            PolicyError::EmptyCondition("ignore")
        );
        assert_eq!(
            Validator::<HttpReply>::new(None, None).unwrap_err(),
            PolicyError::NoConditions
        );
    }

    #[test]
    fn a_late_success_takes_max_count_plus_one_attempts() {
        crate::testing::test_async(async {
            let validator = Validator::new(None, Some(retrying(3))).unwrap();
            let mut attempts = 0;

            let reply = validator
                .call(|| {
                    attempts += 1;
                    let status = if attempts <= 3 { 503 } else { 200 };
                    async move { Ok(HttpReply::new(status, "")) }
                })
                .await
                .unwrap();

            assert_eq!(reply.status, 200);
            assert_eq!(attempts, 4);
        });
    }

    #[test]
    fn exhausted_retries_report_the_last_observation() {
        crate::testing::test_async(async {
            let validator = Validator::new(None, Some(retrying(2))).unwrap();
            let mut attempts = 0;

            let error = validator
                .call(|| {
                    attempts += 1;
                    async { Ok(HttpReply::new(503, "maintenance")) }
                })
                .await
                .unwrap_err();

            assert_eq!(attempts, 3);
            let exhausted = error.downcast_ref::<RetriesExhausted>().unwrap();
            assert_eq!(exhausted.retries(), 2);
            assert_eq!(exhausted.status(), Some(503));
            assert_eq!(exhausted.text(), Some("maintenance"));
        });
    }

    #[test]
    fn matching_faults_are_retried_and_kept_as_source() {
        crate::testing::test_async(async {
            let validator = Validator::<HttpReply>::new(None, Some(retrying(1))).unwrap();
            let mut attempts = 0;

            let error = validator
                .call(|| {
                    attempts += 1;
                    async { Err(anyhow::Error::from(Timeout).context("fetching customers")) }
                })
                .await
                .unwrap_err();

            assert_eq!(attempts, 2);
            let exhausted = error.downcast_ref::<RetriesExhausted>().unwrap();
            assert_eq!(exhausted.status(), None);
            assert!(error.chain().any(|cause| cause.is::<Timeout>()));
        });
    }

    #[test]
    fn ignoring_takes_precedence_over_retrying() {
        crate::testing::test_async(async {
            let ignore = IgnoreCondition::on_status([503])
                .unwrap()
                .returning(|_| Ok(HttpReply::new(204, "")));
            let validator = Validator::new(Some(ignore), Some(retrying(5))).unwrap();
            let mut attempts = 0;

            let reply = validator
                .call(|| {
                    attempts += 1;
                    async { Ok(HttpReply::new(503, "")) }
                })
                .await
                .unwrap();

            assert_eq!(reply.status, 204);
            assert_eq!(attempts, 1);
        });
    }

    #[test]
    fn ignored_faults_can_be_replaced() {
        crate::testing::test_async(async {
            let ignore = IgnoreCondition::on_faults([FaultCategory::of::<Timeout>()])
                .unwrap()
                .returning(|_| Ok(Vec::new()));
            let validator = Validator::<Vec<u8>>::new(Some(ignore), None).unwrap();

            let result = validator
                .call(|| async { Err(anyhow::Error::from(Timeout)) })
                .await
                .unwrap();
            assert!(result.is_empty());
        });
    }

    #[test]
    fn unmatched_outcomes_pass_unchanged() {
        crate::testing::test_async(async {
            let validator = Validator::new(None, Some(retrying(3))).unwrap();

            let reply = validator
                .call(|| async { Ok(HttpReply::new(500, "oops")) })
                .await
                .unwrap();
            assert_eq!(reply.status, 500);

            let error = validator
                .call(|| async { Err(anyhow::anyhow!("refused")) })
                .await
                .unwrap_err();
            assert!(error.downcast_ref::<RetriesExhausted>().is_none());
            assert_eq!(error.to_string(), "refused");
        });
    }

    struct Pooled {
        released: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Reply for Pooled {
        fn status(&self) -> Option<u16> {
            Some(503)
        }

        fn is_releasable(&self) -> bool {
            true
        }

        async fn release(&mut self) {
            let _ = self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn resources_are_released_before_retrying() {
        crate::testing::test_async(async {
            let validator = Validator::new(None, Some(retrying(2))).unwrap();
            let released = Arc::new(AtomicUsize::new(0));

            let outcome = validator
                .call(|| {
                    let released = released.clone();
                    async move { Ok(Pooled { released }) }
                })
                .await;

            assert!(outcome.is_err());
            assert_eq!(released.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn blocking_calls_use_the_same_policy() {
        let validator = Validator::new(None, Some(retrying(1))).unwrap();
        let mut attempts = 0;

        let reply = validator
            .call_blocking(|| {
                attempts += 1;
                Ok(HttpReply::new(if attempts == 1 { 503 } else { 200 }, ""))
            })
            .unwrap();

        assert_eq!(reply.status, 200);
        assert_eq!(attempts, 2);
    }
}

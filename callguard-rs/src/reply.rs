//! Describes what the policies need to know about the result of a guarded call.
//!
//! Instead of probing a result for "something that looks like a status code", every result type
//! states its capabilities via [Reply]: it may carry a numeric status, it may provide a textual
//! body (used when reporting exhausted retries) and it may hold a network resource which has to be
//! released before a call is repeated. Plain values (strings, numbers, JSON documents) implement
//! the trait with all capabilities absent.
//!
//! The capabilities are resolved once per attempt into an [Observation] which is then used by the
//! [cache](crate::cache) (status >= 400 is never cached) and the
//! [validator](crate::validator) (status and fault matching).
//!
//! [HttpReply] is a ready to use, serializable response type for HTTP style calls.
use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Exposes the optional capabilities of a call result.
#[async_trait::async_trait]
pub trait Reply: Send {
    /// Returns the numeric status of this result, if it has one.
    fn status(&self) -> Option<u16> {
        None
    }

    /// Returns a textual representation of the body, if there is one.
    fn text(&self) -> Option<String> {
        None
    }

    /// Determines if [release](Reply::release) has to be invoked before discarding this result.
    fn is_releasable(&self) -> bool {
        false
    }

    /// Releases any network resource held by this result.
    ///
    /// This is invoked by the validator before a call is repeated so that connections are
    /// handed back to their pool instead of piling up across retries.
    async fn release(&mut self) {}
}

macro_rules! plain_reply {
    ($($type:ty),* $(,)?) => {
        $(impl Reply for $type {})*
    };
}

plain_reply!(
    (),
    bool,
    i32,
    i64,
    u32,
    u64,
    f64,
    Vec<u8>,
    serde_json::Value
);

impl Reply for String {
    fn text(&self) -> Option<String> {
        Some(self.clone())
    }
}

#[async_trait::async_trait]
impl<T: Reply> Reply for Option<T> {
    fn status(&self) -> Option<u16> {
        self.as_ref().and_then(Reply::status)
    }

    fn text(&self) -> Option<String> {
        self.as_ref().and_then(Reply::text)
    }

    fn is_releasable(&self) -> bool {
        self.as_ref().map(Reply::is_releasable).unwrap_or(false)
    }

    async fn release(&mut self) {
        if let Some(reply) = self.as_mut() {
            reply.release().await;
        }
    }
}

/// Contains the capabilities of a single outcome, resolved once after a call returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    /// The status of the result (never present for faults).
    pub status: Option<u16>,
    /// The textual body of the result (never present for faults).
    pub text: Option<String>,
    /// Determines if the result holds a resource which needs to be released.
    pub releasable: bool,
}

impl Observation {
    /// Inspects the given outcome.
    pub fn of<T: Reply>(outcome: &anyhow::Result<T>) -> Self {
        match outcome {
            Ok(reply) => Observation {
                status: reply.status(),
                text: reply.text(),
                releasable: reply.is_releasable(),
            },
            Err(_) => Observation::default(),
        }
    }

    /// Determines if the status signals an error (>= 400).
    pub fn is_error_status(&self) -> bool {
        self.status.map(|status| status >= 400).unwrap_or(false)
    }
}

/// Represents a fully received HTTP response which can be cached and replayed.
///
/// # Examples
///
/// ```
/// # use callguard::reply::{HttpReply, Reply};
/// let reply = HttpReply::new(200, "{\"id\": 7}").with_header("Content-Type", "application/json");
///
/// assert_eq!(reply.status(), Some(200));
/// assert!(reply.is_success());
/// assert_eq!(reply.json::<serde_json::Value>().unwrap()["id"], 7);
/// assert_eq!(reply.header("content-type"), Some("application/json"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpReply {
    /// The HTTP status code.
    pub status: u16,
    /// The response headers (names are stored in lower case).
    pub headers: BTreeMap<String, String>,
    /// The raw response body.
    pub body: Bytes,
}

impl HttpReply {
    /// Creates a new response with the given status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        HttpReply {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header and returns the updated response.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.to_lowercase(), value.into());
        self
    }

    /// Returns the value of the given header (names are compared case insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Determines if the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parses the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body).map_err(|error| {
            anyhow::anyhow!(
                "Cannot parse the body of a response with status {} as JSON: {}",
                self.status,
                error
            )
        })
    }
}

impl Reply for HttpReply {
    fn status(&self) -> Option<u16> {
        Some(self.status)
    }

    fn text(&self) -> Option<String> {
        Some(self.body_text().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use crate::reply::{HttpReply, Observation, Reply};

    #[test]
    fn plain_values_have_no_status() {
        let outcome: anyhow::Result<serde_json::Value> = Ok(serde_json::json!({"a": 1}));
        let observation = Observation::of(&outcome);

        assert_eq!(observation.status, None);
        assert!(!observation.is_error_status());
        assert!(!observation.releasable);
    }

    #[test]
    fn faults_are_observed_without_capabilities() {
        let outcome: anyhow::Result<HttpReply> = Err(anyhow::anyhow!("connection reset"));

        assert_eq!(Observation::of(&outcome), Observation::default());
    }

    #[test]
    fn http_replies_expose_status_and_text() {
        let outcome: anyhow::Result<HttpReply> = Ok(HttpReply::new(503, "busy"));
        let observation = Observation::of(&outcome);

        assert_eq!(observation.status, Some(503));
        assert_eq!(observation.text.as_deref(), Some("busy"));
        assert!(observation.is_error_status());
    }

    #[test]
    fn optional_replies_delegate() {
        let present = Some(HttpReply::new(404, ""));
        let absent: Option<HttpReply> = None;

        assert_eq!(present.status(), Some(404));
        assert_eq!(absent.status(), None);
    }
}

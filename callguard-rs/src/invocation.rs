//! Describes a single call of a guarded function.
//!
//! Rust has no keyword arguments, therefore the arguments which matter for caching and admission
//! control are spelled out explicitly. An [Invocation] carries the identity of the function being
//! called (its *owner*), the request-shaped fields (method, url, headers, cookies, query
//! parameters and body), plain positional arguments and any other named arguments.
//!
//! An invocation is considered *request-shaped* as soon as a method or a url is present. The
//! [cache](crate::cache) then derives one key segment per field, otherwise it fingerprints all
//! arguments at once.
//!
//! # Examples
//!
//! ```
//! # use callguard::invocation::Invocation;
//! # use serde_json::json;
//! let invocation = Invocation::new("shop::fetch_products")
//!     .method("GET")
//!     .url("https://shop.example.com/products")
//!     .params(&json!({"page": 2}));
//!
//! assert!(invocation.is_request_shaped());
//! assert_eq!(invocation.owner(), "shop::fetch_products");
//! ```
use std::fmt::Debug;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::fingerprint::{to_value, Fields};

/// Represents the body of a request-shaped call.
///
/// The kind is part of the fingerprint, so a JSON body and a form body with equal content are
/// cached separately.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// A body which is sent as JSON document.
    Json(Value),
    /// A body which is sent as form data.
    Data(Value),
    /// A raw body.
    Raw(Value),
}

impl Body {
    /// Returns the name under which the body content is fingerprinted.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Json(_) => "json",
            Body::Data(_) => "data",
            Body::Raw(_) => "body",
        }
    }

    /// Returns the body content.
    pub fn content(&self) -> &Value {
        match self {
            Body::Json(value) | Body::Data(value) | Body::Raw(value) => value,
        }
    }

    /// Renders the body as `{"<kind>": <content>}` which is what ends up in the fingerprint.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        let _ = map.insert(self.kind().to_owned(), self.content().clone());
        Value::Object(map)
    }
}

/// Describes a single call of a guarded function.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    owner: String,
    method: Option<Value>,
    url: Option<Value>,
    headers: Option<Value>,
    cookies: Option<Value>,
    params: Option<Value>,
    body: Option<Body>,
    args: Vec<Value>,
    extra: Fields,
}

impl Invocation {
    /// Creates a new invocation for the function identified by the given owner.
    ///
    /// The owner is part of every cache key. Using the module path of the function
    /// (e.g. "crm::fetch_customer") keeps keys readable and permits to invalidate all entries of
    /// a single function.
    pub fn new(owner: impl Into<String>) -> Self {
        Invocation {
            owner: owner.into(),
            method: None,
            url: None,
            headers: None,
            cookies: None,
            params: None,
            body: None,
            args: Vec::new(),
            extra: Fields::new(),
        }
    }

    /// Specifies the request method.
    pub fn method<T: Serialize + Debug + ?Sized>(mut self, method: &T) -> Self {
        self.method = Some(to_value(method));
        self
    }

    /// Specifies the request url.
    pub fn url<T: Serialize + Debug + ?Sized>(mut self, url: &T) -> Self {
        self.url = Some(to_value(url));
        self
    }

    /// Specifies the request headers.
    pub fn headers<T: Serialize + Debug + ?Sized>(mut self, headers: &T) -> Self {
        self.headers = Some(to_value(headers));
        self
    }

    /// Specifies the request cookies.
    pub fn cookies<T: Serialize + Debug + ?Sized>(mut self, cookies: &T) -> Self {
        self.cookies = Some(to_value(cookies));
        self
    }

    /// Specifies the query parameters.
    pub fn params<T: Serialize + Debug + ?Sized>(mut self, params: &T) -> Self {
        self.params = Some(to_value(params));
        self
    }

    /// Specifies a JSON body.
    pub fn json<T: Serialize + Debug + ?Sized>(mut self, body: &T) -> Self {
        self.body = Some(Body::Json(to_value(body)));
        self
    }

    /// Specifies a form body.
    pub fn data<T: Serialize + Debug + ?Sized>(mut self, body: &T) -> Self {
        self.body = Some(Body::Data(to_value(body)));
        self
    }

    /// Specifies a raw body.
    pub fn body<T: Serialize + Debug + ?Sized>(mut self, body: &T) -> Self {
        self.body = Some(Body::Raw(to_value(body)));
        self
    }

    /// Appends a positional argument.
    pub fn arg<T: Serialize + Debug + ?Sized>(mut self, arg: &T) -> Self {
        self.args.push(to_value(arg));
        self
    }

    /// Adds a named argument which isn't one of the request-shaped fields.
    pub fn extra<T: Serialize + Debug + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Self {
        self.extra.insert(name, value);
        self
    }

    /// Returns the identity of the called function.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Determines if a method or url is present.
    pub fn is_request_shaped(&self) -> bool {
        self.method.is_some() || self.url.is_some()
    }

    /// Returns the method or **null**.
    pub fn method_value(&self) -> Value {
        self.method.clone().unwrap_or(Value::Null)
    }

    /// Returns the url or **null**.
    pub fn url_value(&self) -> Value {
        self.url.clone().unwrap_or(Value::Null)
    }

    /// Returns the headers or **null**.
    pub fn headers_value(&self) -> Value {
        self.headers.clone().unwrap_or(Value::Null)
    }

    /// Returns the cookies or **null**.
    pub fn cookies_value(&self) -> Value {
        self.cookies.clone().unwrap_or(Value::Null)
    }

    /// Returns the query parameters or **null**.
    pub fn params_value(&self) -> Value {
        self.params.clone().unwrap_or(Value::Null)
    }

    /// Returns the body as `{"<kind>": <content>}` or **null**.
    pub fn body_value(&self) -> Value {
        self.body.as_ref().map(Body::to_value).unwrap_or(Value::Null)
    }

    /// Returns the body.
    pub fn body_ref(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Returns all positional arguments as JSON array.
    pub fn args_value(&self) -> Value {
        Value::Array(self.args.clone())
    }

    /// Returns the other named arguments as JSON object.
    pub fn extra_value(&self) -> Value {
        self.extra.to_value()
    }

    /// Collects the fields which identify the *shape* of a call: method, url, headers and
    /// cookies.
    ///
    /// This is what the [limiter](crate::limiter) buckets on. Query parameters, bodies and any
    /// other arguments don't influence which pool a call draws from.
    pub fn shape(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert_value("method", self.method_value());
        fields.insert_value("url", self.url_value());
        fields.insert_value("headers", self.headers_value());
        fields.insert_value("cookies", self.cookies_value());
        fields
    }

    /// Collects all arguments into a single set of fields.
    ///
    /// This is used to fingerprint calls which aren't request-shaped: `{"args": [...],
    /// "kwargs": {...}}` where the named part contains every field which has been provided.
    pub fn all_arguments(&self) -> Fields {
        let mut kwargs = self.extra.clone();
        let named = [
            ("method", &self.method),
            ("url", &self.url),
            ("headers", &self.headers),
            ("cookies", &self.cookies),
            ("params", &self.params),
        ];
        for (name, value) in named {
            if let Some(value) = value {
                kwargs.insert_value(name, value.clone());
            }
        }
        if let Some(body) = &self.body {
            kwargs.insert_value(body.kind(), body.content().clone());
        }

        let mut fields = Fields::new();
        fields.insert_value("args", self.args_value());
        fields.insert_value("kwargs", kwargs.to_value());
        fields
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use crate::invocation::Invocation;

    #[test]
    fn method_or_url_make_a_call_request_shaped() {
        assert!(!Invocation::new("f").arg(&1).is_request_shaped());
        assert!(Invocation::new("f").url("https://example.com").is_request_shaped());
        assert!(Invocation::new("f").method("POST").is_request_shaped());
    }

    #[test]
    fn shape_ignores_params_body_and_arguments() {
        let plain = Invocation::new("f")
            .method("GET")
            .url("https://example.com");
        let decorated = Invocation::new("g")
            .method("GET")
            .url("https://example.com")
            .params(&json!({"page": 3}))
            .json(&json!({"q": "x"}))
            .arg(&42)
            .extra("timeout", &30);

        assert_eq!(plain.shape().fingerprint(), decorated.shape().fingerprint());
        assert_ne!(
            plain.shape().fingerprint(),
            plain.clone().headers(&json!({"X-Tenant": "a"})).shape().fingerprint()
        );
    }

    #[test]
    fn body_kind_is_part_of_the_body_value() {
        let json_body = Invocation::new("f").json(&json!({"a": 1}));
        let form_body = Invocation::new("f").data(&json!({"a": 1}));

        assert_eq!(json_body.body_value(), json!({"json": {"a": 1}}));
        assert_eq!(form_body.body_value(), json!({"data": {"a": 1}}));
        assert_eq!(Invocation::new("f").body_value(), Value::Null);
    }

    #[test]
    fn all_arguments_collect_positional_and_named_values() {
        let invocation = Invocation::new("f").arg(&1).arg("two").extra("flag", &true);

        assert_eq!(
            invocation.all_arguments().to_value(),
            json!({"args": [1, "two"], "kwargs": {"flag": true}})
        );
    }
}

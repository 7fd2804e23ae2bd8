use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Payload sent with every POST, PUT and PATCH request.
pub const DEFAULT_BODY: &str = r#"{"name":"test","value":"test"}"#;

const ID: &str = "{id}";
const RANDOM_ID: &str = "{random_id}";
const DELETE_ID: &str = "{delete_id}";

// ids at the top of the dataset are reserved for DELETE requests
const DELETE_RESERVE: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid endpoint format: {0} (expected METHOD:PATH)")]
    InvalidFormat(String),

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("at least one endpoint must be specified")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry the default body.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl FromStr for Method {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(EndpointError::InvalidMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request target, parsed from a `METHOD:PATH` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    pub path: String,
    pub body: Option<&'static str>,
    pub has_dynamic_id: bool, // path contains {id}, {random_id} or {delete_id}
}

impl Endpoint {
    /// Parse `METHOD:PATH`. Only the first colon splits, so paths may contain colons.
    pub fn parse(spec: &str) -> Result<Self, EndpointError> {
        let (method, path) = spec
            .split_once(':')
            .ok_or_else(|| EndpointError::InvalidFormat(spec.to_string()))?;

        let method = method.trim().to_uppercase();
        let path = path.trim();
        if method.is_empty() || path.is_empty() {
            return Err(EndpointError::InvalidFormat(spec.to_string()));
        }

        let method: Method = method.parse()?;
        let has_dynamic_id =
            path.contains(ID) || path.contains(RANDOM_ID) || path.contains(DELETE_ID);

        Ok(Endpoint {
            method,
            path: path.to_string(),
            body: method.has_body().then_some(DEFAULT_BODY),
            has_dynamic_id,
        })
    }

    /// Path for one request, with any id placeholders replaced.
    pub fn resolve_path(&self, ids: &IdRange) -> Cow<'_, str> {
        if !self.has_dynamic_id {
            return Cow::Borrowed(&self.path);
        }

        let mut path = self.path.clone();
        if path.contains(DELETE_ID) {
            path = path.replace(DELETE_ID, &ids.delete_id().to_string());
        }
        if path.contains(ID) || path.contains(RANDOM_ID) {
            // one id per request, shared by both placeholders
            let id = ids.read_id().to_string();
            path = path.replace(ID, &id).replace(RANDOM_ID, &id);
        }
        Cow::Owned(path)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.path)
    }
}

/// Parse every endpoint, failing on the first invalid one.
pub fn parse_endpoints<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Endpoint>, EndpointError> {
    if specs.is_empty() {
        return Err(EndpointError::Empty);
    }
    specs.iter().map(|s| Endpoint::parse(s.as_ref())).collect()
}

/// Id ranges drawn from when resolving placeholders against a pre-populated dataset.
///
/// Reads and updates use the low part of the dataset while deletes use the
/// top 1000 ids, so a delete never removes an item another request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    dataset_size: usize,
}

impl IdRange {
    pub fn new(dataset_size: usize) -> Self {
        IdRange { dataset_size }
    }

    /// Random id for GET/PUT style requests.
    pub fn read_id(&self) -> usize {
        match self.dataset_size {
            0 => 1,
            size if size <= DELETE_RESERVE => fastrand::usize(1..=size),
            size => fastrand::usize(1..=size - DELETE_RESERVE),
        }
    }

    /// Random id for DELETE requests.
    pub fn delete_id(&self) -> usize {
        match self.dataset_size {
            0 => 1,
            size if size <= DELETE_RESERVE => size,
            size => fastrand::usize(size - DELETE_RESERVE + 1..=size),
        }
    }
}

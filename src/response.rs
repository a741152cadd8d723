//! Canned responses and first-match dispatch.
//!
//! A [`ResponseSet`] holds the configured rules in insertion order. Lookup is
//! a linear scan: the first rule whose method and path predicates both hold
//! answers the request, and [`DEFAULT_RESPONSE`] answers everything else.

use crate::config::ResponseConfig;
use crate::error::BuildError;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::StatusCode;
use regex::Regex;
use std::collections::HashSet;
use std::io::{self, Write};
use tracing::{error, info, warn};

/// Body of the default response.
pub const EMPTY_OBJECT: &str = "{}";

/// Content type of the default response.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Shared fallback returned when no rule matches.
pub static DEFAULT_RESPONSE: Response = Response::Default;

/// A reply unit: decides whether it handles a request and what to send back.
#[derive(Debug, Clone)]
pub enum Response {
    /// Matches everything; answers 200 with an empty JSON object.
    Default,
    /// Rule built from configuration.
    Pattern(PatternResponse),
}

/// Rule that matches on method and on a regex searched in the path.
#[derive(Debug, Clone)]
pub struct PatternResponse {
    path_pattern: Option<Regex>,
    methods: HashSet<String>,
    status_code: u16,
    content_type: String,
    body: Bytes,
    skip_capture: bool,
}

impl PatternResponse {
    /// True when no methods are configured or `method` is one of them.
    pub fn match_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// True when no pattern is configured or the pattern is found anywhere
    /// in `path`. Rules anchor with `^...$` when they need a full match.
    pub fn match_path(&self, path: &str) -> bool {
        match &self.path_pattern {
            Some(pattern) => pattern.is_match(path),
            None => true,
        }
    }

    pub fn path_pattern(&self) -> Option<&Regex> {
        self.path_pattern.as_ref()
    }

    pub fn methods(&self) -> &HashSet<String> {
        &self.methods
    }
}

impl Response {
    /// Build a rule from its configuration entry.
    ///
    /// An empty `pathPattern` means any path, an empty `body` means no
    /// payload and a `returnCode` of 0 or below means 200.
    pub fn from_config(config: &ResponseConfig) -> Result<Self, BuildError> {
        let mut builder = ResponseBuilder::new()
            .methods(config.methods.iter().cloned())
            .content_type(config.content_type.clone())
            .skip_capture(config.skip_capture);

        if !config.path_pattern.is_empty() {
            builder = builder.path_pattern(config.path_pattern.clone());
        }
        if !config.body.is_empty() {
            let body = base64::engine::general_purpose::STANDARD.decode(&config.body)?;
            builder = builder.body(&body);
        }
        if config.return_code > 0 {
            if !(100..=999).contains(&config.return_code) {
                return Err(BuildError::Status(config.return_code));
            }
            builder = builder.status_code(config.return_code);
        }
        builder.build()
    }

    /// Whether this response handles a request with the given method and path.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        match self {
            Response::Default => true,
            Response::Pattern(r) => r.match_method(method) && r.match_path(path),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Response::Default => 200,
            Response::Pattern(r) => r.status_code,
        }
    }

    /// Content type of the reply. Empty means the header is omitted.
    pub fn content_type(&self) -> &str {
        match self {
            Response::Default => DEFAULT_CONTENT_TYPE,
            Response::Pattern(r) => &r.content_type,
        }
    }

    /// If true, requests answered by this response are not captured.
    pub fn skip_capture(&self) -> bool {
        match self {
            Response::Default => false,
            Response::Pattern(r) => r.skip_capture,
        }
    }

    /// Write the payload to `sink`. Fails only if the sink fails.
    pub fn write_body<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        let payload = self.payload();
        if payload.is_empty() {
            return Ok(());
        }
        sink.write_all(&payload)
    }

    fn payload(&self) -> Bytes {
        match self {
            Response::Default => Bytes::from_static(EMPTY_OBJECT.as_bytes()),
            Response::Pattern(r) => r.body.clone(),
        }
    }

    /// Render the outbound HTTP response.
    pub fn to_http(&self) -> hyper::Response<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or_else(|_| {
            error!(status = self.status_code(), "Unusable status code, answering 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let mut builder = hyper::Response::builder().status(status);
        if !self.content_type().is_empty() {
            builder = builder.header(CONTENT_TYPE, self.content_type());
        }

        builder.body(Full::new(self.payload())).unwrap_or_else(|e| {
            error!(error = %e, "Unable to assemble the response");
            let mut fallback = hyper::Response::new(Full::new(Bytes::new()));
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

/// Assembles a [`Response`] from independently set fields.
///
/// Unset fields fall back to: any path, any method, status 200, no content
/// type, no body, capture enabled. Only the path pattern can make
/// [`build`](Self::build) fail.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuilder {
    path_pattern: Option<String>,
    methods: Vec<String>,
    status_code: i64,
    content_type: String,
    body: Option<Vec<u8>>,
    skip_capture: bool,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regex searched (unanchored) in the request path.
    pub fn path_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.path_pattern = Some(pattern.into());
        self
    }

    /// Add an accepted method. Duplicates collapse.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(methods.into_iter().map(Into::into));
        self
    }

    /// Status code; zero or negative values become 200.
    pub fn status_code(mut self, code: i64) -> Self {
        self.status_code = code;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Body of the reply. The bytes are copied.
    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = Some(body.to_vec());
        self
    }

    pub fn skip_capture(mut self, skip_capture: bool) -> Self {
        self.skip_capture = skip_capture;
        self
    }

    pub fn build(&self) -> Result<Response, BuildError> {
        let path_pattern = self
            .path_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        let status_code = if self.status_code <= 0 {
            200
        } else {
            u16::try_from(self.status_code).unwrap_or(u16::MAX)
        };

        Ok(Response::Pattern(PatternResponse {
            path_pattern,
            methods: self.methods.iter().cloned().collect(),
            status_code,
            content_type: self.content_type.clone(),
            body: self
                .body
                .as_deref()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
            skip_capture: self.skip_capture,
        }))
    }
}

/// Ordered rule registry. Built once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ResponseSet {
    responses: Vec<Response>,
}

impl ResponseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the set from configuration. Invalid rules are logged and
    /// skipped; the remaining rules keep their relative order.
    pub fn from_configs(configs: &[ResponseConfig]) -> Self {
        let mut set = Self::new();
        for (index, config) in configs.iter().enumerate() {
            match Response::from_config(config) {
                Ok(response) => set.add_response(response),
                Err(e) => warn!(index, error = %e, "Bad response definition, rule skipped"),
            }
        }
        info!(
            rules = set.len(),
            skipped = configs.len() - set.len(),
            "Response rules loaded"
        );
        set
    }

    /// Append a rule. Earlier rules take precedence.
    pub fn add_response(&mut self, response: Response) {
        self.responses.push(response);
    }

    /// First registered rule matching the request, or [`DEFAULT_RESPONSE`].
    pub fn find(&self, method: &str, path: &str) -> &Response {
        self.responses
            .iter()
            .find(|r| r.matches(method, path))
            .unwrap_or(&DEFAULT_RESPONSE)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Check `paths` against `pattern` the same way a rule matches paths.
pub fn probe_pattern<'a>(
    pattern: &str,
    paths: &'a [String],
) -> Result<Vec<(&'a str, bool)>, BuildError> {
    let rule = ResponseBuilder::new().path_pattern(pattern).build()?;
    Ok(paths
        .iter()
        .map(|path| (path.as_str(), rule.matches("", path)))
        .collect())
}

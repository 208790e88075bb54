//! Bounded HTTP client for probes and declared actions, plus the response
//! validators that map a probe response to a verdict.

use regex::Regex;
use reqwest::redirect::Policy;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use crate::error::{OpsdeckError, Result};
use crate::transport::jsonpath;

/// Response bodies are read up to this many bytes; the rest is discarded.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

const MAX_REDIRECTS: usize = 3;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    /// Execute with a hard deadline. Transport failures surface as
    /// `Transport`, deadline hits as `Timeout`; non-2xx responses are
    /// returned to the caller for verdict mapping, not treated as errors.
    pub async fn execute(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        let url = Url::parse(&request.url)
            .map_err(|e| OpsdeckError::Validation(format!("invalid url \"{}\": {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(OpsdeckError::Validation(format!(
                "url scheme must be http or https, got \"{}\"",
                url.scheme()
            )));
        }

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| OpsdeckError::Validation(format!("invalid method \"{}\"", request.method)))?;

        let mut builder = self.client.request(method, url).timeout(timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let mut response = builder.send().await.map_err(classify_reqwest)?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify_reqwest)? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                body.extend_from_slice(&chunk[..MAX_BODY_BYTES - body.len()]);
                debug!(url = %request.url, "response body truncated at {} bytes", MAX_BODY_BYTES);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}

fn classify_reqwest(err: reqwest::Error) -> OpsdeckError {
    if err.is_timeout() {
        OpsdeckError::Timeout(format!("request timed out: {err}"))
    } else if err.is_connect() {
        OpsdeckError::Transport(format!("connection failed: {err}"))
    } else if err.is_redirect() {
        OpsdeckError::Transport(format!("too many redirects: {err}"))
    } else {
        OpsdeckError::Transport(err.to_string())
    }
}

/// Status-code validator
pub fn validate_status_code(response: &HttpResponse, expected: u16) -> bool {
    response.status == expected
}

/// JSON-regex validator. An unparseable body or a missing path means false.
pub fn validate_json_regex(response: &HttpResponse, path: &str, pattern: &str) -> bool {
    let Some(body) = response.json() else {
        return false;
    };
    let Ok(re) = Regex::new(pattern) else {
        return false;
    };
    match jsonpath::evaluate_strings(&body, path) {
        Ok(values) => values.iter().any(|v| re.is_match(v)),
        Err(_) => false,
    }
}

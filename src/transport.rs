use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

use crate::config::Settings;
use crate::error::SeqTaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Search,
    Fetch,
    Summary,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Search => "esearch.fcgi",
            Endpoint::Fetch => "efetch.fcgi",
            Endpoint::Summary => "esummary.fcgi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One E-utilities call: endpoint, HTTP method and its query/form pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EutilsRequest {
    pub method: Method,
    pub endpoint: Endpoint,
    pub params: Vec<(String, String)>,
}

impl EutilsRequest {
    pub fn get(endpoint: Endpoint) -> Self {
        Self {
            method: Method::Get,
            endpoint,
            params: Vec::new(),
        }
    }

    pub fn post(endpoint: Endpoint) -> Self {
        Self {
            method: Method::Post,
            endpoint,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

/// Closed classification of everything that can go wrong on the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Transient(_) => "Transient",
            TransportError::RateLimited(_) => "RateLimited",
            TransportError::Malformed(_) => "Malformed",
            TransportError::Fatal(_) => "Fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Fatal(_))
    }

    /// Maps a non-success HTTP status onto the retry classes. Entrez answers
    /// sporadic 400s under load, so those are treated as transient too.
    pub fn from_status(status: u16, body: &str) -> Option<Self> {
        let message = format!("HTTP {status}: {}", snippet(body));
        match status {
            200..=299 => None,
            429 => Some(TransportError::RateLimited(message)),
            400 | 500 | 502 | 503 | 504 => Some(TransportError::Transient(message)),
            _ => Some(TransportError::Fatal(message)),
        }
    }
}

fn snippet(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

pub trait Transport: Send + Sync {
    fn get(
        &self,
        endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<RawResponse, TransportError>;

    fn post(
        &self,
        endpoint: Endpoint,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError>;

    fn send(&self, request: &EutilsRequest) -> Result<RawResponse, TransportError> {
        match request.method {
            Method::Get => self.get(request.endpoint, &request.params),
            Method::Post => self.post(request.endpoint, &request.params),
        }
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn get(
        &self,
        endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        (**self).get(endpoint, params)
    }

    fn post(
        &self,
        endpoint: Endpoint,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        (**self).post(endpoint, form)
    }
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
    common: Vec<(String, String)>,
    request_delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, SeqTaxError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqtax/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SeqTaxError::NcbiHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| SeqTaxError::NcbiHttp(err.to_string()))?;

        let mut common = vec![("tool".to_string(), settings.tool.clone())];
        if let Some(email) = &settings.email {
            common.push(("email".to_string(), email.clone()));
        }
        if let Some(api_key) = &settings.api_key {
            common.push(("api_key".to_string(), api_key.clone()));
        }

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            common,
            request_delay: settings.request_delay,
            last_request: Mutex::new(None),
        })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}/{}", self.base_url, endpoint.path())
    }

    /// Keeps consecutive requests at least `request_delay` apart, across threads.
    fn throttle(&self) {
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.request_delay {
                thread::sleep(self.request_delay - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn finish(
        &self,
        response: Result<reqwest::blocking::Response, reqwest::Error>,
    ) -> Result<RawResponse, TransportError> {
        let response = response.map_err(classify_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify_error)?;
        Ok(RawResponse { status, body })
    }
}

impl Transport for HttpTransport {
    fn get(
        &self,
        endpoint: Endpoint,
        params: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        self.throttle();
        let response = self
            .client
            .get(self.url(endpoint))
            .query(params)
            .query(&self.common)
            .send();
        self.finish(response)
    }

    fn post(
        &self,
        endpoint: Endpoint,
        form: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        self.throttle();
        let mut fields = form.to_vec();
        fields.extend(self.common.iter().cloned());
        let response = self.client.post(self.url(endpoint)).form(&fields).send();
        self.finish(response)
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if is_retryable_error(&err) {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Fatal(err.to_string())
    }
}

// Body and decode errors cover responses cut off mid-transfer.
fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode()
}

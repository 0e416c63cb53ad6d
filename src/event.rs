//! Protocol events consumed by the correlator and the body-fetch seam.
//!
//! Events arrive as Chrome DevTools Protocol messages. Only the three
//! network lifecycle methods are mapped; everything else is ignored.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::storage::Headers;

pub const REQUEST_WILL_BE_SENT: &str = "Network.requestWillBeSent";
pub const RESPONSE_RECEIVED: &str = "Network.responseReceived";
pub const LOADING_FINISHED: &str = "Network.loadingFinished";
pub const GET_RESPONSE_BODY: &str = "Network.getResponseBody";

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    RequestInitiated(RequestInitiated),
    ResponseMetadata(ResponseMetadata),
    LoadingFinished(LoadingFinished),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestInitiated {
    pub exchange_id: String,
    pub resource_type: Option<String>,
    pub method: String,
    pub url: String,
    pub timestamp: f64,
    pub headers: Headers,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMetadata {
    pub exchange_id: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub mime_type: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadingFinished {
    pub exchange_id: String,
    pub encoded_data_length: u64,
    pub timestamp: f64,
}

impl NetworkEvent {
    pub fn exchange_id(&self) -> &str {
        match self {
            Self::RequestInitiated(event) => &event.exchange_id,
            Self::ResponseMetadata(event) => &event.exchange_id,
            Self::LoadingFinished(event) => &event.exchange_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestInitiated(_) => "request-initiated",
            Self::ResponseMetadata(_) => "response-metadata",
            Self::LoadingFinished(_) => "loading-finished",
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            Self::RequestInitiated(event) => event.timestamp,
            Self::ResponseMetadata(event) => event.timestamp,
            Self::LoadingFinished(event) => event.timestamp,
        }
    }

    /// Maps a CDP method and its params onto a network event. Methods outside
    /// the network lifecycle yield `Ok(None)`.
    pub fn from_cdp(method: &str, params: Value) -> anyhow::Result<Option<Self>> {
        let event = match method {
            REQUEST_WILL_BE_SENT => {
                let params: RequestWillBeSentParams =
                    serde_json::from_value(params).context("parse requestWillBeSent params")?;
                Self::RequestInitiated(RequestInitiated {
                    exchange_id: params.request_id,
                    resource_type: params.resource_type,
                    method: params.request.method,
                    url: params.request.url,
                    timestamp: params.timestamp,
                    headers: flatten_headers(params.request.headers),
                    body: params.request.post_data,
                })
            }
            RESPONSE_RECEIVED => {
                let params: ResponseReceivedParams =
                    serde_json::from_value(params).context("parse responseReceived params")?;
                Self::ResponseMetadata(ResponseMetadata {
                    exchange_id: params.request_id,
                    status: params.response.status,
                    status_text: params.response.status_text,
                    headers: flatten_headers(params.response.headers),
                    mime_type: params.response.mime_type,
                    timestamp: params.timestamp,
                })
            }
            LOADING_FINISHED => {
                let params: LoadingFinishedParams =
                    serde_json::from_value(params).context("parse loadingFinished params")?;
                Self::LoadingFinished(LoadingFinished {
                    exchange_id: params.request_id,
                    encoded_data_length: byte_count(params.encoded_data_length),
                    timestamp: params.timestamp,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWillBeSentParams {
    request_id: String,
    #[serde(rename = "type", default)]
    resource_type: Option<String>,
    timestamp: f64,
    request: CdpRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    post_data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseReceivedParams {
    request_id: String,
    timestamp: f64,
    response: CdpResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpResponse {
    status: u16,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    mime_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadingFinishedParams {
    request_id: String,
    timestamp: f64,
    #[serde(default)]
    encoded_data_length: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetResponseBodyParams {
    request_id: String,
    body: String,
    #[serde(default)]
    base64_encoded: bool,
}

fn flatten_headers(headers: BTreeMap<String, Value>) -> Headers {
    headers
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(text) => text,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect()
}

fn byte_count(length: f64) -> u64 {
    if length.is_finite() && length > 0.0 {
        length.round() as u64
    } else {
        0
    }
}

/// Body returned by an out-of-band fetch for one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub body: String,
    pub is_binary: bool,
}

/// Retrieves a response body after its exchange finished loading. Failure is
/// an expected outcome (evicted or cross-origin resources).
#[async_trait]
pub trait BodyFetcher: Send + Sync {
    async fn fetch_body(&self, exchange_id: &str) -> anyhow::Result<ResponseBody>;
}

/// Body fetcher answering from bodies captured alongside an event log.
#[derive(Debug, Clone, Default)]
pub struct RecordedBodies {
    bodies: HashMap<String, ResponseBody>,
}

impl RecordedBodies {
    pub fn insert(&mut self, exchange_id: impl Into<String>, body: ResponseBody) {
        self.bodies.insert(exchange_id.into(), body);
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

#[async_trait]
impl BodyFetcher for RecordedBodies {
    async fn fetch_body(&self, exchange_id: &str) -> anyhow::Result<ResponseBody> {
        self.bodies
            .get(exchange_id)
            .cloned()
            .ok_or_else(|| anyhow!("no resource with identifier `{exchange_id}` found"))
    }
}

#[derive(Debug, Deserialize)]
struct CdpMessage {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Network events and response bodies read from a JSON Lines capture log.
#[derive(Debug, Default)]
pub struct CaptureLog {
    pub events: Vec<NetworkEvent>,
    pub bodies: RecordedBodies,
    /// Messages whose method is not part of the network lifecycle.
    pub ignored: usize,
}

impl CaptureLog {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("open capture log {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("read capture log {}", path.display()))
    }

    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut log = Self::default();
        for (index, line) in reader.lines().enumerate() {
            let line_number = index + 1;
            let line = line.with_context(|| format!("read line {line_number}"))?;
            if line.trim().is_empty() {
                continue;
            }
            log.push_line(&line)
                .with_context(|| format!("line {line_number}"))?;
        }
        Ok(log)
    }

    fn push_line(&mut self, line: &str) -> anyhow::Result<()> {
        let message: CdpMessage = serde_json::from_str(line).context("parse CDP message")?;
        if message.method == GET_RESPONSE_BODY {
            let params: GetResponseBodyParams = serde_json::from_value(message.params)
                .context("parse getResponseBody params")?;
            self.bodies.insert(
                params.request_id,
                ResponseBody {
                    body: params.body,
                    is_binary: params.base64_encoded,
                },
            );
            return Ok(());
        }

        match NetworkEvent::from_cdp(&message.method, message.params)? {
            Some(event) => self.events.push(event),
            None => self.ignored += 1,
        }
        Ok(())
    }
}

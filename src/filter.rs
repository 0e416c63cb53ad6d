use std::str::FromStr;

use serde::Serialize;

use crate::{classify::ContentTypeTag, storage::CapturedExchange};

/// Status code class used by `--status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Redirect,
    ClientError,
    ServerError,
}

impl StatusClass {
    pub fn of(status: u16) -> Option<Self> {
        match status {
            200..=299 => Some(Self::Success),
            300..=399 => Some(Self::Redirect),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::Redirect => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
        }
    }
}

impl FromStr for StatusClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2xx" => Ok(Self::Success),
            "3xx" => Ok(Self::Redirect),
            "4xx" => Ok(Self::ClientError),
            "5xx" => Ok(Self::ServerError),
            other => Err(format!(
                "unknown status class `{other}`; expected one of 2xx, 3xx, 4xx, 5xx"
            )),
        }
    }
}

/// Human label for a response status; `None` means no response was seen.
pub fn describe_status(status: Option<u16>) -> &'static str {
    match status {
        Some(200..=299) => "success",
        Some(300..=399) => "redirect",
        Some(400..=499) => "client error",
        Some(500..=u16::MAX) => "server error",
        _ => "unknown",
    }
}

/// Conjunction of optional criteria; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ExchangeFilter {
    /// Case-insensitive substring of the URL.
    pub search: Option<String>,
    pub content_type: Option<ContentTypeTag>,
    pub status: Option<StatusClass>,
    pub method: Option<String>,
}

impl ExchangeFilter {
    pub fn matches(&self, exchange: &CapturedExchange) -> bool {
        if let Some(search) = self.search.as_deref().filter(|search| !search.is_empty()) {
            if !exchange
                .url
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        if self
            .content_type
            .is_some_and(|content_type| exchange.content_type != content_type)
        {
            return false;
        }
        if let Some(class) = self.status {
            if exchange.response_status.and_then(StatusClass::of) != Some(class) {
                return false;
            }
        }
        if let Some(method) = self.method.as_deref() {
            if !exchange.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        true
    }

    pub fn apply<'a>(&self, exchanges: &'a [CapturedExchange]) -> Vec<&'a CapturedExchange> {
        exchanges
            .iter()
            .filter(|exchange| self.matches(exchange))
            .collect()
    }
}

/// Per-type counts shown by `stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub total: usize,
    pub html: usize,
    pub css: usize,
    pub javascript: usize,
    pub image: usize,
    pub other: usize,
}

impl TypeStats {
    pub fn collect<'a>(exchanges: impl IntoIterator<Item = &'a CapturedExchange>) -> Self {
        let mut stats = Self::default();
        for exchange in exchanges {
            stats.total += 1;
            match exchange.content_type {
                ContentTypeTag::Html => stats.html += 1,
                ContentTypeTag::Css => stats.css += 1,
                ContentTypeTag::Javascript => stats.javascript += 1,
                ContentTypeTag::Image => stats.image += 1,
                _ => stats.other += 1,
            }
        }
        stats
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rendered = format!("{value:.2}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered} {}", UNITS[unit])
}

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse content category derived from a response MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentTypeTag {
    Html,
    Css,
    Javascript,
    Json,
    Image,
    Font,
    Video,
    Audio,
    Other,
    #[default]
    Unknown,
}

impl ContentTypeTag {
    pub const ALL: [ContentTypeTag; 10] = [
        Self::Html,
        Self::Css,
        Self::Javascript,
        Self::Json,
        Self::Image,
        Self::Font,
        Self::Video,
        Self::Audio,
        Self::Other,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Css => "css",
            Self::Javascript => "javascript",
            Self::Json => "json",
            Self::Image => "image",
            Self::Font => "font",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    /// Tag to record once response metadata has been seen. A response without
    /// a MIME type still resolves (to `Other`), and a resolved tag is kept
    /// when a later response carries no MIME type.
    pub fn resolve_response(self, mime_type: &str) -> ContentTypeTag {
        match classify(mime_type) {
            Self::Unknown if self != Self::Unknown => self,
            Self::Unknown => Self::Other,
            resolved => resolved,
        }
    }
}

impl std::fmt::Display for ContentTypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownContentType(String);

impl std::fmt::Display for UnknownContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown content type `{}`; expected one of html, css, javascript, json, image, font, video, audio, other, unknown",
            self.0
        )
    }
}

impl std::error::Error for UnknownContentType {}

impl FromStr for ContentTypeTag {
    type Err = UnknownContentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str() == normalized)
            .ok_or_else(|| UnknownContentType(s.to_owned()))
    }
}

/// Maps a MIME type to its [`ContentTypeTag`].
///
/// Parameters such as `; charset=utf-8` and letter case are ignored. Exact
/// types are checked before the `image/`, `font/`, `video/` and `audio/`
/// families; an empty input is `Unknown` and anything unmatched is `Other`.
pub fn classify(mime_type: &str) -> ContentTypeTag {
    let essence = mime_essence(mime_type);
    if essence.is_empty() {
        return ContentTypeTag::Unknown;
    }

    match essence.as_str() {
        "text/html" => ContentTypeTag::Html,
        "text/css" => ContentTypeTag::Css,
        "application/javascript" | "text/javascript" => ContentTypeTag::Javascript,
        "application/json" => ContentTypeTag::Json,
        other if other.starts_with("image/") => ContentTypeTag::Image,
        other if other.starts_with("font/") => ContentTypeTag::Font,
        other if other.starts_with("video/") => ContentTypeTag::Video,
        other if other.starts_with("audio/") => ContentTypeTag::Audio,
        _ => ContentTypeTag::Other,
    }
}

/// `type/subtype` portion of a MIME type, lowercased and trimmed.
pub(crate) fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Subtype of a MIME type (`png` for `image/png`), if one is present.
pub(crate) fn mime_subtype(mime_type: &str) -> Option<String> {
    let essence = mime_essence(mime_type);
    let (_, subtype) = essence.split_once('/')?;
    let subtype = subtype.trim();
    (!subtype.is_empty()).then(|| subtype.to_owned())
}

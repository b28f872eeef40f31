use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

const RELATIVE_URL_BASE: &str = "http://relative.invalid/";

/// Lookup key for recorded exchanges.
///
/// Only the uppercased method and the URL path take part in matching; scheme, host,
/// port, query and fragment are dropped when the key is derived.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EndpointKey {
    pub method: String,
    pub path: String,
}

impl EndpointKey {
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.into(),
        }
    }

    /// Derives the key for a request URL. Relative URLs (as found in some hand-edited
    /// HAR files) resolve against a placeholder origin so their path still matches.
    pub fn from_url(method: &str, raw_url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(method, url_path(raw_url)?))
    }
}

pub fn url_path(raw_url: &str) -> Result<String, url::ParseError> {
    let base = Url::parse(RELATIVE_URL_BASE)?;
    let url = Url::options().base_url(Some(&base)).parse(raw_url)?;
    Ok(url.path().to_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Text,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBody {
    pub content: String,
    pub encoding: BodyEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One captured request/response pair, normalized at load time and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedExchange {
    pub key: EndpointKey,
    pub url: String,
    pub status: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: Option<RecordedBody>,
}

#[derive(Debug)]
pub enum MalformedRecording {
    Shape(serde_json::Error),
    MissingRequest,
    MissingResponse,
    MissingMethod,
    MissingUrl,
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    InvalidStatus(i64),
}

impl MalformedRecording {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shape(_) => "invalid_shape",
            Self::MissingRequest => "missing_request",
            Self::MissingResponse => "missing_response",
            Self::MissingMethod => "missing_method",
            Self::MissingUrl => "missing_url",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::InvalidStatus(_) => "invalid_status",
        }
    }
}

impl std::fmt::Display for MalformedRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shape(err) => write!(f, "entry does not look like a HAR entry: {err}"),
            Self::MissingRequest => f.write_str("entry has no request"),
            Self::MissingResponse => f.write_str("entry has no response"),
            Self::MissingMethod => f.write_str("request has no method"),
            Self::MissingUrl => f.write_str("request has no url"),
            Self::InvalidUrl { url, source } => write!(f, "request url `{url}` is invalid: {source}"),
            Self::InvalidStatus(status) => write!(f, "response status `{status}` is not replayable"),
        }
    }
}

impl std::error::Error for MalformedRecording {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shape(source) => Some(source),
            Self::InvalidUrl { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    request: Option<HarRequest>,
    response: Option<HarResponse>,
}

#[derive(Debug, Deserialize)]
struct HarRequest {
    method: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HarResponse {
    status: i64,
    #[serde(default)]
    headers: Vec<HeaderEntry>,
    content: Option<HarContent>,
}

#[derive(Debug, Deserialize)]
struct HarContent {
    text: Option<String>,
    encoding: Option<String>,
}

impl RecordedExchange {
    pub fn from_har_entry(entry: &Value) -> Result<Self, MalformedRecording> {
        let entry = HarEntry::deserialize(entry).map_err(MalformedRecording::Shape)?;
        let request = entry.request.ok_or(MalformedRecording::MissingRequest)?;
        let response = entry.response.ok_or(MalformedRecording::MissingResponse)?;
        let method = request
            .method
            .filter(|method| !method.trim().is_empty())
            .ok_or(MalformedRecording::MissingMethod)?;
        let url = request
            .url
            .filter(|url| !url.is_empty())
            .ok_or(MalformedRecording::MissingUrl)?;
        let key = EndpointKey::from_url(method.trim(), &url).map_err(|source| {
            MalformedRecording::InvalidUrl {
                url: url.clone(),
                source,
            }
        })?;
        let status = u16::try_from(response.status)
            .ok()
            .filter(|status| (100..=599).contains(status))
            .ok_or(MalformedRecording::InvalidStatus(response.status))?;

        let body = response.content.and_then(|content| {
            let text = content.text.filter(|text| !text.is_empty())?;
            let encoding = match content.encoding.as_deref() {
                Some(encoding) if encoding.eq_ignore_ascii_case("base64") => BodyEncoding::Base64,
                _ => BodyEncoding::Text,
            };
            Some(RecordedBody {
                content: text,
                encoding,
            })
        });

        Ok(Self {
            key,
            url,
            status,
            headers: response.headers,
            body,
        })
    }
}

/// Returns `log.entries` of a HAR document, or `None` when the document has no entry list.
pub fn har_entries(document: &Value) -> Option<&[Value]> {
    document
        .get("log")?
        .get("entries")?
        .as_array()
        .map(Vec::as_slice)
}

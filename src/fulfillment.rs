use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::{
    har::{BodyEncoding, EndpointKey, HeaderEntry, RecordedExchange},
    index::ReplayIndex,
};

/// Response headers that describe the recorded transfer rather than the payload. The
/// browser re-frames fulfilled bodies, so replaying these would corrupt the response.
const STRIPPED_RESPONSE_HEADERS: [&str; 4] = [
    "content-encoding",
    "transfer-encoding",
    "connection",
    "content-length",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRequest {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub endpoint: EndpointKey,
    pub status: u16,
    pub headers: Vec<HeaderEntry>,
    /// Base64 of the response body, as the interception capability expects it.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Fulfill(Fulfillment),
    PassThrough,
}

#[derive(Debug)]
pub enum FulfillmentError {
    InvalidRequestUrl {
        url: String,
        source: url::ParseError,
    },
}

impl std::fmt::Display for FulfillmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequestUrl { url, source } => {
                write!(f, "derive endpoint from live request url `{url}`: {source}")
            }
        }
    }
}

impl std::error::Error for FulfillmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRequestUrl { source, .. } => Some(source),
        }
    }
}

/// Decides how to answer an intercepted request.
///
/// Consumes the endpoint's next recording when one exists. Any failure degrades to
/// `PassThrough`, so the live request is always released.
pub fn handle(index: &mut ReplayIndex, request: &LiveRequest) -> Action {
    match try_fulfill(index, request) {
        Ok(Some(fulfillment)) => Action::Fulfill(fulfillment),
        Ok(None) => Action::PassThrough,
        Err(err) => {
            tracing::warn!(
                method = %request.method,
                url = %request.url,
                "replay failed, passing request through: {err}"
            );
            Action::PassThrough
        }
    }
}

fn try_fulfill(
    index: &mut ReplayIndex,
    request: &LiveRequest,
) -> Result<Option<Fulfillment>, FulfillmentError> {
    let key = EndpointKey::from_url(&request.method, &request.url).map_err(|source| {
        FulfillmentError::InvalidRequestUrl {
            url: request.url.clone(),
            source,
        }
    })?;
    let Some(exchange) = index.consume_next(&key) else {
        return Ok(None);
    };
    Ok(Some(build_fulfillment(&exchange)))
}

pub fn build_fulfillment(exchange: &RecordedExchange) -> Fulfillment {
    let headers = exchange
        .headers
        .iter()
        .filter(|header| is_replayable_header(&header.name))
        .cloned()
        .collect();

    let body = match exchange.body.as_ref() {
        None => String::new(),
        Some(body) => match body.encoding {
            BodyEncoding::Text => BASE64.encode(body.content.as_bytes()),
            // Handed over as recorded; the browser decodes it.
            BodyEncoding::Base64 => body.content.clone(),
        },
    };

    Fulfillment {
        endpoint: exchange.key.clone(),
        status: exchange.status,
        headers,
        body,
    }
}

/// HTTP/2 pseudo-headers (`:status`, ...) show up in some HAR exports and cannot be sent as
/// regular response headers either.
fn is_replayable_header(name: &str) -> bool {
    !name.starts_with(':')
        && !STRIPPED_RESPONSE_HEADERS
            .iter()
            .any(|stripped| name.eq_ignore_ascii_case(stripped))
}

//! Native messaging transport between the host and the browser extension.
//!
//! Each message is a 4-byte length in native byte order followed by that many bytes of
//! UTF-8 JSON. The extension relays browser events to the host and runs the commands the
//! host sends back; every command carries an id that the extension echoes in its reply.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::{mpsc, oneshot},
};

use crate::{
    controller::{BrowserEvent, ControlCommand, ControlEvent},
    fulfillment::Fulfillment,
    har::HeaderEntry,
    interception::{
        CapabilityError, FulfillError, InterceptionCapability, PausedRequestId, TabId, Unanswered,
    },
    navigation::{TabControl, TabInfo},
};

/// Largest message the browser accepts from a native host.
pub const MAX_OUTBOUND_FRAME_BYTES: usize = 1024 * 1024;
/// Largest message the browser sends to a native host.
pub const MAX_INBOUND_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    TooLarge { len: usize, limit: usize },
    Json(serde_json::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "native messaging i/o: {err}"),
            Self::TooLarge { len, limit } => {
                write!(f, "native message of {len} bytes exceeds the {limit} byte limit")
            }
            Self::Json(err) => write!(f, "native message JSON: {err}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::TooLarge { .. } => None,
        }
    }
}

/// Serializes `message` into one outbound frame, length prefix included.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message).map_err(FrameError::Json)?;
    if payload.len() > MAX_OUTBOUND_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            limit: MAX_OUTBOUND_FRAME_BYTES,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        limit: MAX_OUTBOUND_FRAME_BYTES,
    })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_ne_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads one frame payload. Returns `None` when the stream ends cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0_u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(FrameError::Io(err)),
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > limit {
        return Err(FrameError::TooLarge { len, limit });
    }
    let mut payload = vec![0_u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(FrameError::Io)?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<(), FrameError> {
    writer.write_all(frame).await.map_err(FrameError::Io)?;
    writer.flush().await.map_err(FrameError::Io)
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BrowserCommand {
    Attach {
        tab_id: TabId,
    },
    Detach {
        tab_id: TabId,
    },
    EnablePause {
        tab_id: TabId,
        patterns: Vec<String>,
    },
    Fulfill {
        tab_id: TabId,
        request_id: String,
        response_code: u16,
        response_headers: Vec<HeaderEntry>,
        body: String,
    },
    Continue {
        tab_id: TabId,
        request_id: String,
    },
    NavigateTab {
        tab_id: TabId,
        url: String,
    },
    GetTabUrl {
        tab_id: TabId,
    },
    ListTabs,
}

impl BrowserCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Detach { .. } => "detach",
            Self::EnablePause { .. } => "enablePause",
            Self::Fulfill { .. } => "fulfill",
            Self::Continue { .. } => "continue",
            Self::NavigateTab { .. } => "navigateTab",
            Self::GetTabUrl { .. } => "getTabUrl",
            Self::ListTabs => "listTabs",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    Command {
        id: u64,
        #[serde(flatten)]
        command: BrowserCommand,
    },
    ControlReply {
        id: u64,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        #[serde(flatten)]
        event: ControlEvent,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtensionMessage {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    BrowserEvent {
        #[serde(flatten)]
        event: BrowserEvent,
    },
    Control {
        id: u64,
        #[serde(flatten)]
        command: ControlCommand,
    },
}

#[derive(Debug)]
pub enum BridgeError {
    Frame(FrameError),
    /// The channel was gone before the command was queued.
    Closed,
    /// The channel closed while the command waited for its reply.
    Abandoned {
        command: &'static str,
    },
    Timeout {
        command: &'static str,
        after: Duration,
    },
    Rejected {
        command: &'static str,
        message: String,
    },
    MalformedReply {
        command: &'static str,
        source: serde_json::Error,
    },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Closed => f.write_str("native messaging channel closed"),
            Self::Abandoned { command } => {
                write!(f, "native messaging channel closed before `{command}` was answered")
            }
            Self::Timeout { command, after } => {
                write!(f, "`{command}` got no reply within {}ms", after.as_millis())
            }
            Self::Rejected { command, message } => write!(f, "`{command}` failed: {message}"),
            Self::MalformedReply { command, source } => {
                write!(f, "malformed `{command}` reply: {source}")
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Frame(err) => Some(err),
            Self::MalformedReply { source, .. } => Some(source),
            Self::Closed
            | Self::Abandoned { .. }
            | Self::Timeout { .. }
            | Self::Rejected { .. } => None,
        }
    }
}

impl BridgeError {
    /// Whether the extension may have run the command even though no result came back.
    pub fn outcome_unknown(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Abandoned { .. })
    }
}

impl From<BridgeError> for CapabilityError {
    fn from(err: BridgeError) -> Self {
        CapabilityError::new(err.to_string())
    }
}

type Reply = Result<Value, String>;

/// Browser capabilities reached through the extension.
///
/// Commands are written to the outbound frame queue; replies are routed back by
/// [`BridgeClient::resolve`], which the inbound reader calls for every `reply` message.
pub struct BridgeClient {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl BridgeClient {
    pub fn new(outbound: mpsc::Sender<Vec<u8>>, timeout: Duration) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    pub async fn call(&self, command: BrowserCommand) -> Result<Value, BridgeError> {
        let name = command.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame =
            encode_frame(&HostMessage::Command { id, command }).map_err(BridgeError::Frame)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending().insert(id, reply_tx);
        if self.outbound.send(frame).await.is_err() {
            self.pending().remove(&id);
            return Err(BridgeError::Closed);
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(BridgeError::Rejected {
                command: name,
                message,
            }),
            Ok(Err(_)) => Err(BridgeError::Abandoned { command: name }),
            Err(_) => {
                self.pending().remove(&id);
                tracing::warn!(command_id = id, command = name, "browser command timed out");
                Err(BridgeError::Timeout {
                    command: name,
                    after: self.timeout,
                })
            }
        }
    }

    /// Completes the call waiting on `id`. Returns `false` for ids nobody waits on.
    pub fn resolve(&self, id: u64, ok: bool, result: Option<Value>, error: Option<String>) -> bool {
        let Some(reply_tx) = self.pending().remove(&id) else {
            tracing::debug!(command_id = id, "dropping reply for unknown command");
            return false;
        };
        let reply = if ok {
            Ok(result.unwrap_or(Value::Null))
        } else {
            Err(error.unwrap_or_else(|| "extension reported an error".to_owned()))
        };
        let _ = reply_tx.send(reply);
        true
    }

    /// Fails every waiting call with [`BridgeError::Abandoned`].
    pub fn close(&self) {
        self.pending().clear();
    }

    async fn call_unit(&self, command: BrowserCommand) -> Result<(), CapabilityError> {
        self.call(command).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TabUrlReply {
    #[serde(default)]
    url: Option<String>,
}

#[async_trait]
impl InterceptionCapability for BridgeClient {
    async fn attach(&self, tab: TabId) -> Result<(), CapabilityError> {
        self.call_unit(BrowserCommand::Attach { tab_id: tab }).await
    }

    async fn enable_pause(&self, tab: TabId, patterns: &[String]) -> Result<(), CapabilityError> {
        self.call_unit(BrowserCommand::EnablePause {
            tab_id: tab,
            patterns: patterns.to_vec(),
        })
        .await
    }

    async fn detach(&self, tab: TabId) -> Result<(), CapabilityError> {
        self.call_unit(BrowserCommand::Detach { tab_id: tab }).await
    }

    async fn fulfill(
        &self,
        tab: TabId,
        request_id: PausedRequestId,
        fulfillment: &Fulfillment,
    ) -> Result<(), FulfillError> {
        let command = BrowserCommand::Fulfill {
            tab_id: tab,
            request_id: request_id.as_str().to_owned(),
            response_code: fulfillment.status,
            response_headers: fulfillment.headers.clone(),
            body: fulfillment.body.clone(),
        };
        match self.call(command).await {
            Ok(_) => Ok(()),
            Err(err) if err.outcome_unknown() => Err(FulfillError::Indeterminate(err.into())),
            Err(err) => Err(FulfillError::Unanswered(Unanswered {
                request_id,
                error: err.into(),
            })),
        }
    }

    async fn continue_request(
        &self,
        tab: TabId,
        request_id: PausedRequestId,
    ) -> Result<(), CapabilityError> {
        self.call_unit(BrowserCommand::Continue {
            tab_id: tab,
            request_id: request_id.as_str().to_owned(),
        })
        .await
    }
}

#[async_trait]
impl TabControl for BridgeClient {
    async fn navigate_tab(&self, tab: TabId, url: &str) -> Result<(), CapabilityError> {
        self.call_unit(BrowserCommand::NavigateTab {
            tab_id: tab,
            url: url.to_owned(),
        })
        .await
    }

    async fn get_tab_url(&self, tab: TabId) -> Result<Option<String>, CapabilityError> {
        let reply = self.call(BrowserCommand::GetTabUrl { tab_id: tab }).await?;
        let reply: TabUrlReply =
            serde_json::from_value(reply).map_err(|source| BridgeError::MalformedReply {
                command: "getTabUrl",
                source,
            })?;
        Ok(reply.url)
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, CapabilityError> {
        let reply = self.call(BrowserCommand::ListTabs).await?;
        let tabs = serde_json::from_value(reply).map_err(|source| BridgeError::MalformedReply {
            command: "listTabs",
            source,
        })?;
        Ok(tabs)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::{Value, json};
    use tokio::{io::AsyncWriteExt as _, sync::mpsc};

    use super::{
        BridgeClient, BridgeError, BrowserCommand, ExtensionMessage, FrameError, HostMessage,
        MAX_OUTBOUND_FRAME_BYTES, encode_frame, read_frame,
    };
    use crate::{
        controller::{BrowserEvent, ControlCommand},
        fulfillment::Fulfillment,
        har::{EndpointKey, HeaderEntry},
        interception::{FulfillError, InterceptionCapability, PausedRequestId, TabId},
        navigation::TabControl,
    };

    fn decode(frame: &[u8]) -> Value {
        let len = u32::from_ne_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        serde_json::from_slice(&frame[4..]).unwrap()
    }

    #[tokio::test]
    async fn frames_are_length_prefixed_in_native_order() {
        let frame = encode_frame(&json!({ "a": 1 })).unwrap();
        assert_eq!(&frame[..4], &7_u32.to_ne_bytes());

        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&frame).await.unwrap();
        drop(tx);
        let payload = read_frame(&mut rx, 1024).await.unwrap().unwrap();
        assert_eq!(payload, br#"{"a":1}"#);
        assert!(read_frame(&mut rx, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_inbound_frame_is_rejected_before_reading_payload() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&2048_u32.to_ne_bytes()).await.unwrap();
        let err = read_frame(&mut rx, 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 2048, limit: 1024 }));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_io_error() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&10_u32.to_ne_bytes()).await.unwrap();
        tx.write_all(b"{}").await.unwrap();
        drop(tx);
        assert!(matches!(
            read_frame(&mut rx, 1024).await.unwrap_err(),
            FrameError::Io(_)
        ));
    }

    #[test]
    fn commands_serialize_with_flat_camel_case_fields() {
        let message = HostMessage::Command {
            id: 4,
            command: BrowserCommand::Fulfill {
                tab_id: TabId(2),
                request_id: "job-1".to_owned(),
                response_code: 200,
                response_headers: vec![HeaderEntry::new("Content-Type", "text/plain")],
                body: "aGk=".to_owned(),
            },
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "command",
                "id": 4,
                "command": "fulfill",
                "tabId": 2,
                "requestId": "job-1",
                "responseCode": 200,
                "responseHeaders": [{ "name": "Content-Type", "value": "text/plain" }],
                "body": "aGk="
            })
        );

        let list = HostMessage::Command {
            id: 5,
            command: BrowserCommand::ListTabs,
        };
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({ "type": "command", "id": 5, "command": "listTabs" })
        );
    }

    #[test]
    fn extension_messages_decode() {
        let reply: ExtensionMessage = serde_json::from_value(json!({
            "type": "reply", "id": 3, "ok": false, "error": "No tab with id: 3"
        }))
        .unwrap();
        assert!(matches!(
            reply,
            ExtensionMessage::Reply { id: 3, ok: false, .. }
        ));

        let event: ExtensionMessage = serde_json::from_value(json!({
            "type": "browserEvent",
            "event": "beforeNavigate",
            "tabId": 1,
            "frameId": 0,
            "url": "https://example.com/"
        }))
        .unwrap();
        assert!(matches!(
            event,
            ExtensionMessage::BrowserEvent {
                event: BrowserEvent::BeforeNavigate { frame_id: 0, .. }
            }
        ));

        let control: ExtensionMessage = serde_json::from_value(json!({
            "type": "control", "id": 8, "command": "getSnapshot"
        }))
        .unwrap();
        assert!(matches!(
            control,
            ExtensionMessage::Control {
                id: 8,
                command: ControlCommand::GetSnapshot
            }
        ));
    }

    fn client(timeout: Duration) -> (Arc<BridgeClient>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(BridgeClient::new(tx, timeout)), rx)
    }

    #[tokio::test]
    async fn replies_are_correlated_by_id() {
        let (client, mut outbound) = client(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.list_tabs().await }
        });
        let sent = decode(&outbound.recv().await.unwrap());
        assert_eq!(sent["command"], json!("listTabs"));
        let id = sent["id"].as_u64().unwrap();

        assert!(!client.resolve(id + 100, true, None, None));
        assert!(client.resolve(
            id,
            true,
            Some(json!([{ "id": 1, "url": "https://a.test/" }, { "id": 2 }])),
            None
        ));

        let tabs = call.await.unwrap().unwrap();
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].url.as_deref(), Some("https://a.test/"));
        assert_eq!(tabs[1].url, None);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn rejected_and_unanswered_commands_fail() {
        let (client, mut outbound) = client(Duration::from_millis(50));

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.attach(TabId(3)).await }
        });
        let sent = decode(&outbound.recv().await.unwrap());
        client.resolve(
            sent["id"].as_u64().unwrap(),
            false,
            None,
            Some("Cannot access a chrome:// URL".to_owned()),
        );
        let err = call.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Cannot access a chrome:// URL"));

        let err = client
            .call(BrowserCommand::Detach { tab_id: TabId(3) })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { command: "detach", .. }));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn closing_fails_pending_calls() {
        let (client, mut outbound) = client(Duration::from_secs(5));
        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.navigate_tab(TabId(1), "https://a.test/").await }
        });
        outbound.recv().await.unwrap();
        client.close();
        let err = call.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn oversize_fulfillment_hands_the_request_back() {
        let (client, _outbound) = client(Duration::from_secs(5));
        let fulfillment = Fulfillment {
            endpoint: EndpointKey::new("GET", "/big"),
            status: 200,
            headers: Vec::new(),
            body: "A".repeat(MAX_OUTBOUND_FRAME_BYTES),
        };

        let err = client
            .fulfill(TabId(1), PausedRequestId::new("job-9"), &fulfillment)
            .await
            .unwrap_err();
        let FulfillError::Unanswered(unanswered) = err else {
            panic!("expected the request back, got {err:?}");
        };
        assert_eq!(unanswered.request_id.as_str(), "job-9");
        assert!(unanswered.error.to_string().contains("exceeds"));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn fulfillment_without_reply_is_not_handed_back() {
        let (client, mut outbound) = client(Duration::from_millis(50));
        let fulfillment = Fulfillment {
            endpoint: EndpointKey::new("GET", "/slow"),
            status: 200,
            headers: Vec::new(),
            body: String::new(),
        };

        let err = client
            .fulfill(TabId(1), PausedRequestId::new("job-1"), &fulfillment)
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillError::Indeterminate(_)), "{err:?}");
        assert_eq!(decode(&outbound.recv().await.unwrap())["command"], "fulfill");

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            let fulfillment = fulfillment.clone();
            async move {
                client
                    .fulfill(TabId(1), PausedRequestId::new("job-2"), &fulfillment)
                    .await
            }
        });
        outbound.recv().await.unwrap();
        client.close();
        assert!(matches!(
            call.await.unwrap(),
            Err(FulfillError::Indeterminate(_))
        ));
    }

    #[tokio::test]
    async fn fulfillment_on_a_closed_channel_hands_the_request_back() {
        let (client, outbound) = client(Duration::from_secs(5));
        drop(outbound);
        let fulfillment = Fulfillment {
            endpoint: EndpointKey::new("GET", "/x"),
            status: 200,
            headers: Vec::new(),
            body: String::new(),
        };

        let err = client
            .fulfill(TabId(1), PausedRequestId::new("job-3"), &fulfillment)
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillError::Unanswered(_)), "{err:?}");
    }
}

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use harreplay::{
    bridge::{MAX_INBOUND_FRAME_BYTES, encode_frame, read_frame, write_frame},
    config::Config,
    host::{self, HostHandle},
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::mpsc,
    task::JoinHandle,
};

pub const NEUTRAL_PAGE: &str = "chrome-extension://abcdefghijklmnop/loading.html";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers a browser command the way the extension would: `Ok(result)` or an error message.
pub type Responder = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

pub fn sample_har() -> Value {
    let raw = std::fs::read(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/sample.har"))
        .expect("sample HAR should be readable");
    serde_json::from_slice(&raw).expect("sample HAR should be JSON")
}

pub fn test_config(extra: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
[host]
command_timeout_ms = 2000

[replay]
neutral_page = "{NEUTRAL_PAGE}"

{extra}
"#
    ))
    .expect("test config should parse")
}

/// Replies `ok` to every command, listing `tabs` and reporting their URLs.
pub fn browser_with_tabs(tabs: Vec<(i64, &'static str)>) -> Responder {
    Arc::new(move |message: &Value| match message["command"].as_str() {
        Some("listTabs") => Ok(Value::Array(
            tabs.iter()
                .map(|(id, url)| json!({ "id": id, "url": url }))
                .collect(),
        )),
        Some("getTabUrl") => tabs
            .iter()
            .find(|(id, _)| message["tabId"].as_i64() == Some(*id))
            .map(|(_, url)| json!({ "url": url }))
            .ok_or_else(|| format!("No tab with id: {}", message["tabId"])),
        _ => Ok(Value::Null),
    })
}

/// The extension end of a native messaging channel.
pub struct FakeExtension {
    outbound: Option<mpsc::UnboundedSender<Value>>,
    inbound: mpsc::UnboundedReceiver<Value>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeExtension {
    pub async fn start(config: &Config, responder: Responder) -> (HostHandle, Self) {
        let (host_reader, extension_writer) = tokio::io::duplex(1 << 20);
        let (extension_reader, host_writer) = tokio::io::duplex(1 << 20);
        let host = host::run_with_io(config, None, host_reader, host_writer)
            .await
            .expect("host should start");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_messages(extension_writer, outbound_rx));
        let reader = tokio::spawn(read_messages(
            extension_reader,
            inbound_tx,
            outbound_tx.clone(),
            responder,
        ));

        (
            host,
            Self {
                outbound: Some(outbound_tx),
                inbound: inbound_rx,
                tasks: vec![reader, writer],
            },
        )
    }

    pub fn send(&self, message: Value) {
        if let Some(outbound) = &self.outbound {
            outbound.send(message).expect("extension writer should be running");
        }
    }

    pub fn browser_event(&self, event: Value) {
        let mut message = event;
        message["type"] = json!("browserEvent");
        self.send(message);
    }

    pub fn control(&self, id: u64, command: Value) {
        let mut message = command;
        message["type"] = json!("control");
        message["id"] = json!(id);
        self.send(message);
    }

    /// Returns the next host message matching `predicate`, dropping the others.
    pub async fn recv_matching(&mut self, predicate: impl Fn(&Value) -> bool) -> Value {
        loop {
            let message = tokio::time::timeout(RECV_TIMEOUT, self.inbound.recv())
                .await
                .expect("host message should arrive in time")
                .expect("host channel should stay open");
            if predicate(&message) {
                return message;
            }
        }
    }

    pub async fn command(&mut self, name: &str) -> Value {
        self.recv_matching(|message| message["type"] == "command" && message["command"] == name)
            .await
    }

    pub async fn control_reply(&mut self, id: u64) -> Value {
        self.recv_matching(|message| message["type"] == "controlReply" && message["id"] == id)
            .await
    }

    pub async fn event(&mut self, name: &str) -> Value {
        self.recv_matching(|message| message["type"] == "event" && message["event"] == name)
            .await
    }

    /// Closes the channel toward the host, as the browser does when the extension unloads.
    pub async fn disconnect(mut self) {
        let writer = self.tasks.pop();
        for reader in self.tasks.drain(..) {
            reader.abort();
            let _ = reader.await;
        }
        self.outbound.take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

async fn write_messages(mut writer: DuplexStream, mut messages: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = messages.recv().await {
        let frame = encode_frame(&message).expect("extension message should encode");
        write_frame(&mut writer, &frame)
            .await
            .expect("extension frame should be written");
    }
    let _ = writer.shutdown().await;
}

async fn read_messages(
    mut reader: DuplexStream,
    inbound: mpsc::UnboundedSender<Value>,
    outbound: mpsc::UnboundedSender<Value>,
    responder: Responder,
) {
    while let Ok(Some(payload)) = read_frame(&mut reader, MAX_INBOUND_FRAME_BYTES).await {
        let message: Value = serde_json::from_slice(&payload).expect("host frame should be JSON");
        if message["type"] == "command" {
            let reply = match responder(&message) {
                Ok(result) => json!({ "type": "reply", "id": message["id"], "ok": true, "result": result }),
                Err(error) => json!({ "type": "reply", "id": message["id"], "ok": false, "error": error }),
            };
            let _ = outbound.send(reply);
        }
        let _ = inbound.send(message);
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, oneshot,
    },
    task::JoinHandle,
};

use crate::{
    admin::{self, AdminHandle},
    bridge::{
        BridgeClient, ExtensionMessage, FrameError, HostMessage, MAX_INBOUND_FRAME_BYTES,
        encode_frame, read_frame, write_frame,
    },
    config::Config,
    controller::{ControlCommand, ControlEvent, ControllerOptions, ReplayController},
    storage::KeyValueStore,
};

const OUTBOUND_QUEUE_DEPTH: usize = 64;

pub type HostController = ReplayController<BridgeClient>;

pub struct HostHandle {
    pub admin_listen_addr: Option<SocketAddr>,
    controller: Arc<HostController>,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl HostHandle {
    pub fn controller(&self) -> &Arc<HostController> {
        &self.controller
    }

    /// Runs until the browser closes the native messaging channel.
    pub async fn wait(self) -> anyhow::Result<()> {
        let Self {
            shutdown_tx, join, ..
        } = self;
        let result = join.await.context("join native host task")?;
        drop(shutdown_tx);
        result
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join.await.context("join native host task")?
    }
}

/// Serves the native messaging protocol over stdin/stdout until the browser disconnects.
pub async fn serve(config: &Config, extension_origin: Option<&str>) -> anyhow::Result<()> {
    let host = run_with_io(
        config,
        extension_origin,
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    let HostHandle {
        shutdown_tx,
        mut join,
        ..
    } = host;
    let joined = tokio::select! {
        joined = &mut join => Some(joined),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for ctrl-c")?;
            tracing::info!("interrupted, shutting down");
            None
        }
    };
    let joined = match joined {
        Some(joined) => joined,
        None => {
            let _ = shutdown_tx.send(());
            join.await
        }
    };
    joined.context("join native host task")?
}

/// Starts a host speaking the native messaging protocol on `reader`/`writer`.
///
/// Persisted state is loaded before the first inbound frame is handled. Reattaching to open
/// tabs issues browser commands, so it runs once the inbound channel is being read.
pub async fn run_with_io<R, W>(
    config: &Config,
    extension_origin: Option<&str>,
    reader: R,
    writer: W,
) -> anyhow::Result<HostHandle>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let options = ControllerOptions::from_config(&config.replay, extension_origin)?;
    let store = match KeyValueStore::from_config(config) {
        Ok(store) => store,
        Err(err) => {
            tracing::warn!("replay storage unavailable, keeping state in memory only: {err:#}");
            None
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let writer_join = tokio::spawn(write_loop(writer, outbound_rx));
    let client = Arc::new(BridgeClient::new(
        outbound_tx.clone(),
        config.host.command_timeout(),
    ));
    let controller = ReplayController::new(Arc::clone(&client), options, store);
    let forwarder_join = tokio::spawn(forward_events(controller.subscribe(), outbound_tx.clone()));

    let admin = match config.admin.as_ref() {
        Some(admin_config) => Some(admin::serve(admin_config, Arc::clone(&controller)).await?),
        None => None,
    };
    let admin_listen_addr = admin.as_ref().map(|admin| admin.listen_addr);

    tracing::info!(
        host = %config.host.name,
        extension_origin = extension_origin.unwrap_or("none"),
        admin_listen = ?admin_listen_addr,
        "native host started"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let background = Background {
        writer: writer_join,
        forwarder: forwarder_join,
        admin,
    };
    let join = tokio::spawn(run(
        reader,
        client,
        Arc::clone(&controller),
        outbound_tx,
        shutdown_rx,
        background,
    ));

    Ok(HostHandle {
        admin_listen_addr,
        controller,
        shutdown_tx,
        join,
    })
}

struct Background {
    writer: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    admin: Option<AdminHandle>,
}

impl Background {
    async fn stop(self) {
        self.forwarder.abort();
        if let Some(admin) = self.admin {
            admin.shutdown().await;
        }
        self.writer.abort();
    }
}

async fn run<R: AsyncRead + Unpin + Send + 'static>(
    reader: R,
    client: Arc<BridgeClient>,
    controller: Arc<HostController>,
    outbound: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    background: Background,
) -> anyhow::Result<()> {
    let restore = if controller.restore_state().await {
        let controller = Arc::clone(&controller);
        Some(tokio::spawn(async move {
            controller.attach_replayable_tabs().await;
        }))
    } else {
        None
    };

    let read = read_loop(reader, &client, &controller, &outbound);
    tokio::pin!(read);
    let finished = tokio::select! {
        result = &mut read => Some(result),
        _ = &mut shutdown_rx => None,
    };
    // Sessions are released while the read loop still routes their replies.
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("native host shutdown requested");
            tokio::select! {
                released = controller.sessions().detach_all() => {
                    tracing::info!(released, "interception sessions released");
                    Ok(())
                }
                result = &mut read => result,
            }
        }
    };

    client.close();
    if let Some(restore) = restore {
        restore.abort();
    }
    background.stop().await;
    result
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    client: &BridgeClient,
    controller: &Arc<HostController>,
    outbound: &mpsc::Sender<Vec<u8>>,
) -> anyhow::Result<()> {
    loop {
        let Some(payload) = read_frame(&mut reader, MAX_INBOUND_FRAME_BYTES)
            .await
            .context("read native message")?
        else {
            tracing::info!("browser closed the native messaging channel");
            return Ok(());
        };

        let message = match serde_json::from_slice::<ExtensionMessage>(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(bytes = payload.len(), "ignoring undecodable native message: {err}");
                continue;
            }
        };

        match message {
            ExtensionMessage::Reply {
                id,
                ok,
                result,
                error,
            } => {
                client.resolve(id, ok, result, error);
            }
            ExtensionMessage::BrowserEvent { event } => {
                controller.dispatch(event);
            }
            ExtensionMessage::Control { id, command } => {
                tokio::spawn(answer_control(
                    Arc::clone(controller),
                    outbound.clone(),
                    id,
                    command,
                ));
            }
        }
    }
}

async fn answer_control(
    controller: Arc<HostController>,
    outbound: mpsc::Sender<Vec<u8>>,
    id: u64,
    command: ControlCommand,
) {
    let reply = controller.handle_command(command).await.map_err(|err| {
        tracing::warn!(command_id = id, kind = err.kind(), "control command failed: {err}");
        err.to_string()
    });
    match control_reply_frame(id, reply) {
        Ok(frame) => send_frame(&outbound, frame).await,
        Err(err) => tracing::warn!(command_id = id, "drop control reply: {err}"),
    }
}

/// Encodes a control reply. A result too large for one frame turns into an error reply,
/// so the caller still hears back.
fn control_reply_frame(id: u64, reply: Result<Value, String>) -> Result<Vec<u8>, FrameError> {
    let message = match reply {
        Ok(result) => HostMessage::ControlReply {
            id,
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(error) => HostMessage::ControlReply {
            id,
            ok: false,
            result: None,
            error: Some(error),
        },
    };
    match encode_frame(&message) {
        Err(err @ FrameError::TooLarge { .. }) => {
            tracing::warn!(command_id = id, "control reply not sendable: {err}");
            encode_frame(&HostMessage::ControlReply {
                id,
                ok: false,
                result: None,
                error: Some(format!("reply not sent: {err}")),
            })
        }
        encoded => encoded,
    }
}

async fn forward_events(
    mut events: broadcast::Receiver<ControlEvent>,
    outbound: mpsc::Sender<Vec<u8>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => send(&outbound, &HostMessage::Event { event }).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "extension fell behind on state events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut writer, &frame).await {
            tracing::warn!("write native message: {err}");
            return;
        }
    }
}

async fn send(outbound: &mpsc::Sender<Vec<u8>>, message: &HostMessage) {
    match encode_frame(message) {
        Ok(frame) => send_frame(outbound, frame).await,
        Err(err) => tracing::warn!("drop outbound native message: {err}"),
    }
}

async fn send_frame(outbound: &mpsc::Sender<Vec<u8>>, frame: Vec<u8>) {
    if outbound.send(frame).await.is_err() {
        tracing::debug!("native messaging writer is gone, dropping message");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::control_reply_frame;
    use crate::bridge::MAX_OUTBOUND_FRAME_BYTES;

    fn payload(frame: &[u8]) -> Value {
        serde_json::from_slice(&frame[4..]).unwrap()
    }

    #[test]
    fn control_replies_carry_result_or_error() {
        let ok = control_reply_frame(3, Ok(json!({ "active": true }))).unwrap();
        assert_eq!(
            payload(&ok),
            json!({ "type": "controlReply", "id": 3, "ok": true, "result": { "active": true } })
        );

        let failed = control_reply_frame(4, Err("no recording set with id `x`".to_owned())).unwrap();
        assert_eq!(
            payload(&failed),
            json!({
                "type": "controlReply",
                "id": 4,
                "ok": false,
                "error": "no recording set with id `x`"
            })
        );
    }

    #[test]
    fn oversize_control_result_becomes_an_error_reply() {
        let huge = Value::String("e".repeat(MAX_OUTBOUND_FRAME_BYTES));
        let frame = control_reply_frame(9, Ok(huge)).unwrap();
        assert!(frame.len() < MAX_OUTBOUND_FRAME_BYTES);

        let reply = payload(&frame);
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["ok"], false);
        assert!(
            reply["error"]
                .as_str()
                .is_some_and(|error| error.starts_with("reply not sent") && error.contains("exceeds"))
        );
    }
}

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{
    config::AdminConfig,
    controller::{Browser, ControlError, ReplayController, load_report_json},
    index::RecordingSetId,
    interception::TabId,
};

pub const ADMIN_API_TOKEN_HEADER: &str = "x-harreplay-admin-token";

pub struct AdminHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl AdminHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct AdminState<B: ?Sized> {
    controller: Arc<ReplayController<B>>,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdminToggleRequest {
    active: bool,
}

#[derive(Debug, Serialize)]
struct AdminErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

pub async fn serve<B: Browser + ?Sized + 'static>(
    config: &AdminConfig,
    controller: Arc<ReplayController<B>>,
) -> anyhow::Result<AdminHandle> {
    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind admin {}: {err}", config.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get admin local_addr: {err}"))?;

    let state = Arc::new(AdminState {
        controller,
        api_token: config.api_token.clone(),
    });
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| admin_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("admin connection error: {err}");
                        }
                    });
                }
            }
        }
    });
    tracing::info!(%listen_addr, "admin API listening");

    Ok(AdminHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn respond(status: StatusCode, content_type: &'static str, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn admin_json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    serde_json::to_vec(payload)
        .map(|body| respond(status, "application/json", body))
        .unwrap_or_else(|err| {
            tracing::debug!(%status, "serialize admin response: {err}");
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                b"failed to serialize admin response".to_vec(),
            )
        })
}

fn admin_error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    admin_json_response(
        status,
        &AdminErrorResponse {
            error: message.into(),
            kind: None,
        },
    )
}

fn control_error_response(err: &ControlError) -> Response<Full<Bytes>> {
    let status = match err {
        ControlError::InvalidHar { .. } => StatusCode::BAD_REQUEST,
        ControlError::UnknownRecordingSet(_) => StatusCode::NOT_FOUND,
        ControlError::TabNotReplayable { .. } => StatusCode::CONFLICT,
        ControlError::Attach(_) | ControlError::Browser(_) => StatusCode::BAD_GATEWAY,
    };
    admin_json_response(
        status,
        &AdminErrorResponse {
            error: err.to_string(),
            kind: Some(err.kind()),
        },
    )
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    admin_error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn admin_request_authorized(req: &Request<Incoming>, expected_token: Option<&str>) -> bool {
    let Some(expected_token) = expected_token else {
        return true;
    };

    req.headers()
        .get(ADMIN_API_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided_token| provided_token == expected_token)
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    match req.into_body().collect().await {
        Ok(body) => Ok(body.to_bytes()),
        Err(err) => Err(admin_error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to read request body: {err}"),
        )),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = read_body(req).await?;
    serde_json::from_slice(&body).map_err(|err| {
        admin_error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"))
    })
}

fn query_param(req: &Request<Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Parses `/_admin/tabs/{id}/replay`.
fn tab_replay_path(path: &str) -> Option<Result<TabId, String>> {
    let rest = path.strip_prefix("/_admin/tabs/")?;
    let raw_id = rest.strip_suffix("/replay")?;
    Some(
        raw_id
            .parse::<i64>()
            .map(TabId)
            .map_err(|_| format!("invalid tab id `{raw_id}`")),
    )
}

async fn admin_handler<B: Browser + ?Sized + 'static>(
    req: Request<Incoming>,
    state: Arc<AdminState<B>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    if !admin_request_authorized(&req, state.api_token.as_deref()) {
        return Ok(admin_error_response(
            StatusCode::UNAUTHORIZED,
            format!("missing or invalid `{ADMIN_API_TOKEN_HEADER}` header for admin API access"),
        ));
    }
    let controller = &state.controller;

    if path == "/_admin/status" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        return Ok(admin_json_response(StatusCode::OK, &controller.snapshot()));
    }

    if path == "/_admin/endpoints" {
        if method != Method::GET {
            return Ok(method_not_allowed());
        }
        return Ok(admin_json_response(
            StatusCode::OK,
            &controller.list_endpoints(),
        ));
    }

    if path == "/_admin/replay" {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        let toggle = match read_json::<AdminToggleRequest>(req).await {
            Ok(toggle) => toggle,
            Err(response) => return Ok(response),
        };
        let changed_tabs = if toggle.active {
            controller.enable_replay().await
        } else {
            controller.disable_replay().await
        };
        tracing::debug!(active = toggle.active, changed_tabs, "admin toggled replay");
        return Ok(admin_json_response(StatusCode::OK, &controller.snapshot()));
    }

    if let Some(tab) = tab_replay_path(&path) {
        if method != Method::POST {
            return Ok(method_not_allowed());
        }
        let tab = match tab {
            Ok(tab) => tab,
            Err(message) => return Ok(admin_error_response(StatusCode::BAD_REQUEST, message)),
        };
        let toggle = match read_json::<AdminToggleRequest>(req).await {
            Ok(toggle) => toggle,
            Err(response) => return Ok(response),
        };
        if toggle.active {
            if let Err(err) = controller.enable_tab(tab).await {
                return Ok(control_error_response(&err));
            }
        } else {
            controller.disable_tab(tab).await;
        }
        return Ok(admin_json_response(StatusCode::OK, &controller.snapshot()));
    }

    if path == "/_admin/recordings" {
        return match method {
            Method::GET => Ok(admin_json_response(
                StatusCode::OK,
                &controller.recording_sets(),
            )),
            Method::POST => {
                let Some(name) = query_param(&req, "name").filter(|name| !name.is_empty()) else {
                    return Ok(admin_error_response(
                        StatusCode::BAD_REQUEST,
                        "missing `name` query parameter",
                    ));
                };
                let document = match read_json::<Value>(req).await {
                    Ok(document) => document,
                    Err(response) => return Ok(response),
                };
                match controller.load_recording_set(name, document).await {
                    Ok(report) => Ok(admin_json_response(
                        StatusCode::CREATED,
                        &load_report_json(&report),
                    )),
                    Err(err) => Ok(control_error_response(&err)),
                }
            }
            _ => Ok(method_not_allowed()),
        };
    }

    if let Some(raw_id) = path.strip_prefix("/_admin/recordings/") {
        if method != Method::DELETE {
            return Ok(method_not_allowed());
        }
        let id = RecordingSetId::new(raw_id);
        return match controller.unload_recording_set(&id).await {
            Ok(()) => Ok(admin_json_response(StatusCode::OK, &json!({ "removed": id }))),
            Err(err) => Ok(control_error_response(&err)),
        };
    }

    Ok(admin_error_response(StatusCode::NOT_FOUND, "not found"))
}

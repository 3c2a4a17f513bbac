//! HTTP API for the management UI
//!
//! JSON endpoints over the lifecycle controller plus a server-sent event
//! stream of status, log and job events.

use crate::archive::{ArchiveService, CompressRequest, ExtractRequest};
use crate::controller::WorkloadController;
use crate::engine::ContainerEngine;
use crate::error::{ErrorCode, ErrorResponse, FleetError};
use crate::events::FleetEvent;
use crate::workload::{CreateWorkload, ModpackRef, WorkloadUpdate};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

/// Why a request did not produce a success response
#[derive(Debug)]
enum ApiFailure {
    Fleet(FleetError),
    BadRequest(String),
    NotFound,
}

impl From<FleetError> for ApiFailure {
    fn from(err: FleetError) -> Self {
        ApiFailure::Fleet(err)
    }
}

impl ApiFailure {
    fn into_response(self) -> Response<ApiBody> {
        let body = match self {
            ApiFailure::Fleet(e) => ErrorResponse::from(&e),
            ApiFailure::BadRequest(msg) => ErrorResponse::new(ErrorCode::BadRequest, msg),
            ApiFailure::NotFound => ErrorResponse::new(ErrorCode::NotFound, "Not found"),
        };
        let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        json_response(status, body.to_json())
    }
}

type ApiResult = std::result::Result<Response<ApiBody>, ApiFailure>;

/// Management API server
pub struct ApiServer<E: ContainerEngine> {
    bind_addr: SocketAddr,
    controller: Arc<WorkloadController<E>>,
    archives: ArchiveService,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: ContainerEngine> ApiServer<E> {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<WorkloadController<E>>,
        archives: ArchiveService,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            controller,
            archives,
            shutdown_rx,
        })
    }

    /// Run the API server until shutdown is signalled
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { Ok::<_, Infallible>(api.handle_request(req).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(self: Arc<Self>, req: Request<Incoming>) -> Response<ApiBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        debug!(%method, %path, "API request");

        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let body = req.into_body();
        let query = query.as_deref();

        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
            (&Method::GET, ["version"]) => ok(
                StatusCode::OK,
                serde_json::json!({
                    "name": "craftgate",
                    "version": env!("CARGO_PKG_VERSION"),
                }),
            ),
            (&Method::GET, ["config"]) => self.get_config(),

            (&Method::GET, ["servers"]) => self.list_servers().await,
            (&Method::POST, ["servers"]) => self.create_server(body).await,
            (&Method::GET, ["servers", id]) => self.get_server(id).await,
            (&Method::PUT, ["servers", id]) => self.update_server(id, body).await,
            (&Method::DELETE, ["servers", id]) => self.delete_server(id).await,

            (&Method::POST, ["servers", id, "start"]) => self.start_server(id).await,
            (&Method::POST, ["servers", id, "stop"]) => self.stop_server(id).await,
            (&Method::POST, ["servers", id, "kill"]) => self.kill_server(id).await,
            (&Method::POST, ["servers", id, "restart"]) => self.restart_server(id).await,
            (&Method::POST, ["servers", id, "command"]) => self.send_command(id, body).await,
            (&Method::GET, ["servers", id, "logs"]) => self.get_logs(id, query).await,
            (&Method::GET, ["servers", id, "status"]) => self.get_status(id).await,

            (&Method::GET, ["servers", id, "modpack"]) => self.get_modpack(id).await,
            (&Method::POST, ["servers", id, "modpack"]) => self.set_modpack(id, body).await,
            (&Method::DELETE, ["servers", id, "modpack"]) => self.clear_modpack(id).await,

            (&Method::POST, ["servers", id, "archive"]) => self.compress(id, body).await,
            (&Method::PUT, ["servers", id, "archive"]) => self.extract(id, body).await,
            (&Method::GET, ["servers", _, "archive"]) => self.job_status(query),

            (&Method::GET, ["routes"]) => self.get_routes(),
            (&Method::POST, ["routes", "resync"]) => self.resync_routes().await,

            (&Method::GET, ["events"]) => Ok(self.event_stream(query)),

            _ => Err(ApiFailure::NotFound),
        };

        result.unwrap_or_else(|failure| {
            match &failure {
                ApiFailure::Fleet(e) if e.code().status_code().is_server_error() => {
                    error!(%method, %path, error = %e, "API error")
                }
                ApiFailure::Fleet(e) => debug!(%method, %path, error = %e, "Request rejected"),
                ApiFailure::BadRequest(msg) => debug!(%method, %path, error = %msg, "Bad request"),
                ApiFailure::NotFound => debug!(%method, %path, "No such route"),
            }
            failure.into_response()
        })
    }

    // ==================== Servers ====================

    fn get_config(&self) -> ApiResult {
        ok(StatusCode::OK, self.controller.public_config()?)
    }

    async fn list_servers(&self) -> ApiResult {
        ok(StatusCode::OK, self.controller.list().await?)
    }

    async fn create_server(&self, body: Incoming) -> ApiResult {
        let request: CreateWorkload = read_json(body).await?;
        let view = self.controller.create(request).await?;
        info!(workload_id = %view.workload.id, name = %view.workload.name, "Created server via API");
        ok(StatusCode::CREATED, view)
    }

    async fn get_server(&self, id: &str) -> ApiResult {
        ok(StatusCode::OK, self.controller.get(id).await?)
    }

    async fn update_server(&self, id: &str, body: Incoming) -> ApiResult {
        let update: WorkloadUpdate = read_json(body).await?;
        ok(StatusCode::OK, self.controller.reconfigure(id, update).await?)
    }

    async fn delete_server(&self, id: &str) -> ApiResult {
        self.controller.delete(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id }))
    }

    async fn start_server(&self, id: &str) -> ApiResult {
        let status = self.controller.start(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id, "status": status }))
    }

    async fn stop_server(&self, id: &str) -> ApiResult {
        let status = self.controller.stop(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id, "status": status }))
    }

    async fn kill_server(&self, id: &str) -> ApiResult {
        let status = self.controller.kill(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id, "status": status }))
    }

    async fn restart_server(&self, id: &str) -> ApiResult {
        let status = self.controller.restart(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id, "status": status }))
    }

    async fn send_command(&self, id: &str, body: Incoming) -> ApiResult {
        let request: CommandRequest = read_json(body).await?;
        self.controller.send_command(id, &request.command).await?;
        ok(StatusCode::OK, serde_json::json!({ "sent": request.command.trim() }))
    }

    async fn get_logs(&self, id: &str, query: Option<&str>) -> ApiResult {
        let lines = match query_param(query, "lines") {
            Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
                ApiFailure::BadRequest(format!("lines must be a positive number, got '{}'", raw))
            })?),
            None => None,
        };
        ok(StatusCode::OK, self.controller.logs(id, lines).await?)
    }

    async fn get_status(&self, id: &str) -> ApiResult {
        let status = self.controller.get_status(id).await?;
        ok(StatusCode::OK, serde_json::json!({ "id": id, "status": status }))
    }

    // ==================== Modpacks ====================

    async fn get_modpack(&self, id: &str) -> ApiResult {
        ok(StatusCode::OK, self.controller.get_modpack(id).await?)
    }

    async fn set_modpack(&self, id: &str, body: Incoming) -> ApiResult {
        let modpack: ModpackRef = read_json(body).await?;
        let view = self.controller.set_modpack(id, modpack).await?;
        ok(
            StatusCode::OK,
            serde_json::json!({
                "modpack": view.workload.modpack,
                "message": "Modpack saved. Restart the server to install it.",
            }),
        )
    }

    async fn clear_modpack(&self, id: &str) -> ApiResult {
        self.controller.clear_modpack(id).await?;
        ok(
            StatusCode::OK,
            serde_json::json!({
                "modpack": null,
                "message": "Modpack removed. Restart the server to apply.",
            }),
        )
    }

    // ==================== Archives ====================

    async fn compress(&self, id: &str, body: Incoming) -> ApiResult {
        let request: CompressRequest = read_json(body).await?;
        self.controller.get(id).await?;
        ok(StatusCode::ACCEPTED, self.archives.compress(id, &request)?)
    }

    async fn extract(&self, id: &str, body: Incoming) -> ApiResult {
        let request: ExtractRequest = read_json(body).await?;
        self.controller.get(id).await?;
        ok(StatusCode::ACCEPTED, self.archives.extract(id, &request)?)
    }

    fn job_status(&self, query: Option<&str>) -> ApiResult {
        let job_id = query_param(query, "jobId")
            .ok_or_else(|| ApiFailure::BadRequest("jobId query parameter is required".to_string()))?;
        ok(StatusCode::OK, self.archives.status(job_id)?)
    }

    // ==================== Routes ====================

    fn get_routes(&self) -> ApiResult {
        let entries = self
            .controller
            .published_routes()
            .map(|table| table.entries())
            .unwrap_or_default();
        ok(StatusCode::OK, entries)
    }

    async fn resync_routes(&self) -> ApiResult {
        let report = self.controller.resync_routes().await?;
        if let Some(warning) = &report.warning {
            warn!(warning = %warning, "Manual route resync finished with a warning");
        }
        ok(StatusCode::OK, report)
    }

    // ==================== Events ====================

    fn event_stream(&self, query: Option<&str>) -> Response<ApiBody> {
        let filter = query_param(query, "server").map(str::to_string);
        let rx = self.controller.subscribe();
        debug!(server = filter.as_deref().unwrap_or("*"), "Event stream opened");

        let hello = stream::once(async { Ok::<_, Infallible>(Frame::data(Bytes::from_static(b": connected\n\n"))) });
        let events = stream::unfold((rx, filter), |(mut rx, filter)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if filter.as_deref().map_or(true, |id| event.workload_id() == id) {
                            let frame = Frame::data(Bytes::from(sse_frame(&event)));
                            return Some((Ok(frame), (rx, filter)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event stream subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(StreamBody::new(hello.chain(events)).boxed_unsync())
            .unwrap_or_else(|_| json_response(StatusCode::INTERNAL_SERVER_ERROR, "{}"))
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ApiBody> {
    let mut response = Response::new(Full::new(body.into()).boxed_unsync());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    let body = serde_json::to_string(&ApiResponse::ok(data))
        .map_err(|e| ApiFailure::BadRequest(format!("unserializable response: {}", e)))?;
    Ok(json_response(status, body))
}

async fn read_json<T: DeserializeOwned>(body: Incoming) -> std::result::Result<T, ApiFailure> {
    let bytes = body
        .collect()
        .await
        .map_err(|e| ApiFailure::BadRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();
    parse_json(&bytes)
}

fn parse_json<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, ApiFailure> {
    serde_json::from_slice(bytes).map_err(|e| ApiFailure::BadRequest(format!("Invalid JSON: {}", e)))
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

fn sse_frame(event: &FleetEvent) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.kind(), data)
}

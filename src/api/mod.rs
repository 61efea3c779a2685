// ABOUTME: HTTP surface of the gateway: routes requests onto orchestrator operations.
// ABOUTME: Runs a hyper http1 server on a tokio listener until told to shut down.

mod response;
mod routes;

pub use response::{MISSING, render_record, status_for};
pub use routes::{Route, RouteError};

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::HeaderName;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::orchestrator::{self, Orchestrator};
use crate::record::PullOptions;
use crate::types::{ImageKey, RecordId};
use response::ApiResponse;

pub const HELP_TEXT: &str = "{lookup,pull,expire,list}";

/// Largest pull body accepted.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Request handler shared by every connection.
pub struct Gateway {
    orchestrator: Arc<Orchestrator>,
    auth_header: HeaderName,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("auth_header", &self.auth_header)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(orchestrator: Arc<Orchestrator>, auth_header: &str) -> Result<Self> {
        let auth_header = HeaderName::from_bytes(auth_header.trim().as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("auth_header {:?}: {}", auth_header, e)))?;
        Ok(Self {
            orchestrator,
            auth_header,
        })
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Answer one request. Never fails; errors become JSON error bodies.
    pub async fn handle<B>(&self, req: Request<B>) -> ApiResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let response = self.dispatch(req).await;

        tracing::info!(method = %method, path = %path, status = response.status().as_u16(), "Request");
        response
    }

    async fn dispatch<B>(&self, req: Request<B>) -> ApiResponse
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let route = match Route::parse(req.method(), req.uri().path()) {
            Ok(route) => route,
            Err(e) => return response::route_error(&e),
        };
        let credential = req
            .headers()
            .get(&self.auth_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let credential = credential.as_deref();

        let result = match route {
            Route::Help => return response::text_response(StatusCode::OK, HELP_TEXT),
            Route::List { system } => self.list(credential, &system).await,
            Route::Lookup {
                system,
                itype,
                tag,
            } => self.lookup(credential, &system, &itype, &tag).await,
            Route::Pull {
                system,
                itype,
                tag,
            } => {
                let options = match read_options(req.into_body()).await {
                    Ok(options) => options,
                    Err(message) => {
                        return response::error_body(
                            StatusCode::BAD_REQUEST,
                            "validation_error",
                            &message,
                        );
                    }
                };
                self.pull(credential, &system, &itype, &tag, &options).await
            }
            Route::Expire {
                system,
                itype,
                tag,
                id,
            } => self.expire(credential, &system, &itype, &tag, &id).await,
        };

        match result {
            Ok(body) => response::json_response(StatusCode::OK, &body),
            Err(e) => {
                match e.kind() {
                    orchestrator::ErrorKind::StoreFailure
                    | orchestrator::ErrorKind::DispatchFailure => {
                        tracing::error!(error = %e, "Request failed")
                    }
                    _ => tracing::debug!(error = %e, "Request rejected"),
                }
                response::orchestrator_error(&e)
            }
        }
    }

    async fn list(&self, credential: Option<&str>, system: &str) -> orchestrator::Result<Value> {
        let session = self.orchestrator.new_session(credential, system).await?;
        let records = self.orchestrator.list(&session, system).await?;
        let list: Vec<Value> = records.iter().map(render_record).collect();
        Ok(json!({ "list": list }))
    }

    async fn lookup(
        &self,
        credential: Option<&str>,
        system: &str,
        itype: &str,
        tag: &str,
    ) -> orchestrator::Result<Value> {
        let session = self.orchestrator.new_session(credential, system).await?;
        let key = ImageKey::new(system, itype, tag)?;
        let record = self.orchestrator.lookup(&session, &key).await?;
        Ok(render_record(&record))
    }

    async fn pull(
        &self,
        credential: Option<&str>,
        system: &str,
        itype: &str,
        tag: &str,
        options: &PullOptions,
    ) -> orchestrator::Result<Value> {
        let session = self.orchestrator.new_session(credential, system).await?;
        let key = ImageKey::new(system, itype, tag)?;
        let id = self.orchestrator.pull(&session, &key, options).await?;
        let record = self.orchestrator.record(&id).await?;
        Ok(render_record(&record))
    }

    async fn expire(
        &self,
        credential: Option<&str>,
        system: &str,
        itype: &str,
        tag: &str,
        id: &str,
    ) -> orchestrator::Result<Value> {
        let session = self.orchestrator.new_session(credential, system).await?;
        let key = ImageKey::new(system, itype, tag)?;
        let ack = self
            .orchestrator
            .expire_record(&session, &key, &RecordId::new(id))
            .await?;
        Ok(json!(ack))
    }
}

/// Pull options from the request body. An empty body means defaults.
async fn read_options<B>(body: B) -> std::result::Result<PullOptions, String>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let collected = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| format!("could not read request body: {}", e))?;
    let bytes = collected.to_bytes();

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(PullOptions::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid pull options: {}", e))
}

/// Accept connections on `listener` until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "API server listening");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Shutting down API server");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let gateway = Arc::clone(&gateway);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let gateway = Arc::clone(&gateway);
                                async move { Ok::<_, Infallible>(gateway.handle(req).await) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!(remote_addr = %remote_addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                }
            }
        }
    }

    Ok(())
}

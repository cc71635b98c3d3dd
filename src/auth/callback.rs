//! One-shot listener for the SAML callback
//!
//! After login the identity provider makes the browser POST a form with a
//! `SAMLResponse` field to this listener. The first well-formed post is
//! handed to the waiting session; anything later is answered but ignored.
//!
//! | Request | Response | Credential delivered |
//! |---------|----------|----------------------|
//! | first valid `POST /` | `303` to redirect URL, else `200` | yes |
//! | later valid `POST /` | `409` | no |
//! | malformed body | `400` | no |

use super::{Credential, SAML_USERNAME};
use crate::signal;
use axum::extract::rejection::FormRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::post;
use axum::{Form, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long in-flight responses get to finish once the listener stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = "<!DOCTYPE html>\n<html><body>\
    <p>Authentication received. You may close this window.</p>\
    </body></html>\n";

#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("Failed to bind callback listener on {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("No SAML callback received within {0:?}")]
    Timeout(Duration),
    #[error("Interrupted while waiting for the SAML callback")]
    Interrupted,
    #[error("Callback listener stopped unexpectedly")]
    Closed,
}

#[derive(Debug, Deserialize)]
struct CallbackForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    credentials: mpsc::Sender<Credential>,
    /// Set by the first accepted callback, never cleared
    delivered: Arc<AtomicBool>,
    redirect_url: Option<String>,
}

/// A bound, serving callback listener for a single login attempt
pub struct CallbackListener {
    local_addr: SocketAddr,
    credentials: mpsc::Receiver<Credential>,
    server: ServerHandle,
}

impl CallbackListener {
    pub async fn bind(
        addr: SocketAddr,
        redirect_url: Option<String>,
    ) -> Result<Self, CallbackError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CallbackError::BindError { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| CallbackError::BindError { addr, source })?;

        // Only the callback that sets `delivered` ever sends, so one slot is
        // enough
        let (tx, rx) = mpsc::channel(1);
        let state = CallbackState {
            credentials: tx,
            delivered: Arc::new(AtomicBool::new(false)),
            redirect_url,
        };
        let app = Router::new()
            .route("/", post(handle_callback))
            .with_state(state);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            });
            if let Err(e) = serve.await {
                warn!("Callback listener failed: {}", e);
            }
        });

        info!("Waiting for SAML callback on {}", local_addr);
        Ok(Self {
            local_addr,
            credentials: rx,
            server: ServerHandle {
                stop: Some(stop_tx),
                task,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the first credential, the timeout, or an interrupt
    ///
    /// Whatever happens, the listener is shut down and its socket closed
    /// before this returns.
    pub async fn wait(
        self,
        timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Credential, CallbackError> {
        let CallbackListener {
            mut credentials,
            server,
            ..
        } = self;

        let result = tokio::select! {
            received = credentials.recv() => received.ok_or(CallbackError::Closed),
            _ = tokio::time::sleep(timeout) => Err(CallbackError::Timeout(timeout)),
            _ = signal::interrupted(shutdown) => Err(CallbackError::Interrupted),
        };

        credentials.close();
        server.shutdown().await;

        match &result {
            Ok(credential) => debug!("SAML callback received for {}", credential.username),
            Err(e) => debug!("Stopped waiting for SAML callback: {}", e),
        }
        result
    }
}

/// The spawned server task; aborted if dropped without a clean shutdown
struct ServerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            debug!("Callback listener did not stop in time, aborting");
            self.task.abort();
            let _ = (&mut self.task).await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    form: Result<Form<CallbackForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            warn!("Rejected malformed SAML callback: {}", rejection);
            return (StatusCode::BAD_REQUEST, "malformed SAML callback\n").into_response();
        }
    };

    if form.saml_response.trim().is_empty() {
        warn!("Rejected SAML callback without SAMLResponse");
        return (StatusCode::BAD_REQUEST, "missing SAMLResponse\n").into_response();
    }

    let username = form
        .username
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| SAML_USERNAME.to_string());
    if state.delivered.swap(true, Ordering::SeqCst) {
        debug!("Ignoring repeated SAML callback");
        return (StatusCode::CONFLICT, "SAML response already received\n").into_response();
    }

    let credential = Credential::new(username, form.saml_response);
    if state.credentials.try_send(credential).is_err() {
        debug!("SAML callback arrived after the listener stopped waiting");
        return (StatusCode::CONFLICT, "SAML response no longer accepted\n").into_response();
    }

    match state.redirect_url {
        Some(url) => Redirect::to(&url).into_response(),
        None => Html(SUCCESS_PAGE).into_response(),
    }
}

/*!
Faux endpoint machine HTTP

Serveur axum sur un port éphémère de 127.0.0.1. Les réponses scriptées sont
servies dans l'ordre, la dernière est rejouée ensuite. Chaque requête est
comptée avec sa méthode.
*/

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: StatusCode,
    pub body: Value,
    pub delay: Duration,
}

impl StubResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body: serde_json::json!({ "error": "scripted failure" }),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct StubState {
    script: Mutex<VecDeque<StubResponse>>,
    last: Mutex<Option<StubResponse>>,
    methods: Mutex<Vec<Method>>,
}

pub struct StubEndpoint {
    addr: SocketAddr,
    state: Arc<StubState>,
    server: JoinHandle<()>,
}

impl StubEndpoint {
    pub async fn start<I>(responses: I) -> Result<Self>
    where
        I: IntoIterator<Item = StubResponse>,
    {
        let state = Arc::new(StubState {
            script: Mutex::new(responses.into_iter().collect()),
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind stub endpoint")?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(respond).with_state(state.clone());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "stub endpoint stopped");
            }
        });

        tracing::debug!(%addr, "stub endpoint listening");
        Ok(Self { addr, state, server })
    }

    /// URL d'une ressource du stub (tous les chemins répondent pareil).
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    pub fn hits(&self) -> usize {
        self.state.methods.lock().len()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.state.methods.lock().clone()
    }
}

impl Drop for StubEndpoint {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn respond(State(state): State<Arc<StubState>>, method: Method) -> (StatusCode, Json<Value>) {
    state.methods.lock().push(method);

    let next = state.script.lock().pop_front();
    let response = match next {
        Some(r) => {
            *state.last.lock() = Some(r.clone());
            r
        }
        None => state
            .last
            .lock()
            .clone()
            .unwrap_or_else(|| StubResponse::ok(serde_json::json!({}))),
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }
    (response.status, Json(response.body))
}

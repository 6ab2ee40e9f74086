//! Snapshot API
//!
//! Serves the retained snapshots over HTTP so that notified receivers can
//! fetch them: `GET /snapshots/` lists them, `GET /snapshots/{id}` returns
//! one exactly as the aggregator rendered it.

use crate::invoker::SnapshotHistory;
use anyhow::Context;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use supervisor::{Process, Worker};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const API_WORKER: &str = "api";

pub fn router(history: Arc<SnapshotHistory>) -> Router {
    Router::new()
        .route("/snapshots/", get(list_snapshots))
        .route("/snapshots/{id}", get(get_snapshot))
        .layer(TraceLayer::new_for_http())
        .with_state(history)
}

async fn list_snapshots(State(history): State<Arc<SnapshotHistory>>) -> Html<String> {
    let mut page = String::from("<html><body><ul>\n");
    for id in history.ids() {
        let _ = writeln!(page, "  <li><a href=\"{id}\">{id}</a></li>");
    }
    page.push_str("</ul></body></html>\n");
    Html(page)
}

async fn get_snapshot(
    State(history): State<Arc<SnapshotHistory>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = id.parse::<u64>() else {
        return (StatusCode::BAD_REQUEST, format!("ID {id:?} is not an integer\n")).into_response();
    };
    match history.get(id) {
        Some(snapshot) => ([(header::CONTENT_TYPE, "application/json")], snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Snapshot {id} not found\n")).into_response(),
    }
}

/// Worker serving the snapshot API on `listen` until shutdown.
pub fn api_worker(listen: SocketAddr, history: Arc<SnapshotHistory>) -> Worker {
    Worker::new(API_WORKER, move |p| {
        let history = Arc::clone(&history);
        async move { serve(p, listen, history).await }
    })
}

async fn serve(p: Process, listen: SocketAddr, history: Arc<SnapshotHistory>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding snapshot API to {listen}"))?;
    info!(address = %listen, "snapshot API listening");
    p.ready();

    let shutdown = p.shutdown_token();
    axum::serve(listener, router(history))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("serving snapshot API")
}

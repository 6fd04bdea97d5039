use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use axum::{extract::State, http::StatusCode, response::Html, routing::get, Router};
use color_eyre::eyre::{Result, WrapErr};
use maud::{html, Markup, DOCTYPE};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::format_bytes;
use crate::{
    snapshot::{self, RankedSnapshot},
    table::CounterTable,
};

const STYLE: &str = "body{font-family:sans-serif}table{border-collapse:collapse}\
                     th,td{border:1px solid #ccc;padding:4px 12px;text-align:left}";

/// Immutable page layout shared by every request.
pub(crate) struct Page {
    title: String,
    refresh: Duration,
}

impl Page {
    pub(crate) fn new(iface: &str, refresh: Duration) -> Self {
        Self {
            title: format!("Traffic on {iface}"),
            refresh,
        }
    }

    pub(crate) fn render(&self, snapshot: &RankedSnapshot) -> Markup {
        html! {
            (DOCTYPE)
            html {
                head {
                    meta charset="utf-8";
                    meta http-equiv="refresh" content=(self.refresh.as_secs());
                    title { (self.title) }
                    style { (STYLE) }
                }
                body {
                    h1 { (self.title) }
                    table {
                        tr { th { "#" } th { "Source address" } th { "Traffic" } }
                        @if snapshot.is_empty() {
                            tr { td colspan="3" { "No traffic captured yet." } }
                        }
                        @for (rank, entry) in snapshot.entries().iter().enumerate() {
                            tr {
                                td { (rank + 1) }
                                td { (entry.address.to_string()) }
                                td title={ (entry.bytes) " bytes" } { (format_bytes(entry.bytes)) }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct WebState {
    table: Arc<dyn CounterTable>,
    limit: NonZeroUsize,
    page: Arc<Page>,
}

impl WebState {
    pub(crate) fn new(table: Arc<dyn CounterTable>, limit: NonZeroUsize, page: Page) -> Self {
        Self {
            table,
            limit,
            page: Arc::new(page),
        }
    }
}

pub(crate) fn router(state: WebState) -> Router {
    Router::new().route("/", get(index)).with_state(state)
}

/// Serves until `token` is cancelled, then lets in-flight requests finish.
pub(crate) async fn serve(
    listener: TcpListener,
    state: WebState,
    token: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Serving traffic stats on http://{addr}/");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .wrap_err("http server failed")
}

async fn index(State(state): State<WebState>) -> Result<Html<String>, (StatusCode, String)> {
    let table = state.table.clone();
    let limit = state.limit;
    // Each request reads its own snapshot; nothing is cached between requests.
    let snapshot = tokio::task::spawn_blocking(move || snapshot::read(&*table, Some(limit)))
        .await
        .map_err(|err| {
            warn!("Snapshot task failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "snapshot task failed".to_string(),
            )
        })?
        .map_err(|err| {
            warn!("Skipping render: {err}");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        })?;
    Ok(Html(state.page.render(&snapshot).into_string()))
}

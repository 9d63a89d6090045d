use axum::{
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tera::Context;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::accounting::FlowSnapshotSource;
use crate::error::FlowVizError;
use crate::models::{Flow, GeoInfo, Granularity};
use crate::state::AppState;

/// Rows shown on the dashboard.
const DASHBOARD_TOP_FLOWS: usize = 50;

/// Query parameters for the flows endpoint.
#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    /// Overrides the configured granularity.
    pub l4: Option<bool>,
}

/// One dashboard row: a flow plus whatever location is already cached for its peer.
#[derive(Debug, Serialize)]
struct FlowRow<'a> {
    #[serde(flatten)]
    flow: &'a Flow,
    total_bytes: u64,
    geo: Option<GeoInfo>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/v1/flows", get(api_flows))
        .route("/api/v1/geoip/{ip}", get(api_geoip))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn render_template(
    tera: &tera::Tera,
    template: &str,
    context: &Context,
) -> Result<Html<String>, FlowVizError> {
    Ok(Html(tera.render(template, context)?))
}

/// GET / - Dashboard with the heaviest flows of the current window.
pub async fn index(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let granularity = state.config.granularity();
    let report = state.aggregator.aggregate(state.config.window(), granularity);

    let mut rows = Vec::with_capacity(DASHBOARD_TOP_FLOWS);
    for flow in report.top_by_bytes(DASHBOARD_TOP_FLOWS) {
        let geo = state.geo.cached(&flow.dst_addr.to_string()).await;
        rows.push(FlowRow {
            flow,
            total_bytes: flow.total_bytes(),
            geo,
        });
    }

    let mut context = Context::new();
    context.insert("flows", &rows);
    context.insert("total_flows", &report.len());
    context.insert("interfaces", &state.accounting.interfaces().len());
    context.insert("geo_cached", &state.geo.len().await);
    context.insert("window_secs", &state.config.window().as_secs());
    context.insert("l4", &(granularity == Granularity::L4));

    render_template(&state.tera, "dashboard.html", &context)
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/v1/flows - Flows merged across all interfaces, as a JSON array.
///
/// The report returns its pooled flows once the body is serialized.
pub async fn api_flows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FlowQuery>,
) -> impl IntoResponse {
    let granularity = query
        .l4
        .map(Granularity::from_decode_l4)
        .unwrap_or_else(|| state.config.granularity());

    let report = state.aggregator.aggregate(state.config.window(), granularity);
    if report.is_empty() {
        debug!("no flows in the current window");
    }
    Json(report)
}

/// GET /api/v1/geoip/{ip} - Country and city for a public address.
pub async fn api_geoip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Result<Json<GeoInfo>, FlowVizError> {
    state.geo.lookup(&ip).await.map(Json)
}

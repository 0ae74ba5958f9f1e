//! Axum JSON API over the catalog: list/search, detail, stats and a manual refresh.
//! Every route passes through the request guard; read views go through the response cache.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use agrofund_core::{env, CatalogQuery, CatalogStats, FundingOpportunity, SortOrder, Status};
use agrofund_guard::{AccessAttempt, RequestMeta, SecurityConfig, SecurityGuard};
use agrofund_storage::{cache_key, CacheAges, CacheKey};
use agrofund_sync::{RefreshPipeline, SyncConfig};
use anyhow::Context;
use axum::{
    extract::{ConnectInfo, Path as AxumPath, Query, Request, State},
    http::StatusCode,
    middleware::{from_fn_with_state, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agrofund-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub cache_ages: CacheAges,
    /// Reverse proxies whose `X-Forwarded-For` is believed. Empty means the header is ignored.
    pub trusted_proxies: Vec<IpAddr>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::parsed("AGROFUND_WEB_PORT", 8000),
            cache_ages: CacheAges::from_env(),
            trusted_proxies: parse_proxy_list(&env::string("AGROFUND_TRUSTED_PROXIES", "")),
        }
    }
}

fn parse_proxy_list(raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match item.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(entry = item, "ignoring malformed trusted proxy address");
                None
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RefreshPipeline>,
    pub guard: Arc<SecurityGuard>,
    pub cache_ages: CacheAges,
    pub trusted_proxies: Vec<IpAddr>,
}

impl AppState {
    pub fn new(pipeline: Arc<RefreshPipeline>, guard: Arc<SecurityGuard>, cache_ages: CacheAges) -> Self {
        Self {
            pipeline,
            guard,
            cache_ages,
            trusted_proxies: Vec::new(),
        }
    }

    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = proxies;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    status: Option<String>,
    source: Option<String>,
    area: Option<String>,
    q: Option<String>,
    sort: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

impl OpportunitiesQuery {
    fn cache_key(&self) -> CacheKey {
        let page = self.page.map(|p| p.to_string()).unwrap_or_default();
        let per_page = self.per_page.map(|p| p.to_string()).unwrap_or_default();
        cache_key(
            "list",
            &[],
            &[
                ("status", self.status.as_deref().unwrap_or_default()),
                ("source", self.source.as_deref().unwrap_or_default()),
                ("area", self.area.as_deref().unwrap_or_default()),
                ("q", self.q.as_deref().unwrap_or_default()),
                ("sort", self.sort.as_deref().unwrap_or_default()),
                ("page", page.as_str()),
                ("per_page", per_page.as_str()),
            ],
        )
    }

    fn to_catalog_query(&self) -> Result<CatalogQuery, String> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(label) => Some(Status::from_label(label).ok_or_else(|| format!("unknown status {label:?}"))?),
        };
        let sort: SortOrder = self.sort.as_deref().unwrap_or_default().trim().parse()?;
        Ok(CatalogQuery {
            status,
            source: self.source.clone(),
            area: self.area.clone(),
            text: self.q.clone(),
            sort,
        })
    }
}

/// One page of catalog rows; this is what the list cache stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CatalogPage {
    records: Vec<FundingOpportunity>,
    page: usize,
    per_page: usize,
    total: usize,
    total_pages: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OpportunityView<'a> {
    id: Uuid,
    amount_value: f64,
    #[serde(flatten)]
    record: &'a FundingOpportunity,
}

impl<'a> From<&'a FundingOpportunity> for OpportunityView<'a> {
    fn from(record: &'a FundingOpportunity) -> Self {
        Self {
            id: record.id(),
            amount_value: record.amount_value(),
            record,
        }
    }
}

#[derive(Serialize)]
struct OpportunityListResponse<'a> {
    items: Vec<OpportunityView<'a>>,
    page: usize,
    per_page: usize,
    total: usize,
    total_pages: usize,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/opportunities/{id}", get(opportunity_detail_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/refresh", post(refresh_handler))
        .layer(from_fn_with_state(Arc::clone(&state), guard_requests))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let pipeline = Arc::new(RefreshPipeline::new(SyncConfig::from_env())?);
    let guard = Arc::new(SecurityGuard::new(SecurityConfig::from_env()));

    let scheduler = RefreshPipeline::maybe_build_scheduler(Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting refresh scheduler")?;
    }

    let state = AppState::new(pipeline, guard, web.cache_ages).with_trusted_proxies(web.trusted_proxies);
    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, "serving");
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// The socket peer, unless the peer is a trusted proxy. Then `X-Forwarded-For` is walked
/// from the nearest hop and the first address that is not itself a trusted proxy wins.
fn client_ip(request: &Request, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
    else {
        return "unknown".to_string();
    };
    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let hops: Vec<&str> = request
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();
    for hop in hops.iter().rev() {
        match hop.parse::<IpAddr>() {
            Ok(ip) if trusted_proxies.contains(&ip) => continue,
            Ok(ip) => return ip.to_string(),
            Err(_) => break,
        }
    }
    peer.to_string()
}

async fn guard_requests(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let ip = client_ip(&request, &state.trusted_proxies);
    let user_agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let endpoint = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let meta = RequestMeta {
        ip: &ip,
        user_agent: &user_agent,
        endpoint: &endpoint,
        method: &method,
    };
    let response = match state.guard.inspect(meta).await {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            warn!(ip = %ip, endpoint = %endpoint, reason = %rejection, "request rejected");
            let status = StatusCode::from_u16(rejection.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            (status, Json(serde_json::json!({ "error": rejection.to_string() }))).into_response()
        }
    };

    state.guard.log_access(&AccessAttempt {
        timestamp: Utc::now(),
        ip,
        user_agent,
        endpoint,
        method,
        status_code: response.status().as_u16(),
        response_time_ms: started.elapsed().as_millis() as u64,
    })
    .await;
    response
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let catalog_query = match query.to_catalog_query() {
        Ok(q) => q,
        Err(reason) => return bad_request(reason),
    };
    let key = query.cache_key();
    let page = match cached(&state, &key, state.cache_ages.list).await {
        Some(page) => page,
        None => {
            let records = state.pipeline.store().load().await;
            let page = paginate(catalog_query.apply(&records), query.page, query.per_page);
            store_cached(&state, &key, state.cache_ages.list, &page).await;
            page
        }
    };

    Json(OpportunityListResponse {
        items: page.records.iter().map(OpportunityView::from).collect(),
        page: page.page,
        per_page: page.per_page,
        total: page.total,
        total_pages: page.total_pages,
    })
    .into_response()
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let key = cache_key("detail", &[&id], &[]);
    let found: Option<FundingOpportunity> = match cached(&state, &key, state.cache_ages.detail).await {
        Some(record) => Some(record),
        None => {
            let records = state.pipeline.store().load().await;
            let found = records.into_iter().find(|r| r.id().to_string() == id);
            if let Some(record) = &found {
                store_cached(&state, &key, state.cache_ages.detail, record).await;
            }
            found
        }
    };

    match found {
        Some(record) => Json(OpportunityView::from(&record)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "opportunity not found" })),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let key = cache_key("stats", &[], &[]);
    let stats: CatalogStats = match cached(&state, &key, state.cache_ages.stats).await {
        Some(stats) => stats,
        None => {
            let stats = CatalogStats::from_records(&state.pipeline.store().load().await);
            store_cached(&state, &key, state.cache_ages.stats, &stats).await;
            stats
        }
    };
    Json(stats).into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn cached<T: DeserializeOwned>(state: &AppState, key: &CacheKey, max_age: std::time::Duration) -> Option<T> {
    state.pipeline.cache().get(key, max_age).await
}

async fn store_cached<T: Serialize>(state: &AppState, key: &CacheKey, max_age: std::time::Duration, value: &T) {
    if let Err(err) = state.pipeline.cache().set(key, value, max_age).await {
        warn!(operation = %key.operation, error = %err, "failed to cache response");
    }
}

fn paginate(filtered: Vec<FundingOpportunity>, page: Option<usize>, per_page: Option<usize>) -> CatalogPage {
    let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let records = filtered.into_iter().skip(start).take(per_page).collect();
    CatalogPage {
        records,
        page,
        per_page,
        total,
        total_pages,
    }
}

fn bad_request(reason: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": reason }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use agrofund_adapters::{FetchSource, StaticSource};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn seed() -> Vec<agrofund_core::RawRecord> {
        json!([
            {"name": "Riego Tecnificado", "source": "CNR", "status": "Abierto", "amount": "CLP 1.000.000", "areaOfInterest": "Riego"},
            {"name": "Innovación Agraria", "source": "FIA", "status": "Cerrado", "amount": "USD 50,000", "areaOfInterest": "Innovación"},
            {"name": "Praderas Suplementarias", "source": "INDAP", "status": "Open", "amount": "USD 2,500", "areaOfInterest": "Ganadería"}
        ])
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    async fn test_app(root: &Path, per_minute: usize) -> (Router, Arc<RefreshPipeline>) {
        test_app_behind(root, per_minute, Vec::new()).await
    }

    async fn test_app_behind(
        root: &Path,
        per_minute: usize,
        trusted_proxies: Vec<IpAddr>,
    ) -> (Router, Arc<RefreshPipeline>) {
        let sources: Vec<Box<dyn FetchSource>> = vec![Box::new(StaticSource::new("seed", seed()))];
        let pipeline = Arc::new(
            RefreshPipeline::new(SyncConfig::rooted(root))
                .unwrap()
                .with_sources(sources),
        );
        pipeline.run_once().await.unwrap();
        let guard = Arc::new(SecurityGuard::new(SecurityConfig {
            requests_per_minute: per_minute,
            requests_per_hour: 10_000,
            suspicious_threshold: 100,
            block_duration_hours: 1,
            state_dir: root.join("security"),
        }));
        let state = AppState::new(Arc::clone(&pipeline), guard, CacheAges::default())
            .with_trusted_proxies(trusted_proxies);
        (app(state), pipeline)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn list_filters_sorts_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), 100).await;

        let (status, body) = get_json(&app, "/api/opportunities?sort=amount_desc&per_page=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["items"][0]["name"], "Riego Tecnificado");
        assert_eq!(body["items"][0]["amountValue"], 1_000_000.0);

        let (_, open) = get_json(&app, "/api/opportunities?status=open").await;
        assert_eq!(open["total"], 2);

        let (_, fuzzy) = get_json(&app, "/api/opportunities?q=Inovacion%20Agraria").await;
        assert_eq!(fuzzy["items"][0]["source"], "FIA");

        let (status, _) = get_json(&app, "/api/opportunities?sort=random").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detail_by_id_and_missing_id() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pipeline) = test_app(dir.path(), 100).await;
        let id = pipeline.store().load().await[1].id();

        let (status, body) = get_json(&app, &format!("/api/opportunities/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Innovación Agraria");
        assert_eq!(body["status"], "Closed");

        let (status, _) = get_json(&app, &format!("/api/opportunities/{}", Uuid::nil())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_are_cached_until_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (app, pipeline) = test_app(dir.path(), 100).await;

        let (_, stats) = get_json(&app, "/api/stats").await;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["open"], 2);

        pipeline.store().save(&[]).await.unwrap();
        let (_, cached) = get_json(&app, "/api/stats").await;
        assert_eq!(cached["total"], 3);

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let stale = pipeline
            .cache()
            .get::<CatalogStats>(&cache_key("stats", &[], &[]), Duration::from_secs(60))
            .await;
        assert!(stale.is_none());

        let (_, fresh) = get_json(&app, "/api/stats").await;
        assert_eq!(fresh["total"], 3);
    }

    fn request_from(peer: [u8; 4], forwarded: Option<&str>, uri: &str) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from((peer, 40_000))));
        if let Some(chain) = forwarded {
            builder = builder.header("x-forwarded-for", chain);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn guard_rejects_floods_and_attacks_per_client() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), 2).await;

        for _ in 0..2 {
            let resp = app.clone().oneshot(request_from([198, 51, 100, 1], None, "/health")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = app.clone().oneshot(request_from([198, 51, 100, 1], None, "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = app.clone().oneshot(request_from([198, 51, 100, 2], None, "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(request_from(
                [198, 51, 100, 3],
                None,
                "/api/opportunities?q=%3Cscript%3Ealert(1)%3C/script%3E",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let log = std::fs::read_to_string(dir.path().join("security/access_log.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 5);
    }

    #[tokio::test]
    async fn forwarded_header_from_untrusted_peer_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path(), 2).await;

        let mut accepted = 0;
        for i in 0..50 {
            let chain = format!("192.0.2.{i}");
            let resp = app
                .clone()
                .oneshot(request_from([203, 0, 113, 5], Some(&chain), "/health"))
                .await
                .unwrap();
            if resp.status() == StatusCode::OK {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);

        // The addresses named in the header were never charged.
        let resp = app.clone().oneshot(request_from([192, 0, 2, 7], None, "/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let log = std::fs::read_to_string(dir.path().join("security/access_log.jsonl")).unwrap();
        let first: AccessAttempt = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(first.ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn trusted_proxy_forwards_the_client_address() {
        let dir = tempfile::tempdir().unwrap();
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let (app, _) = test_app_behind(dir.path(), 2, vec![proxy]).await;
        let via_proxy = |chain: &str| request_from([10, 0, 0, 1], Some(chain), "/health");

        for _ in 0..2 {
            let resp = app.clone().oneshot(via_proxy("6.6.6.6, 198.51.100.1")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        // A client-supplied leftmost hop does not change who is charged.
        let resp = app.clone().oneshot(via_proxy("7.7.7.7, 198.51.100.1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

        let resp = app.clone().oneshot(via_proxy("198.51.100.2, 10.0.0.1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn proxy_list_skips_malformed_entries() {
        assert_eq!(
            parse_proxy_list(" 10.0.0.1, nonsense ,::1,"),
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert!(parse_proxy_list("").is_empty());
    }

    #[test]
    fn pagination_clamps_out_of_range_pages() {
        let records: Vec<_> = (0..5).map(|i| FundingOpportunity::named(format!("F{i}"))).collect();
        let page = paginate(records, Some(9), Some(2));
        assert_eq!(page.page, 3);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.records.len(), 1);

        let empty = paginate(Vec::new(), None, Some(0));
        assert_eq!((empty.page, empty.per_page, empty.total_pages), (1, 1, 1));
    }
}

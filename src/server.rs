use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::compiler::CompiledConfig;
use crate::dns::{DnsProbe, DnsResolution};
use crate::driver::{Driver, InterfaceStatus};
use crate::error::NetworkError;
use crate::interface::{list_interfaces, DEFAULT_MAX_ATTEMPTS};
use crate::network::{NetworkHandle, ReinitReport};
use crate::scan::{ScanEngine, ScanEntry};
use crate::supervisor::Worker;

pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn local(port: u16) -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port,
        }
    }
}

pub struct ApiState {
    pub driver: Arc<dyn Driver>,
    pub scan: Arc<ScanEngine>,
    pub dns: DnsProbe,
    pub network: NetworkHandle,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/interfaces", get(interfaces_handler))
        .route("/scan/:iface", get(scan_handler))
        .route("/level/:iface/:ssid", get(level_handler))
        .route("/dns", get(dns_handler))
        .route("/network", get(network_handler))
        .route("/network/reload", post(reload_handler))
        .layer(cors)
        .with_state(state)
}

/// The local JSON API, run as a supervised worker.
pub struct HttpApi {
    config: ServerConfig,
    state: Arc<ApiState>,
}

impl HttpApi {
    pub fn new(config: ServerConfig, state: ApiState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl Worker for HttpApi {
    async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "HTTP API listening");

        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

/// A [`NetworkError`] rendered as `{"error": ...}` with a matching status.
pub struct ApiError(NetworkError);

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            NetworkError::InterfaceNotFound(_) => StatusCode::NOT_FOUND,
            NetworkError::Resolution { .. } => StatusCode::BAD_GATEWAY,
            NetworkError::ScanTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            NetworkError::SupervisorGone => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_configuration_error() => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::debug!(%status, "request failed: {}", self.0);
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn interfaces_handler(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<BTreeMap<String, InterfaceStatus>> {
    Ok(Json(
        list_interfaces(state.driver.as_ref(), DEFAULT_MAX_ATTEMPTS).await?,
    ))
}

async fn scan_handler(
    State(state): State<Arc<ApiState>>,
    Path(iface): Path<String>,
) -> ApiResult<Vec<ScanEntry>> {
    Ok(Json(state.scan.scan(&iface).await?))
}

#[derive(Serialize)]
struct Level {
    interface: String,
    ssid: String,
    level: Option<i64>,
}

async fn level_handler(
    State(state): State<Arc<ApiState>>,
    Path((iface, ssid)): Path<(String, String)>,
) -> ApiResult<Level> {
    let level = state.scan.get_level(&iface, &ssid).await?;
    Ok(Json(Level {
        interface: iface,
        ssid,
        level,
    }))
}

#[derive(Deserialize)]
struct DnsQuery {
    host: Option<String>,
}

async fn dns_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DnsQuery>,
) -> ApiResult<DnsResolution> {
    Ok(Json(state.dns.test_dns(query.host.as_deref()).await?))
}

async fn network_handler(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<CompiledConfig>> {
    let active = state.network.active_interfaces().await?;
    Ok(Json(active.iter().map(CompiledConfig::redacted).collect()))
}

async fn reload_handler(State(state): State<Arc<ApiState>>) -> ApiResult<ReinitReport> {
    Ok(Json(state.network.reload().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NetworkInterfaceRecord};
    use crate::network::{InterfaceSupervisor, NetworkOptions};
    use crate::scan::ScanOptions;
    use crate::testing::MockDriver;

    struct Fixture {
        base: String,
        driver: Arc<MockDriver>,
        shutdown: CancellationToken,
    }

    async fn serve(config: Config, driver: MockDriver) -> Fixture {
        let driver = Arc::new(driver);
        let store = Arc::new(config);
        let scan = ScanEngine::new(driver.clone(), ScanOptions::default());
        let network = InterfaceSupervisor::new(
            store.clone(),
            driver.clone(),
            scan.clone(),
            NetworkOptions::default(),
        );
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let network = network.clone();
            let token = shutdown.clone();
            async move { network.run(token).await }
        });

        let state = Arc::new(ApiState {
            driver: driver.clone(),
            scan,
            dns: DnsProbe::new(driver.clone(), store),
            network: network.handle(),
        });
        // Wait for the initial bring-up so wireless sessions exist.
        state.network.active_interfaces().await.unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = router(state);
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });

        Fixture {
            base,
            driver,
            shutdown,
        }
    }

    async fn get(url: &str) -> (StatusCode, serde_json::Value) {
        let response = reqwest::get(url).await.unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        let body = response.text().await.unwrap();
        (status, serde_json::from_str(&body).unwrap())
    }

    fn barn_config() -> Config {
        Config {
            interfaces: vec![NetworkInterfaceRecord::wireless("wlan0", "Barn", "NONE")],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn lists_interfaces() {
        let fx = serve(
            Config::default(),
            MockDriver::new().with_enumerations(vec![vec!["lo", "eth0", "wlan0"]]),
        )
        .await;

        let (status, body) = get(&format!("{}/interfaces", fx.base)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("eth0").is_some());
        assert_eq!(body["wlan0"]["wireless"], true);
        assert!(body.get("lo").is_none());
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn scans_and_reports_levels() {
        let driver = MockDriver::new().with_scan_results(
            "wlan0",
            vec![vec![
                "aa:bb\t2412\t-60\t[ESS]\tBarn",
                "cc:dd\t2437\t-40\t[WPA2-PSK-CCMP][ESS]\tBarn",
                "ee:ff\t2462\t-70\t[ESS]",
            ]],
        );
        let fx = serve(barn_config(), driver).await;

        let (status, body) = get(&format!("{}/scan/wlan0", fx.base)).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["level"], -40);
        assert_eq!(entries[0]["security"], "WPA-PSK");

        let (_, body) = get(&format!("{}/level/wlan0/Barn", fx.base)).await;
        assert_eq!(body["level"], -40);
        let (_, body) = get(&format!("{}/level/wlan0/Nowhere", fx.base)).await;
        assert!(body["level"].is_null());

        assert_eq!(fx.driver.scan_requests().len(), 3);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn resolution_failure_maps_to_bad_gateway() {
        let fx = serve(Config::default(), MockDriver::new()).await;

        let (status, body) = get(&format!("{}/dns?host=nowhere.invalid", fx.base)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("nowhere.invalid"));

        let (status, body) = get(&format!("{}/dns?host=10.0.0.1", fx.base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["synthetic"], true);
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn reports_active_network_configs() {
        let fx = serve(barn_config(), MockDriver::new()).await;

        let (status, body) = get(&format!("{}/network", fx.base)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["interface_name"], "wlan0");
        assert_eq!(body[0]["type"], "wireless");
        assert_eq!(body[0]["driver_options"]["ssid"], "Barn");

        let response = reqwest::Client::new()
            .post(format!("{}/network/reload", fx.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let report: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(report["unchanged"][0], "wlan0");
        fx.shutdown.cancel();
    }

    #[tokio::test]
    async fn network_listing_hides_credentials() {
        let mut record = NetworkInterfaceRecord::wireless("wlan0", "Barn", "WPA-PSK");
        record.psk = Some("hunter22".into());
        let config = Config {
            interfaces: vec![record],
            ..Config::default()
        };
        let fx = serve(config, MockDriver::new()).await;

        let response = reqwest::get(format!("{}/network", fx.base)).await.unwrap();
        let text = response.text().await.unwrap();
        assert!(!text.contains("hunter22"), "credentials leaked: {text}");
        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(body[0]["driver_options"]["psk"], "********");
        assert_eq!(body[0]["driver_options"]["ssid"], "Barn");

        // The running worker still got the real key.
        let (_, options) = fx.driver.bring_ups().pop().unwrap();
        assert_eq!(options["psk"], crate::compiler::OptionValue::Text("hunter22".into()));
        fx.shutdown.cancel();
    }
}

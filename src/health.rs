//! Health and metrics endpoints.
//!
//! `/health` answers 200 `healthy` while the backend worker can take exchanges and 503
//! `degraded` once it has been seen dead; the front-end itself keeps serving either way.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let worker = state.worker().snapshot();

    let mut response = if worker.available {
        HttpResponse::Ok()
    } else {
        HttpResponse::ServiceUnavailable()
    };

    response.json(json!({
        "status": if worker.available { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "active_requests": metrics.active_requests
        },
        "worker": {
            "available": worker.available,
            "pid": worker.pid,
            "failure": worker.failure
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "active_requests": metrics.active_requests,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "worker": state.worker().snapshot(),
        "admission": {
            "max_concurrent_requests": config.performance.max_concurrent_requests,
            "available_slots": state.available_slots()
        },
        "memory": get_memory_info()
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return json!({ "available": false }),
    };

    json!({
        "resident_memory_bytes": status_field_bytes(&status, "VmRSS:"),
        "virtual_memory_bytes": status_field_bytes(&status, "VmSize:"),
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    json!({
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// Parse a `/proc/<pid>/status` line such as `VmRSS:   123 kB` into bytes.
#[cfg(target_os = "linux")]
fn status_field_bytes(status: &str, key: &str) -> u64 {
    status
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{sh_worker, test_config, ECHO_BACKEND};
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_follows_worker_availability() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(sh_worker(ECHO_BACKEND)));
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["worker"]["available"], true);

        state.worker().shutdown();

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let response = actix_test::call_service(&app, req).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert_eq!(body["status"], "degraded");
    }

    #[actix_web::test]
    async fn test_health_degrades_when_backend_exits_between_requests() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(sh_worker("exit 1")));
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/health", web::get().to(health_check)),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let response = actix_test::call_service(&app, req).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = actix_test::read_body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["worker"]["available"], false);
        assert_eq!(state.worker().snapshot().exchanges_failed, 0);
    }

    #[actix_web::test]
    async fn test_metrics_report_worker_counters() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path()), Arc::new(sh_worker(ECHO_BACKEND)));
        state.worker().exchange("ping").await.unwrap();
        state.record_endpoint_request("POST /", 12, false);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = actix_test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["worker"]["exchanges_completed"], 1);
        assert_eq!(body["endpoints"][0]["endpoint"], "POST /");
        assert!(body["admission"]["available_slots"].is_null());
        state.worker().shutdown();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_status_field_parsing() {
        let status = "Name:\tspeech-gateway\nVmSize:\t  2048 kB\nVmRSS:\t   512 kB\n";
        assert_eq!(status_field_bytes(status, "VmRSS:"), 512 * 1024);
        assert_eq!(status_field_bytes(status, "VmSize:"), 2048 * 1024);
        assert_eq!(status_field_bytes(status, "VmSwap:"), 0);
    }
}

// src/handlers/index.rs
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::Config;
use crate::metrics::{write_process_metrics, ApiMetrics};
use crate::registry::ServerList;

pub async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("application/json")
        .body("{\"status\": \"ok\"}")
}

pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound()
        .insert_header(("Cache-Control", "private, no-cache, no-store"))
        .body("not found")
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub secret: Option<String>,
}

/// Prometheus exposition. Registry metrics are public; process and API
/// metrics need the shared secret. Nothing here may ever include account
/// or token values.
pub async fn metrics(
    registry: web::Data<ServerList>,
    api_metrics: web::Data<ApiMetrics>,
    cfg: web::Data<Config>,
    query: web::Query<MetricsQuery>,
) -> HttpResponse {
    let internal = match (&cfg.metrics_secret, &query.secret) {
        (Some(secret), Some(supplied)) => {
            bool::from(secret.as_bytes().ct_eq(supplied.as_bytes()))
        }
        _ => false,
    };

    let mut out = String::new();
    if internal {
        write_process_metrics(&mut out);
        out.push('\n');
        api_metrics.write_prometheus(&mut out);
        out.push('\n');
    }
    registry.write_prometheus(&mut out);

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .insert_header(("Cache-Control", "private, no-cache, no-store"))
        .body(out)
}

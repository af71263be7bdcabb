// src/handlers/player.rs
use actix_web::{web, HttpRequest, HttpResponse};
use log::{error, info, warn};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use super::{check_rate, request_ip, ApiError, ApiErrorKind, Limiters};
use crate::config::Config;
use crate::metrics::ApiMetrics;
use crate::models::account::{Account, TokenCheck};
use crate::realip::RealIpRules;
use crate::storage::Storages;
use crate::upstream::{UpstreamAuth, UpstreamError};
use crate::utils::maybe_gzip;

const MAX_PDATA_SIZE: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct OriginAuthQuery {
    pub id: String,
    pub token: String,
    pub version: Option<String>,
}

/// Verifies a player's claimed identity with the upstream provider and
/// issues the session token game servers validate against us.
pub async fn origin_auth(
    req: HttpRequest,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    upstream: web::Data<UpstreamAuth>,
    storages: web::Data<Storages>,
    metrics: web::Data<ApiMetrics>,
    query: web::Query<OriginAuthQuery>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.player_auth, &ip, "origin_auth")?;

    let q = query.into_inner();
    if q.id.is_empty() || q.id.len() > 64 {
        return Err(ApiError::bad_request("invalid player id"));
    }

    if let Some(minimum) = &cfg.minimum_launcher_version {
        let current = q
            .version
            .as_deref()
            .and_then(|v| semver::Version::parse(v.trim_start_matches('v')).ok());
        if !current.map_or(false, |v| v >= *minimum) {
            return Err(ApiError::new(
                ApiErrorKind::LauncherOutdated,
                format!("launcher {} or newer required", minimum),
            ));
        }
    }

    let now = SystemTime::now();
    if cfg.insecure_dev_no_check_player_auth {
        warn!(
            "INSECURE_DEV_NO_CHECK_PLAYER_AUTH: skipping upstream identity check for {}",
            q.id
        );
    } else {
        let mgr = match &upstream.0 {
            Some(mgr) => mgr,
            None => {
                metrics.auth_unavailable.fetch_add(1, Ordering::Relaxed);
                return Err(ApiError::new(
                    ApiErrorKind::AuthUnavailable,
                    "no identity provider configured",
                ));
            }
        };
        match mgr.verify_player(now, &q.id, &q.token).await {
            Ok(true) => {}
            Ok(false) => {
                metrics.auth_denied.fetch_add(1, Ordering::Relaxed);
                return Err(ApiError::new(
                    ApiErrorKind::AuthFailed,
                    "identity provider rejected the supplied token",
                ));
            }
            Err(UpstreamError::Unavailable) => {
                metrics.auth_unavailable.fetch_add(1, Ordering::Relaxed);
                return Err(ApiError::new(
                    ApiErrorKind::AuthUnavailable,
                    "identity provider session unavailable, try again later",
                ));
            }
            Err(e) => {
                metrics.auth_unavailable.fetch_add(1, Ordering::Relaxed);
                error!("upstream verification error for {}: {}", q.id, e);
                return Err(ApiError::new(
                    ApiErrorKind::AuthUnavailable,
                    "identity provider error, try again later",
                ));
            }
        }
    }

    let mut account = storages
        .accounts
        .get_account(&q.id)?
        .unwrap_or_else(|| Account::new(&q.id));
    let token = uuid::Uuid::new_v4().to_string();
    account.issue_token(token.clone(), now);
    storages.accounts.upsert_account(account)?;
    metrics.tokens_issued.fetch_add(1, Ordering::Relaxed);
    info!("issued session token for {}", q.id);

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "token": token,
        "expires_in": cfg.token_expiry_secs,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub id: String,
    pub token: String,
}

/// Game-server callback: does this token belong to this player right now?
pub async fn validate(
    req: HttpRequest,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    storages: web::Data<Storages>,
    metrics: web::Data<ApiMetrics>,
    query: web::Query<ValidateQuery>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.player_auth, &ip, "validate")?;

    let account = match storages.accounts.get_account(&query.id)? {
        Some(account) => account,
        None => {
            metrics.validate_not_found.fetch_add(1, Ordering::Relaxed);
            return Err(ApiError::not_found());
        }
    };
    let expiry = Duration::from_secs(cfg.token_expiry_secs);
    match account.check_token(&query.token, SystemTime::now(), expiry) {
        TokenCheck::Valid => {
            metrics.validate_ok.fetch_add(1, Ordering::Relaxed);
            Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
        }
        TokenCheck::Mismatch => {
            metrics.validate_mismatch.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::new(ApiErrorKind::TokenMismatch, "token mismatch"))
        }
        TokenCheck::Expired => {
            metrics.validate_expired.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::new(ApiErrorKind::TokenExpired, "token expired"))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PdataQuery {
    pub id: String,
}

pub async fn get_pdata(
    req: HttpRequest,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    storages: web::Data<Storages>,
    metrics: web::Data<ApiMetrics>,
    query: web::Query<PdataQuery>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.player_auth, &ip, "pdata read")?;

    let blob = storages.pdata.get_pdata(&query.id)?.ok_or_else(ApiError::not_found)?;
    metrics.pdata_reads.fetch_add(1, Ordering::Relaxed);

    let (body, compressed) = maybe_gzip(&req, blob);
    let mut resp = HttpResponse::Ok();
    resp.content_type("application/octet-stream");
    if compressed {
        resp.insert_header(("Content-Encoding", "gzip"));
    }
    Ok(resp.body(body))
}

#[derive(Debug, Deserialize)]
pub struct PdataWriteQuery {
    pub id: String,
    pub token: String,
}

/// Writes require a currently valid session token.
pub async fn put_pdata(
    req: HttpRequest,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    storages: web::Data<Storages>,
    metrics: web::Data<ApiMetrics>,
    query: web::Query<PdataWriteQuery>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.player_auth, &ip, "pdata write")?;

    if body.len() > MAX_PDATA_SIZE {
        return Err(ApiError::bad_request("pdata too large"));
    }
    let account = storages
        .accounts
        .get_account(&query.id)?
        .ok_or_else(ApiError::not_found)?;
    let expiry = Duration::from_secs(cfg.token_expiry_secs);
    match account.check_token(&query.token, SystemTime::now(), expiry) {
        TokenCheck::Valid => {}
        TokenCheck::Mismatch => {
            return Err(ApiError::new(ApiErrorKind::TokenMismatch, "token mismatch"))
        }
        TokenCheck::Expired => {
            return Err(ApiError::new(ApiErrorKind::TokenExpired, "token expired"))
        }
    }
    storages.pdata.set_pdata(&query.id, body.to_vec())?;
    metrics.pdata_writes.fetch_add(1, Ordering::Relaxed);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

// src/handlers/mod.rs
pub mod index;
pub mod player;
pub mod servers;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::RateLimiter;
use log::{debug, error};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use crate::config::Config;
use crate::realip::RealIpRules;
use crate::registry::{self, RegisterError};
use crate::storage::StorageError;
use crate::utils::{ensure_host_allowed, RequestError};

pub type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Per-endpoint keyed rate limiters, one bundle so the app data stays
/// unambiguous.
pub struct Limiters {
    pub heartbeat: IpRateLimiter,
    pub list: IpRateLimiter,
    pub remove: IpRateLimiter,
    pub player_auth: IpRateLimiter,
}

impl Limiters {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            heartbeat: RateLimiter::keyed(cfg.heartbeat_quota),
            list: RateLimiter::keyed(cfg.server_list_quota),
            remove: RateLimiter::keyed(cfg.server_remove_quota),
            player_auth: RateLimiter::keyed(cfg.player_auth_quota),
        }
    }
}

/// Error enum values are part of the wire contract; clients switch on
/// them, so they stay stable even when messages improve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorKind {
    BadRequest,
    DuplicateId,
    CapacityExceeded,
    PerIpLimitExceeded,
    NoGameserverResponse,
    NotFound,
    TokenMismatch,
    TokenExpired,
    AuthFailed,
    AuthUnavailable,
    LauncherOutdated,
    StorageError,
    RateLimitExceeded,
    HostNotAllowed,
    Ipv6NotSupported,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub msg: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::BadRequest, msg)
    }

    pub fn not_found() -> Self {
        Self::new(ApiErrorKind::NotFound, "no such server or player")
    }

    pub fn rate_limited() -> Self {
        Self::new(ApiErrorKind::RateLimitExceeded, "rate limit exceeded")
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self.kind {
            ApiErrorKind::BadRequest
            | ApiErrorKind::NoGameserverResponse
            | ApiErrorKind::Ipv6NotSupported => StatusCode::BAD_REQUEST,
            ApiErrorKind::DuplicateId => StatusCode::CONFLICT,
            ApiErrorKind::CapacityExceeded | ApiErrorKind::AuthUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiErrorKind::PerIpLimitExceeded | ApiErrorKind::HostNotAllowed => {
                StatusCode::FORBIDDEN
            }
            ApiErrorKind::NotFound => StatusCode::NOT_FOUND,
            ApiErrorKind::TokenMismatch
            | ApiErrorKind::TokenExpired
            | ApiErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ApiErrorKind::LauncherOutdated => StatusCode::UPGRADE_REQUIRED,
            ApiErrorKind::StorageError => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "success": false,
            "error": { "enum": self.kind, "msg": self.msg },
        }))
    }
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        let kind = match e {
            RequestError::HostNotAllowed => ApiErrorKind::HostNotAllowed,
            RequestError::Ipv6NotSupported => ApiErrorKind::Ipv6NotSupported,
            RequestError::MissingPeerIp
            | RequestError::MissingForwardedIp
            | RequestError::InvalidForwardedIp => ApiErrorKind::BadRequest,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<RegisterError> for ApiError {
    fn from(e: RegisterError) -> Self {
        let kind = match e {
            RegisterError::DuplicateId => ApiErrorKind::DuplicateId,
            RegisterError::CapacityExceeded => ApiErrorKind::CapacityExceeded,
            RegisterError::PerIpLimitExceeded => ApiErrorKind::PerIpLimitExceeded,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<registry::NotFound> for ApiError {
    fn from(_: registry::NotFound) -> Self {
        Self::not_found()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        error!("storage error: {}", e);
        Self::new(ApiErrorKind::StorageError, "storage backend error")
    }
}

/// Host allow-list plus real client IP, the preamble of every handler.
pub fn request_ip(
    req: &HttpRequest,
    rules: &RealIpRules,
    cfg: &Config,
) -> Result<IpAddr, ApiError> {
    ensure_host_allowed(req, &cfg.hosts)?;
    Ok(rules.client_ip(req)?)
}

pub fn check_rate(limiter: &IpRateLimiter, ip: &IpAddr, what: &str) -> Result<(), ApiError> {
    if limiter.check_key(ip).is_err() {
        debug!("rate limit exceeded for {} from {}", what, ip);
        return Err(ApiError::rate_limited());
    }
    Ok(())
}

/// Route table shared by main and the integration tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/server/add_server", web::post().to(servers::add_server))
        .route("/server/update_values", web::post().to(servers::heartbeat))
        .route("/server/heartbeat", web::post().to(servers::heartbeat))
        .route("/server/remove_server", web::post().to(servers::remove_server))
        .route("/client/servers", web::get().to(servers::get_servers))
        .route("/player/origin_auth", web::get().to(player::origin_auth))
        .route("/player/validate", web::get().to(player::validate))
        .service(
            web::resource("/player/pdata")
                .route(web::get().to(player::get_pdata))
                .route(web::post().to(player::put_pdata)),
        )
        .route("/metrics", web::get().to(index::metrics))
        .route("/", web::get().to(index::index))
        .default_service(web::route().to(index::not_found));
}

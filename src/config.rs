// src/config.rs
use governor::Quota;
use ipnetwork::IpNetwork;
use std::env;
use std::fmt::Display;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::realip::{parse_map_rules, parse_networks, MapRule};
use crate::registry::{Limits, Timings};

/// Process configuration, read once at startup. Structured values that
/// fail to parse are startup errors, before the server accepts anything.
#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub tls_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Host allow-list; empty allows any Host header.
    pub hosts: Vec<String>,
    pub trusted_proxies: Vec<IpNetwork>,
    pub dev_map_ip: Vec<MapRule>,

    pub verify_time_secs: u64,
    pub ghost_time_secs: u64,
    pub dead_time_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_servers: usize,
    pub max_servers_per_ip: usize,
    pub allow_gameserver_ipv6: bool,

    pub token_expiry_secs: u64,
    pub minimum_launcher_version: Option<semver::Version>,
    pub insecure_dev_no_check_player_auth: bool,
    pub metrics_secret: Option<String>,

    pub upstream_base_url: String,
    pub upstream_email: String,
    pub upstream_password: String,
    pub upstream_persist: Option<PathBuf>,
    pub upstream_refresh_interval_secs: u64,

    pub heartbeat_quota: Quota,
    pub server_list_quota: Quota,
    pub server_remove_quota: Quota,
    pub player_auth_quota: Quota,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 80,
            tls_port: 443,
            tls_cert: None,
            tls_key: None,
            hosts: Vec::new(),
            trusted_proxies: Vec::new(),
            dev_map_ip: Vec::new(),
            verify_time_secs: 10,
            ghost_time_secs: 30,
            dead_time_secs: 120,
            sweep_interval_secs: 5,
            max_servers: 1000,
            max_servers_per_ip: 8,
            allow_gameserver_ipv6: false,
            token_expiry_secs: 86400,
            minimum_launcher_version: None,
            insecure_dev_no_check_player_auth: false,
            metrics_secret: None,
            upstream_base_url: String::new(),
            upstream_email: String::new(),
            upstream_password: String::new(),
            upstream_persist: None,
            upstream_refresh_interval_secs: 60,
            heartbeat_quota: quota(60, 100).expect("default heartbeat quota"),
            server_list_quota: quota(5, 120).expect("default server list quota"),
            server_remove_quota: quota(5, 10).expect("default server remove quota"),
            player_auth_quota: quota(10, 30).expect("default player auth quota"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("BIND_ADDRESS") {
            cfg.bind_address = v;
        }
        cfg.port = env_parse("PORT", cfg.port)?;
        cfg.tls_port = env_parse("TLS_PORT", cfg.tls_port)?;
        cfg.tls_cert = env_path("TLS_CERT");
        cfg.tls_key = env_path("TLS_KEY");
        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err("TLS_CERT and TLS_KEY must be set together".to_string());
        }

        if let Ok(v) = env::var("HOSTS") {
            cfg.hosts = v
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("TRUSTED_PROXIES") {
            cfg.trusted_proxies =
                parse_networks(&v).map_err(|e| format!("invalid TRUSTED_PROXIES: {}", e))?;
        }
        if let Ok(v) = env::var("DEV_MAP_IP") {
            cfg.dev_map_ip =
                parse_map_rules(&v).map_err(|e| format!("invalid DEV_MAP_IP: {}", e))?;
        }

        cfg.verify_time_secs = env_parse("VERIFY_TIME_SECS", cfg.verify_time_secs)?;
        cfg.ghost_time_secs = env_parse("GHOST_TIME_SECS", cfg.ghost_time_secs)?;
        cfg.dead_time_secs = env_parse("DEAD_TIME_SECS", cfg.dead_time_secs)?;
        cfg.sweep_interval_secs = env_parse("SWEEP_INTERVAL_SECS", cfg.sweep_interval_secs)?;
        if cfg.sweep_interval_secs == 0 {
            return Err("SWEEP_INTERVAL_SECS must be nonzero".to_string());
        }
        if cfg.ghost_time_secs >= cfg.dead_time_secs {
            return Err("GHOST_TIME_SECS must be less than DEAD_TIME_SECS".to_string());
        }
        cfg.max_servers = env_parse("MAX_SERVERS", cfg.max_servers)?;
        cfg.max_servers_per_ip = env_parse("MAX_SERVERS_PER_IP", cfg.max_servers_per_ip)?;
        cfg.allow_gameserver_ipv6 = env_flag("ALLOW_GAMESERVER_IPV6");

        cfg.token_expiry_secs = env_parse("TOKEN_EXPIRY_SECS", cfg.token_expiry_secs)?;
        if let Ok(v) = env::var("MINIMUM_LAUNCHER_VERSION") {
            if !v.is_empty() {
                let parsed = semver::Version::parse(v.trim_start_matches('v'))
                    .map_err(|e| format!("invalid MINIMUM_LAUNCHER_VERSION {:?}: {}", v, e))?;
                cfg.minimum_launcher_version = Some(parsed);
            }
        }
        cfg.insecure_dev_no_check_player_auth = env_flag("INSECURE_DEV_NO_CHECK_PLAYER_AUTH");
        cfg.metrics_secret = env::var("METRICS_SECRET").ok().filter(|s| !s.is_empty());

        if let Ok(v) = env::var("UPSTREAM_BASE_URL") {
            cfg.upstream_base_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = env::var("UPSTREAM_EMAIL") {
            cfg.upstream_email = v;
        }
        if let Ok(v) = env::var("UPSTREAM_PASSWORD") {
            cfg.upstream_password = v;
        }
        if !cfg.upstream_email.is_empty() && cfg.upstream_base_url.is_empty() {
            return Err("UPSTREAM_BASE_URL is required when UPSTREAM_EMAIL is set".to_string());
        }
        cfg.upstream_persist = env_path("UPSTREAM_PERSIST");
        cfg.upstream_refresh_interval_secs = env_parse(
            "UPSTREAM_REFRESH_INTERVAL_SECS",
            cfg.upstream_refresh_interval_secs,
        )?;
        if cfg.upstream_refresh_interval_secs == 0 {
            return Err("UPSTREAM_REFRESH_INTERVAL_SECS must be nonzero".to_string());
        }

        cfg.heartbeat_quota = quota(
            env_parse("HEARTBEAT_PERIOD_SECS", 60)?,
            env_parse("HEARTBEAT_BURST_LIMIT", 100)?,
        )?;
        cfg.server_list_quota = quota(
            env_parse("SERVER_LIST_PERIOD_SECS", 5)?,
            env_parse("SERVER_LIST_BURST_LIMIT", 120)?,
        )?;
        cfg.server_remove_quota = quota(
            env_parse("SERVER_REMOVE_PERIOD_SECS", 5)?,
            env_parse("SERVER_REMOVE_BURST_LIMIT", 10)?,
        )?;
        cfg.player_auth_quota = quota(
            env_parse("PLAYER_AUTH_PERIOD_SECS", 10)?,
            env_parse("PLAYER_AUTH_BURST_LIMIT", 30)?,
        )?;

        Ok(cfg)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            verify_time: Duration::from_secs(self.verify_time_secs),
            ghost_time: Duration::from_secs(self.ghost_time_secs),
            dead_time: Duration::from_secs(self.dead_time_secs),
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_servers: self.max_servers,
            max_servers_per_ip: self.max_servers_per_ip,
        }
    }
}

fn quota(period_secs: u64, burst: u32) -> Result<Quota, String> {
    let period = Quota::with_period(Duration::from_secs(period_secs))
        .ok_or_else(|| "rate limit period must be nonzero".to_string())?;
    let burst = NonZeroU32::new(burst).ok_or_else(|| "rate limit burst must be nonzero".to_string())?;
    Ok(period.allow_burst(burst))
}

fn env_parse<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|e| format!("invalid {} {:?}: {}", name, v, e)),
        _ => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("1") | Ok("true"))
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

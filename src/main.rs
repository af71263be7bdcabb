// src/main.rs
use actix_web::{web, App, HttpServer};
use env_logger::Env;
use log::{error, info, warn};
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

use lodestar::config::Config;
use lodestar::handlers::{self, Limiters};
use lodestar::metrics::{self, ApiMetrics};
use lodestar::realip::RealIpRules;
use lodestar::registry::ServerList;
use lodestar::storage::memory::{MemoryAccountStore, MemoryPdataStore};
use lodestar::storage::Storages;
use lodestar::upstream::{self, AuthMgr, Backoff, StandardHooks, UpstreamAuth};
use lodestar::utils::sd_notify;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    dotenv::dotenv().ok();
    metrics::init_process_start();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return Err(config_error(e));
        }
    };
    if config.insecure_dev_no_check_player_auth {
        warn!(
            "INSECURE_DEV_NO_CHECK_PLAYER_AUTH is set: player identity checks are DISABLED; \
             never run this in production"
        );
    }

    let storages = Storages {
        accounts: Arc::new(MemoryAccountStore::new()),
        pdata: Arc::new(MemoryPdataStore::new()),
    };

    // TLS material is validated before anything binds.
    let tls = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => match load_tls(cert, key) {
            Ok(tls) => Some(tls),
            Err(e) => {
                error!("initialize tls: {}", e);
                storages.close();
                return Err(config_error(e));
            }
        },
        _ => None,
    };

    let registry = web::Data::new(ServerList::new(config.timings(), config.limits()));
    let rules = web::Data::new(RealIpRules::new(
        config.trusted_proxies.clone(),
        config.dev_map_ip.clone(),
    ));
    let api_metrics = web::Data::new(ApiMetrics::default());
    let limiters = web::Data::new(Limiters::from_config(&config));
    let storages_data = web::Data::new(storages.clone());

    let upstream_mgr: Option<Arc<AuthMgr>> = if config.upstream_email.is_empty() {
        info!("no upstream identity provider configured");
        None
    } else {
        let hooks = StandardHooks::new(
            config.upstream_email.clone(),
            config.upstream_password.clone(),
            Backoff::default(),
            config.upstream_persist.clone(),
        );
        let mgr = Arc::new(AuthMgr::new(config.upstream_base_url.clone(), Box::new(hooks)));
        if let Some(path) = &config.upstream_persist {
            if let Some(state) = upstream::load_state(path) {
                info!("restored upstream auth state");
                mgr.seed(state).await;
            }
        }
        Some(mgr)
    };
    let upstream_data = web::Data::new(UpstreamAuth(upstream_mgr.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Stale entries must disappear even with no incoming traffic.
    let sweep_task = {
        let registry = registry.clone().into_inner();
        let interval = Duration::from_secs(config.sweep_interval_secs);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => registry.sweep(SystemTime::now()),
                    _ = shutdown.changed() => return,
                }
            }
        })
    };
    let refresh_task = upstream_mgr.map(|mgr| {
        let interval = Duration::from_secs(config.upstream_refresh_interval_secs);
        tokio::spawn(mgr.run(interval, shutdown_rx.clone()))
    });

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        sd_notify("READY=1");
    });

    let bind = format!("{}:{}", config.bind_address, config.port);
    let tls_bind = format!("{}:{}", config.bind_address, config.tls_port);
    let cfg_data = web::Data::new(config);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(cfg_data.clone())
            .app_data(registry.clone())
            .app_data(rules.clone())
            .app_data(api_metrics.clone())
            .app_data(limiters.clone())
            .app_data(storages_data.clone())
            .app_data(upstream_data.clone())
            .configure(handlers::routes)
    });

    let server = match server.bind(&bind) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to bind {}: {}", bind, e);
            let _ = shutdown_tx.send(true);
            storages.close();
            return Err(e);
        }
    };
    let server = if let Some(tls_cfg) = tls {
        match server.bind_rustls_0_23(&tls_bind, tls_cfg) {
            Ok(server) => {
                info!("tls listener on {}", tls_bind);
                server
            }
            Err(e) => {
                error!("failed to bind tls {}: {}", tls_bind, e);
                let _ = shutdown_tx.send(true);
                storages.close();
                return Err(e);
            }
        }
    } else {
        server
    };

    info!("starting master server on {}", bind);
    let result = server.run().await;

    sd_notify("STOPPING=1");
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = sweep_task.await;
    if let Some(task) = refresh_task {
        let _ = task.await;
    }
    storages.close();
    info!("shutdown complete");
    result
}

fn config_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, String> {
    let cert_file =
        File::open(cert_path).map_err(|e| format!("open certificate {:?}: {}", cert_path, e))?;
    let certs = rustls_pemfile::certs(&mut io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("read certificate {:?}: {}", cert_path, e))?;
    if certs.is_empty() {
        return Err(format!("no certificates found in {:?}", cert_path));
    }

    let key_file = File::open(key_path).map_err(|e| format!("open key {:?}: {}", key_path, e))?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(key_file))
        .map_err(|e| format!("read key {:?}: {}", key_path, e))?
        .ok_or_else(|| format!("no private key found in {:?}", key_path))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("invalid certificate/key pair: {}", e))
}

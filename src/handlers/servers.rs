// src/handlers/servers.rs
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, error};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;

use super::{check_rate, request_ip, ApiError, ApiErrorKind, Limiters};
use crate::config::Config;
use crate::models::server::{Liveness, MetadataUpdate, Player, ServerMetadata};
use crate::realip::RealIpRules;
use crate::registry::{ListFilter, NewServer, ServerList};
use crate::utils::{challenge_addr, maybe_gzip};

const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct AddServerRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub port: u16,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub map_name: String,
    pub game_mode: String,
    pub max_players: i32,
    #[serde(default)]
    pub players: Vec<Player>,
}

pub async fn add_server(
    req: HttpRequest,
    registry: web::Data<ServerList>,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    body: web::Json<AddServerRequest>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.heartbeat, &ip, "add_server")?;

    let body = body.into_inner();
    validate_registration(&body)?;
    let addr = challenge_addr(ip, body.port, cfg.allow_gameserver_ipv6)?;

    let entry = registry.register(
        SystemTime::now(),
        NewServer {
            id: body.id,
            ip,
            port: body.port,
            metadata: ServerMetadata {
                name: body.name,
                description: body.description,
                map_name: body.map_name,
                game_mode: body.game_mode,
                max_players: body.max_players,
                players: body.players,
            },
        },
    )?;

    if entry.state != Liveness::Unverified {
        debug!("refreshed registration {} for {}", entry.id, addr);
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "id": entry.id,
        })));
    }

    // The registry lock is long released; only this request waits on the
    // probe.
    match verify_challenge(&addr).await {
        Some(nonce) => {
            registry.mark_verified(SystemTime::now(), &entry.id).map_err(|_| {
                ApiError::new(
                    ApiErrorKind::NoGameserverResponse,
                    "verification window elapsed",
                )
            })?;
            debug!("verified {} at {}", entry.id, addr);
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "success": true,
                "id": entry.id,
                "challenge": nonce,
            })))
        }
        None => {
            let _ = registry.mark_verification_failed(&entry.id);
            error!("connect challenge failed for {}", addr);
            Err(ApiError::new(
                ApiErrorKind::NoGameserverResponse,
                "no response to connect challenge",
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub id: String,
    #[serde(flatten)]
    pub update: MetadataUpdate,
}

pub async fn heartbeat(
    req: HttpRequest,
    registry: web::Data<ServerList>,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    body: web::Json<HeartbeatRequest>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.heartbeat, &ip, "heartbeat")?;

    let body = body.into_inner();
    validate_update(&body.update)?;
    registry.heartbeat(SystemTime::now(), &body.id, ip, body.update)?;
    debug!("heartbeat from {} for {}", ip, body.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveServerQuery {
    pub id: String,
}

pub async fn remove_server(
    req: HttpRequest,
    registry: web::Data<ServerList>,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    query: web::Query<RemoveServerQuery>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.remove, &ip, "remove_server")?;

    registry.remove(&query.id, ip)?;
    debug!("removed server {} for {}", query.id, ip);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
pub struct ServersQuery {
    pub map_name: Option<String>,
    pub game_mode: Option<String>,
    pub detail: Option<String>,
}

#[derive(Serialize)]
struct ServerView<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    map_name: &'a str,
    game_mode: &'a str,
    ip: IpAddr,
    port: u16,
    player_count: usize,
    max_players: i32,
    players: &'a [Player],
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<Liveness>,
}

pub async fn get_servers(
    req: HttpRequest,
    registry: web::Data<ServerList>,
    rules: web::Data<RealIpRules>,
    limiters: web::Data<Limiters>,
    cfg: web::Data<Config>,
    query: web::Query<ServersQuery>,
) -> Result<HttpResponse, ApiError> {
    let ip = request_ip(&req, &rules, &cfg)?;
    check_rate(&limiters.list, &ip, "server list")?;

    let with_liveness = query.detail.as_deref() == Some("liveness");
    let entries = registry.list(&ListFilter {
        map_name: query.map_name.clone(),
        game_mode: query.game_mode.clone(),
        include_unverified: false,
    });
    debug!("serving {} servers to {}", entries.len(), ip);

    let views: Vec<ServerView> = entries
        .iter()
        .map(|e| ServerView {
            id: &e.id,
            name: &e.metadata.name,
            description: &e.metadata.description,
            map_name: &e.metadata.map_name,
            game_mode: &e.metadata.game_mode,
            ip: e.ip,
            port: e.port,
            player_count: e.metadata.players.len(),
            max_players: e.metadata.max_players,
            players: &e.metadata.players,
            state: with_liveness.then_some(e.state),
        })
        .collect();
    let buf = serde_json::to_vec(&views)
        .map_err(|e| ApiError::new(ApiErrorKind::StorageError, e.to_string()))?;

    let (body, compressed) = maybe_gzip(&req, buf);
    let mut resp = HttpResponse::Ok();
    resp.content_type("application/json");
    if compressed {
        resp.insert_header(("Content-Encoding", "gzip"));
    }
    Ok(resp.body(body))
}

fn validate_registration(r: &AddServerRequest) -> Result<(), ApiError> {
    if let Some(id) = &r.id {
        if id.is_empty() || id.len() > 64 {
            return Err(ApiError::bad_request("id must be 1-64 chars"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ApiError::bad_request(
                "id may only contain letters, digits, '-' and '_'",
            ));
        }
    }
    if r.port <= 1024 {
        return Err(ApiError::bad_request("port must be higher than 1024"));
    }
    validate_name(&r.name)?;
    if r.description.len() > 256 {
        return Err(ApiError::bad_request("description too long (max 256 chars)"));
    }
    validate_word("map_name", &r.map_name)?;
    validate_word("game_mode", &r.game_mode)?;
    validate_max_players(r.max_players)?;
    validate_players(&r.players)
}

fn validate_update(u: &MetadataUpdate) -> Result<(), ApiError> {
    if let Some(name) = &u.name {
        validate_name(name)?;
    }
    if let Some(description) = &u.description {
        if description.len() > 256 {
            return Err(ApiError::bad_request("description too long (max 256 chars)"));
        }
    }
    if let Some(map_name) = &u.map_name {
        validate_word("map_name", map_name)?;
    }
    if let Some(game_mode) = &u.game_mode {
        validate_word("game_mode", game_mode)?;
    }
    if let Some(max_players) = u.max_players {
        validate_max_players(max_players)?;
    }
    if let Some(players) = &u.players {
        validate_players(players)?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("name must be at least 1 char"));
    }
    if name.len() > 64 {
        return Err(ApiError::bad_request("name too long (max 64 chars)"));
    }
    Ok(())
}

fn validate_word(label: &str, value: &str) -> Result<(), ApiError> {
    if value.is_empty()
        || value.len() > 32
        || !value.chars().all(|c| c.is_ascii_lowercase() || c == '_')
    {
        return Err(ApiError::bad_request(format!(
            "{} must be 1-32 chars, only a-z and underscore",
            label
        )));
    }
    Ok(())
}

fn validate_max_players(max_players: i32) -> Result<(), ApiError> {
    if !(1..=64).contains(&max_players) {
        return Err(ApiError::bad_request("max_players must be between 1 and 64"));
    }
    Ok(())
}

fn validate_players(players: &[Player]) -> Result<(), ApiError> {
    if players.len() > 64 {
        return Err(ApiError::bad_request("too many players"));
    }
    for p in players {
        if p.name.is_empty() {
            return Err(ApiError::bad_request("player name must be at least 1 char"));
        }
    }
    Ok(())
}

/// Sends the connect challenge to the claimed address and waits for the
/// echoed nonce. Returns the nonce on success.
async fn verify_challenge(server_addr: &SocketAddr) -> Option<String> {
    let nonce_bytes: [u8; 4] = rand::thread_rng().gen();
    let mut nonce = String::from("0x");
    for byte in nonce_bytes {
        let _ = write!(&mut nonce, "{:02X}", byte);
    }

    let mut challenge_packet: Vec<u8> = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x48];
    challenge_packet.extend_from_slice(b"connect");
    challenge_packet.extend_from_slice(nonce.as_bytes());
    challenge_packet.push(0x00);

    let bind_addr = if server_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("could not bind udp socket: {}", e);
            return None;
        }
    };

    if let Err(e) = socket.send_to(&challenge_packet, server_addr).await {
        error!("error sending challenge to {}: {}", server_addr, e);
        return None;
    }
    debug!("challenge sent to {} with nonce {}", server_addr, nonce);

    let mut buffer = [0u8; 1024];
    match tokio::time::timeout(CHALLENGE_TIMEOUT, socket.recv_from(&mut buffer)).await {
        Ok(Ok((len, _addr))) => {
            if len < 21
                || buffer[0] != 0xFF
                || buffer[1] != 0xFF
                || buffer[2] != 0xFF
                || buffer[3] != 0xFF
                || buffer[4] != 0x49
            {
                error!(
                    "invalid challenge response from {} with len {}",
                    server_addr, len
                );
                return None;
            }
            if &buffer[9..16] != b"connect" {
                error!("invalid connect string from {}", server_addr);
                return None;
            }
            let response_nonce = String::from_utf8_lossy(&buffer[16..26]);
            if response_nonce != nonce {
                error!(
                    "invalid nonce from {}, sent {}, received {}",
                    server_addr, nonce, response_nonce
                );
                return None;
            }
            debug!("valid challenge response from {}", server_addr);
            Some(nonce)
        }
        Ok(Err(e)) => {
            error!("failed to receive challenge response from {}: {}", server_addr, e);
            None
        }
        Err(_) => {
            debug!("timed out waiting for challenge response from {}", server_addr);
            None
        }
    }
}

// src/models/server.rs
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::SystemTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub gen: i32,
    pub lvl: i32,
    pub team: i32,
}

/// Display fields supplied by the game server and refreshed on every
/// heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub map_name: String,
    pub game_mode: String,
    pub max_players: i32,
    #[serde(default)]
    pub players: Vec<Player>,
}

/// Partial metadata refresh carried by `/server/update_values`. Absent
/// fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub map_name: Option<String>,
    pub game_mode: Option<String>,
    pub max_players: Option<i32>,
    pub players: Option<Vec<Player>>,
}

impl MetadataUpdate {
    pub fn apply(self, m: &mut ServerMetadata) {
        if let Some(name) = self.name {
            m.name = name;
        }
        if let Some(description) = self.description {
            m.description = description;
        }
        if let Some(map_name) = self.map_name {
            m.map_name = map_name;
        }
        if let Some(game_mode) = self.game_mode {
            m.game_mode = game_mode;
        }
        if let Some(max_players) = self.max_players {
            m.max_players = max_players;
        }
        if let Some(players) = self.players {
            m.players = players;
        }
    }
}

/// Liveness phase of a registered server.
///
/// `Unverified` entries have announced themselves but not yet passed the
/// connect challenge. `Ghost` entries missed their heartbeat deadline and
/// are flagged as unreliable until they heartbeat again or age out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Unverified,
    Verified,
    Ghost,
}

/// One tracked game server registration. Owned by the registry and mutated
/// only through registry operations.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub metadata: ServerMetadata,
    pub state: Liveness,
    pub registered_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub last_verified: Option<SystemTime>,
}

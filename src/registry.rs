// src/registry.rs
//! Authoritative list of announced game servers.
//!
//! Entries move through `Unverified -> Verified -> Ghost -> (removed)`,
//! driven by the connect challenge, heartbeats, and the periodic sweep.
//! Discovery reads vastly outnumber writes, so the map sits behind a
//! reader/writer lock and `list` hands out a cloned snapshot taken at a
//! single instant.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::models::server::{Liveness, MetadataUpdate, ServerEntry, ServerMetadata};

/// Timer parameters driving the liveness state machine.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// An `Unverified` entry must pass the challenge within this window.
    pub verify_time: Duration,
    /// A `Verified` entry missing heartbeats this long becomes `Ghost`.
    pub ghost_time: Duration,
    /// An entry missing heartbeats this long is removed outright.
    pub dead_time: Duration,
}

/// Capacity limits enforced at registration. Registrations beyond a limit
/// are rejected, never queued.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_servers: usize,
    pub max_servers_per_ip: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateId,
    CapacityExceeded,
    PerIpLimitExceeded,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId => write!(f, "a server with this id is already registered"),
            Self::CapacityExceeded => write!(f, "server list is full"),
            Self::PerIpLimitExceeded => write!(f, "too many servers registered from this address"),
        }
    }
}

/// The addressed entry does not exist (or is not owned by the caller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound;

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no such server")
    }
}

/// Fields supplied by a registering server. `id` is the server's chosen
/// identity; when absent the registry assigns one.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub id: Option<String>,
    pub ip: IpAddr,
    pub port: u16,
    pub metadata: ServerMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub map_name: Option<String>,
    pub game_mode: Option<String>,
    /// Unverified entries are hidden from discovery; sweeps and tests can
    /// ask for them.
    pub include_unverified: bool,
}

/// The state `entry` should be in at `now`, or `None` when it is due for
/// removal. Pure so the timer behavior is testable without real clocks.
pub fn next_liveness(
    state: Liveness,
    now: SystemTime,
    registered_at: SystemTime,
    last_heartbeat: SystemTime,
    t: &Timings,
) -> Option<Liveness> {
    match state {
        Liveness::Unverified => {
            let age = now.duration_since(registered_at).unwrap_or_default();
            if age >= t.verify_time {
                None
            } else {
                Some(Liveness::Unverified)
            }
        }
        Liveness::Verified | Liveness::Ghost => {
            let silence = now.duration_since(last_heartbeat).unwrap_or_default();
            if silence >= t.dead_time {
                None
            } else if silence >= t.ghost_time {
                Some(Liveness::Ghost)
            } else {
                Some(state)
            }
        }
    }
}

pub struct ServerList {
    timings: Timings,
    limits: Limits,
    servers: RwLock<HashMap<String, ServerEntry>>,
    registered_total: AtomicU64,
    reregistered_total: AtomicU64,
    replaced_total: AtomicU64,
    removed_total: AtomicU64,
    verify_failed_total: AtomicU64,
    expired_verify_total: AtomicU64,
    expired_dead_total: AtomicU64,
}

impl ServerList {
    pub fn new(timings: Timings, limits: Limits) -> Self {
        Self {
            timings,
            limits,
            servers: RwLock::new(HashMap::new()),
            registered_total: AtomicU64::new(0),
            reregistered_total: AtomicU64::new(0),
            replaced_total: AtomicU64::new(0),
            removed_total: AtomicU64::new(0),
            verify_failed_total: AtomicU64::new(0),
            expired_verify_total: AtomicU64::new(0),
            expired_dead_total: AtomicU64::new(0),
        }
    }

    /// Registers a server, returning the stored entry.
    ///
    /// Re-registration policy: a request carrying an id that already exists
    /// refreshes that entry in place when it comes from the same source IP
    /// (a heartbeat in effect), and is rejected with `DuplicateId`
    /// otherwise. A request from an `ip:port` we already track replaces the
    /// old entry, so a restarted game server reclaims its slot instead of
    /// tripping the per-IP limit.
    pub fn register(&self, now: SystemTime, new: NewServer) -> Result<ServerEntry, RegisterError> {
        let mut servers = self.servers.write();

        if let Some(id) = &new.id {
            if let Some(existing) = servers.get_mut(id) {
                if existing.ip != new.ip {
                    return Err(RegisterError::DuplicateId);
                }
                existing.port = new.port;
                existing.metadata = new.metadata;
                existing.last_heartbeat = now;
                if existing.state == Liveness::Ghost {
                    existing.state = Liveness::Verified;
                }
                self.reregistered_total.fetch_add(1, Ordering::Relaxed);
                return Ok(existing.clone());
            }
        }

        let previous = servers
            .iter()
            .find(|(_, e)| e.ip == new.ip && e.port == new.port)
            .map(|(id, _)| id.clone());
        if let Some(previous) = previous {
            servers.remove(&previous);
            self.replaced_total.fetch_add(1, Ordering::Relaxed);
        } else {
            if servers.len() >= self.limits.max_servers {
                return Err(RegisterError::CapacityExceeded);
            }
            let from_ip = servers.values().filter(|e| e.ip == new.ip).count();
            if from_ip >= self.limits.max_servers_per_ip {
                return Err(RegisterError::PerIpLimitExceeded);
            }
        }

        let entry = ServerEntry {
            id: new
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ip: new.ip,
            port: new.port,
            metadata: new.metadata,
            state: Liveness::Unverified,
            registered_at: now,
            last_heartbeat: now,
            last_verified: None,
        };
        servers.insert(entry.id.clone(), entry.clone());
        self.registered_total.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    /// Records a heartbeat from `ip`, refreshing metadata and promoting a
    /// `Ghost` entry back to `Verified`. An id owned by a different IP is
    /// reported as `NotFound` rather than leaking its existence.
    pub fn heartbeat(
        &self,
        now: SystemTime,
        id: &str,
        ip: IpAddr,
        update: MetadataUpdate,
    ) -> Result<(), NotFound> {
        let mut servers = self.servers.write();
        let entry = servers.get_mut(id).filter(|e| e.ip == ip).ok_or(NotFound)?;
        update.apply(&mut entry.metadata);
        entry.last_heartbeat = now;
        if entry.state == Liveness::Ghost {
            entry.state = Liveness::Verified;
        }
        Ok(())
    }

    /// Promotes an `Unverified` entry after a successful connect challenge.
    pub fn mark_verified(&self, now: SystemTime, id: &str) -> Result<(), NotFound> {
        let mut servers = self.servers.write();
        let entry = servers.get_mut(id).ok_or(NotFound)?;
        if entry.state == Liveness::Unverified {
            entry.state = Liveness::Verified;
        }
        entry.last_verified = Some(now);
        Ok(())
    }

    /// Drops an entry whose connect challenge failed.
    pub fn mark_verification_failed(&self, id: &str) -> Result<(), NotFound> {
        let mut servers = self.servers.write();
        servers.remove(id).ok_or(NotFound)?;
        self.verify_failed_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Explicit deregistration; only honored for the entry's own source IP.
    pub fn remove(&self, id: &str, ip: IpAddr) -> Result<(), NotFound> {
        let mut servers = self.servers.write();
        match servers.get(id) {
            Some(e) if e.ip == ip => {
                servers.remove(id);
                self.removed_total.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(NotFound),
        }
    }

    /// Snapshot of entries matching `filter`, taken at a single instant.
    pub fn list(&self, filter: &ListFilter) -> Vec<ServerEntry> {
        let servers = self.servers.read();
        let mut out: Vec<ServerEntry> = servers
            .values()
            .filter(|e| filter.include_unverified || e.state != Liveness::Unverified)
            .filter(|e| {
                filter
                    .map_name
                    .as_deref()
                    .map_or(true, |m| e.metadata.map_name == m)
            })
            .filter(|e| {
                filter
                    .game_mode
                    .as_deref()
                    .map_or(true, |g| e.metadata.game_mode == g)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn get(&self, id: &str) -> Option<ServerEntry> {
        self.servers.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Advances every entry's timers: `Unverified` timeout, `Verified` to
    /// `Ghost` demotion, and `Ghost`/dead removal. Runs on a fixed interval
    /// independent of request traffic.
    pub fn sweep(&self, now: SystemTime) {
        let mut servers = self.servers.write();
        let mut expired_verify = 0u64;
        let mut expired_dead = 0u64;
        servers.retain(|_, e| {
            match next_liveness(e.state, now, e.registered_at, e.last_heartbeat, &self.timings) {
                Some(next) => {
                    e.state = next;
                    true
                }
                None => {
                    if e.state == Liveness::Unverified {
                        expired_verify += 1;
                    } else {
                        expired_dead += 1;
                    }
                    false
                }
            }
        });
        if expired_verify > 0 {
            self.expired_verify_total
                .fetch_add(expired_verify, Ordering::Relaxed);
        }
        if expired_dead > 0 {
            self.expired_dead_total.fetch_add(expired_dead, Ordering::Relaxed);
        }
    }

    fn counts(&self) -> (usize, usize, usize) {
        let servers = self.servers.read();
        let mut unverified = 0;
        let mut verified = 0;
        let mut ghost = 0;
        for e in servers.values() {
            match e.state {
                Liveness::Unverified => unverified += 1,
                Liveness::Verified => verified += 1,
                Liveness::Ghost => ghost += 1,
            }
        }
        (unverified, verified, ghost)
    }

    /// Public registry metrics in Prometheus text format. Only entry
    /// counts and churn, never any per-server or account detail.
    pub fn write_prometheus(&self, w: &mut String) {
        let (unverified, verified, ghost) = self.counts();
        let _ = writeln!(w, "# TYPE lodestar_serverlist_servers gauge");
        let _ = writeln!(
            w,
            "lodestar_serverlist_servers{{state=\"unverified\"}} {}",
            unverified
        );
        let _ = writeln!(
            w,
            "lodestar_serverlist_servers{{state=\"verified\"}} {}",
            verified
        );
        let _ = writeln!(w, "lodestar_serverlist_servers{{state=\"ghost\"}} {}", ghost);
        let _ = writeln!(w, "# TYPE lodestar_serverlist_registered_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_registered_total {}",
            self.registered_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_serverlist_reregistered_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_reregistered_total {}",
            self.reregistered_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_serverlist_replaced_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_replaced_total {}",
            self.replaced_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_serverlist_removed_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_removed_total {}",
            self.removed_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_serverlist_verify_failed_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_verify_failed_total {}",
            self.verify_failed_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(w, "# TYPE lodestar_serverlist_expired_total counter");
        let _ = writeln!(
            w,
            "lodestar_serverlist_expired_total{{reason=\"verify_timeout\"}} {}",
            self.expired_verify_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            w,
            "lodestar_serverlist_expired_total{{reason=\"dead\"}} {}",
            self.expired_dead_total.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::Player;
    use std::net::Ipv4Addr;

    const VERIFY: Duration = Duration::from_secs(10);
    const GHOST: Duration = Duration::from_secs(30);
    const DEAD: Duration = Duration::from_secs(120);

    fn timings() -> Timings {
        Timings {
            verify_time: VERIFY,
            ghost_time: GHOST,
            dead_time: DEAD,
        }
    }

    fn list_with_limits(max_servers: usize, max_per_ip: usize) -> ServerList {
        ServerList::new(
            timings(),
            Limits {
                max_servers,
                max_servers_per_ip: max_per_ip,
            },
        )
    }

    fn registry() -> ServerList {
        list_with_limits(100, 8)
    }

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    fn new_server(id: Option<&str>, ip_last: u8, port: u16) -> NewServer {
        NewServer {
            id: id.map(str::to_string),
            ip: ip(ip_last),
            port,
            metadata: ServerMetadata {
                name: format!("server-{}", port),
                description: String::new(),
                map_name: "mp_forge".into(),
                game_mode: "ctf".into(),
                max_players: 16,
                players: Vec::new(),
            },
        }
    }

    #[test]
    fn lifecycle_scenario() {
        // Register at t=0, verify at t=1, ghost after GHOST of silence,
        // recover on heartbeat, then age out entirely.
        let reg = registry();
        let entry = reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        assert_eq!(entry.state, Liveness::Unverified);
        assert!(reg.list(&ListFilter::default()).is_empty());

        reg.mark_verified(t(1), "s1").unwrap();
        assert_eq!(reg.get("s1").unwrap().state, Liveness::Verified);

        let ghost_at = GHOST.as_secs() + 1;
        reg.sweep(t(ghost_at));
        assert_eq!(reg.get("s1").unwrap().state, Liveness::Ghost);
        // Still listed, flagged unreliable.
        assert_eq!(reg.list(&ListFilter::default()).len(), 1);

        reg.heartbeat(t(ghost_at + 1), "s1", ip(1), MetadataUpdate::default())
            .unwrap();
        assert_eq!(reg.get("s1").unwrap().state, Liveness::Verified);

        let dead_at = ghost_at + 1 + DEAD.as_secs() + 1;
        reg.sweep(t(dead_at));
        assert!(reg.get("s1").is_none());
        assert!(reg.list(&ListFilter::default()).is_empty());
    }

    #[test]
    fn unverified_entry_times_out_and_is_never_promoted_late() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        reg.sweep(t(VERIFY.as_secs()));
        assert!(reg.get("s1").is_none());
        assert_eq!(reg.mark_verified(t(VERIFY.as_secs() + 1), "s1"), Err(NotFound));
    }

    #[test]
    fn dead_removal_holds_even_when_sweeps_were_skipped() {
        // No intermediate sweep ever ran; a single late sweep still removes.
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        reg.mark_verified(t(1), "s1").unwrap();
        reg.sweep(t(DEAD.as_secs() + 5));
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn heartbeat_metadata_is_visible_in_next_list() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        reg.mark_verified(t(1), "s1").unwrap();
        reg.heartbeat(
            t(2),
            "s1",
            ip(1),
            MetadataUpdate {
                map_name: Some("mp_rise".into()),
                players: Some(vec![Player {
                    name: "jo".into(),
                    gen: 1,
                    lvl: 3,
                    team: 2,
                }]),
                ..Default::default()
            },
        )
        .unwrap();
        let listed = reg.list(&ListFilter::default());
        assert_eq!(listed[0].metadata.map_name, "mp_rise");
        assert_eq!(listed[0].metadata.players.len(), 1);
    }

    #[test]
    fn same_id_same_ip_refreshes_in_place() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        reg.mark_verified(t(1), "s1").unwrap();
        let mut again = new_server(Some("s1"), 1, 37015);
        again.metadata.map_name = "mp_rise".into();
        let refreshed = reg.register(t(5), again).unwrap();
        assert_eq!(refreshed.state, Liveness::Verified);
        assert_eq!(refreshed.metadata.map_name, "mp_rise");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn same_id_different_ip_is_rejected() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        let stolen = reg.register(t(1), new_server(Some("s1"), 2, 37015));
        assert_eq!(stolen.unwrap_err(), RegisterError::DuplicateId);
    }

    #[test]
    fn same_endpoint_replaces_previous_entry() {
        let reg = registry();
        reg.register(t(0), new_server(Some("old"), 1, 37015)).unwrap();
        reg.register(t(5), new_server(Some("new"), 1, 37015)).unwrap();
        assert!(reg.get("old").is_none());
        assert_eq!(reg.get("new").unwrap().state, Liveness::Unverified);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn capacity_limit_rejects_excess_registration() {
        let reg = list_with_limits(2, 8);
        reg.register(t(0), new_server(None, 1, 37015)).unwrap();
        reg.register(t(0), new_server(None, 2, 37015)).unwrap();
        let third = reg.register(t(0), new_server(None, 3, 37015));
        assert_eq!(third.unwrap_err(), RegisterError::CapacityExceeded);
    }

    #[test]
    fn per_ip_limit_rejects_even_with_global_capacity_left() {
        let reg = list_with_limits(100, 2);
        reg.register(t(0), new_server(None, 1, 37015)).unwrap();
        reg.register(t(0), new_server(None, 1, 37016)).unwrap();
        let third = reg.register(t(0), new_server(None, 1, 37017));
        assert_eq!(third.unwrap_err(), RegisterError::PerIpLimitExceeded);
        // A different source IP is still fine.
        assert!(reg.register(t(0), new_server(None, 2, 37015)).is_ok());
    }

    #[test]
    fn heartbeat_from_wrong_ip_is_not_found() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        let r = reg.heartbeat(t(1), "s1", ip(2), MetadataUpdate::default());
        assert_eq!(r, Err(NotFound));
        assert_eq!(
            reg.heartbeat(t(1), "nope", ip(1), MetadataUpdate::default()),
            Err(NotFound)
        );
    }

    #[test]
    fn remove_requires_owning_ip() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        assert_eq!(reg.remove("s1", ip(2)), Err(NotFound));
        assert_eq!(reg.remove("s1", ip(1)), Ok(()));
        assert!(reg.get("s1").is_none());
    }

    #[test]
    fn list_filters_by_map_and_mode() {
        let reg = registry();
        reg.register(t(0), new_server(Some("a"), 1, 37015)).unwrap();
        let mut other = new_server(Some("b"), 2, 37015);
        other.metadata.map_name = "mp_rise".into();
        reg.register(t(0), other).unwrap();
        reg.mark_verified(t(1), "a").unwrap();
        reg.mark_verified(t(1), "b").unwrap();

        let filter = ListFilter {
            map_name: Some("mp_rise".into()),
            ..Default::default()
        };
        let listed = reg.list(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "b");

        let filter = ListFilter {
            game_mode: Some("tdm".into()),
            ..Default::default()
        };
        assert!(reg.list(&filter).is_empty());
    }

    #[test]
    fn next_liveness_transitions() {
        let tm = timings();
        let reg_at = t(0);
        let hb = t(0);
        // Unverified holds until the verify window closes.
        assert_eq!(
            next_liveness(Liveness::Unverified, t(9), reg_at, hb, &tm),
            Some(Liveness::Unverified)
        );
        assert_eq!(next_liveness(Liveness::Unverified, t(10), reg_at, hb, &tm), None);
        // Verified demotes at ghost_time and dies at dead_time.
        assert_eq!(
            next_liveness(Liveness::Verified, t(29), reg_at, hb, &tm),
            Some(Liveness::Verified)
        );
        assert_eq!(
            next_liveness(Liveness::Verified, t(30), reg_at, hb, &tm),
            Some(Liveness::Ghost)
        );
        assert_eq!(next_liveness(Liveness::Verified, t(120), reg_at, hb, &tm), None);
        // Ghost survives until dead_time.
        assert_eq!(
            next_liveness(Liveness::Ghost, t(119), reg_at, hb, &tm),
            Some(Liveness::Ghost)
        );
        assert_eq!(next_liveness(Liveness::Ghost, t(120), reg_at, hb, &tm), None);
    }

    #[test]
    fn prometheus_output_has_state_gauges() {
        let reg = registry();
        reg.register(t(0), new_server(Some("s1"), 1, 37015)).unwrap();
        reg.mark_verified(t(1), "s1").unwrap();
        let mut out = String::new();
        reg.write_prometheus(&mut out);
        assert!(out.contains("lodestar_serverlist_servers{state=\"verified\"} 1"));
        assert!(out.contains("lodestar_serverlist_registered_total 1"));
    }
}

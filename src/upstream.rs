// src/upstream.rs
//! Session with the upstream identity provider.
//!
//! The master holds one long-lived session of its own and uses it to check
//! player-supplied tokens. Refreshes run on an exponential backoff curve so
//! a transient outage doesn't turn into a retry storm, and the whole
//! schedule is persisted so a restart resumes it mid-backoff.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

/// Refresh proactively when the session is within this margin of expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub enum UpstreamError {
    /// No live session and the backoff window forbids an attempt right now.
    Unavailable,
    Credentials(String),
    Http(reqwest::Error),
    /// The provider answered with a non-success status.
    Denied(u16),
    Malformed(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "no upstream session available"),
            Self::Credentials(msg) => write!(f, "credentials unavailable: {}", msg),
            Self::Http(e) => write!(f, "upstream request failed: {}", e),
            Self::Denied(status) => write!(f, "upstream rejected request with status {}", status),
            Self::Malformed(msg) => write!(f, "malformed upstream response: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

/// Session material issued by the provider. Opaque to the rest of the
/// master; persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
    pub expires: SystemTime,
}

/// Supervisor bookkeeping. Persisted on every update, success or failure,
/// so an in-progress backoff schedule survives restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthState {
    pub session: Option<Session>,
    pub last_attempt: Option<SystemTime>,
    pub failure_count: u32,
}

/// Retry curve: `pow(rate, count) * max / pow(rate, count_at_max)` hours,
/// capped at `max` once `count >= count_at_max`. With the defaults the
/// waits ramp roughly 5m, 10m, 23m, 52m, 2h, 4.6h, 10.5h, then 24h.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_hours: f64,
    pub count_at_max: u32,
    pub rate: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_hours: 24.0,
            count_at_max: 8,
            rate: 2.3,
        }
    }
}

impl Backoff {
    pub fn min_wait_hours(&self, count: u32) -> f64 {
        if count >= self.count_at_max {
            self.max_hours
        } else {
            self.rate.powi(count as i32) * self.max_hours / self.rate.powi(self.count_at_max as i32)
        }
    }

    pub fn should_retry(&self, since_last: Duration, count: u32) -> bool {
        since_last.as_secs_f64() / 3600.0 >= self.min_wait_hours(count)
    }
}

/// Policy hooks for the supervisor, split out so the retry protocol is
/// testable without real time or a real provider.
pub trait AuthHooks: Send + Sync + 'static {
    fn credentials(&self) -> Result<(String, String), UpstreamError>;
    fn should_retry(&self, since_last: Duration, count: u32) -> bool;
    /// Called after every state change, with the error when the attempt
    /// failed. Implementations persist the state here.
    fn on_updated(&self, state: &AuthState, err: Option<&UpstreamError>);
}

/// Production hooks: credentials from config, the standard backoff curve,
/// and JSON persistence of the auth state.
pub struct StandardHooks {
    email: String,
    password: String,
    backoff: Backoff,
    persist_path: Option<PathBuf>,
}

impl StandardHooks {
    pub fn new(
        email: String,
        password: String,
        backoff: Backoff,
        persist_path: Option<PathBuf>,
    ) -> Self {
        Self {
            email,
            password,
            backoff,
            persist_path,
        }
    }
}

impl AuthHooks for StandardHooks {
    fn credentials(&self) -> Result<(String, String), UpstreamError> {
        if self.email.is_empty() {
            return Err(UpstreamError::Credentials("no email configured".into()));
        }
        Ok((self.email.clone(), self.password.clone()))
    }

    fn should_retry(&self, since_last: Duration, count: u32) -> bool {
        self.backoff.should_retry(since_last, count)
    }

    fn on_updated(&self, state: &AuthState, err: Option<&UpstreamError>) {
        if let Some(path) = &self.persist_path {
            match serde_json::to_vec(state) {
                Ok(buf) => {
                    if let Err(e) = std::fs::write(path, buf) {
                        error!("failed to save upstream auth state: {}", e);
                    }
                }
                Err(e) => error!("failed to serialize upstream auth state: {}", e),
            }
        }
        if let Some(err) = err {
            error!("upstream auth error: {}", err);
        }
    }
}

/// Loads persisted auth state. Absence is normal on first start; anything
/// else is logged and treated as a cold start.
pub fn load_state(path: &Path) -> Option<AuthState> {
    match std::fs::read(path) {
        Ok(buf) => match serde_json::from_slice(&buf) {
            Ok(state) => Some(state),
            Err(e) => {
                error!("failed to parse upstream auth state: {}", e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            error!("failed to load upstream auth state: {}", e);
            None
        }
    }
}

pub struct AuthMgr {
    base_url: String,
    hooks: Box<dyn AuthHooks>,
    client: reqwest::Client,
    state: Mutex<AuthState>,
}

#[derive(Deserialize)]
struct LoginResponse {
    sid: String,
    expires_in_secs: u64,
}

#[derive(Deserialize)]
struct TokenInfo {
    uid: String,
}

impl AuthMgr {
    pub fn new(base_url: String, hooks: Box<dyn AuthHooks>) -> Self {
        Self {
            base_url,
            hooks,
            client: reqwest::Client::new(),
            state: Mutex::new(AuthState::default()),
        }
    }

    /// Seeds persisted state from a previous run. Call before `run`.
    pub async fn seed(&self, state: AuthState) {
        *self.state.lock().await = state;
    }

    /// Current session id, refreshing first when the session is missing or
    /// expired and the backoff window allows an attempt.
    pub async fn session(&self, now: SystemTime) -> Result<String, UpstreamError> {
        let mut state = self.state.lock().await;
        if let Some(s) = &state.session {
            if s.expires > now {
                return Ok(s.sid.clone());
            }
        }
        self.try_refresh(&mut state, now).await?;
        state
            .session
            .as_ref()
            .map(|s| s.sid.clone())
            .ok_or(UpstreamError::Unavailable)
    }

    /// Confirms with the provider that `player_token` belongs to `uid`.
    pub async fn verify_player(
        &self,
        now: SystemTime,
        uid: &str,
        player_token: &str,
    ) -> Result<bool, UpstreamError> {
        let sid = self.session(now).await?;
        let url = format!("{}/auth/tokeninfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("token", player_token)])
            .bearer_auth(sid)
            .send()
            .await?;
        match resp.status().as_u16() {
            401 => {
                // Our own session was rejected; drop it so the next tick
                // refreshes, and fail only this request.
                let mut state = self.state.lock().await;
                state.session = None;
                self.hooks.on_updated(&state, None);
                Err(UpstreamError::Unavailable)
            }
            404 => Ok(false),
            s if (200..300).contains(&s) => {
                let info: TokenInfo = resp
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
                Ok(info.uid == uid)
            }
            s => Err(UpstreamError::Denied(s)),
        }
    }

    /// Background refresh loop; runs until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let now = SystemTime::now();
                    let mut state = self.state.lock().await;
                    let due = match &state.session {
                        Some(s) => now + REFRESH_MARGIN >= s.expires,
                        None => true,
                    };
                    if due {
                        // Outcomes are logged and persisted by the hooks;
                        // the loop itself never gives up.
                        let _ = self.try_refresh(&mut state, now).await;
                    }
                }
                _ = shutdown.changed() => {
                    debug!("upstream refresh loop stopping");
                    return;
                }
            }
        }
    }

    async fn try_refresh(
        &self,
        state: &mut AuthState,
        now: SystemTime,
    ) -> Result<(), UpstreamError> {
        if let Some(last) = state.last_attempt {
            let since = now.duration_since(last).unwrap_or_default();
            if !self.hooks.should_retry(since, state.failure_count) {
                return Err(UpstreamError::Unavailable);
            }
        }
        state.last_attempt = Some(now);
        match self.login().await {
            Ok(session) => {
                info!("refreshed upstream session");
                state.session = Some(session);
                state.failure_count = 0;
                self.hooks.on_updated(state, None);
                Ok(())
            }
            Err(e) => {
                state.failure_count = state.failure_count.saturating_add(1);
                warn!(
                    "upstream refresh failed (consecutive failures: {}): {}",
                    state.failure_count, e
                );
                self.hooks.on_updated(state, Some(&e));
                Err(e)
            }
        }
    }

    async fn login(&self) -> Result<Session, UpstreamError> {
        let (email, password) = self.hooks.credentials()?;
        let url = format!("{}/auth/login", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::Denied(resp.status().as_u16()));
        }
        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Session {
            sid: body.sid,
            expires: SystemTime::now() + Duration::from_secs(body.expires_in_secs),
        })
    }
}

/// Handler-facing handle; `None` when no provider is configured.
#[derive(Clone)]
pub struct UpstreamAuth(pub Option<Arc<AuthMgr>>);

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn hours(h: f64) -> Duration {
        Duration::from_secs_f64(h * 3600.0)
    }

    #[test]
    fn backoff_wait_strictly_increases_then_caps() {
        let b = Backoff::default();
        for count in 0..b.count_at_max {
            assert!(
                b.min_wait_hours(count + 1) > b.min_wait_hours(count),
                "wait must grow at count {}",
                count
            );
        }
        assert_eq!(b.min_wait_hours(8), 24.0);
        assert_eq!(b.min_wait_hours(9), 24.0);
        assert_eq!(b.min_wait_hours(200), 24.0);
    }

    #[test]
    fn backoff_matches_reference_ramp() {
        let b = Backoff::default();
        // ~5m, ~10m, ~23m, ~52m, ~2h, ~4.6h, ~10.5h for counts 1..=7.
        let approx_minutes = [4.23, 9.73, 22.4, 51.5, 118.4, 272.2, 626.1];
        for (i, expect) in approx_minutes.iter().enumerate() {
            let got = b.min_wait_hours(i as u32 + 1) * 60.0;
            assert!(
                (got - expect).abs() / expect < 0.05,
                "count {}: got {} minutes",
                i + 1,
                got
            );
        }
    }

    #[test]
    fn should_retry_honors_the_window() {
        let b = Backoff::default();
        assert!(b.should_retry(hours(25.0), 8));
        assert!(!b.should_retry(hours(23.0), 8));
        assert!(b.should_retry(hours(b.min_wait_hours(3) * 1.01), 3));
        assert!(!b.should_retry(hours(b.min_wait_hours(3) * 0.9), 3));
    }

    #[test]
    fn auth_state_roundtrips_through_json() {
        let state = AuthState {
            session: Some(Session {
                sid: "sid-123".into(),
                expires: t(1_700_000_000),
            }),
            last_attempt: Some(t(1_699_999_000)),
            failure_count: 3,
        };
        let buf = serde_json::to_vec(&state).unwrap();
        let back: AuthState = serde_json::from_slice(&buf).unwrap();
        assert_eq!(back.failure_count, 3);
        assert_eq!(back.session.unwrap().sid, "sid-123");
        assert_eq!(back.last_attempt, Some(t(1_699_999_000)));
    }

    #[test]
    fn standard_hooks_persist_and_reload() {
        let path = std::env::temp_dir().join(format!("lodestar-auth-{}.json", uuid::Uuid::new_v4()));
        let hooks = StandardHooks::new(
            "ms@example.com".into(),
            "hunter2".into(),
            Backoff::default(),
            Some(path.clone()),
        );
        let state = AuthState {
            session: None,
            last_attempt: Some(t(42)),
            failure_count: 5,
        };
        hooks.on_updated(&state, None);
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.failure_count, 5);
        assert_eq!(loaded.last_attempt, Some(t(42)));
        std::fs::remove_file(&path).ok();
        assert!(load_state(&path).is_none());
    }

    #[tokio::test]
    async fn session_returns_live_session_without_io() {
        let mgr = AuthMgr::new(
            // Unroutable; nothing should ever connect in this test.
            "http://127.0.0.1:9".into(),
            Box::new(StandardHooks::new(
                "ms@example.com".into(),
                "hunter2".into(),
                Backoff::default(),
                None,
            )),
        );
        mgr.seed(AuthState {
            session: Some(Session {
                sid: "sid-live".into(),
                expires: SystemTime::now() + Duration::from_secs(600),
            }),
            last_attempt: None,
            failure_count: 0,
        })
        .await;
        let sid = mgr.session(SystemTime::now()).await.unwrap();
        assert_eq!(sid, "sid-live");
    }

    #[tokio::test]
    async fn session_respects_backoff_without_touching_network() {
        let mgr = AuthMgr::new(
            "http://127.0.0.1:9".into(),
            Box::new(StandardHooks::new(
                "ms@example.com".into(),
                "hunter2".into(),
                Backoff::default(),
                None,
            )),
        );
        let now = SystemTime::now();
        mgr.seed(AuthState {
            session: None,
            last_attempt: Some(now),
            failure_count: 4,
        })
        .await;
        match mgr.session(now + Duration::from_secs(60)).await {
            Err(UpstreamError::Unavailable) => {}
            other => panic!("expected Unavailable, got {:?}", other.map(|_| ())),
        }
        // The gated attempt must not count as a new one.
        assert_eq!(mgr.state.lock().await.failure_count, 4);
    }
}

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alert::AlertSink;
use crate::config::ConfigError;
use crate::model::SignalKind;
use crate::store::persist_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockPolicy {
    Manual,
    NextSession,
}

impl FromStr for UnlockPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(UnlockPolicy::Manual),
            "next_session" | "nextsession" => Ok(UnlockPolicy::NextSession),
            other => Err(ConfigError::Invalid(format!(
                "unknown unlock policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingLockState {
    pub locked: bool,
    pub reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub unlock_policy: UnlockPolicy,
    pub session_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,
}

impl TradingLockState {
    fn unlocked(policy: UnlockPolicy, now: DateTime<Utc>) -> Self {
        Self {
            locked: false,
            reason: None,
            locked_at: None,
            unlock_policy: policy,
            session_date: None,
            last_updated: now,
        }
    }
}

/// Trading session a timestamp belongs to. Sessions start daily at
/// `session_start` UTC.
pub fn session_date(now: DateTime<Utc>, session_start: NaiveTime) -> NaiveDate {
    let shifted = now - Duration::seconds(i64::from(session_start.num_seconds_from_midnight()));
    shifted.date_naive()
}

/// The persisted, process-wide gate that blocks new risk.
///
/// All transitions run under one mutex so check-and-set is atomic with
/// respect to concurrent risk evaluations. The in-memory state stays
/// authoritative when a save fails.
pub struct TradingLockManager {
    path: PathBuf,
    session_start: NaiveTime,
    default_policy: UnlockPolicy,
    state: Mutex<TradingLockState>,
    alerts: Arc<dyn AlertSink>,
}

impl TradingLockManager {
    pub fn load<P: AsRef<Path>>(
        path: P,
        default_policy: UnlockPolicy,
        session_start: NaiveTime,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let now = Utc::now();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<TradingLockState>(&raw) {
                Ok(state) => {
                    if state.locked {
                        log::warn!(
                            "[LOCK] restored active lock (reason={:?}, policy={:?})",
                            state.reason,
                            state.unlock_policy
                        );
                    }
                    state
                }
                Err(err) => {
                    log::warn!(
                        "[LOCK] corrupt lock file {}: {:?}; starting unlocked",
                        path.display(),
                        err
                    );
                    TradingLockState::unlocked(default_policy, now)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[LOCK] no lock file at {}, starting unlocked", path.display());
                TradingLockState::unlocked(default_policy, now)
            }
            Err(err) => {
                log::warn!(
                    "[LOCK] failed to read lock file {}: {:?}; starting unlocked",
                    path.display(),
                    err
                );
                TradingLockState::unlocked(default_policy, now)
            }
        };
        Self {
            path,
            session_start,
            default_policy,
            state: Mutex::new(state),
            alerts,
        }
    }

    fn guard(&self) -> MutexGuard<'_, TradingLockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TradingLockState {
        self.guard().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.guard().locked
    }

    /// Exits are never blocked; entries and scales are while locked.
    pub fn allows(&self, kind: SignalKind) -> bool {
        kind == SignalKind::Exit || !self.is_locked()
    }

    /// Locks trading with the default policy. Returns true when this call
    /// transitioned from unlocked to locked; re-locking refreshes the record.
    pub fn acquire_lock(&self, reason: &str, now: DateTime<Utc>) -> bool {
        self.acquire_lock_with_policy(reason, self.default_policy, now)
    }

    pub fn acquire_lock_with_policy(
        &self,
        reason: &str,
        policy: UnlockPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        let mut state = self.guard();
        let newly_locked = !state.locked;
        *state = TradingLockState {
            locked: true,
            reason: Some(reason.to_string()),
            locked_at: if newly_locked { Some(now) } else { state.locked_at },
            unlock_policy: policy,
            session_date: Some(session_date(now, self.session_start)),
            last_updated: now,
        };
        if newly_locked {
            log::warn!("[LOCK] trading locked: {} (policy={:?})", reason, policy);
        } else {
            log::debug!("[LOCK] lock refreshed: {}", reason);
        }
        self.persist(&state);
        newly_locked
    }

    /// Manual reset. Returns true if a lock was cleared.
    pub fn reset_lock(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.guard();
        if !state.locked {
            return false;
        }
        log::info!("[LOCK] manual reset (was: {:?})", state.reason);
        *state = TradingLockState::unlocked(state.unlock_policy, now);
        self.persist(&state);
        true
    }

    /// Clears a `NextSession` lock once a later session has started.
    pub fn check_session_boundary(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.guard();
        if !state.locked || state.unlock_policy != UnlockPolicy::NextSession {
            return false;
        }
        let current = session_date(now, self.session_start);
        match state.session_date {
            Some(locked_session) if current <= locked_session => false,
            _ => {
                log::info!(
                    "[LOCK] new session {} started, releasing lock ({:?})",
                    current,
                    state.reason
                );
                *state = TradingLockState::unlocked(state.unlock_policy, now);
                self.persist(&state);
                true
            }
        }
    }

    fn persist(&self, state: &TradingLockState) {
        persist_json(&self.path, state, "[LOCK]", self.alerts.as_ref());
    }
}

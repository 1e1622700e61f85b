use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::alert::{Alert, AlertSink};
use crate::lock::session_date;
use crate::model::{PositionRecord, SpreadEntryState};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub record: PositionRecord,
    pub state: SpreadEntryState,
}

/// Realized P&L of the current trading session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLedger {
    pub session_date: Option<NaiveDate>,
    pub realized_pnl: f64,
}

impl SessionLedger {
    /// Moves the ledger forward to `current`. Returns false when `current`
    /// is older than the tracked session; the ledger never moves back.
    fn roll(&mut self, current: NaiveDate) -> bool {
        match self.session_date {
            Some(tracked) if current < tracked => false,
            Some(tracked) if current == tracked => true,
            previous => {
                if previous.is_some() {
                    log::info!(
                        "[STORE] session rolled {:?} -> {} (realized {:.2} reset)",
                        previous,
                        current,
                        self.realized_pnl
                    );
                }
                self.session_date = Some(current);
                self.realized_pnl = 0.0;
                true
            }
        }
    }
}

/// An order sequence the execution worker started but has not confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightIntent {
    pub position_id: String,
    pub action: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    positions: BTreeMap<String, PositionEntry>,
    #[serde(default)]
    session: SessionLedger,
    #[serde(default)]
    in_flight: Vec<InFlightIntent>,
}

/// Serializes `value` next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let payload = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// [`write_json_atomic`] retried once; a second failure is logged under
/// `tag` and alerted. Returns whether the value reached disk.
pub fn persist_json<T: Serialize>(
    path: &Path,
    value: &T,
    tag: &str,
    alerts: &dyn AlertSink,
) -> bool {
    let first = match write_json_atomic(path, value) {
        Ok(()) => return true,
        Err(err) => err,
    };
    log::warn!(
        "{} save to {} failed ({:?}), retrying once",
        tag,
        path.display(),
        first
    );
    match write_json_atomic(path, value) {
        Ok(()) => true,
        Err(err) => {
            log::error!(
                "{} save to {} failed twice: {:?}; keeping state in memory",
                tag,
                path.display(),
                err
            );
            alerts.notify(&Alert::PersistenceFailure {
                detail: format!("{}: {}", path.display(), err),
            });
            false
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Durable map of open positions.
///
/// The map itself is only write-locked for insert and remove; every entry has
/// its own mutex so updates to different positions do not serialize on each
/// other. Memory is authoritative: a failed save is retried on the next
/// mutation.
pub struct PositionStore {
    path: PathBuf,
    positions: RwLock<HashMap<String, Arc<Mutex<PositionEntry>>>>,
    session: Mutex<SessionLedger>,
    in_flight: Mutex<BTreeMap<String, InFlightIntent>>,
    unresolved: Vec<InFlightIntent>,
    save_guard: Mutex<()>,
    alerts: Arc<dyn AlertSink>,
}

impl PositionStore {
    pub fn load<P: AsRef<Path>>(path: P, alerts: Arc<dyn AlertSink>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoreDocument>(&raw) {
                Ok(doc) => {
                    if doc.version != STORE_VERSION {
                        log::warn!(
                            "[STORE] state file version {} differs from {}, loading anyway",
                            doc.version,
                            STORE_VERSION
                        );
                    }
                    log::info!(
                        "[STORE] restored {} position(s) from {}",
                        doc.positions.len(),
                        path.display()
                    );
                    doc
                }
                Err(err) => {
                    log::warn!(
                        "[STORE] corrupt state file {}: {:?}; starting empty",
                        path.display(),
                        err
                    );
                    StoreDocument::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::info!("[STORE] no state file at {}, starting empty", path.display());
                StoreDocument::default()
            }
            Err(err) => {
                log::warn!(
                    "[STORE] failed to read state file {}: {:?}; starting empty",
                    path.display(),
                    err
                );
                StoreDocument::default()
            }
        };

        for intent in &doc.in_flight {
            log::warn!(
                "[STORE] unresolved {} intent for {} from {}",
                intent.action,
                intent.position_id,
                intent.started_at
            );
            alerts.notify(&Alert::UnresolvedIntent {
                position_id: intent.position_id.clone(),
                detail: format!("{} started at {}", intent.action, intent.started_at),
            });
        }

        let positions = doc
            .positions
            .into_iter()
            .map(|(id, entry)| (id, Arc::new(Mutex::new(entry))))
            .collect();
        let in_flight = doc
            .in_flight
            .iter()
            .map(|intent| (intent.position_id.clone(), intent.clone()))
            .collect();

        Self {
            path,
            positions: RwLock::new(positions),
            session: Mutex::new(doc.session),
            in_flight: Mutex::new(in_flight),
            unresolved: doc.in_flight,
            save_guard: Mutex::new(()),
            alerts,
        }
    }

    /// Intents that were journaled but never cleared by the previous run.
    pub fn unresolved_intents(&self) -> &[InFlightIntent] {
        &self.unresolved
    }

    pub fn insert(&self, entry: PositionEntry) {
        let id = entry.record.position_id.clone();
        {
            let mut map = self.positions.write().unwrap_or_else(|e| e.into_inner());
            map.insert(id.clone(), Arc::new(Mutex::new(entry)));
        }
        log::info!("[STORE] position {} recorded", id);
        self.save();
    }

    pub fn contains(&self, position_id: &str) -> bool {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(position_id)
    }

    fn entry(&self, position_id: &str) -> Option<Arc<Mutex<PositionEntry>>> {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(position_id)
            .cloned()
    }

    pub fn get(&self, position_id: &str) -> Option<PositionEntry> {
        self.entry(position_id).map(|entry| relock(&entry).clone())
    }

    /// Mutates one position under its own lock and persists the result.
    pub fn update<R>(
        &self,
        position_id: &str,
        f: impl FnOnce(&mut PositionEntry) -> R,
    ) -> Option<R> {
        let entry = self.entry(position_id)?;
        let out = {
            let mut guard = relock(&entry);
            f(&mut guard)
        };
        self.save();
        Some(out)
    }

    pub fn remove(&self, position_id: &str) -> Option<PositionEntry> {
        let removed = {
            let mut map = self.positions.write().unwrap_or_else(|e| e.into_inner());
            map.remove(position_id)
        }?;
        log::info!("[STORE] position {} removed", position_id);
        self.save();
        let entry = relock(&removed).clone();
        Some(entry)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent per-entry copies, ordered by position id.
    pub fn snapshot(&self) -> Vec<PositionEntry> {
        let entries: Vec<Arc<Mutex<PositionEntry>>> = {
            let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut out: Vec<PositionEntry> = entries.iter().map(|e| relock(e).clone()).collect();
        out.sort_by(|a, b| a.record.position_id.cmp(&b.record.position_id));
        out
    }

    /// Books a realized result into the session `now` belongs to. Results
    /// from a session older than the tracked one leave the ledger alone.
    pub fn record_realized(&self, pnl: f64, now: DateTime<Utc>, session_start: NaiveTime) {
        {
            let mut ledger = relock(&self.session);
            let session = session_date(now, session_start);
            if !ledger.roll(session) {
                log::warn!(
                    "[STORE] realized {:+.2} belongs to past session {}, tracking {:?}; not booked",
                    pnl,
                    session,
                    ledger.session_date
                );
                return;
            }
            ledger.realized_pnl += pnl;
            log::info!(
                "[STORE] realized {:+.2}, session total {:+.2}",
                pnl,
                ledger.realized_pnl
            );
        }
        self.save();
    }

    /// Realized P&L of the session `now` belongs to; zero for sessions older
    /// than the tracked one.
    pub fn session_realized(&self, now: DateTime<Utc>, session_start: NaiveTime) -> f64 {
        let mut ledger = relock(&self.session);
        if ledger.roll(session_date(now, session_start)) {
            ledger.realized_pnl
        } else {
            0.0
        }
    }

    pub fn journal_intent(&self, intent: InFlightIntent) {
        relock(&self.in_flight).insert(intent.position_id.clone(), intent);
        self.save();
    }

    pub fn clear_intent(&self, position_id: &str) {
        let removed = relock(&self.in_flight).remove(position_id).is_some();
        if removed {
            self.save();
        }
    }

    pub fn journaled_intents(&self) -> Vec<InFlightIntent> {
        relock(&self.in_flight).values().cloned().collect()
    }

    /// Writes the whole document; retried once, then alerted.
    pub fn save(&self) -> bool {
        let _guard = relock(&self.save_guard);
        let doc = StoreDocument {
            version: STORE_VERSION,
            positions: self
                .snapshot()
                .into_iter()
                .map(|entry| (entry.record.position_id.clone(), entry))
                .collect(),
            session: relock(&self.session).clone(),
            in_flight: self.journaled_intents(),
        };
        persist_json(&self.path, &doc, "[STORE]", self.alerts.as_ref())
    }
}

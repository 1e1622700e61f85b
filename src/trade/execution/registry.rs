use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::trade::execution::gateway::VenuePosition;
use crate::trade::execution::intent::IntentKind;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Position ids with an intent queued or executing. Registration is the
/// check-and-set that keeps a second intent out of the queue.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    slots: Mutex<HashMap<String, IntentKind>>,
}

impl InFlightRegistry {
    pub fn try_register(&self, position_id: &str, kind: IntentKind) -> Result<(), IntentKind> {
        let mut slots = relock(&self.slots);
        if let Some(existing) = slots.get(position_id) {
            return Err(*existing);
        }
        slots.insert(position_id.to_string(), kind);
        Ok(())
    }

    pub fn release(&self, position_id: &str) {
        relock(&self.slots).remove(position_id);
    }

    pub fn get(&self, position_id: &str) -> Option<IntentKind> {
        relock(&self.slots).get(position_id).copied()
    }

    pub fn contains(&self, position_id: &str) -> bool {
        relock(&self.slots).contains_key(position_id)
    }

    pub fn has_kind(&self, kind: IntentKind) -> bool {
        relock(&self.slots).values().any(|k| *k == kind)
    }

    pub fn len(&self) -> usize {
        relock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A local/venue mismatch awaiting an explicit decision.
#[derive(Debug, Clone, PartialEq)]
pub struct DesyncRecord {
    pub position_id: String,
    pub detail: String,
    pub venue: Option<VenuePosition>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct DesyncRegistry {
    records: Mutex<BTreeMap<String, DesyncRecord>>,
}

impl DesyncRegistry {
    /// Returns true when the position was not flagged before.
    pub fn flag(&self, record: DesyncRecord) -> bool {
        let mut records = relock(&self.records);
        let fresh = !records.contains_key(&record.position_id);
        records.insert(record.position_id.clone(), record);
        fresh
    }

    pub fn contains(&self, position_id: &str) -> bool {
        relock(&self.records).contains_key(position_id)
    }

    pub fn take(&self, position_id: &str) -> Option<DesyncRecord> {
        relock(&self.records).remove(position_id)
    }

    pub fn records(&self) -> Vec<DesyncRecord> {
        relock(&self.records).values().cloned().collect()
    }
}

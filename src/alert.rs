use std::fmt;

/// Operator-facing conditions that need attention beyond the regular log.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    RateLimited { context: String, detail: String },
    TradingLocked { reason: String },
    Desync { position_id: String, detail: String },
    CloseFailed { position_id: String, detail: String },
    UnresolvedIntent { position_id: String, detail: String },
    PersistenceFailure { detail: String },
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Alert::RateLimited { context, detail } => {
                write!(f, "rate limited while {} ({})", context, detail)
            }
            Alert::TradingLocked { reason } => write!(f, "trading locked: {}", reason),
            Alert::Desync {
                position_id,
                detail,
            } => write!(f, "position {} out of sync with venue: {}", position_id, detail),
            Alert::CloseFailed {
                position_id,
                detail,
            } => write!(f, "failed to close {}: {}", position_id, detail),
            Alert::UnresolvedIntent {
                position_id,
                detail,
            } => write!(f, "unresolved intent for {}: {}", position_id, detail),
            Alert::PersistenceFailure { detail } => write!(f, "state not persisted: {}", detail),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &Alert) {
        match alert {
            Alert::RateLimited { .. } | Alert::TradingLocked { .. } => {
                log::warn!("[ALERT] {}", alert)
            }
            _ => log::error!("[ALERT] {}", alert),
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: std::sync::Mutex<Vec<Alert>>,
}

#[cfg(test)]
impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl AlertSink for MemoryAlertSink {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.clone());
    }
}

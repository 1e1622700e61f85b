use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

use crate::model::{ExitReason, Side};
use crate::rebalance::{HedgeAdjustment, LegVolumes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Open,
    Scale,
    Close,
    AdjustHedge,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Open => "open",
            IntentKind::Scale => "scale",
            IntentKind::Close => "close",
            IntentKind::AdjustHedge => "adjust_hedge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntentAction {
    Open {
        side: Side,
        z_score: f64,
        volumes: LegVolumes,
        hedge_ratio: f64,
    },
    Scale {
        z_score: f64,
        volumes: LegVolumes,
    },
    Close {
        reason: ExitReason,
    },
    AdjustHedge(HedgeAdjustment),
}

impl IntentAction {
    pub fn kind(&self) -> IntentKind {
        match self {
            IntentAction::Open { .. } => IntentKind::Open,
            IntentAction::Scale { .. } => IntentKind::Scale,
            IntentAction::Close { .. } => IntentKind::Close,
            IntentAction::AdjustHedge(_) => IntentKind::AdjustHedge,
        }
    }
}

/// Unit of work handed from the evaluator to the execution worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionIntent {
    pub position_id: String,
    pub primary_symbol: String,
    pub secondary_symbol: String,
    pub action: IntentAction,
    pub reference_prices: Option<(Decimal, Decimal)>,
    pub created_at: DateTime<Utc>,
}

/// Why the evaluator refused to enqueue an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentRejection {
    InFlight(IntentKind),
    UnknownPosition,
    Suspended,
    QueueFull,
    WorkerGone,
}

impl fmt::Display for IntentRejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IntentRejection::InFlight(kind) => {
                write!(f, "{} intent already in flight", kind.as_str())
            }
            IntentRejection::UnknownPosition => write!(f, "unknown position"),
            IntentRejection::Suspended => write!(f, "position suspended pending desync resolution"),
            IntentRejection::QueueFull => write!(f, "execution queue full"),
            IntentRejection::WorkerGone => write!(f, "execution worker stopped"),
        }
    }
}

impl std::error::Error for IntentRejection {}

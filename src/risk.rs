use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::model::AccountInfo;

pub const REASON_SETUP: &str = "setup_loss_limit";
pub const REASON_PORTFOLIO: &str = "portfolio_loss_limit";
pub const REASON_DAILY: &str = "daily_loss_limit";

/// One layer's measurement: the loss observed (positive number), the limit it
/// is compared against in account currency, and whether the limit was hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStatus {
    pub loss: f64,
    pub limit: f64,
    pub limit_pct: f64,
    pub enabled: bool,
    pub breached: bool,
}

impl LayerStatus {
    fn measure(pnl: f64, limit_pct: f64, base: f64) -> Self {
        let loss = (-pnl).max(0.0);
        let enabled = limit_pct > 0.0 && base > 0.0;
        let limit = if enabled { base * limit_pct / 100.0 } else { 0.0 };
        Self {
            loss,
            limit,
            limit_pct,
            enabled,
            breached: enabled && loss > 0.0 && loss >= limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupRisk {
    pub position_id: String,
    pub unrealized_pnl: f64,
    pub status: LayerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub evaluated_at: DateTime<Utc>,
    pub equity: f64,
    pub balance: f64,
    pub setups: Vec<SetupRisk>,
    pub total_unrealized_pnl: f64,
    pub portfolio: LayerStatus,
    pub session_realized_pnl: f64,
    pub daily: LayerStatus,
    pub locked: bool,
}

impl RiskSnapshot {
    pub fn any_breach(&self) -> bool {
        self.portfolio.breached || self.daily.breached || self.setups.iter().any(|s| s.status.breached)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskAction {
    ForceClose { position_id: String, reason: &'static str },
    ForceCloseAll { reason: &'static str },
    Lock { reason: &'static str },
}

#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub snapshot: RiskSnapshot,
    pub actions: Vec<RiskAction>,
}

/// Three independent loss layers evaluated together every cycle.
#[derive(Debug, Clone)]
pub struct RiskManager {
    cfg: RiskConfig,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    /// `positions` pairs each open position id with its unrealized P&L.
    /// Every layer is measured even when an earlier one already breached.
    pub fn evaluate(
        &self,
        positions: &[(String, f64)],
        account: AccountInfo,
        session_realized_pnl: f64,
        locked: bool,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let mut actions = Vec::new();

        let setups: Vec<SetupRisk> = positions
            .iter()
            .map(|(id, pnl)| SetupRisk {
                position_id: id.clone(),
                unrealized_pnl: *pnl,
                status: LayerStatus::measure(*pnl, self.cfg.max_loss_per_setup_pct, account.equity),
            })
            .collect();
        for setup in setups.iter().filter(|s| s.status.breached) {
            log::warn!(
                "[RISK] {} unrealized {:.2} reached per-setup limit {:.2} ({}% of equity)",
                setup.position_id,
                setup.unrealized_pnl,
                setup.status.limit,
                self.cfg.max_loss_per_setup_pct
            );
            actions.push(RiskAction::ForceClose {
                position_id: setup.position_id.clone(),
                reason: REASON_SETUP,
            });
        }

        let total_unrealized_pnl: f64 = positions.iter().map(|(_, pnl)| pnl).sum();
        let portfolio = LayerStatus::measure(
            total_unrealized_pnl,
            self.cfg.max_total_unrealized_loss_pct,
            account.equity,
        );
        if portfolio.breached {
            log::warn!(
                "[RISK] aggregate unrealized {:.2} reached portfolio limit {:.2}",
                total_unrealized_pnl,
                portfolio.limit
            );
            actions.push(RiskAction::ForceCloseAll {
                reason: REASON_PORTFOLIO,
            });
            actions.push(RiskAction::Lock {
                reason: REASON_PORTFOLIO,
            });
        }

        let daily = LayerStatus::measure(
            session_realized_pnl + total_unrealized_pnl,
            self.cfg.daily_loss_limit_pct,
            account.balance,
        );
        if daily.breached {
            log::warn!(
                "[RISK] session P&L {:.2} (realized {:.2}) reached daily limit {:.2}",
                session_realized_pnl + total_unrealized_pnl,
                session_realized_pnl,
                daily.limit
            );
            actions.push(RiskAction::Lock {
                reason: REASON_DAILY,
            });
        }

        RiskAssessment {
            snapshot: RiskSnapshot {
                evaluated_at: now,
                equity: account.equity,
                balance: account.balance,
                setups,
                total_unrealized_pnl,
                portfolio,
                session_realized_pnl,
                daily,
                locked,
            },
            actions,
        }
    }
}

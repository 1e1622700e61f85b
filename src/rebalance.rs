use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::config::RebalanceConfig;
use crate::model::{Leg, OrderSide, PositionRecord, Side, SpreadEntryState};

/// Equality tolerance when comparing z against the next trigger level.
const TRIGGER_EPSILON: f64 = 1e-9;

/// Upper bound of the hedge check interval, one week.
pub const MAX_HEDGE_CHECK_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq)]
pub struct LegVolumes {
    pub primary: Decimal,
    pub secondary: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HedgeAdjustment {
    pub position_id: String,
    pub order_side: OrderSide,
    pub volume: Decimal,
    pub target_secondary_lots: Decimal,
    pub target_ratio: f64,
}

/// Two-scalar pyramiding plus hedge-drift correction.
///
/// A position only remembers the z of its latest fill (`last_z_entry`) and
/// the level that arms the next add (`next_z_entry`). Hedge corrections touch
/// the secondary leg only and never move those two values.
#[derive(Debug)]
pub struct RebalanceStateMachine {
    cfg: RebalanceConfig,
    last_hedge_check: HashMap<String, DateTime<Utc>>,
}

impl RebalanceStateMachine {
    pub fn new(cfg: RebalanceConfig) -> Self {
        Self {
            cfg,
            last_hedge_check: HashMap::new(),
        }
    }

    pub fn next_trigger(&self, side: Side, z: f64) -> f64 {
        z + side.z_sign() * self.cfg.scale_interval
    }

    pub fn open_state(
        &self,
        position_id: &str,
        side: Side,
        z: f64,
        filled: &LegVolumes,
        now: DateTime<Utc>,
    ) -> SpreadEntryState {
        SpreadEntryState {
            position_id: position_id.to_string(),
            side,
            last_z_entry: z,
            next_z_entry: self.next_trigger(side, z),
            entry_count: 1,
            total_primary_lots: filled.primary,
            total_secondary_lots: filled.secondary,
            last_updated: now,
        }
    }

    /// True when z has reached `next_z_entry` moving away from zero and is
    /// strictly beyond the latest fill.
    pub fn scale_due(&self, state: &SpreadEntryState, z: f64) -> bool {
        let sign = state.side.z_sign();
        if sign * z < sign * state.next_z_entry - TRIGGER_EPSILON {
            return false;
        }
        if sign * z <= sign * state.last_z_entry {
            return false;
        }
        if self.cfg.max_entries > 0 && state.entry_count >= self.cfg.max_entries {
            log::debug!(
                "[REBALANCE] {} at max entries ({}), not scaling",
                state.position_id,
                state.entry_count
            );
            return false;
        }
        if let Some(ceiling) = self.cfg.max_scale_z {
            if sign * z > ceiling {
                log::debug!(
                    "[REBALANCE] {} z={:.3} beyond scale ceiling {:.3}",
                    state.position_id,
                    z,
                    ceiling
                );
                return false;
            }
        }
        true
    }

    /// Advances the bookkeeping after a confirmed scale fill.
    pub fn apply_scale(
        &self,
        state: &mut SpreadEntryState,
        z: f64,
        filled: &LegVolumes,
        now: DateTime<Utc>,
    ) {
        state.last_z_entry = z;
        state.next_z_entry = self.next_trigger(state.side, z);
        state.entry_count += 1;
        state.total_primary_lots += filled.primary;
        state.total_secondary_lots += filled.secondary;
        state.last_updated = now;
        log::info!(
            "[REBALANCE] {} scaled: entries={} last_z={:.3} next_z={:.3}",
            state.position_id,
            state.entry_count,
            state.last_z_entry,
            state.next_z_entry
        );
    }

    pub fn entry_volumes(&self, hedge_ratio: f64) -> Option<LegVolumes> {
        self.leg_volumes(self.cfg.base_volume, hedge_ratio)
    }

    pub fn scale_volumes(&self, hedge_ratio: f64) -> Option<LegVolumes> {
        self.leg_volumes(self.cfg.base_volume * self.cfg.scale_fraction, hedge_ratio)
    }

    fn leg_volumes(&self, primary: Decimal, hedge_ratio: f64) -> Option<LegVolumes> {
        let ratio = Decimal::from_f64(hedge_ratio).filter(|r| *r > Decimal::ZERO)?;
        let primary = self.quantize(primary);
        let secondary = self.quantize(primary * ratio);
        Some(LegVolumes { primary, secondary })
    }

    fn quantize(&self, size: Decimal) -> Decimal {
        quantize_size_by_step(size, self.cfg.lot_step, Some(self.cfg.min_lot))
    }

    /// Secondary-leg correction when the live hedge ratio drifted away from
    /// the one the position was built with. Rate limited per position.
    pub fn hedge_adjustment(
        &mut self,
        record: &PositionRecord,
        current_ratio: f64,
        now: DateTime<Utc>,
    ) -> Option<HedgeAdjustment> {
        let secs = self.cfg.hedge_check_interval_secs.min(MAX_HEDGE_CHECK_SECS);
        let interval = Duration::seconds(secs as i64);
        if let Some(last) = self.last_hedge_check.get(&record.position_id) {
            if now - *last < interval {
                return None;
            }
        }
        self.last_hedge_check
            .insert(record.position_id.clone(), now);

        if record.hedge_ratio <= 0.0 || !current_ratio.is_finite() || current_ratio <= 0.0 {
            return None;
        }
        let drift = (current_ratio - record.hedge_ratio).abs() / record.hedge_ratio;
        if drift <= self.cfg.hedge_drift_threshold {
            return None;
        }
        let ratio = Decimal::from_f64(current_ratio)?;
        let target = quantize_size_by_step(
            record.primary_lots * ratio,
            self.cfg.lot_step,
            Some(self.cfg.min_lot),
        );
        let delta = target - record.secondary_lots;
        if delta.abs() < self.cfg.min_adjust_lots || delta.is_zero() {
            log::debug!(
                "[REBALANCE] {} drift {:.4} but adjustment {} below minimum",
                record.position_id,
                drift,
                delta
            );
            return None;
        }
        let grow = record.side.order_side(Leg::Secondary);
        let order_side = if delta > Decimal::ZERO {
            grow
        } else {
            grow.opposite()
        };
        log::info!(
            "[REBALANCE] {} hedge drift {:.2}% (ratio {:.4} -> {:.4}), secondary {} -> {}",
            record.position_id,
            drift * 100.0,
            record.hedge_ratio,
            current_ratio,
            record.secondary_lots,
            target
        );
        Some(HedgeAdjustment {
            position_id: record.position_id.clone(),
            order_side,
            volume: delta.abs(),
            target_secondary_lots: target,
            target_ratio: current_ratio,
        })
    }

    /// Re-arms the hedge check of a position whose adjustment never reached
    /// the worker, so the next sample is checked again.
    pub fn forget_hedge_check(&mut self, position_id: &str) {
        self.last_hedge_check.remove(position_id);
    }

    /// Drops hedge-check bookkeeping of positions that no longer exist.
    pub fn retain_positions(&mut self, live: &[String]) {
        self.last_hedge_check.retain(|id, _| live.contains(id));
    }
}

/// Truncates `size` to a multiple of `step`, never below one step or the
/// minimum order.
pub fn quantize_size_by_step(size: Decimal, step: Decimal, min_order: Option<Decimal>) -> Decimal {
    if step <= Decimal::ZERO {
        return size;
    }
    let mut multiples = (size / step).trunc();
    if let Some(mo) = min_order {
        if mo > Decimal::ZERO {
            let min_multiplier = (mo / step).ceil();
            if min_multiplier > multiples {
                multiples = min_multiplier;
            }
        }
    }
    let multiplier = if multiples >= Decimal::ONE {
        multiples
    } else {
        Decimal::ONE
    };
    (multiplier * step).normalize()
}

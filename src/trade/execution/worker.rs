use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::alert::Alert;
use crate::model::{blend_price, ExitReason, Leg, OrderResult, OrderSide, PositionRecord, Side};
use crate::pairtrade::EngineContext;
use crate::rebalance::{HedgeAdjustment, LegVolumes, RebalanceStateMachine};
use crate::store::{InFlightIntent, PositionEntry};
use crate::trade::execution::gateway::{ExecutionGateway, GatewayError, VenuePosition};
use crate::trade::execution::intent::{ExecutionIntent, IntentAction};
use crate::trade::execution::registry::DesyncRecord;

#[derive(Debug, Default)]
struct LegClose {
    closed: Decimal,
    fills: Vec<(Decimal, Option<Decimal>)>,
}

enum WorkerEvent {
    Intent(Option<ExecutionIntent>),
    Poll,
    Shutdown,
}

/// The only component that talks to the venue. Intents are executed one at a
/// time in queue order; the in-flight slot of a position is released only
/// after its store mutation is done.
pub struct ExecutionWorker {
    ctx: EngineContext,
    gateway: Arc<dyn ExecutionGateway>,
    rx: mpsc::Receiver<ExecutionIntent>,
    rebalance: RebalanceStateMachine,
}

impl ExecutionWorker {
    pub fn new(
        ctx: EngineContext,
        gateway: Arc<dyn ExecutionGateway>,
        rx: mpsc::Receiver<ExecutionIntent>,
    ) -> Self {
        let rebalance = RebalanceStateMachine::new(ctx.config.rebalance.clone());
        Self {
            ctx,
            gateway,
            rx,
            rebalance,
        }
    }

    /// Executes everything currently queued and returns how many intents ran.
    pub async fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(intent) = self.rx.try_recv() {
            self.execute(intent).await;
            processed += 1;
        }
        processed
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let exec_cfg = self.ctx.config.execution.clone();
        self.refresh_account().await;
        let mut recovered = self.recover_unresolved().await;

        let mut poll =
            tokio::time::interval(Duration::from_secs(exec_cfg.reconcile_interval_secs.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let drain = Duration::from_secs(exec_cfg.shutdown_drain_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                intent = self.rx.recv() => WorkerEvent::Intent(intent),
                _ = poll.tick() => WorkerEvent::Poll,
                _ = shutdown.changed() => WorkerEvent::Shutdown,
            };
            match event {
                WorkerEvent::Intent(Some(intent)) => {
                    if !self.execute_draining(intent, &mut shutdown, drain).await {
                        break;
                    }
                }
                WorkerEvent::Intent(None) => {
                    log::info!("[EXEC] intent channel closed");
                    break;
                }
                WorkerEvent::Poll => {
                    self.refresh_account().await;
                    if !recovered {
                        recovered = self.recover_unresolved().await;
                    } else if let Err(err) = self.reconcile().await {
                        log::warn!("[RECONCILE] failed to fetch venue positions: {}", err);
                    }
                }
                WorkerEvent::Shutdown => break,
            }
        }

        while let Ok(intent) = self.rx.try_recv() {
            log::warn!(
                "[EXEC] dropping queued {} intent for {} on shutdown",
                intent.action.kind().as_str(),
                intent.position_id
            );
            self.ctx.in_flight.release(&intent.position_id);
        }
        log::info!("[EXEC] worker stopped");
    }

    /// Runs one intent; if shutdown arrives meanwhile the intent gets a
    /// bounded grace period. Returns false when the worker should stop.
    async fn execute_draining(
        &self,
        intent: ExecutionIntent,
        shutdown: &mut watch::Receiver<bool>,
        drain: Duration,
    ) -> bool {
        let position_id = intent.position_id.clone();
        let kind = intent.action.kind();
        let fut = self.execute(intent);
        tokio::pin!(fut);
        tokio::select! {
            _ = &mut fut => true,
            _ = shutdown.changed() => {
                log::info!(
                    "[EXEC] shutdown requested while {} for {} in flight, draining",
                    kind.as_str(),
                    position_id
                );
                if tokio::time::timeout(drain, &mut fut).await.is_err() {
                    log::error!(
                        "[EXEC] {} for {} unresolved after {:?}; left journaled",
                        kind.as_str(),
                        position_id,
                        drain
                    );
                    self.ctx.alerts.notify(&Alert::UnresolvedIntent {
                        position_id,
                        detail: format!("{} timed out during shutdown", kind.as_str()),
                    });
                }
                false
            }
        }
    }

    pub async fn execute(&self, intent: ExecutionIntent) {
        let position_id = intent.position_id.clone();
        let kind = intent.action.kind();
        log::debug!("[EXEC] {} {} start", kind.as_str(), position_id);
        self.ctx.store.journal_intent(InFlightIntent {
            position_id: position_id.clone(),
            action: kind.as_str().to_string(),
            started_at: Utc::now(),
        });

        match &intent.action {
            IntentAction::Open {
                side,
                z_score,
                volumes,
                hedge_ratio,
            } => {
                self.open(&intent, *side, *z_score, volumes, *hedge_ratio)
                    .await
            }
            IntentAction::Scale { z_score, volumes } => {
                self.scale(&intent, *z_score, volumes).await
            }
            IntentAction::Close { reason } => self.close(&intent, *reason).await,
            IntentAction::AdjustHedge(adjustment) => {
                self.adjust_hedge(&intent, adjustment).await
            }
        }

        self.ctx.store.clear_intent(&position_id);
        self.ctx.in_flight.release(&position_id);
    }

    fn symbol<'a>(intent: &'a ExecutionIntent, leg: Leg) -> &'a str {
        match leg {
            Leg::Primary => &intent.primary_symbol,
            Leg::Secondary => &intent.secondary_symbol,
        }
    }

    fn reference_price(intent: &ExecutionIntent, leg: Leg) -> Option<Decimal> {
        intent.reference_prices.map(|(a, b)| match leg {
            Leg::Primary => a,
            Leg::Secondary => b,
        })
    }

    async fn place(
        &self,
        intent: &ExecutionIntent,
        leg: Leg,
        side: OrderSide,
        volume: Decimal,
    ) -> OrderResult {
        let symbol = Self::symbol(intent, leg);
        match self
            .gateway
            .place_order(&intent.position_id, symbol, leg, side, volume)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                log::warn!(
                    "[EXEC] {} {} {:?} {} failed: {}",
                    intent.position_id,
                    symbol,
                    side,
                    volume,
                    err
                );
                OrderResult::rejected(err.to_string())
            }
        }
    }

    /// Places both legs of an add. On any shortfall whatever did fill is
    /// unwound and `None` is returned.
    async fn place_pair(
        &self,
        intent: &ExecutionIntent,
        side: Side,
        volumes: &LegVolumes,
    ) -> Option<(OrderResult, OrderResult)> {
        let primary = self
            .place(intent, Leg::Primary, side.order_side(Leg::Primary), volumes.primary)
            .await;
        if !primary.fully_filled(volumes.primary) {
            log::warn!(
                "[EXEC] {} primary leg short: wanted {}, filled {} ({:?})",
                intent.position_id,
                volumes.primary,
                primary.filled_volume,
                primary.error
            );
            self.unwind(intent, side, Leg::Primary, primary.filled_volume)
                .await;
            return None;
        }
        let secondary = self
            .place(
                intent,
                Leg::Secondary,
                side.order_side(Leg::Secondary),
                volumes.secondary,
            )
            .await;
        if !secondary.fully_filled(volumes.secondary) {
            log::warn!(
                "[EXEC] {} secondary leg short: wanted {}, filled {} ({:?}); unwinding",
                intent.position_id,
                volumes.secondary,
                secondary.filled_volume,
                secondary.error
            );
            self.unwind(intent, side, Leg::Primary, primary.filled_volume)
                .await;
            self.unwind(intent, side, Leg::Secondary, secondary.filled_volume)
                .await;
            return None;
        }
        Some((primary, secondary))
    }

    async fn unwind(&self, intent: &ExecutionIntent, side: Side, leg: Leg, filled: Decimal) {
        if filled <= Decimal::ZERO {
            return;
        }
        let outcome = self
            .close_leg(intent, leg, side.order_side(leg).opposite(), filled)
            .await;
        let left = filled - outcome.closed;
        if left > self.ctx.config.execution.volume_tolerance {
            log::error!(
                "[EXEC] {} could not unwind {} {} lots",
                intent.position_id,
                left,
                leg
            );
            self.ctx.alerts.notify(&Alert::CloseFailed {
                position_id: intent.position_id.clone(),
                detail: format!("unhedged {} leg of {} lots left at venue", leg, left),
            });
        } else {
            log::info!("[EXEC] {} unwound {} {} lots", intent.position_id, filled, leg);
        }
    }

    /// Closes `volume` of one leg with exponential backoff between attempts.
    async fn close_leg(
        &self,
        intent: &ExecutionIntent,
        leg: Leg,
        side: OrderSide,
        volume: Decimal,
    ) -> LegClose {
        let exec_cfg = &self.ctx.config.execution;
        let mut outcome = LegClose::default();
        for attempt in 1..=exec_cfg.close_max_attempts {
            let remaining = volume - outcome.closed;
            if remaining <= Decimal::ZERO {
                break;
            }
            let result = self.place(intent, leg, side, remaining).await;
            if result.filled_volume > Decimal::ZERO {
                let filled = result.filled_volume.min(remaining);
                outcome.closed += filled;
                outcome.fills.push((filled, result.fill_price));
            }
            if outcome.closed >= volume {
                break;
            }
            if attempt < exec_cfg.close_max_attempts {
                let backoff = exec_cfg.close_backoff_ms.saturating_mul(1 << (attempt - 1).min(10));
                log::warn!(
                    "[EXEC] {} {} close attempt {}/{} left {}; retrying in {}ms",
                    intent.position_id,
                    leg,
                    attempt,
                    exec_cfg.close_max_attempts,
                    volume - outcome.closed,
                    backoff
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
        }
        outcome
    }

    async fn open(
        &self,
        intent: &ExecutionIntent,
        side: Side,
        z_score: f64,
        volumes: &LegVolumes,
        hedge_ratio: f64,
    ) {
        let Some((primary, secondary)) = self.place_pair(intent, side, volumes).await else {
            log::warn!("[EXEC] open {} abandoned; state unchanged", intent.position_id);
            return;
        };
        let filled = LegVolumes {
            primary: primary.filled_volume,
            secondary: secondary.filled_volume,
        };
        let record = PositionRecord {
            position_id: intent.position_id.clone(),
            primary_symbol: intent.primary_symbol.clone(),
            secondary_symbol: intent.secondary_symbol.clone(),
            side,
            primary_lots: filled.primary,
            secondary_lots: filled.secondary,
            primary_entry_price: primary
                .fill_price
                .or_else(|| Self::reference_price(intent, Leg::Primary)),
            secondary_entry_price: secondary
                .fill_price
                .or_else(|| Self::reference_price(intent, Leg::Secondary)),
            hedge_ratio,
            opened_at: intent.created_at,
        };
        let state =
            self.rebalance
                .open_state(&intent.position_id, side, z_score, &filled, intent.created_at);
        log::info!(
            "[EXEC] opened {} {} primary={} secondary={} z={:.3} next_z={:.3}",
            intent.position_id,
            side,
            filled.primary,
            filled.secondary,
            z_score,
            state.next_z_entry
        );
        self.ctx.store.insert(PositionEntry { record, state });
    }

    async fn scale(&self, intent: &ExecutionIntent, z_score: f64, volumes: &LegVolumes) {
        let Some(entry) = self.ctx.store.get(&intent.position_id) else {
            log::warn!("[EXEC] scale for unknown position {}", intent.position_id);
            return;
        };
        let side = entry.record.side;
        let Some((primary, secondary)) = self.place_pair(intent, side, volumes).await else {
            log::warn!("[EXEC] scale {} abandoned; state unchanged", intent.position_id);
            return;
        };
        let filled = LegVolumes {
            primary: primary.filled_volume,
            secondary: secondary.filled_volume,
        };
        let price_a = primary
            .fill_price
            .or_else(|| Self::reference_price(intent, Leg::Primary));
        let price_b = secondary
            .fill_price
            .or_else(|| Self::reference_price(intent, Leg::Secondary));
        let rebalance = &self.rebalance;
        let updated = self.ctx.store.update(&intent.position_id, |entry| {
            let record = &mut entry.record;
            record.primary_entry_price = blend_price(
                record.primary_entry_price,
                record.primary_lots,
                price_a,
                filled.primary,
            );
            record.secondary_entry_price = blend_price(
                record.secondary_entry_price,
                record.secondary_lots,
                price_b,
                filled.secondary,
            );
            record.primary_lots += filled.primary;
            record.secondary_lots += filled.secondary;
            rebalance.apply_scale(&mut entry.state, z_score, &filled, intent.created_at);
        });
        if updated.is_none() {
            log::error!(
                "[EXEC] {} vanished while scaling; unwinding the add",
                intent.position_id
            );
            self.unwind(intent, side, Leg::Primary, filled.primary).await;
            self.unwind(intent, side, Leg::Secondary, filled.secondary)
                .await;
        }
    }

    async fn close(&self, intent: &ExecutionIntent, reason: ExitReason) {
        let Some(entry) = self.ctx.store.get(&intent.position_id) else {
            log::warn!("[EXEC] close for unknown position {}", intent.position_id);
            return;
        };
        let record = entry.record;
        let tolerance = self.ctx.config.execution.volume_tolerance;
        let mut realized = Decimal::ZERO;
        let mut remaining = [Decimal::ZERO; 2];

        for (slot, leg) in [Leg::Primary, Leg::Secondary].into_iter().enumerate() {
            let lots = record.lots(leg);
            if lots <= Decimal::ZERO {
                continue;
            }
            let close_side = record.side.order_side(leg).opposite();
            let outcome = self.close_leg(intent, leg, close_side, lots).await;
            for (lots, price) in &outcome.fills {
                let price = price.or_else(|| Self::reference_price(intent, leg));
                if let Some(pnl) = price.and_then(|p| record.leg_pnl(leg, p, *lots)) {
                    realized += pnl;
                }
            }
            let left = lots - outcome.closed;
            remaining[slot] = if left > tolerance { left } else { Decimal::ZERO };
        }

        let realized_f64 = realized.to_f64().unwrap_or(0.0);
        let session_start = self.ctx.config.risk.session_start;
        if !realized.is_zero() {
            self.ctx
                .store
                .record_realized(realized_f64, intent.created_at, session_start);
        }

        if remaining.iter().all(|r| r.is_zero()) {
            self.ctx.store.remove(&intent.position_id);
            log::info!(
                "[EXEC] closed {} ({}) realized {:+.2}",
                intent.position_id,
                reason.as_str(),
                realized_f64
            );
            return;
        }

        let [primary_left, secondary_left] = remaining;
        self.ctx.store.update(&intent.position_id, |entry| {
            entry.record.primary_lots = primary_left;
            entry.record.secondary_lots = secondary_left;
            entry.state.total_primary_lots = primary_left;
            entry.state.total_secondary_lots = secondary_left;
        });
        log::error!(
            "[EXEC] close of {} incomplete: {} / {} lots remain",
            intent.position_id,
            primary_left,
            secondary_left
        );
        self.ctx.alerts.notify(&Alert::CloseFailed {
            position_id: intent.position_id.clone(),
            detail: format!(
                "{} exit left primary={} secondary={}",
                reason.as_str(),
                primary_left,
                secondary_left
            ),
        });
    }

    async fn adjust_hedge(&self, intent: &ExecutionIntent, adjustment: &HedgeAdjustment) {
        let Some(entry) = self.ctx.store.get(&intent.position_id) else {
            log::warn!("[EXEC] hedge adjust for unknown position {}", intent.position_id);
            return;
        };
        let result = self
            .place(intent, Leg::Secondary, adjustment.order_side, adjustment.volume)
            .await;
        let filled = result.filled_volume.min(adjustment.volume);
        if filled <= Decimal::ZERO {
            log::warn!(
                "[EXEC] hedge adjust {} not filled ({:?}); will re-check later",
                intent.position_id,
                result.error
            );
            return;
        }
        let grows = adjustment.order_side == entry.record.side.order_side(Leg::Secondary);
        let complete = filled >= adjustment.volume;
        let price = result
            .fill_price
            .or_else(|| Self::reference_price(intent, Leg::Secondary));
        self.ctx.store.update(&intent.position_id, |entry| {
            let record = &mut entry.record;
            if grows {
                record.secondary_entry_price = blend_price(
                    record.secondary_entry_price,
                    record.secondary_lots,
                    price,
                    filled,
                );
                record.secondary_lots += filled;
            } else {
                record.secondary_lots = (record.secondary_lots - filled).max(Decimal::ZERO);
            }
            if complete {
                record.hedge_ratio = adjustment.target_ratio;
            }
            entry.state.total_secondary_lots = record.secondary_lots;
            entry.state.last_updated = intent.created_at;
        });
        log::info!(
            "[EXEC] hedge of {} adjusted by {} ({:?}), complete={}",
            intent.position_id,
            filled,
            adjustment.order_side,
            complete
        );
    }

    pub async fn refresh_account(&self) {
        match self.gateway.get_account_info().await {
            Ok(info) => self.ctx.account.update(info),
            Err(err) => log::warn!("[EXEC] account refresh failed: {}", err),
        }
    }

    /// Compares local positions with the venue. Mismatches are flagged and
    /// suspended, never corrected here. Returns newly flagged ids, or the
    /// gateway error when the venue could not be read.
    pub async fn reconcile(&self) -> Result<Vec<String>, GatewayError> {
        let venue = self.gateway.get_open_positions().await?;
        let tolerance = self.ctx.config.execution.volume_tolerance;
        let local = self.ctx.store.snapshot();
        let mut flagged = Vec::new();

        for entry in &local {
            let record = &entry.record;
            let found = venue
                .iter()
                .find(|v| v.position_id == record.position_id);
            let detail = match found {
                None => Some("position missing at venue".to_string()),
                Some(v)
                    if (v.primary_lots - record.primary_lots).abs() > tolerance
                        || (v.secondary_lots - record.secondary_lots).abs() > tolerance =>
                {
                    Some(format!(
                        "local {}/{} lots vs venue {}/{}",
                        record.primary_lots,
                        record.secondary_lots,
                        v.primary_lots,
                        v.secondary_lots
                    ))
                }
                Some(_) => None,
            };
            if let Some(detail) = detail {
                if self.flag_desync(&record.position_id, detail, found.cloned()) {
                    flagged.push(record.position_id.clone());
                }
            }
        }

        for v in &venue {
            if local.iter().all(|e| e.record.position_id != v.position_id) {
                let detail = format!(
                    "venue holds {}/{} lots with no local record",
                    v.primary_lots, v.secondary_lots
                );
                if self.flag_desync(&v.position_id, detail, Some(v.clone())) {
                    flagged.push(v.position_id.clone());
                }
            }
        }
        if flagged.is_empty() {
            log::debug!("[RECONCILE] {} position(s) in sync", local.len());
        }
        Ok(flagged)
    }

    fn flag_desync(&self, position_id: &str, detail: String, venue: Option<VenuePosition>) -> bool {
        let fresh = self.ctx.desync.flag(DesyncRecord {
            position_id: position_id.to_string(),
            detail: detail.clone(),
            venue,
            detected_at: Utc::now(),
        });
        if fresh {
            log::error!("[RECONCILE] {} desynced: {}; suspended", position_id, detail);
            self.ctx.alerts.notify(&Alert::Desync {
                position_id: position_id.to_string(),
                detail,
            });
        }
        fresh
    }

    /// Checks the intents the previous run left journaled against the venue.
    /// Journal entries are cleared only once the venue has answered, and a
    /// position flagged during that check keeps its entry until the desync is
    /// resolved. Returns false when the venue could not be read.
    pub async fn recover_unresolved(&self) -> bool {
        let journaled = self.ctx.store.journaled_intents();
        let pending: Vec<InFlightIntent> = self
            .ctx
            .store
            .unresolved_intents()
            .iter()
            .filter(|i| journaled.iter().any(|j| j.position_id == i.position_id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return true;
        }
        log::warn!(
            "[RECONCILE] {} unresolved intent(s) from previous run, checking venue",
            pending.len()
        );
        if let Err(err) = self.reconcile().await {
            log::warn!(
                "[RECONCILE] venue unavailable ({}); keeping {} intent(s) journaled",
                err,
                pending.len()
            );
            return false;
        }
        for intent in pending {
            if self.ctx.desync.contains(&intent.position_id) {
                log::warn!(
                    "[RECONCILE] {} for {} stays journaled until its desync is resolved",
                    intent.action,
                    intent.position_id
                );
                continue;
            }
            log::info!(
                "[RECONCILE] {} for {} matches the venue, clearing journal entry",
                intent.action,
                intent.position_id
            );
            self.ctx.store.clear_intent(&intent.position_id);
        }
        true
    }
}

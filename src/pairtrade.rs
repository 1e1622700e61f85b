use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::alert::{Alert, AlertSink};
use crate::config::EngineConfig;
use crate::lock::{TradingLockManager, TradingLockState};
use crate::model::{AccountInfo, ExitReason, PositionOverview, Signal, SignalKind};
use crate::rebalance::RebalanceStateMachine;
use crate::risk::{RiskAction, RiskAssessment, RiskManager, RiskSnapshot};
use crate::signal::SignalGenerator;
use crate::spread::{SpreadCalculator, SpreadSample};
use crate::store::{PositionEntry, PositionStore};
use crate::trade::execution::gateway::ExecutionGateway;
use crate::trade::execution::intent::{
    ExecutionIntent, IntentAction, IntentKind, IntentRejection,
};
use crate::trade::execution::registry::{DesyncRecord, DesyncRegistry, InFlightRegistry};
use crate::trade::execution::worker::ExecutionWorker;

/// Latest account figures published by the execution side.
#[derive(Debug)]
pub struct AccountView {
    fallback: f64,
    latest: RwLock<Option<AccountInfo>>,
}

impl AccountView {
    pub fn new(fallback: f64) -> Self {
        Self {
            fallback,
            latest: RwLock::new(None),
        }
    }

    pub fn update(&self, info: AccountInfo) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
    }

    /// Last polled figures, or the configured fallback before the first poll.
    pub fn get(&self) -> AccountInfo {
        let latest = *self.latest.read().unwrap_or_else(|e| e.into_inner());
        latest.unwrap_or(AccountInfo {
            balance: self.fallback,
            equity: self.fallback,
            margin: 0.0,
        })
    }
}

/// Everything the evaluator and the execution worker share.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub lock: Arc<TradingLockManager>,
    pub store: Arc<PositionStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub in_flight: Arc<InFlightRegistry>,
    pub desync: Arc<DesyncRegistry>,
    pub account: Arc<AccountView>,
}

impl EngineContext {
    /// Loads the persisted lock and position store. Missing or unreadable
    /// files are logged and replaced by empty state.
    pub fn bootstrap(config: EngineConfig, alerts: Arc<dyn AlertSink>) -> Self {
        let lock = TradingLockManager::load(
            &config.storage.lock_file,
            config.risk.unlock_policy,
            config.risk.session_start,
            alerts.clone(),
        );
        let store = PositionStore::load(&config.storage.state_file, alerts.clone());
        let account = AccountView::new(config.risk.equity_fallback);
        Self {
            config: Arc::new(config),
            lock: Arc::new(lock),
            store: Arc::new(store),
            alerts,
            in_flight: Arc::new(InFlightRegistry::default()),
            desync: Arc::new(DesyncRegistry::default()),
            account: Arc::new(account),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local record takes the venue's volumes, or is dropped if the venue
    /// holds nothing.
    AdoptVenue,
    /// Local record is trusted as is.
    KeepLocal,
}

struct EvaluatorState {
    spread: SpreadCalculator,
    rebalance: RebalanceStateMachine,
    last_prices: Option<(Decimal, Decimal)>,
    // feed time of the latest evaluation
    last_seen: Option<DateTime<Utc>>,
}

/// Evaluation side of the engine. Never performs venue I/O: every decision
/// becomes an intent on the bounded queue drained by [`ExecutionWorker`].
pub struct PairTradeEngine {
    ctx: EngineContext,
    signals: SignalGenerator,
    risk: RiskManager,
    state: Mutex<EvaluatorState>,
    risk_snapshot: Mutex<Option<RiskSnapshot>>,
    intents: mpsc::Sender<ExecutionIntent>,
}

/// Wires an engine and its execution worker around one bounded queue.
pub fn build(
    ctx: EngineContext,
    gateway: Arc<dyn ExecutionGateway>,
) -> (PairTradeEngine, ExecutionWorker) {
    let (tx, rx) = mpsc::channel(ctx.config.execution.queue_capacity.max(1));
    let engine = PairTradeEngine::new(ctx.clone(), tx);
    let worker = ExecutionWorker::new(ctx, gateway, rx);
    (engine, worker)
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PairTradeEngine {
    pub fn new(ctx: EngineContext, intents: mpsc::Sender<ExecutionIntent>) -> Self {
        let cfg = ctx.config.clone();
        Self {
            signals: SignalGenerator::new(cfg.signal.clone()),
            risk: RiskManager::new(cfg.risk.clone()),
            state: Mutex::new(EvaluatorState {
                spread: SpreadCalculator::new(&cfg.spread),
                rebalance: RebalanceStateMachine::new(cfg.rebalance.clone()),
                last_prices: None,
                last_seen: None,
            }),
            risk_snapshot: Mutex::new(None),
            intents,
            ctx,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Feeds one pair of prices through statistics, risk and signal rules.
    /// Returns the signal that was turned into an intent, if any.
    pub fn evaluate_tick(
        &self,
        price_a: Decimal,
        price_b: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Option<Signal> {
        let mut state = relock(&self.state);
        state.last_seen = Some(timestamp);
        match state.spread.update(price_a, price_b, timestamp) {
            Ok(sample) => {
                state.last_prices = Some((price_a, price_b));
                self.run_cycle(&mut state, &sample)
            }
            Err(err) => {
                log::warn!("[SIGNAL] tick at {} ignored: {}", timestamp, err);
                self.ctx.lock.check_session_boundary(timestamp);
                let prices = state.last_prices;
                self.evaluate_risk(&self.pair_positions(), prices, timestamp);
                None
            }
        }
    }

    /// Same pipeline as [`Self::evaluate_tick`] for an already computed
    /// sample; P&L uses the last prices seen by `evaluate_tick`.
    pub fn evaluate_sample(&self, sample: &SpreadSample) -> Option<Signal> {
        let mut state = relock(&self.state);
        self.run_cycle(&mut state, sample)
    }

    fn run_cycle(&self, state: &mut EvaluatorState, sample: &SpreadSample) -> Option<Signal> {
        let now = sample.timestamp;
        state.last_seen = Some(now);
        self.ctx.lock.check_session_boundary(now);

        let entries = self.pair_positions();
        self.evaluate_risk(&entries, state.last_prices, now);

        let live: Vec<String> = entries
            .iter()
            .map(|e| e.record.position_id.clone())
            .collect();
        state.rebalance.retain_positions(&live);

        self.evaluate_signal(state, sample, &entries)
    }

    /// Manual operations run on feed time so their bookings land in the same
    /// session as the ticks. Wall clock until the first evaluation.
    fn clock(&self) -> DateTime<Utc> {
        relock(&self.state).last_seen.unwrap_or_else(Utc::now)
    }

    fn pair_positions(&self) -> Vec<PositionEntry> {
        let pair = &self.ctx.config.pair;
        self.ctx
            .store
            .snapshot()
            .into_iter()
            .filter(|e| {
                e.record.primary_symbol == pair.primary
                    && e.record.secondary_symbol == pair.secondary
            })
            .collect()
    }

    fn assess(
        &self,
        entries: &[PositionEntry],
        prices: Option<(Decimal, Decimal)>,
        now: DateTime<Utc>,
    ) -> RiskAssessment {
        let positions: Vec<(String, f64)> = entries
            .iter()
            .map(|e| {
                let pnl = prices
                    .map(|(a, b)| e.record.unrealized_pnl_f64(a, b))
                    .unwrap_or(0.0);
                (e.record.position_id.clone(), pnl)
            })
            .collect();
        let realized = self
            .ctx
            .store
            .session_realized(now, self.ctx.config.risk.session_start);
        self.risk.evaluate(
            &positions,
            self.ctx.account.get(),
            realized,
            self.ctx.lock.is_locked(),
            now,
        )
    }

    fn evaluate_risk(
        &self,
        entries: &[PositionEntry],
        prices: Option<(Decimal, Decimal)>,
        now: DateTime<Utc>,
    ) {
        let assessment = self.assess(entries, prices, now);
        for action in &assessment.actions {
            match action {
                RiskAction::ForceClose {
                    position_id,
                    reason,
                } => {
                    if let Some(entry) = entries
                        .iter()
                        .find(|e| &e.record.position_id == position_id)
                    {
                        self.submit_risk_close(entry, reason, now);
                    }
                }
                RiskAction::ForceCloseAll { reason } => {
                    for entry in entries {
                        self.submit_risk_close(entry, reason, now);
                    }
                }
                RiskAction::Lock { reason } => {
                    if self.ctx.lock.acquire_lock(reason, now) {
                        self.ctx.alerts.notify(&Alert::TradingLocked {
                            reason: reason.to_string(),
                        });
                    }
                }
            }
        }
        let mut snapshot = assessment.snapshot;
        snapshot.locked = self.ctx.lock.is_locked();
        *relock(&self.risk_snapshot) = Some(snapshot);
    }

    fn submit_risk_close(&self, entry: &PositionEntry, reason: &str, now: DateTime<Utc>) {
        let position_id = &entry.record.position_id;
        match self.submit(self.intent(
            position_id,
            IntentAction::Close {
                reason: ExitReason::RiskLimit,
            },
            None,
            now,
        )) {
            Ok(()) => log::warn!("[RISK] force-closing {} ({})", position_id, reason),
            Err(IntentRejection::InFlight(IntentKind::Close)) => {
                log::debug!("[RISK] close of {} already in flight", position_id)
            }
            Err(rejection) => log::warn!(
                "[RISK] force-close of {} ({}) deferred: {}",
                position_id,
                reason,
                rejection
            ),
        }
    }

    fn evaluate_signal(
        &self,
        state: &mut EvaluatorState,
        sample: &SpreadSample,
        entries: &[PositionEntry],
    ) -> Option<Signal> {
        let open = entries.iter().min_by_key(|e| e.record.opened_at);
        match open {
            Some(entry) => {
                let id = &entry.record.position_id;
                if let Some(kind) = self.ctx.in_flight.get(id) {
                    log::debug!("[SIGNAL] {} has {} in flight, skipping", id, kind.as_str());
                    return None;
                }
                if self.ctx.desync.contains(id) {
                    log::debug!("[SIGNAL] {} suspended, skipping", id);
                    return None;
                }
            }
            None => {
                if self.ctx.in_flight.has_kind(IntentKind::Open) {
                    log::debug!("[SIGNAL] open already in flight, skipping");
                    return None;
                }
            }
        }

        let generated =
            match self
                .signals
                .generate(sample, open.map(|e| &e.state), &state.rebalance)
            {
                Some(generated) => generated,
                None => {
                    if let Some(entry) = open.filter(|_| !sample.stale) {
                        self.check_hedge(state, entry, sample);
                    }
                    return None;
                }
            };
        let signal = generated.signal;

        if !self.ctx.lock.allows(signal.kind) {
            log::info!(
                "[LOCK] {:?} {} at z={:.3} suppressed while locked",
                signal.kind,
                signal.side,
                signal.z_score
            );
            return None;
        }

        let prices = state.last_prices;
        let intent = match (signal.kind, open) {
            (SignalKind::Entry, _) => {
                let Some(volumes) = state.rebalance.entry_volumes(sample.hedge_ratio) else {
                    log::warn!(
                        "[SIGNAL] unusable hedge ratio {} for entry",
                        sample.hedge_ratio
                    );
                    return None;
                };
                let position_id = self.new_position_id(signal.timestamp);
                self.intent(
                    &position_id,
                    IntentAction::Open {
                        side: signal.side,
                        z_score: signal.z_score,
                        volumes,
                        hedge_ratio: sample.hedge_ratio,
                    },
                    prices,
                    signal.timestamp,
                )
            }
            (SignalKind::Scale, Some(entry)) => {
                let volumes = state.rebalance.scale_volumes(entry.record.hedge_ratio)?;
                self.intent(
                    &entry.record.position_id,
                    IntentAction::Scale {
                        z_score: signal.z_score,
                        volumes,
                    },
                    prices,
                    signal.timestamp,
                )
            }
            (SignalKind::Exit, Some(entry)) => self.intent(
                &entry.record.position_id,
                IntentAction::Close {
                    reason: generated.exit_reason.unwrap_or(ExitReason::MeanReversion),
                },
                prices,
                signal.timestamp,
            ),
            (_, None) => return None,
        };

        let position_id = intent.position_id.clone();
        match self.submit(intent) {
            Ok(()) => {
                log::info!(
                    "[SIGNAL] {:?} {} z={:.3} queued for {}",
                    signal.kind,
                    signal.side,
                    signal.z_score,
                    position_id
                );
                Some(signal)
            }
            Err(rejection) => {
                log::warn!(
                    "[SIGNAL] {:?} for {} rejected: {}",
                    signal.kind,
                    position_id,
                    rejection
                );
                None
            }
        }
    }

    fn check_hedge(&self, state: &mut EvaluatorState, entry: &PositionEntry, sample: &SpreadSample) {
        let Some(adjustment) =
            state
                .rebalance
                .hedge_adjustment(&entry.record, sample.hedge_ratio, sample.timestamp)
        else {
            return;
        };
        let intent = self.intent(
            &entry.record.position_id,
            IntentAction::AdjustHedge(adjustment),
            state.last_prices,
            sample.timestamp,
        );
        if let Err(rejection) = self.submit(intent) {
            log::warn!(
                "[REBALANCE] hedge adjustment of {} rejected: {}",
                entry.record.position_id,
                rejection
            );
            state
                .rebalance
                .forget_hedge_check(&entry.record.position_id);
        }
    }

    fn new_position_id(&self, now: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{:06x}",
            self.ctx.config.pair.primary.to_lowercase(),
            now.format("%Y%m%d%H%M%S"),
            rand::random::<u32>() & 0x00ff_ffff
        )
    }

    fn intent(
        &self,
        position_id: &str,
        action: IntentAction,
        reference_prices: Option<(Decimal, Decimal)>,
        now: DateTime<Utc>,
    ) -> ExecutionIntent {
        ExecutionIntent {
            position_id: position_id.to_string(),
            primary_symbol: self.ctx.config.pair.primary.clone(),
            secondary_symbol: self.ctx.config.pair.secondary.clone(),
            action,
            reference_prices,
            created_at: now,
        }
    }

    /// Claims the position's in-flight slot and enqueues without waiting.
    fn submit(&self, intent: ExecutionIntent) -> Result<(), IntentRejection> {
        let position_id = intent.position_id.clone();
        if self.ctx.desync.contains(&position_id) {
            return Err(IntentRejection::Suspended);
        }
        self.ctx
            .in_flight
            .try_register(&position_id, intent.action.kind())
            .map_err(IntentRejection::InFlight)?;
        match self.intents.try_send(intent) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.ctx.in_flight.release(&position_id);
                Err(IntentRejection::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.ctx.in_flight.release(&position_id);
                Err(IntentRejection::WorkerGone)
            }
        }
    }

    pub fn get_risk_snapshot(&self) -> RiskSnapshot {
        if let Some(snapshot) = relock(&self.risk_snapshot).clone() {
            return snapshot;
        }
        let prices = relock(&self.state).last_prices;
        self.assess(&self.pair_positions(), prices, self.clock()).snapshot
    }

    pub fn get_lock_state(&self) -> TradingLockState {
        self.ctx.lock.state()
    }

    pub fn get_position_overview(&self) -> Vec<PositionOverview> {
        self.ctx
            .store
            .snapshot()
            .into_iter()
            .map(|entry| {
                let in_flight = self.ctx.in_flight.contains(&entry.record.position_id);
                let suspended = self.ctx.desync.contains(&entry.record.position_id);
                PositionOverview {
                    in_flight,
                    suspended,
                    record: entry.record,
                    state: entry.state,
                }
            })
            .collect()
    }

    pub fn force_close(&self, position_id: &str) -> Result<(), IntentRejection> {
        if !self.ctx.store.contains(position_id) {
            return Err(IntentRejection::UnknownPosition);
        }
        let prices = relock(&self.state).last_prices;
        self.submit(self.intent(
            position_id,
            IntentAction::Close {
                reason: ExitReason::Manual,
            },
            prices,
            self.clock(),
        ))?;
        log::info!("[EXEC] manual close of {} queued", position_id);
        Ok(())
    }

    pub fn reset_lock(&self) -> bool {
        let cleared = self.ctx.lock.reset_lock(self.clock());
        if cleared {
            if let Some(snapshot) = relock(&self.risk_snapshot).as_mut() {
                snapshot.locked = false;
            }
        }
        cleared
    }

    pub fn suspended_positions(&self) -> Vec<DesyncRecord> {
        self.ctx.desync.records()
    }

    /// Explicit recovery of a position flagged by reconciliation. Returns
    /// false when the position was not suspended.
    pub fn resolve_desync(&self, position_id: &str, resolution: Resolution) -> bool {
        let Some(record) = self.ctx.desync.take(position_id) else {
            return false;
        };
        match (resolution, record.venue) {
            (Resolution::KeepLocal, _) => {
                log::info!("[RECONCILE] {} resolved: keeping local state", position_id);
            }
            (Resolution::AdoptVenue, Some(venue)) => {
                let adopted = self.ctx.store.update(position_id, |entry| {
                    entry.record.primary_lots = venue.primary_lots;
                    entry.record.secondary_lots = venue.secondary_lots;
                    entry.state.total_primary_lots = venue.primary_lots;
                    entry.state.total_secondary_lots = venue.secondary_lots;
                });
                if adopted.is_some() {
                    log::info!(
                        "[RECONCILE] {} resolved: adopted venue lots {}/{}",
                        position_id,
                        venue.primary_lots,
                        venue.secondary_lots
                    );
                } else {
                    log::warn!(
                        "[RECONCILE] {} exists only at venue ({}/{} lots); close it there",
                        position_id,
                        venue.primary_lots,
                        venue.secondary_lots
                    );
                }
            }
            (Resolution::AdoptVenue, None) => {
                self.ctx.store.remove(position_id);
                log::info!(
                    "[RECONCILE] {} resolved: venue holds nothing, local record dropped",
                    position_id
                );
            }
        }
        self.ctx.store.clear_intent(position_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::model::{PositionRecord, Side, SpreadEntryState};
    use crate::store::InFlightIntent;
    use crate::trade::execution::gateway::{GatewayError, VenuePosition};
    use crate::trade::execution::test_support::ScriptedGateway;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::fs;
    use std::time::Duration as StdDuration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::watch;

    struct Fixture {
        engine: PairTradeEngine,
        worker: ExecutionWorker,
        gateway: Arc<ScriptedGateway>,
        alerts: Arc<MemoryAlertSink>,
        _dir: TempDir,
    }

    fn config(dir: &TempDir) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.storage.state_file = dir.path().join("positions.json");
        cfg.storage.lock_file = dir.path().join("lock.json");
        cfg.execution.close_backoff_ms = 1;
        cfg
    }

    fn fixture_with(dir: TempDir, cfg: EngineConfig) -> Fixture {
        let alerts = Arc::new(MemoryAlertSink::default());
        let gateway = Arc::new(ScriptedGateway::default());
        let ctx = EngineContext::bootstrap(cfg, alerts.clone());
        let (engine, worker) = build(ctx, gateway.clone());
        Fixture {
            engine,
            worker,
            gateway,
            alerts,
            _dir: dir,
        }
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        fixture_with(dir, cfg)
    }

    fn t(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(i)
    }

    fn sample(z: f64, i: i64) -> SpreadSample {
        SpreadSample {
            timestamp: t(i),
            hedge_ratio: 1.0,
            spread_value: z,
            rolling_mean: 0.0,
            rolling_std: 1.0,
            z_score: z,
            stale: false,
        }
    }

    fn position(id: &str, side: Side, entry_a: Decimal, entry_b: Decimal) -> PositionEntry {
        PositionEntry {
            record: PositionRecord {
                position_id: id.to_string(),
                primary_symbol: "XAUUSD".to_string(),
                secondary_symbol: "XAGUSD".to_string(),
                side,
                primary_lots: dec!(1),
                secondary_lots: dec!(1),
                primary_entry_price: Some(entry_a),
                secondary_entry_price: Some(entry_b),
                hedge_ratio: 1.0,
                opened_at: t(0),
            },
            state: SpreadEntryState {
                position_id: id.to_string(),
                side,
                last_z_entry: 2.1 * side.z_sign(),
                next_z_entry: 2.6 * side.z_sign(),
                entry_count: 1,
                total_primary_lots: dec!(1),
                total_secondary_lots: dec!(1),
                last_updated: t(0),
            },
        }
    }

    /// Leaves p1 behind with a close journaled, as a run killed mid-order would.
    fn interrupted_run(cfg: &EngineConfig) {
        let f = fixture_with(tempdir().unwrap(), cfg.clone());
        let store = &f.engine.context().store;
        store.insert(position("p1", Side::Short, dec!(100), dec!(100)));
        store.journal_intent(InFlightIntent {
            position_id: "p1".to_string(),
            action: "close".to_string(),
            started_at: t(0),
        });
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn scenario_entry_two_scales_then_exit() {
        let mut f = fixture();
        let mut kinds = Vec::new();
        for (i, z) in [1.0, 2.1, 2.6, 3.2, 0.4].into_iter().enumerate() {
            if z == 0.4 {
                let open = f.engine.get_position_overview();
                assert_eq!(open.len(), 1);
                assert_eq!(open[0].state.entry_count, 3);
                assert!((open[0].state.next_z_entry - 3.7).abs() < 1e-9);
            }
            let signal = f.engine.evaluate_sample(&sample(z, i as i64));
            kinds.push(signal.map(|s| (s.kind, s.side)));
            f.worker.process_pending().await;
            if z == 2.1 {
                let state = &f.engine.get_position_overview()[0].state;
                assert!((state.next_z_entry - 2.6).abs() < 1e-9);
            }
            if z == 2.6 {
                let state = &f.engine.get_position_overview()[0].state;
                assert!((state.next_z_entry - 3.1).abs() < 1e-9);
            }
        }
        assert_eq!(
            kinds,
            vec![
                None,
                Some((SignalKind::Entry, Side::Short)),
                Some((SignalKind::Scale, Side::Short)),
                Some((SignalKind::Scale, Side::Short)),
                Some((SignalKind::Exit, Side::Short)),
            ]
        );
        assert!(f.engine.get_position_overview().is_empty());
        assert!(f.engine.context().in_flight.is_empty());
        // 0.10 entry plus two adds of 0.03 on each leg, opened and closed.
        let volume: Decimal = f.gateway.orders().iter().map(|o| o.volume).sum();
        assert_eq!(volume, dec!(0.64));
    }

    #[tokio::test]
    async fn scenario_portfolio_limit_closes_all_and_locks() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.risk.max_loss_per_setup_pct = 10.0;
        let mut f = fixture_with(dir, cfg);
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(1000), dec!(50)));
        f.engine
            .context()
            .store
            .insert(position("p2", Side::Long, dec!(1000), dec!(50)));

        // Each position is down 250 on the primary leg: 500 total, exactly
        // 5% of the 10_000 fallback equity.
        assert!(f.engine.evaluate_tick(dec!(750), dec!(50), t(1)).is_none());

        let lock = f.engine.get_lock_state();
        assert!(lock.locked);
        assert_eq!(lock.reason.as_deref(), Some("portfolio_loss_limit"));
        let overview = f.engine.get_position_overview();
        assert_eq!(overview.len(), 2);
        assert!(overview.iter().all(|p| p.in_flight));
        let snapshot = f.engine.get_risk_snapshot();
        assert!(snapshot.portfolio.breached);
        assert!(snapshot.locked);
        assert!(f
            .alerts
            .alerts()
            .contains(&Alert::TradingLocked {
                reason: "portfolio_loss_limit".to_string()
            }));

        f.gateway.set_price("XAUUSD", dec!(750));
        f.gateway.set_price("XAGUSD", dec!(50));
        assert_eq!(f.worker.process_pending().await, 2);
        assert!(f.engine.get_position_overview().is_empty());
        let realized = f
            .engine
            .context()
            .store
            .session_realized(t(2), f.engine.context().config.risk.session_start);
        assert_eq!(realized, -500.0);
    }

    #[tokio::test]
    async fn scenario_corrupt_state_starts_empty() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        fs::write(&cfg.storage.state_file, "\u{0}\u{1}not-json").unwrap();
        let f = fixture_with(dir, cfg);
        assert!(f.engine.get_position_overview().is_empty());
        assert!(!f.engine.get_lock_state().locked);
    }

    #[tokio::test]
    async fn losses_below_limits_never_lock() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(100), dec!(50)));
        for i in 0..5 {
            f.engine.evaluate_tick(dec!(99), dec!(50), t(i));
        }
        assert!(!f.engine.get_lock_state().locked);
        assert!(!f.engine.get_risk_snapshot().any_breach());
        assert_eq!(f.worker.process_pending().await, 0);
    }

    #[tokio::test]
    async fn lock_blocks_entries_but_not_exits() {
        let mut f = fixture();
        f.engine.context().lock.acquire_lock("daily_loss_limit", t(0));
        assert!(f.engine.evaluate_sample(&sample(2.5, 1)).is_none());
        assert_eq!(f.worker.process_pending().await, 0);

        f.engine
            .context()
            .store
            .insert(position("p1", Side::Short, dec!(100), dec!(100)));
        assert!(f.engine.evaluate_sample(&sample(3.0, 2)).is_none());
        let exit = f.engine.evaluate_sample(&sample(0.3, 3)).unwrap();
        assert_eq!(exit.kind, SignalKind::Exit);
        assert_eq!(f.worker.process_pending().await, 1);
        assert!(f.engine.get_position_overview().is_empty());

        assert!(f.engine.reset_lock());
        assert!(f.engine.evaluate_sample(&sample(2.5, 4)).is_some());
    }

    #[tokio::test]
    async fn second_intent_is_rejected_while_first_is_in_flight() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Short, dec!(100), dec!(100)));

        let engine = &f.engine;
        let accepted = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| engine.force_close("p1").is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(accepted, 1);
        assert_eq!(
            f.engine.force_close("p1"),
            Err(IntentRejection::InFlight(IntentKind::Close))
        );
        assert!(f.engine.evaluate_sample(&sample(0.1, 1)).is_none());
        assert_eq!(f.worker.process_pending().await, 1);
        assert_eq!(
            f.engine.force_close("p1"),
            Err(IntentRejection::UnknownPosition)
        );
    }

    #[tokio::test]
    async fn full_queue_rejects_instead_of_blocking() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.execution.queue_capacity = 1;
        let f = fixture_with(dir, cfg);
        let store = &f.engine.context().store;
        store.insert(position("p1", Side::Short, dec!(100), dec!(100)));
        store.insert(position("p2", Side::Short, dec!(100), dec!(100)));
        assert!(f.engine.force_close("p1").is_ok());
        assert_eq!(f.engine.force_close("p2"), Err(IntentRejection::QueueFull));
        assert!(!f.engine.context().in_flight.contains("p2"));
    }

    #[tokio::test]
    async fn partial_entry_fill_is_unwound() {
        let mut f = fixture();
        f.gateway
            .script(Ok(crate::model::OrderResult::filled(dec!(0.1), Some(dec!(100)))));
        f.gateway.script(Ok(crate::model::OrderResult {
            success: true,
            filled_volume: dec!(0.05),
            fill_price: Some(dec!(100)),
            error: None,
        }));
        let entry = f.engine.evaluate_sample(&sample(2.5, 1)).unwrap();
        assert_eq!(entry.kind, SignalKind::Entry);
        f.worker.process_pending().await;

        assert!(f.engine.get_position_overview().is_empty());
        assert!(f.engine.context().in_flight.is_empty());
        let orders = f.gateway.orders();
        assert_eq!(orders.len(), 4);
        // short spread: sell primary, buy secondary, then reverse what filled
        assert_eq!(orders[2].side, crate::model::OrderSide::Buy);
        assert_eq!(orders[2].volume, dec!(0.1));
        assert_eq!(orders[3].side, crate::model::OrderSide::Sell);
        assert_eq!(orders[3].volume, dec!(0.05));
        assert!(f.gateway.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_scale_leaves_state_untouched() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Short, dec!(100), dec!(100)));
        let before = f.engine.context().store.get("p1").unwrap();
        f.gateway
            .script(Err(GatewayError::Rejected("no liquidity".to_string())));
        let scale = f.engine.evaluate_sample(&sample(2.7, 1)).unwrap();
        assert_eq!(scale.kind, SignalKind::Scale);
        f.worker.process_pending().await;
        assert_eq!(f.engine.context().store.get("p1").unwrap(), before);
        assert_eq!(f.gateway.orders().len(), 1);
    }

    #[tokio::test]
    async fn close_is_retried_until_filled() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(100), dec!(100)));
        f.gateway
            .script(Err(GatewayError::Unavailable("timeout".to_string())));
        f.engine.force_close("p1").unwrap();
        f.worker.process_pending().await;
        assert!(f.engine.get_position_overview().is_empty());
        assert_eq!(f.gateway.orders().len(), 3);
    }

    #[tokio::test]
    async fn incomplete_close_writes_back_remainder() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.execution.close_max_attempts = 2;
        let mut f = fixture_with(dir, cfg);
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(100), dec!(100)));
        f.gateway.script(Ok(crate::model::OrderResult {
            success: true,
            filled_volume: dec!(0.4),
            fill_price: Some(dec!(100)),
            error: None,
        }));
        f.gateway
            .script(Err(GatewayError::Unavailable("timeout".to_string())));
        f.engine.force_close("p1").unwrap();
        f.worker.process_pending().await;

        let left = f.engine.context().store.get("p1").unwrap();
        assert_eq!(left.record.primary_lots, dec!(0.6));
        assert_eq!(left.record.secondary_lots, dec!(0));
        assert!(f
            .alerts
            .alerts()
            .iter()
            .any(|a| matches!(a, Alert::CloseFailed { .. })));
        assert!(!f.engine.context().in_flight.contains("p1"));
    }

    #[tokio::test]
    async fn realized_loss_feeds_daily_layer() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(1200), dec!(100)));
        f.engine.force_close("p1").unwrap();
        f.worker.process_pending().await;
        // primary sold at 100 against 1200 paid on one lot
        let realized = f
            .engine
            .context()
            .store
            .session_realized(Utc::now(), f.engine.context().config.risk.session_start);
        assert_eq!(realized, -1100.0);

        let mut flat = sample(0.0, 1);
        flat.timestamp = Utc::now();
        f.engine.evaluate_sample(&flat);
        assert!(f.engine.get_lock_state().locked);
        assert_eq!(
            f.engine.get_lock_state().reason.as_deref(),
            Some("daily_loss_limit")
        );
    }

    #[tokio::test]
    async fn manual_close_books_into_feed_session() {
        let mut f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(1200), dec!(100)));
        assert!(f.engine.evaluate_sample(&sample(-1.5, 1)).is_none());
        f.engine.force_close("p1").unwrap();
        f.worker.process_pending().await;

        let session_start = f.engine.context().config.risk.session_start;
        let realized = f.engine.context().store.session_realized(t(2), session_start);
        assert_eq!(realized, -1100.0);
        f.engine.evaluate_sample(&sample(-1.5, 2));
        assert_eq!(
            f.engine.get_lock_state().reason.as_deref(),
            Some("daily_loss_limit")
        );
    }

    #[tokio::test]
    async fn hedge_drift_adjusts_secondary_leg() {
        let mut f = fixture();
        let mut entry = position("p1", Side::Short, dec!(100), dec!(100));
        entry.record.primary_lots = dec!(0.10);
        entry.record.secondary_lots = dec!(0.10);
        f.engine.context().store.insert(entry);

        let mut drifted = sample(1.0, 1);
        drifted.hedge_ratio = 1.2;
        assert!(f.engine.evaluate_sample(&drifted).is_none());
        assert_eq!(f.worker.process_pending().await, 1);

        let adjusted = f.engine.context().store.get("p1").unwrap();
        assert_eq!(adjusted.record.secondary_lots, dec!(0.12));
        assert_eq!(adjusted.record.hedge_ratio, 1.2);
        assert_eq!(adjusted.state.entry_count, 1);
        assert_eq!(adjusted.state.last_z_entry, 2.1);
    }

    #[tokio::test]
    async fn desync_suspends_until_resolved() {
        let f = fixture();
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Short, dec!(100), dec!(100)));
        *f.gateway.venue_override.lock().unwrap() = Some(vec![VenuePosition {
            position_id: "p1".to_string(),
            primary_lots: dec!(1),
            secondary_lots: dec!(0.5),
        }]);

        assert_eq!(f.worker.reconcile().await.unwrap(), vec!["p1".to_string()]);
        assert!(f.worker.reconcile().await.unwrap().is_empty());
        assert!(f
            .alerts
            .alerts()
            .iter()
            .any(|a| matches!(a, Alert::Desync { .. })));
        assert!(f.engine.get_position_overview()[0].suspended);
        assert_eq!(f.engine.force_close("p1"), Err(IntentRejection::Suspended));
        assert!(f.engine.evaluate_sample(&sample(0.1, 1)).is_none());
        // still flagged, never auto-corrected
        assert_eq!(
            f.engine.context().store.get("p1").unwrap().record.secondary_lots,
            dec!(1)
        );

        assert!(f.engine.resolve_desync("p1", Resolution::AdoptVenue));
        let adopted = f.engine.context().store.get("p1").unwrap();
        assert_eq!(adopted.record.secondary_lots, dec!(0.5));
        assert!(f.engine.suspended_positions().is_empty());
        assert!(!f.engine.resolve_desync("p1", Resolution::KeepLocal));
    }

    #[tokio::test]
    async fn venue_only_position_is_flagged() {
        let f = fixture();
        f.gateway.hold("ghost", dec!(1), dec!(1));
        assert_eq!(f.worker.reconcile().await.unwrap(), vec!["ghost".to_string()]);
        assert!(f.engine.resolve_desync("ghost", Resolution::AdoptVenue));
        assert!(f.engine.get_position_overview().is_empty());
    }

    #[tokio::test]
    async fn account_poll_replaces_fallback() {
        let f = fixture();
        assert_eq!(f.engine.context().account.get().equity, 10_000.0);
        f.gateway.account.lock().unwrap().equity = 12_345.0;
        f.worker.refresh_account().await;
        assert_eq!(f.engine.context().account.get().equity, 12_345.0);
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(f.worker.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn positions_survive_restart() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        {
            let mut f = fixture_with(tempdir().unwrap(), cfg.clone());
            f.engine.evaluate_sample(&sample(-2.4, 1)).unwrap();
            f.worker.process_pending().await;
            assert_eq!(f.engine.get_position_overview().len(), 1);
        }
        let f = fixture_with(dir, cfg);
        let restored = f.engine.get_position_overview();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].record.side, Side::Long);
        assert!((restored[0].state.next_z_entry + 2.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unresolved_intent_survives_venue_outage() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        interrupted_run(&cfg);
        {
            let f = fixture_with(tempdir().unwrap(), cfg.clone());
            *f.gateway.positions_down.lock().unwrap() = true;
            assert!(!f.worker.recover_unresolved().await);
            assert_eq!(f.engine.context().store.journaled_intents().len(), 1);
            assert!(f.engine.suspended_positions().is_empty());
        }
        {
            let f = fixture_with(tempdir().unwrap(), cfg.clone());
            assert_eq!(f.engine.context().store.unresolved_intents().len(), 1);
            f.gateway.hold("p1", dec!(1), dec!(1));
            assert!(f.worker.recover_unresolved().await);
            assert!(f.engine.context().store.journaled_intents().is_empty());
            assert!(f.engine.suspended_positions().is_empty());
        }
        let f = fixture_with(dir, cfg);
        assert!(f.engine.context().store.unresolved_intents().is_empty());
        assert_eq!(f.engine.get_position_overview().len(), 1);
    }

    #[tokio::test]
    async fn flagged_position_keeps_journal_until_resolved() {
        let dir = tempdir().unwrap();
        let cfg = config(&dir);
        interrupted_run(&cfg);
        let f = fixture_with(dir, cfg);
        // venue holds nothing for p1
        assert!(f.worker.recover_unresolved().await);
        assert_eq!(f.engine.suspended_positions().len(), 1);
        assert_eq!(f.engine.context().store.journaled_intents().len(), 1);

        assert!(f.engine.resolve_desync("p1", Resolution::AdoptVenue));
        assert!(f.engine.context().store.journaled_intents().is_empty());
        assert!(f.engine.get_position_overview().is_empty());
    }

    #[tokio::test]
    async fn recovery_is_retried_on_poll_after_outage() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.execution.reconcile_interval_secs = 1;
        interrupted_run(&cfg);
        let f = fixture_with(dir, cfg);
        f.gateway.hold("p1", dec!(1), dec!(1));
        *f.gateway.positions_down.lock().unwrap() = true;
        let store = f.engine.context().store.clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.worker.run(rx));
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(store.journaled_intents().len(), 1);

        *f.gateway.positions_down.lock().unwrap() = false;
        wait_until(|| store.journaled_intents().is_empty()).await;
        assert!(f.engine.suspended_positions().is_empty());
        tx.send(true).unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn drain_timeout_leaves_intent_journaled() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.execution.shutdown_drain_secs = 0;
        let state_file = cfg.storage.state_file.clone();
        let f = fixture_with(dir, cfg);
        f.engine
            .context()
            .store
            .insert(position("p1", Side::Long, dec!(100), dec!(100)));
        f.gateway.hold("p1", dec!(1), dec!(1));
        *f.gateway.order_delay.lock().unwrap() = Some(StdDuration::from_secs(30));
        f.engine.force_close("p1").unwrap();
        let store = f.engine.context().store.clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(f.worker.run(rx));
        wait_until(|| !store.journaled_intents().is_empty()).await;
        tx.send(true).unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(f.alerts.alerts().iter().any(|a| matches!(
            a,
            Alert::UnresolvedIntent { position_id, .. } if position_id == "p1"
        )));
        assert_eq!(store.journaled_intents().len(), 1);
        let reloaded = PositionStore::load(&state_file, Arc::new(MemoryAlertSink::default()));
        assert_eq!(reloaded.unresolved_intents().len(), 1);
        assert_eq!(reloaded.unresolved_intents()[0].action, "close");
        assert!(reloaded.get("p1").is_some());
    }

    #[tokio::test]
    async fn hedge_check_rearmed_after_queue_rejection() {
        let dir = tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.execution.queue_capacity = 1;
        let mut f = fixture_with(dir, cfg);
        let mut entry = position("p1", Side::Short, dec!(100), dec!(100));
        entry.record.primary_lots = dec!(0.10);
        entry.record.secondary_lots = dec!(0.10);
        f.engine.context().store.insert(entry);
        let mut other = position("p2", Side::Short, dec!(100), dec!(100));
        other.record.opened_at = t(1);
        f.engine.context().store.insert(other);
        f.engine.force_close("p2").unwrap();

        let mut drifted = sample(1.0, 2);
        drifted.hedge_ratio = 1.2;
        assert!(f.engine.evaluate_sample(&drifted).is_none());
        assert!(!f.engine.context().in_flight.contains("p1"));
        assert_eq!(f.worker.process_pending().await, 1);

        // one minute later, well inside the check interval
        drifted.timestamp = t(3);
        f.engine.evaluate_sample(&drifted);
        assert_eq!(f.worker.process_pending().await, 1);
        let adjusted = f.engine.context().store.get("p1").unwrap();
        assert_eq!(adjusted.record.secondary_lots, dec!(0.12));
    }
}

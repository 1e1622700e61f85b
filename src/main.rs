use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairtrade_core::alert::{AlertSink, LogAlertSink};
use pairtrade_core::config::EngineConfig;
use pairtrade_core::pairtrade::{self, EngineContext, PairTradeEngine};
use pairtrade_core::ports::replay_gateway::ReplayGateway;
use pairtrade_core::trade::execution::gateway::ExecutionGateway;
use pairtrade_core::trade::execution::gateway_box::GatewayBox;
use rust_decimal::Decimal;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn init_logging() -> anyhow::Result<()> {
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "0".to_string())
        .parse::<i32>()?;
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| anyhow::anyhow!("invalid TIMEZONE_OFFSET {}", offset_seconds))?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();
    Ok(())
}

struct Tick {
    price_a: Decimal,
    price_b: Decimal,
    timestamp: DateTime<Utc>,
}

/// Pulls one quote per leg per step into the tick channel and advances the
/// replay cursor until the dump is exhausted or shutdown is requested.
async fn feed_quotes(
    cfg: Arc<EngineConfig>,
    gateway: Arc<dyn ExecutionGateway>,
    replay: Arc<ReplayGateway>,
    ticks: mpsc::Sender<Tick>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(cfg.execution.quote_interval_secs);
    let mut fed = 0usize;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let quotes = tokio::try_join!(
            gateway.get_quote(&cfg.pair.primary),
            gateway.get_quote(&cfg.pair.secondary)
        );
        match quotes {
            Ok((a, b)) => {
                let tick = Tick {
                    price_a: a.mid(),
                    price_b: b.mid(),
                    timestamp: replay.current_timestamp().unwrap_or(a.timestamp),
                };
                if ticks.send(tick).await.is_err() {
                    break;
                }
                fed += 1;
            }
            Err(err) => log::warn!("[FEED] quote unavailable: {}", err),
        }
        if !replay.tick() {
            log::info!("[FEED] replay finished after {} ticks", fed);
            break;
        }
        if interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Evaluates ticks in arrival order. Never awaits venue I/O.
async fn evaluate_ticks(engine: Arc<PairTradeEngine>, mut ticks: mpsc::Receiver<Tick>) {
    while let Some(tick) = ticks.recv().await {
        if let Some(signal) = engine.evaluate_tick(tick.price_a, tick.price_b, tick.timestamp) {
            log::debug!("[FEED] {:?} {} at {}", signal.kind, signal.side, tick.timestamp);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    log::info!("Starting pair-trade engine...");

    let cfg = EngineConfig::from_env_or_yaml()?;
    let replay_file = cfg
        .replay_file
        .clone()
        .ok_or_else(|| anyhow::anyhow!("REPLAY_FILE is required to run the paper venue"))?;
    log::info!(
        "[CONFIG] pair={} window={} entry={} exit={} replay={}",
        cfg.pair.key(),
        cfg.spread.window,
        cfg.signal.entry_threshold,
        cfg.signal.exit_threshold,
        replay_file
    );

    let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
    let replay = Arc::new(
        ReplayGateway::new(&replay_file, cfg.risk.equity_fallback)
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let gateway: Arc<dyn ExecutionGateway> =
        Arc::new(GatewayBox::new(replay.clone(), alerts.clone()));

    let ctx = EngineContext::bootstrap(cfg, alerts);
    let (engine, worker) = pairtrade::build(ctx, gateway.clone());
    let engine = Arc::new(engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let capacity = engine.context().config.execution.queue_capacity.max(1);
    let (tick_tx, tick_rx) = mpsc::channel(capacity);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));
    let eval_handle = tokio::spawn(evaluate_ticks(engine.clone(), tick_rx));
    let feed_handle = tokio::spawn(feed_quotes(
        engine.context().config.clone(),
        gateway,
        replay,
        tick_tx,
        shutdown_rx,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl-C, shutting down");
            let _ = shutdown_tx.send(true);
        }
        res = feed_handle => {
            if let Err(e) = res {
                log::error!("quote feed task failed: {}", e);
            }
        }
    }
    // evaluation ends once the feed has dropped its sender and the channel drained
    if let Err(e) = eval_handle.await {
        log::error!("evaluation task failed: {}", e);
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        log::error!("execution worker task failed: {}", e);
    }

    let snapshot = engine.get_risk_snapshot();
    log::info!(
        "[RISK] final: equity={:.2} unrealized={:.2} session_realized={:.2} locked={}",
        snapshot.equity,
        snapshot.total_unrealized_pnl,
        snapshot.session_realized_pnl,
        snapshot.locked
    );
    for overview in engine.get_position_overview() {
        log::info!("[STORE] open at exit: {}", serde_json::to_string(&overview)?);
    }
    Ok(())
}

use crate::config::SignalConfig;
use crate::model::{ExitReason, Side, Signal, SignalKind, SpreadEntryState};
use crate::rebalance::RebalanceStateMachine;
use crate::spread::SpreadSample;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSignal {
    pub signal: Signal,
    pub exit_reason: Option<ExitReason>,
}

/// Threshold rules mapping a spread sample to ENTRY, EXIT or SCALE.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    cfg: SignalConfig,
}

impl SignalGenerator {
    pub fn new(cfg: SignalConfig) -> Self {
        Self { cfg }
    }

    pub fn generate(
        &self,
        sample: &SpreadSample,
        open: Option<&SpreadEntryState>,
        rebalance: &RebalanceStateMachine,
    ) -> Option<GeneratedSignal> {
        if sample.stale || !sample.z_score.is_finite() {
            return None;
        }
        let z = sample.z_score;
        let make = |kind: SignalKind, side: Side, exit_reason: Option<ExitReason>| {
            Some(GeneratedSignal {
                signal: Signal {
                    kind,
                    side,
                    z_score: z,
                    timestamp: sample.timestamp,
                },
                exit_reason,
            })
        };

        let state = match open {
            None => {
                if z.abs() >= self.cfg.entry_threshold {
                    let side = Side::fading(z);
                    log::info!("[SIGNAL] ENTRY {} z={:.3}", side, z);
                    return make(SignalKind::Entry, side, None);
                }
                return None;
            }
            Some(state) => state,
        };

        let side = state.side;
        let sign = side.z_sign();
        if let Some(stop) = self.cfg.stop_loss_z {
            if sign * z >= stop {
                log::warn!(
                    "[SIGNAL] EXIT {} {} z={:.3} hit stop {:.3}",
                    state.position_id,
                    side,
                    z,
                    stop
                );
                return make(SignalKind::Exit, side, Some(ExitReason::StopLoss));
            }
        }
        if sign * z <= self.cfg.exit_threshold {
            log::info!(
                "[SIGNAL] EXIT {} {} z={:.3} reverted",
                state.position_id,
                side,
                z
            );
            return make(SignalKind::Exit, side, Some(ExitReason::MeanReversion));
        }
        if rebalance.scale_due(state, z) {
            log::info!(
                "[SIGNAL] SCALE {} {} z={:.3} next={:.3}",
                state.position_id,
                side,
                z,
                state.next_z_entry
            );
            return make(SignalKind::Scale, side, None);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::rebalance::LegVolumes;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn sample(z: f64) -> SpreadSample {
        SpreadSample {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            hedge_ratio: 1.0,
            spread_value: z,
            rolling_mean: 0.0,
            rolling_std: 1.0,
            z_score: z,
            stale: false,
        }
    }

    fn setup() -> (SignalGenerator, RebalanceStateMachine) {
        let cfg = EngineConfig::default();
        (
            SignalGenerator::new(cfg.signal.clone()),
            RebalanceStateMachine::new(cfg.rebalance),
        )
    }

    fn open(machine: &RebalanceStateMachine, side: Side, z: f64) -> SpreadEntryState {
        let fill = LegVolumes {
            primary: dec!(1),
            secondary: dec!(1),
        };
        machine.open_state("p1", side, z, &fill, Utc::now())
    }

    #[test]
    fn entry_requires_threshold_and_fades_the_sign() {
        let (gen, machine) = setup();
        assert!(gen.generate(&sample(1.99), None, &machine).is_none());
        let short = gen.generate(&sample(2.0), None, &machine).unwrap();
        assert_eq!(short.signal.kind, SignalKind::Entry);
        assert_eq!(short.signal.side, Side::Short);
        let long = gen.generate(&sample(-2.3), None, &machine).unwrap();
        assert_eq!(long.signal.side, Side::Long);
    }

    #[test]
    fn stale_sample_never_signals() {
        let (gen, machine) = setup();
        let mut s = sample(5.0);
        s.stale = true;
        assert!(gen.generate(&s, None, &machine).is_none());
    }

    #[test]
    fn exit_when_z_reverts_through_threshold() {
        let (gen, machine) = setup();
        let short = open(&machine, Side::Short, 2.1);
        assert!(gen.generate(&sample(0.6), Some(&short), &machine).is_none());
        let exit = gen.generate(&sample(0.4), Some(&short), &machine).unwrap();
        assert_eq!(exit.signal.kind, SignalKind::Exit);
        assert_eq!(exit.exit_reason, Some(ExitReason::MeanReversion));

        let long = open(&machine, Side::Long, -2.1);
        let exit = gen.generate(&sample(-0.5), Some(&long), &machine).unwrap();
        assert_eq!(exit.signal.kind, SignalKind::Exit);
    }

    #[test]
    fn open_position_suppresses_new_entry() {
        let (gen, machine) = setup();
        let short = open(&machine, Side::Short, 2.1);
        assert!(gen.generate(&sample(2.3), Some(&short), &machine).is_none());
    }

    #[test]
    fn scale_when_next_trigger_reached() {
        let (gen, machine) = setup();
        let short = open(&machine, Side::Short, 2.1);
        let scale = gen.generate(&sample(2.6), Some(&short), &machine).unwrap();
        assert_eq!(scale.signal.kind, SignalKind::Scale);
        assert_eq!(scale.signal.side, Side::Short);
    }

    #[test]
    fn stop_loss_exits_on_adverse_extension() {
        let (gen, machine) = setup();
        let long = open(&machine, Side::Long, -2.1);
        let exit = gen.generate(&sample(-4.2), Some(&long), &machine).unwrap();
        assert_eq!(exit.signal.kind, SignalKind::Exit);
        assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    }
}

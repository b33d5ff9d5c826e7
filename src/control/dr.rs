//! Demand-response policy applier.
//!
//! Pure transformation from raw to effective headroom. The result is never
//! negative; the hard feeder limit is applied by the caller on top.

use crate::config::DrConfig;
use crate::model::{DrMode, DrProgram, ReasonCode};

/// Outcome of applying the active DR program to one feeder's headroom.
#[derive(Debug, Clone, PartialEq)]
pub struct DrAdjustment {
    pub effective_headroom_kw: f64,
    /// `DR_SHED` or `DR_BOOST`; `None` when no program changed anything.
    pub reason: Option<ReasonCode>,
    /// Program that produced the adjustment.
    pub program_id: Option<String>,
}

/// Transforms raw headroom under the active program, if any.
pub fn apply_dr_policy(
    program: Option<&DrProgram>,
    raw_headroom_kw: f64,
    now_ms: i64,
    cfg: &DrConfig,
) -> DrAdjustment {
    let Some(program) = program.filter(|p| p.is_active_at(now_ms)) else {
        return DrAdjustment {
            effective_headroom_kw: raw_headroom_kw.max(0.0),
            reason: None,
            program_id: None,
        };
    };

    match program.mode {
        DrMode::FixedCap => {
            let shed = program.target_shed_kw.max(0.0);
            DrAdjustment {
                effective_headroom_kw: (raw_headroom_kw - shed).max(0.0),
                reason: (shed > 0.0).then_some(ReasonCode::DrShed),
                program_id: Some(program.id.clone()),
            }
        }
        DrMode::PriceElastic => {
            // Symmetric clipped linear response: positive incentives boost,
            // penalties shed, the net factor clamped to [-1, +1].
            let factor = (program.incentive_per_kwh * cfg.k_boost
                - program.penalty_per_kwh * cfg.k_shed)
                .clamp(-1.0, 1.0);
            let reason = if factor > 0.0 {
                Some(ReasonCode::DrBoost)
            } else if factor < 0.0 {
                Some(ReasonCode::DrShed)
            } else {
                None
            };
            DrAdjustment {
                effective_headroom_kw: (raw_headroom_kw * (1.0 + factor)).max(0.0),
                reason,
                program_id: Some(program.id.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DrConfig {
        DrConfig {
            k_boost: 0.1,
            k_shed: 0.1,
        }
    }

    fn fixed_cap(shed: f64) -> DrProgram {
        DrProgram {
            id: "p1".to_string(),
            name: "evening shed".to_string(),
            mode: DrMode::FixedCap,
            ts_start: 0,
            ts_end: 10_000,
            target_shed_kw: shed,
            incentive_per_kwh: 0.0,
            penalty_per_kwh: 0.0,
            is_active: true,
        }
    }

    fn price_elastic(incentive: f64, penalty: f64) -> DrProgram {
        DrProgram {
            id: "p2".to_string(),
            name: "elastic".to_string(),
            mode: DrMode::PriceElastic,
            ts_start: 0,
            ts_end: 10_000,
            target_shed_kw: 0.0,
            incentive_per_kwh: incentive,
            penalty_per_kwh: penalty,
            is_active: true,
        }
    }

    #[test]
    fn no_program_passes_headroom_through() {
        let adj = apply_dr_policy(None, 10.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 10.0);
        assert_eq!(adj.reason, None);
    }

    #[test]
    fn negative_raw_headroom_clamps_to_zero() {
        let adj = apply_dr_policy(None, -3.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 0.0);
    }

    #[test]
    fn fixed_cap_subtracts_the_shed_target() {
        let program = fixed_cap(4.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 6.0);
        assert_eq!(adj.reason, Some(ReasonCode::DrShed));
        assert_eq!(adj.program_id.as_deref(), Some("p1"));
    }

    #[test]
    fn fixed_cap_never_goes_negative() {
        let program = fixed_cap(15.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 0.0);
    }

    #[test]
    fn program_outside_window_changes_nothing() {
        let program = fixed_cap(4.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 20_000, &cfg());
        assert_eq!(adj.effective_headroom_kw, 10.0);
        assert_eq!(adj.reason, None);
    }

    #[test]
    fn inactive_program_changes_nothing() {
        let mut program = fixed_cap(4.0);
        program.is_active = false;
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 10.0);
    }

    #[test]
    fn price_elastic_boosts_on_net_incentive() {
        let program = price_elastic(2.0, 0.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert!((adj.effective_headroom_kw - 12.0).abs() < 1e-9);
        assert_eq!(adj.reason, Some(ReasonCode::DrBoost));
    }

    #[test]
    fn price_elastic_sheds_on_net_penalty() {
        let program = price_elastic(0.0, 3.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert!((adj.effective_headroom_kw - 7.0).abs() < 1e-9);
        assert_eq!(adj.reason, Some(ReasonCode::DrShed));
    }

    #[test]
    fn price_elastic_factor_is_clipped_to_unit_range() {
        // Huge penalty: factor clamps at -1, headroom floors at zero.
        let program = price_elastic(0.0, 1_000.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert_eq!(adj.effective_headroom_kw, 0.0);

        // Huge incentive: factor clamps at +1, headroom at most doubles.
        let program = price_elastic(1_000.0, 0.0);
        let adj = apply_dr_policy(Some(&program), 10.0, 100, &cfg());
        assert!((adj.effective_headroom_kw - 20.0).abs() < 1e-9);
    }
}

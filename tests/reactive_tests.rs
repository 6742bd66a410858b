//! Reactive tests
//!
//! The decision engine on its own, fed hand-built notifications, and then
//! wired to the state machine through the relay.

mod common;

use common::*;
use leverage_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn changed(user: u64, state: PositionState, leverage: Decimal, health_factor: Decimal) -> PositionChangedEvent {
    PositionChangedEvent {
        user: UserId(user),
        current_leverage: Leverage::saturating(leverage),
        target_leverage: Leverage::saturating(dec!(2)),
        health_factor,
        min_health_factor: dec!(1.15),
        iteration: 1,
        max_iterations: 5,
        state,
        collateral_asset: WETH,
        execution_salt: None,
        take_profit_price: None,
        stop_loss_price: None,
    }
}

fn notify(event: PositionChangedEvent, height: u64) -> Notification {
    Notification::PositionChanged {
        event,
        height: BlockHeight(height),
    }
}

fn actions(instructions: &[Instruction]) -> Vec<(UserId, String)> {
    instructions.iter().map(|i| (i.user, i.action.name().to_string())).collect()
}

/// How a single PositionChanged maps to the next instruction.
mod classify_tests {
    use super::*;

    #[test]
    fn looping_below_target_gets_a_loop_step() {
        let mut engine = decision();
        let out = engine.handle(&notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), 1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action, Action::LoopStep);
    }

    #[test]
    fn looping_at_target_or_cap_gets_nothing() {
        let mut engine = decision();
        assert!(engine
            .handle(&notify(changed(1, PositionState::Looping, dec!(2), dec!(1.7)), 1))
            .is_empty());

        let mut capped = changed(2, PositionState::Looping, dec!(1.5), dec!(2));
        capped.iteration = 5;
        assert!(engine.handle(&notify(capped, 1)).is_empty());
    }

    #[test]
    fn looping_below_floor_gets_a_health_check() {
        let mut engine = decision();
        let out = engine.handle(&notify(changed(1, PositionState::Looping, dec!(1.8), dec!(1.1)), 1));
        assert_eq!(out[0].action, Action::HealthCheck);
    }

    #[test]
    fn unwinding_until_unlevered() {
        let mut engine = decision();
        let out = engine.handle(&notify(changed(1, PositionState::Unwinding, dec!(1.5), dec!(2)), 1));
        assert_eq!(out[0].action, Action::UnwindStep);

        assert!(engine
            .handle(&notify(changed(1, PositionState::Unwinding, dec!(1), Decimal::MAX), 2))
            .is_empty());
    }

    #[test]
    fn idle_unlevered_report_drops_tracking() {
        let mut engine = decision();
        engine.handle(&notify(changed(1, PositionState::Idle, dec!(2), dec!(1.7)), 1));
        assert!(engine.tracked(UserId(1)).is_some());

        engine.handle(&notify(changed(1, PositionState::Idle, dec!(1), Decimal::MAX), 2));
        assert!(engine.tracked(UserId(1)).is_none());
    }
}

/// Duplicate delivery and per-user pacing.
mod pacing_tests {
    use super::*;

    #[test]
    fn duplicate_notification_is_rate_limited() {
        let mut engine = decision();
        let n = notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), 7);
        assert_eq!(engine.handle(&n).len(), 1);
        assert!(engine.handle(&n).is_empty());

        // next block is fine again
        let later = notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), 8);
        assert_eq!(engine.handle(&later).len(), 1);
    }

    #[test]
    fn wider_window_holds_longer() {
        let mut engine = ReactiveDecisionEngine::new(DecisionConfig {
            min_height_delta: 3,
            ..decision_config()
        });
        let at = |h| notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), h);
        assert_eq!(engine.handle(&at(10)).len(), 1);
        assert!(engine.handle(&at(12)).is_empty());
        assert_eq!(engine.handle(&at(13)).len(), 1);
    }

    #[test]
    fn closed_position_does_not_pace_its_successor() {
        let mut engine = ReactiveDecisionEngine::new(DecisionConfig {
            min_height_delta: 3,
            ..decision_config()
        });
        assert_eq!(engine.handle(&notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), 10)).len(), 1);

        // closed and reopened inside the window
        engine.handle(&notify(changed(1, PositionState::Idle, dec!(1), Decimal::MAX), 11));
        assert!(engine.tracked(UserId(1)).is_none());
        let reopened = engine.handle(&notify(changed(1, PositionState::Looping, dec!(1.2), dec!(3)), 11));
        assert_eq!(actions(&reopened), vec![(UserId(1), "loop_step".to_string())]);
    }

    #[test]
    fn pacing_is_per_user() {
        let mut engine = decision();
        assert_eq!(engine.handle(&notify(changed(1, PositionState::Looping, dec!(1.5), dec!(2)), 3)).len(), 1);
        assert_eq!(engine.handle(&notify(changed(2, PositionState::Looping, dec!(1.5), dec!(2)), 3)).len(), 1);
    }
}

/// Critical operations wait for finality when enabled.
mod finality_tests {
    use super::*;

    fn gated() -> ReactiveDecisionEngine {
        ReactiveDecisionEngine::new(DecisionConfig {
            finality_enabled: true,
            finality_delay: 3,
            ..decision_config()
        })
    }

    #[test]
    fn emergency_unwind_waits_for_finality() {
        let mut engine = gated();
        let event = changed(1, PositionState::Emergency, dec!(2), dec!(1.1));
        assert!(engine.handle(&notify(event, 10)).is_empty());
        assert_eq!(engine.pending_critical(), 1);

        assert!(engine.handle(&Notification::Timer { height: BlockHeight(12) }).iter().all(|i| i.action != Action::UnwindStep));

        let released = engine.handle(&Notification::Timer { height: BlockHeight(13) });
        assert_eq!(actions(&released), vec![(UserId(1), "unwind_step".to_string())]);
        assert_eq!(engine.pending_critical(), 0);
    }

    #[test]
    fn repeated_reports_keep_first_sighting() {
        let mut engine = gated();
        assert!(engine
            .handle(&notify(changed(1, PositionState::Emergency, dec!(2), dec!(1.1)), 10))
            .is_empty());
        assert!(engine
            .handle(&notify(changed(1, PositionState::Emergency, dec!(1.9), dec!(1.1)), 12))
            .is_empty());
        let out = engine.handle(&notify(changed(1, PositionState::Emergency, dec!(1.8), dec!(1.1)), 13));
        assert_eq!(out[0].action, Action::UnwindStep);
    }

    #[test]
    fn routine_unwind_is_not_gated() {
        let mut engine = gated();
        let out = engine.handle(&notify(changed(1, PositionState::Unwinding, dec!(1.5), dec!(2)), 10));
        assert_eq!(out[0].action, Action::UnwindStep);
        assert_eq!(engine.pending_critical(), 0);
    }
}

/// Price syncs, approvals, timers and guardian failures.
mod signal_tests {
    use super::*;

    fn with_triggers(user: u64, leverage: Decimal) -> PositionChangedEvent {
        PositionChangedEvent {
            take_profit_price: Price::new(dec!(2200)),
            stop_loss_price: Price::new(dec!(1800)),
            ..changed(user, PositionState::Idle, leverage, dec!(1.7))
        }
    }

    fn sync(price: Decimal, height: u64) -> Notification {
        price_sync(WETH_POOL, Price::new_unchecked(price), BlockHeight(height))
    }

    #[test]
    fn first_sync_only_seeds_the_cache() {
        let mut engine = decision();
        engine.handle(&notify(with_triggers(1, dec!(2)), 1));
        assert!(engine.handle(&sync(dec!(1700), 2)).is_empty());
        assert_eq!(engine.cached_price(WETH_POOL), Price::new(dec!(1700)));
    }

    #[test]
    fn stop_loss_on_large_drop() {
        let mut engine = decision();
        engine.handle(&notify(with_triggers(1, dec!(2)), 1));
        engine.handle(&sync(dec!(2000), 2));

        let out = engine.handle(&sync(dec!(1750), 3));
        assert_eq!(actions(&out), vec![(UserId(1), "stop_loss".to_string())]);
    }

    #[test]
    fn take_profit_only_with_exposure() {
        let mut engine = decision();
        engine.handle(&notify(with_triggers(1, dec!(2)), 1));
        engine.handle(&notify(with_triggers(2, dec!(1)), 1));
        engine.handle(&sync(dec!(2000), 2));

        let out = engine.handle(&sync(dec!(2300), 3));
        // user 2 reported Idle at 1x and is no longer tracked
        assert_eq!(actions(&out), vec![(UserId(1), "take_profit".to_string())]);
    }

    #[test]
    fn small_moves_are_ignored() {
        let mut engine = decision();
        engine.handle(&notify(with_triggers(1, dec!(2)), 1));
        engine.handle(&sync(dec!(2000), 2));
        // 150 bps, under the 200 bps threshold
        assert!(engine.handle(&sync(dec!(1970), 3)).is_empty());
    }

    #[test]
    fn emergency_positions_skip_price_triggers() {
        let mut engine = decision();
        let event = PositionChangedEvent {
            state: PositionState::Emergency,
            ..with_triggers(1, dec!(1))
        };
        engine.handle(&notify(event, 1));
        engine.handle(&sync(dec!(2000), 2));
        assert!(engine.handle(&sync(dec!(1500), 3)).is_empty());
    }

    #[test]
    fn approval_opens_a_default_position() {
        let mut engine = decision();
        let approval = |owner: u64, token: AssetId, spender: Identity, amount: Decimal| Notification::ApprovalGranted {
            owner: UserId(owner),
            token,
            spender,
            amount: Amount::new(amount),
            height: BlockHeight(5),
        };

        assert!(engine.handle(&approval(1, USDC, STATE_MACHINE, dec!(1))).is_empty());
        assert!(engine.handle(&approval(1, WETH, Identity(42), dec!(1))).is_empty());
        assert!(engine.handle(&approval(1, WETH, STATE_MACHINE, dec!(0.00001))).is_empty());

        let out = engine.handle(&approval(1, WETH, STATE_MACHINE, dec!(1)));
        assert_eq!(
            out[0].action,
            Action::AutoDeposit {
                collateral_asset: WETH,
                amount: Amount::new(dec!(1)),
                target_leverage: dec!(2),
                max_iterations: 5,
            }
        );

        // an owner already being managed is left alone
        engine.handle(&notify(changed(2, PositionState::Idle, dec!(2), dec!(1.7)), 6));
        assert!(engine.handle(&approval(2, WETH, STATE_MACHINE, dec!(1))).is_empty());
    }

    #[test]
    fn timer_sweeps_stale_positions_first() {
        let mut engine = ReactiveDecisionEngine::new(DecisionConfig {
            sweep_batch_size: 2,
            ..decision_config()
        });
        for user in 1..=3 {
            engine.handle(&notify(changed(user, PositionState::Idle, dec!(2), dec!(1.7)), 1));
        }

        let first = engine.handle(&timer(BlockHeight(200)));
        assert_eq!(
            actions(&first),
            vec![
                (UserId(1), "health_check".to_string()),
                (UserId(2), "health_check".to_string())
            ]
        );

        let second = engine.handle(&timer(BlockHeight(201)));
        let users: Vec<UserId> = second.iter().map(|i| i.user).collect();
        assert_eq!(users[0], UserId(3));
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn liquidation_failure_forces_a_response() {
        let mut engine = decision();
        let failure = |user: u64, height: u64| Notification::LiquidationFailure {
            user: UserId(user),
            reason: "guardian timed out".to_string(),
            height: BlockHeight(height),
        };
        assert!(engine.handle(&failure(1, 2)).is_empty());

        engine.handle(&notify(changed(1, PositionState::Idle, dec!(2), dec!(1.3)), 3));
        let out = engine.handle(&failure(1, 4));
        assert_eq!(out[0].action, Action::LiquidationResponse);

        let tracked = engine.tracked(UserId(1)).unwrap();
        assert_eq!(tracked.state, PositionState::Emergency);
        assert_eq!(tracked.liquidation_failures, 1);
        assert_eq!(tracked.last_failure.as_deref(), Some("guardian timed out"));
    }

    #[test]
    fn owner_controls() {
        let mut engine = decision();
        assert_eq!(
            engine.set_finality_enabled(Identity(99), true),
            Err(DecisionError::NotOwner(Identity(99)))
        );
        engine.set_finality_enabled(OWNER, true).unwrap();
        engine.set_finality_delay(OWNER, 0).unwrap();
        engine.set_staleness_enabled(OWNER, false).unwrap();
        engine.set_stale_block_limit(OWNER, 5).unwrap();
        assert!(engine.config().finality_enabled);
        assert!(!engine.config().staleness_enabled);

        // zero delay releases critical ops immediately
        let out = engine.handle(&notify(changed(1, PositionState::Emergency, dec!(2), dec!(1.1)), 1));
        assert_eq!(out[0].action, Action::UnwindStep);
    }
}

/// The full loop: state machine, relay, decision engine.
mod relay_tests {
    use super::*;

    #[test]
    fn approval_to_target_and_back_to_close() {
        let mut sm = machine();
        let mut engine = decision();
        let mut relay = Relay::new(EXECUTOR).with_duplicate_delivery(true);
        let user = UserId(1);

        let approval = Notification::ApprovalGranted {
            owner: user,
            token: WETH,
            spender: STATE_MACHINE,
            amount: Amount::new(dec!(1)),
            height: sm.height(),
        };
        let opened = relay.relay(&mut sm, &mut engine, &approval);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].result, Ok(StepOutcome::Opened { user }));

        let report = relay.pump(&mut sm, &mut engine, 20);
        assert_eq!(report.failures().count(), 0);
        let p = sm.position(user).unwrap();
        assert_eq!(p.state, PositionState::Idle);
        assert_eq!(p.current_leverage.value(), dec!(2));
        // duplicates never doubled a step
        assert_eq!(p.current_iteration, 2);
        assert!(engine.tracked(user).is_some());

        sm.request_unwind(user).unwrap();
        let report = relay.pump(&mut sm, &mut engine, 20);
        assert_eq!(report.failures().count(), 0);
        assert!(sm.position(user).is_none());
        assert!(engine.tracked(user).is_none());
        assert!(sm.market().allowances_revoked(user));
    }

    #[test]
    fn salted_position_unwinds_through_the_relay() {
        let mut sm = machine();
        let mut engine = decision();
        let mut relay = Relay::new(EXECUTOR);
        let user = UserId(1);

        open_weth_usdc(&mut sm, user, dec!(1), dec!(2));
        relay.pump(&mut sm, &mut engine, 20);
        sm.set_execution_salt(user, Some(99)).unwrap();
        sm.request_unwind(user).unwrap();

        // every step presents the salt the last notification published
        let report = relay.pump(&mut sm, &mut engine, 20);
        assert_eq!(report.failures().count(), 0);
        assert!(report.succeeded() >= 2);
        assert!(sm.position(user).is_none());
    }

    #[test]
    fn price_crash_stops_out_through_the_relay() {
        let mut sm = machine();
        let mut engine = decision();
        let mut relay = Relay::new(EXECUTOR);
        let user = UserId(1);

        open_weth_usdc(&mut sm, user, dec!(1), dec!(2));
        relay.pump(&mut sm, &mut engine, 20);
        sm.set_risk_triggers(user, None, Price::new(dec!(1800))).unwrap();
        relay.pump(&mut sm, &mut engine, 5);

        let h = sm.height();
        relay.relay(&mut sm, &mut engine, &price_sync(WETH_POOL, Price::new_unchecked(dec!(2000)), h));
        set_weth_price(&mut sm, dec!(1750));
        let h = sm.height();
        let out = relay.relay(&mut sm, &mut engine, &price_sync(WETH_POOL, Price::new_unchecked(dec!(1750)), h));
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0].result,
            Ok(StepOutcome::Applied { state: PositionState::Emergency, .. })
        ));

        relay.pump(&mut sm, &mut engine, 20);
        assert!(sm.position(user).is_none());
    }

    #[test]
    fn batched_rounds_isolate_failures() {
        let mut sm = machine();
        let mut engine = decision();
        let mut relay = Relay::new(EXECUTOR).with_batching(true);
        for user in 1..=3 {
            open_weth_usdc(&mut sm, UserId(user), dec!(1), dec!(2));
        }
        sm.market_mut().fail_user(UserId(2));

        let report = relay.pump(&mut sm, &mut engine, 20);
        assert!(report.failures().all(|d| d.instruction.user == UserId(2)));
        assert_eq!(sm.position(UserId(1)).unwrap().state, PositionState::Idle);
        assert_eq!(sm.position(UserId(3)).unwrap().state, PositionState::Idle);
        assert_eq!(sm.position(UserId(2)).unwrap().current_iteration, 0);
        assert!(count_events(&sm, |e| matches!(e, EventPayload::BatchExecuted(_))) >= 1);
    }
}

//! End-to-end ledger scenarios: submission, approval ordering, settlement,
//! welcome bonuses and concurrent admin decisions.
mod common;

use std::sync::Barrier;

use anyhow::Context;
use coin_ledger::{
    LedgerError, ValidationError,
    notify::EventKind,
    transaction::{TransactionStatus, TransactionType},
    types::{Coins, TimeStamp},
};
use common::{ADMIN, COFFEE, Harness, coins};
use rust_decimal_macros::dec;

#[test]
fn earn_round_trip() -> anyhow::Result<()> {
    let h = Harness::new()?;

    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(1000)), TimeStamp::now(), None)
        .context("Earn failed on submit: ")?;

    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.kind, TransactionType::Earn);
    assert_eq!(tx.amount, coins(dec!(100)));

    let tx = h
        .ledger
        .approve_earn(&tx.id, ADMIN, Some("receipt checked"))
        .context("Earn failed on approval: ")?;

    assert_eq!(tx.status, TransactionStatus::Approved);
    assert_eq!(tx.processed_by.as_deref(), Some(ADMIN));
    assert!(tx.processed_at.is_some());

    let balance = h.ledger.balance("user_a")?;
    assert_eq!(balance.balance, coins(dec!(100)));
    assert_eq!(balance.total_earned, coins(dec!(100)));
    h.assert_invariant();
    Ok(())
}

#[test]
fn second_approval_does_not_credit_twice() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(500)), TimeStamp::now(), None)?;

    h.ledger.approve_earn(&tx.id, ADMIN, None)?;
    let again = h.ledger.approve_earn(&tx.id, ADMIN, None);

    assert!(matches!(
        again,
        Err(LedgerError::InvalidState {
            status: TransactionStatus::Approved,
            ..
        })
    ));
    assert_eq!(h.ledger.balance("user_a")?.total_earned, coins(dec!(50)));

    // a rejection after approval is just as illegal
    let reject = h.ledger.reject_earn(&tx.id, ADMIN, "too late");
    assert!(matches!(reject, Err(LedgerError::InvalidState { .. })));
    Ok(())
}

#[test]
fn redeem_without_balance_is_never_persisted() -> anyhow::Result<()> {
    let h = Harness::new()?;

    let err = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(200)), coins(dec!(50)))
        .unwrap_err();

    match err {
        LedgerError::ValidationFailed(errors) => {
            assert!(errors.contains(&ValidationError::InsufficientBalance {
                available: Coins::ZERO,
                requested: coins(dec!(50)),
            }));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
    assert_eq!(h.ledger.transaction_history("user_a", 1, 10)?.total, 0);
    assert_eq!(h.ledger.transaction_stats()?.total_transactions, 0);
    Ok(())
}

#[test]
fn redeem_waits_for_pending_earn_approval() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(500))?;

    let redeem = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(250)), coins(dec!(100)))?;
    let earn = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(800)), TimeStamp::now(), None)?;
    assert_eq!(earn.amount, coins(dec!(80)));

    let blocked = h.ledger.approve_redeem(&redeem.id, ADMIN, None);
    assert!(matches!(
        blocked,
        Err(LedgerError::OrderingViolation { pending_earns: 1, .. })
    ));
    assert!(blocked.unwrap_err().is_retryable());
    assert_eq!(
        h.ledger.transaction(&redeem.id)?.status,
        TransactionStatus::Pending
    );
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(500)));

    h.ledger.approve_earn(&earn.id, ADMIN, None)?;
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(580)));

    let processed = h.ledger.approve_redeem(&redeem.id, ADMIN, None)?;
    assert_eq!(processed.status, TransactionStatus::Processed);

    let balance = h.ledger.balance("user_a")?;
    assert_eq!(balance.balance, coins(dec!(480)));
    assert_eq!(balance.total_redeemed, coins(dec!(100)));
    h.assert_invariant();
    Ok(())
}

#[test]
fn rejected_earn_also_unblocks_redeem() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(500))?;

    let redeem = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(250)), coins(dec!(100)))?;
    let earn = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(800)), TimeStamp::now(), None)?;

    h.ledger.reject_earn(&earn.id, ADMIN, "receipt unreadable")?;
    h.ledger.approve_redeem(&redeem.id, ADMIN, None)?;

    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(400)));
    Ok(())
}

#[test]
fn another_users_pending_earn_does_not_block() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(100))?;

    let redeem = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(100)), coins(dec!(40)))?;
    h.ledger
        .submit_earn("user_b", COFFEE, coins(dec!(300)), TimeStamp::now(), None)?;

    h.ledger.approve_redeem(&redeem.id, ADMIN, None)?;
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(60)));
    Ok(())
}

#[test]
fn approval_rechecks_balance() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(100))?;

    let first = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(100)), coins(dec!(80)))?;
    let second = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(100)), coins(dec!(80)))?;

    h.ledger.approve_redeem(&first.id, ADMIN, None)?;
    let err = h.ledger.approve_redeem(&second.id, ADMIN, None).unwrap_err();

    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    // the refused approval left the request pending
    assert_eq!(
        h.ledger.transaction(&second.id)?.status,
        TransactionStatus::Pending
    );
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(20)));
    h.assert_invariant();
    Ok(())
}

#[test]
fn concurrent_approvals_credit_once() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(1000)), TimeStamp::now(), None)?;

    let barrier = Barrier::new(2);
    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let (ledger, barrier, id) = (&h.ledger, &barrier, tx.id.as_str());
                s.spawn(move || {
                    barrier.wait();
                    ledger.approve_earn(id, &format!("admin_{i}"), None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let invalid = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::InvalidState { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(invalid, 1);

    let balance = h.ledger.balance("user_a")?;
    assert_eq!(balance.total_earned, coins(dec!(100)));
    assert_eq!(balance.balance, coins(dec!(100)));
    Ok(())
}

#[test]
fn concurrent_redeems_never_overdraw() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(100))?;

    let ids: Vec<String> = (0..4)
        .map(|_| {
            h.ledger
                .submit_redeem("user_a", COFFEE, coins(dec!(100)), coins(dec!(40)))
                .map(|tx| tx.id)
        })
        .collect::<Result<_, _>>()?;

    let barrier = Barrier::new(ids.len());
    let successes = std::thread::scope(|s| {
        let handles: Vec<_> = ids
            .iter()
            .map(|id| {
                let (ledger, barrier) = (&h.ledger, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    ledger.approve_redeem(id, ADMIN, None)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count()
    });

    assert_eq!(successes, 2);
    let balance = h.ledger.balance("user_a")?;
    assert_eq!(balance.balance, coins(dec!(20)));
    h.assert_invariant();
    Ok(())
}

#[test]
fn welcome_bonus_is_granted_once() -> anyhow::Result<()> {
    let h = Harness::new()?;
    assert_eq!(h.ledger.balance("user_x")?.balance, Coins::ZERO);

    let bonus = h.ledger.grant_welcome_bonus("user_x")?;
    assert_eq!(bonus.kind, TransactionType::WelcomeBonus);
    assert_eq!(bonus.status, TransactionStatus::Approved);
    assert_eq!(h.ledger.balance("user_x")?.balance, coins(dec!(100)));

    let again = h.ledger.grant_welcome_bonus("user_x");
    assert!(matches!(again, Err(LedgerError::AlreadyGranted(ref u)) if u == "user_x"));
    assert_eq!(h.ledger.balance("user_x")?.balance, coins(dec!(100)));
    assert!(h.ledger.balance_summary("user_x")?.welcome_bonus_granted);
    Ok(())
}

#[test]
fn redeem_is_paid_exactly_once() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(300))?;

    let redeem = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(500)), coins(dec!(120)))?;

    // not yet approved
    let early = h
        .ledger
        .process_payment(&redeem.id, ADMIN, "UPI-001", "upi", coins(dec!(120)), None);
    assert!(matches!(
        early,
        Err(LedgerError::InvalidState {
            status: TransactionStatus::Pending,
            ..
        })
    ));

    h.ledger.approve_redeem(&redeem.id, ADMIN, None)?;

    let short = h
        .ledger
        .process_payment(&redeem.id, ADMIN, "UPI-001", "upi", coins(dec!(119.5)), None);
    assert!(matches!(short, Err(LedgerError::AmountMismatch { .. })));

    let paid = h.ledger.process_payment(
        &redeem.id,
        ADMIN,
        "UPI-001",
        "upi",
        coins(dec!(120.005)),
        Some("paid same day"),
    )?;
    assert_eq!(paid.status, TransactionStatus::Paid);
    assert_eq!(paid.payment_transaction_id.as_deref(), Some("UPI-001"));
    assert!(paid.payment_processed_at.is_some());
    let notes = paid.admin_notes.unwrap_or_default();
    assert!(notes.contains("[payment] method=upi amount=120.005 reference=UPI-001"));
    assert!(notes.contains("paid same day"));

    let again = h
        .ledger
        .process_payment(&redeem.id, ADMIN, "UPI-002", "upi", coins(dec!(120)), None);
    assert!(matches!(
        again,
        Err(LedgerError::InvalidState {
            status: TransactionStatus::Paid,
            ..
        })
    ));

    // settlement does not touch the balance a second time
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(180)));
    Ok(())
}

#[test]
fn payment_reference_is_globally_unique() -> anyhow::Result<()> {
    let h = Harness::new()?;
    h.fund("user_a", dec!(100))?;
    h.fund("user_b", dec!(100))?;

    let a = h
        .ledger
        .submit_redeem("user_a", COFFEE, coins(dec!(100)), coins(dec!(50)))?;
    let b = h
        .ledger
        .submit_redeem("user_b", COFFEE, coins(dec!(100)), coins(dec!(50)))?;
    h.ledger.approve_redeem(&a.id, ADMIN, None)?;
    h.ledger.approve_redeem(&b.id, ADMIN, None)?;

    h.ledger
        .process_payment(&a.id, ADMIN, "BANK-77", "bank", coins(dec!(50)), None)?;
    let dup = h
        .ledger
        .process_payment(&b.id, ADMIN, "BANK-77", "bank", coins(dec!(50)), None);

    assert!(matches!(dup, Err(LedgerError::DuplicatePaymentReference(ref r)) if r == "BANK-77"));
    assert_eq!(h.ledger.transaction(&b.id)?.status, TransactionStatus::Processed);
    Ok(())
}

#[test]
fn payment_input_is_validated() -> anyhow::Result<()> {
    let h = Harness::new()?;

    let err = h
        .ledger
        .process_payment("tx1unknown", ADMIN, "  ", "", coins(dec!(0)), None)
        .unwrap_err();

    match err {
        LedgerError::ValidationFailed(errors) => assert_eq!(errors.len(), 3),
        other => panic!("expected validation failure, got {other:?}"),
    }

    let missing = h
        .ledger
        .process_payment("tx1unknown", ADMIN, "REF", "upi", coins(dec!(1)), None);
    assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    Ok(())
}

#[test]
fn rejection_needs_notes() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(100)), TimeStamp::now(), None)?;

    let err = h.ledger.reject_earn(&tx.id, ADMIN, "   ").unwrap_err();
    assert!(matches!(err, LedgerError::ValidationFailed(_)));
    assert!(h.ledger.transaction(&tx.id)?.is_pending());

    let rejected = h.ledger.reject_earn(&tx.id, ADMIN, "duplicate receipt")?;
    assert_eq!(rejected.status, TransactionStatus::Rejected);
    assert_eq!(rejected.admin_notes.as_deref(), Some("duplicate receipt"));
    assert_eq!(h.ledger.balance("user_a")?.balance, Coins::ZERO);
    Ok(())
}

#[test]
fn wrong_kind_is_invalid_state() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let earn = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(100)), TimeStamp::now(), None)?;

    let err = h.ledger.approve_redeem(&earn.id, ADMIN, None).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidState {
            kind: TransactionType::Earn,
            ..
        }
    ));
    assert!(matches!(
        h.ledger.approve_earn("tx1missing", ADMIN, None),
        Err(LedgerError::NotFound(_))
    ));
    Ok(())
}

#[test]
fn notifications_follow_commits() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(100)), TimeStamp::now(), None)?;
    assert!(h.dispatcher.kinds().is_empty());

    h.ledger.approve_earn(&tx.id, ADMIN, None)?;
    h.ledger.grant_welcome_bonus("user_a")?;

    assert_eq!(
        h.dispatcher.kinds(),
        vec![EventKind::EarnApproved, EventKind::WelcomeBonusGranted]
    );

    // a refused decision queues nothing
    let _ = h.ledger.approve_earn(&tx.id, ADMIN, None);
    assert_eq!(h.dispatcher.kinds().len(), 2);
    Ok(())
}

#[test]
fn failing_notifications_do_not_fail_approval() -> anyhow::Result<()> {
    let h = Harness::new()?;
    *h.dispatcher.fail.lock().unwrap() = true;

    let tx = h
        .ledger
        .submit_earn("user_a", COFFEE, coins(dec!(100)), TimeStamp::now(), None)?;
    let approved = h.ledger.approve_earn(&tx.id, ADMIN, None)?;
    assert_eq!(approved.status, TransactionStatus::Approved);
    assert_eq!(h.ledger.balance("user_a")?.balance, coins(dec!(10)));

    *h.dispatcher.fail.lock().unwrap() = false;
    let report = h.ledger.flush_notifications()?;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.dispatcher.kinds(), vec![EventKind::EarnApproved]);
    Ok(())
}

#[test]
fn concurrent_approvals_notify_each_user_once() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let users = ["user_a", "user_b", "user_c", "user_d"];
    let ids: Vec<String> = users
        .iter()
        .map(|user| {
            h.ledger
                .submit_earn(user, COFFEE, coins(dec!(100)), TimeStamp::now(), None)
                .map(|tx| tx.id)
        })
        .collect::<Result<_, _>>()?;

    let barrier = Barrier::new(ids.len());
    std::thread::scope(|s| {
        for id in &ids {
            let (ledger, barrier) = (&h.ledger, &barrier);
            s.spawn(move || {
                barrier.wait();
                ledger.approve_earn(id, ADMIN, None).unwrap();
            });
        }
    });
    // anything a commit left behind goes out here, still only once
    h.ledger.flush_notifications()?;

    let events = h.dispatcher.events.lock().unwrap().clone();
    let mut notified: Vec<_> = events.iter().map(|(user, _)| user.as_str()).collect();
    notified.sort();
    assert_eq!(notified, users);
    assert!(events.iter().all(|(_, kind)| *kind == EventKind::EarnApproved));
    Ok(())
}

#[test]
fn concurrent_first_reads_share_one_balance() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let barrier = Barrier::new(8);

    let seen: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (ledger, barrier) = (&h.ledger, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    ledger.balance("new_user")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let seen = seen.into_iter().collect::<Result<Vec<_>, _>>()?;
    assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(h.ledger.balances()?.len(), 1);
    Ok(())
}

#[test]
fn first_read_racing_approval_keeps_the_credit() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let tx = h
        .ledger
        .submit_earn("new_user", COFFEE, coins(dec!(100)), TimeStamp::now(), None)?;

    let barrier = Barrier::new(5);
    std::thread::scope(|s| {
        let (ledger, barrier, id) = (&h.ledger, &barrier, tx.id.as_str());
        s.spawn(move || {
            barrier.wait();
            ledger.approve_earn(id, ADMIN, None).unwrap();
        });
        for _ in 0..4 {
            s.spawn(move || {
                barrier.wait();
                ledger.balance("new_user").unwrap();
            });
        }
    });

    let balance = h.ledger.balance("new_user")?;
    assert_eq!(balance.balance, coins(dec!(10)));
    assert_eq!(balance.total_earned, coins(dec!(10)));
    assert_eq!(h.ledger.balances()?.len(), 1);
    h.assert_invariant();
    Ok(())
}

#[test]
fn concurrent_duplicate_submissions_record_one() -> anyhow::Result<()> {
    let h = Harness::new()?;
    let barrier = Barrier::new(6);

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (ledger, barrier) = (&h.ledger, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    ledger.submit_earn("user_a", COFFEE, coins(dec!(100)), TimeStamp::now(), None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let recorded = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| {
            matches!(r, Err(LedgerError::ValidationFailed(errors))
                if errors.contains(&ValidationError::DuplicateSubmission {
                    brand_id: COFFEE.into(),
                    cooldown_minutes: 5,
                }))
        })
        .count();
    assert_eq!(recorded, 1);
    assert_eq!(duplicates, 5);
    assert_eq!(h.ledger.balance_summary("user_a")?.pending_earn_count, 1);
    Ok(())
}

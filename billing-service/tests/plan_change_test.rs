//! Mid-cycle plan change tests.

mod common;

use billing_service::billing::change_plan;
use billing_service::models::BillingRunKind;
use common::*;
use service_core::error::AppError;

#[tokio::test]
async fn midpoint_switch_settles_half_the_old_price() {
    let h = harness(false, GatewayBehavior::Confirm);
    // April has 30 days, so the 16th at midnight is exactly the midpoint.
    let (subscription_id, _) = seed_subscription(
        &h.store,
        monthly_plan("Basic", "1000"),
        utc(2024, 4, 1, 0, 0, 0),
    );
    let new_plan_id = h.store.insert_plan(monthly_plan("Premium", "3000"));

    let outcome = change_plan(
        h.store.as_ref(),
        subscription_id,
        new_plan_id,
        utc(2024, 4, 16, 0, 0, 0),
        3,
    )
    .await
    .unwrap();

    let settlement = outcome.settlement.expect("old plan owed half a cycle");
    assert_eq!(settlement.amount, dec("500.00"));
    assert_eq!(settlement.period_start, utc(2024, 4, 1, 0, 0, 0));
    assert_eq!(settlement.period_end, utc(2024, 4, 16, 0, 0, 0));

    let details = settlement.breakdown().unwrap();
    assert_eq!(details.proration_ratio, 0.5);
    assert!(details.note.unwrap().contains("mid-cycle"));

    let subscription = h.store.subscription(subscription_id);
    assert_eq!(subscription.plan_id, new_plan_id);
    assert_eq!(subscription.last_billed_at, Some(utc(2024, 4, 16, 0, 0, 0)));
    assert!(!subscription.mid_cycle_plan_change);
}

#[tokio::test]
async fn switch_already_settled_creates_no_invoice() {
    let h = harness(false, GatewayBehavior::Confirm);
    let plan_id = h.store.insert_plan(monthly_plan("Basic", "1000"));
    let user_id = h.store.insert_subscriber(subscriber("254700000010"));
    let mut sub = subscription(user_id, plan_id, utc(2024, 4, 1, 0, 0, 0));
    sub.last_billed_at = Some(utc(2024, 4, 16, 0, 0, 0));
    let subscription_id = h.store.insert_subscription(sub);
    let new_plan_id = h.store.insert_plan(monthly_plan("Premium", "3000"));

    // Switching at an instant the cursor already covers owes nothing.
    let outcome = change_plan(
        h.store.as_ref(),
        subscription_id,
        new_plan_id,
        utc(2024, 4, 10, 0, 0, 0),
        3,
    )
    .await
    .unwrap();

    assert!(outcome.settlement.is_none());
    let subscription = h.store.subscription(subscription_id);
    assert_eq!(subscription.plan_id, new_plan_id);
    // The cursor never moves backwards.
    assert_eq!(subscription.last_billed_at, Some(utc(2024, 4, 16, 0, 0, 0)));
}

#[tokio::test]
async fn next_pass_prorates_the_new_plan_from_the_switch() {
    let h = harness(false, GatewayBehavior::Confirm);
    let (subscription_id, _) = seed_subscription(
        &h.store,
        monthly_plan("Basic", "1000"),
        utc(2024, 4, 1, 0, 0, 0),
    );
    let new_plan_id = h.store.insert_plan(monthly_plan("Premium", "3000"));

    change_plan(
        h.store.as_ref(),
        subscription_id,
        new_plan_id,
        utc(2024, 4, 16, 0, 0, 0),
        3,
    )
    .await
    .unwrap();

    let summary = h
        .driver
        .run_pass(utc(2024, 5, 1, 0, 0, 0), BillingRunKind::Scheduled)
        .await
        .unwrap();
    assert_eq!(summary.invoices, 1);

    // Settlement invoice plus the new plan's first, half-cycle invoice.
    let mut invoices = h.store.invoices_for(subscription_id);
    invoices.sort_by_key(|i| i.period_end);
    assert_eq!(invoices.len(), 2);

    let first_regular = &invoices[1];
    assert_eq!(first_regular.amount, dec("1500.00"));
    let details = first_regular.breakdown().unwrap();
    assert_eq!(details.plan_price, dec("3000"));
    assert_eq!(details.proration_ratio, 0.5);
}

#[tokio::test]
async fn inactive_subscription_cannot_change_plan() {
    let h = harness(false, GatewayBehavior::Confirm);
    let plan_id = h.store.insert_plan(monthly_plan("Basic", "1000"));
    let user_id = h.store.insert_subscriber(subscriber("254700000011"));
    let mut sub = subscription(user_id, plan_id, utc(2024, 4, 1, 0, 0, 0));
    sub.active = false;
    let subscription_id = h.store.insert_subscription(sub);
    let new_plan_id = h.store.insert_plan(monthly_plan("Premium", "3000"));

    let result = change_plan(
        h.store.as_ref(),
        subscription_id,
        new_plan_id,
        utc(2024, 4, 16, 0, 0, 0),
        3,
    )
    .await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn switch_to_retired_plan_is_rejected() {
    let h = harness(false, GatewayBehavior::Confirm);
    let (subscription_id, _) = seed_subscription(
        &h.store,
        monthly_plan("Basic", "1000"),
        utc(2024, 4, 1, 0, 0, 0),
    );
    let mut retired = monthly_plan("Legacy", "800");
    retired.is_active = false;
    let retired_id = h.store.insert_plan(retired);

    let result = change_plan(
        h.store.as_ref(),
        subscription_id,
        retired_id,
        utc(2024, 4, 16, 0, 0, 0),
        3,
    )
    .await;

    assert!(matches!(result, Err(AppError::Conflict(_))));
    assert!(h.store.invoices_for(subscription_id).is_empty());
}

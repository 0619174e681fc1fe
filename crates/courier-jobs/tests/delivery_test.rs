//! Delivery worker, retry scheduler and cleanup against the in-memory store.

mod common;

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use uuid::Uuid;

use common::Harness;
use courier_db::{
    AttemptUpdate, CallContext, Channel, ChannelToggles, Clock, CreateNotificationRequest,
    DeliveryLogRepository, DeliveryStatus, DriverError, NewDeliveryAttempt, NotificationFilter,
    NotificationRepository, SendWithTemplateRequest, UpdatePreferencesRequest, UserContact,
};
use courier_jobs::{ChannelOutcome, WorkerConfig};

fn shipped(user: Uuid) -> SendWithTemplateRequest {
    SendWithTemplateRequest::new(user, "order_shipped").with_var("order_number", "A-100")
}

async fn notification(h: &Harness, id: Uuid) -> courier_db::Notification {
    NotificationRepository::get_by_id(&h.store, id)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_disabled_channel_never_attempted_and_in_app_marks_sent() {
    let h = Harness::new();
    h.template(vec![Channel::InApp, Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();

    let mut map = BTreeMap::new();
    map.insert("order_status".to_string(), ChannelToggles::new(true, false, false));
    h.dispatch
        .preferences
        .update(
            user,
            UpdatePreferencesRequest {
                preferences: Some(map),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    assert_eq!(n.channels, vec![Channel::InApp]);
    assert!(!n.is_sent);

    let pass = h.runner.delivery().run_pass(&ctx).await.unwrap();
    assert_eq!(pass.notifications, 1);
    assert_eq!(pass.marked_sent, 1);

    let attempts = h.store.all_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].channel, Channel::InApp);
    assert_eq!(attempts[0].status, DeliveryStatus::Sent);
    assert_eq!(h.email.call_count(), 0);

    let stored = notification(&h, n.id).await;
    assert!(stored.is_sent);
    assert_eq!(stored.sent_at, Some(h.clock.now()));
    assert_eq!(
        stored.delivery_status.get(&Channel::InApp),
        Some(&DeliveryStatus::Sent)
    );

    let again = h.runner.delivery().run_pass(&ctx).await.unwrap();
    assert_eq!(again.notifications, 0);
}

#[tokio::test]
async fn test_transient_failure_retried_after_backoff() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    let t0 = h.clock.now();

    h.email
        .fail_next(DriverError::transient("smtp_unavailable", "421 try later"));
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();

    h.runner.delivery().run_pass(&ctx).await.unwrap();
    let first = h.store.all_attempts();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].status, DeliveryStatus::Failed);
    assert_eq!(first[0].error_code.as_deref(), Some("smtp_unavailable"));
    assert_eq!(first[0].retry_after, Some(t0 + Duration::minutes(5)));
    assert!(!notification(&h, n.id).await.is_sent);

    h.clock.advance(Duration::minutes(4));
    let early = h.runner.retry().retry_failed(&ctx, 100).await.unwrap();
    assert_eq!(early.eligible, 0);

    h.clock.set(t0 + Duration::minutes(5) + Duration::seconds(1));
    let retry = h.runner.retry().retry_failed(&ctx, 100).await.unwrap();
    assert_eq!(retry.eligible, 1);
    assert_eq!(retry.sent, 1);

    let attempts = DeliveryLogRepository::list_by_notification(&h.store, n.id)
        .await
        .unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2]);
    assert_eq!(attempts[1].status, DeliveryStatus::Sent);
    assert_eq!(attempts[0].retry_after, None);
    assert!(notification(&h, n.id).await.is_sent);
    assert_eq!(h.email.call_count(), 2);
}

#[tokio::test]
async fn test_attempts_stop_at_cap_without_gaps() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    h.email
        .always_fail(DriverError::transient("http_503", "gateway down"));

    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    h.runner.delivery().run_pass(&ctx).await.unwrap();

    for _ in 0..5 {
        h.clock.advance(Duration::hours(1));
        h.runner.retry().retry_failed(&ctx, 100).await.unwrap();
    }

    let attempts = DeliveryLogRepository::list_by_notification(&h.store, n.id)
        .await
        .unwrap();
    let numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(attempts.iter().all(|a| a.status == DeliveryStatus::Failed));
    assert_eq!(attempts[2].retry_after, None);
    assert!(!notification(&h, n.id).await.is_sent);
}

#[tokio::test]
async fn test_second_backoff_doubles() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    h.email
        .fail_times(2, DriverError::transient("timeout", "slow"));

    h.dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    h.runner.delivery().run_pass(&ctx).await.unwrap();

    h.clock.advance(Duration::minutes(5));
    let t1 = h.clock.now();
    h.runner.retry().retry_failed(&ctx, 100).await.unwrap();
    let second = h
        .store
        .all_attempts()
        .into_iter()
        .find(|a| a.attempt_number == 2)
        .unwrap();
    assert_eq!(second.retry_after, Some(t1 + Duration::minutes(10)));

    h.clock.set(t1 + Duration::minutes(10) - Duration::seconds(1));
    assert_eq!(
        h.runner.retry().retry_failed(&ctx, 100).await.unwrap().eligible,
        0
    );
    h.clock.set(t1 + Duration::minutes(10) + Duration::seconds(1));
    assert_eq!(
        h.runner.retry().retry_failed(&ctx, 100).await.unwrap().sent,
        1
    );
}

#[tokio::test]
async fn test_permanent_failure_is_never_retried() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    h.email
        .fail_next(DriverError::permanent("invalid_recipient", "no such mailbox"));

    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    h.runner.delivery().run_pass(&ctx).await.unwrap();

    let attempts = h.store.all_attempts();
    assert_eq!(attempts[0].status, DeliveryStatus::Failed);
    assert_eq!(attempts[0].retry_after, None);

    h.clock.advance(Duration::days(1));
    let retry = h.runner.retry().retry_failed(&ctx, 100).await.unwrap();
    assert_eq!(retry.eligible, 0);
    let stored = notification(&h, n.id).await;
    assert!(!stored.is_sent);
    assert_eq!(
        stored.delivery_status.get(&Channel::Email),
        Some(&DeliveryStatus::Failed)
    );
}

#[tokio::test]
async fn test_missing_recipient_fails_channel_without_attempt() {
    let h = Harness::new();
    h.template(vec![Channel::InApp, Channel::Push]).await;
    let ctx = CallContext::background();
    let user = Uuid::new_v4();
    h.directory.insert(UserContact {
        user_id: user,
        email: Some("u@example.test".into()),
        phone: None,
        device_token: None,
    });
    let mut map = BTreeMap::new();
    map.insert("order_status".to_string(), ChannelToggles::new(true, true, true));
    h.dispatch
        .preferences
        .update(
            user,
            UpdatePreferencesRequest {
                preferences: Some(map),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    assert_eq!(n.channels, vec![Channel::InApp, Channel::Push]);

    let report = h.runner.delivery().deliver(&ctx, &n).await.unwrap();
    assert_eq!(
        report.channels,
        vec![
            (Channel::InApp, ChannelOutcome::Sent),
            (Channel::Push, ChannelOutcome::NoRecipient)
        ]
    );
    assert!(report.marked_sent);

    let attempts = h.store.all_attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(h.push.call_count(), 0);
    let stored = notification(&h, n.id).await;
    assert_eq!(
        stored.delivery_status.get(&Channel::Push),
        Some(&DeliveryStatus::Failed)
    );
}

#[tokio::test]
async fn test_channel_claimed_once() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();

    let first = h
        .runner
        .delivery()
        .send_attempt(&ctx, &n, Channel::Email, "u@example.test", 1)
        .await
        .unwrap();
    let second = h
        .runner
        .delivery()
        .send_attempt(&ctx, &n, Channel::Email, "u@example.test", 1)
        .await
        .unwrap();

    assert_eq!(first, ChannelOutcome::Sent);
    assert_eq!(second, ChannelOutcome::Claimed);
    assert_eq!(h.email.call_count(), 1);
}

#[tokio::test]
async fn test_rendered_snapshot_reaches_driver() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    h.dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();

    h.runner.delivery().run_pass(&ctx).await.unwrap();
    let calls = h.email.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].recipient, format!("{}@example.test", user.simple()));
    assert_eq!(calls[0].content.title, "Your order A-100 has shipped");
    assert_eq!(
        calls[0].content.text_body.as_deref(),
        Some("Order A-100 is on its way.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_driver_hits_send_deadline() {
    let h = Harness::new();
    let slow = courier_channels::MockDriver::new(Channel::Email).with_delay(StdDuration::from_secs(5));
    let worker = courier_jobs::DeliveryWorker::new(
        &courier_db::Repositories::from(&h.store),
        courier_channels::DriverRegistry::new().with_driver(std::sync::Arc::new(slow.clone())),
        std::sync::Arc::new(h.directory.clone()),
        std::sync::Arc::new(h.clock.clone()),
        WorkerConfig::default().with_send_timeout(StdDuration::from_secs(1)),
    );
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();

    let report = worker.deliver(&ctx, &n).await.unwrap();
    assert_eq!(report.channels, vec![(Channel::Email, ChannelOutcome::Failed)]);
    let attempts = h.store.all_attempts();
    assert_eq!(attempts[0].error_code.as_deref(), Some("deadline_exceeded"));
    assert!(attempts[0].retry_after.is_some());
    assert_eq!(slow.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_send_leaves_processing_row_for_reaper() {
    let h = Harness::new();
    let slow = courier_channels::MockDriver::new(Channel::Email).with_delay(StdDuration::from_secs(5));
    let worker = courier_jobs::DeliveryWorker::new(
        &courier_db::Repositories::from(&h.store),
        courier_channels::DriverRegistry::new().with_driver(std::sync::Arc::new(slow)),
        std::sync::Arc::new(h.directory.clone()),
        std::sync::Arc::new(h.clock.clone()),
        WorkerConfig::default(),
    );
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let user = h.user();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();

    let task_ctx = ctx.clone();
    let task = tokio::spawn(async move { worker.deliver(&task_ctx, &n).await });
    tokio::time::sleep(StdDuration::from_secs(1)).await;
    ctx.cancel();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.channels, vec![(Channel::Email, ChannelOutcome::Abandoned)]);

    let attempts = h.store.all_attempts();
    assert_eq!(attempts[0].status, DeliveryStatus::Processing);

    h.clock.advance(Duration::minutes(11));
    let reaped = h.runner.retry().reap_stale(100).await.unwrap();
    assert_eq!(reaped, 1);
    let attempt = h.store.all_attempts().remove(0);
    assert_eq!(attempt.status, DeliveryStatus::Failed);
    assert_eq!(attempt.error_code.as_deref(), Some("stale_processing"));
    assert_eq!(attempt.retry_after, Some(h.clock.now() + Duration::minutes(5)));
}

#[tokio::test]
async fn test_reaper_ignores_recent_attempts() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let ctx = CallContext::background();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(h.user()))
        .await
        .unwrap();
    let attempt = DeliveryLogRepository::append(
        &h.store,
        NewDeliveryAttempt {
            notification_id: n.id,
            channel: Channel::Email,
            attempt_number: 1,
            recipient: "u@example.test".into(),
            provider: None,
            max_retries: 3,
        },
        h.clock.now(),
    )
    .await
    .unwrap();
    DeliveryLogRepository::update(&h.store, attempt.id, AttemptUpdate::Processing, h.clock.now())
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(9));
    assert_eq!(h.runner.retry().reap_stale(100).await.unwrap(), 0);
}

#[tokio::test]
async fn test_expired_notification_skipped_and_cleaned() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let user = h.user();
    let mut req =
        CreateNotificationRequest::new(user, "system_alert", "Maintenance", "Tonight", vec![Channel::InApp]);
    req.expires_at = Some(h.clock.now() - Duration::seconds(1));
    h.dispatch.dispatcher.create_raw(&ctx, req).await.unwrap();

    let page = h
        .dispatch
        .inbox
        .list(user, &NotificationFilter::default())
        .await
        .unwrap();
    assert!(page.items.is_empty());

    let pass = h.runner.delivery().run_pass(&ctx).await.unwrap();
    assert_eq!(pass.notifications, 0);
    assert!(h.store.all_attempts().is_empty());

    let cleanup = h.runner.cleanup().run_pass().await;
    assert_eq!(cleanup.expired, 1);
    assert_eq!(h.store.notification_count(), 0);
}

#[tokio::test]
async fn test_cleanup_removes_old_read_and_closed_windows() {
    let h = Harness::new();
    h.template(vec![Channel::InApp]).await;
    let ctx = CallContext::background();
    let user = h.user();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(user))
        .await
        .unwrap();
    h.dispatch.inbox.mark_read(user, &[n.id]).await.unwrap();

    h.clock.advance(Duration::days(30));
    let early = h.runner.cleanup().run_pass().await;
    assert_eq!(early.old_read, 0);
    assert_eq!(early.rate_windows, 1);

    h.clock.advance(Duration::days(61));
    let late = h.runner.cleanup().run_pass().await;
    assert_eq!(late.old_read, 1);
    assert_eq!(h.store.notification_count(), 0);
}

#[tokio::test]
async fn test_missing_driver_is_transient() {
    let h = Harness::new();
    h.template(vec![Channel::Email]).await;
    let worker = courier_jobs::DeliveryWorker::new(
        &courier_db::Repositories::from(&h.store),
        courier_channels::DriverRegistry::in_app_only(),
        std::sync::Arc::new(h.directory.clone()),
        std::sync::Arc::new(h.clock.clone()),
        WorkerConfig::default(),
    );
    let ctx = CallContext::background();
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(&ctx, shipped(h.user()))
        .await
        .unwrap();

    worker.deliver(&ctx, &n).await.unwrap();
    let attempt = h.store.all_attempts().remove(0);
    assert_eq!(attempt.error_code.as_deref(), Some("provider_unavailable"));
    assert!(attempt.retry_after.is_some());
}

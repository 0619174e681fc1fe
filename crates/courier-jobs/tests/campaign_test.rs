//! Campaign orchestration and the job runner lifecycle.

mod common;

use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use common::{data, promo_week_template, Harness};
use courier_db::test_fixtures::reachable_user;
use courier_db::{
    CallContext, Campaign, CampaignStatus, CampaignTarget, Clock, CreateCampaignRequest,
    NotificationRepository,
};
use courier_jobs::{BatchOutcome, WorkerConfig, WorkerEvent};

fn promo_campaign(target: CampaignTarget) -> CreateCampaignRequest {
    CreateCampaignRequest {
        name: "Spring promo".into(),
        description: None,
        template_code: "promo_week".into(),
        target,
        channels: None,
        template_data: data("discount", "20%"),
        scheduled_at: None,
        batch_size: Some(2),
        batch_delay_seconds: Some(0),
        created_by: Some("marketing".into()),
    }
}

async fn setup_campaign(h: &Harness, target: CampaignTarget) -> Campaign {
    h.dispatch
        .templates
        .create(promo_week_template())
        .await
        .unwrap();
    h.dispatch
        .campaigns
        .create(promo_campaign(target))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_campaign_fans_out_in_batches_and_completes() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let users = vec![h.user(), h.user(), h.user()];
    let campaign = setup_campaign(
        &h,
        CampaignTarget::SpecificUsers {
            user_ids: users.clone(),
        },
    )
    .await;
    assert_eq!(campaign.status, CampaignStatus::Draft);
    h.dispatch.campaigns.start(campaign.id).await.unwrap();

    let pass = h.runner.campaigns().run_pass(&ctx).await.unwrap();
    assert_eq!(pass.batches, 2);
    assert_eq!(pass.completed, 1);

    let done = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.cursor, 3);
    assert_eq!(done.progress.processed, 3);
    assert_eq!(done.progress.sent + done.progress.failed, 3);
    assert_eq!(done.progress.sent, 3);
    assert_eq!(h.store.notification_count(), 3);

    for user in &users {
        let unread = NotificationRepository::unread_count(&h.store, *user, h.clock.now())
            .await
            .unwrap();
        assert_eq!(unread, 1);
    }

    let delivery = h.runner.delivery().run_pass(&ctx).await.unwrap();
    assert_eq!(delivery.marked_sent, 3);
    let delivered = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(delivered.progress.delivered, 3);
}

#[tokio::test]
async fn test_campaign_notifications_carry_rendered_content() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let user = h.user();
    let campaign = setup_campaign(
        &h,
        CampaignTarget::SpecificUsers {
            user_ids: vec![user],
        },
    )
    .await;
    h.dispatch.campaigns.start(campaign.id).await.unwrap();
    h.runner.campaigns().run_pass(&ctx).await.unwrap();

    let page = h
        .dispatch
        .inbox
        .list(user, &Default::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let n = &page.items[0];
    assert_eq!(n.title, "20% off this week");
    assert_eq!(n.campaign_id(), Some(campaign.id));
}

#[tokio::test]
async fn test_refused_sends_count_as_failed() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let reachable = h.user();
    let silenced = h.user();
    h.dispatch
        .preferences
        .update(
            silenced,
            courier_db::UpdatePreferencesRequest {
                do_not_disturb: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let campaign = setup_campaign(
        &h,
        CampaignTarget::SpecificUsers {
            user_ids: vec![reachable, silenced],
        },
    )
    .await;
    h.dispatch.campaigns.start(campaign.id).await.unwrap();
    h.runner.campaigns().run_pass(&ctx).await.unwrap();

    let done = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.progress.processed, 2);
    assert_eq!(done.progress.sent, 1);
    assert_eq!(done.progress.failed, 1);
}

#[tokio::test]
async fn test_segment_audience_comes_from_directory() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let vip = Uuid::new_v4();
    let other = Uuid::new_v4();
    h.directory
        .insert_with(reachable_user(vip), vec!["vip".into()], Default::default());
    h.directory
        .insert_with(reachable_user(other), vec!["new".into()], Default::default());

    let campaign = setup_campaign(
        &h,
        CampaignTarget::Segment {
            segment: "vip".into(),
        },
    )
    .await;
    h.dispatch.campaigns.start(campaign.id).await.unwrap();
    h.runner.campaigns().run_pass(&ctx).await.unwrap();

    let done = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(done.progress.processed, 1);
    let vip_unread = NotificationRepository::unread_count(&h.store, vip, h.clock.now())
        .await
        .unwrap();
    let other_unread = NotificationRepository::unread_count(&h.store, other, h.clock.now())
        .await
        .unwrap();
    assert_eq!((vip_unread, other_unread), (1, 0));
}

#[tokio::test]
async fn test_scheduled_campaign_promoted_when_due() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let user = h.user();
    h.dispatch
        .templates
        .create(promo_week_template())
        .await
        .unwrap();
    let mut req = promo_campaign(CampaignTarget::SpecificUsers {
        user_ids: vec![user],
    });
    req.scheduled_at = Some(h.clock.now() + Duration::hours(1));
    let campaign = h.dispatch.campaigns.create(req).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Scheduled);

    let early = h.runner.campaigns().run_pass(&ctx).await.unwrap();
    assert_eq!(early.promoted, 0);
    assert_eq!(h.store.notification_count(), 0);

    h.clock.advance(Duration::hours(2));
    let due = h.runner.campaigns().run_pass(&ctx).await.unwrap();
    assert_eq!(due.promoted, 1);
    assert_eq!(due.completed, 1);
    let done = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert!(done.started_at.is_some());
}

#[tokio::test]
async fn test_paused_campaign_stops_then_resumes_from_cursor() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let users = vec![h.user(), h.user(), h.user()];
    let campaign = setup_campaign(&h, CampaignTarget::SpecificUsers { user_ids: users }).await;
    h.dispatch.campaigns.start(campaign.id).await.unwrap();

    let first = h
        .runner
        .campaigns()
        .run_batch(&ctx, campaign.id)
        .await
        .unwrap();
    assert!(matches!(first, BatchOutcome::Processed(p) if p.processed == 2));

    h.dispatch.campaigns.pause(campaign.id).await.unwrap();
    let paused = h
        .runner
        .campaigns()
        .run_batch(&ctx, campaign.id)
        .await
        .unwrap();
    assert_eq!(paused, BatchOutcome::Stopped);
    assert_eq!(h.store.notification_count(), 2);

    h.dispatch.campaigns.resume(campaign.id).await.unwrap();
    let (batches, completed) = h
        .runner
        .campaigns()
        .run_campaign(&ctx, campaign.id)
        .await
        .unwrap();
    assert_eq!((batches, completed), (1, true));
    let done = h.dispatch.campaigns.get(campaign.id).await.unwrap();
    assert_eq!(done.progress.processed, 3);
    assert_eq!(h.store.notification_count(), 3);
}

#[tokio::test]
async fn test_cancelled_campaign_is_not_run() {
    let h = Harness::new();
    let ctx = CallContext::background();
    let campaign = setup_campaign(
        &h,
        CampaignTarget::SpecificUsers {
            user_ids: vec![h.user()],
        },
    )
    .await;
    h.dispatch.campaigns.start(campaign.id).await.unwrap();
    h.dispatch.campaigns.cancel(campaign.id).await.unwrap();

    let pass = h.runner.campaigns().run_pass(&ctx).await.unwrap();
    assert_eq!(pass.batches, 0);
    assert_eq!(h.store.notification_count(), 0);
}

#[tokio::test]
async fn test_runner_emits_events_and_stops_on_shutdown() {
    let h = Harness::with_config(
        WorkerConfig::default()
            .with_delivery_interval(StdDuration::from_millis(20))
            .with_retry_interval(StdDuration::from_millis(20))
            .with_cleanup_interval(StdDuration::from_millis(20))
            .with_campaign_interval(StdDuration::from_millis(20)),
    );
    let user = h.user();
    h.template(vec![courier_db::Channel::InApp]).await;
    let n = h
        .dispatch
        .dispatcher
        .send_with_template(
            &CallContext::background(),
            courier_db::SendWithTemplateRequest::new(user, "order_shipped")
                .with_var("order_number", "A-7"),
        )
        .await
        .unwrap();

    let runner = h.runner;
    let mut events = runner.events();
    let handle = runner.start();

    let started = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::DeliveryPassCompleted(pass)) if pass.marked_sent == 1 => {
                    return true
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(started);

    handle.shutdown().await.unwrap();
    let stopped = tokio::time::timeout(StdDuration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::WorkerStopped) => return true,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(stopped);
    handle.join().await.unwrap();

    let stored = NotificationRepository::get_by_id(&h.store, n.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_sent);
}

#[tokio::test]
async fn test_disabled_runner_returns_immediately() {
    let h = Harness::with_config(WorkerConfig::default().with_enabled(false));
    let handle = h.runner.start();
    tokio::time::timeout(StdDuration::from_secs(5), handle.join())
        .await
        .unwrap()
        .unwrap();
}

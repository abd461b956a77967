use chrono::TimeZone;
use shared::{
    domain::{NotificationKind, UserId},
    protocol::{ActorSummary, NotificationPayload},
};

use super::*;

const WINDOW: Duration = Duration::from_millis(150);

fn dispatcher() -> Arc<NotificationDispatcher> {
    NotificationDispatcher::new(WINDOW, 64)
}

fn notification(id: i64, read: bool) -> NotificationPayload {
    NotificationPayload {
        notification_id: NotificationId(id),
        recipient_id: UserId(1),
        kind: NotificationKind::ReactionAdded,
        actor: ActorSummary {
            user_id: UserId(2),
            display_name: "bob".to_string(),
        },
        metadata: serde_json::json!({"post_id": 7}),
        read,
        created_at: chrono::Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .expect("timestamp"),
    }
}

#[tokio::test(start_paused = true)]
async fn burst_coalesces_into_one_update() {
    let dispatcher = dispatcher();
    let mut updates = dispatcher.subscribe();

    dispatcher.ingest(notification(1, false));
    dispatcher.ingest(notification(2, false));
    dispatcher.ingest(notification(3, false));
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;

    let update = updates.try_recv().expect("one update");
    assert_eq!(update.notifications.len(), 3);
    assert!(update.refresh_needed);
    assert!(updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn duplicate_ids_collapse_to_the_latest_state() {
    let dispatcher = dispatcher();
    let mut updates = dispatcher.subscribe();

    dispatcher.ingest(notification(1, false));
    dispatcher.ingest(notification(2, false));
    dispatcher.ingest(notification(1, true));
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;

    let update = updates.try_recv().expect("one update");
    assert_eq!(update.notifications.len(), 2);
    // First-arrival position, latest state.
    assert_eq!(update.notifications[0].notification_id, NotificationId(1));
    assert!(update.notifications[0].read);
}

#[tokio::test(start_paused = true)]
async fn refresh_only_pushes_set_the_flag_without_payloads() {
    let dispatcher = dispatcher();
    let mut updates = dispatcher.subscribe();

    for _ in 0..5 {
        dispatcher.ingest_refresh();
    }
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;

    let update = updates.try_recv().expect("one update");
    assert!(update.notifications.is_empty());
    assert!(update.refresh_needed);
    assert!(updates.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn window_rearms_for_later_bursts() {
    let dispatcher = dispatcher();
    let mut updates = dispatcher.subscribe();

    dispatcher.ingest(notification(1, false));
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;
    let first = updates.try_recv().expect("first update");
    assert_eq!(first.notifications.len(), 1);

    dispatcher.ingest(notification(2, false));
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;
    let second = updates.try_recv().expect("second update");
    assert_eq!(second.notifications.len(), 1);
    assert_eq!(second.notifications[0].notification_id, NotificationId(2));
}

#[tokio::test(start_paused = true)]
async fn events_landing_inside_an_open_window_join_the_batch() {
    let dispatcher = dispatcher();
    let mut updates = dispatcher.subscribe();

    dispatcher.ingest(notification(1, false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.ingest(notification(2, false));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The window does not restart on later arrivals.
    let update = updates.try_recv().expect("one update");
    assert_eq!(update.notifications.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn every_subscriber_sees_the_same_batch() {
    let dispatcher = dispatcher();
    let mut badge = dispatcher.subscribe();
    let mut inbox = dispatcher.subscribe();
    let mut toast = dispatcher.subscribe();

    dispatcher.ingest(notification(1, false));
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;

    for surface in [&mut badge, &mut inbox, &mut toast] {
        let update = surface.try_recv().expect("update");
        assert_eq!(update.notifications.len(), 1);
        assert_eq!(update.notifications[0].notification_id, NotificationId(1));
    }
}

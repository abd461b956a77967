use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::*;

const STOP_DELAY: Duration = Duration::from_millis(1000);
const EXPIRY: Duration = Duration::from_millis(1200);

fn channel() -> (TypingChannel, UnboundedReceiver<ClientRequest>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(64);
    let channel = TypingChannel::new(outbound_tx, events, STOP_DELAY, EXPIRY);
    (channel, outbound_rx)
}

fn drain(rx: &mut UnboundedReceiver<ClientRequest>) -> Vec<ClientRequest> {
    let mut requests = Vec::new();
    while let Ok(request) = rx.try_recv() {
        requests.push(request);
    }
    requests
}

fn starts_and_stops(requests: &[ClientRequest]) -> (usize, usize) {
    requests.iter().fold((0, 0), |(starts, stops), request| {
        match request {
            ClientRequest::Typing {
                is_typing: true, ..
            } => (starts + 1, stops),
            ClientRequest::Typing {
                is_typing: false, ..
            } => (starts, stops + 1),
            _ => (starts, stops),
        }
    })
}

#[tokio::test(start_paused = true)]
async fn start_signal_fires_once_per_edge() {
    let (channel, mut rx) = channel();
    let conversation = ConversationId(1);

    channel.compose_changed(conversation, "h", "alice");
    channel.compose_changed(conversation, "he", "alice");
    channel.compose_changed(conversation, "hel", "alice");

    let (starts, stops) = starts_and_stops(&drain(&mut rx));
    assert_eq!(starts, 1);
    assert_eq!(stops, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_composer_stops_automatically() {
    let (channel, mut rx) = channel();
    let conversation = ConversationId(1);

    channel.compose_changed(conversation, "h", "alice");
    tokio::time::sleep(STOP_DELAY + Duration::from_millis(100)).await;

    let (starts, stops) = starts_and_stops(&drain(&mut rx));
    assert_eq!((starts, stops), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn keystrokes_push_the_stop_deadline_out() {
    let (channel, mut rx) = channel();
    let conversation = ConversationId(1);

    channel.compose_changed(conversation, "h", "alice");
    tokio::time::sleep(Duration::from_millis(600)).await;
    channel.compose_changed(conversation, "he", "alice");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // 1200 ms after the first keystroke, but only 600 ms after the second.
    let (_, stops) = starts_and_stops(&drain(&mut rx));
    assert_eq!(stops, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (_, stops) = starts_and_stops(&drain(&mut rx));
    assert_eq!(stops, 1);
}

#[tokio::test(start_paused = true)]
async fn clearing_the_input_stops_immediately_and_disarms_the_timer() {
    let (channel, mut rx) = channel();
    let conversation = ConversationId(1);

    channel.compose_changed(conversation, "h", "alice");
    channel.compose_changed(conversation, "", "alice");

    let (starts, stops) = starts_and_stops(&drain(&mut rx));
    assert_eq!((starts, stops), (1, 1));

    tokio::time::sleep(STOP_DELAY + Duration::from_millis(100)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn blur_without_an_outstanding_start_sends_nothing() {
    let (channel, mut rx) = channel();
    channel.compose_blur(ConversationId(1), "alice");
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_typist_expires_without_an_explicit_stop() {
    let (channel, _rx) = channel();
    let conversation = ConversationId(1);

    channel.observe(conversation, UserId(2), "bob".to_string(), true);
    assert_eq!(channel.active_typists(conversation), vec!["bob".to_string()]);

    tokio::time::sleep(EXPIRY + Duration::from_millis(100)).await;
    assert!(channel.active_typists(conversation).is_empty());
}

#[tokio::test(start_paused = true)]
async fn refreshed_signal_extends_visibility() {
    let (channel, _rx) = channel();
    let conversation = ConversationId(1);

    channel.observe(conversation, UserId(2), "bob".to_string(), true);
    tokio::time::sleep(Duration::from_millis(800)).await;
    channel.observe(conversation, UserId(2), "bob".to_string(), true);
    tokio::time::sleep(Duration::from_millis(800)).await;

    // 1600 ms since the first signal, 800 ms since the refresh.
    assert_eq!(channel.active_typists(conversation), vec!["bob".to_string()]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(channel.active_typists(conversation).is_empty());
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_removes_the_typist_at_once() {
    let (channel, _rx) = channel();
    let conversation = ConversationId(1);

    channel.observe(conversation, UserId(2), "bob".to_string(), true);
    channel.observe(conversation, UserId(2), "bob".to_string(), false);
    assert!(channel.active_typists(conversation).is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_typists_are_tracked_independently() {
    let (channel, _rx) = channel();
    let conversation = ConversationId(1);

    channel.observe(conversation, UserId(2), "bob".to_string(), true);
    tokio::time::sleep(Duration::from_millis(700)).await;
    channel.observe(conversation, UserId(3), "carol".to_string(), true);

    assert_eq!(
        channel.active_typists(conversation),
        vec!["bob".to_string(), "carol".to_string()]
    );

    // Only the older signal has lapsed 600 ms later.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        channel.active_typists(conversation),
        vec!["carol".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn local_composer_never_appears_in_the_visible_set() {
    let (channel, _rx) = channel();
    let conversation = ConversationId(1);

    channel.compose_changed(conversation, "typing away", "alice");
    channel.observe(conversation, UserId(2), "bob".to_string(), true);

    assert_eq!(channel.active_typists(conversation), vec!["bob".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn typing_sets_are_scoped_per_conversation() {
    let (channel, _rx) = channel();

    channel.observe(ConversationId(1), UserId(2), "bob".to_string(), true);
    assert!(channel.active_typists(ConversationId(2)).is_empty());
}

// Integration tests for the sync session
// Drive a session against the scripted REST fake and an in-memory channel

mod common;

use chrono::{Duration as ChronoDuration, Local, Utc};
use std::collections::HashMap;
use std::time::Duration;
use teamsync::sync::{ChannelState, SendRejection};
use teamsync::transport::{InboundEvent, OutboundEvent, SendFailure, StatusChange, TypingNotice};
use teamsync::{DeliveryState, Notice, SyncConfig, SyncError, SyncSession, UserStatus};

use common::*;

fn sent_messages(events: Vec<OutboundEvent>) -> Vec<(String, String)> {
    events
        .into_iter()
        .filter_map(|event| match event {
            OutboundEvent::SendMessage { content, client_id, .. } => Some((content, client_id)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_start_requires_a_confirmed_identity() {
    setup_logging();
    let connector = FakeConnector::new();
    let config = SyncConfig::new("http://localhost:5000");

    let result = SyncSession::start(config.clone(), FakeApi::new(), connector.clone(), None).await;
    assert!(matches!(result, Err(SyncError::AuthExpired(_))));

    let result = SyncSession::start(config.clone(), FakeApi::new(), connector.clone(), Some("  ".into())).await;
    assert!(matches!(result, Err(SyncError::AuthExpired(_))));

    let api = FakeApi::new();
    api.edit(|state| state.identity = None);
    let result = SyncSession::start(config, api, connector.clone(), Some("expired".into())).await;
    assert!(matches!(result, Err(SyncError::AuthExpired(_))));

    // The channel is never opened without an identity
    assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn test_start_loads_snapshots() {
    let api = FakeApi::new();
    api.edit(|state| {
        state.unread_total = 3;
        state.unread_by_sender = HashMap::from([(CY.to_string(), 3)]);
    });
    let (session, _notices, _channel) = connected_session(api.clone()).await;

    let view = session.view();
    assert_eq!(view.identity.as_ref().map(|me| me.id.as_str()), Some(ME));
    assert_eq!(view.channel, ChannelState::Connected);
    assert_eq!(view.users.len(), 2);
    assert_eq!(view.conversations.len(), 1);
    assert_eq!(view.unread_for(CY), 3);
    assert_eq!(view.total_unread, 3);
    assert_eq!(api.count("users"), 1);
    assert_eq!(api.count("conversations"), 1);
}

#[tokio::test]
async fn test_open_conversation_groups_history_by_day() {
    let api = FakeApi::new();
    let now = Utc::now();
    let first = now - ChronoDuration::seconds(1);
    api.edit(|state| {
        state.histories.insert(
            BEA.to_string(),
            vec![record("m1", BEA, ME, "hello", first), record("m2", ME, BEA, "hi", now)],
        );
    });
    let (mut session, _notices, _channel) = connected_session(api.clone()).await;
    let unread_fetches = api.count("unread_total");

    session.open_conversation_by_id(BEA).unwrap();
    let view = session.view();
    assert!(view.loading_history);
    assert!(view.history.is_empty());

    session.settle().await;
    let view = session.view();
    assert!(!view.loading_history);
    let days = view.days();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].label.to_string(), "Today");
    assert_eq!(days[0].entries.len(), 2);
    assert_eq!(days[0].entries[0].time_label, None);
    let expected = now.with_timezone(&Local).format("%H:%M").to_string();
    assert_eq!(days[0].entries[1].time_label.as_deref(), Some(expected.as_str()));

    // Loading a conversation refreshes the unread counters
    assert_eq!(api.count("unread_total"), unread_fetches + 1);
}

#[tokio::test]
async fn test_late_history_for_previous_conversation_is_dropped() {
    let api = FakeApi::new();
    api.edit(|state| {
        state.histories.insert(BEA.to_string(), vec![record("b1", BEA, ME, "from bea", at(20))]);
        state.histories.insert(CY.to_string(), vec![record("c1", CY, ME, "from cy", at(30))]);
    });
    let (mut session, _notices, _channel) = connected_session(api).await;

    session.open_conversation_by_id(BEA).unwrap();
    session.open_conversation_by_id(CY).unwrap();
    session.settle().await;

    let view = session.view();
    assert_eq!(view.active_peer.as_ref().map(|p| p.id.as_str()), Some(CY));
    let ids: Vec<&str> = view.history.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["c1"]);
}

#[tokio::test]
async fn test_messages_route_to_history_or_unread() {
    let api = FakeApi::new();
    api.edit(|state| {
        state.unread_total = 1;
        state.unread_by_sender = HashMap::from([(BEA.to_string(), 1)]);
    });
    let (mut session, _notices, _channel) = connected_session(api.clone()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;
    assert_eq!(session.view().unread_for(BEA), 1);
    let conversation_fetches = api.count("conversations");

    // From the open peer: appended once and marked read
    let incoming = record("m9", BEA, ME, "ping", Utc::now());
    session.handle_event(InboundEvent::MessageReceived(incoming.clone()));
    session.handle_event(InboundEvent::MessageReceived(incoming));
    session.settle().await;
    let view = session.view();
    assert_eq!(view.history.len(), 1);
    assert_eq!(api.count("read:m9"), 1);
    assert_eq!(view.unread_for(BEA), 0);
    assert_eq!(view.total_unread, 0);

    // From someone else: only their counter moves
    session.handle_event(InboundEvent::MessageReceived(record("m10", CY, ME, "psst", Utc::now())));
    session.settle().await;
    let view = session.view();
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.unread_for(CY), 1);
    assert_eq!(view.unread_for(BEA), 0);
    assert_eq!(view.total_unread, 1);
    assert_eq!(api.count("read:m10"), 0);

    // Every received message refreshes the conversation list
    assert_eq!(api.count("conversations"), conversation_fetches + 3);
}

#[tokio::test]
async fn test_read_receipts_floor_at_zero() {
    let api = FakeApi::new();
    api.edit(|state| {
        state.unread_total = 1;
        state.unread_by_sender = HashMap::from([(BEA.to_string(), 1)]);
    });
    let (mut session, _notices, _channel) = connected_session(api.clone()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.handle_event(InboundEvent::MessageReceived(record("m1", BEA, ME, "one", Utc::now())));
    session.handle_event(InboundEvent::MessageReceived(record("m2", BEA, ME, "two", Utc::now())));
    session.settle().await;

    assert_eq!(api.count("read:m1"), 1);
    assert_eq!(api.count("read:m2"), 1);
    let view = session.view();
    assert_eq!(view.unread_for(BEA), 0);
    assert_eq!(view.total_unread, 0);
}

#[tokio::test]
async fn test_failed_read_receipt_keeps_counter() {
    let api = FakeApi::new();
    api.edit(|state| {
        state.unread_total = 2;
        state.unread_by_sender = HashMap::from([(BEA.to_string(), 2)]);
        state.fail_mark_read = true;
    });
    let (mut session, mut notices, _channel) = connected_session(api).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.handle_event(InboundEvent::MessageReceived(record("m1", BEA, ME, "one", Utc::now())));
    session.settle().await;

    assert_eq!(session.view().unread_for(BEA), 2);
    assert!(drain_notices(&mut notices)
        .iter()
        .any(|n| matches!(n, Notice::NetworkFailure(_))));
}

#[tokio::test]
async fn test_send_while_sending_is_a_no_op() {
    let (mut session, _notices, mut channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.set_compose("hi");
    assert!(session.submit().is_ok());
    let view = session.view();
    assert!(view.sending);
    assert!(view.compose.is_empty());
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.history[0].delivery, DeliveryState::Pending);

    session.set_compose("again");
    assert_eq!(session.submit(), Err(SendRejection::AlreadySending));
    let view = session.view();
    assert_eq!(view.compose, "again");
    assert_eq!(view.history.len(), 1);

    let sent = sent_messages(channel.sent());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "hi");
}

#[tokio::test]
async fn test_send_requires_connection_and_conversation() {
    let (mut session, _notices, mut channel) = connected_session(FakeApi::new()).await;

    assert_eq!(session.send_text("hello"), Err(SendRejection::NoConversation));

    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;
    assert_eq!(session.send_text("   "), Err(SendRejection::EmptyContent));

    session.handle_event(InboundEvent::Disconnected("transport close".into()));
    assert_eq!(session.view().channel, ChannelState::Connecting);
    assert_eq!(session.send_text("hello"), Err(SendRejection::NotConnected));
    assert!(session.view().history.is_empty());
    assert!(channel.sent().is_empty());

    session.handle_event(InboundEvent::Connected);
    assert!(session.send_text("hello").is_ok());
}

#[tokio::test]
async fn test_acknowledgement_promotes_the_pending_entry() {
    let (mut session, _notices, mut channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.send_text("hi").unwrap();
    let (_, client_id) = sent_messages(channel.sent()).remove(0);

    let mut ack = record("srv1", ME, BEA, "hi", Utc::now());
    ack.client_id = Some(client_id);
    session.handle_event(InboundEvent::MessageSent(ack.clone()));
    session.handle_event(InboundEvent::MessageSent(ack));

    let view = session.view();
    assert!(!view.sending);
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.history[0].id, "srv1");
    assert_eq!(view.history[0].delivery, DeliveryState::Sent);

    // The lock is released, so the next send goes out
    assert!(session.send_text("next").is_ok());
}

#[tokio::test]
async fn test_message_error_marks_entry_and_retry_resends() {
    let (mut session, mut notices, mut channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.send_text("hi").unwrap();
    let (_, client_id) = sent_messages(channel.sent()).remove(0);
    session.handle_event(InboundEvent::MessageError(SendFailure {
        client_id: None,
        reason: "receiver not found".into(),
    }));

    let view = session.view();
    assert!(!view.sending);
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.history[0].delivery, DeliveryState::Error);
    assert!(drain_notices(&mut notices)
        .iter()
        .any(|n| matches!(n, Notice::SendFailure(_))));

    session.retry(&client_id).unwrap();
    let resent = sent_messages(channel.sent());
    assert_eq!(resent, vec![("hi".to_string(), client_id)]);
    let view = session.view();
    assert!(view.sending);
    assert_eq!(view.history.len(), 1);
    assert_eq!(view.history[0].delivery, DeliveryState::Pending);
}

#[tokio::test]
async fn test_stale_presence_is_discarded() {
    let (mut session, _notices, _channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.handle_event(InboundEvent::UserStatusChanged(StatusChange {
        user_id: BEA.into(),
        status: UserStatus::Offline,
        status_updated_at: Some(at(5)),
    }));
    let view = session.view();
    assert!(view.users.iter().all(|p| p.id != BEA || p.status == UserStatus::Online));

    session.handle_event(InboundEvent::UserStatusChanged(StatusChange {
        user_id: BEA.into(),
        status: UserStatus::Offline,
        status_updated_at: Some(at(20)),
    }));
    let view = session.view();
    for peer in view.users.iter().chain(view.conversations.iter()).filter(|p| p.id == BEA) {
        assert_eq!(peer.status, UserStatus::Offline);
        assert_eq!(peer.status_updated_at, Some(at(20)));
    }
    let active = view.active_peer.unwrap();
    assert_eq!(active.status, UserStatus::Offline);
    assert_eq!(active.status_updated_at, Some(at(20)));
}

#[tokio::test]
async fn test_streamed_presence_survives_older_snapshot() {
    let api = FakeApi::new();
    let (mut session, _notices, _channel) = connected_session(api.clone()).await;

    // No server stamp: arrival time is used
    session.handle_event(InboundEvent::UserStatusChanged(StatusChange {
        user_id: CY.into(),
        status: UserStatus::Online,
        status_updated_at: None,
    }));
    let stamped = session.view().users.iter().find(|p| p.id == CY).unwrap().status_updated_at;
    assert!(stamped.unwrap() > at(10));

    // A snapshot taken before the event must not roll it back
    session.refresh_catalog();
    session.settle().await;
    let view = session.view();
    let cy = view.users.iter().find(|p| p.id == CY).unwrap();
    assert_eq!(cy.status, UserStatus::Online);
    assert_eq!(cy.status_updated_at, stamped);
    assert_eq!(api.count("users"), 2);
}

#[tokio::test]
async fn test_own_status_change_from_another_device() {
    let (mut session, _notices, _channel) = connected_session(FakeApi::new()).await;
    session.handle_event(InboundEvent::UserStatusChanged(StatusChange {
        user_id: ME.into(),
        status: UserStatus::Online,
        status_updated_at: Some(at(50)),
    }));
    let me = session.view().identity.unwrap();
    assert_eq!(me.status, UserStatus::Online);
    assert_eq!(me.status_updated_at, Some(at(50)));
}

#[tokio::test]
async fn test_toggle_status_is_single_flight() {
    let api = FakeApi::new();
    let (mut session, _notices, _channel) = connected_session(api.clone()).await;
    let user_fetches = api.count("users");

    session.toggle_status();
    session.toggle_status();
    assert!(session.view().updating_status);
    session.settle().await;

    assert_eq!(api.count("status:online"), 1);
    let view = session.view();
    assert!(!view.updating_status);
    assert_eq!(view.identity.unwrap().status, UserStatus::Online);
    assert_eq!(api.count("users"), user_fetches + 1);

    session.toggle_status();
    session.settle().await;
    assert_eq!(api.count("status:offline"), 1);
}

#[tokio::test]
async fn test_failed_refresh_reports_network_failure() {
    let api = FakeApi::new();
    let (mut session, mut notices, _channel) = connected_session(api.clone()).await;
    api.edit(|state| state.fail_users = true);

    session.refresh_catalog();
    session.settle().await;

    // The previous snapshot stays
    assert_eq!(session.view().users.len(), 2);
    assert_eq!(
        drain_notices(&mut notices),
        vec![Notice::NetworkFailure("Failed to load users.".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_typing_notifications_are_debounced() {
    let (mut session, _notices, mut channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    for text in ["h", "he", "hel", "hell", "hello"] {
        session.set_compose(text);
        tokio::time::advance(Duration::from_millis(100)).await;
        session.fire_timers(tokio::time::Instant::now());
    }
    assert!(channel.sent().is_empty());

    tokio::time::advance(Duration::from_millis(400)).await;
    session.fire_timers(tokio::time::Instant::now());
    let sent = channel.sent();
    assert_eq!(sent, vec![OutboundEvent::Typing { receiver_id: BEA.to_string() }]);

    tokio::time::advance(Duration::from_secs(2)).await;
    session.fire_timers(tokio::time::Instant::now());
    assert!(channel.sent().is_empty());
    assert_eq!(session.next_deadline(), None);
}

#[tokio::test(start_paused = true)]
async fn test_peer_typing_flag_expires() {
    let (mut session, _notices, _channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    // Typing from someone else is ignored
    session.handle_event(InboundEvent::UserTyping(TypingNotice { user_id: CY.into() }));
    assert!(!session.view().peer_typing);

    session.handle_event(InboundEvent::UserTyping(TypingNotice { user_id: BEA.into() }));
    assert!(session.view().peer_typing);

    tokio::time::advance(Duration::from_millis(2900)).await;
    session.fire_timers(tokio::time::Instant::now());
    assert!(session.view().peer_typing);

    tokio::time::advance(Duration::from_millis(100)).await;
    session.fire_timers(tokio::time::Instant::now());
    assert!(!session.view().peer_typing);
}

#[tokio::test]
async fn test_auth_rejection_tears_the_session_down() {
    let api = FakeApi::new();
    let (mut session, mut notices, _channel) = connected_session(api.clone()).await;
    session.open_conversation_by_id(BEA).unwrap();

    session.handle_event(InboundEvent::AuthRejected("invalid token".into()));
    assert!(session.is_ended());
    assert!(drain_notices(&mut notices)
        .iter()
        .any(|n| matches!(n, Notice::AuthExpired(_))));

    // Nothing mutates state after teardown
    session.handle_event(InboundEvent::MessageReceived(record("m1", CY, ME, "late", Utc::now())));
    session.toggle_status();
    session.settle().await;
    let view = session.view();
    assert!(view.ended);
    assert!(view.identity.is_none());
    assert!(view.active_peer.is_none());
    assert!(view.users.is_empty());
    assert_eq!(view.total_unread, 0);
    assert_eq!(view.channel, ChannelState::Disconnected);
    assert_eq!(api.count("status:online"), 0);
}

#[tokio::test]
async fn test_run_loop_applies_channel_events_until_logout() {
    let api = FakeApi::new();
    let (session, _notices, channel) = connected_session(api).await;
    let mut views = session.subscribe();
    let (commands, command_rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = tokio::spawn(session.run(command_rx));

    channel
        .inbound
        .send(InboundEvent::MessageReceived(record("m1", CY, ME, "psst", Utc::now())))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), views.wait_for(|v| v.unread_for(CY) == 1))
        .await
        .expect("unread counter never moved")
        .expect("session dropped");

    commands.send(teamsync::Command::OpenConversation(CY.to_string())).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        views.wait_for(|v| v.active_peer.as_ref().map(|p| p.id.as_str()) == Some(CY) && !v.loading_history),
    )
    .await
    .expect("conversation never opened")
    .expect("session dropped");

    commands.send(teamsync::Command::Logout).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run loop did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(views.borrow().ended);
    assert!(channel.inbound.send(InboundEvent::Connected).is_err());
}

#[tokio::test]
async fn test_run_loop_ends_with_auth_expired() {
    let (session, _notices, channel) = connected_session(FakeApi::new()).await;
    let (_commands, command_rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = tokio::spawn(session.run(command_rx));

    channel.inbound.send(InboundEvent::AuthRejected("jwt expired".into())).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run loop did not stop")
        .unwrap();
    assert!(matches!(result, Err(SyncError::AuthExpired(reason)) if reason == "jwt expired"));
}

#[tokio::test(start_paused = true)]
async fn test_incoming_message_keeps_pending_typing_notification() {
    let (mut session, _notices, mut channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    session.handle_event(InboundEvent::UserTyping(TypingNotice { user_id: BEA.into() }));
    session.set_compose("h");
    tokio::time::advance(Duration::from_millis(100)).await;
    session.handle_event(InboundEvent::MessageReceived(record("m1", BEA, ME, "hey", Utc::now())));
    session.settle().await;
    // Their message ends their typing burst
    assert!(!session.view().peer_typing);

    tokio::time::advance(Duration::from_millis(400)).await;
    session.fire_timers(tokio::time::Instant::now());
    let typing: Vec<OutboundEvent> = channel
        .sent()
        .into_iter()
        .filter(|event| matches!(event, OutboundEvent::Typing { .. }))
        .collect();
    assert_eq!(typing, vec![OutboundEvent::Typing { receiver_id: BEA.to_string() }]);
}

#[tokio::test]
async fn test_redelivered_message_counts_once_as_unread() {
    let (mut session, _notices, _channel) = connected_session(FakeApi::new()).await;
    session.open_conversation_by_id(BEA).unwrap();
    session.settle().await;

    let incoming = record("m10", CY, ME, "psst", Utc::now());
    session.handle_event(InboundEvent::MessageReceived(incoming.clone()));
    session.handle_event(InboundEvent::MessageReceived(incoming));
    session.settle().await;

    let view = session.view();
    assert_eq!(view.unread_for(CY), 1);
    assert_eq!(view.total_unread, 1);
}

#[tokio::test]
async fn test_rejected_credential_on_rest_call_ends_session() {
    let api = FakeApi::new();
    let (mut session, mut notices, _channel) = connected_session(api.clone()).await;
    api.edit(|state| state.revoked = true);

    session.refresh_catalog();
    session.settle().await;

    assert!(session.is_ended());
    let notices = drain_notices(&mut notices);
    assert!(notices.iter().any(|n| matches!(n, Notice::AuthExpired(_))));
    assert!(!notices.iter().any(|n| matches!(n, Notice::NetworkFailure(_))));
}

#[tokio::test]
async fn test_own_status_toggle_keeps_server_stamp() {
    let (mut session, _notices, _channel) = connected_session(FakeApi::new()).await;

    session.toggle_status();
    session.settle().await;
    let me = session.view().identity.unwrap();
    assert_eq!(me.status, UserStatus::Online);
    assert_eq!(me.status_updated_at, Some(at(0)));

    // A later change made on another device is not mistaken for stale
    session.handle_event(InboundEvent::UserStatusChanged(StatusChange {
        user_id: ME.into(),
        status: UserStatus::Offline,
        status_updated_at: Some(at(1)),
    }));
    let me = session.view().identity.unwrap();
    assert_eq!(me.status, UserStatus::Offline);
    assert_eq!(me.status_updated_at, Some(at(1)));
}

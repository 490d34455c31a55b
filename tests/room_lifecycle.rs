mod common;

use std::time::Duration;

use common::{clock, pump, MemberBuilder, ROOM};
use cowatch_lib::events::AppEvent;
use cowatch_lib::models::{ChatNet, RoomEvent};
use cowatch_lib::network::{LocalHub, TransportEvent};
use cowatch_lib::room::{run_room_session, ChatKind, RoomCommand};
use cowatch_lib::sync::MediaSelection;
use tokio::sync::{mpsc, oneshot};

#[tokio::test]
async fn host_closing_the_room_ends_every_session() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").host().attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    let mut c = MemberBuilder::new(&hub, &clock, "c").attach().await;
    pump(&mut [&mut a, &mut b, &mut c]).await;
    b.drain_events();

    a.command(RoomCommand::CloseRoom).await;
    pump(&mut [&mut a, &mut b, &mut c]).await;

    for member in [&a, &b, &c] {
        assert!(!member.session.is_attached());
        assert!(member.session.negotiator().registry().is_empty());
    }
    assert!(hub.members(ROOM).is_empty());

    let events = b.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, AppEvent::RoomClosed { by } if by == "a")));
    assert!(events
        .iter()
        .any(|e| matches!(e, AppEvent::SessionEnded { room_code } if room_code == ROOM)));
}

#[tokio::test]
async fn only_the_host_may_close() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").host().attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;

    b.command(RoomCommand::CloseRoom).await;
    pump(&mut [&mut a, &mut b]).await;
    assert!(a.session.is_attached());
    assert!(b.session.is_attached());
    assert_eq!(hub.members(ROOM).len(), 2);
}

#[tokio::test]
async fn presence_tracks_members() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;

    let ids: Vec<String> = a.session.members().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(b.session.members().len(), 2);
    assert_eq!(a.session.members()[1].name, "user-b");
}

#[tokio::test]
async fn chat_is_delivered_once() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;

    a.command(RoomCommand::SendChat {
        message: "  popcorn ready?  ".into(),
        tone: None,
    })
    .await;
    a.command(RoomCommand::SendChat {
        message: "   ".into(),
        tone: None,
    })
    .await;
    pump(&mut [&mut a, &mut b]).await;

    assert_eq!(a.session.chat().len(), 1);
    assert_eq!(b.session.chat().len(), 1);
    let entry = b.session.chat().entries().next().expect("entry").clone();
    assert_eq!(entry.message, "popcorn ready?");
    assert_eq!(entry.from, "a");
    assert_eq!(entry.tone, "default");
    assert_eq!(entry.kind, ChatKind::Message);

    // a relayed duplicate is dropped
    b.session
        .dispatch(TransportEvent::Message(RoomEvent::Chat(ChatNet {
            id: entry.id.clone(),
            from: entry.from.clone(),
            name: entry.name.clone(),
            message: entry.message.clone(),
            tone: entry.tone.clone(),
        })))
        .await;
    assert_eq!(b.session.chat().len(), 1);
}

#[tokio::test]
async fn media_switch_is_shared_and_announced() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;
    b.drain_events();

    let selection = MediaSelection::episode(2, 5);
    a.command(RoomCommand::SelectMedia(selection)).await;
    a.command(RoomCommand::SelectMedia(selection)).await;
    pump(&mut [&mut a, &mut b]).await;

    assert_eq!(a.session.media(), Some(&selection));
    assert_eq!(b.session.media(), Some(&selection));

    // the repeated switch inside the notice window adds no second line
    let notices: Vec<_> = b
        .session
        .chat()
        .entries()
        .filter(|e| e.kind == ChatKind::Notice)
        .cloned()
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.starts_with("user-a switched to"));

    let changed = b
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, AppEvent::MediaChanged { .. }))
        .count();
    assert_eq!(changed, 2);
}

#[tokio::test]
async fn late_joiner_gets_the_selected_media() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").attach().await;
    pump(&mut [&mut a]).await;
    a.command(RoomCommand::SelectMedia(MediaSelection::movie())).await;

    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;
    assert_eq!(b.session.media(), Some(&MediaSelection::movie()));
}

#[tokio::test]
async fn leaving_twice_is_harmless() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").attach().await;
    pump(&mut [&mut a]).await;

    a.command(RoomCommand::Leave).await;
    a.command(RoomCommand::Leave).await;
    let ended = a
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, AppEvent::SessionEnded { .. }))
        .count();
    assert_eq!(ended, 1);
    assert!(hub.members(ROOM).is_empty());
}

#[tokio::test]
async fn running_session_answers_commands_until_left() {
    let hub = LocalHub::new();
    let clock = clock();
    let (session, peer_rx, _events) = MemberBuilder::new(&hub, &clock, "a").host().detached().await;
    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(run_room_session(session, peer_rx, rx));

    tx.send(RoomCommand::Seek { time: 90.0 }).await.unwrap();
    let (reply, snapshot) = oneshot::channel();
    tx.send(RoomCommand::Snapshot(reply)).await.unwrap();
    let snapshot = snapshot.await.unwrap();
    assert!(snapshot.attached);
    assert!(snapshot.is_host);
    assert_eq!(snapshot.client_id, "a");
    assert_eq!(snapshot.player_time, 90.0);
    assert_eq!(snapshot.record.map(|r| r.last_known_time), Some(90.0));
    assert_eq!(hub.members(ROOM).len(), 1);

    tx.send(RoomCommand::Leave).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("session stops after leaving")
        .unwrap();
    assert!(result.is_ok());
    assert!(hub.members(ROOM).is_empty());
}

#[tokio::test]
async fn dropping_the_command_channel_leaves_the_room() {
    let hub = LocalHub::new();
    let clock = clock();
    let (session, peer_rx, _events) = MemberBuilder::new(&hub, &clock, "a").detached().await;
    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(run_room_session(session, peer_rx, rx));

    let (reply, snapshot) = oneshot::channel();
    tx.send(RoomCommand::Snapshot(reply)).await.unwrap();
    assert!(snapshot.await.unwrap().attached);
    drop(tx);

    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("session stops without commands")
        .unwrap();
    assert!(result.is_ok());
    assert!(hub.members(ROOM).is_empty());
}

#[tokio::test]
async fn rejoining_starts_from_empty_room_state() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").host().attach().await;
    pump(&mut [&mut a]).await;
    a.command(RoomCommand::Play).await;
    a.command(RoomCommand::SelectMedia(MediaSelection::movie())).await;
    a.command(RoomCommand::SendChat {
        message: "brb".into(),
        tone: None,
    })
    .await;
    pump(&mut [&mut a]).await;
    assert!(a.session.record().is_some());

    a.session.detach().await;
    clock.advance_secs(60.0);
    a.rx = a.session.attach().await.unwrap();
    pump(&mut [&mut a]).await;

    assert!(a.session.record().is_none());
    assert!(a.session.media().is_none());
    assert_eq!(a.session.chat().len(), 0);
    assert!(a.session.is_reconciling());
}

#[tokio::test]
async fn rejoining_reconciles_from_the_room_not_from_itself() {
    let hub = LocalHub::new();
    let clock = clock();
    let mut a = MemberBuilder::new(&hub, &clock, "a").host().attach().await;
    let mut b = MemberBuilder::new(&hub, &clock, "b").attach().await;
    pump(&mut [&mut a, &mut b]).await;
    a.command(RoomCommand::Play).await;
    pump(&mut [&mut a, &mut b]).await;

    a.session.detach().await;
    pump(&mut [&mut a, &mut b]).await;
    clock.advance_secs(30.0);
    b.command(RoomCommand::Pause).await;
    pump(&mut [&mut b]).await;

    clock.advance_secs(60.0);
    a.rx = a.session.attach().await.unwrap();
    pump(&mut [&mut a, &mut b]).await;

    let record = a.session.record().expect("record from b").clone();
    assert!(!record.is_playing);
    assert!((record.last_known_time - 30.0).abs() < 0.5);
    assert!(a.session.player().is_paused());
    assert!(!a.session.is_reconciling());
}

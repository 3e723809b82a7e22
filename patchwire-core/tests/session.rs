//! Session scenarios driven through encoded frames and the session manager.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use patchwire_core::budget::BudgetConfig;
use patchwire_core::config::{AddrLimitPolicy, SessionConfig};
use patchwire_core::protocol::{
    AckFrame, Capabilities, ErrorCode, EventFrame, EventKind, Frame, FrameDecoder, HandshakeStatus, Hello, Patch,
    PatchFrame, WireNode,
};
use patchwire_core::reactive::GlobalSignal;
use patchwire_core::render::{component, el, full_tree, keyed_list, text, ClientTree, Component, Hid};
use patchwire_core::session::{
    HandshakeOutcome, MemoryStore, Session, SessionHandle, SessionManager, SessionState, SessionStore,
};

/// `div > [button (h2), text (h3)]`; clicking the button increments.
fn counter() -> Component {
    component("counter", |cx| {
        let count = cx.use_signal(|| 0);
        let inc = count.clone();
        el("div")
            .child(el("button").on("click", move |_| inc.update(|n| *n += 1)))
            .child(text(count.get().to_string()))
            .into()
    })
}

/// Counter whose value survives the session leaving memory.
fn persisted_counter() -> Component {
    component("persisted", |cx| {
        let count = cx.use_persisted("count", || 0u32);
        let inc = count.clone();
        el("div")
            .child(el("button").on("click", move |_| inc.update(|n| *n += 1)))
            .child(text(count.get().to_string()))
            .into()
    })
}

fn click(seq: u64) -> EventFrame {
    EventFrame::new(seq, EventKind::Click, Hid::new(2))
}

fn started(root: Component, config: &SessionConfig) -> Session {
    let mut session = Session::new("token", root, config);
    session.start().unwrap();
    session
}

fn decode_all(bytes: &[u8]) -> Vec<Frame> {
    let mut decoder = FrameDecoder::default();
    decoder.push(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame() {
        frames.push(frame.unwrap());
    }
    assert_eq!(decoder.buffered(), 0);
    frames
}

fn error_codes(frames: &[Frame]) -> Vec<ErrorCode> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Error(err) => Some(err.code),
            _ => None,
        })
        .collect()
}

#[test]
fn click_over_the_wire_sets_one_text_node() {
    let mut session = Session::new("token", counter(), &SessionConfig::default());
    let mount = session.start().unwrap();
    let mut client = ClientTree::new();
    client.apply_all(&mount.patches).unwrap();
    assert!(client.contains(Hid::new(1)) && client.contains(Hid::new(2)) && client.contains(Hid::new(3)));

    let inbound = Frame::Event(click(1)).encode().unwrap();
    let frames = decode_all(&session.handle_frame(&inbound));
    assert_eq!(
        frames,
        vec![Frame::Patches(PatchFrame {
            sequence: 2,
            ack: Some(1),
            patches: vec![Patch::SetText {
                hid: Hid::new(3),
                text: "1".into(),
            }],
        })]
    );

    if let Frame::Patches(frame) = &frames[0] {
        client.apply_all(&frame.patches).unwrap();
    }
    assert_eq!(client.roots(), session.wire_tree().as_slice());
}

#[test]
fn rotating_a_keyed_list_is_a_single_move() {
    let root = component("list", |cx| {
        let items = cx.use_signal(|| vec!["A", "B", "C"]);
        let rotate = items.clone();
        el("div")
            .child(el("button").on("click", move |_| {
                rotate.update(|items| items.rotate_right(1));
            }))
            .child(el("ul").child(keyed_list(
                items.get(),
                |item| *item,
                |item| el("li").text(item).into(),
            )))
            .into()
    });
    // div h1, button h2, ul h3, li A h4 (text h5), li B h6 (h7), li C h8 (h9)
    let mut session = started(root, &SessionConfig::default());

    let frames = session.handle_event(&click(1));
    assert_eq!(
        frames,
        vec![Frame::Patches(PatchFrame {
            sequence: 2,
            ack: Some(1),
            patches: vec![Patch::MoveNode {
                hid: Hid::new(8),
                parent: Hid::new(3),
                before: Some(Hid::new(4)),
            }],
        })]
    );
}

#[test]
fn stale_events_are_acked_and_gaps_rejected() {
    let mut session = started(counter(), &SessionConfig::default());
    assert!(matches!(&session.handle_event(&click(1))[..], [Frame::Patches(_)]));

    // Retransmit of an applied event.
    assert_eq!(session.handle_event(&click(1)), vec![Frame::Ack(AckFrame { sequence: 1 })]);

    // Skipping 2.
    let frames = session.handle_event(&click(3));
    assert_eq!(error_codes(&frames), vec![ErrorCode::SequenceGap]);
    assert_eq!(session.last_event_seq(), 1);

    // The expected next event still works.
    assert!(matches!(&session.handle_event(&click(2))[..], [Frame::Patches(_)]));
}

#[test]
fn event_without_visible_change_is_acked() {
    let root = component("quiet", |cx| {
        let hits = cx.use_signal(|| 0u32);
        let inc = hits.clone();
        el("button").on("click", move |_| inc.update(|n| *n += 1)).into()
    });
    let mut session = started(root, &SessionConfig::default());
    let frames = session.handle_event(&EventFrame::new(1, EventKind::Click, Hid::new(1)));
    assert_eq!(frames, vec![Frame::Ack(AckFrame { sequence: 1 })]);
}

#[test]
fn handler_panic_is_reported_and_session_survives() {
    let root = component("fragile", |cx| {
        let count = cx.use_signal(|| 0);
        let inc = count.clone();
        el("div")
            .child(el("button").on("click", move |_| inc.update(|n| *n += 1)))
            .child(el("button").on("click", |_| panic!("boom")))
            .child(text(count.get().to_string()))
            .into()
    });
    let mut session = started(root, &SessionConfig::default());

    let frames = session.handle_event(&EventFrame::new(1, EventKind::Click, Hid::new(3)));
    assert_eq!(error_codes(&frames), vec![ErrorCode::HandlerFailed]);
    assert_eq!(session.state(), SessionState::Active);

    let frames = session.handle_event(&click(2));
    assert!(matches!(&frames[..], [Frame::Patches(_)]));
}

#[test]
fn render_error_keeps_previous_tree() {
    let root = component("picky", |cx| {
        let count = cx.use_signal(|| 0);
        let inc = count.clone();
        let value = count.get();
        if value == 1 {
            panic!("one is not allowed");
        }
        el("div")
            .child(el("button").on("click", move |_| inc.update(|n| *n += 1)))
            .child(text(value.to_string()))
            .into()
    });
    let mut session = started(root, &SessionConfig::default());
    let before = session.wire_tree();

    let frames = session.handle_event(&click(1));
    assert_eq!(error_codes(&frames), vec![ErrorCode::RenderFailed]);
    assert!(session.render_error().is_some());
    assert_eq!(session.wire_tree(), before);

    // The old handlers still answer; the next value renders again.
    let frames = session.handle_event(&click(2));
    assert!(session.render_error().is_none());
    match &frames[..] {
        [Frame::Patches(frame)] => assert_eq!(
            frame.patches,
            vec![Patch::SetText {
                hid: Hid::new(3),
                text: "2".into()
            }]
        ),
        other => panic!("expected patches, got {other:?}"),
    }
}

#[test]
fn render_storm_is_cut_off_and_resumes_later() {
    let config = SessionConfig::default().with_render_budget(BudgetConfig {
        max_triggers: 2,
        window_ms: 60_000,
    });
    let mut session = started(counter(), &config);

    assert!(matches!(&session.handle_event(&click(1))[..], [Frame::Patches(_)]));
    let frames = session.handle_event(&click(2));
    assert_eq!(error_codes(&frames), vec![ErrorCode::BudgetExceeded]);
    // The event itself was applied.
    assert_eq!(session.last_event_seq(), 2);
}

#[test]
fn eleventh_trigger_in_a_window_does_not_run() {
    let config = SessionConfig::default().with_trigger_budget(BudgetConfig {
        max_triggers: 10,
        window_ms: 60_000,
    });
    let session = started(counter(), &config);
    let mut ran = 0;
    for _ in 0..10 {
        session.runtime().trigger(|| ran += 1).unwrap();
    }
    assert!(session.runtime().trigger(|| ran += 1).is_err());
    assert_eq!(ran, 10);
}

#[test]
fn resume_replays_the_tree_the_client_had() {
    let mut session = started(counter(), &SessionConfig::default());
    let mut client = ClientTree::new();
    client.apply_all(&full_tree(session.tree())).unwrap();
    for seq in 1..=3 {
        for frame in session.handle_event(&click(seq)) {
            if let Frame::Patches(frame) = frame {
                client.apply_all(&frame.patches).unwrap();
            }
        }
    }
    let before = client.clone();

    let now = Instant::now();
    session.detach(now).unwrap();
    let frame = session.resume_at("token", now + Duration::from_secs(5)).unwrap();

    let mut fresh = ClientTree::new();
    fresh.apply_all(&frame.patches).unwrap();
    assert_eq!(fresh, before);
    assert_eq!(session.last_event_seq(), 3);
}

#[test]
fn global_change_reaches_each_session_on_poll() {
    let motd = GlobalSignal::new("hello".to_string());
    let root = move || {
        component("motd", move |_| el("p").child(text(motd.get())).into())
    };
    let mut a = started(root(), &SessionConfig::default());
    let mut b = started(root(), &SessionConfig::default());

    motd.set("goodbye".to_string());
    for session in [&mut a, &mut b] {
        let frames = session.poll();
        match &frames[..] {
            [Frame::Patches(frame)] => assert_eq!(
                frame.patches,
                vec![Patch::SetText {
                    hid: Hid::new(2),
                    text: "goodbye".into()
                }]
            ),
            other => panic!("expected patches, got {other:?}"),
        }
        assert!(session.poll().is_empty());
    }
}

fn manager(config: SessionConfig) -> SessionManager {
    SessionManager::new(config, |_: &Hello| persisted_counter())
}

fn accept(outcome: HandshakeOutcome) -> (SessionHandle, String) {
    match outcome {
        HandshakeOutcome::Accepted { session, reply, .. } => (session, reply.token.unwrap()),
        HandshakeOutcome::Refused(reply) => panic!("refused: {reply:?}"),
    }
}

const HOME: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const AWAY: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

#[test]
fn evicted_session_resumes_from_store() {
    let manager = manager(SessionConfig::default().with_max_detached(1));
    let now = Instant::now();

    let (first, first_token) = accept(manager.handshake(&Hello::default(), Some(HOME), now));
    for seq in 1..=2 {
        first.lock().handle_event(&click(seq));
    }
    let (_, second_token) = accept(manager.handshake(&Hello::default(), Some(HOME), now));

    manager.detach(&first_token, now).unwrap();
    manager.detach(&second_token, now).unwrap();
    // Only one detached session fits in memory.
    assert_eq!(manager.detached_count(), 1);
    assert!(manager.get(&first_token).is_none());

    let hello = Hello::default().with_resume_token(&first_token);
    match manager.handshake(&hello, Some(HOME), now + Duration::from_secs(1)) {
        HandshakeOutcome::Accepted { session, reply, patches } => {
            assert!(reply.resumed);
            assert_eq!(reply.last_event_seq, 2);
            let mut client = ClientTree::new();
            client.apply_all(&patches.patches).unwrap();
            assert_eq!(client.roots(), session.lock().wire_tree().as_slice());
            assert!(matches!(
                client.find(Hid::new(3)),
                Some(patchwire_core::protocol::WireNode::Text { text, .. }) if text == "2"
            ));
        }
        HandshakeOutcome::Refused(reply) => panic!("refused: {reply:?}"),
    }
}

#[test]
fn store_snapshot_is_gone_after_the_window() {
    let config = SessionConfig::default()
        .with_max_detached(0)
        .with_resume_window(Duration::from_secs(10));
    let manager = manager(config);
    let now = Instant::now();
    let (_, token) = accept(manager.handshake(&Hello::default(), None, now));
    manager.detach(&token, now).unwrap();
    assert_eq!(manager.session_count(), 0);

    manager.sweep(now + Duration::from_secs(10));
    let hello = Hello::default().with_resume_token(&token);
    let outcome = manager.handshake(&hello, None, now + Duration::from_secs(11));
    assert_eq!(outcome.reply().status, HandshakeStatus::ResumeFailed);
}

#[test]
fn per_address_limit_rejects() {
    let manager = manager(SessionConfig::default().with_addr_limit(2, AddrLimitPolicy::Reject));
    let now = Instant::now();
    accept(manager.handshake(&Hello::default(), Some(HOME), now));
    accept(manager.handshake(&Hello::default(), Some(HOME), now));

    let third = manager.handshake(&Hello::default(), Some(HOME), now);
    assert_eq!(third.reply().status, HandshakeStatus::Rejected);
    assert_eq!(manager.sessions_for(HOME), 2);

    accept(manager.handshake(&Hello::default(), Some(AWAY), now));
    assert_eq!(manager.session_count(), 3);
}

#[test]
fn per_address_limit_can_evict_oldest() {
    let manager = manager(SessionConfig::default().with_addr_limit(2, AddrLimitPolicy::EvictOldest));
    let now = Instant::now();
    let (oldest, oldest_token) = accept(manager.handshake(&Hello::default(), Some(HOME), now));
    accept(manager.handshake(&Hello::default(), Some(HOME), now));
    accept(manager.handshake(&Hello::default(), Some(HOME), now));

    assert_eq!(manager.sessions_for(HOME), 2);
    assert!(manager.get(&oldest_token).is_none());
    assert_eq!(oldest.lock().state(), SessionState::Expired);
}

#[test]
fn logout_forgets_everything() {
    let manager = manager(SessionConfig::default());
    let now = Instant::now();
    let (_, token) = accept(manager.handshake(&Hello::default(), None, now));
    manager.detach(&token, now).unwrap();
    manager.logout(&token).unwrap();

    let hello = Hello::default().with_resume_token(&token);
    assert_eq!(manager.handshake(&hello, None, now).reply().status, HandshakeStatus::ResumeFailed);
}

fn collect_hids(nodes: &[WireNode], out: &mut BTreeSet<u64>) {
    for node in nodes {
        out.insert(node.hid().raw());
        collect_hids(node.children(), out);
    }
}

/// `div > [button, p "off"]`, swapped for `span "on"` by each click.
fn toggler() -> Component {
    component("toggler", |cx| {
        let on = cx.use_persisted("on", || false);
        let flip = on.clone();
        let body = if on.get() { el("span").text("on") } else { el("p").text("off") };
        el("div")
            .child(el("button").on("click", move |_| flip.update(|v| *v = !*v)))
            .child(body)
            .into()
    })
}

#[test]
fn hids_continue_after_rebuild_from_store() {
    let manager = SessionManager::new(SessionConfig::default().with_max_detached(0), |_: &Hello| toggler());
    let now = Instant::now();
    let (session, token) = accept(manager.handshake(&Hello::default(), None, now));

    let mut seen = BTreeSet::new();
    collect_hids(&session.lock().wire_tree(), &mut seen);
    let frames = session.lock().handle_event(&click(1));
    assert!(matches!(&frames[..], [Frame::Patches(frame)] if matches!(frame.patches[..], [Patch::ReplaceNode { .. }])));
    collect_hids(&session.lock().wire_tree(), &mut seen);
    let highest_seen = *seen.last().unwrap();
    assert_eq!(highest_seen, 6);

    manager.detach(&token, now).unwrap();
    assert!(manager.get(&token).is_none());

    let hello = Hello::default().with_resume_token(&token);
    let (resumed, patches) = match manager.handshake(&hello, None, now + Duration::from_secs(1)) {
        HandshakeOutcome::Accepted { session, patches, .. } => (session, patches),
        HandshakeOutcome::Refused(reply) => panic!("refused: {reply:?}"),
    };
    let mut client = ClientTree::new();
    client.apply_all(&patches.patches).unwrap();
    let mut rebuilt = BTreeSet::new();
    collect_hids(client.roots(), &mut rebuilt);

    assert_eq!(rebuilt.len(), 4);
    assert!(rebuilt.iter().all(|hid| *hid > highest_seen), "reused hids: {rebuilt:?}");
    // The persisted toggle survived.
    assert!(matches!(
        client.find(Hid::new(highest_seen + 4)),
        Some(WireNode::Text { text, .. }) if text == "on"
    ));

    // Events target the new hids.
    let button = EventFrame::new(2, EventKind::Click, Hid::new(highest_seen + 2));
    assert!(matches!(&resumed.lock().handle_event(&button)[..], [Frame::Patches(_)]));
}

/// `div > [button, "narrow"]`; a click swaps the text for a very wide list.
fn widener(width: usize, tag: String) -> Component {
    component("widener", move |cx| {
        let wide = cx.use_signal(|| false);
        let toggle = wide.clone();
        let body: patchwire_core::render::VNode = if wide.get() {
            el(tag.clone()).children((0..width).map(|i| text(i.to_string()))).into()
        } else {
            text("narrow")
        };
        el("div")
            .child(el("button").on("click", move |_| toggle.update(|w| *w = !*w)))
            .child(body)
            .into()
    })
}

#[test]
fn very_wide_subtree_reaches_the_client() {
    let mut session = started(widener(70_000, "ul".into()), &SessionConfig::default());
    let mut client = ClientTree::new();
    client.apply_all(&full_tree(session.tree())).unwrap();

    let frames = decode_all(&session.handle_frame(&Frame::Event(click(1)).encode().unwrap()));
    match &frames[..] {
        [Frame::Patches(frame)] => client.apply_all(&frame.patches).unwrap(),
        other => panic!("expected patches, got {} frames", other.len()),
    }
    assert_eq!(client.roots(), session.wire_tree().as_slice());
    assert_eq!(client.len(), 3 + 70_000);
}

#[test]
fn unencodable_render_keeps_client_and_server_in_step() {
    let mut session = started(widener(1, "x".repeat(300)), &SessionConfig::default());
    let before = session.wire_tree();
    let next_hid = session.hids().peek();

    let frames = decode_all(&session.handle_frame(&Frame::Event(click(1)).encode().unwrap()));
    assert_eq!(error_codes(&frames), vec![ErrorCode::RenderFailed]);
    assert_eq!(session.wire_tree(), before);
    assert_eq!(session.hids().peek(), next_hid);

    // Toggling back renders the same tree the client already has.
    let frames = session.handle_event(&click(2));
    assert_eq!(frames, vec![Frame::Ack(AckFrame { sequence: 2 })]);
    assert!(session.render_error().is_none());
}

fn shared_store() -> (Arc<MemoryStore>, SessionManager) {
    let store = Arc::new(MemoryStore::new());
    let config = SessionConfig::default().with_addr_limit(1, AddrLimitPolicy::EvictOldest);
    let manager = manager(config).with_store(store.clone() as Arc<dyn SessionStore>);
    (store, manager)
}

#[test]
fn in_memory_resume_drops_the_saved_record() {
    let (store, manager) = shared_store();
    let now = Instant::now();
    let (_, token) = accept(manager.handshake(&Hello::default(), Some(HOME), now));
    manager.detach(&token, now).unwrap();
    assert_eq!(store.len(), 1);

    accept(manager.handshake(&Hello::default().with_resume_token(&token), Some(HOME), now));
    assert!(store.is_empty());

    // A newer session from the same address evicts the resumed one.
    accept(manager.handshake(&Hello::default(), Some(HOME), now));
    manager.sweep(now + Duration::from_secs(3600));
    assert!(store.is_empty());
}

#[test]
fn evicting_a_detached_session_by_address_drops_its_record() {
    let (store, manager) = shared_store();
    let now = Instant::now();
    let (_, token) = accept(manager.handshake(&Hello::default(), Some(HOME), now));
    manager.detach(&token, now).unwrap();
    assert!(store.load(&token).unwrap().is_some());

    accept(manager.handshake(&Hello::default(), Some(HOME), now));
    assert!(manager.get(&token).is_none());
    assert!(store.is_empty());
    let hello = Hello::default().with_resume_token(&token);
    assert_eq!(manager.handshake(&hello, None, now).reply().status, HandshakeStatus::ResumeFailed);
}

#[test]
fn value_changes_fall_back_to_attributes() {
    let root = component("field", |cx| {
        let count = cx.use_signal(|| 0);
        let inc = count.clone();
        el("div")
            .child(el("button").on("click", move |_| inc.update(|n| *n += 1)))
            .child(el("input").attr("value", count.get().to_string()))
            .into()
    });
    let mut session = Session::new("token", root, &SessionConfig::default())
        .with_capabilities(Capabilities::all() - Capabilities::SET_VALUE);
    session.start().unwrap();

    match &session.handle_event(&click(1))[..] {
        [Frame::Patches(frame)] => assert_eq!(
            frame.patches,
            vec![Patch::SetAttr {
                hid: Hid::new(3),
                name: "value".into(),
                value: "1".into(),
            }]
        ),
        other => panic!("expected patches, got {other:?}"),
    }
}

#[test]
fn resume_requires_the_resume_capability() {
    let manager = manager(SessionConfig::default());
    let now = Instant::now();
    let (_, token) = accept(manager.handshake(&Hello::default(), None, now));
    manager.detach(&token, now).unwrap();

    let mut hello = Hello::default().with_resume_token(&token);
    hello.capabilities.remove(Capabilities::RESUME);
    assert_eq!(manager.handshake(&hello, None, now).reply().status, HandshakeStatus::ResumeFailed);

    // The session is still there for a client that can resume.
    assert_eq!(manager.get(&token).map(|s| s.lock().state()), Some(SessionState::Detached));
    accept(manager.handshake(&Hello::default().with_resume_token(&token), None, now));
}

//! Session
//!
//! One logical client: a runtime, the component tree built in it, and the
//! hids the client knows about.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --start--> Active --detach--> Detached --resume--> Active
//!                                              |
//!                                              +--expire--> Expired
//! ```
//!
//! While Active, events are applied one at a time in sequence order. Every
//! event is followed by one render cycle: rebuild what changed, diff, and
//! answer with a Patches frame (or an Ack when nothing changed and the
//! client advertised acks). While
//! Detached, effects are suspended but signal state is kept; resuming sends
//! the whole tree again.

use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::listener::RenderListener;
use super::store::PersistedSession;
use crate::budget::StormBudget;
use crate::config::SessionConfig;
use crate::error::{panic_message, ProtocolError, RenderError, SessionError};
use crate::protocol::{AckFrame, Capabilities, ErrorFrame, EventFrame, Frame, Patch, PatchFrame, WireNode};
use crate::reactive::Runtime;
use crate::render::{diff, full_tree, Component, HandlerIndex, HidAllocator, Node, TreeBuilder, VNode};

/// Shared handle used by the manager and the connection driving a session.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Render passes allowed in one cycle while effects keep invalidating.
pub const MAX_SETTLE_PASSES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Detached,
    Expired,
}

pub struct Session {
    token: String,
    addr: Option<IpAddr>,
    state: SessionState,
    rt: Runtime,
    root: VNode,
    builder: TreeBuilder,
    listener: Arc<RenderListener>,
    tree: Vec<Node>,
    handlers: HandlerIndex,
    hids: HidAllocator,
    render_budget: StormBudget,
    resume_window: Duration,
    last_event_seq: u64,
    next_out_seq: u64,
    detached_at: Option<Instant>,
    render_error: Option<RenderError>,
    /// Bumped on every resume so a stale transport can tell it was replaced.
    attachment: u64,
    /// What the attached client understands; outbound patches are rewritten
    /// to fit.
    capabilities: Capabilities,
}

impl Session {
    pub fn new(token: impl Into<String>, root: Component, config: &SessionConfig) -> Self {
        let rt = Runtime::new();
        rt.set_trigger_budget(Some(config.trigger_budget));
        let listener = Arc::new(RenderListener::new());
        let builder = TreeBuilder::new(&rt, listener.clone());
        Self {
            token: token.into(),
            addr: None,
            state: SessionState::Connecting,
            rt,
            root: VNode::Component(root),
            builder,
            listener,
            tree: Vec::new(),
            handlers: HandlerIndex::default(),
            hids: HidAllocator::new(),
            render_budget: StormBudget::new(config.render_budget),
            resume_window: config.resume_window(),
            last_event_seq: 0,
            next_out_seq: 1,
            detached_at: None,
            render_error: None,
            attachment: 0,
            capabilities: Capabilities::all(),
        }
    }

    /// Rebuild a session from its saved state. Persisted signals pick up
    /// their values when the components that declare them mount, and hids
    /// continue from where the saved session stopped.
    pub fn restore(root: Component, config: &SessionConfig, saved: PersistedSession) -> Self {
        let mut session = Self::new(saved.token, root, config);
        session.rt.restore_persisted(saved.signals);
        session.last_event_seq = saved.last_event_seq;
        session.hids = HidAllocator::starting_at(saved.next_hid);
        session
    }

    #[must_use]
    pub fn with_addr(mut self, addr: IpAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// A resuming client may advertise a different feature set.
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn addr(&self) -> Option<IpAddr> {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Last event sequence applied.
    pub fn last_event_seq(&self) -> u64 {
        self.last_event_seq
    }

    pub fn tree(&self) -> &[Node] {
        &self.tree
    }

    /// The tree as the client should currently hold it.
    pub fn wire_tree(&self) -> Vec<WireNode> {
        self.tree.iter().map(Node::to_wire).collect()
    }

    /// Error of the last render, cleared by the next successful one.
    pub fn render_error(&self) -> Option<&RenderError> {
        self.render_error.as_ref()
    }

    pub fn hids(&self) -> &HidAllocator {
        &self.hids
    }

    pub fn attachment(&self) -> u64 {
        self.attachment
    }

    pub fn detached_at(&self) -> Option<Instant> {
        self.detached_at
    }

    /// Called when a global signal this session depends on changes.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        self.rt.set_waker(waker);
    }

    /// First render. The returned frame mounts the whole tree.
    pub fn start(&mut self) -> Result<PatchFrame, SessionError> {
        self.expect_state(SessionState::Connecting, "start")?;
        self.listener.invalidate();
        let (patches, error) = self.render_cycle();
        if let Some(err) = error {
            return Err(err);
        }
        self.state = SessionState::Active;
        tracing::info!(session = %self.token, nodes = self.hids.live(), "session active");
        Ok(self.patch_frame(None, patches))
    }

    /// Decode one inbound frame and produce the frames to send back.
    pub fn process(&mut self, bytes: &[u8]) -> Vec<Frame> {
        match Frame::decode(bytes) {
            Ok(Frame::Event(event)) => self.handle_event(&event),
            Ok(Frame::Ack(ack)) => {
                tracing::trace!(session = %self.token, seq = ack.sequence, "client ack");
                Vec::new()
            }
            Ok(other) => {
                let err = SessionError::from(ProtocolError::UnexpectedFrame(other.frame_type()));
                tracing::warn!(session = %self.token, error = %err, "unexpected frame");
                vec![self.error_frame(&err, None)]
            }
            Err(err) => {
                tracing::warn!(session = %self.token, error = %err, "malformed frame");
                vec![self.error_frame(&SessionError::from(err), None)]
            }
        }
    }

    /// [`Session::process`], encoded as back-to-back frames.
    pub fn handle_frame(&mut self, bytes: &[u8]) -> Vec<u8> {
        let frames = self.process(bytes);
        self.encode_frames(&frames)
    }

    /// Encode frames, substituting an Internal error for any that cannot be
    /// encoded.
    pub fn encode_frames(&self, frames: &[Frame]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            match frame.encode() {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(err) => {
                    tracing::error!(session = %self.token, error = %err, "failed to encode frame");
                    let fallback = Frame::Error(ErrorFrame::new(
                        crate::protocol::ErrorCode::Internal,
                        None,
                        err.to_string(),
                    ));
                    if let Ok(bytes) = fallback.encode() {
                        out.extend_from_slice(&bytes);
                    }
                }
            }
        }
        out
    }

    /// Apply one event and run the render cycle that follows it.
    pub fn handle_event(&mut self, event: &EventFrame) -> Vec<Frame> {
        let seq = event.sequence;
        if let Err(err) = self.expect_state(SessionState::Active, "handle events") {
            return vec![self.error_frame(&err, Some(seq))];
        }
        if seq <= self.last_event_seq {
            tracing::warn!(session = %self.token, seq, last = self.last_event_seq, "dropping stale event");
            return self.ack(seq).into_iter().collect();
        }
        if seq != self.last_event_seq + 1 {
            let err = SessionError::from(ProtocolError::SequenceGap {
                expected: self.last_event_seq + 1,
                got: seq,
            });
            tracing::warn!(session = %self.token, error = %err, "event out of order");
            return vec![self.error_frame(&err, Some(seq))];
        }
        self.last_event_seq = seq;
        tracing::debug!(session = %self.token, seq, kind = %event.kind, target = %event.target, "event");

        let mut frames = Vec::new();
        if let Err(err) = self.dispatch(event) {
            frames.push(self.error_frame(&err, Some(seq)));
        }
        let (patches, error) = self.render_cycle();
        if !patches.is_empty() {
            frames.push(Frame::Patches(self.patch_frame(Some(seq), patches)));
        }
        if let Some(err) = error {
            frames.push(self.error_frame(&err, Some(seq)));
        }
        if frames.is_empty() {
            frames.extend(self.ack(seq));
        }
        frames
    }

    /// Apply global changes that arrived from other threads and render if
    /// anything this session shows moved.
    pub fn poll(&mut self) -> Vec<Frame> {
        self.rt.drain_external();
        if self.state != SessionState::Active {
            return Vec::new();
        }
        let (patches, error) = self.render_cycle();
        let mut frames = Vec::new();
        if !patches.is_empty() {
            frames.push(Frame::Patches(self.patch_frame(None, patches)));
        }
        if let Some(err) = error {
            frames.push(self.error_frame(&err, None));
        }
        frames
    }

    /// Transport lost. State is kept and effects stop running.
    pub fn detach(&mut self, now: Instant) -> Result<(), SessionError> {
        self.expect_state(SessionState::Active, "detach")?;
        self.state = SessionState::Detached;
        self.detached_at = Some(now);
        self.rt.suspend_effects();
        tracing::info!(session = %self.token, last_seq = self.last_event_seq, "session detached");
        Ok(())
    }

    /// Whether the resume window has elapsed at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match (self.state, self.detached_at) {
            (SessionState::Expired, _) => true,
            (SessionState::Detached, Some(at)) => now.saturating_duration_since(at) >= self.resume_window,
            _ => false,
        }
    }

    pub fn resume(&mut self, token: &str) -> Result<PatchFrame, SessionError> {
        self.resume_at(token, Instant::now())
    }

    /// Reattach within the window. The returned frame carries the full tree;
    /// the client drops what it had before applying it.
    pub fn resume_at(&mut self, token: &str, now: Instant) -> Result<PatchFrame, SessionError> {
        self.expect_state(SessionState::Detached, "resume")?;
        if token != self.token {
            return Err(SessionError::ResumeFailed("token does not match session".into()));
        }
        if self.is_expired_at(now) {
            return Err(SessionError::ResumeFailed("resume window elapsed".into()));
        }

        self.state = SessionState::Active;
        self.detached_at = None;
        self.attachment += 1;
        self.rt.resume_effects();
        self.rt.drain_external();
        // Catch up on changes made while detached; the client gets the
        // whole tree anyway.
        let (_, error) = self.render_cycle();
        if let Some(err) = error {
            tracing::warn!(session = %self.token, error = %err, "render after resume failed, resending last tree");
        }
        tracing::info!(session = %self.token, last_seq = self.last_event_seq, "session resumed");
        Ok(self.patch_frame(None, full_tree(&self.tree)))
    }

    /// State to save for a later resume.
    pub fn snapshot(&self) -> Result<PersistedSession, SessionError> {
        Ok(PersistedSession {
            token: self.token.clone(),
            signals: self.rt.snapshot_persisted()?,
            last_event_seq: self.last_event_seq,
            next_hid: self.hids.peek().raw(),
        })
    }

    /// Dispose the component tree and every reactive node. Idempotent.
    pub fn expire(&mut self) {
        if self.state == SessionState::Expired {
            return;
        }
        self.state = SessionState::Expired;
        self.builder.clear();
        self.rt.dispose();
        self.tree.clear();
        self.handlers = HandlerIndex::default();
        tracing::info!(session = %self.token, "session expired");
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn dispatch(&self, event: &EventFrame) -> Result<(), SessionError> {
        let handler = self
            .handlers
            .get(event.target, event.kind.name())
            .cloned()
            .ok_or_else(|| SessionError::UnknownTarget {
                hid: event.target,
                event: event.kind.name().to_string(),
            })?;
        let rt = &self.rt;
        panic::catch_unwind(AssertUnwindSafe(|| rt.batch(|| handler(event)))).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(session = %self.token, target = %event.target, error = %message, "event handler panicked");
            SessionError::HandlerPanicked(message)
        })
    }

    /// Rebuild while the listener is dirty. Patches produced before a
    /// failure are still returned; the client must get them.
    fn render_cycle(&mut self) -> (Vec<Patch>, Option<SessionError>) {
        // Deliver anything a panicking handler left queued.
        self.rt.run_pending_effects();

        let mut patches = Vec::new();
        for _ in 0..MAX_SETTLE_PASSES {
            if !self.listener.take_dirty() {
                return (patches, None);
            }
            if let Err(err) = self.render_budget.try_acquire() {
                self.listener.invalidate();
                return (patches, Some(err.into()));
            }

            match self.builder.build(&self.root) {
                Ok(mut next) => {
                    let hids_before = self.hids.clone();
                    let pass = diff(&self.tree, &mut next, &mut self.hids);
                    if let Err(err) = PatchFrame::check_encodable(&pass) {
                        // The client never sees this pass; keep the tree it has.
                        self.hids = hids_before;
                        let err = RenderError::Unencodable(err);
                        tracing::error!(session = %self.token, error = %err, "dropping render pass");
                        self.render_error = Some(err.clone());
                        self.rt.run_pending_effects();
                        return (patches, Some(err.into()));
                    }
                    patches.extend(pass);
                    self.handlers = HandlerIndex::build(&next);
                    self.tree = next;
                    self.render_error = None;
                    self.rt.run_pending_effects();
                }
                Err(err) => {
                    self.render_error = Some(err.clone());
                    self.rt.run_pending_effects();
                    return (patches, Some(err.into()));
                }
            }
        }
        if self.listener.is_dirty() {
            tracing::debug!(session = %self.token, passes = MAX_SETTLE_PASSES, "render did not settle, deferring");
        }
        (patches, None)
    }

    fn patch_frame(&mut self, ack: Option<u64>, patches: Vec<Patch>) -> PatchFrame {
        let sequence = self.next_out_seq;
        self.next_out_seq += 1;
        let patches = if self.capabilities.contains(Capabilities::SET_VALUE | Capabilities::RAW_HTML) {
            patches
        } else {
            let caps = self.capabilities;
            patches.into_iter().map(|patch| patch.for_client(caps)).collect()
        };
        PatchFrame {
            sequence,
            ack,
            patches,
        }
    }

    /// Ack for `seq`, if the client asked for them.
    fn ack(&self, seq: u64) -> Option<Frame> {
        self.capabilities
            .contains(Capabilities::ACKS)
            .then_some(Frame::Ack(AckFrame { sequence: seq }))
    }

    fn error_frame(&self, err: &SessionError, sequence: Option<u64>) -> Frame {
        Frame::Error(ErrorFrame::new(err.code(), sequence, err.to_string()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.expire();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("state", &self.state)
            .field("last_event_seq", &self.last_event_seq)
            .field("nodes", &self.hids.live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorCode, EventKind};
    use crate::render::{component, el, text, Hid};

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

    fn click(seq: u64) -> EventFrame {
        EventFrame::new(seq, EventKind::Click, Hid::new(2))
    }

    fn started() -> Session {
        let mut session = Session::new("t", counter(), &SessionConfig::default());
        session.start().unwrap();
        session
    }

    #[test]
    fn start_mounts_and_activates() {
        let mut session = Session::new("t", counter(), &SessionConfig::default());
        let frame = session.start().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.patches.len(), 1);
        assert_eq!(session.state(), SessionState::Active);
        assert!(matches!(session.start(), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn click_produces_set_text() {
        let mut session = started();
        let frames = session.handle_event(&click(1));
        assert_eq!(
            frames,
            vec![Frame::Patches(PatchFrame {
                sequence: 2,
                ack: Some(1),
                patches: vec![Patch::SetText {
                    hid: Hid::new(3),
                    text: "1".into()
                }],
            })]
        );
    }

    #[test]
    fn unknown_target_consumes_sequence() {
        let mut session = started();
        let frames = session.handle_event(&EventFrame::new(1, EventKind::Click, Hid::new(99)));
        assert!(matches!(&frames[..], [Frame::Error(e)] if e.code == ErrorCode::UnknownTarget));
        assert_eq!(session.last_event_seq(), 1);
    }

    #[test]
    fn detach_blocks_events_until_resume() {
        let mut session = started();
        let now = Instant::now();
        session.detach(now).unwrap();

        let frames = session.handle_event(&click(1));
        assert!(matches!(&frames[..], [Frame::Error(e)] if e.code == ErrorCode::InvalidState));

        let frame = session.resume_at("t", now).unwrap();
        assert_eq!(frame.patches, full_tree(session.tree()));
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn resume_rejects_wrong_token_and_late_arrival() {
        let mut session = started();
        let now = Instant::now();
        session.detach(now).unwrap();

        assert!(matches!(session.resume_at("other", now), Err(SessionError::ResumeFailed(_))));
        let late = now + Duration::from_secs(31);
        assert!(session.is_expired_at(late));
        assert!(matches!(session.resume_at("t", late), Err(SessionError::ResumeFailed(_))));
    }

    #[test]
    fn expire_disposes_runtime() {
        let mut session = started();
        assert!(session.runtime().node_count() > 0);
        session.expire();
        assert_eq!(session.state(), SessionState::Expired);
        assert_eq!(session.runtime().node_count(), 0);
        assert!(session.tree().is_empty());
    }

    #[test]
    fn quiet_events_without_ack_support_get_no_reply() {
        let caps = Capabilities::all() - Capabilities::ACKS;
        let mut session = Session::new(
            "t",
            component("quiet", |_| el("button").on("click", |_| {}).into()),
            &SessionConfig::default(),
        )
        .with_capabilities(caps);
        session.start().unwrap();

        let click = EventFrame::new(1, EventKind::Click, Hid::new(1));
        assert!(session.handle_event(&click).is_empty());
        // Retransmit of an applied event.
        assert!(session.handle_event(&click).is_empty());
        assert_eq!(session.last_event_seq(), 1);
    }
}

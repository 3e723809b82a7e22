//! WebSocket Transport
//!
//! One tokio task per connection. Every binary WebSocket message carries
//! exactly one protocol frame.
//!
//! # How a Connection Runs
//!
//! 1. The first binary message must be a Hello. The manager answers it and
//!    the reply goes out, followed by the full tree when accepted.
//! 2. The task then waits on two things at once: the next inbound message
//!    and a [`Notify`] fired when a global signal the session reads changes.
//! 3. When the socket ends, the session is detached and can be resumed on
//!    another connection within the resume window.
//!
//! A connection whose session was resumed elsewhere stops at its next frame
//! or wakeup without touching the session, and does not detach it.
//!
//! The session lock is taken only to process a frame and is never held
//! across an await.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::protocol::{ErrorFrame, Frame};
use crate::session::{HandshakeOutcome, RootFactory, Session, SessionHandle, SessionManager, SessionState};

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, manager: Arc<SessionManager>) -> Result<(), TransportError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, manager).await {
                tracing::debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

/// Bind, start the sweeper and serve until the listener fails.
pub async fn run(config: ServerConfig, factory: impl RootFactory + 'static) -> Result<(), TransportError> {
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    let manager = Arc::new(SessionManager::new(config.session.clone(), factory));

    let sweeper = manager.clone();
    let period = config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            sweeper.sweep(Instant::now());
        }
    });

    serve(listener, manager).await
}

/// Drive one client from handshake to disconnect.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
) -> Result<(), TransportError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    let max_frame_len = manager.config().max_frame_len;

    let hello = loop {
        match source.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                if bytes.len() > max_frame_len {
                    return Err(ProtocolError::FrameTooLarge {
                        len: bytes.len(),
                        max: max_frame_len,
                    }
                    .into());
                }
                match Frame::decode(&bytes)? {
                    Frame::Hello(hello) => break hello,
                    other => {
                        let err = SessionError::from(ProtocolError::UnexpectedFrame(other.frame_type()));
                        let reply = Frame::Error(ErrorFrame::new(err.code(), None, err.to_string()));
                        sink.send(Message::Binary(reply.encode()?)).await?;
                        return Err(TransportError::HandshakeRequired);
                    }
                }
            }
            Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::HandshakeRequired),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
        }
    };

    let (session, reply, patches) = match manager.handshake(&hello, Some(peer.ip()), Instant::now()) {
        HandshakeOutcome::Accepted { session, reply, patches } => (session, reply, patches),
        HandshakeOutcome::Refused(reply) => {
            tracing::info!(%peer, status = ?reply.status, "handshake refused");
            sink.send(Message::Binary(Frame::HandshakeReply(reply).encode()?)).await?;
            sink.close().await?;
            return Ok(());
        }
    };
    let token = reply.token.clone().unwrap_or_default();
    sink.send(Message::Binary(Frame::HandshakeReply(reply).encode()?)).await?;
    sink.send(Message::Binary(Frame::Patches(patches).encode()?)).await?;

    let notify = Arc::new(Notify::new());
    let attachment = {
        let waker = notify.clone();
        let session = session.lock();
        session.set_waker(move || waker.notify_one());
        session.attachment()
    };

    let result = pump(&session, attachment, &mut sink, &mut source, &notify, max_frame_len).await;

    if current_attachment(&session) == Some(attachment) {
        if let Err(err) = manager.detach(&token, Instant::now()) {
            tracing::debug!(session = %token, error = %err, "detach skipped");
        }
    }
    result
}

async fn pump<S, R>(
    session: &SessionHandle,
    attachment: u64,
    sink: &mut S,
    source: &mut R,
    notify: &Notify,
    max_frame_len: usize,
) -> Result<(), TransportError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frames = tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    if bytes.len() > max_frame_len {
                        let err = SessionError::from(ProtocolError::FrameTooLarge {
                            len: bytes.len(),
                            max: max_frame_len,
                        });
                        tracing::warn!(error = %err, "oversized frame");
                        vec![Frame::Error(ErrorFrame::new(err.code(), None, err.to_string()))]
                    } else {
                        let Some(frames) = process_message(session, attachment, &bytes) else {
                            tracing::debug!("connection replaced, dropping frame");
                            return Ok(());
                        };
                        frames
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            },
            _ = notify.notified() => {
                let Some(frames) = poll_session(session, attachment) else {
                    tracing::debug!("connection replaced");
                    return Ok(());
                };
                frames
            }
        };

        let encoded: Vec<Vec<u8>> = {
            let session = session.lock();
            frames.iter().map(|frame| session.encode_frames(std::slice::from_ref(frame))).collect()
        };
        for bytes in encoded {
            if !bytes.is_empty() {
                sink.send(Message::Binary(bytes)).await?;
            }
        }
    }
}

/// Whether this connection still drives the session: nobody resumed it
/// elsewhere and it has not been expired.
fn still_attached(session: &Session, attachment: u64) -> bool {
    session.attachment() == attachment && session.state() != SessionState::Expired
}

/// `None` when the connection no longer drives the session; the frame is
/// dropped unread.
fn process_message(session: &SessionHandle, attachment: u64, bytes: &[u8]) -> Option<Vec<Frame>> {
    let mut session = session.lock();
    still_attached(&session, attachment).then(|| session.process(bytes))
}

fn poll_session(session: &SessionHandle, attachment: u64) -> Option<Vec<Frame>> {
    let mut session = session.lock();
    still_attached(&session, attachment).then(|| session.poll())
}

/// `None` once another connection has resumed the session.
fn current_attachment(session: &SessionHandle) -> Option<u64> {
    let session = session.lock();
    match session.state() {
        SessionState::Active => Some(session.attachment()),
        _ => None,
    }
}

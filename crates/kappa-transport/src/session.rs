//! Authenticated session: one TLS stream multiplexed into channels.
//!
//! A session is driven by two pumps running under the connection's
//! supervisor:
//!
//! - the **read pump** decodes mux frames and routes them: channel data to
//!   the owning [`Channel`], open requests to the offer queue, open
//!   replies to the waiting opener, global requests to the discard queue;
//! - the **write pump** drains the shared outbound queue into the stream.
//!
//! When either pump ends the supervisor is cancelled. The write pump
//! flushes whatever is already queued and closes the stream, and every
//! open channel observes end-of-stream.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use kappa_core::Supervisor;

use crate::channel::{Channel, ChannelOffer};
use crate::error::{TransportError, TransportResult};
use crate::wire::{self, Frame, FrameCodec, FrameKind, RejectReason};

/// Outbound frames buffered ahead of the write pump.
const OUTBOUND_BUFFER: usize = 256;
/// Inbound data chunks buffered per channel.
pub(crate) const CHANNEL_BUFFER: usize = 64;
/// Unanswered channel offers buffered ahead of the dispatcher.
const OFFER_BUFFER: usize = 64;
const GLOBAL_BUFFER: usize = 16;

/// Which side of the session this is. Decides channel id parity so the
/// two sides never allocate the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Acceptor,
}

type OpenReply = oneshot::Sender<Result<(), (RejectReason, String)>>;

pub(crate) struct SessionShared {
    outbound: mpsc::Sender<Frame>,
    routes: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    pending: Mutex<PendingOpens>,
    next_id: AtomicU32,
    sup: Supervisor,
}

#[derive(Default)]
struct PendingOpens {
    closed: bool,
    waiters: HashMap<u32, OpenReply>,
}

impl SessionShared {
    /// Queue a frame for the write pump.
    pub(crate) async fn send(&self, frame: Frame) -> TransportResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Tell the peer channel `id` is closed without waiting.
    ///
    /// When the outbound queue is full the close is queued from a task
    /// under the session supervisor instead.
    pub(crate) fn close_nowait(&self, id: u32) {
        let frame = Frame::new(FrameKind::ChannelClose, id, Bytes::new());
        let frame = match self.outbound.try_send(frame) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(channel = id, "session gone, close not sent");
                return;
            }
            Err(mpsc::error::TrySendError::Full(frame)) => frame,
        };
        if tokio::runtime::Handle::try_current().is_err() {
            trace!(channel = id, "no runtime, close not sent");
            return;
        }
        let outbound = self.outbound.clone();
        let sup = self.sup.clone();
        self.sup.spawn(async move {
            tokio::select! {
                _ = sup.dying() => trace!(channel = id, "session dying, close not sent"),
                _ = outbound.send(frame) => {}
            }
            Ok(())
        });
    }

    pub(crate) fn register_route(&self, id: u32) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        self.routes.lock().expect("routes lock").insert(id, tx);
        rx
    }

    pub(crate) fn remove_route(&self, id: u32) {
        self.routes.lock().expect("routes lock").remove(&id);
    }

    fn route(&self, id: u32) -> Option<mpsc::Sender<Bytes>> {
        self.routes.lock().expect("routes lock").get(&id).cloned()
    }

    /// Tear down routing state: every channel sees end-of-stream and
    /// every pending opener sees the session closed.
    fn shutdown(&self) {
        self.routes.lock().expect("routes lock").clear();
        let mut pending = self.pending.lock().expect("pending lock");
        pending.closed = true;
        pending.waiters.clear();
    }

    fn complete_open(&self, id: u32, result: Result<(), (RejectReason, String)>) {
        let waiter = self.pending.lock().expect("pending lock").waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(channel = id, "open reply for unknown channel"),
        }
    }
}

/// Cloneable handle used to open channels and observe session death.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Open a channel of `channel_type` and wait for the peer's answer.
    pub(crate) async fn open_channel(&self, channel_type: &str) -> TransportResult<Channel> {
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().expect("pending lock");
            if pending.closed {
                return Err(TransportError::ConnectionClosed);
            }
            pending.waiters.insert(id, tx);
        }
        let inbound = self.shared.register_route(id);

        let open = Frame::new(
            FrameKind::ChannelOpen,
            id,
            Bytes::copy_from_slice(channel_type.as_bytes()),
        );
        if let Err(err) = self.shared.send(open).await {
            self.shared.remove_route(id);
            return Err(err);
        }

        match rx.await {
            Ok(Ok(())) => {
                debug!(channel = id, %channel_type, "channel opened");
                Ok(Channel::new(
                    id,
                    channel_type.to_string(),
                    Arc::clone(&self.shared),
                    inbound,
                ))
            }
            Ok(Err((reason, message))) => {
                self.shared.remove_route(id);
                Err(TransportError::ChannelRejected { reason, message })
            }
            Err(_) => {
                self.shared.remove_route(id);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    pub(crate) fn supervisor(&self) -> &Supervisor {
        &self.shared.sup
    }
}

/// Everything the owner of a fresh session needs.
pub(crate) struct SessionParts {
    pub handle: SessionHandle,
    /// Channel offers from the peer, in arrival order.
    pub offers: mpsc::Receiver<ChannelOffer>,
    /// Out-of-band global requests from the peer.
    pub globals: mpsc::Receiver<Bytes>,
}

/// Start the read and write pumps for an authenticated stream under `sup`.
///
/// Dropping the returned `offers` receiver makes the session refuse every
/// channel the peer tries to open.
pub(crate) fn spawn_session<S>(framed: Framed<S, FrameCodec>, sup: &Supervisor, role: Role) -> SessionParts
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (offers_tx, offers_rx) = mpsc::channel(OFFER_BUFFER);
    let (globals_tx, globals_rx) = mpsc::channel(GLOBAL_BUFFER);

    let first_id = match role {
        Role::Initiator => 1,
        Role::Acceptor => 2,
    };
    let shared = Arc::new(SessionShared {
        outbound: outbound_tx,
        routes: Mutex::new(HashMap::new()),
        pending: Mutex::new(PendingOpens::default()),
        next_id: AtomicU32::new(first_id),
        sup: sup.clone(),
    });

    let (sink, stream) = framed.split();
    sup.spawn_critical(read_pump(
        stream,
        Arc::clone(&shared),
        offers_tx,
        globals_tx,
        sup.clone(),
    ));
    sup.spawn_critical(write_pump(sink, outbound_rx, sup.clone()));

    SessionParts {
        handle: SessionHandle { shared },
        offers: offers_rx,
        globals: globals_rx,
    }
}

async fn read_pump<S>(
    mut stream: SplitStream<Framed<S, FrameCodec>>,
    shared: Arc<SessionShared>,
    offers: mpsc::Sender<ChannelOffer>,
    globals: mpsc::Sender<Bytes>,
    sup: Supervisor,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let result = loop {
        let next = tokio::select! {
            _ = sup.dying() => break Ok(()),
            next = stream.next() => next,
        };
        match next {
            None => break Ok(()),
            Some(Err(err)) if is_disconnect(&err) => break Ok(()),
            Some(Err(err)) => break Err(TransportError::from(err)),
            Some(Ok(frame)) => {
                if let Err(err) = route_frame(&shared, frame, &offers, &globals).await {
                    break Err(err);
                }
            }
        }
    };

    shared.shutdown();
    match result {
        Ok(()) => {
            trace!("read pump finished");
            sup.cancel(None);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn route_frame(
    shared: &Arc<SessionShared>,
    frame: Frame,
    offers: &mpsc::Sender<ChannelOffer>,
    globals: &mpsc::Sender<Bytes>,
) -> TransportResult<()> {
    let id = frame.channel;
    match frame.kind {
        FrameKind::ChannelData => match shared.route(id) {
            Some(route) => match route.try_send(frame.payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel = id, "channel inbox full, closing channel");
                    shared.remove_route(id);
                    shared.close_nowait(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(channel = id, "data for dropped channel discarded");
                }
            },
            None => trace!(channel = id, "data for closed channel discarded"),
        },
        FrameKind::ChannelClose => {
            debug!(channel = id, "peer closed channel");
            shared.remove_route(id);
        }
        FrameKind::ChannelOpen => {
            let channel_type = String::from_utf8(frame.payload.to_vec())
                .map_err(|_| TransportError::Protocol("channel type is not UTF-8".into()))?;
            let offer = ChannelOffer::new(id, channel_type, Arc::clone(shared));
            if let Err(mpsc::error::SendError(offer)) = offers.send(offer).await {
                offer
                    .reject(RejectReason::Prohibited, "channel offers are not accepted")
                    .await?;
            }
        }
        FrameKind::ChannelOpenConfirm => shared.complete_open(id, Ok(())),
        FrameKind::ChannelOpenFailure => {
            let rejection = wire::decode_rejection(frame.payload)?;
            shared.complete_open(id, Err(rejection));
        }
        FrameKind::GlobalRequest => {
            let _ = globals.try_send(frame.payload);
        }
        kind @ (FrameKind::Hello
        | FrameKind::AuthRequest
        | FrameKind::AuthSuccess
        | FrameKind::AuthFailure) => {
            return Err(TransportError::Protocol(format!(
                "unexpected {kind:?} frame after authentication"
            )));
        }
    }
    Ok(())
}

async fn write_pump<S>(
    mut sink: SplitSink<Framed<S, FrameCodec>, Frame>,
    mut outbound: mpsc::Receiver<Frame>,
    sup: Supervisor,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(frame).await {
                    if is_disconnect(&err) {
                        break;
                    }
                    return Err(err.into());
                }
            }
            _ = sup.dying() => {
                while let Ok(frame) = outbound.try_recv() {
                    if sink.feed(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
    sup.cancel(None);
    trace!("write pump finished");
    Ok(())
}

/// Errors that mean the peer went away rather than misbehaved.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (SessionParts, SessionParts, Supervisor, Supervisor) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sup_a = Supervisor::new();
        let sup_b = Supervisor::new();
        let client = spawn_session(Framed::new(a, FrameCodec), &sup_a, Role::Initiator);
        let server = spawn_session(Framed::new(b, FrameCodec), &sup_b, Role::Acceptor);
        (client, server, sup_a, sup_b)
    }

    #[tokio::test]
    async fn open_accept_and_exchange_data() {
        let (client, mut server, _sa, _sb) = pair();

        let accept = tokio::spawn(async move {
            let offer = server.offers.recv().await.unwrap();
            assert_eq!(offer.channel_type(), "kappa-client");
            let mut ch = offer.accept().await.unwrap();
            let frame = ch.read_frame().await.unwrap().unwrap();
            ch.write_frame(&frame).await.unwrap();
            server
        });

        let mut ch = client.handle.open_channel("kappa-client").await.unwrap();
        ch.write_frame(b"hello").await.unwrap();
        let echoed = ch.read_frame().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello");
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_open_reports_reason() {
        let (client, mut server, _sa, _sb) = pair();

        tokio::spawn(async move {
            let offer = server.offers.recv().await.unwrap();
            offer
                .reject(RejectReason::UnknownChannelType, "unknown channel type: nope")
                .await
                .unwrap();
            server
        });

        let err = client.handle.open_channel("nope").await.unwrap_err();
        match err {
            TransportError::ChannelRejected { reason, message } => {
                assert_eq!(reason, RejectReason::UnknownChannelType);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn dropped_offer_queue_refuses_channels() {
        let (client, server, _sa, _sb) = pair();
        drop(server.offers);

        let err = client.handle.open_channel("kappa-client").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChannelRejected {
                reason: RejectReason::Prohibited,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn peer_shutdown_ends_session_and_channels() {
        let (client, mut server, sup_a, sup_b) = pair();

        let accept = tokio::spawn(async move {
            let offer = server.offers.recv().await.unwrap();
            offer.accept().await.unwrap()
        });
        let mut ch = client.handle.open_channel("kappa-client").await.unwrap();
        let _server_side = accept.await.unwrap();

        sup_b.cancel(None);
        sup_b.wait().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), sup_a.dying())
            .await
            .expect("client session noticed peer shutdown");
        assert!(ch.read_frame().await.unwrap().is_none());
        assert!(matches!(
            client.handle.open_channel("kappa-client").await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn handshake_frame_after_auth_is_a_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let sup = Supervisor::new();
        let _parts = spawn_session(Framed::new(b, FrameCodec), &sup, Role::Acceptor);

        let mut raw = Framed::new(a, FrameCodec);
        raw.send(Frame::control(FrameKind::Hello)).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), sup.wait())
            .await
            .expect("session ended")
            .unwrap_err();
        assert!(err.to_string().contains("unexpected Hello"));
    }

    #[tokio::test]
    async fn unread_channel_is_closed_without_stalling_siblings() {
        let (client, mut server, _sa, _sb) = pair();

        let accept = tokio::spawn(async move {
            let quiet = server.offers.recv().await.unwrap().accept().await.unwrap();
            let mut echo = server.offers.recv().await.unwrap().accept().await.unwrap();
            let frame = echo.read_frame().await.unwrap().unwrap();
            echo.write_frame(&frame).await.unwrap();
            (quiet, echo)
        });

        let mut quiet = client.handle.open_channel("quiet").await.unwrap();
        for _ in 0..CHANNEL_BUFFER * 2 {
            quiet.write_frame(b"x").await.unwrap();
        }
        let mut echo = client.handle.open_channel("kappa-client").await.unwrap();
        echo.write_frame(b"ping").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), echo.read_frame())
            .await
            .expect("sibling answered")
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"ping");

        let ended = tokio::time::timeout(Duration::from_secs(2), quiet.read_frame())
            .await
            .expect("overflowing channel closed");
        assert!(ended.unwrap().is_none());
        let _ = accept.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_channel_close_waits_for_queue_room() {
        let (outbound, mut queued) = mpsc::channel(1);
        let sup = Supervisor::new();
        let shared = Arc::new(SessionShared {
            outbound,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingOpens::default()),
            next_id: AtomicU32::new(1),
            sup: sup.clone(),
        });
        let inbound = shared.register_route(7);
        let channel = Channel::new(7, "kappa-client".into(), Arc::clone(&shared), inbound);

        shared
            .send(Frame::new(FrameKind::ChannelData, 7, Bytes::from_static(b"x")))
            .await
            .unwrap();
        drop(channel);

        assert_eq!(queued.recv().await.unwrap().kind, FrameKind::ChannelData);
        let close = tokio::time::timeout(Duration::from_secs(1), queued.recv())
            .await
            .expect("close queued")
            .unwrap();
        assert_eq!(close.kind, FrameKind::ChannelClose);
        assert_eq!(close.channel, 7);
        sup.wait().await.unwrap();
    }

    #[test]
    fn disconnect_kinds() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_disconnect(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}

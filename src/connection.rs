//! `Connection`: the state machine driving one transport (client, peer
//! server side, or a secondary handle bound to a primary connection on
//! another thread), serial allocation, and reply correlation.
//!
//! A client connection moves `Unconnected -> Authenticating ->
//! AwaitingUniqueName -> Connected`; a peer-to-peer connection skips
//! straight to `Connected` with no handshake. `PendingReply` resolves
//! through an `Arc<(Mutex<ReplySlot>, Condvar)>` shared with whichever
//! `Connection` completes it, so completion crosses threads directly
//! through that handle; a channel plus `CommutexLink` carries the
//! genuinely asynchronous pushes that have no waiter to wake —
//! spontaneous messages and the disconnect notice. `close()` unlinks
//! every secondary without letting one blocked link hold up the rest,
//! then fails every outstanding reply locally.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::auth::Authenticator;
use crate::commutex::{CommutexLink, CommutexLocker, CommutexUnlinker};
use crate::dispatcher::{EventDispatcher, IoHandler, TimerId};
use crate::error::{Error, Result};
use crate::message::{Message, Parsed};
use crate::poller::Interest;
use crate::transport::{ReadOutcome, Transport, WriteOutcome};

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(25_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    ServerWaitingForClient,
    Authenticating,
    AwaitingUniqueName,
    Connected,
    Disconnected,
}

/// Events a primary connection pushes to a secondary; there is no
/// matching `ToPrimaryEvent` because a secondary talks back to the
/// primary through the shared `Arc<Mutex<ConnectionInner>>` directly
/// (serial allocation, enqueueing a message, cancelling a reply).
pub enum ToSecondaryEvent {
    SpontaneousMessageReceived(Message),
    UniqueNameReceived(String),
    MainDisconnect,
}

enum ReplySlot {
    Waiting,
    Finished(Result<Message>),
}

struct PendingEntry {
    shared: Arc<(Mutex<ReplySlot>, Condvar)>,
    timer_id: Option<TimerId>,
}

struct SecondaryLink {
    commutex: CommutexLink,
    to_secondary: std::sync::mpsc::Sender<ToSecondaryEvent>,
}

struct ConnectionInner {
    state: ConnectionState,
    role: Role,
    transport: Box<dyn Transport>,
    authenticator: Option<Authenticator>,
    recv_buf: Vec<u8>,
    send_queue: VecDeque<(Vec<u8>, Vec<RawFd>)>,
    next_serial: u32,
    pending: HashMap<u32, PendingEntry>,
    spontaneous_receiver: Option<Box<dyn FnMut(Message) + Send>>,
    default_timeout: Duration,
    unique_name: Option<String>,
    secondary_links: Vec<SecondaryLink>,
    /// Serial of the `Hello` call sent on entering `AwaitingUniqueName`;
    /// its reply is the one carrying our assigned unique bus name.
    hello_serial: Option<u32>,
    /// Non-owning handle to the dispatcher driving this connection, set
    /// via `set_event_dispatcher`. `send()` uses it to register each
    /// reply's timeout; without one, replies only ever resolve by
    /// arriving or by `close()`.
    event_dispatcher: Option<Weak<Mutex<EventDispatcher>>>,
    /// Timers whose reply already resolved normally and so need
    /// cancelling, buffered here rather than cancelled on the spot: the
    /// code that discovers them (`handle_incoming`, via `pump()`) runs
    /// with this connection's own lock held, and locking the dispatcher
    /// in that order would invert the timeout callback's
    /// dispatcher-then-connection locking order.
    timers_to_cancel: Vec<TimerId>,
}

impl ConnectionInner {
    fn take_next_serial(&mut self) -> u32 {
        let s = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        if self.next_serial == 0 {
            self.next_serial = 1;
        }
        s
    }

    fn unregister_pending_reply(&mut self, serial: u32) {
        self.pending.remove(&serial);
    }

    /// Resolves a pending reply and returns its timer id, if any, so the
    /// caller can cancel the now-pointless timeout with the dispatcher
    /// (this method never touches `event_dispatcher` itself, since the
    /// timeout callback below calls this while the dispatcher's own lock
    /// is already held).
    fn finish_pending(&mut self, serial: u32, result: Result<Message>) -> Option<TimerId> {
        let entry = self.pending.remove(&serial)?;
        let (lock, cvar) = &*entry.shared;
        *lock.lock().unwrap() = ReplySlot::Finished(result);
        cvar.notify_all();
        entry.timer_id
    }

    fn buffer_timer_cancellation(&mut self, timer_id: Option<TimerId>) {
        if let Some(id) = timer_id {
            self.timers_to_cancel.push(id);
        }
    }

    /// Drains the buffered timer ids so the caller can cancel them with
    /// the dispatcher after releasing this connection's own lock.
    fn take_timers_to_cancel(&mut self) -> Vec<TimerId> {
        std::mem::take(&mut self.timers_to_cancel)
    }

    fn enqueue_bytes(&mut self, bytes: Vec<u8>, fds: Vec<RawFd>) {
        let was_empty = self.send_queue.is_empty();
        self.send_queue.push_back((bytes, fds));
        if was_empty && self.state == ConnectionState::Connected {
            self.flush_send_queue();
        }
    }

    fn flush_send_queue(&mut self) {
        while let Some((bytes, fds)) = self.send_queue.front() {
            match self.transport.write(bytes, fds) {
                Ok(WriteOutcome::Wrote(n)) if n == bytes.len() => {
                    self.send_queue.pop_front();
                }
                Ok(WriteOutcome::Wrote(n)) => {
                    let (mut bytes, fds) = self.send_queue.pop_front().unwrap();
                    bytes.drain(..n);
                    self.send_queue.push_front((bytes, fds));
                    break;
                }
                Ok(WriteOutcome::WouldBlock) => break,
                Err(_) => {
                    self.state = ConnectionState::Disconnected;
                    break;
                }
            }
        }
    }

    fn prepare_and_queue(&mut self, mut message: Message, serial: u32) -> Result<()> {
        message.set_serial(serial);
        let fds = message.body.fds.clone();
        let bytes = message.serialize()?;
        self.enqueue_bytes(bytes, fds);
        Ok(())
    }

    fn handle_incoming(&mut self, msg: Message) {
        if let Some(reply_serial) = msg.reply_serial() {
            if self.pending.contains_key(&reply_serial) {
                let is_error = matches!(msg.message_type, crate::message::MessageType::Error);
                let result = if is_error { Err(Error::RemoteDisconnect) } else { Ok(msg) };
                let timer_id = self.finish_pending(reply_serial, result);
                self.buffer_timer_cancellation(timer_id);
                return;
            }
        }
        if let Some(cb) = self.spontaneous_receiver.as_mut() {
            cb(msg);
            return;
        }
        // No local receiver: fan out to secondaries that are listening.
        let mut dead = Vec::new();
        for (i, link) in self.secondary_links.iter().enumerate() {
            if link.commutex.is_unlinked() {
                dead.push(i);
                continue;
            }
            // Each secondary gets its own clone; only the first clone is
            // cheap to make since `Message` doesn't implement `Clone` by
            // design (it may own file descriptors), so only forward once,
            // to the first still-linked secondary. A future multi-secondary
            // broadcast would need `Message` to expose a fd-safe clone.
            let _ = link.to_secondary.send(ToSecondaryEvent::SpontaneousMessageReceived(msg));
            break;
        }
        for i in dead.into_iter().rev() {
            self.secondary_links.remove(i);
        }
    }

    fn prune_unlinked_secondaries(&mut self) {
        self.secondary_links.retain(|link| !link.commutex.is_unlinked());
    }

    /// Fails every outstanding reply locally and returns the timer ids that
    /// are now stale, for the caller to cancel once it has released this
    /// connection's own lock (mirrors the lock-ordering constraint on
    /// `send()`'s timer setup: never hold both locks in the same order the
    /// timeout callback takes them).
    fn cancel_all_pending(&mut self, err_factory: impl Fn() -> Error) -> Vec<TimerId> {
        let serials: Vec<u32> = self.pending.keys().copied().collect();
        let mut timer_ids = Vec::new();
        for serial in serials {
            if let Some(id) = self.finish_pending(serial, Err(err_factory())) {
                timer_ids.push(id);
            }
        }
        timer_ids
    }
}

/// A pending method call reply. Dropping it before it finishes
/// unregisters it from the owning connection, mirroring
/// `PendingReply::~PendingReply()`.
pub struct PendingReply {
    shared: Arc<(Mutex<ReplySlot>, Condvar)>,
    serial: u32,
    connection: Weak<Mutex<ConnectionInner>>,
}

impl PendingReply {
    pub fn is_finished(&self) -> bool {
        matches!(*self.shared.0.lock().unwrap(), ReplySlot::Finished(_))
    }

    /// Blocks until the reply arrives, is cancelled, or times out. The
    /// connection holding the transport must have its `dispatch()` (or
    /// `pump()`) driven by some thread for the wait to make progress.
    pub fn wait(self) -> Result<Message> {
        let (lock, cvar) = &*self.shared;
        let mut slot = lock.lock().unwrap();
        loop {
            if matches!(*slot, ReplySlot::Finished(_)) {
                break;
            }
            slot = cvar.wait(slot).unwrap();
        }
        match std::mem::replace(&mut *slot, ReplySlot::Finished(Err(Error::NoSuchPendingReply))) {
            ReplySlot::Finished(r) => r,
            ReplySlot::Waiting => unreachable!(),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let finished = matches!(*self.shared.0.lock().unwrap(), ReplySlot::Finished(_));
        if !finished {
            if let Some(inner) = self.connection.upgrade() {
                inner.lock().unwrap().unregister_pending_reply(self.serial);
            }
        }
    }
}

/// A connected transport plus its serial/reply-correlation state.
/// Cloning shares the same underlying state, the way a `Transceiver`
/// and its secondaries share one logical connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnectionInner>>,
}

impl Connection {
    fn from_inner(inner: ConnectionInner) -> Self {
        Connection { inner: Arc::new(Mutex::new(inner)) }
    }

    /// Begin the `AUTH EXTERNAL` handshake as a bus client. Caller drives
    /// progress via `pump()`; once `state()` reaches `Connected`,
    /// `unique_name()` holds the name assigned by the bus.
    pub fn connect_client(transport: Box<dyn Transport>, uid: u32) -> Self {
        let mut authenticator = Authenticator::new();
        let greeting = authenticator.start(uid);
        let mut inner = ConnectionInner {
            state: ConnectionState::Authenticating,
            role: Role::Client,
            transport,
            authenticator: Some(authenticator),
            recv_buf: Vec::new(),
            send_queue: VecDeque::new(),
            next_serial: 1,
            pending: HashMap::new(),
            spontaneous_receiver: None,
            default_timeout: DEFAULT_REPLY_TIMEOUT,
            unique_name: None,
            secondary_links: Vec::new(),
            hello_serial: None,
            event_dispatcher: None,
            timers_to_cancel: Vec::new(),
        };
        inner.enqueue_bytes(greeting, Vec::new());
        Connection::from_inner(inner)
    }

    /// Wrap an already-accepted peer-to-peer transport with no auth
    /// handshake, matching `ConnectionInfo::Bus::PeerToPeer`.
    pub fn from_accepted_peer(transport: Box<dyn Transport>, role: Role) -> Self {
        let inner = ConnectionInner {
            state: ConnectionState::Connected,
            role,
            transport,
            authenticator: None,
            recv_buf: Vec::new(),
            send_queue: VecDeque::new(),
            next_serial: 1,
            pending: HashMap::new(),
            spontaneous_receiver: None,
            default_timeout: DEFAULT_REPLY_TIMEOUT,
            unique_name: None,
            secondary_links: Vec::new(),
            hello_serial: None,
            event_dispatcher: None,
            timers_to_cancel: Vec::new(),
        };
        Connection::from_inner(inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn role(&self) -> Role {
        self.inner.lock().unwrap().role
    }

    pub fn unique_name(&self) -> Option<String> {
        self.inner.lock().unwrap().unique_name.clone()
    }

    pub fn set_spontaneous_message_receiver(&self, cb: Box<dyn FnMut(Message) + Send>) {
        self.inner.lock().unwrap().spontaneous_receiver = Some(cb);
    }

    pub fn set_default_reply_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().default_timeout = timeout;
    }

    /// Create a secondary handle sharing this connection's wire, linked
    /// through a `CommutexLink`, intended to be moved to another thread.
    pub fn create_secondary(&self) -> SecondaryConnection {
        let (main_half, secondary_half) = CommutexLink::create_pair();
        let (to_secondary_tx, to_secondary_rx) = std::sync::mpsc::channel();

        self.inner.lock().unwrap().secondary_links.push(SecondaryLink { commutex: main_half, to_secondary: to_secondary_tx });

        SecondaryConnection {
            primary: self.inner.clone(),
            commutex: secondary_half,
            from_primary: to_secondary_rx,
            unique_name: self.unique_name(),
        }
    }

    /// Attach the dispatcher driving this connection's I/O, so `send()`
    /// can register each reply's timeout as it goes out. Held as a
    /// `Weak` reference: the dispatcher is owned by the application, not
    /// by the connection.
    pub fn set_event_dispatcher(&self, dispatcher: &Arc<Mutex<EventDispatcher>>) {
        self.inner.lock().unwrap().event_dispatcher = Some(Arc::downgrade(dispatcher));
    }

    /// Send a message and return a handle to its eventual reply. A
    /// serial is always allocated and tracked, so `NO_REPLY_EXPECTED` is
    /// cleared if the caller set it. `timeout` overrides
    /// `set_default_reply_timeout`'s value for this call only; the
    /// timeout only actually fires if a dispatcher was attached via
    /// `set_event_dispatcher` — without one, the reply only resolves by
    /// arriving or by `close()`.
    pub fn send(&self, mut message: Message, timeout: Option<Duration>) -> PendingReply {
        let shared = Arc::new((Mutex::new(ReplySlot::Waiting), Condvar::new()));
        let mut guard = self.inner.lock().unwrap();
        let serial = guard.take_next_serial();
        message.flags.remove(crate::message::HeaderFlags::NO_REPLY_EXPECTED);

        let outcome = guard.prepare_and_queue(message, serial);
        let dispatcher = guard.event_dispatcher.as_ref().and_then(Weak::upgrade);
        let effective_timeout = timeout.unwrap_or(guard.default_timeout);
        if outcome.is_ok() {
            guard.pending.insert(serial, PendingEntry { shared: shared.clone(), timer_id: None });
        }
        // Dropped before touching the dispatcher's own lock, so a timer
        // firing concurrently and locking this connection to deliver
        // `Timeout` can never be waiting on a lock we're holding here.
        drop(guard);

        match outcome {
            Ok(()) => {
                if let Some(dispatcher) = dispatcher {
                    // Weak: a timer sitting in the dispatcher must never by
                    // itself keep the connection alive once the application
                    // has dropped every `Connection` handle to it.
                    let connection = Arc::downgrade(&self.inner);
                    let id = dispatcher.lock().unwrap().add_timer(
                        effective_timeout,
                        None,
                        Box::new(move || {
                            // Runs with the dispatcher's lock already held,
                            // so it must not call back into it (e.g. to
                            // cancel its own now-fired timer_id).
                            if let Some(connection) = connection.upgrade() {
                                connection.lock().unwrap().finish_pending(serial, Err(Error::Timeout));
                            }
                        }),
                    );
                    if let Some(entry) = self.inner.lock().unwrap().pending.get_mut(&serial) {
                        entry.timer_id = Some(id);
                    }
                }
            }
            Err(e) => {
                let (lock, cvar) = &*shared;
                *lock.lock().unwrap() = ReplySlot::Finished(Err(e));
                cvar.notify_all();
            }
        }

        PendingReply { shared, serial, connection: Arc::downgrade(&self.inner) }
    }

    pub fn send_no_reply(&self, mut message: Message) -> Result<()> {
        message.flags.insert(crate::message::HeaderFlags::NO_REPLY_EXPECTED);
        let mut guard = self.inner.lock().unwrap();
        let serial = guard.take_next_serial();
        guard.prepare_and_queue(message, serial)
    }

    /// Drive one round of I/O: flush the send queue and read and
    /// dispatch any complete incoming messages.
    pub fn pump(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.flush_send_queue();
        guard.prune_unlinked_secondaries();

        let mut buf = [0u8; 4096];
        let result = loop {
            match guard.transport.read(&mut buf) {
                Ok(ReadOutcome::WouldBlock) => break Ok(()),
                Ok(ReadOutcome::Eof) => {
                    guard.state = ConnectionState::Disconnected;
                    break Ok(());
                }
                Ok(ReadOutcome::Data { bytes, fds }) => {
                    guard.recv_buf.extend_from_slice(&buf[..bytes]);
                    Self::drive_receive(&mut guard, fds);
                }
                Err(e) => break Err(e),
            }
        };

        let timer_ids = guard.take_timers_to_cancel();
        let dispatcher = guard.event_dispatcher.as_ref().and_then(Weak::upgrade);
        drop(guard);
        if let Some(dispatcher) = dispatcher {
            if !timer_ids.is_empty() {
                let mut dispatcher = dispatcher.lock().unwrap();
                for id in timer_ids {
                    dispatcher.cancel_timer(id);
                }
            }
        }
        result
    }

    fn drive_receive(guard: &mut ConnectionInner, mut fds: Vec<crate::fd::OwnedFd>) {
        loop {
            match guard.state {
                ConnectionState::Authenticating => {
                    let Some(authenticator) = guard.authenticator.as_mut() else { break };
                    let input = std::mem::take(&mut guard.recv_buf);
                    match authenticator.feed(&input) {
                        Ok(reply) => {
                            if !reply.is_empty() {
                                guard.enqueue_bytes(reply, Vec::new());
                            }
                            if matches!(authenticator.state(), crate::auth::AuthState::Authenticated) {
                                guard.authenticator = None;
                                guard.state = ConnectionState::AwaitingUniqueName;
                                let hello = Message::method_call(
                                    "/org/freedesktop/DBus",
                                    Some("org.freedesktop.DBus"),
                                    "Hello",
                                    Some("org.freedesktop.DBus"),
                                )
                                .expect("Hello is a well-formed method call");
                                let serial = guard.take_next_serial();
                                if guard.prepare_and_queue(hello, serial).is_ok() {
                                    guard.hello_serial = Some(serial);
                                } else {
                                    guard.state = ConnectionState::Disconnected;
                                    break;
                                }
                            } else {
                                break;
                            }
                        }
                        Err(_) => {
                            guard.state = ConnectionState::Disconnected;
                            break;
                        }
                    }
                }
                ConnectionState::AwaitingUniqueName | ConnectionState::Connected => {
                    match Message::try_parse(&guard.recv_buf, std::mem::take(&mut fds)) {
                        Ok(Parsed::Incomplete) => break,
                        Ok(Parsed::Complete { message, consumed }) => {
                            guard.recv_buf.drain(..consumed);
                            if guard.state == ConnectionState::AwaitingUniqueName
                                && message.reply_serial() == guard.hello_serial
                            {
                                guard.hello_serial = None;
                                if let Some(name) = extract_hello_reply(&message) {
                                    guard.unique_name = Some(name.clone());
                                    for link in &guard.secondary_links {
                                        let _ = link.to_secondary.send(ToSecondaryEvent::UniqueNameReceived(name.clone()));
                                    }
                                }
                                guard.state = ConnectionState::Connected;
                                continue;
                            }
                            guard.handle_incoming(message);
                        }
                        Err(_) => {
                            guard.state = ConnectionState::Disconnected;
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Close the connection: unlink every secondary without letting one
    /// blocked link hold up the rest, then fail every outstanding reply
    /// locally, mirroring `TransceiverPrivate::close()`.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        let _ = guard.transport.close();
        guard.state = ConnectionState::Disconnected;

        let mut remaining: Vec<SecondaryLink> = std::mem::take(&mut guard.secondary_links);
        while !remaining.is_empty() {
            let mut next_round = Vec::new();
            for link in remaining {
                let unlinker = CommutexUnlinker::new(&link.commutex, false);
                if unlinker.will_succeed() {
                    let _ = link.to_secondary.send(ToSecondaryEvent::MainDisconnect);
                    unlinker.unlink_now();
                } else {
                    next_round.push(link);
                }
            }
            remaining = next_round;
        }

        let timer_ids = guard.cancel_all_pending(|| Error::LocalDisconnect);
        let dispatcher = guard.event_dispatcher.as_ref().and_then(Weak::upgrade);
        drop(guard);
        if let Some(dispatcher) = dispatcher {
            let mut dispatcher = dispatcher.lock().unwrap();
            for id in timer_ids {
                dispatcher.cancel_timer(id);
            }
        }
    }
}

fn extract_hello_reply(message: &Message) -> Option<String> {
    message.reply_serial()?;
    let mut reader = message.body.reader();
    reader.read_string().ok().map(|s| s.to_string())
}

/// The handle created by `Connection::create_secondary`, meant to be
/// moved to its own thread with its own `EventDispatcher`.
pub struct SecondaryConnection {
    primary: Arc<Mutex<ConnectionInner>>,
    commutex: CommutexLink,
    from_primary: std::sync::mpsc::Receiver<ToSecondaryEvent>,
    unique_name: Option<String>,
}

impl SecondaryConnection {
    pub fn unique_name(&self) -> Option<String> {
        self.unique_name.clone()
    }

    /// Borrow a serial from the primary and enqueue through it,
    /// returning `LocalDisconnect` immediately if the primary has gone
    /// away, matching `TransceiverPrivate::prepareSend`'s `CommutexLocker`
    /// check.
    pub fn send(&mut self, message: Message) -> PendingReply {
        let shared = Arc::new((Mutex::new(ReplySlot::Waiting), Condvar::new()));
        let locker = CommutexLocker::new(&self.commutex);
        if !locker.has_lock() {
            let (lock, cvar) = &*shared;
            *lock.lock().unwrap() = ReplySlot::Finished(Err(Error::LocalDisconnect));
            cvar.notify_all();
            return PendingReply { shared, serial: 0, connection: Weak::new() };
        }

        let mut primary = self.primary.lock().unwrap();
        let serial = primary.take_next_serial();
        primary.pending.insert(serial, PendingEntry { shared: shared.clone(), timer_id: None });
        let _ = primary.prepare_and_queue(message, serial);
        drop(primary);

        PendingReply { shared, serial, connection: Arc::downgrade(&self.primary) }
    }

    /// Drain events forwarded from the primary (spontaneous messages,
    /// the unique name, or the disconnect notice). Does not block.
    pub fn poll_events(&mut self) -> Vec<ToSecondaryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.from_primary.try_recv() {
            if let ToSecondaryEvent::UniqueNameReceived(ref name) = event {
                self.unique_name = Some(name.clone());
            }
            out.push(event);
        }
        out
    }

    pub fn is_linked(&self) -> bool {
        !self.commutex.is_unlinked()
    }
}

impl Drop for SecondaryConnection {
    fn drop(&mut self) {
        CommutexUnlinker::new(&self.commutex, true).unlink_now();
    }
}

/// Adapts a `Connection` to the `EventDispatcher`'s readiness callbacks.
pub struct ConnectionIoHandler {
    connection: Connection,
}

impl ConnectionIoHandler {
    pub fn new(connection: Connection) -> Self {
        ConnectionIoHandler { connection }
    }

    pub fn interest(&self) -> Interest {
        let guard = self.connection.inner.lock().unwrap();
        Interest { read: true, write: !guard.send_queue.is_empty() }
    }
}

impl IoHandler for ConnectionIoHandler {
    fn handle_readable(&mut self) {
        let _ = self.connection.pump();
    }

    fn handle_writable(&mut self) {
        self.connection.inner.lock().unwrap().flush_send_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arguments::{ByteOrderTag, Writer};
    use crate::transport::{ReadOutcome, WriteOutcome};
    use std::collections::VecDeque as Deque;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    /// An in-memory duplex byte pipe standing in for a socket pair, so
    /// connection tests don't need a real transport.
    #[derive(Clone)]
    struct LoopbackTransport {
        inbox: StdArc<StdMutex<Deque<u8>>>,
        outbox: StdArc<StdMutex<Deque<u8>>>,
        open: StdArc<StdMutex<bool>>,
    }

    fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
        let a_to_b = StdArc::new(StdMutex::new(Deque::new()));
        let b_to_a = StdArc::new(StdMutex::new(Deque::new()));
        let open = StdArc::new(StdMutex::new(true));
        (
            LoopbackTransport { inbox: b_to_a.clone(), outbox: a_to_b.clone(), open: open.clone() },
            LoopbackTransport { inbox: a_to_b, outbox: b_to_a, open },
        )
    }

    impl Transport for LoopbackTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
            let mut inbox = self.inbox.lock().unwrap();
            if inbox.is_empty() {
                return Ok(ReadOutcome::WouldBlock);
            }
            let n = inbox.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbox.pop_front().unwrap();
            }
            Ok(ReadOutcome::Data { bytes: n, fds: Vec::new() })
        }

        fn write(&mut self, buf: &[u8], _fds: &[RawFd]) -> Result<WriteOutcome> {
            self.outbox.lock().unwrap().extend(buf.iter().copied());
            Ok(WriteOutcome::Wrote(buf.len()))
        }

        fn close(&mut self) -> Result<()> {
            *self.open.lock().unwrap() = false;
            Ok(())
        }

        fn is_open(&self) -> bool {
            *self.open.lock().unwrap()
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    #[test]
    fn serial_allocation_skips_zero_and_increments() {
        let mut inner = ConnectionInner {
            state: ConnectionState::Connected,
            role: Role::Client,
            transport: Box::new(loopback_pair().0),
            authenticator: None,
            recv_buf: Vec::new(),
            send_queue: VecDeque::new(),
            next_serial: u32::MAX,
            pending: HashMap::new(),
            spontaneous_receiver: None,
            default_timeout: DEFAULT_REPLY_TIMEOUT,
            unique_name: None,
            secondary_links: Vec::new(),
            hello_serial: None,
            event_dispatcher: None,
            timers_to_cancel: Vec::new(),
        };
        assert_eq!(inner.take_next_serial(), u32::MAX);
        assert_eq!(inner.take_next_serial(), 1);
        assert_eq!(inner.take_next_serial(), 2);
    }

    #[test]
    fn peer_to_peer_round_trip_resolves_pending_reply() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (client_transport, server_transport) = loopback_pair();
        let client = Connection::from_accepted_peer(Box::new(client_transport), Role::Client);
        let server = Connection::from_accepted_peer(Box::new(server_transport), Role::Server);

        let call = Message::method_call("/foo", Some("org.bar"), "Ping", None).unwrap();
        let reply = client.send(call, None);
        client.pump().unwrap();
        server.pump().unwrap();

        let response = Message::method_return(reply.serial);
        server.send_no_reply(response).unwrap();
        server.pump().unwrap();
        client.pump().unwrap();

        assert!(reply.is_finished());
        let msg = reply.wait().unwrap();
        assert_eq!(msg.reply_serial(), Some(1));
    }

    #[test]
    fn close_cancels_pending_replies_with_local_disconnect() {
        let (client_transport, _server_transport) = loopback_pair();
        let client = Connection::from_accepted_peer(Box::new(client_transport), Role::Client);
        let call = Message::method_call("/foo", Some("org.bar"), "Ping", None).unwrap();
        let reply = client.send(call, None);
        client.pump().unwrap();

        client.close();
        assert!(reply.is_finished());
        match reply.wait() {
            Err(Error::LocalDisconnect) => {}
            other => panic!("expected LocalDisconnect, got {other:?}"),
        }
    }

    #[test]
    fn dropping_unfinished_pending_reply_unregisters_it() {
        let (client_transport, _server_transport) = loopback_pair();
        let client = Connection::from_accepted_peer(Box::new(client_transport), Role::Client);
        let call = Message::method_call("/foo", Some("org.bar"), "Ping", None).unwrap();
        let reply = client.send(call, None);
        let serial = reply.serial;
        drop(reply);
        assert!(!client.inner.lock().unwrap().pending.contains_key(&serial));
    }

    fn drain_all(transport: &mut LoopbackTransport) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match transport.read(&mut buf).unwrap() {
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => break,
                ReadOutcome::Data { bytes, .. } => out.extend_from_slice(&buf[..bytes]),
            }
        }
        out
    }

    #[test]
    fn connect_client_completes_auth_and_hello_handshake() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (client_transport, mut server_transport) = loopback_pair();
        let client = Connection::connect_client(Box::new(client_transport), 1000);

        // pump() only flushes what was already queued *before* it was
        // called, so every reply the handshake feeds back needs one pump
        // to be read and queued, then a second to put it on the wire.
        client.pump().unwrap();
        let greeting = drain_all(&mut server_transport);
        assert_eq!(greeting[0], 0);
        assert!(String::from_utf8_lossy(&greeting[1..]).starts_with("AUTH EXTERNAL "));
        server_transport.write(b"OK 1234deadbeef1234deadbeef1234de\r\n", &[]).unwrap();

        client.pump().unwrap();
        client.pump().unwrap();
        let negotiate = drain_all(&mut server_transport);
        assert_eq!(negotiate, b"NEGOTIATE_UNIX_FD\r\n");
        server_transport.write(b"AGREE_UNIX_FD\r\n", &[]).unwrap();

        client.pump().unwrap();
        client.pump().unwrap();
        let begin_and_hello = drain_all(&mut server_transport);
        assert!(begin_and_hello.starts_with(b"BEGIN\r\n"));
        let (_, hello_bytes) = begin_and_hello.split_at(b"BEGIN\r\n".len());
        let hello = match Message::try_parse(hello_bytes, Vec::new()).unwrap() {
            Parsed::Complete { message, .. } => message,
            Parsed::Incomplete => panic!("expected a complete Hello message"),
        };
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.interface(), Some("org.freedesktop.DBus"));

        let mut w = Writer::with_byte_order(ByteOrderTag::Little);
        w.write_string(":1.42").unwrap();
        let body = w.finish().unwrap();
        let mut reply = Message::method_return(hello.serial).with_body(body);
        reply.set_serial(99);
        server_transport.write(&reply.serialize().unwrap(), &[]).unwrap();

        client.pump().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.unique_name(), Some(":1.42".to_string()));
    }

    #[test]
    fn secondary_send_fails_locally_once_unlinked() {
        let (client_transport, _server_transport) = loopback_pair();
        let client = Connection::from_accepted_peer(Box::new(client_transport), Role::Client);
        let mut secondary = client.create_secondary();
        client.close();
        let call = Message::method_call("/foo", Some("org.bar"), "Ping", None).unwrap();
        let reply = secondary.send(call);
        match reply.wait() {
            Err(Error::LocalDisconnect) => {}
            other => panic!("expected LocalDisconnect, got {other:?}"),
        }
    }
}

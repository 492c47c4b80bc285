use std::{
    io::{self, Read, Write},
    mem, net,
    time::Instant,
};

use cantata::{
    ClientControl, CommandHandler, CommandOutcome, Config, IdleEvents, Permission,
    PROTOCOL_VERSION,
};
use mio::{Interest, Registry, Token, event::Source};
use tracing::{debug, warn};

use crate::{
    deferred::{DeferredQueue, DrainResult, OutputOverflow},
    input::{FillOutcome, InputBuffer},
};

/// Reply bytes collect here before the output policy picks a path.
const STAGING_BUFFER_SIZE: usize = 4096;

/// What the reactor should do with a session after a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Drop this session.
    Close,
    /// Tear down the whole reactor.
    Kill,
}

/// Transport under a session: TCP or a local Unix socket.
pub enum ClientStream {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
}

impl ClientStream {
    fn shutdown(&self, how: net::Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            Self::Unix(s) => s.shutdown(how),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl Source for ClientStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}

/// Command-list accumulation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum ListMode {
    #[default]
    Off,
    Collecting {
        per_step_ack: bool,
    },
}

enum DirectWrite {
    Complete,
    /// `n` bytes reached the kernel; the rest of this write must be
    /// deferred.
    Partial(usize),
    Blocked,
    Failed,
}

fn direct_write(stream: &mut impl Write, bytes: &[u8]) -> DirectWrite {
    match stream.write(bytes) {
        Ok(0) => DirectWrite::Failed,
        Ok(n) if n == bytes.len() => DirectWrite::Complete,
        Ok(n) => DirectWrite::Partial(n),
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::Interrupted =>
        {
            DirectWrite::Blocked
        }
        Err(err) => {
            debug!(?err, "client write");
            DirectWrite::Failed
        }
    }
}

/// One accepted connection: identity, buffers, command-list accumulator
/// and idle state. Only the reactor thread touches it.
pub struct Client {
    num: u64,
    token: Token,
    peer: String,
    uid: Option<u32>,
    permission: Permission,

    /// `None` once expired: the descriptor is closed and the session is
    /// waiting for the next sweep to reclaim it.
    stream: Option<ClientStream>,
    /// Mirrors the interest currently registered with the poll: writable
    /// while deferred output is pending, readable otherwise.
    armed_writable: bool,

    input: InputBuffer,
    staging: Box<[u8; STAGING_BUFFER_SIZE]>,
    staged: usize,
    deferred: DeferredQueue,

    list_mode: ListMode,
    list_lines: Vec<String>,
    list_size: usize,
    max_list_size: usize,

    last_activity: Instant,

    idle_waiting: bool,
    idle_pending: IdleEvents,
    idle_subscriptions: IdleEvents,
}

impl Client {
    pub(crate) fn new(
        stream: ClientStream,
        token: Token,
        num: u64,
        peer: String,
        uid: Option<u32>,
        config: &Config,
    ) -> Self {
        Self {
            num,
            token,
            peer,
            uid,
            permission: config.default_permissions,
            stream: Some(stream),
            armed_writable: false,
            input: InputBuffer::new(),
            staging: Box::new([0; STAGING_BUFFER_SIZE]),
            staged: 0,
            deferred: DeferredQueue::new(config.max_output_buffer_size),
            list_mode: ListMode::Off,
            list_lines: Vec::new(),
            list_size: 0,
            max_list_size: config.max_command_list_size,
            last_activity: Instant::now(),
            idle_waiting: false,
            idle_pending: IdleEvents::empty(),
            idle_subscriptions: IdleEvents::empty(),
        }
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_expired(&self) -> bool {
        self.stream.is_none()
    }

    pub fn idle_waiting(&self) -> bool {
        self.idle_waiting
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Closes the descriptor and leaves the carcass for the next sweep.
    /// Idempotent; an expired session performs no further I/O.
    pub(crate) fn expire(&mut self, registry: &Registry) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if let Err(err) = stream.deregister(registry) {
            debug!(?err, client = self.num, "deregister on expire");
        }
        let _ = stream.shutdown(net::Shutdown::Both);
        debug!(client = self.num, peer = %self.peer, "session expired");
    }

    /// Sent once, straight after accept, outside the staged path.
    pub(crate) fn greet(&mut self, registry: &Registry) {
        let greeting = format!("OK MPD {PROTOCOL_VERSION}\n");
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match direct_write(stream, greeting.as_bytes()) {
            DirectWrite::Complete => {}
            DirectWrite::Partial(n) => {
                let queued = self.deferred.enqueue(&greeting.as_bytes()[n..]);
                self.after_enqueue(registry, queued);
            }
            DirectWrite::Blocked => {
                let queued = self.deferred.enqueue(greeting.as_bytes());
                self.after_enqueue(registry, queued);
            }
            DirectWrite::Failed => self.expire(registry),
        }
    }

    // ---- output path ----

    /// Appends reply bytes to the staging buffer, flushing whenever it
    /// fills.
    pub(crate) fn write_bytes(&mut self, registry: &Registry, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.is_expired() {
                return;
            }
            let space = STAGING_BUFFER_SIZE - self.staged;
            if space == 0 {
                self.write_out(registry);
                continue;
            }
            let n = space.min(bytes.len());
            self.staging[self.staged..self.staged + n].copy_from_slice(&bytes[..n]);
            self.staged += n;
            bytes = &bytes[n..];
        }
    }

    /// Empties the staging buffer: direct write while nothing is queued,
    /// otherwise everything goes through the deferred queue to keep the
    /// byte order intact.
    pub(crate) fn write_out(&mut self, registry: &Registry) {
        let len = mem::replace(&mut self.staged, 0);
        if len == 0 || self.stream.is_none() {
            return;
        }

        if !self.deferred.is_empty() {
            let queued = self.deferred.enqueue(&self.staging[..len]);
            self.after_enqueue(registry, queued);
            if !self.is_expired() {
                self.drain_deferred(registry);
            }
            return;
        }

        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match direct_write(stream, &self.staging[..len]) {
            DirectWrite::Complete => {}
            DirectWrite::Partial(n) => {
                let queued = self.deferred.enqueue(&self.staging[n..len]);
                self.after_enqueue(registry, queued);
            }
            DirectWrite::Blocked => {
                let queued = self.deferred.enqueue(&self.staging[..len]);
                self.after_enqueue(registry, queued);
            }
            DirectWrite::Failed => self.expire(registry),
        }
    }

    fn after_enqueue(&mut self, registry: &Registry, result: Result<(), OutputOverflow>) {
        match result {
            Ok(()) => self.update_interest(registry),
            Err(overflow) => {
                warn!(
                    client = self.num,
                    bytes = overflow.attempted,
                    limit = overflow.limit,
                    "output buffer full, closing"
                );
                self.expire(registry);
            }
        }
    }

    /// Flushes queued output; expires the session on a hard write error.
    pub(crate) fn drain_deferred(&mut self, registry: &Registry) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match self.deferred.drain(stream) {
            DrainResult::Empty => self.update_interest(registry),
            DrainResult::Blocked => {}
            DrainResult::Failed => self.expire(registry),
        }
    }

    /// Backpressure: a session with queued output is polled for
    /// writability only; reads resume once the queue is empty.
    fn update_interest(&mut self, registry: &Registry) {
        let want_writable = !self.deferred.is_empty();
        if want_writable == self.armed_writable {
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let interest = if want_writable { Interest::WRITABLE } else { Interest::READABLE };
        if let Err(err) = registry.reregister(stream, self.token, interest) {
            debug!(?err, client = self.num, "interest reregister");
            self.expire(registry);
            return;
        }
        self.armed_writable = want_writable;
    }

    // ---- idle engine ----

    /// Enters idle mode. Returns `true` when already-pending flags were
    /// delivered synchronously.
    pub(crate) fn idle_wait(&mut self, registry: &Registry, subscriptions: IdleEvents) -> bool {
        self.idle_subscriptions = subscriptions;
        self.idle_waiting = true;
        if self.idle_pending.intersects(subscriptions) {
            self.idle_deliver(registry);
            true
        } else {
            false
        }
    }

    /// Records raised event flags, waking the session if it is blocked on
    /// a matching subscription.
    pub(crate) fn idle_add(&mut self, registry: &Registry, events: IdleEvents) {
        if self.is_expired() {
            return;
        }
        self.idle_pending |= events;
        if self.idle_waiting && self.idle_pending.intersects(self.idle_subscriptions) {
            self.idle_deliver(registry);
        }
    }

    fn idle_deliver(&mut self, registry: &Registry) {
        let fired = self.idle_pending & self.idle_subscriptions;
        for name in fired.names() {
            let line = format!("changed: {name}\n");
            self.write_bytes(registry, line.as_bytes());
        }
        self.write_bytes(registry, b"OK\n");
        self.idle_pending = IdleEvents::empty();
        self.idle_waiting = false;
        self.touch();
        self.write_out(registry);
    }

    // ---- request processing ----

    /// One readable event: pull bytes and run every complete line,
    /// repeating until the kernel runs dry. The poll is edge-triggered,
    /// so stopping earlier would strand input already buffered there.
    pub(crate) fn read_step(
        &mut self,
        registry: &Registry,
        handler: &mut dyn CommandHandler,
    ) -> Flow {
        loop {
            if self.is_expired() {
                return Flow::Close;
            }
            // Backpressure: queued output suspends reading.
            if !self.deferred.is_empty() {
                return Flow::Continue;
            }
            let Some(stream) = self.stream.as_mut() else {
                return Flow::Close;
            };
            match self.input.fill(stream) {
                FillOutcome::Blocked => return Flow::Continue,
                FillOutcome::Closed => return Flow::Close,
                FillOutcome::Ready(_) => {}
            }

            // The buffer moves out so borrowed lines and session mutation
            // don't collide; it moves back whatever happens below.
            let mut input = mem::take(&mut self.input);
            let mut flow = Flow::Continue;
            while let Some(raw) = input.next_line() {
                let Ok(line) = std::str::from_utf8(raw) else {
                    debug!(client = self.num, "malformed request line");
                    flow = Flow::Close;
                    break;
                };
                flow = self.process_line(registry, handler, line);
                if flow != Flow::Continue || self.is_expired() {
                    break;
                }
            }
            if flow == Flow::Continue {
                if self.is_expired() {
                    flow = Flow::Close;
                } else if input.finish_batch().is_err() {
                    warn!(client = self.num, "request line too long, closing");
                    flow = Flow::Close;
                }
            }
            self.input = input;
            if flow != Flow::Continue {
                return flow;
            }
        }
    }

    /// The per-line state machine: idle wait, list accumulation, then
    /// normal dispatch, in that order.
    fn process_line(
        &mut self,
        registry: &Registry,
        handler: &mut dyn CommandHandler,
        line: &str,
    ) -> Flow {
        if self.idle_waiting {
            if line == "noidle" {
                self.idle_waiting = false;
                self.write_bytes(registry, b"OK\n");
                self.write_out(registry);
                return Flow::Continue;
            }
            // Only the cancel verb is legal while a client is blocked.
            debug!(client = self.num, "request while idle, closing");
            return Flow::Close;
        }
        if line == "noidle" {
            // The cancel raced an earlier delivery; nothing to do.
            return Flow::Continue;
        }

        match self.list_mode {
            ListMode::Collecting { per_step_ack } => {
                if line == "command_list_end" {
                    let lines = mem::take(&mut self.list_lines);
                    self.list_mode = ListMode::Off;
                    self.list_size = 0;
                    let outcome = handler.process_list(
                        &mut HandlerClient { client: &mut *self, registry },
                        per_step_ack,
                        &lines,
                    );
                    let flow = self.handle_outcome(registry, outcome);
                    self.write_out(registry);
                    flow
                } else {
                    // Account the stripped terminator too.
                    self.list_size += line.len() + 1;
                    if self.list_size > self.max_list_size {
                        warn!(
                            client = self.num,
                            size = self.list_size,
                            limit = self.max_list_size,
                            "command list too large, closing"
                        );
                        return Flow::Close;
                    }
                    self.list_lines.push(line.to_owned());
                    Flow::Continue
                }
            }
            ListMode::Off => match line {
                "command_list_begin" => {
                    self.list_mode = ListMode::Collecting { per_step_ack: false };
                    Flow::Continue
                }
                "command_list_ok_begin" => {
                    self.list_mode = ListMode::Collecting { per_step_ack: true };
                    Flow::Continue
                }
                _ => {
                    let outcome = handler
                        .process(&mut HandlerClient { client: &mut *self, registry }, line);
                    let flow = self.handle_outcome(registry, outcome);
                    self.write_out(registry);
                    flow
                }
            },
        }
    }

    fn handle_outcome(&mut self, registry: &Registry, outcome: CommandOutcome) -> Flow {
        match outcome {
            CommandOutcome::Ok => {
                self.write_bytes(registry, b"OK\n");
                Flow::Continue
            }
            CommandOutcome::Handled => Flow::Continue,
            CommandOutcome::Close => Flow::Close,
            CommandOutcome::Kill => Flow::Kill,
        }
    }
}

/// Pairs a session with the poll registry so the command layer can write
/// through [`ClientControl`] without seeing any mio types.
struct HandlerClient<'a> {
    client: &'a mut Client,
    registry: &'a Registry,
}

impl ClientControl for HandlerClient<'_> {
    fn write(&mut self, bytes: &[u8]) {
        self.client.write_bytes(self.registry, bytes);
    }

    fn uid(&self) -> Option<u32> {
        self.client.uid
    }

    fn permission(&self) -> Permission {
        self.client.permission
    }

    fn set_permission(&mut self, permission: Permission) {
        self.client.permission = permission;
    }

    fn is_expired(&self) -> bool {
        self.client.is_expired()
    }

    fn idle_wait(&mut self, subscriptions: IdleEvents) -> bool {
        self.client.idle_wait(self.registry, subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts `capacity` bytes, then reports WouldBlock.
    struct ThrottledWriter {
        accepted: Vec<u8>,
        capacity: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.capacity - self.accepted.len();
            if room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_write_reports_the_written_count() {
        // The caller defers `len - n`: exactly the remainder of this
        // write, not of any larger accumulated quantity.
        let mut w = ThrottledWriter { accepted: Vec::new(), capacity: 3 };
        match direct_write(&mut w, b"abcdef") {
            DirectWrite::Partial(n) => assert_eq!(n, 3),
            _ => panic!("expected a short write"),
        }
        assert_eq!(w.accepted, b"abc");
    }

    #[test]
    fn blocked_write_reports_would_block() {
        let mut w = ThrottledWriter { accepted: Vec::new(), capacity: 0 };
        assert!(matches!(direct_write(&mut w, b"abc"), DirectWrite::Blocked));
    }

    #[test]
    fn complete_write_passes_through() {
        let mut w = ThrottledWriter { accepted: Vec::new(), capacity: 16 };
        assert!(matches!(direct_write(&mut w, b"abc"), DirectWrite::Complete));
        assert_eq!(w.accepted, b"abc");
    }
}

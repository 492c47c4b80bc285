use std::{
    io, mem,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use cantata::{CommandHandler, Config, IdleEvents};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::{
    client::{Client, Flow},
    listener::{Accepted, Listener},
};

/// Token reserved for the cross-thread waker; listeners, sessions and
/// auxiliary sources are allocated above it.
const WAKER: Token = Token(0);

/// How often the reactor wakes to sweep expired and timed-out sessions.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct Shared {
    /// Idle flags raised by other threads, waiting for the reactor to
    /// fold them into the sessions.
    pending: Mutex<IdleEvents>,
    stop: AtomicBool,
    waker: Waker,
}

/// Cross-thread handle onto the reactor: event sources raise idle flags
/// and anyone may request shutdown. Both just poke the mailbox and wake
/// the poll; the session list itself never leaves the reactor thread.
#[derive(Clone)]
pub struct NotifyHandle {
    shared: Arc<Shared>,
}

impl NotifyHandle {
    /// Raises idle event flags for every session. Visible to the reactor
    /// before it performs any further session I/O.
    pub fn idle_add(&self, events: IdleEvents) {
        {
            let mut pending = self.shared.pending.lock().expect("notify lock");
            *pending |= events;
        }
        if let Err(err) = self.shared.waker.wake() {
            warn!(?err, "notify wake");
        }
    }

    /// Asks the reactor to close every session and return.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let _ = self.shared.waker.wake();
    }
}

/// The single-threaded reactor: owns the poll, the listeners and every
/// client session, and drives all of their I/O.
pub struct ClientManager {
    poll: Poll,
    events: Events,
    listener: Listener,
    config: Config,
    clients: Vec<Client>,
    next_token: usize,
    next_num: u64,
    /// Admission cap; dropped to zero on shutdown.
    max_connections: usize,
    shared: Arc<Shared>,
    last_sweep: Instant,
    aux_dispatch: Option<Box<dyn FnMut(Token, bool, bool) + Send>>,
}

impl ClientManager {
    pub fn new(config: Config, mut listener: Listener) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let mut next_token = WAKER.0 + 1;
        listener.register_all(poll.registry(), || {
            let token = Token(next_token);
            next_token += 1;
            token
        })?;

        let max_connections = config.max_connections;
        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            listener,
            config,
            clients: Vec::new(),
            next_token,
            next_num: 0,
            max_connections,
            shared: Arc::new(Shared {
                pending: Mutex::new(IdleEvents::empty()),
                stop: AtomicBool::new(false),
                waker,
            }),
            last_sweep: Instant::now(),
            aux_dispatch: None,
        })
    }

    pub fn notify_handle(&self) -> NotifyHandle {
        NotifyHandle { shared: Arc::clone(&self.shared) }
    }

    /// Registry for auxiliary event sources owned by other subsystems;
    /// pair with [`Self::alloc_token`] and [`Self::on_aux_event`].
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Reserves a token for an auxiliary source.
    pub fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Receives `(token, readable, writable)` for every event on a token
    /// the manager does not own itself.
    pub fn on_aux_event(&mut self, dispatch: impl FnMut(Token, bool, bool) + Send + 'static) {
        self.aux_dispatch = Some(Box::new(dispatch));
    }

    /// Raises idle event flags for every session, on the reactor thread.
    pub fn idle_add(&mut self, events: IdleEvents) {
        let registry = self.poll.registry();
        for client in &mut self.clients {
            client.idle_add(registry, events);
        }
    }

    /// Runs the reactor until shutdown is requested or the command layer
    /// returns kill. Poll failures other than interrupts are fatal.
    pub fn run(&mut self, handler: &mut dyn CommandHandler) -> io::Result<()> {
        info!(max_connections = self.max_connections, "serving");
        loop {
            match self.poll.poll(&mut self.events, Some(SWEEP_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(?err, "poll failed");
                    return Err(err);
                }
            }

            // Cross-thread raises land before any session I/O, so a flag
            // raised before a client's `idle` line is seen by that wait.
            let raised = {
                let mut pending = self.shared.pending.lock().expect("notify lock");
                mem::take(&mut *pending)
            };
            if !raised.is_empty() {
                self.idle_add(raised);
            }
            if self.shared.stop.load(Ordering::Relaxed) {
                self.shutdown();
                return Ok(());
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                if token == WAKER {
                    continue;
                }
                if self.listener.owns(token) {
                    if readable {
                        self.accept_ready(token);
                    }
                    continue;
                }
                match self.dispatch_client(token, readable, writable, handler) {
                    Flow::Kill => {
                        info!("kill requested, shutting down");
                        self.shutdown();
                        return Ok(());
                    }
                    Flow::Continue | Flow::Close => {}
                }
            }

            self.sweep_if_due();
        }
    }

    fn accept_ready(&mut self, token: Token) {
        loop {
            match self.listener.accept(token) {
                Ok(Some(accepted)) => self.admit(accepted),
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, accepted: Accepted) {
        if self.clients.len() >= self.max_connections {
            warn!(peer = %accepted.peer, "connection refused, client limit reached");
            return; // dropping the stream closes it
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        let num = self.next_num;
        self.next_num += 1;

        let mut stream = accepted.stream;
        if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
            error!(?err, "registering accepted client");
            return;
        }

        let mut client =
            Client::new(stream, token, num, accepted.peer, accepted.uid, &self.config);
        info!(client = num, peer = %client.peer(), uid = ?accepted.uid, "client connected");
        client.greet(self.poll.registry());
        self.clients.push(client);
    }

    fn dispatch_client(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        handler: &mut dyn CommandHandler,
    ) -> Flow {
        let Some(idx) = self.clients.iter().position(|c| c.token() == token) else {
            if let Some(dispatch) = self.aux_dispatch.as_mut() {
                dispatch(token, readable, writable);
            } else {
                debug!(?token, "event for unknown token");
            }
            return Flow::Continue;
        };

        let registry = self.poll.registry();

        if readable && !self.clients[idx].is_expired() {
            match self.clients[idx].read_step(registry, handler) {
                Flow::Continue => self.clients[idx].touch(),
                Flow::Close => {
                    self.clients[idx].expire(registry);
                    return Flow::Continue;
                }
                Flow::Kill => return Flow::Kill,
            }
        }

        if writable && !self.clients[idx].is_expired() {
            self.clients[idx].drain_deferred(registry);
            self.clients[idx].touch();
        }

        Flow::Continue
    }

    /// Reclaims expired sessions and closes the ones that timed out
    /// without being blocked in idle.
    fn sweep_if_due(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();

        let timeout = self.config.connection_timeout;
        let now = Instant::now();
        let mut i = self.clients.len();
        while i != 0 {
            i -= 1;
            if self.clients[i].is_expired() {
                let client = self.clients.swap_remove(i);
                info!(client = client.num(), peer = %client.peer(), "client disconnected");
                continue;
            }
            let client = &mut self.clients[i];
            if !client.idle_waiting() && now.duration_since(client.last_activity()) > timeout {
                info!(client = client.num(), peer = %client.peer(), "client timed out");
                client.expire(self.poll.registry());
                self.clients.swap_remove(i);
            }
        }
    }

    /// Closes every session and zeroes the admission cap.
    fn shutdown(&mut self) {
        info!(clients = self.clients.len(), "closing all connections");
        let registry = self.poll.registry();
        for client in &mut self.clients {
            client.expire(registry);
        }
        self.clients.clear();
        self.max_connections = 0;
    }
}

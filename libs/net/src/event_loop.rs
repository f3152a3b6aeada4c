//! Single-threaded readiness event loop.
//!
//! Each [`NetEventLoop`] owns one OS thread driving a `mio::Poll`. Sockets
//! are registered edge-triggered; the loop remembers per-connection
//! readiness and pumps bytes between sockets and buffers until no further
//! progress is possible. Because two relayed connections share their
//! buffers, bytes read by one side are flushed by the other side within
//! the same wakeup.
//!
//! Registration may happen from any thread. Handler callbacks always run
//! on the loop thread, except `removed` fired by an explicit
//! [`NetEventLoop::remove_connection`], which runs on the caller's thread
//! (callers are expected to be on the loop thread already).

use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, Registration};
use crate::handler::{ConnectionHandler, HandlerContext, ServerContext, ServerHandler};
use crate::server::ServerSock;

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;
const LOWLEVEL: &str = "plfm_net::lowlevel";

pub(crate) struct Shared {
    name: String,
    registry: Registry,
    waker: Waker,
    state: Mutex<State>,
    removals: Mutex<Vec<Token>>,
    closed: AtomicBool,
}

impl Shared {
    /// Queue `token` for removal on the loop thread.
    pub(crate) fn schedule_removal(&self, token: Token) {
        self.removals.lock().push(token);
        if let Err(e) = self.waker.wake() {
            warn!(event_loop = %self.name, error = %e, "Failed to wake event loop");
        }
    }
}

struct State {
    next_token: usize,
    entries: HashMap<Token, Entry>,
}

enum Entry {
    Connection(ConnEntry),
    Server(ServerEntry),
}

struct ConnEntry {
    connection: Arc<Connection>,
    handler: Arc<dyn ConnectionHandler>,
    /// Outbound connect still in progress.
    connecting: bool,
    /// Socket may have bytes to read (cleared on `WouldBlock`).
    readable: bool,
    /// Socket may accept bytes (cleared on `WouldBlock`).
    writable: bool,
    /// Remote sent EOF or the socket failed.
    eof: bool,
}

impl ConnEntry {
    fn wants_io(&self) -> bool {
        !self.connecting
            && !self.connection.is_locally_closed()
            && ((self.readable && !self.eof) || self.writable)
    }
}

struct ServerEntry {
    server: Arc<ServerSock>,
    handler: Arc<dyn ServerHandler>,
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

enum Target {
    Server(Arc<ServerSock>, Arc<dyn ServerHandler>),
    Connecting,
    CheckError(Arc<Connection>, Arc<dyn ConnectionHandler>),
    Nothing,
}

/// Snapshot of what a connection may do in one pump step.
struct IoStep {
    connection: Arc<Connection>,
    handler: Arc<dyn ConnectionHandler>,
    read: bool,
    write: bool,
}

enum ReadOutcome {
    Stored(usize),
    Eof,
    Blocked,
    NoRoom,
    Failed(io::Error),
}

enum WriteOutcome {
    Flushed(usize),
    Empty,
    Blocked,
    Failed(io::Error),
}

/// Handle to a running event loop. Cheap to clone.
#[derive(Clone)]
pub struct NetEventLoop {
    shared: Arc<Shared>,
}

impl NetEventLoop {
    /// Start a new loop on a dedicated thread named `name`.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        let event_loop = Self {
            shared: Arc::new(Shared {
                name: name.clone(),
                registry,
                waker,
                state: Mutex::new(State {
                    next_token: 0,
                    entries: HashMap::new(),
                }),
                removals: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        let runner = event_loop.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || runner.run(poll))?;

        debug!(event_loop = %name, "Event loop started");
        Ok(event_loop)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same loop.
    pub fn ptr_eq(&self, other: &NetEventLoop) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .entries
            .values()
            .filter(|e| matches!(e, Entry::Connection(_)))
            .count()
    }

    /// Stop the loop. Registered connections are closed and removed.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            warn!(event_loop = %self.shared.name, error = %e, "Failed to wake event loop");
        }
    }

    /// Start accepting on `server`.
    pub fn add_server(
        &self,
        server: Arc<ServerSock>,
        handler: Arc<dyn ServerHandler>,
    ) -> io::Result<()> {
        self.ensure_open()?;
        let mut slot = server.token.lock();
        if slot.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{server} is already registered"),
            ));
        }

        let token = self.insert(Entry::Server(ServerEntry {
            server: Arc::clone(&server),
            handler,
        }));
        let registered =
            self.shared
                .registry
                .register(&mut *server.listener.lock(), token, Interest::READABLE);
        if let Err(e) = registered {
            self.shared.state.lock().entries.remove(&token);
            return Err(e);
        }
        *slot = Some(token);

        debug!(event_loop = %self.shared.name, server = %server, "Server registered");
        Ok(())
    }

    /// Stop accepting on `server`. Fires the server handler's `removed`.
    pub fn remove_server(&self, server: &Arc<ServerSock>) -> io::Result<()> {
        let mut slot = server.token.lock();
        let not_here = || {
            io::Error::new(
                ErrorKind::NotFound,
                format!("{server} is not registered on {}", self.shared.name),
            )
        };
        let token = (*slot).ok_or_else(not_here)?;

        let entry = {
            let mut state = self.shared.state.lock();
            match state.entries.remove(&token) {
                Some(Entry::Server(entry)) if Arc::ptr_eq(&entry.server, server) => entry,
                Some(other) => {
                    state.entries.insert(token, other);
                    return Err(not_here());
                }
                None => return Err(not_here()),
            }
        };
        *slot = None;
        drop(slot);

        if let Err(e) = self
            .shared
            .registry
            .deregister(&mut *server.listener.lock())
        {
            warn!(server = %server, error = %e, "Failed to deregister server");
        }

        debug!(event_loop = %self.shared.name, server = %server, "Server removed");
        entry.handler.removed(&ServerContext::new(server, self));
        Ok(())
    }

    /// Register an established connection.
    pub fn add_connection(
        &self,
        connection: Arc<Connection>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<()> {
        self.register(connection, handler, false)
    }

    /// Register an outbound connection whose connect is still in progress.
    /// The handler's `connected` fires once it completes.
    pub fn add_client_connection(
        &self,
        connection: Arc<Connection>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> io::Result<()> {
        self.register(connection, handler, true)
    }

    /// Detach `connection` without closing it. Fires the handler's
    /// `removed` before returning, so a new handler can be attached
    /// afterwards without the old one ever seeing another event.
    pub fn remove_connection(&self, connection: &Arc<Connection>) -> io::Result<()> {
        let not_here = || {
            io::Error::new(
                ErrorKind::NotFound,
                format!("{connection} is not registered on {}", self.shared.name),
            )
        };
        let token = connection.token_on(&self.shared).ok_or_else(not_here)?;
        if self.detach(token) {
            Ok(())
        } else {
            Err(not_here())
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::other(format!(
                "event loop {} is closed",
                self.shared.name
            )));
        }
        Ok(())
    }

    fn insert(&self, entry: Entry) -> Token {
        let mut state = self.shared.state.lock();
        let token = Token(state.next_token);
        state.next_token += 1;
        state.entries.insert(token, entry);
        token
    }

    fn register(
        &self,
        connection: Arc<Connection>,
        handler: Arc<dyn ConnectionHandler>,
        connecting: bool,
    ) -> io::Result<()> {
        self.ensure_open()?;
        if connection.is_locally_closed() {
            return Err(io::Error::new(
                ErrorKind::NotConnected,
                format!("{connection} is closed"),
            ));
        }

        let mut registration = connection.registration.lock();
        if registration.is_some() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{connection} is already registered"),
            ));
        }

        let token = self.insert(Entry::Connection(ConnEntry {
            connection: Arc::clone(&connection),
            handler,
            connecting,
            readable: !connecting,
            writable: !connecting,
            eof: false,
        }));
        let registered = self.shared.registry.register(
            &mut *connection.stream.lock(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        );
        if let Err(e) = registered {
            self.shared.state.lock().entries.remove(&token);
            return Err(e);
        }
        *registration = Some(Registration {
            owner: Arc::downgrade(&self.shared),
            token,
        });
        drop(registration);

        trace!(
            target: LOWLEVEL,
            event_loop = %self.shared.name,
            conn = %connection,
            connecting,
            "connection registered"
        );

        // Pump whatever the kernel already buffered.
        if let Err(e) = self.shared.waker.wake() {
            warn!(event_loop = %self.shared.name, error = %e, "Failed to wake event loop");
        }
        Ok(())
    }

    /// Remove a connection entry and fire `removed`. Returns false when
    /// the token is no longer attached.
    fn detach(&self, token: Token) -> bool {
        let entry = {
            let mut state = self.shared.state.lock();
            match state.entries.remove(&token) {
                Some(Entry::Connection(entry)) => entry,
                Some(other) => {
                    state.entries.insert(token, other);
                    return false;
                }
                None => return false,
            }
        };

        if let Err(e) = self
            .shared
            .registry
            .deregister(&mut *entry.connection.stream.lock())
        {
            trace!(target: LOWLEVEL, conn = %entry.connection, error = %e, "deregister failed");
        }
        entry.connection.clear_registration(token);

        trace!(
            target: LOWLEVEL,
            event_loop = %self.shared.name,
            conn = %entry.connection,
            "connection removed"
        );
        entry
            .handler
            .removed(&HandlerContext::new(&entry.connection, self));
        true
    }

    fn run(self, mut poll: Poll) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.is_closed() {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(event_loop = %self.shared.name, error = %e, "Poll failed, stopping event loop");
                break;
            }

            let ready: Vec<(Token, Readiness)> = events
                .iter()
                .filter(|event| event.token() != WAKE_TOKEN)
                .map(|event| (event.token(), Readiness::from(event)))
                .collect();

            for (token, readiness) in ready {
                self.dispatch(token, readiness);
            }
            self.pump();
        }

        self.shared.closed.store(true, Ordering::Release);
        self.drain();
        debug!(event_loop = %self.shared.name, "Event loop stopped");
    }

    fn dispatch(&self, token: Token, readiness: Readiness) {
        let target = {
            let mut state = self.shared.state.lock();
            match state.entries.get_mut(&token) {
                Some(Entry::Server(entry)) => {
                    Target::Server(Arc::clone(&entry.server), Arc::clone(&entry.handler))
                }
                Some(Entry::Connection(entry)) => {
                    entry.readable |= readiness.readable;
                    entry.writable |= readiness.writable;
                    if entry.connecting {
                        Target::Connecting
                    } else if readiness.error {
                        Target::CheckError(
                            Arc::clone(&entry.connection),
                            Arc::clone(&entry.handler),
                        )
                    } else {
                        Target::Nothing
                    }
                }
                None => Target::Nothing,
            }
        };

        match target {
            Target::Server(server, handler) => self.accept(&server, &handler),
            Target::Connecting => self.finish_connect(token),
            Target::CheckError(connection, handler) => {
                let pending = connection.stream.lock().take_error();
                match pending {
                    Ok(Some(e)) | Err(e) => self.fail(token, &connection, &handler, e),
                    Ok(None) => {}
                }
            }
            Target::Nothing => {}
        }
    }

    fn accept(&self, server: &Arc<ServerSock>, handler: &Arc<dyn ServerHandler>) {
        let ctx = ServerContext::new(server, self);
        loop {
            let accepted = server.listener.lock().accept();
            match accepted {
                Ok((stream, remote)) => {
                    let (in_buffer, out_buffer) = handler.io_buffers(&remote);
                    let connection = Arc::new(Connection::from_mio(
                        stream,
                        remote,
                        Arc::new(in_buffer),
                        Arc::new(out_buffer),
                    ));
                    trace!(target: LOWLEVEL, server = %server, conn = %connection, "accepted");
                    handler.connection(&ctx, connection);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    handler.accept_fail(&ctx, &e);
                    break;
                }
            }
        }
    }

    fn finish_connect(&self, token: Token) {
        let Some((connection, handler)) = self.connection_entry(token) else {
            return;
        };

        let outcome = {
            let stream = connection.stream.lock();
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                },
            }
        };

        match outcome {
            Ok(false) => {}
            Ok(true) => {
                self.update(token, |entry| {
                    entry.connecting = false;
                    entry.readable = true;
                    entry.writable = true;
                });
                trace!(target: LOWLEVEL, conn = %connection, "connected");
                handler.connected(&HandlerContext::new(&connection, self));
            }
            Err(e) => self.fail(token, &connection, &handler, e),
        }
    }

    fn fail(
        &self,
        token: Token,
        connection: &Arc<Connection>,
        handler: &Arc<dyn ConnectionHandler>,
        err: io::Error,
    ) {
        trace!(target: LOWLEVEL, conn = %connection, error = %err, "connection failed");
        self.update(token, |entry| {
            entry.readable = false;
            entry.writable = false;
            entry.eof = true;
        });
        handler.exception(&HandlerContext::new(connection, self), &err);
        connection.close();
    }

    fn pump(&self) {
        loop {
            self.process_removals();

            let ready: Vec<Token> = {
                let state = self.shared.state.lock();
                state
                    .entries
                    .iter()
                    .filter_map(|(token, entry)| match entry {
                        Entry::Connection(entry) if entry.wants_io() => Some(*token),
                        _ => None,
                    })
                    .collect()
            };

            let mut progressed = false;
            for token in ready {
                if self.pump_connection(token) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.process_removals();
    }

    /// One read and one write attempt. Returns whether anything happened.
    fn pump_connection(&self, token: Token) -> bool {
        let Some(step) = self.io_step(token) else {
            return false;
        };
        let ctx = HandlerContext::new(&step.connection, self);
        let mut progressed = false;

        if step.read {
            match read_once(&step.connection) {
                ReadOutcome::Stored(n) => {
                    trace!(target: LOWLEVEL, conn = %step.connection, bytes = n, "read");
                    progressed = true;
                    step.handler.readable(&ctx);
                }
                ReadOutcome::Eof => {
                    self.update(token, |entry| {
                        entry.eof = true;
                        entry.readable = false;
                    });
                    step.connection.mark_remote_closed();
                    trace!(target: LOWLEVEL, conn = %step.connection, "remote closed");
                    progressed = true;
                    step.handler.closed(&ctx);
                }
                ReadOutcome::Blocked => self.update(token, |entry| entry.readable = false),
                ReadOutcome::NoRoom => {}
                ReadOutcome::Failed(e) => {
                    self.fail(token, &step.connection, &step.handler, e);
                    return true;
                }
            }
            if !self.still_attached(token, &step.connection) {
                return progressed;
            }
        }

        if step.write {
            match write_once(&step.connection) {
                WriteOutcome::Flushed(n) => {
                    trace!(target: LOWLEVEL, conn = %step.connection, bytes = n, "wrote");
                    progressed = true;
                    step.handler.writable(&ctx);
                }
                WriteOutcome::Empty => {}
                WriteOutcome::Blocked => self.update(token, |entry| entry.writable = false),
                WriteOutcome::Failed(e) => {
                    self.fail(token, &step.connection, &step.handler, e);
                    return true;
                }
            }
        }

        progressed
    }

    fn io_step(&self, token: Token) -> Option<IoStep> {
        let state = self.shared.state.lock();
        match state.entries.get(&token) {
            Some(Entry::Connection(entry)) if entry.wants_io() => Some(IoStep {
                connection: Arc::clone(&entry.connection),
                handler: Arc::clone(&entry.handler),
                read: entry.readable && !entry.eof,
                write: entry.writable,
            }),
            _ => None,
        }
    }

    fn connection_entry(
        &self,
        token: Token,
    ) -> Option<(Arc<Connection>, Arc<dyn ConnectionHandler>)> {
        let state = self.shared.state.lock();
        match state.entries.get(&token) {
            Some(Entry::Connection(entry)) => {
                Some((Arc::clone(&entry.connection), Arc::clone(&entry.handler)))
            }
            _ => None,
        }
    }

    fn still_attached(&self, token: Token, connection: &Arc<Connection>) -> bool {
        if connection.is_locally_closed() {
            return false;
        }
        let state = self.shared.state.lock();
        matches!(
            state.entries.get(&token),
            Some(Entry::Connection(entry)) if Arc::ptr_eq(&entry.connection, connection)
        )
    }

    fn update(&self, token: Token, f: impl FnOnce(&mut ConnEntry)) {
        let mut state = self.shared.state.lock();
        if let Some(Entry::Connection(entry)) = state.entries.get_mut(&token) {
            f(entry);
        }
    }

    fn process_removals(&self) {
        loop {
            let batch = std::mem::take(&mut *self.shared.removals.lock());
            if batch.is_empty() {
                return;
            }
            for token in batch {
                self.detach(token);
            }
        }
    }

    /// Tear down every registration once the loop stops.
    fn drain(&self) {
        let entries: Vec<(Token, Entry)> = self.shared.state.lock().entries.drain().collect();
        for (token, entry) in entries {
            match entry {
                Entry::Connection(entry) => {
                    let _ = self
                        .shared
                        .registry
                        .deregister(&mut *entry.connection.stream.lock());
                    entry.connection.clear_registration(token);
                    entry.connection.close();
                    entry
                        .handler
                        .removed(&HandlerContext::new(&entry.connection, self));
                }
                Entry::Server(entry) => {
                    let _ = self
                        .shared
                        .registry
                        .deregister(&mut *entry.server.listener.lock());
                    *entry.server.token.lock() = None;
                    entry
                        .handler
                        .removed(&ServerContext::new(&entry.server, self));
                }
            }
        }
        self.shared.removals.lock().clear();
    }
}

fn read_once(connection: &Connection) -> ReadOutcome {
    let mut stream = connection.stream.lock();
    loop {
        match connection.in_buffer().store_from(&mut *stream) {
            Ok(None) => return ReadOutcome::NoRoom,
            Ok(Some(0)) => return ReadOutcome::Eof,
            Ok(Some(n)) => return ReadOutcome::Stored(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::Blocked,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
}

fn write_once(connection: &Connection) -> WriteOutcome {
    let mut stream = connection.stream.lock();
    loop {
        match connection.out_buffer().flush_to(&mut *stream) {
            Ok(0) => return WriteOutcome::Empty,
            Ok(n) => return WriteOutcome::Flushed(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return WriteOutcome::Blocked,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return WriteOutcome::Failed(e),
        }
    }
}

impl fmt::Debug for NetEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetEventLoop")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

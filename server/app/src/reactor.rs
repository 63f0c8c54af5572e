//! The single-threaded cooperative reactor: owns the listening socket, the [`Directory`], and
//! every live [`Connection`]. Each tick multiplexes readiness, drains every complete frame off
//! each readable socket before returning to the multiplexer, flushes writable sockets, runs the
//! keep-alive pass, and checks for a requested shutdown.

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};

use chatcore::{dispatcher, ConnectionId, Directory, Effect};
use common::error::ErrorUtils;
use common::logging::{debug, error, info, warn, Logger};
use wire::{ErrorKind, Message, RESERVED_NICK};

use crate::config::Config;
use crate::connection::Connection;

/// Reserved outside the `usize` range any real connection id will ever reach.
const SERVER_TOKEN: Token = Token(usize::MAX);

pub struct Reactor {
    listener: TcpListener,
    poll: Poll,
    events: Events,

    connections: Vec<Option<Connection>>,
    free: Vec<ConnectionId>,
    directory: Directory,

    idle_timeout: Duration,
    dead_timeout: Duration,
    poll_timeout: Duration,

    /// Set by [`Reactor::initiate_shutdown`] when a `squit` (rather than `SIGINT`) triggers
    /// teardown, so the run loop exits on the same tick instead of polling a closed listener.
    shutdown_requested_internally: bool,

    log: Logger,
}

impl Reactor {
    pub fn bind(config: &Config, log: Logger) -> io::Result<Reactor> {
        // `SocketAddr::from_str` only accepts a numeric IP, and the documented default host is
        // the hostname `localhost`; resolve through `ToSocketAddrs` so a hostname binds too.
        let addr: SocketAddr = config
            .bind_address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))?;

        let listener = TcpListener::bind(&addr)?;
        let poll = Poll::new()?;
        poll.register(&listener, SERVER_TOKEN, Ready::readable(), PollOpt::edge())?;

        info!(log, "listening"; "address" => %addr);

        Ok(Reactor {
            listener,
            poll,
            events: Events::with_capacity(1024),
            connections: Vec::new(),
            free: Vec::new(),
            directory: Directory::new(),
            idle_timeout: config.idle_timeout,
            dead_timeout: config.dead_timeout,
            poll_timeout: config.poll_timeout,
            shutdown_requested_internally: false,
            log,
        })
    }

    /// Runs until `shutdown` is set (by the `SIGINT` handler) or the Dispatcher produces a
    /// `squit`-driven [`Effect::Shutdown`].
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!(self.log, "shutdown requested");
                self.initiate_shutdown();
                break;
            }

            if let Err(err) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(self.log, "poll failed"; "error" => %err);
                continue;
            }

            // Collect (token, readiness) up front: the loop body below needs `&mut self`, which
            // would otherwise conflict with the shared borrow `self.events` holds.
            let ready: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();

            let mut dirty = HashSet::new();

            for (token, readiness) in ready {
                if token == SERVER_TOKEN {
                    self.accept_all(&mut dirty);
                    continue;
                }

                let id = token.0;
                if readiness.is_readable() {
                    self.handle_readable(id, &mut dirty);
                }
                if readiness.is_writable() && self.connections.get(id).map_or(false, Option::is_some) {
                    self.handle_writable(id, &mut dirty);
                }
            }

            self.run_keepalive(&mut dirty);

            for id in dirty {
                self.reregister(id);
            }

            if self.shutdown_requested_internally {
                break;
            }
        }
    }

    fn accept_all(&mut self, dirty: &mut HashSet<ConnectionId>) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = self.admit(stream);
                    info!(self.log, "connection accepted"; "channel_id" => id, "peer" => %addr);
                    dirty.insert(id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(self.log, "accept failed"; "error" => %e);
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: mio::net::TcpStream) -> ConnectionId {
        let now = Instant::now();
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.connections.len();
                self.connections.push(None);
                id
            }
        };

        let conn = Connection::new(stream, now);
        self.poll
            .register(conn.stream(), Token(id), Ready::readable(), PollOpt::edge())
            .expect("registering a freshly accepted socket cannot fail");

        self.connections[id] = Some(conn);
        self.directory.admit(id);
        id
    }

    fn handle_readable(&mut self, id: ConnectionId, dirty: &mut HashSet<ConnectionId>) {
        let result = match self.connections.get_mut(id).and_then(Option::as_mut) {
            Some(conn) => conn.readable(Instant::now()),
            None => return,
        };

        if result.has_failed() {
            self.drop_connection(id, "connection dropped", dirty);
            return;
        }

        if let Ok(frames) = result {
            for frame in frames {
                self.process_frame(id, &frame, dirty);
                if self.connections.get(id).map_or(true, Option::is_none) {
                    break;
                }
            }
        }
    }

    fn process_frame(&mut self, id: ConnectionId, bytes: &[u8], dirty: &mut HashSet<ConnectionId>) {
        match Message::decode(bytes) {
            Ok(Message::Command(cmd)) => {
                if let wire::Command::Pong { msg, .. } = &cmd {
                    if let Some(conn) = self.connections.get_mut(id).and_then(Option::as_mut) {
                        conn.note_pong(msg, Instant::now());
                    }
                }

                let result = dispatcher::dispatch(&mut self.directory, id, cmd, Instant::now());
                self.apply(id, result, dirty);

                if let Some(conn) = self.connections.get_mut(id).and_then(Option::as_mut) {
                    conn.nick = self.directory.nick_of(id).map(str::to_string);
                }
            }
            Ok(_) => self.send_error(id, ErrorKind::Schema, "clients may only send commands", dirty),
            Err(_) => {
                let preview: String = String::from_utf8_lossy(bytes).chars().take(200).collect();
                self.send_error(id, ErrorKind::Schema, preview, dirty);
            }
        }
    }

    fn apply(&mut self, source: ConnectionId, result: dispatcher::DispatchResult, dirty: &mut HashSet<ConnectionId>) {
        for (target, msg) in result.outbound {
            if let Some(conn) = self.connections.get_mut(target).and_then(Option::as_mut) {
                if conn.enqueue(&msg).is_err() {
                    error!(self.log, "dropping outbound message that failed its own schema"; "channel_id" => target);
                } else {
                    dirty.insert(target);
                }
            }
        }

        match result.effect {
            Effect::None => {}
            Effect::CloseConnection => {
                if let Some(conn) = self.connections.get_mut(source).and_then(Option::as_mut) {
                    conn.closing = true;
                }
                dirty.insert(source);
            }
            Effect::Shutdown => self.initiate_shutdown(),
        }
    }

    fn send_error(&mut self, id: ConnectionId, kind: ErrorKind, text: impl Into<String>, dirty: &mut HashSet<ConnectionId>) {
        if let Some(conn) = self.connections.get_mut(id).and_then(Option::as_mut) {
            let _ = conn.enqueue(&Message::error(kind, text));
            dirty.insert(id);
        }
    }

    fn handle_writable(&mut self, id: ConnectionId, dirty: &mut HashSet<ConnectionId>) {
        let outcome = match self.connections.get_mut(id).and_then(Option::as_mut) {
            Some(conn) => conn.writable(),
            None => return,
        };

        if outcome.has_failed() {
            self.drop_connection(id, "write failure", dirty);
            return;
        }

        let (closing, has_outbound) = match &self.connections[id] {
            Some(conn) => (conn.closing, conn.has_outbound()),
            None => return,
        };
        if closing && !has_outbound {
            self.finalize_close(id);
        } else {
            dirty.insert(id);
        }
    }

    /// Reaps a connection that died some way other than an explicit `quit`: socket error, clean
    /// disconnect, or keep-alive timeout. Restores Directory invariants via a synthetic quit and
    /// notifies whoever shared a channel with it, then tears the socket down immediately.
    fn drop_connection(&mut self, id: ConnectionId, reason: &str, dirty: &mut HashSet<ConnectionId>) {
        if self.connections.get(id).map_or(false, Option::is_some) {
            let result = dispatcher::synthetic_quit(&mut self.directory, id, reason);
            self.apply(id, result, dirty);
        }
        self.finalize_close(id);
    }

    fn finalize_close(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(id).and_then(Option::take) {
            let _ = self.poll.deregister(conn.stream());
            conn.close();
            self.free.push(id);
            debug!(self.log, "connection closed"; "channel_id" => id, "nick" => conn.nick.as_deref().unwrap_or("-"));
        }
    }

    fn reregister(&mut self, id: ConnectionId) {
        let conn = match self.connections.get(id).and_then(Option::as_ref) {
            Some(conn) => conn,
            None => return,
        };

        let ready = if conn.has_outbound() {
            Ready::readable() | Ready::writable()
        } else {
            Ready::readable()
        };

        if self.poll.reregister(conn.stream(), Token(id), ready, PollOpt::edge()).is_err() {
            warn!(self.log, "reregister failed"; "channel_id" => id);
        }
    }

    fn run_keepalive(&mut self, dirty: &mut HashSet<ConnectionId>) {
        let now = Instant::now();
        let ids: Vec<ConnectionId> = (0..self.connections.len())
            .filter(|&id| self.connections[id].is_some())
            .collect();

        for id in ids {
            let conn = self.connections[id].as_ref().unwrap();
            let idle = conn.idle_for(now);
            let outstanding = conn.has_outstanding_ping();

            if outstanding && idle >= self.dead_timeout {
                self.drop_connection(id, "keep-alive timeout", dirty);
            } else if !outstanding && idle >= self.idle_timeout {
                let nonce = self.connections[id].as_mut().unwrap().issue_ping_nonce();
                if let Some(conn) = self.connections.get_mut(id).and_then(Option::as_mut) {
                    let _ = conn.enqueue(&Message::ping(RESERVED_NICK, nonce));
                }
                dirty.insert(id);
            }
        }
    }

    /// Broadcasts a server-originated `quit` to every live connection, flushes best-effort, and
    /// closes every socket. Does not go through the Directory: the process is exiting regardless,
    /// so there is no invariant left to preserve.
    fn initiate_shutdown(&mut self) {
        let ids: Vec<ConnectionId> = (0..self.connections.len())
            .filter(|&id| self.connections[id].is_some())
            .collect();

        for &id in &ids {
            if let Some(conn) = self.connections[id].as_mut() {
                let _ = conn.enqueue(&Message::quit(RESERVED_NICK, "server shutting down"));
            }
        }

        // A handful of best-effort flush passes; any connection that won't drain in that many
        // non-blocking writes is abandoned rather than blocking shutdown indefinitely.
        for _ in 0..4 {
            let mut progressed = false;
            for &id in &ids {
                if let Some(conn) = self.connections[id].as_mut() {
                    if conn.has_outbound() {
                        let _ = conn.writable();
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        for &id in &ids {
            if let Some(mut conn) = self.connections[id].take() {
                let _ = self.poll.deregister(conn.stream());
                conn.close();
            }
        }

        self.shutdown_requested_internally = true;
    }
}

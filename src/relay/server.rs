use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use ring::rand::SystemRandom;
use rtrb::{Consumer, RingBuffer};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::messages::ServerMessage;
use crate::net::framing::{decode_frame_within, Decoded};
use crate::net::handshake::{handshake_response, parse_request, upgrade_required_response};
use crate::net::tcp_opt;
use crate::relay::{ClientHandle, ClientId, Command, CommandSender, Relay, RelayEvent, RelayHandler};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// One accepted socket. `client` is `None` until the upgrade handshake completes.
struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    buffer: Vec<u8>,
    client: Option<ClientId>,
    /// Last bytes owed before the socket closes (a 426 reply or a `disconnect`
    /// frame). Once set, input is discarded and the socket closes when this drains.
    farewell: Option<Vec<u8>>,
}

/// What the receive path decided about a connection.
enum Verdict {
    KeepOpen,
    Close,
    /// Close once the farewell bytes are written.
    Linger,
}

/// Single-threaded relay event loop built on mio.
///
/// Socket events are turned into [`RelayEvent`]s, queued, and handed to the
/// handler in arrival order after each poll. Frames of one connection are
/// always delivered in the order they arrived.
pub struct RelayServer {
    config: RelayConfig,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    commands: Option<Consumer<Command>>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    relay: Relay,
    rng: SystemRandom,
    pending: VecDeque<RelayEvent>,
    scratch: Vec<u8>,
    running: bool,
}

impl RelayServer {
    pub fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let mut listener = tcp_opt::create_listener(config.addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        info!("relay listening on {}", listener.local_addr()?);

        Ok(Self {
            scratch: vec![0u8; config.read_chunk],
            config,
            poll,
            listener,
            waker,
            commands: None,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            relay: Relay::new(),
            rng: SystemRandom::new(),
            pending: VecDeque::new(),
            running: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Opens the command queue. Calling it again replaces the previous queue.
    pub fn command_sender(&mut self, capacity: usize) -> CommandSender {
        let (producer, consumer) = RingBuffer::new(capacity);
        self.commands = Some(consumer);
        CommandSender::new(producer, Arc::clone(&self.waker))
    }

    /// Runs until a [`Command::Shutdown`] arrives. Transport errors on single
    /// connections are never fatal; only a failing poll ends the loop early.
    pub fn run<H: RelayHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        let mut events = Events::with_capacity(self.config.event_capacity);
        self.running = true;

        while self.running {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => self.drain_commands(),
                    token => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.read_ready(token);
                        }
                        // Client queues are flushed by settle(); only farewells wait on writability.
                        if event.is_writable() {
                            self.flush_farewell(token);
                        }
                    }
                }
            }

            self.settle(handler);
        }

        self.close_all();
        info!("relay stopped");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = tcp_opt::apply_optimizations(&stream) {
                        warn!("could not set TCP_NODELAY for {addr}: {e}");
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!("failed to register {addr}: {e}");
                        continue;
                    }
                    debug!("accepted {addr} as {token:?}");
                    self.connections.insert(
                        token,
                        Connection {
                            stream,
                            addr,
                            buffer: Vec::new(),
                            client: None,
                            farewell: None,
                        },
                    );
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Reads until the socket would block, draining the buffer after every chunk
    /// so memory stays bounded by the frame limit.
    fn read_ready(&mut self, token: Token) {
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.stream.read(&mut self.scratch) {
                // A half-closed peer may still be reading its farewell.
                Ok(0) if conn.farewell.is_some() => return,
                Ok(0) => break,
                Ok(n) => {
                    conn.buffer.extend_from_slice(&self.scratch[..n]);
                    match self.process_buffer(token) {
                        Verdict::KeepOpen => {}
                        Verdict::Close => break,
                        Verdict::Linger => {
                            self.flush_farewell(token);
                            return;
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    match &conn.client {
                        Some(id) => error!("Error on socket {id}: {e}"),
                        None => error!("Error on socket {}: {e}", conn.addr),
                    }
                    break;
                }
            }
        }
        self.close_connection(token);
    }

    fn process_buffer(&mut self, token: Token) -> Verdict {
        let Some(conn) = self.connections.get_mut(&token) else {
            return Verdict::Close;
        };
        if conn.farewell.is_some() {
            conn.buffer.clear();
            return Verdict::KeepOpen;
        }

        if conn.client.is_none() {
            let (request, consumed) = match parse_request(&conn.buffer, self.config.max_handshake_len) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Verdict::KeepOpen,
                Err(e) => {
                    warn!("rejecting {}: {e}", conn.addr);
                    return Verdict::Close;
                }
            };
            let _ = conn.buffer.drain(..consumed);

            let Some(key) = request.websocket_key().filter(|_| request.is_websocket_upgrade()) else {
                debug!("{} sent {} {} without upgrade, answering 426", conn.addr, request.method, request.path);
                conn.buffer.clear();
                conn.farewell = Some(upgrade_required_response());
                return Verdict::Linger;
            };

            let id = match ClientId::generate(&self.rng) {
                Ok(id) => id,
                Err(e) => {
                    error!("dropping {}: {e}", conn.addr);
                    return Verdict::Close;
                }
            };
            let handle = self.relay.register(id.clone(), token, handshake_response(key).into_bytes());
            info!("client {id} connected from {}", conn.addr);
            conn.client = Some(id);
            self.pending.push_back(RelayEvent::Connection(handle));
        }

        let Some(id) = conn.client.clone() else {
            return Verdict::Close;
        };

        loop {
            let decoded = match decode_frame_within(&conn.buffer, self.config.max_frame_len) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("closing {id}: {e}");
                    return Verdict::Close;
                }
            };
            let consumed = decoded.consumed(&conn.buffer);
            let message = match decoded {
                Decoded::Incomplete => return Verdict::KeepOpen,
                Decoded::Close => {
                    debug!("close frame from {id}");
                    return Verdict::Close;
                }
                Decoded::Ignored { opcode, .. } => {
                    debug!("ignoring {opcode:?} frame from {id}");
                    None
                }
                Decoded::Message { payload, .. } => Some(payload),
            };
            let _ = conn.buffer.drain(..consumed);

            if let Some(payload) = message {
                self.pending
                    .push_back(RelayEvent::Message(ClientHandle::new(id.clone()), payload));
            }
        }
    }

    /// Removes a connection: deregisters and shuts down the socket, drops it from
    /// the registry and queues the disconnection. Unknown tokens are ignored.
    fn close_connection(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        release(&self.poll, &mut conn.stream);

        if let Some(id) = conn.client {
            // Absent when disconnect_client already evicted it; that path emits its own event.
            if self.relay.remove(id.as_str()).is_some() {
                info!("client {id} disconnected");
                self.pending.push_back(RelayEvent::Disconnection(ClientHandle::new(id)));
            }
        } else {
            debug!("closed {} before handshake", conn.addr);
        }
    }

    fn drain_commands(&mut self) {
        let Some(commands) = self.commands.as_mut() else {
            return;
        };
        while let Ok(command) = commands.pop() {
            match command {
                Command::ListClients => {
                    let ids = self.relay.list_clients();
                    info!("{} connected clients", ids.len());
                    for id in ids {
                        info!("  {id}");
                    }
                }
                Command::Disconnect { id, reason } => {
                    if !self.relay.disconnect_client(id.as_str(), &reason) {
                        warn!("cannot disconnect {id}: no such client");
                    }
                }
                Command::Announce(message) => {
                    if let Err(e) = self.relay.broadcast(&ServerMessage::Announcement { message: &message }, None) {
                        error!("announcement failed: {e}");
                    }
                }
                Command::Shutdown => {
                    info!("shutdown requested");
                    self.running = false;
                }
            }
        }
    }

    /// Dispatches queued events, then closes evicted clients and flushes outbound
    /// queues, repeating while that produces new events.
    fn settle<H: RelayHandler + ?Sized>(&mut self, handler: &mut H) {
        loop {
            while let Some(event) = self.pending.pop_front() {
                event.dispatch(handler, &mut self.relay);
            }
            self.reap_evicted();
            self.flush_all();
            if self.pending.is_empty() {
                break;
            }
        }
    }

    fn reap_evicted(&mut self) {
        for (id, peer) in self.relay.take_evicted() {
            if let Some(conn) = self.connections.get_mut(&peer.token) {
                conn.buffer.clear();
                conn.farewell = Some(peer.outbox);
                self.flush_farewell(peer.token);
            }
            info!("client {id} disconnected by server");
            self.pending.push_back(RelayEvent::Disconnection(ClientHandle::new(id)));
        }
    }

    /// Writes what the socket takes of a pending farewell and closes the
    /// connection once nothing is left or the write fails.
    fn flush_farewell(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let Some(farewell) = conn.farewell.as_mut() else {
            return;
        };
        let done = match write_pending(&mut conn.stream, farewell) {
            Ok(()) => farewell.is_empty(),
            Err(e) => {
                debug!("final write to {} failed: {e}", conn.addr);
                true
            }
        };
        if done {
            self.close_connection(token);
        }
    }

    fn flush_all(&mut self) {
        let mut failed = Vec::new();
        for (id, peer) in self.relay.peers_mut() {
            if peer.outbox.is_empty() {
                continue;
            }
            let Some(conn) = self.connections.get_mut(&peer.token) else {
                continue;
            };
            if let Err(e) = write_pending(&mut conn.stream, &mut peer.outbox) {
                error!("Error on socket {id}: {e}");
                failed.push(peer.token);
            }
        }
        for token in failed {
            self.close_connection(token);
        }
    }

    fn close_all(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            release(&self.poll, &mut conn.stream);
        }
    }
}

fn release(poll: &Poll, stream: &mut TcpStream) {
    if let Err(e) = poll.registry().deregister(stream) {
        debug!("deregister failed: {e}");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Writes as much of `outbox` as the socket takes; the rest waits for the next pass.
fn write_pending(stream: &mut TcpStream, outbox: &mut Vec<u8>) -> io::Result<()> {
    while !outbox.is_empty() {
        match stream.write(outbox) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                let _ = outbox.drain(..n);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn loopback() -> RelayConfig {
        RelayConfig::with_addr("127.0.0.1:0".parse().unwrap())
    }

    #[test]
    fn bound_server_starts_with_no_clients() {
        let server = RelayServer::bind(loopback()).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.relay().is_empty());
        assert!(server.relay().list_clients().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let config = RelayConfig {
            read_chunk: 0,
            ..loopback()
        };
        assert!(matches!(RelayServer::bind(config), Err(RelayError::Config(_))));
    }
}

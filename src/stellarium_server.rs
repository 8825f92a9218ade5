// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Server side of the Stellarium Telescope Protocol. Stellarium connects to us
// as though we were a telescope mount; we report each new plate solution as
// the telescope's current position, and log the "goto" requests Stellarium
// sends.
//
// Only one client is served at a time. Each session loops on:
//   1. If a new solution is pending, send it (ten times; clients may miss
//      packets and there is no acknowledgement).
//   2. Receive any goto packet, waiting at most one poll interval.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canonical_error::{CanonicalError, unavailable_error};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::coord_codec::{rad_to_stellarium, stellarium_to_strings};
use crate::result_channel::ResultChannel;
use crate::stellarium_packet::{GOTO_PACKET_LEN, GotoPacket, StatusPacket,
                               now_micros};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,

    // Upper bound on each wait for a connection or for client data, and thus
    // on how long a shutdown request can go unnoticed.
    pub poll_interval: Duration,

    // Number of copies of each position packet sent.
    pub repeat_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig{
            port: 10001,
            poll_interval: Duration::from_millis(100),
            repeat_count: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Connected,
    Stopped,
}

// A decoded goto request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GotoCommand {
    pub ra: String,    // H:M:S
    pub dec: String,   // D:M:S
    pub time: String,  // Client's local time of day, HH:MM:SS
    pub packet: GotoPacket,
}

impl GotoCommand {
    pub fn from_packet(packet: GotoPacket) -> Self {
        let (ra, dec, time) =
            stellarium_to_strings(packet.ra, packet.dec, packet.micros);
        GotoCommand{ra, dec, time, packet}
    }
}

pub struct GotoCallback(pub Box<dyn Fn(&GotoCommand) + Send + Sync>);

impl std::fmt::Debug for GotoCallback {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      write!(f, "GotoCallback")
  }
}

#[derive(Debug)]
pub struct StellariumServer {
    config: ServerConfig,
    results: ResultChannel,
    got_signal: Arc<AtomicBool>,

    // Called for each goto request, after it is logged.
    goto_callback: Option<GotoCallback>,

    state: watch::Sender<ConnectionState>,
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind,
             ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

// Creates a listening socket on all interfaces. SO_REUSEADDR lets a restarted
// server bind while the previous one's connections linger in TIME_WAIT.
fn bind_listener(port: u16) -> std::io::Result<std::net::TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl StellariumServer {
    pub fn new(config: ServerConfig, results: ResultChannel,
               got_signal: Arc<AtomicBool>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Listening);
        StellariumServer{config, results, got_signal, goto_callback: None, state}
    }

    pub fn with_goto_callback(mut self,
                              cb: Box<dyn Fn(&GotoCommand) + Send + Sync>)
                              -> Self {
        self.goto_callback = Some(GotoCallback(cb));
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn stopping(&self) -> bool {
        self.got_signal.load(Ordering::Relaxed)
    }

    // Must be called from within a tokio runtime.
    pub fn bind(&self) -> Result<TcpListener, CanonicalError> {
        let listener = bind_listener(self.config.port)
            .and_then(TcpListener::from_std);
        match listener {
            Ok(listener) => Ok(listener),
            Err(e) => Err(unavailable_error(
                format!("Could not listen on port {}: {:?}",
                        self.config.port, e).as_str())),
        }
    }

    // Binds the configured port and serves clients until `got_signal` is set.
    pub async fn run(&self) -> Result<(), CanonicalError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    pub async fn serve(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Stellarium server listening on: {}", addr),
            Err(e) => warn!("Stellarium server listening; {:?}", e),
        }
        self.set_state(ConnectionState::Listening);
        while !self.stopping() {
            let accepted =
                match timeout(self.config.poll_interval, listener.accept()).await {
                    Err(_elapsed) => continue,
                    Ok(accepted) => accepted,
                };
            match accepted {
                Ok((stream, addr)) => {
                    self.run_session(stream, addr).await;
                },
                Err(e) if is_transient(e.kind()) => {},
                Err(e) => {
                    // E.g. out of file descriptors. Back off and retry.
                    warn!("Error accepting connection: {}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                },
            }
        }
        self.set_state(ConnectionState::Stopped);
        info!("Stellarium server stopped");
    }

    async fn run_session(&self, mut stream: TcpStream, addr: SocketAddr) {
        info!("Connected to {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        // Only report solutions made during this session.
        self.results.clear();
        self.set_state(ConnectionState::Connected);

        let mut received = Vec::with_capacity(2 * GOTO_PACKET_LEN);
        while !self.stopping() {
            if let Err(e) = self.session_step(&mut stream, &mut received).await {
                warn!("Disconnected from {}: {}", addr, e);
                break;
            }
        }
        // Dropping `stream` closes the connection; pending data is discarded.
        if !self.stopping() {
            self.set_state(ConnectionState::Listening);
        }
    }

    // One iteration of a session. An error return ends the session.
    async fn session_step(&self, stream: &mut TcpStream, received: &mut Vec<u8>)
                          -> std::io::Result<()> {
        if let Some(result) = self.results.take_if_present() {
            let (ra, dec) = rad_to_stellarium(result.ra, result.dec);
            let packet = StatusPacket::new(now_micros(), ra, dec).encode();
            let burst = async {
                for _ in 0..self.config.repeat_count {
                    stream.write_all(&packet).await?;
                }
                Ok::<(), std::io::Error>(())
            };
            // A client that stops reading eventually fills the send buffer.
            // Part of a packet may already be sent, so the session cannot
            // continue.
            match timeout(self.config.poll_interval, burst).await {
                Err(_elapsed) => {
                    return Err(std::io::Error::new(
                        ErrorKind::TimedOut, "client is not reading"));
                },
                Ok(sent) => sent?,
            }
            debug!("Sent position ra={} dec={}", ra, dec);
        }

        let mut buf = [0_u8; GOTO_PACKET_LEN];
        match timeout(self.config.poll_interval, stream.read(&mut buf)).await {
            Err(_elapsed) => {},
            Ok(Ok(0)) => {
                return Err(ErrorKind::UnexpectedEof.into());
            },
            Ok(Ok(n)) => {
                received.extend_from_slice(&buf[..n]);
                while let Some(packet) = GotoPacket::decode(received) {
                    received.drain(..GOTO_PACKET_LEN);
                    self.handle_goto(packet);
                }
            },
            Ok(Err(e)) if is_transient(e.kind()) => {},
            Ok(Err(e)) => {
                return Err(e);
            },
        }
        Ok(())
    }

    fn handle_goto(&self, packet: GotoPacket) {
        let command = GotoCommand::from_packet(packet);
        info!("Received slew command to (RA, DEC) = ({}, {})",
              command.ra, command.dec);
        debug!("Slew command client time {}", command.time);
        if let Some(ref cb) = self.goto_callback {
            cb.0(&command);
        }
    }
}

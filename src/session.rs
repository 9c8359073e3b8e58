//! Single-client TCP session.
//!
//! One listening socket lives for the whole process; at most one client is
//! serviced at a time. When the client goes away the session accepts the next
//! one before handing back another message, so callers never see
//! disconnects.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::{preview, Framing, MessageFramer, Reply, MAX_MESSAGE_BYTES};

const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

pub struct Session {
    listener: TcpListener,
    local_addr: SocketAddr,
    client: Option<Client>,
    framer: MessageFramer,
    ready: VecDeque<Vec<u8>>,
    shutdown: ShutdownHandle,
}

impl Session {
    /// Bind the listener on all interfaces. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, framing: Framing) -> Result<Self> {
        Self::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), framing)
    }

    pub fn bind_to(addr: SocketAddr, framing: Framing) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("bind listener on {}", addr))?;
        let local_addr = listener.local_addr().context("read listener address")?;
        log::info!("listening on {} ({:?} framing)", local_addr, framing);
        Ok(Self {
            listener,
            local_addr,
            client: None,
            framer: MessageFramer::new(framing),
            ready: VecDeque::new(),
            shutdown: ShutdownHandle::new(wake_addr(local_addr)),
        })
    }

    /// Bind and block until the first client connects.
    pub fn open(port: u16, framing: Framing) -> Result<Self> {
        let mut session = Self::bind(port, framing)?;
        session.accept()?;
        Ok(session)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|client| client.peer)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Block until a client connects. `Ok(false)` means shutdown was requested.
    pub fn accept(&mut self) -> Result<bool> {
        self.drop_client();
        if self.shutdown.is_triggered() {
            return Ok(false);
        }
        let (stream, peer) = self.listener.accept().context("accept client")?;
        if self.shutdown.is_triggered() {
            return Ok(false);
        }
        self.shutdown.track(&stream);
        log::info!("client connected from {}", peer);
        self.client = Some(Client { stream, peer });
        self.framer.reset();
        self.ready.clear();
        Ok(true)
    }

    /// Next inbound message, re-accepting across disconnects.
    ///
    /// Returns `Ok(None)` once shutdown has been requested. Accept failures
    /// are returned as errors.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_MESSAGE_BYTES];
        loop {
            if self.shutdown.is_triggered() {
                return Ok(None);
            }
            if let Some(message) = self.ready.pop_front() {
                log::debug!("received {:?}", preview(&message));
                return Ok(Some(message));
            }
            let Some(client) = self.client.as_mut() else {
                if !self.accept()? {
                    return Ok(None);
                }
                continue;
            };

            match client.stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("client {} disconnected", client.peer);
                    self.drop_client();
                }
                Ok(n) => {
                    let messages = self.framer.push(&buf[..n]);
                    self.ready.extend(messages);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    if !self.shutdown.is_triggered() {
                        log::warn!("read from {} failed: {}", client.peer, err);
                    }
                    self.drop_client();
                }
            }
        }
    }

    /// Send one reply to the active client. A failed write drops the client
    /// and returns `false`; the next `receive` accepts a replacement.
    pub fn send(&mut self, reply: &Reply) -> bool {
        let Some(client) = self.client.as_mut() else {
            log::warn!("no client connected; reply {:?} dropped", reply.text());
            return false;
        };
        let bytes = reply.encode();
        let written = client
            .stream
            .write_all(&bytes)
            .and_then(|()| client.stream.flush());
        match written {
            Ok(()) => {
                log::info!("sent {:?} to {}", reply.text(), client.peer);
                true
            }
            Err(err) => {
                log::warn!("write to {} failed: {}", client.peer, err);
                self.drop_client();
                false
            }
        }
    }

    fn drop_client(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.stream.shutdown(Shutdown::Both);
            self.shutdown.untrack();
        }
        self.framer.reset();
    }
}

/// Stops a session from another thread.
///
/// Triggering marks the session as stopping and unblocks whatever it is
/// waiting on: the active client's read, or the listener's accept.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    stopping: Arc<AtomicBool>,
    wake_addr: SocketAddr,
    active: Arc<Mutex<Option<TcpStream>>>,
}

impl ShutdownHandle {
    fn new(wake_addr: SocketAddr) -> Self {
        Self {
            stopping: Arc::new(AtomicBool::new(false)),
            wake_addr,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn trigger(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(active) = self.active.lock() {
            if let Some(stream) = active.as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        // Unblocks a pending accept; the session discards this connection.
        let _ = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT);
    }

    pub fn is_triggered(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn track(&self, stream: &TcpStream) {
        let clone = match stream.try_clone() {
            Ok(clone) => Some(clone),
            Err(err) => {
                log::warn!("cannot track client for shutdown: {}", err);
                None
            }
        };
        if let Ok(mut active) = self.active.lock() {
            *active = clone;
        }
    }

    fn untrack(&self) {
        if let Ok(mut active) = self.active.lock() {
            active.take();
        }
    }
}

fn wake_addr(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

//! Datagram transport seams for the ingress and dispatch tasks.
//!
//! The scheduler only needs "receive a payload tagged with its sender" and "send a payload to a
//! destination". [`UdpIngress`]/[`UdpEgress`] implement this over one bound UDP socket, echoing each
//! packet back to its sender. [`MemoryIngress`]/[`MemoryEgress`] implement it over crossbeam
//! channels for tests and simulations.

use crate::packet::{Datagram, MAX_DATAGRAM_SIZE};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Source of incoming datagrams, owned exclusively by the ingress task.
pub trait IngressChannel: Send {
    /// Wait briefly for the next datagram.
    ///
    /// `Ok(None)` means nothing arrived within the channel's poll interval; the caller uses it to
    /// check for shutdown. Errors are reported but do not end the ingress loop.
    fn recv(&mut self) -> io::Result<Option<Datagram>>;
}

/// Best-effort datagram sink, owned exclusively by the dispatch task.
pub trait EgressChannel: Send {
    fn send(&mut self, payload: &[u8], destination: SocketAddr) -> io::Result<()>;
}

impl<T: IngressChannel + ?Sized> IngressChannel for Box<T> {
    fn recv(&mut self) -> io::Result<Option<Datagram>> {
        (**self).recv()
    }
}

impl<T: EgressChannel + ?Sized> EgressChannel for Box<T> {
    fn send(&mut self, payload: &[u8], destination: SocketAddr) -> io::Result<()> {
        (**self).send(payload, destination)
    }
}

/// Receiving half of the UDP transport.
#[derive(Debug)]
pub struct UdpIngress {
    socket: Arc<UdpSocket>,
    buffer: Vec<u8>,
}

/// Sending half of the UDP transport.
#[derive(Debug, Clone)]
pub struct UdpEgress {
    socket: Arc<UdpSocket>,
}

/// Bind `addr` and split the socket into ingress and egress halves.
///
/// Receives use `poll_interval` as the read timeout so the ingress loop can observe shutdown.
pub fn bind_udp(addr: SocketAddr, poll_interval: Duration) -> io::Result<(UdpIngress, UdpEgress)> {
    let socket = UdpSocket::bind(addr)?;
    udp_pair(socket, poll_interval)
}

/// Split an already bound socket into ingress and egress halves.
pub fn udp_pair(socket: UdpSocket, poll_interval: Duration) -> io::Result<(UdpIngress, UdpEgress)> {
    socket.set_read_timeout(Some(poll_interval.max(Duration::from_millis(1))))?;
    let socket = Arc::new(socket);
    Ok((
        UdpIngress {
            socket: socket.clone(),
            buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        },
        UdpEgress { socket },
    ))
}

impl UdpIngress {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl IngressChannel for UdpIngress {
    fn recv(&mut self) -> io::Result<Option<Datagram>> {
        match self.socket.recv_from(&mut self.buffer) {
            Ok((len, sender)) => Ok(Some(Datagram::new(&self.buffer[..len], sender))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl EgressChannel for UdpEgress {
    fn send(&mut self, payload: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.socket.send_to(payload, destination).map(|_| ())
    }
}

/// In-memory ingress fed by a crossbeam sender.
#[derive(Debug)]
pub struct MemoryIngress {
    receiver: Receiver<Datagram>,
    poll_interval: Duration,
}

/// In-memory egress delivering `(payload, destination)` pairs to a crossbeam receiver.
#[derive(Debug, Clone)]
pub struct MemoryEgress {
    sender: Sender<(Vec<u8>, SocketAddr)>,
}

/// Build a connected in-memory ingress and the sender that feeds it.
pub fn memory_ingress(poll_interval: Duration) -> (Sender<Datagram>, MemoryIngress) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        tx,
        MemoryIngress {
            receiver: rx,
            poll_interval,
        },
    )
}

/// Build an in-memory egress and the receiver observing everything it sends.
pub fn memory_egress() -> (MemoryEgress, Receiver<(Vec<u8>, SocketAddr)>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (MemoryEgress { sender: tx }, rx)
}

impl IngressChannel for MemoryIngress {
    fn recv(&mut self) -> io::Result<Option<Datagram>> {
        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(datagram) => Ok(Some(datagram)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory ingress disconnected",
            )),
        }
    }
}

impl EgressChannel for MemoryEgress {
    fn send(&mut self, payload: &[u8], destination: SocketAddr) -> io::Result<()> {
        self.sender
            .send((payload.to_vec(), destination))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory egress disconnected"))
    }
}

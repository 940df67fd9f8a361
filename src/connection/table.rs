// src/connection/table.rs

//! The set of endpoints one task multiplexes: listeners, the discovery socket
//! and accepted clients.
//!
//! Slots form an arena with stable indices. An index emptied during a dispatch
//! pass goes back to the free list only at `end_pass()`, so events collected
//! earlier in the pass can never be applied to a new occupant of the slot.

use super::client::ClientConnection;
use crate::core::FlomError;
use crate::core::protocol::Message;
use futures::StreamExt;
use futures::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::io::ReadBuf;
use tokio::net::{TcpListener, TcpStream, UdpSocket, UnixListener, UnixStream};

/// Largest datagram the discovery socket reads.
const MAX_DATAGRAM: usize = 4096;

/// Something the table can poll.
pub enum Endpoint {
    TcpListener(TcpListener),
    UnixListener(UnixListener),
    Discovery(UdpSocket),
    Client(ClientConnection),
}

impl Endpoint {
    pub fn is_listener(&self) -> bool {
        !matches!(self, Endpoint::Client(_))
    }
}

/// A stream freshly accepted by a listener.
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

/// One readiness event of one slot.
pub enum Event {
    Accepted(Accepted),
    Datagram { data: Vec<u8>, from: SocketAddr },
    Message(Message),
    /// The peer closed its side.
    Closed,
    /// A client read failed or a frame could not be decoded.
    ClientError(FlomError),
    /// A listener or the discovery socket failed.
    ListenerError(io::Error),
}

#[derive(Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Endpoint>>,
    free: Vec<usize>,
    retired: Vec<usize>,
    in_pass: bool,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an endpoint and returns its index.
    pub fn add(&mut self, endpoint: Endpoint) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(endpoint);
                idx
            }
            None => {
                self.slots.push(Some(endpoint));
                self.slots.len() - 1
            }
        }
    }

    /// Closes and removes the endpoint at `idx`. Removing an empty slot is a no-op.
    pub fn remove(&mut self, idx: usize) {
        let _ = self.vacate(idx);
    }

    /// Removes a client without closing it and hands ownership to the caller.
    pub fn take_client(&mut self, idx: usize) -> Option<ClientConnection> {
        match self.slots.get(idx) {
            Some(Some(Endpoint::Client(_))) => match self.vacate(idx) {
                Some(Endpoint::Client(conn)) => Some(conn),
                _ => None,
            },
            _ => None,
        }
    }

    fn vacate(&mut self, idx: usize) -> Option<Endpoint> {
        let endpoint = self.slots.get_mut(idx)?.take()?;
        if self.in_pass {
            self.retired.push(idx);
        } else {
            self.free.push(idx);
        }
        Some(endpoint)
    }

    pub fn get(&self, idx: usize) -> Option<&Endpoint> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Endpoint> {
        self.slots.get_mut(idx)?.as_mut()
    }

    pub fn client(&self, idx: usize) -> Option<&ClientConnection> {
        match self.get(idx)? {
            Endpoint::Client(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn client_mut(&mut self, idx: usize) -> Option<&mut ClientConnection> {
        match self.get_mut(idx)? {
            Endpoint::Client(conn) => Some(conn),
            _ => None,
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn client_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Some(Endpoint::Client(_))))
            .count()
    }

    /// Indices of the incubated clients waiting for the locker `key`.
    pub fn waiting_on(&self, key: &str) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(Endpoint::Client(conn)) if conn.waiting_for.as_deref() == Some(key) => {
                    Some(idx)
                }
                _ => None,
            })
            .collect()
    }

    /// Indices of all client slots.
    pub fn client_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| matches!(slot, Some(Endpoint::Client(_))).then_some(idx))
            .collect()
    }

    pub fn begin_pass(&mut self) {
        self.in_pass = true;
    }

    /// Releases the indices emptied during the pass for reuse.
    pub fn end_pass(&mut self) {
        self.in_pass = false;
        self.free.append(&mut self.retired);
    }

    /// Waits until at least one endpoint is ready and returns every event of
    /// that pass. Pending forever on an empty table.
    ///
    /// Cancel safe: nothing is consumed unless the future completes.
    pub async fn ready(&mut self) -> Vec<(usize, Event)> {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<(usize, Event)>> {
        let mut events = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let Some(endpoint) = slot else { continue };
            if let Poll::Ready(event) = poll_endpoint(endpoint, cx) {
                events.push((idx, event));
            }
        }
        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }
}

fn poll_endpoint(endpoint: &mut Endpoint, cx: &mut Context<'_>) -> Poll<Event> {
    match endpoint {
        Endpoint::TcpListener(listener) => listener.poll_accept(cx).map(|r| match r {
            Ok((stream, addr)) => Event::Accepted(Accepted::Tcp(stream, addr)),
            Err(e) => Event::ListenerError(e),
        }),
        Endpoint::UnixListener(listener) => listener.poll_accept(cx).map(|r| match r {
            Ok((stream, _)) => Event::Accepted(Accepted::Unix(stream)),
            Err(e) => Event::ListenerError(e),
        }),
        Endpoint::Discovery(socket) => {
            let mut data = vec![0u8; MAX_DATAGRAM];
            let mut buf = ReadBuf::new(&mut data);
            match socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(from)) => {
                    let len = buf.filled().len();
                    data.truncate(len);
                    Poll::Ready(Event::Datagram { data, from })
                }
                Poll::Ready(Err(e)) => Poll::Ready(Event::ListenerError(e)),
                Poll::Pending => Poll::Pending,
            }
        }
        Endpoint::Client(conn) => conn.framed.poll_next_unpin(cx).map(|item| match item {
            Some(Ok(message)) => Event::Message(message),
            Some(Err(e)) => Event::ClientError(e),
            None => Event::Closed,
        }),
    }
}

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::address::Endpoint;
use crate::message::Message;
use crate::support::{BusError, BusResult, Fault};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    /// Byte stream; writes may land partially and resume by offset.
    Stream,
    /// Kernel queue; a message is delivered atomically or not at all.
    Kernel,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteOutcome {
    /// Bytes up to the contained offset have been transmitted.
    Partial(usize),
    Done,
}

/// Contract between the connection engine and the transport collaborator.
///
/// Every operation is nonblocking and advances at most one step:
/// `Err(BusError::Wait)` means the caller should poll for readiness and
/// retry, any fault is fatal for the transport.
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Input and output descriptors for readiness polling, if the
    /// transport is descriptor-backed.
    fn descriptors(&self) -> Option<(RawFd, RawFd)>;

    /// One step of connection establishment. `Ok` once established.
    fn connect_step(&mut self) -> BusResult<()>;

    /// One step of the auth handshake. `Ok` once authentication is
    /// complete and messages may flow.
    fn auth_step(&mut self) -> BusResult<()>;

    /// True while the auth engine holds bytes waiting to be written.
    fn auth_pending_output(&self) -> bool;

    /// Whether descriptor passing was negotiated during auth.
    fn supports_fds(&self) -> bool {
        false
    }

    /// Reads one fully assembled message, or `Err(Wait)` when none is
    /// available yet.
    fn read_message(&mut self) -> BusResult<Message>;

    /// Writes `message` starting at byte `offset` of its wire image.
    /// Stream transports may report partial progress; kernel transports
    /// only ever report `Done` or `Wait`.
    fn write_message(&mut self, message: &Message, offset: usize) -> BusResult<WriteOutcome>;

    fn shutdown(&mut self);
}

/// Produces a live transport for a parsed endpoint. The connection walks
/// its address list through this on `start`, advancing past endpoints
/// whose connect fails.
pub trait Connector {
    fn connect(&mut self, endpoint: &Endpoint) -> BusResult<Box<dyn Transport>>;
}

struct PairState {
    queues: [VecDeque<Message>; 2],
    closed: [bool; 2],
}

/// In-memory duplex transport. Both ends speak whole messages, so writes
/// always complete atomically; useful for tests and in-process peers.
pub struct PairTransport {
    shared: Rc<RefCell<PairState>>,
    side: usize,
}

/// Creates a connected pair of in-memory transports.
pub fn pair() -> (PairTransport, PairTransport) {
    let shared = Rc::new(RefCell::new(PairState {
        queues: [VecDeque::new(), VecDeque::new()],
        closed: [false, false],
    }));

    (
        PairTransport {
            shared: shared.clone(),
            side: 0,
        },
        PairTransport { shared, side: 1 },
    )
}

impl Transport for PairTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn descriptors(&self) -> Option<(RawFd, RawFd)> {
        None
    }

    fn connect_step(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn auth_step(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn auth_pending_output(&self) -> bool {
        false
    }

    fn read_message(&mut self) -> BusResult<Message> {
        let mut state = self.shared.borrow_mut();

        if let Some(message) = state.queues[self.side].pop_front() {
            return Ok(message);
        }

        if state.closed[1 - self.side] {
            return Err(Fault::NotConnected.into());
        }

        Err(BusError::Wait)
    }

    fn write_message(&mut self, message: &Message, _offset: usize) -> BusResult<WriteOutcome> {
        let mut state = self.shared.borrow_mut();

        if state.closed[1 - self.side] || state.closed[self.side] {
            return Err(Fault::Io(io::ErrorKind::BrokenPipe).into());
        }

        state.queues[1 - self.side].push_back(message.clone());
        Ok(WriteOutcome::Done)
    }

    fn shutdown(&mut self) {
        self.shared.borrow_mut().closed[self.side] = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn sealed_call(serial: u32) -> Message {
        let mut message = Message::method_call("/obj", "org.example.Iface", "Frob").unwrap();
        message.seal(serial).unwrap();
        message
    }

    #[test]
    fn test_pair_roundtrip() {
        let (mut a, mut b) = pair();

        a.write_message(&sealed_call(1), 0).unwrap();
        a.write_message(&sealed_call(2), 0).unwrap();

        assert_eq!(b.read_message().unwrap().serial(), 1);
        assert_eq!(b.read_message().unwrap().serial(), 2);
        assert_eq!(b.read_message().unwrap_err(), BusError::Wait);
    }

    #[test]
    fn test_pair_read_after_peer_close() {
        let (mut a, mut b) = pair();

        a.write_message(&sealed_call(1), 0).unwrap();
        a.shutdown();

        // Queued traffic drains before the close is observed
        assert_eq!(b.read_message().unwrap().serial(), 1);
        assert_eq!(
            b.read_message().unwrap_err(),
            BusError::Fault(Fault::NotConnected)
        );
    }

    #[test]
    fn test_pair_write_after_peer_close() {
        let (mut a, mut b) = pair();

        b.shutdown();

        assert_eq!(
            a.write_message(&sealed_call(1), 0).unwrap_err(),
            BusError::Fault(Fault::Io(io::ErrorKind::BrokenPipe))
        );
    }
}

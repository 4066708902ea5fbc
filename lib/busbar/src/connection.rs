use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use flux::logging;
use flux::time::monotonic_usec;

use crate::address::{self, AddressList};
use crate::builtin;
use crate::config::Limits;
use crate::dispatch::{self, DispatchCtx};
use crate::filter::{FilterCallback, FilterSet, MatchCallback, MatchPredicate, MatchSet};
use crate::message::{Message, MessageType, Value};
use crate::reply::{self, ReplyCallback, ReplyTracker, NEVER};
use crate::support::{self, BusError, BusResult, Fault, Handled};
use crate::transport::{Connector, Transport, TransportKind, WriteOutcome};
use crate::tree::ObjectTree;

/// Relative timeout sentinel for calls that should never expire.
pub const TIMEOUT_NEVER: u64 = u64::max_value();

/// Connection lifecycle. Setup operations are legal only in `Unset`;
/// traffic flows in `Hello` and `Running`; `Closed` is terminal.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Unset,
    Opening,
    Authenticating,
    Hello,
    Running,
    Closed,
}

/// One connection to a broker or a peer.
///
/// The connection is a single-owner object driven by an external
/// readiness loop: poll the descriptor from `fd` for the events from
/// `events` up to the deadline from `timeout_usec`, then call `process`
/// until it reports `BusError::Wait`. Only `wait`, `flush` and
/// `call_blocking` block.
pub struct Connection {
    state: State,
    transport: Option<Box<dyn Transport>>,
    connector: Option<Box<dyn Connector>>,
    address: Option<AddressList>,
    bus_client: bool,
    server: bool,
    anonymous: bool,
    accept_fd: bool,
    can_fds: bool,
    server_id: Option<String>,
    unique_name: Option<String>,
    serial: u32,
    iteration: u64,
    processing: bool,
    owner_pid: u32,
    rqueue: VecDeque<Message>,
    wqueue: VecDeque<Message>,
    windex: usize,
    replies: ReplyTracker,
    filters: FilterSet,
    matches: MatchSet,
    tree: ObjectTree,
    limits: Limits,
    hello_serial: Option<u32>,
    hello_deadline: u64,
    auth_deadline: u64,
    last_error: Option<BusError>,
    log: logging::Logger,
}

impl Connection {
    /// Creates an unset connection with default limits.
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Connection {
        Connection::with_limits(Limits::default(), log)
    }

    pub fn with_limits<'a, L: Into<Option<&'a logging::Logger>>>(
        limits: Limits,
        log: L,
    ) -> Connection {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        Connection {
            state: State::Unset,
            transport: None,
            connector: None,
            address: None,
            bus_client: false,
            server: false,
            anonymous: false,
            accept_fd: false,
            can_fds: false,
            server_id: None,
            unique_name: None,
            serial: 0,
            iteration: 0,
            processing: false,
            owner_pid: std::process::id(),
            rqueue: VecDeque::new(),
            wqueue: VecDeque::new(),
            windex: 0,
            replies: ReplyTracker::new(),
            filters: FilterSet::new(),
            matches: MatchSet::new(),
            tree: ObjectTree::new(&conn_log),
            limits,
            hello_serial: None,
            hello_deadline: 0,
            auth_deadline: 0,
            last_error: None,
            log: conn_log,
        }
    }

    /// Opens a client connection to the system bus.
    pub fn open_system<'a, L: Into<Option<&'a logging::Logger>>>(
        connector: Box<dyn Connector>,
        log: L,
    ) -> BusResult<Connection> {
        let mut conn = Connection::new(log);
        conn.set_address(&address::system_bus_address())?;
        conn.set_connector(connector)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    /// Opens a client connection to the per-user bus.
    pub fn open_user<'a, L: Into<Option<&'a logging::Logger>>>(
        connector: Box<dyn Connector>,
        log: L,
    ) -> BusResult<Connection> {
        let mut conn = Connection::new(log);
        conn.set_address(&address::user_bus_address()?)?;
        conn.set_connector(connector)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    #[inline]
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    #[inline]
    pub fn is_bus_client(&self) -> bool {
        self.bus_client
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.server
    }

    #[inline]
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Whether descriptor passing was negotiated during the handshake.
    #[inline]
    pub fn can_send_fds(&self) -> bool {
        self.can_fds
    }

    /// Sets the endpoint list to connect through. Only legal in `Unset`.
    pub fn set_address(&mut self, address: &str) -> BusResult<()> {
        self.check_setup()?;
        let list = AddressList::parse(address)?;
        self.server_id = list.guid().map(str::to_string);
        self.address = Some(list);
        Ok(())
    }

    /// Sets the transport factory used to realize endpoints on `start`.
    pub fn set_connector(&mut self, connector: Box<dyn Connector>) -> BusResult<()> {
        self.check_setup()?;
        self.connector = Some(connector);
        Ok(())
    }

    /// Installs an already-created transport, bypassing address
    /// resolution. The descriptor-equivalent of configuring fds.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) -> BusResult<()> {
        self.check_setup()?;
        self.transport = Some(transport);
        Ok(())
    }

    /// Marks this end as a broker client that performs the hello
    /// handshake once authenticated.
    pub fn set_bus_client(&mut self, bus_client: bool) -> BusResult<()> {
        self.check_setup()?;
        self.bus_client = bus_client;
        Ok(())
    }

    /// Marks this end as the serving side of a direct peer connection.
    pub fn set_server(&mut self, server: bool) -> BusResult<()> {
        self.check_setup()?;
        self.server = server;
        Ok(())
    }

    /// Allows the peer to stay anonymous during auth.
    pub fn set_anonymous(&mut self, anonymous: bool) -> BusResult<()> {
        self.check_setup()?;
        self.anonymous = anonymous;
        Ok(())
    }

    /// Requests descriptor passing; the handshake decides whether it
    /// sticks.
    pub fn set_accept_fd(&mut self, accept: bool) -> BusResult<()> {
        self.check_setup()?;
        self.accept_fd = accept;
        Ok(())
    }

    /// Begins connecting. The state machine advances through `process`.
    pub fn start(&mut self) -> BusResult<()> {
        self.check_owner()?;
        if self.state != State::Unset {
            return Err(Fault::PermissionDenied.into());
        }

        if self.transport.is_some() {
            self.state = State::Opening;
            logging::debug!(self.log, "starting with configured transport");
            return Ok(());
        }

        if self.address.is_none() || self.connector.is_none() {
            return Err(Fault::InvalidArgument.into());
        }

        self.state = State::Opening;
        self.connect_next()
    }

    /// Attempts endpoints from the cursor until one yields a transport.
    /// Exhausting the list closes the connection with the most recent
    /// connect error.
    fn connect_next(&mut self) -> BusResult<()> {
        loop {
            let endpoint = match self.address.as_mut().and_then(|list| list.next().cloned()) {
                Some(endpoint) => endpoint,
                None => {
                    let error = self
                        .last_error
                        .take()
                        .unwrap_or_else(|| Fault::ConnectionRefused.into());
                    logging::warn!(self.log, "all endpoints failed");
                    self.close_internal();
                    return Err(error);
                }
            };

            match self
                .connector
                .as_mut()
                .expect("Connector checked in start")
                .connect(&endpoint)
            {
                Ok(transport) => {
                    self.transport = Some(transport);
                    return Ok(());
                }
                Err(error) => {
                    logging::debug!(self.log, "endpoint failed, trying next"; "error" => ?error);
                    self.last_error = Some(error);
                }
            }
        }
    }

    /// The descriptor to poll. Requires the transport to use one
    /// descriptor for both directions.
    pub fn fd(&self) -> BusResult<RawFd> {
        self.check_owner()?;
        let transport = self.transport.as_ref().ok_or(Fault::NotConnected)?;

        match transport.descriptors() {
            Some((input, output)) if input == output => Ok(input),
            _ => Err(Fault::PermissionDenied.into()),
        }
    }

    /// The readiness set the caller should poll for, or `None` when
    /// there is nothing to wait on and `process` should run instead.
    pub fn events(&self) -> BusResult<Option<Interest>> {
        self.check_owner()?;

        match self.state {
            State::Unset | State::Closed => Err(Fault::NotConnected.into()),
            State::Opening => Ok(Some(Interest::WRITABLE)),
            State::Authenticating => {
                let transport = self.transport.as_ref().ok_or(Fault::NotConnected)?;
                Ok(Some(if transport.auth_pending_output() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                }))
            }
            State::Hello | State::Running => {
                let mut interest = None;
                if self.rqueue.is_empty() {
                    interest = Some(Interest::READABLE);
                }
                if !self.wqueue.is_empty() {
                    interest = Some(match interest {
                        Some(interest) => interest | Interest::WRITABLE,
                        None => Interest::WRITABLE,
                    });
                }
                Ok(interest)
            }
        }
    }

    /// The absolute monotonic deadline the caller should wake at: the
    /// auth timeout while handshaking, the earliest pending-call deadline
    /// while running.
    pub fn timeout_usec(&self) -> BusResult<Option<u64>> {
        self.check_owner()?;

        match self.state {
            State::Authenticating => Ok(Some(self.auth_deadline)),
            State::Hello | State::Running => {
                let mut deadline = self.replies.earliest_deadline();
                if self.hello_deadline != 0 {
                    deadline = Some(match deadline {
                        Some(other) => other.min(self.hello_deadline),
                        None => self.hello_deadline,
                    });
                }
                Ok(deadline)
            }
            _ => Ok(None),
        }
    }

    /// Advances the connection by one step. Returns a message when one
    /// passed through the dispatcher unconsumed, `Err(Wait)` when the
    /// caller should block on readiness. Reentrant calls fault with
    /// `Busy`.
    pub fn process(&mut self) -> BusResult<Option<Message>> {
        self.check_owner()?;
        if self.processing {
            return Err(Fault::Busy.into());
        }

        self.processing = true;
        let result = self.process_step();
        self.processing = false;
        result
    }

    fn process_step(&mut self) -> BusResult<Option<Message>> {
        match self.state {
            State::Unset | State::Closed => Err(Fault::NotConnected.into()),
            State::Opening => self.process_opening().map(|_| None),
            State::Authenticating => self.process_auth().map(|_| None),
            State::Hello | State::Running => self.process_running(),
        }
    }

    fn process_opening(&mut self) -> BusResult<()> {
        let result = self
            .transport
            .as_mut()
            .expect("Opening requires a transport")
            .connect_step();

        match result {
            Ok(()) => {
                self.state = State::Authenticating;
                self.auth_deadline = monotonic_usec() + self.limits.auth_timeout_usec;
                logging::debug!(self.log, "transport established");
                Ok(())
            }
            Err(BusError::Wait) => Err(BusError::Wait),
            Err(error) => {
                logging::debug!(self.log, "connect failed"; "error" => ?error);
                self.transport = None;
                self.last_error = Some(error);

                if self.address.is_some() && self.connector.is_some() {
                    self.connect_next()
                } else {
                    let error = self.last_error.take().expect("Error recorded above");
                    self.close_internal();
                    Err(error)
                }
            }
        }
    }

    fn process_auth(&mut self) -> BusResult<()> {
        if monotonic_usec() >= self.auth_deadline {
            logging::warn!(self.log, "auth handshake timed out");
            self.close_internal();
            return Err(Fault::TimedOut.into());
        }

        let result = self
            .transport
            .as_mut()
            .expect("Authenticating requires a transport")
            .auth_step();

        match result {
            Ok(()) => {
                let transport = self.transport.as_ref().expect("Transport checked above");
                self.can_fds = self.accept_fd && transport.supports_fds();
                self.auth_deadline = 0;

                if self.bus_client && transport.kind() != TransportKind::Kernel {
                    self.state = State::Hello;
                    self.queue_hello()?;
                    logging::debug!(self.log, "authenticated, awaiting unique name");
                } else {
                    self.state = State::Running;
                    logging::info!(self.log, "connection running");
                }
                Ok(())
            }
            Err(BusError::Wait) => Err(BusError::Wait),
            Err(error) => {
                logging::warn!(self.log, "auth failed"; "error" => ?error);
                self.close_internal();
                Err(error)
            }
        }
    }

    fn process_running(&mut self) -> BusResult<Option<Message>> {
        // Expire at most one pending call per step
        if let Some(mut pending) = self.replies.take_expired(monotonic_usec()) {
            let timeout = reply::timeout_error(pending.serial());
            logging::debug!(self.log, "pending call timed out"; "serial" => pending.serial());

            let mut ctx = self.ctx();
            pending.invoke(&mut ctx, &timeout)?;
            return Ok(None);
        }

        if self.state == State::Hello
            && self.hello_deadline != 0
            && monotonic_usec() >= self.hello_deadline
        {
            self.close_internal();
            return Err(Fault::TimedOut.into());
        }

        match self.write_step() {
            Ok(true) => return Ok(None),
            Ok(false) => {}
            Err(error) => {
                self.close_internal();
                return Err(error);
            }
        }

        if let Some(message) = self.rqueue.pop_front() {
            self.iteration += 1;
            let consumed = self.dispatch_inbound(&message)?;
            return Ok(match consumed {
                Handled::Yes => None,
                Handled::No => Some(message),
            });
        }

        if self.rqueue.len() >= self.limits.rqueue_max {
            return Err(Fault::NoBufferSpace.into());
        }

        let result = self
            .transport
            .as_mut()
            .expect("Open connection requires a transport")
            .read_message();

        match result {
            Ok(message) => {
                logging::trace!(self.log, "message read"; "serial" => message.serial());
                self.rqueue.push_back(message);
                Ok(None)
            }
            Err(BusError::Wait) => Err(BusError::Wait),
            Err(error) => {
                logging::warn!(self.log, "read failed"; "error" => ?error);
                self.close_internal();
                Err(error)
            }
        }
    }

    /// Transmits the head of the write queue, resuming partial writes
    /// from `windex`. True when a message was fully transmitted.
    fn write_step(&mut self) -> BusResult<bool> {
        let message = match self.wqueue.front() {
            Some(message) => message,
            None => return Ok(false),
        };

        let result = self
            .transport
            .as_mut()
            .expect("Open connection requires a transport")
            .write_message(message, self.windex);

        match result {
            Ok(WriteOutcome::Done) => {
                self.wqueue.pop_front();
                self.windex = 0;
                Ok(true)
            }
            Ok(WriteOutcome::Partial(offset)) => {
                self.windex = offset;
                Ok(false)
            }
            Err(BusError::Wait) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn dispatch_inbound(&mut self, message: &Message) -> BusResult<Handled> {
        if self.state == State::Hello {
            if !message.is_reply() || Some(message.reply_serial()) != self.hello_serial {
                logging::warn!(self.log, "unexpected traffic before unique name assignment");
                self.close_internal();
                return Err(Fault::Protocol.into());
            }
            return self.handle_hello_reply(message).map(|_| Handled::Yes);
        }

        let mut ctx = self.ctx();
        dispatch::dispatch(&mut ctx, message)
    }

    fn handle_hello_reply(&mut self, message: &Message) -> BusResult<()> {
        self.hello_serial = None;
        self.hello_deadline = 0;

        if message.ty() == MessageType::MethodError {
            let fault = Fault::Wire {
                name: message.error_name().unwrap_or("unknown").to_string(),
                message: message.error_message().unwrap_or("").to_string(),
            };
            self.close_internal();
            return Err(fault.into());
        }

        let name = match message.body() {
            [Value::Str(name)] if name.starts_with(':') && support::bus_name_is_valid(name) => {
                name.clone()
            }
            _ => {
                logging::warn!(self.log, "broker returned malformed unique name");
                self.close_internal();
                return Err(Fault::Protocol.into());
            }
        };

        logging::info!(self.log, "unique name assigned"; "name" => &name);
        self.unique_name = Some(name);
        self.state = State::Running;
        Ok(())
    }

    /// Queues the initial Hello call to the broker.
    fn queue_hello(&mut self) -> BusResult<()> {
        let mut message =
            Message::method_call(builtin::BUS_PATH, builtin::BUS_INTERFACE, "Hello")?;
        message.set_destination(Some(builtin::BUS_SERVICE.to_string()))?;

        let serial = support::next_serial(&mut self.serial);
        message.seal(serial)?;

        self.hello_serial = Some(serial);
        self.hello_deadline = monotonic_usec() + self.limits.call_timeout_usec;
        self.wqueue.push_back(message);

        logging::debug!(self.log, "hello queued"; "serial" => serial);
        Ok(())
    }

    /// Seals and sends a message: transmitted directly when the write
    /// queue is idle and the connection is running, queued otherwise.
    /// Returns the assigned serial.
    pub fn send(&mut self, mut message: Message) -> BusResult<u32> {
        self.check_owner()?;

        match self.state {
            State::Unset | State::Closed => return Err(Fault::NotConnected.into()),
            _ => {}
        }

        if !message.is_sealed() {
            let serial = support::next_serial(&mut self.serial);
            message.seal(serial)?;
        }
        let serial = message.serial();

        if self.state == State::Running && self.wqueue.is_empty() {
            let result = self
                .transport
                .as_mut()
                .expect("Open connection requires a transport")
                .write_message(&message, 0);

            match result {
                Ok(WriteOutcome::Done) => return Ok(serial),
                Ok(WriteOutcome::Partial(offset)) => {
                    self.windex = offset;
                    self.wqueue.push_back(message);
                    return Ok(serial);
                }
                Err(BusError::Wait) => {}
                Err(error) => {
                    self.close_internal();
                    return Err(error);
                }
            }
        }

        // The queue always keeps room for one entry so partial-write
        // progress stays recordable
        if !self.wqueue.is_empty() && self.wqueue.len() >= self.limits.wqueue_max {
            return Err(Fault::NoBufferSpace.into());
        }

        self.wqueue.push_back(message);
        Ok(serial)
    }

    /// Seals and queues a signal.
    pub fn emit(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> BusResult<u32> {
        let mut message = Message::signal(path, interface, member)?;
        for value in body {
            message.append(value)?;
        }
        self.send(message)
    }

    /// Emits the PropertiesChanged signal for the named properties of
    /// `interface` at `path`.
    pub fn emit_properties_changed(
        &mut self,
        path: &str,
        interface: &str,
        names: &[&str],
    ) -> BusResult<u32> {
        let message = builtin::properties_changed_message(&self.tree, path, interface, names)?;
        self.send(message)
    }

    /// Sends a method call and registers `callback` for its reply. A
    /// timeout of zero applies the configured default; `TIMEOUT_NEVER`
    /// disables expiry. The callback always receives a message,
    /// possibly the synthesized timeout error.
    pub fn call_async(
        &mut self,
        message: Message,
        usec: u64,
        callback: ReplyCallback,
    ) -> BusResult<u32> {
        if message.ty() != MessageType::MethodCall || !message.expects_reply() {
            return Err(Fault::InvalidArgument.into());
        }

        let deadline = self.call_deadline(usec);
        let serial = self.send(message)?;
        self.replies.register(serial, deadline, callback)?;
        Ok(serial)
    }

    /// Cancels a pending call by serial, reporting whether it existed.
    pub fn cancel(&mut self, serial: u32) -> bool {
        self.replies.cancel(serial)
    }

    /// Sends a method call and blocks until its reply arrives. Unrelated
    /// inbound traffic queues up for later dispatch in arrival order. A
    /// method error comes back as `Fault::Wire`.
    pub fn call_blocking(&mut self, message: Message, usec: u64) -> BusResult<Message> {
        self.check_owner()?;
        if self.processing {
            return Err(Fault::Busy.into());
        }
        if self.state != State::Running {
            return Err(Fault::NotConnected.into());
        }
        if message.ty() != MessageType::MethodCall || !message.expects_reply() {
            return Err(Fault::InvalidArgument.into());
        }

        let deadline = self.call_deadline(usec);
        let serial = self.send(message)?;

        // Push out everything ahead of the call before listening
        while !self.wqueue.is_empty() {
            if !self.write_step()? {
                self.poll_readiness(Some(deadline))?;
                self.check_deadline(deadline)?;
            }
        }

        loop {
            let result = self
                .transport
                .as_mut()
                .expect("Open connection requires a transport")
                .read_message();

            match result {
                Ok(message) => {
                    if message.is_reply() && message.reply_serial() == serial {
                        return match message.ty() {
                            MessageType::MethodReturn => Ok(message),
                            _ => Err(Fault::Wire {
                                name: message.error_name().unwrap_or("unknown").to_string(),
                                message: message.error_message().unwrap_or("").to_string(),
                            }
                            .into()),
                        };
                    }

                    if self.rqueue.len() >= self.limits.rqueue_max {
                        return Err(Fault::NoBufferSpace.into());
                    }
                    self.rqueue.push_back(message);
                }
                Err(BusError::Wait) => {
                    self.check_deadline(deadline)?;
                    self.poll_readiness(Some(deadline))?;
                    self.check_deadline(deadline)?;
                }
                Err(error) => {
                    self.close_internal();
                    return Err(error);
                }
            }
        }
    }

    /// Blocks until the connection is ready for `process`, the deadline
    /// from `timeout_usec` passes, or the caller-supplied relative
    /// timeout elapses. Returns immediately when inbound traffic is
    /// already queued.
    pub fn wait(&mut self, usec: u64) -> BusResult<()> {
        self.check_owner()?;

        match self.state {
            State::Unset | State::Closed => return Err(Fault::NotConnected.into()),
            _ => {}
        }

        if !self.rqueue.is_empty() {
            return Ok(());
        }

        let mut deadline = self.timeout_usec()?;
        if usec != TIMEOUT_NEVER {
            let caller = monotonic_usec() + usec;
            deadline = Some(match deadline {
                Some(other) => other.min(caller),
                None => caller,
            });
        }

        self.poll_readiness(deadline)
    }

    /// Drives the handshake to completion, then drains the write queue.
    pub fn flush(&mut self) -> BusResult<()> {
        self.check_owner()?;

        loop {
            match self.state {
                State::Unset | State::Closed => return Err(Fault::NotConnected.into()),
                State::Running => break,
                _ => {}
            }

            match self.process() {
                Ok(_) => {}
                Err(BusError::Wait) => self.wait(TIMEOUT_NEVER)?,
                Err(error) => return Err(error),
            }
        }

        while !self.wqueue.is_empty() {
            match self.write_step() {
                Ok(true) => {}
                Ok(false) => self.poll_readiness(None)?,
                Err(error) => {
                    self.close_internal();
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    /// Closes the connection. Idempotent; pending calls are dropped and
    /// queued traffic is discarded.
    pub fn close(&mut self) {
        if self.check_owner().is_err() {
            // A fork separated us from the descriptors; leave them to
            // the owning process
            self.transport = None;
            self.state = State::Closed;
            return;
        }
        self.close_internal();
    }

    fn close_internal(&mut self) {
        if self.state == State::Closed {
            return;
        }

        logging::debug!(self.log, "closing connection";
                        "rqueue" => self.rqueue.len(),
                        "wqueue" => self.wqueue.len());

        if let Some(transport) = self.transport.as_mut() {
            transport.shutdown();
        }

        self.rqueue.clear();
        self.wqueue.clear();
        self.windex = 0;
        self.hello_serial = None;
        self.hello_deadline = 0;
        self.state = State::Closed;
    }

    /// The object tree, for registering callbacks, vtables, enumerators
    /// and object-manager roots.
    #[inline]
    pub fn objects(&mut self) -> &mut ObjectTree {
        &mut self.tree
    }

    pub fn add_filter(&mut self, callback: FilterCallback) -> u64 {
        self.filters.add(callback)
    }

    pub fn remove_filter(&mut self, id: u64) -> bool {
        self.filters.remove(id)
    }

    pub fn add_match(&mut self, predicate: MatchPredicate, callback: MatchCallback) -> u64 {
        self.matches.add(predicate, callback)
    }

    pub fn remove_match(&mut self, id: u64) -> bool {
        self.matches.remove(id)
    }

    fn ctx(&mut self) -> DispatchCtx {
        DispatchCtx {
            state: self.state,
            serial: &mut self.serial,
            wqueue: &mut self.wqueue,
            limits: &self.limits,
            filters: &mut self.filters,
            matches: &mut self.matches,
            tree: &mut self.tree,
            replies: &mut self.replies,
            iteration: self.iteration,
            unique_name: self.unique_name.as_deref(),
            log: &self.log,
        }
    }

    fn call_deadline(&self, usec: u64) -> u64 {
        if usec == TIMEOUT_NEVER {
            return NEVER;
        }
        let timeout = if usec == 0 {
            self.limits.call_timeout_usec
        } else {
            usec
        };
        monotonic_usec() + timeout
    }

    fn check_deadline(&self, deadline: u64) -> BusResult<()> {
        if deadline != NEVER && monotonic_usec() >= deadline {
            return Err(Fault::TimedOut.into());
        }
        Ok(())
    }

    /// Polls the transport descriptor for the current readiness set up
    /// to the absolute deadline.
    fn poll_readiness(&mut self, deadline: Option<u64>) -> BusResult<()> {
        let interest = match self.events()? {
            Some(interest) => interest,
            None => return Ok(()),
        };
        let fd = self.fd()?;

        let timeout = deadline.filter(|d| *d != NEVER).map(|deadline| {
            let now = monotonic_usec();
            if deadline <= now {
                Duration::from_micros(0)
            } else {
                Duration::from_micros(deadline - now)
            }
        });

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut SourceFd(&fd), Token(0), interest)?;

        let mut events = Events::with_capacity(4);
        loop {
            match poll.poll(&mut events, timeout) {
                Ok(()) => return Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    #[inline]
    fn check_owner(&self) -> BusResult<()> {
        if std::process::id() != self.owner_pid {
            return Err(Fault::ChildProcess.into());
        }
        Ok(())
    }

    #[inline]
    fn check_setup(&self) -> BusResult<()> {
        self.check_owner()?;
        if self.state != State::Unset {
            return Err(Fault::PermissionDenied.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::error_name;
    use crate::tree::vtable::{PropertyFlags, Vtable};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::thread;

    struct MockState {
        connect_waits: u32,
        auth_waits: u32,
        inbound: VecDeque<Message>,
        sent: Vec<Message>,
        // Byte-accurate partial write simulation: (message size, chunk)
        partial: Option<(usize, usize)>,
        write_wait: bool,
        read_fault: Option<Fault>,
        read_delay: Option<Duration>,
    }

    struct MockTransport {
        state: Rc<RefCell<MockState>>,
    }

    fn mock() -> (MockTransport, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState {
            connect_waits: 0,
            auth_waits: 0,
            inbound: VecDeque::new(),
            sent: Vec::new(),
            partial: None,
            write_wait: false,
            read_fault: None,
            read_delay: None,
        }));
        (
            MockTransport {
                state: state.clone(),
            },
            state,
        )
    }

    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        fn descriptors(&self) -> Option<(RawFd, RawFd)> {
            None
        }

        fn connect_step(&mut self) -> BusResult<()> {
            let mut state = self.state.borrow_mut();
            if state.connect_waits > 0 {
                state.connect_waits -= 1;
                return Err(BusError::Wait);
            }
            Ok(())
        }

        fn auth_step(&mut self) -> BusResult<()> {
            let mut state = self.state.borrow_mut();
            if state.auth_waits > 0 {
                state.auth_waits -= 1;
                return Err(BusError::Wait);
            }
            Ok(())
        }

        fn auth_pending_output(&self) -> bool {
            false
        }

        fn read_message(&mut self) -> BusResult<Message> {
            let mut state = self.state.borrow_mut();
            if let Some(delay) = state.read_delay {
                thread::sleep(delay);
            }
            if let Some(fault) = state.read_fault.take() {
                return Err(fault.into());
            }
            state.inbound.pop_front().ok_or(BusError::Wait)
        }

        fn write_message(&mut self, message: &Message, offset: usize) -> BusResult<WriteOutcome> {
            let mut state = self.state.borrow_mut();
            if state.write_wait {
                return Err(BusError::Wait);
            }

            if let Some((size, chunk)) = state.partial {
                let written = (offset + chunk).min(size);
                if written < size {
                    return Ok(WriteOutcome::Partial(written));
                }
            }

            state.sent.push(message.clone());
            Ok(WriteOutcome::Done)
        }

        fn shutdown(&mut self) {}
    }

    /// A connection in `Running` state over a mock transport, peer mode.
    fn running_conn() -> (Connection, Rc<RefCell<MockState>>) {
        let (transport, state) = mock();
        let mut conn = Connection::new(None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();
        assert_eq!(conn.state(), State::Running);
        (conn, state)
    }

    fn inject(state: &Rc<RefCell<MockState>>, message: Message) {
        state.borrow_mut().inbound.push_back(message);
    }

    fn drain(conn: &mut Connection) -> Vec<Message> {
        let mut unconsumed = Vec::new();
        loop {
            match conn.process() {
                Ok(Some(message)) => unconsumed.push(message),
                Ok(None) => {}
                Err(BusError::Wait) => break,
                Err(error) => panic!("Unexpected process error {:?}", error),
            }
        }
        unconsumed
    }

    fn sealed_call(path: &str, interface: &str, member: &str, serial: u32) -> Message {
        let mut message = Message::method_call(path, interface, member).unwrap();
        message.seal(serial).unwrap();
        message
    }

    #[test]
    fn test_setup_ops_only_in_unset() {
        let (transport, _) = mock();
        let mut conn = Connection::new(None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();

        assert_eq!(
            conn.set_address("unix:path=/tmp/bus").unwrap_err(),
            BusError::Fault(Fault::PermissionDenied)
        );
        assert_eq!(
            conn.set_bus_client(true).unwrap_err(),
            BusError::Fault(Fault::PermissionDenied)
        );
        assert_eq!(
            conn.start().unwrap_err(),
            BusError::Fault(Fault::PermissionDenied)
        );
    }

    #[test]
    fn test_start_without_endpoint_rejected() {
        let mut conn = Connection::new(None);
        assert_eq!(
            conn.start().unwrap_err(),
            BusError::Fault(Fault::InvalidArgument)
        );
    }

    #[test]
    fn test_handshake_reaches_running() {
        let (transport, state) = mock();
        state.borrow_mut().connect_waits = 1;
        state.borrow_mut().auth_waits = 1;

        let mut conn = Connection::new(None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();
        assert_eq!(conn.state(), State::Opening);

        assert_eq!(conn.process().unwrap_err(), BusError::Wait);
        conn.process().unwrap();
        assert_eq!(conn.state(), State::Authenticating);

        assert_eq!(conn.process().unwrap_err(), BusError::Wait);
        conn.process().unwrap();
        assert_eq!(conn.state(), State::Running);
    }

    #[test]
    fn test_hello_handshake_assigns_unique_name() {
        let (transport, state) = mock();
        let mut conn = Connection::new(None);
        conn.set_address("unix:path=/tmp/bus").unwrap();
        conn.set_transport(Box::new(transport)).unwrap();
        conn.set_bus_client(true).unwrap();
        conn.start().unwrap();

        conn.process().unwrap(); // connect
        conn.process().unwrap(); // auth, queues hello
        assert_eq!(conn.state(), State::Hello);

        conn.process().unwrap(); // transmit hello
        let hello = state.borrow().sent[0].clone();
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.destination(), Some(builtin::BUS_SERVICE));
        assert_eq!(hello.path(), Some(builtin::BUS_PATH));

        let mut reply = Message::method_return(&hello).unwrap();
        reply.append(Value::Str(":1.42".to_string())).unwrap();
        reply.seal(99).unwrap();
        inject(&state, reply);

        conn.process().unwrap(); // read
        conn.process().unwrap(); // dispatch hello reply

        assert_eq!(conn.state(), State::Running);
        assert_eq!(conn.unique_name(), Some(":1.42"));
    }

    #[test]
    fn test_hello_malformed_name_is_protocol_error() {
        let (transport, state) = mock();
        let mut conn = Connection::new(None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.set_bus_client(true).unwrap();
        conn.start().unwrap();

        conn.process().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();

        let hello = state.borrow().sent[0].clone();
        let mut reply = Message::method_return(&hello).unwrap();
        reply.append(Value::Str("1.42".to_string())).unwrap();
        reply.seal(99).unwrap();
        inject(&state, reply);

        conn.process().unwrap();
        assert_eq!(
            conn.process().unwrap_err(),
            BusError::Fault(Fault::Protocol)
        );
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(conn.unique_name(), None);
    }

    #[test]
    fn test_hello_state_rejects_unrelated_traffic() {
        let (transport, state) = mock();
        let mut conn = Connection::new(None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.set_bus_client(true).unwrap();
        conn.start().unwrap();

        conn.process().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();

        let mut signal = Message::signal("/x", "org.example.Iface", "Stray").unwrap();
        signal.seal(5).unwrap();
        inject(&state, signal);

        conn.process().unwrap();
        assert_eq!(
            conn.process().unwrap_err(),
            BusError::Fault(Fault::Protocol)
        );
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_call_timeout_synthesizes_error() {
        let (mut conn, _state) = running_conn();

        let outcome: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let outcome_handle = outcome.clone();

        let call = Message::method_call("/peer", "org.example.Iface", "Slow").unwrap();
        conn.call_async(
            call,
            10_000,
            Box::new(move |_, reply| {
                *outcome_handle.borrow_mut() =
                    reply.error_name().map(str::to_string);
                Ok(Handled::Yes)
            }),
        )
        .unwrap();

        // Nothing expires yet
        drain(&mut conn);
        assert!(outcome.borrow().is_none());

        thread::sleep(Duration::from_millis(12));
        drain(&mut conn);

        assert_eq!(outcome.borrow().as_deref(), Some(error_name::TIMEOUT));
        assert!(conn.replies.is_empty());
    }

    #[test]
    fn test_call_async_reply_dispatch() {
        let (mut conn, state) = running_conn();

        let got: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));
        let got_handle = got.clone();

        let call = Message::method_call("/peer", "org.example.Iface", "Quick").unwrap();
        let serial = conn
            .call_async(
                call,
                0,
                Box::new(move |_, reply| {
                    *got_handle.borrow_mut() = Some(reply.reply_serial());
                    Ok(Handled::Yes)
                }),
            )
            .unwrap();

        let sent = state.borrow().sent[0].clone();
        let mut reply = Message::method_return(&sent).unwrap();
        reply.seal(50).unwrap();
        inject(&state, reply);

        drain(&mut conn);
        assert_eq!(*got.borrow(), Some(serial));
    }

    #[test]
    fn test_cancel_pending_call() {
        let (mut conn, _state) = running_conn();

        let call = Message::method_call("/peer", "org.example.Iface", "Quick").unwrap();
        let serial = conn
            .call_async(call, 0, Box::new(|_, _| Ok(Handled::Yes)))
            .unwrap();

        assert!(conn.cancel(serial));
        assert!(!conn.cancel(serial));
    }

    #[test]
    fn test_call_blocking_matches_reply_and_queues_rest() {
        let (mut conn, state) = running_conn();

        // Unrelated signal arrives ahead of the reply
        let mut stray = Message::signal("/s", "org.example.Iface", "Stray").unwrap();
        stray.seal(70).unwrap();
        inject(&state, stray);

        let mut reply = {
            let call = sealed_call("/peer", "org.example.Iface", "Quick", 1);
            Message::method_return(&call).unwrap()
        };
        reply.append(Value::Uint32(11)).unwrap();
        reply.seal(71).unwrap();
        inject(&state, reply);

        let call = Message::method_call("/peer", "org.example.Iface", "Quick").unwrap();
        let result = conn.call_blocking(call, TIMEOUT_NEVER).unwrap();

        assert_eq!(result.body(), &[Value::Uint32(11)]);
        assert_eq!(conn.rqueue.len(), 1);

        // The stray signal is dispatched afterwards, in arrival order
        let unconsumed = drain(&mut conn);
        assert_eq!(unconsumed.len(), 1);
        assert_eq!(unconsumed[0].member(), Some("Stray"));
    }

    #[test]
    fn test_call_blocking_propagates_method_error() {
        let (mut conn, state) = running_conn();

        let reply = {
            let call = sealed_call("/peer", "org.example.Iface", "Quick", 1);
            let mut message =
                Message::method_error(&call, "org.example.Error.Denied", "no").unwrap();
            message.seal(71).unwrap();
            message
        };
        inject(&state, reply);

        let call = Message::method_call("/peer", "org.example.Iface", "Quick").unwrap();
        match conn.call_blocking(call, TIMEOUT_NEVER).unwrap_err() {
            BusError::Fault(Fault::Wire { name, .. }) => {
                assert_eq!(name, "org.example.Error.Denied")
            }
            error => panic!("Unexpected error {:?}", error),
        }
    }

    #[test]
    fn test_call_blocking_times_out() {
        let (mut conn, state) = running_conn();
        state.borrow_mut().read_delay = Some(Duration::from_millis(2));

        let call = Message::method_call("/peer", "org.example.Iface", "Quick").unwrap();
        let result = conn.call_blocking(call, 1_000);

        assert_eq!(result.unwrap_err(), BusError::Fault(Fault::TimedOut));
    }

    #[test]
    fn test_partial_write_resumes_from_windex() {
        let (mut conn, state) = running_conn();
        state.borrow_mut().partial = Some((100, 40));

        let call = Message::method_call("/peer", "org.example.Iface", "Big").unwrap();
        conn.send(call).unwrap();

        // The direct transmit got 40 bytes out and queued the rest
        assert_eq!(conn.windex, 40);
        assert_eq!(conn.wqueue.len(), 1);

        assert_eq!(conn.process().unwrap_err(), BusError::Wait);
        assert_eq!(conn.windex, 80);

        conn.process().unwrap();
        assert_eq!(conn.windex, 0);
        assert!(conn.wqueue.is_empty());
        assert_eq!(state.borrow().sent.len(), 1);
    }

    #[test]
    fn test_wqueue_exhaustion_keeps_queued_messages() {
        let mut limits = Limits::default();
        limits.wqueue_max = 2;

        let (transport, state) = mock();
        state.borrow_mut().write_wait = true;

        let mut conn = Connection::with_limits(limits, None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();

        conn.send(Message::method_call("/p", "org.example.I", "A").unwrap())
            .unwrap();
        conn.send(Message::method_call("/p", "org.example.I", "B").unwrap())
            .unwrap();

        let result = conn.send(Message::method_call("/p", "org.example.I", "C").unwrap());
        assert_eq!(result.unwrap_err(), BusError::Fault(Fault::NoBufferSpace));
        assert_eq!(conn.wqueue.len(), 2);

        // Once the transport drains, the queued messages go out intact
        state.borrow_mut().write_wait = false;
        drain(&mut conn);
        let sent = state.borrow().sent.clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].member(), Some("A"));
        assert_eq!(sent[1].member(), Some("B"));
    }

    #[test]
    fn test_wqueue_always_admits_one_entry() {
        let mut limits = Limits::default();
        limits.wqueue_max = 0;

        let (transport, state) = mock();
        state.borrow_mut().write_wait = true;

        let mut conn = Connection::with_limits(limits, None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();

        conn.send(Message::method_call("/p", "org.example.I", "A").unwrap())
            .unwrap();
        let result = conn.send(Message::method_call("/p", "org.example.I", "B").unwrap());
        assert_eq!(result.unwrap_err(), BusError::Fault(Fault::NoBufferSpace));
    }

    #[test]
    fn test_rqueue_exhaustion() {
        let mut limits = Limits::default();
        limits.rqueue_max = 0;

        let (transport, state) = mock();
        let mut conn = Connection::with_limits(limits, None);
        conn.set_transport(Box::new(transport)).unwrap();
        conn.start().unwrap();
        conn.process().unwrap();
        conn.process().unwrap();

        inject(&state, sealed_call("/p", "org.example.I", "A", 1));
        assert_eq!(
            conn.process().unwrap_err(),
            BusError::Fault(Fault::NoBufferSpace)
        );
        assert_eq!(conn.state(), State::Running);
    }

    #[test]
    fn test_fatal_read_closes_connection() {
        let (mut conn, state) = running_conn();
        state.borrow_mut().read_fault = Some(Fault::Io(std::io::ErrorKind::ConnectionReset));

        assert!(conn.process().is_err());
        assert_eq!(conn.state(), State::Closed);
        assert_eq!(
            conn.process().unwrap_err(),
            BusError::Fault(Fault::NotConnected)
        );
    }

    #[test]
    fn test_reentrant_process_is_busy() {
        let (mut conn, _state) = running_conn();
        conn.processing = true;
        assert_eq!(conn.process().unwrap_err(), BusError::Fault(Fault::Busy));
    }

    #[test]
    fn test_fork_invalidates_connection() {
        let (mut conn, _state) = running_conn();
        conn.owner_pid = conn.owner_pid.wrapping_add(1);

        assert_eq!(
            conn.process().unwrap_err(),
            BusError::Fault(Fault::ChildProcess)
        );
        assert_eq!(
            conn.send(Message::method_call("/p", "org.example.I", "A").unwrap())
                .unwrap_err(),
            BusError::Fault(Fault::ChildProcess)
        );

        // Close in the child leaves the transport untouched for the owner
        conn.close();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_events_follow_queue_state() {
        let (mut conn, state) = running_conn();

        // Idle: poll for reads only
        assert_eq!(conn.events().unwrap(), Some(Interest::READABLE));

        state.borrow_mut().write_wait = true;
        conn.send(Message::method_call("/p", "org.example.I", "A").unwrap())
            .unwrap();
        assert_eq!(
            conn.events().unwrap(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        // Pending inbound traffic means process, not poll
        inject(&state, sealed_call("/p", "org.example.I", "B", 9));
        conn.process().unwrap();
        assert_eq!(conn.events().unwrap(), Some(Interest::WRITABLE));
    }

    #[test]
    fn test_timeout_usec_reports_earliest_deadline() {
        let (mut conn, _state) = running_conn();
        assert_eq!(conn.timeout_usec().unwrap(), None);

        conn.call_async(
            Message::method_call("/p", "org.example.I", "A").unwrap(),
            1_000_000,
            Box::new(|_, _| Ok(Handled::Yes)),
        )
        .unwrap();

        let deadline = conn.timeout_usec().unwrap().unwrap();
        assert!(deadline > monotonic_usec());
        assert!(deadline <= monotonic_usec() + 1_000_000);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut conn, _state) = running_conn();
        conn.close();
        assert_eq!(conn.state(), State::Closed);
        conn.close();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_unconsumed_messages_handed_to_caller() {
        let (mut conn, state) = running_conn();

        let mut signal = Message::signal("/s", "org.example.Iface", "Stray").unwrap();
        signal.seal(3).unwrap();
        inject(&state, signal);

        let unconsumed = drain(&mut conn);
        assert_eq!(unconsumed.len(), 1);
        assert_eq!(unconsumed[0].member(), Some("Stray"));
    }

    #[test]
    fn test_method_call_round_trip_preserves_signature() {
        let (mut conn, state) = running_conn();

        conn.objects()
            .add_vtable(
                "/svc",
                false,
                Vtable::new("org.example.Echo")
                    .unwrap()
                    .method(
                        "Echo",
                        "s",
                        "s",
                        Box::new(|ctx, m| {
                            let text = match m.body() {
                                [Value::Str(text)] => text.clone(),
                                _ => unreachable!(),
                            };
                            ctx.reply_return(m, vec![Value::Str(text)])?;
                            Ok(Handled::Yes)
                        }),
                    )
                    .unwrap(),
            )
            .unwrap();

        let mut call = Message::method_call("/svc", "org.example.Echo", "Echo").unwrap();
        call.append(Value::Str("ping".to_string())).unwrap();
        call.seal(21).unwrap();
        inject(&state, call);

        drain(&mut conn);

        let sent = state.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ty(), MessageType::MethodReturn);
        assert_eq!(sent[0].reply_serial(), 21);
        assert_eq!(sent[0].signature(), "s");
        assert_eq!(sent[0].body(), &[Value::Str("ping".to_string())]);
    }

    #[test]
    fn test_peer_ping_round_trip() {
        let (mut conn, state) = running_conn();

        inject(&state, sealed_call("/any", builtin::INTERFACE_PEER, "Ping", 31));
        drain(&mut conn);

        let sent = state.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ty(), MessageType::MethodReturn);
        assert_eq!(sent[0].reply_serial(), 31);
        assert!(sent[0].body().is_empty());
    }

    #[test]
    fn test_object_manager_enumeration() {
        let (mut conn, state) = running_conn();

        conn.objects().set_object_manager("/o", true).unwrap();
        conn.objects()
            .add_vtable(
                "/o/a",
                false,
                Vtable::new("org.example.I")
                    .unwrap()
                    .property(
                        "P",
                        "s",
                        PropertyFlags::default(),
                        Box::new(|_| Ok(Value::Str("hi".to_string()))),
                    )
                    .unwrap(),
            )
            .unwrap();
        conn.objects()
            .add_enumerator("/o", Box::new(|_| Ok(vec!["/o/b".to_string()])))
            .unwrap();

        inject(
            &state,
            sealed_call("/o", builtin::INTERFACE_OBJECT_MANAGER, "GetManagedObjects", 41),
        );
        drain(&mut conn);

        let sent = state.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_serial(), 41);

        let entries = match sent[0].body() {
            [Value::Dict(key, _, entries)] => {
                assert_eq!(key, "o");
                entries.clone()
            }
            body => panic!("Unexpected body {:?}", body),
        };

        let paths: Vec<String> = entries
            .iter()
            .map(|(path, _)| match path {
                Value::ObjectPath(path) => path.clone(),
                value => panic!("Unexpected key {:?}", value),
            })
            .collect();
        assert!(paths.contains(&"/o/a".to_string()));
        assert!(paths.contains(&"/o/b".to_string()));

        // The registered object carries its interface and property value
        let (_, interfaces) = entries
            .iter()
            .find(|(path, _)| path == &Value::ObjectPath("/o/a".to_string()))
            .unwrap();
        match interfaces {
            Value::Dict(_, _, interfaces) => {
                assert!(interfaces
                    .iter()
                    .any(|(name, _)| name == &Value::Str("org.example.I".to_string())));
            }
            value => panic!("Unexpected value {:?}", value),
        }
    }

    #[test]
    fn test_emit_properties_changed() {
        let (mut conn, state) = running_conn();

        conn.objects()
            .add_vtable(
                "/o",
                false,
                Vtable::new("org.example.I")
                    .unwrap()
                    .property(
                        "P",
                        "s",
                        PropertyFlags {
                            emits_change: true,
                            invalidate_only: false,
                        },
                        Box::new(|_| Ok(Value::Str("v2".to_string()))),
                    )
                    .unwrap(),
            )
            .unwrap();

        conn.emit_properties_changed("/o", "org.example.I", &["P"]).unwrap();

        let sent = state.borrow().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].ty(), MessageType::Signal);
        assert_eq!(sent[0].member(), Some("PropertiesChanged"));
        assert_eq!(sent[0].signature(), "sa{sv}as");

        assert_eq!(
            conn.emit_properties_changed("/o", "org.example.Missing", &["P"])
                .unwrap_err(),
            BusError::Fault(Fault::NotFound)
        );
    }

    #[test]
    fn test_endpoint_iteration_on_connect_failure() {
        struct FlakyConnector {
            attempts: Rc<RefCell<Vec<String>>>,
        }

        impl Connector for FlakyConnector {
            fn connect(
                &mut self,
                endpoint: &crate::address::Endpoint,
            ) -> BusResult<Box<dyn Transport>> {
                match endpoint {
                    crate::address::Endpoint::Unix { path, .. } => {
                        self.attempts
                            .borrow_mut()
                            .push(String::from_utf8_lossy(path).to_string());
                        if path == b"/good" {
                            let (transport, _) = mock();
                            Ok(Box::new(transport))
                        } else {
                            Err(Fault::ConnectionRefused.into())
                        }
                    }
                    _ => Err(Fault::ConnectionRefused.into()),
                }
            }
        }

        let attempts = Rc::new(RefCell::new(Vec::new()));
        let mut conn = Connection::new(None);
        conn.set_address("unix:path=/bad;unix:path=/good").unwrap();
        conn.set_connector(Box::new(FlakyConnector {
            attempts: attempts.clone(),
        }))
        .unwrap();

        conn.start().unwrap();
        assert_eq!(*attempts.borrow(), vec!["/bad", "/good"]);

        conn.process().unwrap();
        conn.process().unwrap();
        assert_eq!(conn.state(), State::Running);
    }

    #[test]
    fn test_all_endpoints_failing_reports_last_error() {
        struct RefusingConnector;

        impl Connector for RefusingConnector {
            fn connect(
                &mut self,
                _endpoint: &crate::address::Endpoint,
            ) -> BusResult<Box<dyn Transport>> {
                Err(Fault::NoSuchFile.into())
            }
        }

        let mut conn = Connection::new(None);
        conn.set_address("unix:path=/a;unix:path=/b").unwrap();
        conn.set_connector(Box::new(RefusingConnector)).unwrap();

        assert_eq!(
            conn.start().unwrap_err(),
            BusError::Fault(Fault::NoSuchFile)
        );
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_guid_recorded_from_address() {
        let mut conn = Connection::new(None);
        conn.set_address("unix:path=/tmp/bus,guid=deadbeef").unwrap();
        assert_eq!(conn.server_id(), Some("deadbeef"));
    }
}

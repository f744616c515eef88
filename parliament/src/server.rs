use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR, INFO, WARNING};
use zerror_core::ErrorCore;

use parliament_pb::{
    decode, encode, Address, Body, CallbackID, Envelope, Error, MAX_MESSAGE_SIZE,
};

use crate::COLLECTOR;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES_QUEUED: Counter = Counter::new("parliament.server.messages_queued");
static DATAGRAMS_SENT: Counter = Counter::new("parliament.server.datagrams_sent");
static PARTIAL_SENDS: Counter = Counter::new("parliament.server.partial_sends");
static DATAGRAMS_RECV: Counter = Counter::new("parliament.server.datagrams_recv");
static DECODE_ERROR: Counter = Counter::new("parliament.server.decode_error");
static UNKNOWN_RECIPIENT: Counter = Counter::new("parliament.server.unknown_recipient");
static RESPONSES_ROUTED: Counter = Counter::new("parliament.server.responses_routed");
static STALE_CALLBACK: Counter = Counter::new("parliament.server.stale_callback");
static TIMEOUTS_FIRED: Counter = Counter::new("parliament.server.timeouts_fired");
static HANDLER_ERROR: Counter = Counter::new("parliament.server.handler_error");
static RESPOND_WITHOUT_REQUEST: Counter = Counter::new("parliament.server.respond_without_request");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&MESSAGES_QUEUED);
    collector.register_counter(&DATAGRAMS_SENT);
    collector.register_counter(&PARTIAL_SENDS);
    collector.register_counter(&DATAGRAMS_RECV);
    collector.register_counter(&DECODE_ERROR);
    collector.register_counter(&UNKNOWN_RECIPIENT);
    collector.register_counter(&RESPONSES_ROUTED);
    collector.register_counter(&STALE_CALLBACK);
    collector.register_counter(&TIMEOUTS_FIRED);
    collector.register_counter(&HANDLER_ERROR);
    collector.register_counter(&RESPOND_WITHOUT_REQUEST);
}

///////////////////////////////////////////// Callback /////////////////////////////////////////////

/// The requester's end of an in-flight request.  For every callback registered, exactly one of
/// the two hooks runs, at most once:  `on_response` when the response arrives before the
/// deadline, `on_timeout` when the deadline fires first.  A response that arrives after the
/// deadline is dropped without invoking anything.
pub trait Callback {
    /// The response arrived in time.
    fn on_response(self: Box<Self>, body: Body);
    /// The deadline fired first.
    fn on_timeout(self: Box<Self>);
}

////////////////////////////////////////////// Actor ///////////////////////////////////////////////

/// A named state machine multiplexed on a message server.  `handle` runs on the server's dispatch
/// loop, so it must not block; it talks to the world only through the provided [Context].
/// Message-level errors returned from `handle` are logged and dropped; they never stop the loop.
pub trait Actor {
    fn handle(&mut self, ctx: &mut Context<'_>, sender: &Address, body: Body)
        -> Result<(), Error>;
}

/////////////////////////////////////////// WriteCursor ////////////////////////////////////////////

#[derive(Debug)]
struct WriteCursor {
    destination: SocketAddr,
    datagram: Vec<u8>,
    offset: usize,
}

/////////////////////////////////////////// Switchboard ////////////////////////////////////////////

/// The outbound half of a message server:  the FIFO queue of encoded datagrams, the partial-send
/// cursor, and the table of in-flight callbacks with their deadlines.  Actors see a switchboard
/// (through [Context]) and nothing else of the server, so an actor can never reach back into the
/// handler registry.
pub struct Switchboard {
    outbound: VecDeque<(SocketAddr, Vec<u8>)>,
    cursor: Option<WriteCursor>,
    callbacks: HashMap<CallbackID, Box<dyn Callback>>,
    deadlines: BinaryHeap<Reverse<(Instant, CallbackID)>>,
}

impl Switchboard {
    /// Create a new, empty switchboard.
    pub fn new() -> Self {
        Self {
            outbound: VecDeque::new(),
            cursor: None,
            callbacks: HashMap::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Queue a fire-and-forget message.
    pub fn send(&mut self, sender: &str, recipient: &Address, body: Body) -> Result<(), Error> {
        self.enqueue(sender, recipient, body, None, false)
    }

    /// Queue a request that expects a response.  The callback's `on_response` runs if the
    /// response arrives within `timeout`; its `on_timeout` runs otherwise.
    pub fn call(
        &mut self,
        sender: &str,
        recipient: &Address,
        body: Body,
        timeout: Duration,
        callback: Box<dyn Callback>,
    ) -> Result<CallbackID, Error> {
        let callback_id = CallbackID::generate().ok_or_else(|| Error::LogicError {
            core: ErrorCore::default(),
            what: "urandom failed generating a callback id".to_string(),
        })?;
        self.enqueue(sender, recipient, body, Some(callback_id), false)?;
        self.callbacks.insert(callback_id, callback);
        self.deadlines
            .push(Reverse((Instant::now() + timeout, callback_id)));
        Ok(callback_id)
    }

    /// Queue a response to a previously-received request.
    pub fn respond(
        &mut self,
        sender: &str,
        requester: &Address,
        callback_id: CallbackID,
        body: Body,
    ) -> Result<(), Error> {
        self.enqueue(sender, requester, body, Some(callback_id), true)
    }

    /// The number of in-flight requests whose callbacks have not yet fired.
    pub fn live_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// The number of datagrams queued and not yet handed to the socket.
    pub fn backlog(&self) -> usize {
        self.outbound.len() + usize::from(self.cursor.is_some())
    }

    fn enqueue(
        &mut self,
        sender: &str,
        recipient: &Address,
        body: Body,
        callback_id: Option<CallbackID>,
        is_response: bool,
    ) -> Result<(), Error> {
        let destination = recipient.socket_addr()?;
        let envelope = Envelope {
            sender: sender.to_string(),
            recipient: recipient.name().to_string(),
            body,
            callback_id,
            is_response,
        };
        let datagram = encode(&envelope)?;
        MESSAGES_QUEUED.click();
        self.outbound.push_back((destination, datagram));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn take_outbound(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.outbound.drain(..).collect()
    }
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////// Context /////////////////////////////////////////////

/// An actor's view of the server for the duration of one `handle` call:  the actor's own
/// registered name, the switchboard, and the request context (requester address and callback id)
/// when the message being handled asked for a response.
pub struct Context<'a> {
    name: &'a str,
    switchboard: &'a mut Switchboard,
    request: Option<(Address, CallbackID)>,
}

impl<'a> Context<'a> {
    /// Create a context for the actor registered as `name`.
    pub fn new(name: &'a str, switchboard: &'a mut Switchboard) -> Self {
        Self {
            name,
            switchboard,
            request: None,
        }
    }

    /// Stash the request context of the message about to be handled.
    pub fn with_request(mut self, requester: Address, callback_id: CallbackID) -> Self {
        self.request = Some((requester, callback_id));
        self
    }

    /// The handling actor's registered name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Queue a fire-and-forget message from this actor.
    pub fn send(&mut self, recipient: &Address, body: Body) -> Result<(), Error> {
        self.switchboard.send(self.name, recipient, body)
    }

    /// Queue a request from this actor; see [Switchboard::call].
    pub fn call(
        &mut self,
        recipient: &Address,
        body: Body,
        timeout: Duration,
        callback: Box<dyn Callback>,
    ) -> Result<CallbackID, Error> {
        self.switchboard
            .call(self.name, recipient, body, timeout, callback)
    }

    /// Queue a response to the request being handled, so that the requester's callback fires.
    /// If the message being handled carried no callback id there is nothing to respond to; the
    /// response is dropped.
    pub fn respond(&mut self, body: Body) -> Result<(), Error> {
        let Some((requester, callback_id)) = self.request.clone() else {
            RESPOND_WITHOUT_REQUEST.click();
            clue!(COLLECTOR, INFO, {
                respond_without_request: {
                    actor: self.name.to_string(),
                },
            });
            return Ok(());
        };
        self.switchboard
            .respond(self.name, &requester, callback_id, body)
    }
}

/////////////////////////////////////////// MessageServer //////////////////////////////////////////

/// One UDP endpoint multiplexing every actor on this node.  The server owns the socket, the
/// registry of actors keyed by name, and the switchboard.  The dispatch loop is single-threaded
/// and cooperative:  every step performs exactly one of fire-a-deadline, advance-a-send,
/// start-a-send, or wait-then-read, so all actor state is touched from one thread with no locks.
pub struct MessageServer {
    socket: UdpSocket,
    local_addr: SocketAddr,
    handlers: HashMap<String, Box<dyn Actor>>,
    switchboard: Switchboard,
}

impl MessageServer {
    /// Bind a server to `(host, port)`.  Port 0 binds an ephemeral port; see `local_addr`.
    pub fn new(host: &str, port: u16) -> Result<Self, Error> {
        let socket = UdpSocket::bind((host, port))?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            handlers: HashMap::new(),
            switchboard: Switchboard::new(),
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register `actor` under `name`.  Datagrams naming `name` as recipient dispatch to it.
    pub fn register(&mut self, name: impl Into<String>, actor: Box<dyn Actor>) {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            panic!("cannot register the same actor name twice");
        }
        self.handlers.insert(name, actor);
    }

    /// The switchboard, for enqueuing from outside any actor (e.g. at bootstrap).
    pub fn switchboard(&mut self) -> &mut Switchboard {
        &mut self.switchboard
    }

    /// Perform one dispatch step:  fire one expired deadline, else advance a pending send, else
    /// start the next queued send, else wait for the socket (or the nearest deadline, or `cap`,
    /// whichever is first) and read at most one datagram.
    pub fn step(&mut self, cap: Option<Duration>) -> Result<(), Error> {
        let now = Instant::now();
        // Deadlines take priority.  Entries whose callback already fired are stale; skip them.
        while let Some(&Reverse((deadline, callback_id))) = self.switchboard.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.switchboard.deadlines.pop();
            if let Some(callback) = self.switchboard.callbacks.remove(&callback_id) {
                TIMEOUTS_FIRED.click();
                clue!(COLLECTOR, INFO, {
                    timeout_expired: {
                        callback_id: callback_id.human_readable(),
                    },
                });
                callback.on_timeout();
                return Ok(());
            }
        }
        if let Some(cursor) = self.switchboard.cursor.as_mut() {
            match self
                .socket
                .send_to(&cursor.datagram[cursor.offset..], cursor.destination)
            {
                Ok(sent) => {
                    cursor.offset += sent;
                    if cursor.offset >= cursor.datagram.len() {
                        DATAGRAMS_SENT.click();
                        self.switchboard.cursor = None;
                    } else {
                        PARTIAL_SENDS.click();
                    }
                    return Ok(());
                }
                Err(err) if retriable(&err) => {
                    // The wait below polls for writability.
                }
                Err(err) => {
                    return Err(err.into());
                }
            }
        } else if let Some((destination, datagram)) = self.switchboard.outbound.pop_front() {
            self.switchboard.cursor = Some(WriteCursor {
                destination,
                datagram,
                offset: 0,
            });
            return Ok(());
        }
        self.wait_and_read(now, cap)
    }

    /// Run the dispatch loop until a socket error that is not retriable.
    pub fn serve(&mut self) -> Result<(), Error> {
        loop {
            self.step(None)?;
        }
    }

    fn wait_and_read(&mut self, now: Instant, cap: Option<Duration>) -> Result<(), Error> {
        let mut events = libc::POLLIN;
        if self.switchboard.cursor.is_some() {
            events |= libc::POLLOUT;
        }
        let mut wait = cap;
        if let Some(&Reverse((deadline, _))) = self.switchboard.deadlines.peek() {
            let until = deadline.saturating_duration_since(now);
            wait = Some(match wait {
                Some(cap) => std::cmp::min(cap, until),
                None => until,
            });
        }
        let timeout_ms = match wait {
            Some(wait) => wait.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY(rescrv):  We pass exactly one pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }
        if pfd.revents & libc::POLLIN != 0 {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            match self.socket.recv_from(&mut buf) {
                Ok((amt, src)) => {
                    DATAGRAMS_RECV.click();
                    self.route(src, &buf[..amt]);
                }
                Err(err) if retriable(&err) => {}
                Err(err) => {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn route(&mut self, src: SocketAddr, datagram: &[u8]) {
        let envelope = match decode(datagram) {
            Ok(envelope) => envelope,
            Err(err) => {
                DECODE_ERROR.click();
                clue!(COLLECTOR, WARNING, {
                    decode_error: {
                        from: src.to_string(),
                        what: format!("{}", err),
                    },
                });
                return;
            }
        };
        let Envelope {
            sender,
            recipient,
            body,
            callback_id,
            is_response,
        } = envelope;
        if is_response {
            let Some(callback_id) = callback_id else {
                DECODE_ERROR.click();
                clue!(COLLECTOR, WARNING, {
                    response_without_callback: {
                        from: src.to_string(),
                    },
                });
                return;
            };
            match self.switchboard.callbacks.remove(&callback_id) {
                Some(callback) => {
                    RESPONSES_ROUTED.click();
                    callback.on_response(body);
                }
                None => {
                    // Either the deadline already fired or we never asked.
                    STALE_CALLBACK.click();
                    let err = Error::StaleCallback {
                        core: ErrorCore::default(),
                        callback_id,
                    };
                    clue!(COLLECTOR, INFO, {
                        dropped: format!("{}", err),
                    });
                }
            }
            return;
        }
        let Some(actor) = self.handlers.get_mut(&recipient) else {
            UNKNOWN_RECIPIENT.click();
            let err = Error::UnknownRecipient {
                core: ErrorCore::default(),
                name: recipient,
            };
            clue!(COLLECTOR, WARNING, {
                dropped: format!("{}", err),
            });
            return;
        };
        let sender = Address::new(src.ip().to_string(), src.port(), sender);
        let mut ctx = Context::new(&recipient, &mut self.switchboard);
        if let Some(callback_id) = callback_id {
            ctx = ctx.with_request(sender.clone(), callback_id);
        }
        if let Err(err) = actor.handle(&mut ctx, &sender, body) {
            HANDLER_ERROR.click();
            clue!(COLLECTOR, ERROR, {
                handler_error: {
                    actor: recipient.clone(),
                    what: format!("{}", err),
                },
            });
        }
    }
}

////////////////////////////////////////////// private /////////////////////////////////////////////

fn retriable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

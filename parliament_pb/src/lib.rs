#![doc = include_str!("../README.md")]

use std::net::{SocketAddr, ToSocketAddrs};

use buffertk::{stack_pack, Packable, Unpackable};
use one_two_eight::{generate_id, generate_id_prototk};
use prototk_derive::Message;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The largest datagram the engine will encode or deliver.  Anything larger gets truncated by the
/// kernel on receive and fails to decode.
pub const MAX_MESSAGE_SIZE: usize = 8192;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id! {CallbackID, "callback:"}
generate_id_prototk! {CallbackID}

generate_id! {ClientID, "client:"}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The parliament error type.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(376832, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// A datagram failed to decode, or an envelope failed to encode.
    #[prototk(376833, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: prototk::Error,
        /// Additional context for what was happening.
        #[prototk(3, string)]
        context: String,
    },
    /// An envelope packs to more than [MAX_MESSAGE_SIZE] bytes.
    #[prototk(376834, message)]
    MessageTooLarge {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The size the envelope packs to.
        #[prototk(2, uint64)]
        size: u64,
    },
    /// A datagram names a recipient with no registered actor.
    #[prototk(376835, message)]
    UnknownRecipient {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The recipient named.
        #[prototk(2, string)]
        name: String,
    },
    /// A response arrived for a callback that is no longer live.
    #[prototk(376836, message)]
    StaleCallback {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The callback the response was tagged with.
        #[prototk(2, message)]
        callback_id: CallbackID,
    },
    /// An address would not resolve to a socket address.
    #[prototk(376837, message)]
    ResolveFailure {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// An actor received a message type it has no handler for.
    #[prototk(376838, message)]
    UnexpectedMessage {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// A logic error in the engine.
    #[prototk(376839, message)]
    LogicError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
    },
    /// An OS/IO error.
    #[prototk(376840, message)]
    IoError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
}

impl Default for Error {
    fn default() -> Error {
        Error::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(what: std::io::Error) -> Error {
        Error::IoError {
            core: ErrorCore::default(),
            what: what.to_string(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            what,
            context: "prototk unpack error".to_string(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(what: buffertk::Error) -> Error {
        Error::SerializationError {
            core: ErrorCore::default(),
            what: what.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

iotoz! {Error}

////////////////////////////////////////////// Address /////////////////////////////////////////////

/// An Address names one actor: the `(host, port)` endpoint its message server is bound to, plus
/// the actor's local name on that server.  Addresses are totally ordered so that every node that
/// was configured with the same address list sorts it identically.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address {
    host: String,
    port: u16,
    name: String,
}

impl Address {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
        }
    }

    /// The host this address lives on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port this address' message server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The actor's name on its message server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection string for this address' endpoint.
    pub fn connect(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The address of a sibling actor on the same endpoint.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            name: name.into(),
        }
    }

    /// Resolve this address' endpoint to a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::ResolveFailure {
                core: ErrorCore::default(),
                what: format!("{} resolved to no addresses", self.connect()),
            })
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}:{}/{}", self.host, self.port, self.name)
    }
}

/// Parse a `"host:port"` connection string.  The host may be a hostname, an IPv4 literal, or a
/// bracketed IPv6 literal.
pub fn parse_endpoint(s: &str) -> Result<(String, u16), Error> {
    let (host, port) = s.rsplit_once(':').ok_or_else(|| Error::ResolveFailure {
        core: ErrorCore::default(),
        what: format!("{:?} is not in host:port form", s),
    })?;
    let port = port.parse::<u16>().map_err(|err| Error::ResolveFailure {
        core: ErrorCore::default(),
        what: format!("{:?} has a bad port: {}", s, err),
    })?;
    let host = if host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else {
        host
    };
    Ok((host.to_string(), port))
}

////////////////////////////////////////////// PValue //////////////////////////////////////////////

/// An accepted (ballot, value) pair.  An accepter reports its PValue for an instance in every
/// promise so that a proposer picks up the highest-balloted value already in flight.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct PValue {
    /// The ballot under which the value was accepted.
    #[prototk(1, uint64)]
    pub ballot_id: u64,
    /// The value accepted.
    #[prototk(2, string)]
    pub value: String,
}

/////////////////////////////////////////////// Body ///////////////////////////////////////////////

/// The body of one message between actors.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum Body {
    /// The empty acknowledgement a leader returns for a propose.
    #[prototk(1, message)]
    #[default]
    Ack,
    /// A client (or a forwarding proposer) submits a value.
    #[prototk(2, message)]
    Propose {
        /// The value to decide.
        #[prototk(1, string)]
        value: String,
    },
    /// Phase one: a proposer rallies support for a ballot on an instance.
    #[prototk(3, message)]
    Prepare {
        /// The instance being prepared.
        #[prototk(1, uint64)]
        instance_id: u64,
        /// The ballot being rallied.
        #[prototk(2, uint64)]
        ballot_id: u64,
    },
    /// An accepter promises an instance at a ballot.
    #[prototk(4, message)]
    Promise {
        /// The instance promised.
        #[prototk(1, uint64)]
        instance_id: u64,
        /// The ballot promised.
        #[prototk(2, uint64)]
        ballot_id: u64,
        /// The accepter's previously-accepted pair for the instance, if any.
        #[prototk(3, message)]
        accepted: Option<PValue>,
        /// The largest instance the accepter has seen a well-balloted prepare for.
        #[prototk(4, uint64)]
        highest_instance_id: u64,
    },
    /// Phase two: a proposer asks the accepters to accept a value.
    #[prototk(5, message)]
    Accept {
        /// The instance being decided.
        #[prototk(1, uint64)]
        instance_id: u64,
        /// The ballot the value rides.
        #[prototk(2, uint64)]
        ballot_id: u64,
        /// The value to accept.
        #[prototk(3, string)]
        value: String,
    },
    /// An accepter announces an accepted value to the learners and the proposer.
    #[prototk(6, message)]
    Accepted {
        /// The instance decided on this accepter.
        #[prototk(1, uint64)]
        instance_id: u64,
        /// The ballot the value rode.
        #[prototk(2, uint64)]
        ballot_id: u64,
        /// The value accepted.
        #[prototk(3, string)]
        value: String,
    },
    /// An accepter rejects a prepare whose ballot is below its promise.
    #[prototk(7, message)]
    NackPrepare {
        /// The instance whose prepare was rejected.
        #[prototk(1, uint64)]
        failed_instance_id: u64,
        /// The largest instance the accepter has seen a well-balloted prepare for.
        #[prototk(2, uint64)]
        highest_instance_id: u64,
    },
}

impl Body {
    /// The name of this message type, for logs.
    pub fn message_type(&self) -> &'static str {
        match self {
            Body::Ack => "ack",
            Body::Propose { .. } => "propose",
            Body::Prepare { .. } => "prepare",
            Body::Promise { .. } => "promise",
            Body::Accept { .. } => "accept",
            Body::Accepted { .. } => "accepted",
            Body::NackPrepare { .. } => "nack_prepare",
        }
    }
}

///////////////////////////////////////////// Envelope /////////////////////////////////////////////

/// One datagram's worth of message.  The sender and recipient are actor names local to each
/// endpoint; the endpoints themselves ride the datagram's source and destination.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Envelope {
    /// The sending actor's name on its own endpoint.
    #[prototk(1, string)]
    pub sender: String,
    /// The receiving actor's name on the destination endpoint.
    #[prototk(2, string)]
    pub recipient: String,
    /// The message body.
    #[prototk(3, message)]
    pub body: Body,
    /// Set when the sender expects a response, or when this envelope is one.
    #[prototk(4, message)]
    pub callback_id: Option<CallbackID>,
    /// When set, the recipient routes by callback rather than by actor name.
    #[prototk(5, Bool)]
    pub is_response: bool,
}

////////////////////////////////////////////// Codec ///////////////////////////////////////////////

/// Encode an envelope into a datagram payload.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
    let size = envelope.pack_sz();
    if size > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            core: ErrorCore::default(),
            size: size as u64,
        });
    }
    Ok(stack_pack(envelope).to_vec())
}

/// Decode a datagram payload into an envelope.  The payload must be exactly one envelope;
/// trailing bytes fail the decode.
pub fn decode(buf: &[u8]) -> Result<Envelope, Error> {
    let (envelope, rem) = <Envelope as Unpackable>::unpack(buf)?;
    if !rem.is_empty() {
        return Err(Error::SerializationError {
            core: ErrorCore::default(),
            what: prototk::Error::WrongLength {
                required: buf.len() - rem.len(),
                had: buf.len(),
            },
            context: "trailing bytes after envelope".to_string(),
        });
    }
    Ok(envelope)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let buf = encode(&envelope).unwrap();
        assert!(buf.len() <= MAX_MESSAGE_SIZE);
        let got = decode(&buf).unwrap();
        assert_eq!(envelope, got);
    }

    #[test]
    fn ack() {
        roundtrip(Envelope {
            sender: "proposer".to_string(),
            recipient: "client:aabbccdd-eeff-0011-2233-445566778899".to_string(),
            body: Body::Ack,
            callback_id: CallbackID::generate(),
            is_response: true,
        });
    }

    #[test]
    fn propose() {
        roundtrip(Envelope {
            sender: "client:aabbccdd-eeff-0011-2233-445566778899".to_string(),
            recipient: "proposer".to_string(),
            body: Body::Propose {
                value: "x".to_string(),
            },
            callback_id: CallbackID::generate(),
            is_response: false,
        });
    }

    #[test]
    fn prepare() {
        roundtrip(Envelope {
            sender: "proposer".to_string(),
            recipient: "accepter".to_string(),
            body: Body::Prepare {
                instance_id: 1,
                ballot_id: 3,
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn promise_without_accepted() {
        roundtrip(Envelope {
            sender: "accepter".to_string(),
            recipient: "proposer".to_string(),
            body: Body::Promise {
                instance_id: 1,
                ballot_id: 3,
                accepted: None,
                highest_instance_id: 7,
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn promise_with_accepted() {
        roundtrip(Envelope {
            sender: "accepter".to_string(),
            recipient: "proposer".to_string(),
            body: Body::Promise {
                instance_id: 1,
                ballot_id: 3,
                accepted: Some(PValue {
                    ballot_id: 2,
                    value: "y".to_string(),
                }),
                highest_instance_id: 7,
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn accept() {
        roundtrip(Envelope {
            sender: "proposer".to_string(),
            recipient: "accepter".to_string(),
            body: Body::Accept {
                instance_id: 1,
                ballot_id: 3,
                value: "x".to_string(),
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn accepted() {
        roundtrip(Envelope {
            sender: "accepter".to_string(),
            recipient: "learner".to_string(),
            body: Body::Accepted {
                instance_id: 1,
                ballot_id: 3,
                value: "x".to_string(),
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn nack_prepare() {
        roundtrip(Envelope {
            sender: "accepter".to_string(),
            recipient: "proposer".to_string(),
            body: Body::NackPrepare {
                failed_instance_id: 1,
                highest_instance_id: 7,
            },
            callback_id: None,
            is_response: false,
        });
    }

    #[test]
    fn trailing_bytes_fail_decode() {
        let mut buf = encode(&Envelope::default()).unwrap();
        buf.push(0u8);
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn garbage_fails_decode() {
        let buf = [0xffu8; 64];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn oversize_fails_encode() {
        let envelope = Envelope {
            sender: "client".to_string(),
            recipient: "proposer".to_string(),
            body: Body::Propose {
                value: "x".repeat(MAX_MESSAGE_SIZE),
            },
            callback_id: None,
            is_response: false,
        };
        match encode(&envelope) {
            Err(Error::MessageTooLarge { size, .. }) => {
                assert!(size as usize > MAX_MESSAGE_SIZE);
            }
            _ => panic!("oversize envelope encoded"),
        }
    }

    #[test]
    fn addresses_order_lexicographically() {
        let a = Address::new("127.0.0.1", 9001, "proposer");
        let b = Address::new("127.0.0.1", 9002, "proposer");
        let c = Address::new("127.0.0.2", 9001, "proposer");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            ("127.0.0.1".to_string(), 9001),
            parse_endpoint("127.0.0.1:9001").unwrap()
        );
        assert_eq!(
            ("::1".to_string(), 9001),
            parse_endpoint("[::1]:9001").unwrap()
        );
        assert!(parse_endpoint("127.0.0.1").is_err());
        assert!(parse_endpoint("127.0.0.1:alpha").is_err());
    }

    mod errors {
        use super::*;

        fn do_test(s: &str, exp: Error) {
            assert_eq!(s, exp.to_string());
            let buf = stack_pack(&exp).to_vec();
            let got = <Error as Unpackable>::unpack(&buf).unwrap().0;
            assert_eq!(exp, got);
        }

        #[test]
        fn success() {
            do_test(
                "Success",
                Error::Success {
                    core: ErrorCore::default(),
                },
            );
        }

        #[test]
        fn message_too_large() {
            do_test(
                "MessageTooLarge { size: 16384 }",
                Error::MessageTooLarge {
                    core: ErrorCore::default(),
                    size: 16384,
                },
            );
        }

        #[test]
        fn unknown_recipient() {
            do_test(
                "UnknownRecipient { name: \"president\" }",
                Error::UnknownRecipient {
                    core: ErrorCore::default(),
                    name: "president".to_string(),
                },
            );
        }

        #[test]
        fn unexpected_message() {
            do_test(
                "UnexpectedMessage { what: \"prepare sent to a learner\" }",
                Error::UnexpectedMessage {
                    core: ErrorCore::default(),
                    what: "prepare sent to a learner".to_string(),
                },
            );
        }

        #[test]
        fn io_error() {
            do_test(
                "IoError { what: \"some I/O error\" }",
                Error::IoError {
                    core: ErrorCore::default(),
                    what: "some I/O error".to_string(),
                },
            );
        }
    }
}

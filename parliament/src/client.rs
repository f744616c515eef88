//! A minimal blocking client for submitting values to a proposer.  The client sends one propose
//! datagram and waits for the acknowledgement that matches its callback id.  There is no
//! retransmission here; a caller that times out retries at its own pace.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use zerror_core::ErrorCore;

use parliament_pb::{
    decode, encode, parse_endpoint, Address, Body, CallbackID, ClientID, Envelope, Error,
    MAX_MESSAGE_SIZE,
};

use crate::PROPOSER;

/////////////////////////////////////////// ClientOptions //////////////////////////////////////////

/// Propose client options.
#[derive(Clone, Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
pub struct ClientOptions {
    /// The proposer endpoint to submit values to.
    #[arrrg(optional, "Proposer endpoint in host:port form.", "HOST:PORT")]
    pub connect: String,
    /// How long to wait for an acknowledgement.
    #[arrrg(optional, "Milliseconds to wait for an acknowledgement.")]
    pub timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:9898".to_string(),
            timeout_ms: 1000,
        }
    }
}

/////////////////////////////////////////// ProposeClient //////////////////////////////////////////

/// A blocking propose client.  Each client names itself with a fresh [ClientID] so that response
/// routing on the wire never collides between clients sharing a host.
pub struct ProposeClient {
    socket: UdpSocket,
    name: String,
    destination: SocketAddr,
}

impl ProposeClient {
    /// Create a client from the options.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        let (host, port) = parse_endpoint(&options.connect)?;
        let destination = Address::new(host, port, PROPOSER).socket_addr()?;
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(Duration::from_millis(options.timeout_ms)))?;
        let name = ClientID::generate()
            .ok_or_else(|| Error::LogicError {
                core: ErrorCore::default(),
                what: "urandom failed generating a client id".to_string(),
            })?
            .human_readable();
        Ok(Self {
            socket,
            name,
            destination,
        })
    }

    /// Submit `value` and wait for the proposer's acknowledgement.  An acknowledgement says the
    /// engine took the value, not that it was decided; learners announce decisions.
    pub fn propose(&self, value: &str) -> Result<(), Error> {
        let callback_id = CallbackID::generate().ok_or_else(|| Error::LogicError {
            core: ErrorCore::default(),
            what: "urandom failed generating a callback id".to_string(),
        })?;
        let envelope = Envelope {
            sender: self.name.clone(),
            recipient: PROPOSER.to_string(),
            body: Body::Propose {
                value: value.to_string(),
            },
            callback_id: Some(callback_id),
            is_response: false,
        };
        self.socket
            .send_to(&encode(&envelope)?, self.destination)?;
        loop {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            let (amt, _) = self.socket.recv_from(&mut buf)?;
            let Ok(response) = decode(&buf[..amt]) else {
                continue;
            };
            if response.is_response && response.callback_id == Some(callback_id) {
                return Ok(());
            }
            // Someone else's datagram; keep reading until the socket times out.
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

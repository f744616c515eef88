#![doc = include_str!("../README.md")]

use biometrics::Collector;

mod accepter;
mod learner;
mod proposer;
mod server;

pub mod client;

pub use accepter::Accepter;
pub use learner::Learner;
pub use proposer::{Proposer, FORWARD_TIMEOUT};
pub use server::{Actor, Callback, Context, MessageServer, Switchboard};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The conventional name of the proposer on every node.
pub const PROPOSER: &str = "proposer";
/// The conventional name of the accepter on every node.
pub const ACCEPTER: &str = "accepter";
/// The conventional name of the learner on every node.
pub const LEARNER: &str = "learner";

////////////////////////////////////////////// majority ////////////////////////////////////////////

/// The quorum size for an ensemble of `n` accepters.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    accepter::register_biometrics(collector);
    learner::register_biometrics(collector);
    proposer::register_biometrics(collector);
    server::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// tests //////////////////////////////////////////////

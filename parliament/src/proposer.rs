use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use biometrics::{Collector, Counter};
use indicio::{clue, ERROR, INFO, WARNING};
use zerror_core::ErrorCore;

use parliament_pb::{Address, Body, Error, PValue};

use crate::server::{Actor, Callback, Context};
use crate::{majority, COLLECTOR};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// How long a non-leader proposer waits for the leader to acknowledge a forwarded propose.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(1);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROPOSALS_LED: Counter = Counter::new("parliament.proposer.proposals_led");
static PROPOSALS_FORWARDED: Counter = Counter::new("parliament.proposer.proposals_forwarded");
static PROPOSALS_NO_ACCEPTERS: Counter = Counter::new("parliament.proposer.no_accepters");
static PREPARES_SENT: Counter = Counter::new("parliament.proposer.prepares_sent");
static PROMISES_RECV: Counter = Counter::new("parliament.proposer.promises_recv");
static QUORUMS_REACHED: Counter = Counter::new("parliament.proposer.quorums_reached");
static NACKS_RECV: Counter = Counter::new("parliament.proposer.nacks_recv");
static FORWARDS_ACKED: Counter = Counter::new("parliament.proposer.forwards_acked");
static FORWARDS_TIMED_OUT: Counter = Counter::new("parliament.proposer.forwards_timed_out");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROPOSALS_LED);
    collector.register_counter(&PROPOSALS_FORWARDED);
    collector.register_counter(&PROPOSALS_NO_ACCEPTERS);
    collector.register_counter(&PREPARES_SENT);
    collector.register_counter(&PROMISES_RECV);
    collector.register_counter(&QUORUMS_REACHED);
    collector.register_counter(&NACKS_RECV);
    collector.register_counter(&FORWARDS_ACKED);
    collector.register_counter(&FORWARDS_TIMED_OUT);
}

///////////////////////////////////////// ForwardedPropose /////////////////////////////////////////

struct ForwardedPropose {
    value: String,
}

impl Callback for ForwardedPropose {
    fn on_response(self: Box<Self>, _: Body) {
        FORWARDS_ACKED.click();
        clue!(COLLECTOR, INFO, {
            forward_acked: {
                value: self.value,
            },
        });
    }

    fn on_timeout(self: Box<Self>) {
        FORWARDS_TIMED_OUT.click();
        clue!(COLLECTOR, WARNING, {
            forward_timed_out: {
                value: self.value,
            },
        });
    }
}

///////////////////////////////////////////// Instance /////////////////////////////////////////////

struct Instance {
    ballot_id: u64,
    value: String,
    quorum: BTreeSet<Address>,
    highest_accepted: Option<PValue>,
    quorum_reached: bool,
}

///////////////////////////////////////////// Proposer /////////////////////////////////////////////

/// The proposer drives the synod protocol.  Ballots are partitioned across proposers by sorting
/// the (shared, identical) proposer address list:  a proposer's index in that sort seeds its
/// ballot, and every bump adds the number of proposers, so ballots from distinct proposers never
/// collide.  The proposer at index zero is the leader; the others forward client proposes to it.
pub struct Proposer {
    proposers: Vec<Address>,
    accepters: Vec<Address>,
    index: u64,
    ballot_id: u64,
    current_instance_id: u64,
    instances: HashMap<u64, Instance>,
}

impl Proposer {
    /// Create a proposer.  `me` must appear in `proposers`; every node must pass the same
    /// `proposers` list so the ballot partition is agreed upon.
    pub fn new(
        me: &Address,
        mut proposers: Vec<Address>,
        accepters: Vec<Address>,
    ) -> Result<Self, Error> {
        proposers.sort();
        proposers.dedup();
        let index = proposers
            .iter()
            .position(|p| p == me)
            .ok_or_else(|| Error::LogicError {
                core: ErrorCore::default(),
                what: format!("{} does not appear in the proposer list", me),
            })? as u64;
        Ok(Self {
            proposers,
            accepters,
            index,
            ballot_id: index,
            current_instance_id: 0,
            instances: HashMap::new(),
        })
    }

    /// Whether this proposer is the leader of the ensemble.
    pub fn is_leader(&self) -> bool {
        self.index == 0
    }

    fn receive_propose(&mut self, ctx: &mut Context<'_>, value: String) -> Result<(), Error> {
        if self.accepters.is_empty() {
            PROPOSALS_NO_ACCEPTERS.click();
            clue!(COLLECTOR, ERROR, {
                propose_without_accepters: {
                    value: value,
                },
            });
            return Ok(());
        }
        if self.is_leader() {
            PROPOSALS_LED.click();
            self.current_instance_id += 1;
            let instance_id = self.current_instance_id;
            self.send_prepare(ctx, instance_id, value)?;
            ctx.respond(Body::Ack)
        } else {
            PROPOSALS_FORWARDED.click();
            let leader = self.proposers[0].clone();
            ctx.call(
                &leader,
                Body::Propose {
                    value: value.clone(),
                },
                FORWARD_TIMEOUT,
                Box::new(ForwardedPropose { value }),
            )?;
            Ok(())
        }
    }

    fn send_prepare(
        &mut self,
        ctx: &mut Context<'_>,
        instance_id: u64,
        value: String,
    ) -> Result<(), Error> {
        let ballot_id = self.ballot_id;
        self.instances.insert(
            instance_id,
            Instance {
                ballot_id,
                value,
                quorum: BTreeSet::new(),
                highest_accepted: None,
                quorum_reached: false,
            },
        );
        for accepter in &self.accepters {
            PREPARES_SENT.click();
            ctx.send(
                accepter,
                Body::Prepare {
                    instance_id,
                    ballot_id,
                },
            )?;
        }
        Ok(())
    }

    fn receive_promise(
        &mut self,
        ctx: &mut Context<'_>,
        promiser: &Address,
        instance_id: u64,
        accepted: Option<PValue>,
        highest_instance_id: u64,
    ) -> Result<(), Error> {
        PROMISES_RECV.click();
        if highest_instance_id > self.current_instance_id {
            self.current_instance_id = highest_instance_id;
        }
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            // A promise for an instance we never prepared.
            return Ok(());
        };
        if let Some(pair) = accepted {
            let adopt = match &instance.highest_accepted {
                Some(prev) => pair.ballot_id > prev.ballot_id,
                None => true,
            };
            if adopt {
                instance.highest_accepted = Some(pair);
            }
        }
        instance.quorum.insert(promiser.clone());
        if instance.quorum.len() >= majority(self.accepters.len()) && !instance.quorum_reached {
            instance.quorum_reached = true;
            QUORUMS_REACHED.click();
            let chosen = instance.highest_accepted.clone().unwrap_or_else(|| PValue {
                ballot_id: instance.ballot_id,
                value: instance.value.clone(),
            });
            clue!(COLLECTOR, INFO, {
                quorum_reached: {
                    instance_id: instance_id,
                    ballot_id: chosen.ballot_id,
                    value: chosen.value.clone(),
                },
            });
            for accepter in &self.accepters {
                ctx.send(
                    accepter,
                    Body::Accept {
                        instance_id,
                        ballot_id: chosen.ballot_id,
                        value: chosen.value.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn receive_nack_prepare(
        &mut self,
        ctx: &mut Context<'_>,
        failed_instance_id: u64,
        highest_instance_id: u64,
    ) -> Result<(), Error> {
        NACKS_RECV.click();
        if highest_instance_id > self.current_instance_id {
            self.current_instance_id = highest_instance_id;
        }
        let Some(instance) = self.instances.get(&failed_instance_id) else {
            return Ok(());
        };
        let value = instance.value.clone();
        self.ballot_id += self.proposers.len() as u64;
        clue!(COLLECTOR, INFO, {
            prepare_nacked: {
                failed_instance_id: failed_instance_id,
                next_ballot_id: self.ballot_id,
            },
        });
        self.receive_propose(ctx, value)
    }
}

impl Actor for Proposer {
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        sender: &Address,
        body: Body,
    ) -> Result<(), Error> {
        match body {
            Body::Propose { value } => self.receive_propose(ctx, value),
            Body::Promise {
                instance_id,
                ballot_id: _,
                accepted,
                highest_instance_id,
            } => self.receive_promise(ctx, sender, instance_id, accepted, highest_instance_id),
            Body::NackPrepare {
                failed_instance_id,
                highest_instance_id,
            } => self.receive_nack_prepare(ctx, failed_instance_id, highest_instance_id),
            // Learners count these; the proposer has nothing to do.
            Body::Accepted { .. } => Ok(()),
            _ => Err(Error::UnexpectedMessage {
                core: ErrorCore::default(),
                what: format!("{} sent to a proposer", body.message_type()),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use parliament_pb::{decode, CallbackID, Envelope};

    use crate::server::Switchboard;
    use crate::{ACCEPTER, PROPOSER};

    use super::*;

    fn proposer_addr(port: u16) -> Address {
        Address::new("127.0.0.1", port, PROPOSER)
    }

    fn accepter_addr(port: u16) -> Address {
        Address::new("127.0.0.1", port, ACCEPTER)
    }

    fn proposers() -> Vec<Address> {
        vec![proposer_addr(9001), proposer_addr(9002), proposer_addr(9003)]
    }

    fn accepters() -> Vec<Address> {
        vec![accepter_addr(9001), accepter_addr(9002), accepter_addr(9003)]
    }

    fn sent(switchboard: &mut Switchboard) -> Vec<(SocketAddr, Envelope)> {
        switchboard
            .take_outbound()
            .into_iter()
            .map(|(destination, datagram)| (destination, decode(&datagram).expect("decode")))
            .collect()
    }

    fn promise(instance_id: u64, ballot_id: u64, highest_instance_id: u64) -> Body {
        Body::Promise {
            instance_id,
            ballot_id,
            accepted: None,
            highest_instance_id,
        }
    }

    #[test]
    fn ballot_seeds_partition_by_sort_order() {
        for (port, index) in [(9001, 0u64), (9002, 1u64), (9003, 2u64)] {
            let proposer =
                Proposer::new(&proposer_addr(port), proposers(), accepters()).expect("new");
            assert_eq!(index == 0, proposer.is_leader());
            assert_eq!(index, proposer.ballot_id);
        }
    }

    #[test]
    fn unknown_proposer_is_rejected() {
        assert!(Proposer::new(&proposer_addr(9004), proposers(), accepters()).is_err());
    }

    #[test]
    fn leader_propose_prepares_every_accepter_and_acks() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let client = Address::new("127.0.0.1", 4000, "client:test");
        let callback_id = CallbackID::generate().expect("generate id");
        let mut ctx = Context::new(PROPOSER, &mut switchboard).with_request(client, callback_id);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "x".to_string(),
                },
            )
            .expect("handle");
        let sent = sent(&mut switchboard);
        assert_eq!(4, sent.len());
        for (i, (_, envelope)) in sent.iter().take(3).enumerate() {
            assert_eq!(
                Body::Prepare {
                    instance_id: 1,
                    ballot_id: 0,
                },
                envelope.body,
                "prepare {}",
                i
            );
            assert_eq!(ACCEPTER, envelope.recipient);
        }
        let (_, ack) = &sent[3];
        assert!(ack.is_response);
        assert_eq!(Some(callback_id), ack.callback_id);
        assert_eq!(Body::Ack, ack.body);
    }

    #[test]
    fn non_leader_forwards_to_the_leader() {
        let mut proposer =
            Proposer::new(&proposer_addr(9003), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "v".to_string(),
                },
            )
            .expect("handle");
        let sent = sent(&mut switchboard);
        assert_eq!(1, sent.len());
        let (destination, envelope) = &sent[0];
        assert_eq!(9001, destination.port());
        assert_eq!(PROPOSER, envelope.recipient);
        assert_eq!(
            Body::Propose {
                value: "v".to_string(),
            },
            envelope.body
        );
        assert!(envelope.callback_id.is_some());
        assert!(!envelope.is_response);
        assert_eq!(1, switchboard.live_callbacks());
    }

    #[test]
    fn quorum_broadcasts_accept_exactly_once() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "x".to_string(),
                },
            )
            .expect("handle");
        switchboard.take_outbound();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(&mut ctx, &accepter_addr(9001), promise(1, 0, 1))
            .expect("first promise");
        assert!(sent(&mut switchboard).is_empty());
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(&mut ctx, &accepter_addr(9002), promise(1, 0, 1))
            .expect("second promise");
        let accepts = sent(&mut switchboard);
        assert_eq!(3, accepts.len());
        for (_, envelope) in &accepts {
            assert_eq!(
                Body::Accept {
                    instance_id: 1,
                    ballot_id: 0,
                    value: "x".to_string(),
                },
                envelope.body
            );
        }
        // A third promise after quorum must not re-broadcast.
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(&mut ctx, &accepter_addr(9003), promise(1, 0, 1))
            .expect("third promise");
        assert!(sent(&mut switchboard).is_empty());
    }

    #[test]
    fn duplicate_promises_are_idempotent() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "x".to_string(),
                },
            )
            .expect("handle");
        switchboard.take_outbound();
        for _ in 0..3 {
            let mut ctx = Context::new(PROPOSER, &mut switchboard);
            proposer
                .handle(&mut ctx, &accepter_addr(9001), promise(1, 0, 1))
                .expect("promise");
        }
        // One accepter promising three times is not a quorum of three accepters.
        assert!(sent(&mut switchboard).is_empty());
    }

    #[test]
    fn promises_adopt_the_highest_accepted_pair() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "mine".to_string(),
                },
            )
            .expect("handle");
        switchboard.take_outbound();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &accepter_addr(9001),
                Body::Promise {
                    instance_id: 1,
                    ballot_id: 0,
                    accepted: Some(PValue {
                        ballot_id: 2,
                        value: "stale".to_string(),
                    }),
                    highest_instance_id: 1,
                },
            )
            .expect("first promise");
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &accepter_addr(9002),
                Body::Promise {
                    instance_id: 1,
                    ballot_id: 0,
                    accepted: Some(PValue {
                        ballot_id: 7,
                        value: "winner".to_string(),
                    }),
                    highest_instance_id: 1,
                },
            )
            .expect("second promise");
        let accepts = sent(&mut switchboard);
        assert_eq!(3, accepts.len());
        for (_, envelope) in &accepts {
            assert_eq!(
                Body::Accept {
                    instance_id: 1,
                    ballot_id: 7,
                    value: "winner".to_string(),
                },
                envelope.body
            );
        }
    }

    #[test]
    fn promises_for_unprepared_instances_are_noops() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(&mut ctx, &accepter_addr(9001), promise(42, 0, 41))
            .expect("promise");
        assert!(sent(&mut switchboard).is_empty());
        // The instance-id catch-up still applies.
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "x".to_string(),
                },
            )
            .expect("propose");
        let sent = sent(&mut switchboard);
        assert_eq!(
            Body::Prepare {
                instance_id: 42,
                ballot_id: 0,
            },
            sent[0].1.body
        );
    }

    #[test]
    fn nack_bumps_the_ballot_and_reproposes() {
        let mut proposer = Proposer::new(
            &proposer_addr(9001),
            proposers(),
            vec![accepter_addr(9001)],
        )
        .expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &Address::new("127.0.0.1", 4000, "client:test"),
                Body::Propose {
                    value: "x".to_string(),
                },
            )
            .expect("propose");
        switchboard.take_outbound();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &accepter_addr(9001),
                Body::NackPrepare {
                    failed_instance_id: 1,
                    highest_instance_id: 5,
                },
            )
            .expect("nack");
        let sent = sent(&mut switchboard);
        assert_eq!(1, sent.len());
        // A fresh instance past the catch-up point, at the next ballot in this proposer's class.
        assert_eq!(
            Body::Prepare {
                instance_id: 6,
                ballot_id: 3,
            },
            sent[0].1.body
        );
    }

    #[test]
    fn nacks_for_unprepared_instances_are_noops() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &accepter_addr(9001),
                Body::NackPrepare {
                    failed_instance_id: 9,
                    highest_instance_id: 9,
                },
            )
            .expect("nack");
        assert!(sent(&mut switchboard).is_empty());
    }

    #[test]
    fn accepted_is_ignored_by_the_proposer() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        proposer
            .handle(
                &mut ctx,
                &accepter_addr(9001),
                Body::Accepted {
                    instance_id: 1,
                    ballot_id: 0,
                    value: "x".to_string(),
                },
            )
            .expect("accepted");
        assert!(sent(&mut switchboard).is_empty());
    }

    #[test]
    fn prepare_sent_to_a_proposer_is_unexpected() {
        let mut proposer =
            Proposer::new(&proposer_addr(9001), proposers(), accepters()).expect("new");
        let mut switchboard = Switchboard::new();
        let mut ctx = Context::new(PROPOSER, &mut switchboard);
        assert!(proposer
            .handle(
                &mut ctx,
                &accepter_addr(9001),
                Body::Prepare {
                    instance_id: 1,
                    ballot_id: 0,
                },
            )
            .is_err());
    }
}

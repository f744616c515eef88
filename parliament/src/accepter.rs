use std::collections::HashMap;

use biometrics::{Collector, Counter};
use zerror_core::ErrorCore;

use parliament_pb::{Address, Body, Error, PValue};

use crate::server::{Actor, Context};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROMISES_SENT: Counter = Counter::new("parliament.accepter.promises_sent");
static NACKS_SENT: Counter = Counter::new("parliament.accepter.nacks_sent");
static ACCEPTS_TAKEN: Counter = Counter::new("parliament.accepter.accepts_taken");
static ACCEPTS_DROPPED: Counter = Counter::new("parliament.accepter.accepts_dropped");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROMISES_SENT);
    collector.register_counter(&NACKS_SENT);
    collector.register_counter(&ACCEPTS_TAKEN);
    collector.register_counter(&ACCEPTS_DROPPED);
}

///////////////////////////////////////////// Instance /////////////////////////////////////////////

#[derive(Default)]
struct Instance {
    highest_ballot_id: u64,
    accepted: Option<PValue>,
}

///////////////////////////////////////////// Accepter /////////////////////////////////////////////

/// The accepter is the mutable memory of the ensemble.  Per instance it tracks the highest ballot
/// it has promised or accepted, and the most recent value accepted; the ballot never decreases.
/// It also tracks the highest instance id it has seen a well-balloted prepare for, which rides
/// every promise and nack so that proposers allocate past it.
pub struct Accepter {
    learners: Vec<Address>,
    highest_instance_id: u64,
    instances: HashMap<u64, Instance>,
}

impl Accepter {
    /// Create an accepter that announces accepted values to `learners`.
    pub fn new(learners: Vec<Address>) -> Self {
        Self {
            learners,
            highest_instance_id: 0,
            instances: HashMap::new(),
        }
    }

    fn receive_prepare(
        &mut self,
        ctx: &mut Context<'_>,
        proposer: &Address,
        instance_id: u64,
        ballot_id: u64,
    ) -> Result<(), Error> {
        let instance = self.instances.entry(instance_id).or_default();
        if ballot_id >= instance.highest_ballot_id {
            PROMISES_SENT.click();
            if instance_id > self.highest_instance_id {
                self.highest_instance_id = instance_id;
            }
            instance.highest_ballot_id = ballot_id;
            let accepted = instance.accepted.clone();
            ctx.send(
                proposer,
                Body::Promise {
                    instance_id,
                    ballot_id,
                    accepted,
                    highest_instance_id: self.highest_instance_id,
                },
            )
        } else {
            NACKS_SENT.click();
            ctx.send(
                proposer,
                Body::NackPrepare {
                    failed_instance_id: instance_id,
                    highest_instance_id: self.highest_instance_id,
                },
            )
        }
    }

    fn receive_accept(
        &mut self,
        ctx: &mut Context<'_>,
        proposer: &Address,
        instance_id: u64,
        ballot_id: u64,
        value: String,
    ) -> Result<(), Error> {
        let instance = self.instances.entry(instance_id).or_default();
        // `>=`, not `>`:  a proposer that rallied ballot b must be able to use b.
        if ballot_id < instance.highest_ballot_id {
            ACCEPTS_DROPPED.click();
            return Ok(());
        }
        ACCEPTS_TAKEN.click();
        instance.highest_ballot_id = ballot_id;
        instance.accepted = Some(PValue {
            ballot_id,
            value: value.clone(),
        });
        for learner in &self.learners {
            ctx.send(
                learner,
                Body::Accepted {
                    instance_id,
                    ballot_id,
                    value: value.clone(),
                },
            )?;
        }
        ctx.send(
            proposer,
            Body::Accepted {
                instance_id,
                ballot_id,
                value,
            },
        )
    }
}

impl Actor for Accepter {
    fn handle(
        &mut self,
        ctx: &mut Context<'_>,
        sender: &Address,
        body: Body,
    ) -> Result<(), Error> {
        match body {
            Body::Prepare {
                instance_id,
                ballot_id,
            } => self.receive_prepare(ctx, sender, instance_id, ballot_id),
            Body::Accept {
                instance_id,
                ballot_id,
                value,
            } => self.receive_accept(ctx, sender, instance_id, ballot_id, value),
            _ => Err(Error::UnexpectedMessage {
                core: ErrorCore::default(),
                what: format!("{} sent to an accepter", body.message_type()),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

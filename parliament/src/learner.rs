use std::collections::HashMap;

use biometrics::{Collector, Counter};
use indicio::{clue, INFO};
use zerror_core::ErrorCore;

use parliament_pb::{Address, Body, Error};

use crate::server::{Actor, Context};
use crate::{majority, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ACCEPTED_RECV: Counter = Counter::new("parliament.learner.accepted_recv");
static VALUES_SWITCHED: Counter = Counter::new("parliament.learner.values_switched");
static LEARNS: Counter = Counter::new("parliament.learner.learns");

pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&ACCEPTED_RECV);
    collector.register_counter(&VALUES_SWITCHED);
    collector.register_counter(&LEARNS);
}

///////////////////////////////////////////// Instance /////////////////////////////////////////////

#[derive(Default)]
struct Instance {
    accepters: HashMap<Address, String>,
    values: HashMap<String, u64>,
    learned: bool,
}

////////////////////////////////////////////// Learner /////////////////////////////////////////////

/// The learner watches the accepters.  An accepter may change its accepted value across ballots,
/// so the learner counts the last value each accepter reported, not reports; when any value
/// reaches a majority of the accepter set, the instance is learned and the hook fires, once.
pub struct Learner {
    accepters: Vec<Address>,
    on_learn: Box<dyn FnMut(u64, &str)>,
    instances: HashMap<u64, Instance>,
}

impl Learner {
    /// Create a learner over an ensemble of `accepters`.  The accepter list is used only for its
    /// cardinality.  `on_learn` fires exactly once per learned instance.
    pub fn new<F: FnMut(u64, &str) + 'static>(accepters: Vec<Address>, on_learn: F) -> Self {
        Self {
            accepters,
            on_learn: Box::new(on_learn),
            instances: HashMap::new(),
        }
    }

    fn receive_accepted(
        &mut self,
        accepter: &Address,
        instance_id: u64,
        value: String,
    ) -> Result<(), Error> {
        ACCEPTED_RECV.click();
        let quorum = majority(self.accepters.len());
        let instance = self.instances.entry(instance_id).or_default();
        if instance.accepters.get(accepter) == Some(&value) {
            // A duplicate report changes nothing.
            return Ok(());
        }
        if let Some(previous) = instance.accepters.insert(accepter.clone(), value.clone()) {
            VALUES_SWITCHED.click();
            if let Some(count) = instance.values.get_mut(&previous) {
                *count -= 1;
                if *count == 0 {
                    instance.values.remove(&previous);
                }
            }
        }
        let count = instance.values.entry(value.clone()).or_insert(0);
        *count += 1;
        if *count as usize >= quorum && !instance.learned {
            instance.learned = true;
            LEARNS.click();
            clue!(COLLECTOR, INFO, {
                learned: {
                    instance_id: instance_id,
                    value: value.clone(),
                },
            });
            (self.on_learn)(instance_id, &value);
        }
        Ok(())
    }
}

impl Actor for Learner {
    fn handle(
        &mut self,
        _: &mut Context<'_>,
        sender: &Address,
        body: Body,
    ) -> Result<(), Error> {
        match body {
            Body::Accepted {
                instance_id,
                ballot_id: _,
                value,
            } => self.receive_accepted(sender, instance_id, value),
            _ => Err(Error::UnexpectedMessage {
                core: ErrorCore::default(),
                what: format!("{} sent to a learner", body.message_type()),
            }),
        }
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

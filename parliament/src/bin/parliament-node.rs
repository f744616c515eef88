use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use indicio::{clue, stdio::StdioEmitter, ALWAYS, INFO};

use parliament::{Accepter, Learner, MessageServer, Proposer, ACCEPTER, LEARNER, PROPOSER};
use parliament_pb::{parse_endpoint, Address, IoToZ};

#[derive(Clone, Debug, Default, Eq, PartialEq, arrrg_derive::CommandLine)]
struct NodeOptions {
    #[arrrg(optional, "Write biometrics readings to this file.", "PATH")]
    biometrics: Option<String>,
}

fn main() {
    minimal_signals::block();
    let (options, free) = NodeOptions::from_command_line(
        "Usage: parliament-node [OPTIONS] <host:port> [host:port ...]",
    );
    if free.is_empty() {
        eprintln!("provide the host:port of every node; the first is this node");
        std::process::exit(1);
    }
    // indicio
    let emitter = Arc::new(StdioEmitter);
    parliament::COLLECTOR.register(emitter);
    parliament::COLLECTOR.set_verbosity(INFO);
    clue!(parliament::COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // biometrics
    if let Some(path) = options.biometrics.clone() {
        std::thread::spawn(move || {
            let collector = Collector::new();
            parliament::register_biometrics(&collector);
            let fout = File::create(path).expect("create biometrics output");
            let mut emit = PlainTextEmitter::new(fout);
            loop {
                let now = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .expect("clock should never fail")
                    .as_millis()
                    .try_into()
                    .expect("millis since epoch should fit u64");
                if let Err(e) = collector.emit(&mut emit, now) {
                    eprintln!("collector error: {}", e);
                }
                std::thread::sleep(std::time::Duration::from_millis(249));
            }
        });
    }
    // Every node must receive the same list so the ballot-seed sorts agree.
    let endpoints: Vec<(String, u16)> = free
        .iter()
        .map(|s| parse_endpoint(s).pretty_unwrap())
        .collect();
    let proposers: Vec<Address> = endpoints
        .iter()
        .map(|(host, port)| Address::new(host.clone(), *port, PROPOSER))
        .collect();
    let accepters: Vec<Address> = endpoints
        .iter()
        .map(|(host, port)| Address::new(host.clone(), *port, ACCEPTER))
        .collect();
    let learners: Vec<Address> = endpoints
        .iter()
        .map(|(host, port)| Address::new(host.clone(), *port, LEARNER))
        .collect();
    let (local_host, local_port) = endpoints[0].clone();
    let me = Address::new(local_host.clone(), local_port, PROPOSER);
    let proposer = Proposer::new(&me, proposers, accepters.clone()).pretty_unwrap();
    let accepter = Accepter::new(learners);
    let learner = Learner::new(accepters, |instance_id, value| {
        println!("{}: {}", instance_id, value);
    });
    let mut server = MessageServer::new(&local_host, local_port).pretty_unwrap();
    server.register(PROPOSER, Box::new(proposer));
    server.register(ACCEPTER, Box::new(accepter));
    server.register(LEARNER, Box::new(learner));
    // signals
    let _ = std::thread::spawn(move || {
        loop {
            let signal_set = minimal_signals::SignalSet::new().fill();
            let signal = minimal_signals::wait(signal_set);
            if signal != Some(minimal_signals::SIGCHLD) {
                break;
            }
        }
        clue!(parliament::COLLECTOR, ALWAYS, {
            goodbye: std::env::args().map(String::from).collect::<Vec<_>>(),
        });
        std::process::exit(0);
    });
    server.serve().pretty_unwrap();
}

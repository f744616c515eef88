use arrrg::CommandLine;
use zerror::Z;

use parliament::client::{ClientOptions, ProposeClient};
use parliament_pb::IoToZ;

fn main() {
    let (options, free) =
        ClientOptions::from_command_line("Usage: parliament-client [OPTIONS] <value> [value ...]");
    if free.is_empty() {
        eprintln!("provide at least one value to propose");
        std::process::exit(1);
    }
    let client = ProposeClient::new(options).pretty_unwrap();
    for value in free {
        match client.propose(&value) {
            Ok(()) => {
                println!("proposed {:?}", value);
            }
            Err(err) => {
                eprintln!("{}", err.long_form());
                std::process::exit(1);
            }
        }
    }
}

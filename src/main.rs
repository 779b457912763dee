#[macro_use]
extern crate log;
extern crate clap;
extern crate kademlia_rally;
extern crate simplelog;

use clap::Parser;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::process;
use std::time::Duration;

use kademlia_rally::{Event, Session, SessionOptions, UdpOverlay, SEARCH_INTERVAL};

/// Finds the other processes rallying under the same name and prints their addresses.
#[derive(Parser, Debug)]
#[command(name = "rally", version)]
struct CliOpts {
    /// The rally name shared by every process that should find each other.
    rally_name: String,
    /// Local UDP address of the DHT node.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,
    /// Address of a node already in the DHT. May be repeated. Without at least one, the node
    /// knows nobody and every search reports no connectivity.
    #[arg(long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,
    /// Join without discovering peers or searching periodically.
    #[arg(long)]
    no_bootstrap: bool,
    /// Seconds between searches for the rally point.
    #[arg(long, default_value_t = SEARCH_INTERVAL)]
    interval: u64,
    /// Log debug output to stderr.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let opts = match CliOpts::try_parse() {
        Ok(opts) => opts,
        Err(err) => {
            // help and version go to stdout and are not failures
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            process::exit(code);
        },
    };

    let level = if opts.verbose { LevelFilter::Debug } else { LevelFilter::Error };
    let config = Config::default();
    if let Err(err) = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto) {
        eprintln!("Could not initialise logging: {}", err);
    }

    let overlay = UdpOverlay::new(opts.bind, opts.bootstrap);
    let options = SessionOptions {
        bootstrap_into_overlay: !opts.no_bootstrap,
        search_interval: Duration::from_secs(opts.interval),
        ..SessionOptions::default()
    };
    let (_session, events) = match Session::spawn(&opts.rally_name, overlay, options) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        },
    };

    let stdout = io::stdout();
    for event in events.iter() {
        match event {
            Event::Rejoined(id) => info!("I have a new node id: {}", id),
            Event::PeersFound(peers) => {
                let mut out = stdout.lock();
                for peer in peers {
                    if writeln!(out, "{}", peer).is_err() {
                        return;
                    }
                }
                let _ = out.flush();
            },
            Event::Error(err) => eprintln!("{}", err),
        }
    }
}

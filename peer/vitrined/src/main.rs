use clap::{App, Arg};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flint::logging::{self, debug, info, warn};
use vitrine::prelude::*;

mod config;

use crate::config::PeerConfig;

fn main() {
    let matches = App::new("vitrined")
        .about("Replicated key-value peer daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to the peer configuration file"),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help("Listen address override"),
        )
        .arg(
            Arg::with_name("node-id")
                .long("node-id")
                .takes_value(true)
                .help("Node identifier override"),
        )
        .arg(
            Arg::with_name("write-default-config")
                .long("write-default-config")
                .takes_value(true)
                .value_name("PATH")
                .help("Write the default configuration to PATH and exit"),
        )
        .get_matches();

    if let Some(path) = matches.value_of("write-default-config") {
        PeerConfig::write_default(path);
        return;
    }

    let mut cfg = matches
        .value_of("config")
        .map(PeerConfig::load)
        .unwrap_or_default();

    if let Some(address) = matches.value_of("address") {
        cfg.server.address = address.to_string();
    }
    if let Some(id) = matches.value_of("node-id") {
        cfg.node.id = id.parse().expect("Invalid node id");
    }

    let log = match &cfg.logging.config {
        Some(path) => logging::from_toml_file(path),
        None => logging::terminal(),
    };

    let format = WireFormat::parse(&cfg.server.format).expect("Unknown wire format");

    let tree = AssetTree::new(cfg.node.id, &log);
    let registry = SubRegistry::new(&log);
    let evloop = EventLoop::new(&log);
    let dispatcher = Dispatcher::new(tree.clone(), registry.clone(), evloop.clone(), &log);

    let endpoint = Endpoint::new(&cfg.server.address, format, dispatcher, registry, &log)
        .expect("Failed creating endpoint");

    info!(log, "peer up";
          "node" => cfg.node.id,
          "address" => endpoint.local_addr().to_string());

    let closed = Arc::new(AtomicBool::new(false));
    let _endpoint_thread = endpoint.spawn(closed);
    let _evloop_thread = evloop.spawn();

    // Keep one replication session alive per (peer, asset); dead sessions
    // are re-established on the next pass.
    let mut sessions: HashMap<(u8, String), (Arc<Client>, Arc<PeerSession>)> = HashMap::new();

    loop {
        for peer in &cfg.replication.peers {
            for path in &cfg.replication.assets {
                let key = (peer.id, path.clone());

                let alive = sessions
                    .get(&key)
                    .map_or(false, |(_, session)| {
                        session.state() == SessionState::Streaming
                            || session.state() == SessionState::Subscribed
                    });
                if alive {
                    continue;
                }

                if let Some((client, session)) = sessions.remove(&key) {
                    session.close();
                    client.close();
                }

                let csp = format!("{}?view=map", path);
                let asset = tree.acquire(&Csp::parse(&csp).expect("Bad asset path"));

                let mut client_cfg = ClientConfig::new(&peer.address);
                client_cfg.user = cfg.node.user.clone();
                client_cfg.format = format;

                match Client::connect(client_cfg, &log) {
                    Ok(client) => {
                        match PeerSession::establish(client.clone(), asset, &evloop, &log) {
                            Ok(session) => {
                                info!(log, "replication session up";
                                      "peer" => peer.id, "asset" => path.clone());
                                sessions.insert(key, (client, session));
                            }
                            Err(err) => {
                                warn!(log, "session establishment failed";
                                      "peer" => peer.id, "error" => ?err);
                                client.close();
                            }
                        }
                    }
                    Err(err) => {
                        debug!(log, "peer unreachable"; "peer" => peer.id, "error" => ?err);
                    }
                }
            }
        }

        thread::sleep(Duration::from_secs(1));
    }
}

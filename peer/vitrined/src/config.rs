use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28017;

#[derive(Serialize, Deserialize)]
pub struct Node {
    pub id: u8,
    pub user: String,
}

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    /// Wire form for this endpoint: "binary" or "text".
    pub format: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Peer {
    pub id: u8,
    pub address: String,
}

#[derive(Serialize, Deserialize)]
pub struct Replication {
    /// Asset paths replicated to every listed peer.
    pub assets: Vec<String>,
    pub peers: Vec<Peer>,
}

#[derive(Serialize, Deserialize)]
pub struct Logging {
    /// Path to a TOML logger configuration; stderr terminal output when
    /// absent.
    pub config: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct PeerConfig {
    pub node: Node,
    pub server: Server,
    pub replication: Replication,
    pub logging: Logging,
}

impl Default for PeerConfig {
    fn default() -> PeerConfig {
        PeerConfig {
            node: Node {
                id: 1,
                user: "vitrined".to_string(),
            },
            server: Server {
                address: format!("0.0.0.0:{}", DEFAULT_PORT),
                format: "binary".to_string(),
            },
            replication: Replication {
                assets: vec!["/data".to_string()],
                peers: Vec::new(),
            },
            logging: Logging { config: None },
        }
    }
}

impl PeerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> PeerConfig {
        serdeconv::from_toml_file(path).expect("Error loading peer configuration file")
    }

    pub fn write_default<P: AsRef<Path>>(path: P) {
        serdeconv::to_toml_file(&PeerConfig::default(), path)
            .expect("Error writing the default peer configuration");
    }
}

//! Replica identity and the hosts table.
//!
//! Every replica carries a precedence: a positive integer, unique across
//! the cluster, assigned randomly on first launch and used as the
//! secondary key in version ordering. The hosts file is a YAML sequence of
//! replica records behind a single header comment naming the last save.

use std::path::Path;

use chrono::{DateTime, Utc};
use fluid_core::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

const HOSTS_HEADER: &str = "# FluidFS hosts last updated:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub precedence: u64,
    pub name: String,
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Blobs pushed to this replica.
    #[serde(default)]
    pub sent_blobs: u64,
    /// Blobs received from this replica.
    #[serde(default)]
    pub recv_blobs: u64,
}

impl Replica {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// The known replicas, local one included.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    pub replicas: Vec<Replica>,
}

impl Hosts {
    /// Loads the hosts file; a missing file is an empty table.
    pub fn load(path: &Path) -> Result<Hosts> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Hosts::default());
            }
            Err(err) => return Err(err.into()),
        };
        let body: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        if body.trim().is_empty() {
            return Ok(Hosts::default());
        }
        let replicas: Vec<Replica> = serde_yaml::from_str(&body)
            .map_err(|err| Error::InvalidReplica(format!("{}: {err}", path.display())))?;
        Ok(Hosts { replicas })
    }

    /// Writes the table behind a fresh header comment.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_yaml::to_string(&self.replicas)
            .map_err(|err| Error::Internal(format!("hosts encode: {err}")))?;
        let text = format!("{HOSTS_HEADER} {}\n{body}", Utc::now().to_rfc2822());
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.name == name)
    }

    /// A uniformly random peer other than `local`; `None` when fewer than
    /// two hosts are known.
    pub fn random_peer<R: Rng>(&self, local: &str, rng: &mut R) -> Option<&Replica> {
        let peers: Vec<&Replica> = self.replicas.iter().filter(|r| r.name != local).collect();
        if peers.is_empty() || self.replicas.len() < 2 {
            return None;
        }
        let pick = rng.random_range(0..peers.len());
        Some(peers[pick])
    }

    /// Finds the local replica record, minting one with a random positive
    /// precedence on first launch.
    pub fn ensure_local<R: Rng>(
        &mut self,
        name: &str,
        addr: &str,
        port: u16,
        rng: &mut R,
    ) -> Result<Replica> {
        if let Some(replica) = self.get_mut(name) {
            replica.addr = addr.to_string();
            replica.port = port;
            replica.updated = Utc::now();
            return Ok(replica.clone());
        }
        let mut precedence: u64 = rng.random_range(1..=u32::MAX as u64);
        while self.replicas.iter().any(|r| r.precedence == precedence) {
            precedence = rng.random_range(1..=u32::MAX as u64);
        }
        let now = Utc::now();
        let replica = Replica {
            precedence,
            name: name.to_string(),
            addr: addr.to_string(),
            port,
            tags: Vec::new(),
            created: now,
            updated: now,
            last_seen: None,
            sent_blobs: 0,
            recv_blobs: 0,
        };
        info!(name, precedence, "registered local replica");
        self.replicas.push(replica.clone());
        Ok(replica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn first_launch_mints_precedence() {
        let mut hosts = Hosts::default();
        let local = hosts
            .ensure_local("replica-a", "127.0.0.1", 4157, &mut rng())
            .unwrap();
        assert!(local.precedence > 0);
        // Second call is stable.
        let again = hosts
            .ensure_local("replica-a", "127.0.0.1", 4157, &mut rng())
            .unwrap();
        assert_eq!(again.precedence, local.precedence);
        assert_eq!(hosts.replicas.len(), 1);
    }

    #[test]
    fn peer_selection_needs_two_hosts() {
        let mut hosts = Hosts::default();
        let mut rng = rng();
        hosts.ensure_local("a", "127.0.0.1", 1, &mut rng).unwrap();
        assert!(hosts.random_peer("a", &mut rng).is_none());

        hosts.ensure_local("b", "127.0.0.1", 2, &mut rng).unwrap();
        for _ in 0..8 {
            let peer = hosts.random_peer("a", &mut rng).unwrap();
            assert_eq!(peer.name, "b");
        }
    }

    #[test]
    fn file_round_trip_keeps_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.yml");
        let mut hosts = Hosts::default();
        let mut rng = rng();
        hosts.ensure_local("a", "10.0.0.1", 4157, &mut rng).unwrap();
        hosts.ensure_local("b", "10.0.0.2", 4157, &mut rng).unwrap();
        hosts.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# FluidFS hosts last updated:"));

        let loaded = Hosts::load(&path).unwrap();
        assert_eq!(loaded.replicas, hosts.replicas);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = Hosts::load(&dir.path().join("absent.yml")).unwrap();
        assert!(hosts.replicas.is_empty());
    }
}

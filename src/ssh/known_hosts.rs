//! Known hosts management for SSH host key verification

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// known_hosts file with an in-memory cache
pub struct KnownHostsStore {
    /// host -> keys (one host may carry several key types)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            debug!("Known hosts file not found or unreadable: {}", e);
        }

        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) cannot be matched without the salt
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// `[host]:port` and `host` both map to the bracketed lookup key form
    fn normalize_hostname(host: &str) -> String {
        let host = host.to_lowercase();
        if host.starts_with('[') && host.contains("]:") {
            host
        } else {
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
    }

    /// Lookup key for host:port, in known_hosts notation
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_of(&key.public_key_bytes())
    }

    fn fingerprint_of(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries.iter().filter(|e| e.key_type == actual_key_type) {
            if entry.key_data == actual_key_b64 {
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| Self::fingerprint_of(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but not for this key type
        debug!(
            "Host {} known but no {} key stored, treating as new",
            lookup_key, actual_key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Remember a host key in memory and in the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = key.algorithm().as_str().to_string();

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!("Added host key for {} (type: {}) to known_hosts", lookup_key, key_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEB";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgIC";

    fn key(openssh: &str) -> PublicKey {
        PublicKey::from_openssh(openssh).unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(KnownHostsStore::normalize_hostname("GitHub.com"), "github.com");
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "[server.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_verify_against_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!("# comment\nbuild.internal,10.0.0.5 {}\n[bastion]:2222 {}\n", KEY_A, KEY_A),
        )
        .unwrap();

        let store = KnownHostsStore::with_path(path);
        assert_eq!(
            store.verify("build.internal", 22, &key(KEY_A)),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify("10.0.0.5", 22, &key(KEY_A)),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify("bastion", 2222, &key(KEY_A)),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify("build.internal", 22, &key(KEY_B)),
            HostKeyVerification::Changed { .. }
        ));
        assert!(matches!(
            store.verify("bastion", 22, &key(KEY_A)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_add_host_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("known_hosts");

        let store = KnownHostsStore::with_path(path.clone());
        store.add_host("db.internal", 2200, &key(KEY_B)).unwrap();
        assert_eq!(
            store.verify("db.internal", 2200, &key(KEY_B)),
            HostKeyVerification::Verified
        );

        let reloaded = KnownHostsStore::with_path(path);
        assert_eq!(
            reloaded.verify("db.internal", 2200, &key(KEY_B)),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHostsStore::fingerprint(&key(KEY_A));
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}

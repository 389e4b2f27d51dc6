//! Transcript fingerprints: content hash plus per-sender counts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::conversation::model::{Sender, Transcript};

/// Cheap equality summary of a transcript.
///
/// The hash covers role and whitespace-normalized text only, never
/// timestamps or render position, so a re-render of the same thread hashes
/// the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Hex SHA-256.
    pub hash: String,
    pub inbound: usize,
    pub outbound: usize,
}

impl Fingerprint {
    pub fn of(transcript: &Transcript) -> Self {
        let mut hasher = Sha256::new();
        let mut inbound = 0;
        let mut outbound = 0;

        for msg in &transcript.messages {
            let role = match msg.sender {
                Sender::Ours => {
                    outbound += 1;
                    "o"
                }
                Sender::Theirs => {
                    inbound += 1;
                    "t"
                }
            };
            hasher.update(role.as_bytes());
            hasher.update(b":");
            hasher.update(normalize(&msg.text).as_bytes());
            hasher.update(b"\n");
        }

        Self {
            hash: to_hex(&hasher.finalize()),
            inbound,
            outbound,
        }
    }

    /// Short prefix of the hash for log lines.
    pub fn short(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (in={}, out={})", self.short(), self.inbound, self.outbound)
    }
}

/// Collapse runs of whitespace so spacing differences don't change the hash.
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

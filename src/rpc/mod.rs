//! RPC agent fleet: the per-node agent server, the client side of peer
//! connections, and the coordinator's peer store.

pub mod client;
pub mod fleet;
pub mod server;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("mooring");

    // File descriptor for gRPC reflection
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/descriptor.bin"));
}

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Metadata key carrying the agent token on every RPC.
pub const TOKEN_METADATA_KEY: &str = "x-mooring-token";

/// Directory under the state dir holding the agent credential package.
pub const SECRETS_DIR: &str = "secrets";

/// File name of the agent token inside the credential package.
pub const TOKEN_FILE: &str = "agent.token";

/// Credential bundle shared by the orchestrator and every agent of an
/// operation. The token must be secret-equal across all parties; any
/// mismatch aborts the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Credentials {
        Credentials {
            token: token.into(),
        }
    }

    fn token_path(state_dir: &Path) -> PathBuf {
        state_dir.join(SECRETS_DIR).join(TOKEN_FILE)
    }

    /// Loads the credential package from the well-known directory under the
    /// state dir.
    pub fn load(state_dir: &Path) -> Result<Credentials> {
        let path = Self::token_path(state_dir);
        let token = std::fs::read_to_string(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("no credentials at {}", path.display()))
            } else {
                err.into()
            }
        })?;
        Ok(Credentials::new(token.trim()))
    }

    /// Persists the credential package into the state dir.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::token_path(state_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &self.token)?;
        Ok(())
    }

    /// Constant-ish comparison of the shared secret.
    pub fn matches(&self, token: &str) -> bool {
        let a = self.token.as_bytes();
        let b = token.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::new("secret-token");
        creds.save(dir.path()).unwrap();
        let loaded = Credentials::load(dir.path()).unwrap();
        assert_eq!(creds, loaded);
        assert!(loaded.matches("secret-token"));
        assert!(!loaded.matches("other"));
        assert!(!loaded.matches("secret-toke"));
    }

    #[test]
    fn test_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Credentials::load(dir.path()).unwrap_err().is_not_found());
    }
}

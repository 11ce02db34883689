//! Network-key persistence.
//!
//! A node's long-term identity is an Ed25519 keypair stored protobuf-encoded
//! on disk. The key is generated on first run; after that the same identity
//! (and therefore the same PeerId) is loaded on every start.

use std::{fs, path::Path};

use libp2p::identity;

use crate::error::Error;

/// Load a persisted keypair from `path`, or generate a new one and write it
/// to `path` in protobuf encoding.
///
/// A file that cannot be decoded is an error rather than a silent rotation:
/// rotating the identity changes the PeerId and invalidates every address
/// other nodes have gossiped or registered for this node.
pub fn load_or_create_keypair(path: &Path) -> Result<identity::Keypair, Error> {
    if path.exists() {
        let raw = fs::read(path).map_err(|e| Error::Keypair(e.to_string()))?;
        return identity::Keypair::from_protobuf_encoding(&raw).map_err(|_| {
            Error::Keypair(format!(
                "network key file '{}' ({} bytes) is not a protobuf-encoded keypair; \
                 delete it to generate a fresh identity",
                path.display(),
                raw.len()
            ))
        });
    }

    let key = identity::Keypair::generate_ed25519();
    let raw = key
        .to_protobuf_encoding()
        .map_err(|e| Error::Keypair(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::Keypair(e.to_string()))?;
    }
    fs::write(path, &raw).map_err(|e| Error::Keypair(e.to_string()))?;
    tracing::info!("Generated new network key at {}", path.display());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network-key");

        let first = load_or_create_keypair(&path).unwrap();
        let second = load_or_create_keypair(&path).unwrap();
        assert_eq!(
            first.public().to_peer_id(),
            second.public().to_peer_id()
        );
    }

    #[test]
    fn corrupt_key_file_is_an_error_not_a_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network-key");
        fs::write(&path, b"garbage").unwrap();

        assert!(load_or_create_keypair(&path).is_err());
        // The file is left untouched for the operator to inspect.
        assert_eq!(fs::read(&path).unwrap(), b"garbage");
    }
}

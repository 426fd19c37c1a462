//! Extended attributes: a small user-settable namespace plus five built-in
//! names that expose inode/coordinator state. `getxattr`/`setxattr` style
//! RPCs (`SETXATTR`/`GETXATTR`/`LISTXATTR`/`REMOVEXATTR`) are implemented
//! against this store by [`crate::transport`].

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};
use crate::ids::XattrNonce;

pub const XATTR_COORDINATOR: &str = "user.syndicate_coordinator";
pub const XATTR_CACHED_BLOCKS: &str = "user.syndicate_cached_blocks";
pub const XATTR_CACHED_FILE_PATH: &str = "user.syndicate_cached_file_path";
pub const XATTR_READ_TTL: &str = "user.syndicate_read_ttl";
pub const XATTR_WRITE_TTL: &str = "user.syndicate_write_ttl";

const READ_ONLY_BUILTINS: &[&str] = &[XATTR_COORDINATOR, XATTR_CACHED_BLOCKS, XATTR_CACHED_FILE_PATH];
const SETTABLE_BUILTINS: &[&str] = &[XATTR_READ_TTL, XATTR_WRITE_TTL];

fn is_read_only_builtin(name: &str) -> bool {
    READ_ONLY_BUILTINS.contains(&name)
}

fn is_settable_builtin(name: &str) -> bool {
    SETTABLE_BUILTINS.contains(&name)
}

/// The extended-attribute set carried by one inode.
#[derive(Debug, Clone, Default)]
pub struct XattrStore {
    entries: BTreeMap<String, Vec<u8>>,
    nonce: XattrNonce,
}

impl XattrStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nonce(&self) -> XattrNonce {
        self.nonce
    }

    pub fn get(&self, name: &str) -> Result<&[u8]> {
        self.entries
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| GatewayError::NoSuchAttribute(name.to_string()))
    }

    /// `setxattr`. Read-only builtins can never be set directly; they are
    /// derived and installed by the inode export path instead.
    pub fn set(&mut self, name: &str, value: Vec<u8>) -> Result<()> {
        if is_read_only_builtin(name) {
            return Err(GatewayError::PermissionDenied(format!("{name} is read-only")));
        }
        if is_settable_builtin(name) && std::str::from_utf8(&value).ok().and_then(|s| s.parse::<u64>().ok()).is_none() {
            return Err(GatewayError::InvalidArgument(format!(
                "{name} must be an integer number of milliseconds"
            )));
        }
        self.entries.insert(name.to_string(), value);
        self.nonce = XattrNonce(self.nonce.0.wrapping_add(1));
        Ok(())
    }

    /// `removexattr`.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if is_read_only_builtin(name) {
            return Err(GatewayError::PermissionDenied(format!("{name} is read-only")));
        }
        if self.entries.remove(name).is_none() {
            return Err(GatewayError::NoSuchAttribute(name.to_string()));
        }
        self.nonce = XattrNonce(self.nonce.0.wrapping_add(1));
        Ok(())
    }

    /// `listxattr`.
    pub fn list(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Installs a synthetic, read-only builtin value; used by the inode
    /// export path, never by a client RPC.
    pub fn install_builtin(&mut self, name: &'static str, value: Vec<u8>) {
        debug_assert!(is_read_only_builtin(name), "not a read-only builtin: {name}");
        self.entries.insert(name.to_string(), value);
    }

    pub fn read_ttl_ms(&self) -> Option<u64> {
        self.parse_ttl(XATTR_READ_TTL)
    }

    pub fn write_ttl_ms(&self) -> Option<u64> {
        self.parse_ttl(XATTR_WRITE_TTL)
    }

    fn parse_ttl(&self, name: &str) -> Option<u64> {
        self.entries
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// `UG_inode_export_xattr_hash`: SHA-256 over the sorted, length-prefixed
    /// `(name, value)` pairs, so two gateways observing the same xattr set
    /// always agree on the hash, independent of insertion order.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (name, value) in &self.entries {
            hasher.update((name.len() as u32).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u32).to_le_bytes());
            hasher.update(value);
        }
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_builtins_reject_direct_sets() {
        let mut store = XattrStore::new();
        let err = store.set(XATTR_COORDINATOR, b"1".to_vec()).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn ttl_must_be_integer_milliseconds() {
        let mut store = XattrStore::new();
        assert!(store.set(XATTR_READ_TTL, b"not-a-number".to_vec()).is_err());
        store.set(XATTR_READ_TTL, b"5000".to_vec()).unwrap();
        assert_eq!(store.read_ttl_ms(), Some(5000));
    }

    #[test]
    fn hash_is_order_independent() {
        let mut a = XattrStore::new();
        a.set("user.one", b"1".to_vec()).unwrap();
        a.set("user.two", b"2".to_vec()).unwrap();

        let mut b = XattrStore::new();
        b.set("user.two", b"2".to_vec()).unwrap();
        b.set("user.one", b"1".to_vec()).unwrap();

        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_changes_with_content() {
        let mut a = XattrStore::new();
        a.set("user.one", b"1".to_vec()).unwrap();
        let h1 = a.hash();
        a.set("user.one", b"2".to_vec()).unwrap();
        assert_ne!(h1, a.hash());
    }

    #[test]
    fn remove_missing_is_no_such_attribute() {
        let mut store = XattrStore::new();
        assert!(matches!(store.remove("user.missing"), Err(GatewayError::NoSuchAttribute(_))));
    }
}

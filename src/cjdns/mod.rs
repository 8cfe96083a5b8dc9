use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::Error;

mod admin;

pub use admin::Admin;

/// First byte of every address inside the cjdns address space (fc00::/8).
pub const MESH_PREFIX: u8 = 0xFC;

/// A cjdns node public key in its canonical form: 52 base32 characters
/// followed by `.k`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(String);

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let body = s
            .strip_suffix(".k")
            .ok_or_else(|| Error::InvalidPublicKey(s.to_string()))?;

        if body.len() != 52
            || !body
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(Error::InvalidPublicKey(s.to_string()));
        }

        Ok(PublicKey(s.to_string()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PublicKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checks that an address can carry a mesh identity: it must be a real
/// IPv6 address (not IPv4 or an IPv4-mapped form) inside the cjdns
/// address space.
pub fn mesh_addr(ip: IpAddr) -> Result<Ipv6Addr, Error> {
    let v6 = match ip {
        IpAddr::V6(v6) => v6,
        IpAddr::V4(_) => return Err(Error::NotIpv6(ip)),
    };

    if v6.to_ipv4_mapped().is_some() {
        return Err(Error::NotIpv6(ip));
    }

    if v6.octets()[0] != MESH_PREFIX {
        return Err(Error::NotMeshAddress(v6));
    }

    Ok(v6)
}

/// The mesh routing daemon's administrative surface, as far as leasing is
/// concerned: identity resolution and tunnel permissions. Sessions hold it
/// as `Arc<dyn Gateway>`; tests substitute a mock.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Resolves a mesh address to the public key of the node holding it.
    async fn resolve_identity(&self, addr: Ipv6Addr) -> Result<PublicKey, Error>;

    /// Authorizes tunnel traffic from `key` to `addr`.
    async fn permit_tunnel(&self, key: &PublicKey, addr: IpAddr) -> Result<(), Error>;

    /// Lists the handles of all tunnel permissions currently held.
    async fn list_tunnels(&self) -> Result<Vec<i64>, Error>;

    /// Returns the public key a tunnel permission was granted to.
    async fn describe_tunnel(&self, handle: i64) -> Result<PublicKey, Error>;

    /// Revokes a single tunnel permission.
    async fn revoke_tunnel(&self, handle: i64) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    use hashbrown::HashMap;

    use super::*;

    /// In-memory gateway for exercising tasks and sessions without a
    /// cjdns daemon. `fail_permit` injects the partial-failure path.
    #[derive(Default)]
    pub(crate) struct MockGateway {
        pub(crate) nodes: Mutex<HashMap<Ipv6Addr, PublicKey>>,
        pub(crate) tunnels: Mutex<Vec<(i64, PublicKey)>>,
        pub(crate) fail_permit: AtomicBool,
        next_handle: AtomicI64,
    }

    impl MockGateway {
        pub(crate) fn with_node(addr: Ipv6Addr, key: PublicKey) -> Self {
            let gw = Self::default();
            gw.nodes.lock().unwrap().insert(addr, key);
            gw
        }

        pub(crate) fn tunnel_keys(&self) -> Vec<PublicKey> {
            self.tunnels
                .lock()
                .unwrap()
                .iter()
                .map(|(_, k)| k.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn resolve_identity(
            &self,
            addr: Ipv6Addr,
        ) -> Result<PublicKey, Error> {
            self.nodes
                .lock()
                .unwrap()
                .get(&addr)
                .cloned()
                .ok_or(Error::NotInTable(addr))
        }

        async fn permit_tunnel(
            &self,
            key: &PublicKey,
            _addr: IpAddr,
        ) -> Result<(), Error> {
            if self.fail_permit.load(Ordering::SeqCst) {
                return Err(Error::Admin("connection refused".to_string()));
            }
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
            self.tunnels.lock().unwrap().push((handle, key.clone()));
            Ok(())
        }

        async fn list_tunnels(&self) -> Result<Vec<i64>, Error> {
            Ok(self
                .tunnels
                .lock()
                .unwrap()
                .iter()
                .map(|(h, _)| *h)
                .collect())
        }

        async fn describe_tunnel(&self, handle: i64) -> Result<PublicKey, Error> {
            self.tunnels
                .lock()
                .unwrap()
                .iter()
                .find(|(h, _)| *h == handle)
                .map(|(_, k)| k.clone())
                .ok_or_else(|| Error::Admin("no such connection".to_string()))
        }

        async fn revoke_tunnel(&self, handle: i64) -> Result<(), Error> {
            let mut tunnels = self.tunnels.lock().unwrap();
            let before = tunnels.len();
            tunnels.retain(|(h, _)| *h != handle);
            if tunnels.len() == before {
                return Err(Error::Admin("no such connection".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str =
        "lnxsbrcgg3ppv04kvwhyywsvbj7h8s9lq2xsmg5pj8m1rv9r6xj0.k";

    #[test]
    fn parses_canonical_public_key() {
        let key: PublicKey = KEY.parse().unwrap();
        assert_eq!(key.to_string(), KEY);
    }

    #[test]
    fn rejects_malformed_public_keys() {
        for s in ["", "abc.k", KEY.trim_end_matches(".k"), "LNXS.k"] {
            assert!(matches!(
                s.parse::<PublicKey>(),
                Err(Error::InvalidPublicKey(_))
            ));
        }
    }

    #[test]
    fn mesh_addr_accepts_fc_prefixed_ipv6() {
        let ip: IpAddr = "fc5d:baa5:61fc:6ffd:9554:67f0:e290:7535".parse().unwrap();
        assert_eq!(mesh_addr(ip).unwrap().octets()[0], MESH_PREFIX);
    }

    #[test]
    fn mesh_addr_rejects_other_prefixes() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(matches!(mesh_addr(ip), Err(Error::NotMeshAddress(_))));
    }

    #[test]
    fn mesh_addr_rejects_ipv4_and_mapped_forms() {
        let v4: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(matches!(mesh_addr(v4), Err(Error::NotIpv6(_))));

        let mapped: IpAddr = "::ffff:192.168.1.1".parse().unwrap();
        assert!(matches!(mesh_addr(mapped), Err(Error::NotIpv6(_))));
    }
}

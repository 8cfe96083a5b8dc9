use std::collections::BTreeMap;
use std::io;

use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, info};

use crate::cjdns::PublicKey;
use crate::error::Error;

/// Maps registered identities to their lease identifiers. The identifier is
/// the only state tying an identity to an address; addresses themselves are
/// recomputed from (pool, identifier) on demand and never stored.
///
/// Identifiers are keyed in a `BTreeMap` because allocation scans them in
/// ascending order.
pub struct Registry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    users: BTreeMap<u64, PublicKey>,
    admin_hash: Option<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Hashes and stores the administrator password. Called once at
    /// startup. The hash runs on the blocking pool; bcrypt burns CPU for
    /// long enough to stall the executor.
    pub async fn set_admin(&self, password: &str) -> Result<(), Error> {
        let password = password.to_string();
        let hash = task::spawn_blocking(move || {
            bcrypt::hash(password, bcrypt::DEFAULT_COST)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        info!("updating administrator password hash");
        self.inner.write().await.admin_hash = Some(hash);
        Ok(())
    }

    /// Compares a supplied password against the stored hash, on the
    /// blocking pool. An unset hash rejects every password.
    pub async fn verify_admin(&self, password: &str) -> Result<(), Error> {
        let hash = match &self.inner.read().await.admin_hash {
            Some(hash) => hash.clone(),
            None => return Err(Error::BadPassword),
        };

        let password = password.to_string();
        let ok =
            task::spawn_blocking(move || bcrypt::verify(password, &hash))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        if ok {
            Ok(())
        } else {
            Err(Error::BadPassword)
        }
    }

    pub async fn lookup_by_identity(&self, key: &PublicKey) -> Option<u64> {
        let inner = self.inner.read().await;
        inner
            .users
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(id, _)| *id)
    }

    pub async fn lookup_by_identifier(&self, id: u64) -> Option<PublicKey> {
        self.inner.read().await.users.get(&id).cloned()
    }

    /// Registers an identity and assigns it the smallest unused positive
    /// identifier: the scan walks assigned identifiers in ascending order
    /// and stops at the first gap after the contiguous run starting at 1.
    /// Registering an already-known identity fails without mutating
    /// anything.
    pub async fn add_user(&self, key: &PublicKey) -> Result<u64, Error> {
        let mut inner = self.inner.write().await;

        if inner.users.values().any(|k| k == key) {
            return Err(Error::UserExists(key.clone()));
        }

        let mut last = 0;
        for &id in inner.users.keys() {
            if id > last + 1 {
                break;
            }
            last = id;
        }
        let id = last + 1;

        info!("adding user with key {} and id {}", key, id);
        inner.users.insert(id, key.clone());
        Ok(id)
    }

    /// Removes a registered identity, returning the identifier it held so
    /// the slot becomes reusable.
    pub async fn del_user(&self, key: &PublicKey) -> Result<u64, Error> {
        let mut inner = self.inner.write().await;

        let id = inner
            .users
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(id, _)| *id)
            .ok_or_else(|| Error::UserNotFound(key.clone()))?;

        debug!("deleting user with key {} and id {}", key, id);
        inner.users.remove(&id);
        Ok(id)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PublicKey {
        // 52 base32 characters + ".k"
        let body: String = std::iter::repeat(char::from(b'a' + n % 26))
            .take(52)
            .collect();
        format!("{}.k", body).parse().unwrap()
    }

    #[tokio::test]
    async fn identifiers_are_sequential() {
        let reg = Registry::new();
        assert_eq!(reg.add_user(&key(0)).await.unwrap(), 1);
        assert_eq!(reg.add_user(&key(1)).await.unwrap(), 2);
        assert_eq!(reg.add_user(&key(2)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn removal_leaves_a_reusable_gap() {
        let reg = Registry::new();
        reg.add_user(&key(0)).await.unwrap();
        reg.add_user(&key(1)).await.unwrap();
        reg.add_user(&key(2)).await.unwrap();

        assert_eq!(reg.del_user(&key(1)).await.unwrap(), 2);
        assert_eq!(reg.add_user(&key(3)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_registration_fails_without_mutation() {
        let reg = Registry::new();
        let id = reg.add_user(&key(0)).await.unwrap();

        assert!(matches!(
            reg.add_user(&key(0)).await,
            Err(Error::UserExists(_))
        ));
        assert_eq!(reg.lookup_by_identity(&key(0)).await, Some(id));
        assert_eq!(reg.lookup_by_identifier(id).await, Some(key(0)));
        assert_eq!(reg.lookup_by_identifier(id + 1).await, None);
    }

    #[tokio::test]
    async fn unknown_user_cannot_be_deleted() {
        let reg = Registry::new();
        assert!(matches!(
            reg.del_user(&key(7)).await,
            Err(Error::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn lookups_resolve_both_directions() {
        let reg = Registry::new();
        let id = reg.add_user(&key(4)).await.unwrap();
        assert_eq!(reg.lookup_by_identity(&key(4)).await, Some(id));
        assert_eq!(reg.lookup_by_identifier(id).await, Some(key(4)));
        assert_eq!(reg.lookup_by_identity(&key(5)).await, None);
    }

    #[tokio::test]
    async fn admin_password_round_trip() {
        let reg = Registry::new();
        assert!(matches!(
            reg.verify_admin("s3cret").await,
            Err(Error::BadPassword)
        ));

        reg.set_admin("s3cret").await.unwrap();
        reg.verify_admin("s3cret").await.unwrap();
        assert!(matches!(
            reg.verify_admin("wrong").await,
            Err(Error::BadPassword)
        ));
    }
}

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cjdns::{self, Gateway, PublicKey};
use crate::error::Error;
use crate::lease::Cidr;
use crate::registry::Registry;
use crate::server::Context;

/// One parsed request, bound to the authenticated identity and the handles
/// its execution needs. Built once per input line, executed exactly once.
pub enum Task {
    Add(Add),
    Remove(Remove),
    Invalid(Error),
}

/// Allocates (or re-derives) a lease and permits tunnel traffic for it.
pub struct Add {
    key: PublicKey,
    registry: Arc<Registry>,
    gateway: Arc<dyn Gateway>,
    pools: Arc<[Cidr]>,
}

/// Deregisters an identity and revokes its tunnel permissions.
pub struct Remove {
    key: PublicKey,
    registry: Arc<Registry>,
    gateway: Arc<dyn Gateway>,
}

impl Task {
    /// Parses one request line into a runnable task. Construction failures
    /// (bad token count, failed authentication, unresolvable identity,
    /// unknown command) become [`Task::Invalid`] so the session always has
    /// something to run and exactly one line to answer with.
    pub async fn build(ctx: &Context, peer: SocketAddr, line: &str) -> Task {
        match Self::try_build(ctx, peer, line).await {
            Ok(task) => task,
            Err(e) => Task::Invalid(e),
        }
    }

    async fn try_build(
        ctx: &Context,
        peer: SocketAddr,
        line: &str,
    ) -> Result<Task, Error> {
        let argv: Vec<&str> = line.split(' ').collect();
        let cmd = argv[0].to_lowercase();

        // A bare command acts on the connecting peer. Three tokens carry
        // the administrator password and an explicit target address, and
        // may act on any identity. The target address is validated before
        // the password hash is ever consulted.
        let client = match argv.len() {
            1 => cjdns::mesh_addr(peer.ip())?,
            3 => {
                let ip: IpAddr = argv[2]
                    .parse()
                    .map_err(|_| Error::InvalidAddress(argv[2].to_string()))?;
                let ip = cjdns::mesh_addr(ip)?;
                ctx.registry.verify_admin(argv[1]).await?;
                ip
            }
            n => return Err(Error::InvalidArgumentCount(n)),
        };

        let key = ctx.gateway.resolve_identity(client).await?;
        debug!("resolved {} to {}", client, key);

        match cmd.as_str() {
            "add" | "lease" => Ok(Task::Add(Add {
                key,
                registry: ctx.registry.clone(),
                gateway: ctx.gateway.clone(),
                pools: ctx.pools.clone(),
            })),
            "remove" => Ok(Task::Remove(Remove {
                key,
                registry: ctx.registry.clone(),
                gateway: ctx.gateway.clone(),
            })),
            _ => Err(Error::UnknownCommand(cmd)),
        }
    }

    pub async fn run(self) -> Result<String, Error> {
        match self {
            Task::Add(t) => t.run().await,
            Task::Remove(t) => t.run().await,
            Task::Invalid(e) => Err(e),
        }
    }
}

impl Add {
    async fn run(self) -> Result<String, Error> {
        let (id, created) =
            match self.registry.lookup_by_identity(&self.key).await {
                Some(id) => (id, false),
                None => (self.registry.add_user(&self.key).await?, true),
            };

        let mut leased = Vec::with_capacity(self.pools.len());
        for pool in self.pools.iter() {
            let ip = match pool.generate(id) {
                Ok(ip) => ip,
                Err(e) => return self.rollback(created, e).await,
            };
            if let Err(e) = self.gateway.permit_tunnel(&self.key, ip).await {
                return self.rollback(created, e).await;
            }
            leased.push(ip.to_string());
        }

        Ok(leased.join(" "))
    }

    /// A registration created by this task must not outlive a failed
    /// allocation: the identifier is released before the error surfaces,
    /// so no dangling identifier is left without a tunnel permission.
    async fn rollback(
        &self,
        created: bool,
        err: Error,
    ) -> Result<String, Error> {
        if created {
            if let Err(e) = self.registry.del_user(&self.key).await {
                warn!("failed to roll back user {}: {}", self.key, e);
            }
        }
        Err(err)
    }
}

impl Remove {
    async fn run(self) -> Result<String, Error> {
        // An unknown identity aborts here; there is nothing to revoke.
        let id = self.registry.del_user(&self.key).await?;

        // Revoke every permission granted to this key. A previous lease
        // may have produced one per address family.
        for handle in self.gateway.list_tunnels().await? {
            if self.gateway.describe_tunnel(handle).await? == self.key {
                self.gateway.revoke_tunnel(handle).await?;
            }
        }

        Ok(format!("removed user {} with id {}", self.key, id))
    }
}

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cjdns::{Admin, Gateway};
use crate::error::Error;
use crate::lease::Cidr;
use crate::registry::Registry;

mod session;

/// Immutable daemon configuration, built once by the binary and passed by
/// value into [`listen`].
pub struct Settings {
    pub listen: SocketAddr,
    pub password: String,
    pub cjdns_addr: IpAddr,
    pub cjdns_port: u16,
    pub cjdns_password: String,
    pub cidrs: Vec<String>,
}

/// State shared by every session and task: the user registry, the mesh
/// gateway and the configured address pools.
pub struct Context {
    pub registry: Arc<Registry>,
    pub gateway: Arc<dyn Gateway>,
    pub pools: Arc<[Cidr]>,
}

/// Parses the pools, prepares the registry, connects to the cjdns admin
/// endpoint and accepts connections forever, one session per connection.
/// Startup failures are returned to the caller; accept errors are logged
/// and skipped.
pub async fn listen(settings: Settings) -> Result<(), Error> {
    let mut pools = Vec::with_capacity(settings.cidrs.len());
    for cidr in &settings.cidrs {
        pools.push(cidr.parse::<Cidr>()?);
    }

    let registry = Arc::new(Registry::new());
    if !settings.password.is_empty() {
        registry.set_admin(&settings.password).await?;
    }

    let gateway: Arc<dyn Gateway> = Arc::new(
        Admin::connect(
            settings.cjdns_addr,
            settings.cjdns_port,
            &settings.cjdns_password,
        )
        .await?,
    );

    let listener = TcpListener::bind(settings.listen).await?;
    info!("listening on {}", settings.listen);

    let ctx = Arc::new(Context {
        registry,
        gateway,
        pools: pools.into(),
    });

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept connection: {}", e);
                continue;
            }
        };

        info!("new connection: {}", peer);
        tokio::spawn(session::handle(stream, peer, ctx.clone()));
    }
}

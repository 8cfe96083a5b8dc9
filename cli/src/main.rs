use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use meshlease::server::{self, Settings};

/// IP lease coordinator for a cjdns mesh.
#[derive(Parser)]
#[command(name = "meshlease", version)]
struct Args {
    /// Address to accept lease requests on.
    #[arg(long, default_value = "[::]:4132")]
    listen: SocketAddr,

    /// Administrator password. When empty, the administrative request
    /// form is disabled.
    #[arg(long, default_value = "")]
    password: String,

    /// Address of the cjdns admin endpoint.
    #[arg(long, default_value = "127.0.0.1")]
    cjdns_ip: IpAddr,

    /// Port of the cjdns admin endpoint.
    #[arg(long, default_value_t = 11234)]
    cjdns_port: u16,

    /// Password for the cjdns admin endpoint.
    #[arg(long, default_value = "")]
    cjdns_password: String,

    /// Address pool to lease from, in CIDR notation. Repeat for one lease
    /// per pool.
    #[arg(long = "cidr", required = true)]
    cidrs: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let settings = Settings {
        listen: args.listen,
        password: args.password,
        cjdns_addr: args.cjdns_ip,
        cjdns_port: args.cjdns_port,
        cjdns_password: args.cjdns_password,
        cidrs: args.cidrs,
    };

    if let Err(e) = server::listen(settings).await {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

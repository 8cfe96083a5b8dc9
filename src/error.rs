use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv6Addr};

use ipnet::IpNet;

use crate::cjdns::PublicKey;

/// Every failure the daemon can surface. Task execution recovers all of
/// these at the session boundary and formats them into `error` lines, so
/// the `Display` text is what clients see.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Bencode(serde_bencode::Error),
    Bcrypt(bcrypt::BcryptError),
    InvalidCidr(String),
    OutOfRange { ip: IpAddr, network: IpNet },
    NotIpv6(IpAddr),
    NotMeshAddress(Ipv6Addr),
    InvalidAddress(String),
    InvalidPublicKey(String),
    InvalidArgumentCount(usize),
    UnknownCommand(String),
    BadPassword,
    UserExists(PublicKey),
    UserNotFound(PublicKey),
    NotInTable(Ipv6Addr),
    Admin(String),
    AdminTimeout,
    SocketClosed,
    MalformedResponse(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Bcrypt(e) => write!(f, "password hash error: {}", e),
            Error::InvalidCidr(s) => write!(f, "invalid CIDR: {}", s),
            Error::OutOfRange { ip, network } => {
                write!(f, "address {} is outside of available network {}", ip, network)
            }
            Error::NotIpv6(ip) => write!(f, "{} is not an IPv6 address", ip),
            Error::NotMeshAddress(ip) => {
                write!(f, "{} is not in the cjdns address space (fc00::/8)", ip)
            }
            Error::InvalidAddress(s) => write!(f, "invalid address: {}", s),
            Error::InvalidPublicKey(s) => write!(f, "invalid public key: {}", s),
            Error::InvalidArgumentCount(n) => {
                write!(f, "invalid number of arguments: {}", n)
            }
            Error::UnknownCommand(c) => write!(f, "no task found for command: {}", c),
            Error::BadPassword => write!(f, "invalid administrator password"),
            Error::UserExists(k) => {
                write!(f, "user with public key {} already exists", k)
            }
            Error::UserNotFound(k) => {
                write!(f, "user with public key {} does not exist", k)
            }
            Error::NotInTable(ip) => {
                write!(f, "no node for {} in the cjdns routing table", ip)
            }
            Error::Admin(e) => write!(f, "cjdns admin error: {}", e),
            Error::AdminTimeout => write!(f, "cjdns admin request timed out"),
            Error::SocketClosed => write!(f, "cjdns admin socket closed"),
            Error::MalformedResponse(field) => {
                write!(f, "malformed cjdns admin response: missing {}", field)
            }
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(e: bcrypt::BcryptError) -> Self {
        Self::Bcrypt(e)
    }
}

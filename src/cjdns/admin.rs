use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::Serialize;
use serde_bencode::value::Value;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Error;
use crate::hex::HexDisplayExt;

use super::{Gateway, PublicKey};

/// Upper bound on one admin round-trip. The reference client would block
/// forever on a silent daemon; this is a deliberate hardening addition.
const ROUNDTRIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Matches the datagram buffer size of the reference client.
const RECV_BUF: usize = 69632;

/// Bencode values we put on the wire. Dictionaries are `BTreeMap`-backed
/// so their keys serialize in sorted order, as bencode requires.
#[derive(Serialize)]
#[serde(untagged)]
enum Val {
    Int(i64),
    Str(String),
    Dict(BTreeMap<&'static str, Val>),
}

type Request = BTreeMap<&'static str, Val>;
type Pending = Mutex<HashMap<String, oneshot::Sender<Result<Value, Error>>>>;

/// A connection to the cjdns admin UDP endpoint.
///
/// Requests carry a random transaction id; a single reader task decodes
/// each incoming datagram and completes the caller waiting on that id, so
/// any number of tasks can issue admin calls concurrently over the one
/// socket.
pub struct Admin {
    sock: Arc<UdpSocket>,
    password: String,
    pending: Arc<Pending>,
}

fn new_txid() -> String {
    format!("{:x}", rand::random::<u32>())
}

fn get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Dict(dict) => dict.get(key.as_bytes()),
        _ => None,
    }
}

fn get_str(value: &Value, key: &str) -> Option<String> {
    match get(value, key)? {
        Value::Bytes(bytes) => String::from_utf8(bytes.clone()).ok(),
        _ => None,
    }
}

/// Serializes an authenticated request using the cjdns two-pass scheme:
/// the `hash` field first holds sha256(password + cookie), then gets
/// replaced by the sha256 of the serialized message.
fn encode_auth(
    password: &str,
    cookie: &str,
    func: &'static str,
    args: Request,
    txid: &str,
) -> Result<Vec<u8>, Error> {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(cookie.as_bytes());
    let first = hasher.finalize().hex().to_string();

    let mut req = Request::new();
    req.insert("q", Val::Str("auth".to_string()));
    req.insert("aq", Val::Str(func.to_string()));
    if !args.is_empty() {
        req.insert("args", Val::Dict(args));
    }
    req.insert("cookie", Val::Str(cookie.to_string()));
    req.insert("hash", Val::Str(first));
    req.insert("txid", Val::Str(txid.to_string()));

    let pass_one = serde_bencode::to_bytes(&req)?;
    let hash = Sha256::digest(&pass_one).hex().to_string();
    req.insert("hash", Val::Str(hash));

    Ok(serde_bencode::to_bytes(&req)?)
}

impl Admin {
    /// Connects to the admin endpoint and verifies it answers by fetching
    /// a cookie, so an unreachable daemon fails at startup rather than on
    /// the first lease.
    pub async fn connect(
        addr: IpAddr,
        port: u16,
        password: &str,
    ) -> Result<Self, Error> {
        let bind = match addr {
            IpAddr::V4(_) => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            }
            IpAddr::V6(_) => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            }
        };
        let sock = UdpSocket::bind(bind).await?;
        sock.connect(SocketAddr::new(addr, port)).await?;

        let sock = Arc::new(sock);
        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(Self::read_loop(sock.clone(), pending.clone()));

        let admin = Self {
            sock,
            password: password.to_string(),
            pending,
        };
        admin.cookie().await?;
        debug!("connected to cjdns admin at {}:{}", addr, port);
        Ok(admin)
    }

    /// Decodes incoming datagrams and hands each to the caller waiting on
    /// its transaction id. Runs until the socket errors, at which point
    /// every pending caller is failed.
    async fn read_loop(sock: Arc<UdpSocket>, pending: Arc<Pending>) {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let n = match sock.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("cjdns admin socket closed: {}", e);
                    for (_, tx) in pending.lock().unwrap().drain() {
                        let _ = tx.send(Err(Error::SocketClosed));
                    }
                    return;
                }
            };

            let value: Value = match serde_bencode::from_bytes(&buf[..n]) {
                Ok(value) => value,
                Err(e) => {
                    warn!("undecodable cjdns admin datagram: {}", e);
                    continue;
                }
            };

            let txid = match get_str(&value, "txid") {
                Some(txid) => txid,
                None => {
                    warn!("cjdns admin response without txid");
                    continue;
                }
            };

            let result = match get_str(&value, "error") {
                Some(e) if e != "none" && !e.is_empty() => {
                    Err(Error::Admin(e))
                }
                _ => Ok(value),
            };

            if let Some(tx) = pending.lock().unwrap().remove(&txid) {
                let _ = tx.send(result);
            } else {
                debug!("cjdns admin response for unknown txid {}", txid);
            }
        }
    }

    /// Sends one serialized request and waits for the response matching
    /// `txid`, bounded by [`ROUNDTRIP_TIMEOUT`]. The pending entry is
    /// removed however this exits.
    async fn roundtrip(
        &self,
        bytes: Vec<u8>,
        txid: String,
    ) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(txid.clone(), tx);

        let exchange = async {
            self.sock.send(&bytes).await?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::SocketClosed),
            }
        };

        let result = match timeout(ROUNDTRIP_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::AdminTimeout),
        };
        self.pending.lock().unwrap().remove(&txid);
        result
    }

    async fn cookie(&self) -> Result<String, Error> {
        let txid = new_txid();
        let mut req = Request::new();
        req.insert("q", Val::Str("cookie".to_string()));
        req.insert("txid", Val::Str(txid.clone()));

        let bytes = serde_bencode::to_bytes(&req)?;
        let value = self.roundtrip(bytes, txid).await?;
        get_str(&value, "cookie").ok_or(Error::MalformedResponse("cookie"))
    }

    /// Issues an authenticated admin function call.
    async fn call(
        &self,
        func: &'static str,
        args: Request,
    ) -> Result<Value, Error> {
        let cookie = self.cookie().await?;
        let txid = new_txid();
        let bytes =
            encode_auth(&self.password, &cookie, func, args, &txid)?;
        self.roundtrip(bytes, txid).await
    }
}

#[async_trait]
impl Gateway for Admin {
    async fn resolve_identity(
        &self,
        addr: Ipv6Addr,
    ) -> Result<PublicKey, Error> {
        let mut args = Request::new();
        args.insert("ip", Val::Str(addr.to_string()));
        let resp = self.call("NodeStore_nodeForAddr", args).await?;

        let result =
            get(&resp, "result").ok_or(Error::MalformedResponse("result"))?;
        let key = get_str(result, "key").ok_or(Error::NotInTable(addr))?;
        key.parse()
    }

    async fn permit_tunnel(
        &self,
        key: &PublicKey,
        addr: IpAddr,
    ) -> Result<(), Error> {
        let field = match addr {
            IpAddr::V4(_) => "ip4Address",
            IpAddr::V6(_) => "ip6Address",
        };
        let mut args = Request::new();
        args.insert(field, Val::Str(addr.to_string()));
        args.insert(
            "publicKeyOfAuthorizedNode",
            Val::Str(key.to_string()),
        );
        self.call("IpTunnel_allowConnection", args).await?;
        Ok(())
    }

    async fn list_tunnels(&self) -> Result<Vec<i64>, Error> {
        let resp = self.call("IpTunnel_listConnections", Request::new()).await?;
        match get(&resp, "connections") {
            Some(Value::List(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Int(i) => Ok(*i),
                    _ => Err(Error::MalformedResponse("connections")),
                })
                .collect(),
            _ => Err(Error::MalformedResponse("connections")),
        }
    }

    async fn describe_tunnel(&self, handle: i64) -> Result<PublicKey, Error> {
        let mut args = Request::new();
        args.insert("connection", Val::Int(handle));
        let resp = self.call("IpTunnel_showConnection", args).await?;

        let key = get_str(&resp, "key").ok_or(Error::MalformedResponse("key"))?;
        key.parse()
    }

    async fn revoke_tunnel(&self, handle: i64) -> Result<(), Error> {
        let mut args = Request::new();
        args.insert("connection", Val::Int(handle));
        self.call("IpTunnel_removeConnection", args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_serialize_with_sorted_keys() {
        let mut req = Request::new();
        req.insert("txid", Val::Str("abcd".to_string()));
        req.insert("q", Val::Str("cookie".to_string()));

        let bytes = serde_bencode::to_bytes(&req).unwrap();
        assert_eq!(bytes, b"d1:q6:cookie4:txid4:abcde");
    }

    #[test]
    fn auth_requests_carry_the_two_pass_hash() {
        let mut args = Request::new();
        args.insert("ip", Val::Str("fc00::1".to_string()));
        let bytes = encode_auth(
            "adminpw",
            "1695",
            "NodeStore_nodeForAddr",
            args,
            "cafe",
        )
        .unwrap();

        // Sorted keys put aq first.
        assert!(bytes.starts_with(b"d2:aq21:NodeStore_nodeForAddr"));

        let value: Value = serde_bencode::from_bytes(&bytes).unwrap();
        assert_eq!(get_str(&value, "q").unwrap(), "auth");
        assert_eq!(get_str(&value, "cookie").unwrap(), "1695");
        assert_eq!(get_str(&value, "txid").unwrap(), "cafe");

        let hash = get_str(&value, "hash").unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));

        // The final hash is the digest of the message carrying the
        // password+cookie hash, so it cannot equal that first-pass value.
        let mut hasher = Sha256::new();
        hasher.update(b"adminpw");
        hasher.update(b"1695");
        assert_ne!(hash, hasher.finalize().hex().to_string());
    }

    #[test]
    fn envelope_extraction() {
        let value: Value =
            serde_bencode::from_bytes(b"d6:cookie4:17454:txid8:deadbeefe")
                .unwrap();
        assert_eq!(get_str(&value, "cookie").unwrap(), "1745");
        assert_eq!(get_str(&value, "txid").unwrap(), "deadbeef");
        assert!(get_str(&value, "error").is_none());
    }

    #[test]
    fn txid_is_short_lowercase_hex() {
        let txid = new_txid();
        assert!(!txid.is_empty() && txid.len() <= 8);
        assert!(txid
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }
}

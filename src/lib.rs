pub mod cjdns;
pub mod error;
pub mod lease;
pub mod registry;
pub mod server;
pub mod task;

mod hex;

//! Reuters-style session feed: SOFH-framed SBE over TCP with a negotiate / establish /
//! terminate handshake, per-session subscriptions and heartbeats.

pub mod messages;
pub mod schema;
pub mod server;
pub mod session;
pub mod sofh;

pub use server::{ServerConfig, ServerStats, SessionServer};
pub use session::{Credential, CredentialStore, Session, SessionState};

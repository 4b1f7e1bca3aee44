//! Pigeon peer node: registers with the directory, accepts inbound sessions,
//! and sends one-shot outbound messages.

pub mod acceptor;
pub mod config;
pub mod directory_client;
pub mod node;
pub mod state;

pub use acceptor::{Acceptor, InboundMessage};
pub use config::Config;
pub use directory_client::{DirectoryClient, DirectoryClientError};
pub use node::{PeerNode, ResolveError, SendError};

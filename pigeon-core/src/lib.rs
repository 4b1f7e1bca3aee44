//! Pigeon protocol reference implementation.
//! Host-driven: no sockets here; the daemons own all I/O and call into these types.

pub mod contacts;
pub mod history;
pub mod policy;
pub mod proto;
pub mod registry;
pub mod wire;

pub use contacts::{ContactCache, ContactEntry, STALE_AFTER};
pub use history::{Direction, HistoryEntry, MessageHistory};
pub use policy::{PolicyDecision, PolicyState};
pub use proto::{
    DirectoryRequest, DirectoryResponse, PeerRequest, PeerResponse, SessionId, Status,
    ERROR_CODE_USERNAME_TAKEN,
};
pub use registry::{IdentityRecord, QueryKind, RegisterError, RegistryStore};
pub use wire::{decode_line, encode_line, WireError};

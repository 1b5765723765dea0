//! Process-wide registries.
//!
//! Each registry exposes a narrow transactional interface and owns its
//! lock; no data structure here is mutated from outside its own module.
//! Locks are never held across an await.

pub mod channels;
pub mod chunks;
pub mod relay;
pub mod rendezvous;

pub use channels::ChannelRegistry;
pub use chunks::ChunkIndex;
pub use relay::RelayRegistry;
pub use rendezvous::RendezvousRegistry;

/// Registry-level failures (storage is the only fallible backend).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("registry is shutting down")]
    ShuttingDown,
}

//! C8 — scheduled puller, integrity checker, delta patcher, atomic
//! installer into the vector store and metadata store.

pub mod manager;
pub mod source;

pub use manager::VkpLifecycleManager;
pub use source::{ChunkDto, HttpVkpSource, RemoteVkpSource, VkpPackage};

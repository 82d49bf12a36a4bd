//! C1 — durable store of users, sessions, subjects, books, VKP installations,
//! and chat history.

pub mod models;
pub mod store;

pub use models::{Book, ChatEntry, Role, Session, Subject, User, VkpInstallationRecord};
pub use store::{MetadataStore, SharedMetadataStore, SqliteMetadataStore};

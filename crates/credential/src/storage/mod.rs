//! Encrypted in-memory storage for decrypted-on-demand key material

mod memory;

pub use memory::{SecureMemoryStorage, StorageStats};

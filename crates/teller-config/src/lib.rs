//! Teller Config - versioned configuration bundles
//!
//! This crate provides:
//! - `ConfigSnapshotProvider`: publish/fetch/long-poll of immutable bundle versions
//! - `BundleStore`: durable store collaborator with memory and file implementations

pub mod persistence;
pub mod provider;

pub use persistence::{BundleStore, FileBundleStore, MemoryBundleStore};
pub use provider::ConfigSnapshotProvider;

//! The vault's hierarchical SHA-256 content hash.
//!
//! Data is split into fixed-size leaves (1 MiB in the vault's wire format,
//! configurable here for testing), each leaf is hashed with SHA-256, and
//! adjacent digests are then repeatedly paired and hashed bottom-up until a
//! single root digest remains. An odd node at any level is carried up
//! unmodified rather than being paired with itself.

mod digest;
mod hasher;

pub use digest::{DigestParseError, TreeDigest};
pub use hasher::{combine, compute, leaf_digests, verify, TreeHashOutput, TreeHasher};

/// Leaf size used by the vault service: 1 MiB.
pub const DEFAULT_LEAF_SIZE: usize = 1024 * 1024;

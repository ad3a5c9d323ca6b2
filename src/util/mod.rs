//! Small shared utilities

pub mod ip_hash;

pub use ip_hash::IpHasher;

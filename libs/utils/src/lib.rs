//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

// async timed retries with exponential backoff
pub mod backoff;

// AES buffer encryption for the management envelope
pub mod crypto;

// logging init for the binaries
pub mod logging;

// Postgres log sequence numbers
pub mod lsn;

// disk/network token buckets
pub mod rate_limit;

//! Shared infrastructure for the Vitrine engine: wire-level error plumbing,
//! the logging facade and clock/identifier helpers used by every other crate
//! in the workspace.

pub const PROTOCOL_ID: u16 = 0x0b17;

/// One-byte node identifier, unique within a replica set.
pub type NodeId = u8;

/// Per-channel transaction identifier. Zero is reserved for system messages.
pub type Tid = u64;

/// Per-connection numeric alias for a content-service-path.
pub type Cid = u64;

pub mod logging;
pub mod shared;
pub mod time;

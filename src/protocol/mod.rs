//! WebSocket protocol message types.
//!
//! This module defines the envelope exchanged with the remote end.
//! Only control frames are interpreted; application payloads stay opaque
//! JSON objects identified by their `id` field.
//!
//! # Protocol Overview
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `ack` | Both | Confirms delivery of an `ack_required` message |
//! | `ping` | Local → Remote (or reverse) | Liveness probe |
//! | `pong` | Remote → Local (or reverse) | Liveness reply |
//! | other | Both | Application message |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope decoding and control frame encoding.
pub mod envelope;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{ControlFrame, Envelope, InboundMessage, now_millis, stamp_outbound};

//! Observer-facing types published by the orchestrator.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them over whatever bus they use (stdout, a UI bridge, a socket).

pub mod events;

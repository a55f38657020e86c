//! Process-level integration
//!
//! Hooks that live for the whole process rather than a single session.

pub mod crash;

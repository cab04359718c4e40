//! Small cross-cutting helpers that don't belong to any one subsystem.

pub mod version;

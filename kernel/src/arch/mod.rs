//! Architecture support. 32-bit x86 only (§1 Non-goals: no multi-arch
//! abstraction layer).

pub mod x86;

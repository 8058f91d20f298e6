//! Architecture support for Kestrel.

pub mod aarch64;

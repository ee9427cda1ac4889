//! # Core Types
//!
//! Shared primitive types used throughout the engine: target addresses,
//! core registers, and byte-order markers.
//!
//! These types are intentionally small and cheap to copy. They show up in
//! almost every public signature, so they live in their own module rather
//! than being scattered across the components that first needed them.

pub mod address;
pub mod registers;

pub use address::Address;
pub use registers::{CoreRegister, RegisterFile};

use serde::{Deserialize, Serialize};

/// Byte order of the connected target.
///
/// Every value read from or written to target memory is interpreted with
/// this byte order. It is fixed per session and comes from the session
/// configuration, not from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness
{
    /// Least-significant byte first. The common case for Cortex-M parts.
    #[default]
    Little,
    /// Most-significant byte first.
    Big,
}

impl std::fmt::Display for Endianness
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::Little => write!(f, "little"),
            Self::Big => write!(f, "big"),
        }
    }
}

impl std::str::FromStr for Endianness
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str()
        {
            "little" | "le" => Ok(Self::Little),
            "big" | "be" => Ok(Self::Big),
            other => Err(format!("Invalid endianness: {other}")),
        }
    }
}

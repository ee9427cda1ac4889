//! # Target Addresses
//!
//! Strongly-typed wrapper for addresses in the target's memory space.
//!
//! Using a newtype instead of a bare `u64` keeps host-side byte counts and
//! target-side addresses from being mixed up in arithmetic, which is an easy
//! mistake to make in code that is constantly converting between the two.

/// An address in the target's memory space.
///
/// Addresses are stored as `u64` even though Cortex-M targets are 32-bit,
/// so that symbol files for wider targets load without truncation. Values
/// are displayed in fixed-width hex.
///
/// ## Example
///
/// ```
/// use ontarget_core::types::Address;
///
/// let base = Address::new(0x2000_0000);
/// let field = base + 0x10;
/// assert_eq!(field.value(), 0x2000_0010);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The zero address.
    pub const ZERO: Self = Self(0);

    /// Creates a new address from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Self(value)
    }

    /// Returns the raw address value.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Returns the address with the Thumb bit (bit 0) cleared.
    ///
    /// ELF symbol tables for Thumb code carry the interworking bit in the
    /// symbol value. Breakpoints and the program counter want the real
    /// instruction address, which is always halfword aligned.
    #[must_use]
    pub const fn code_address(self) -> Self
    {
        Self(self.0 & !1)
    }

    /// Checked addition. Returns `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, offset: u64) -> Option<Self>
    {
        match self.0.checked_add(offset)
        {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Checked subtraction. Returns `None` on underflow.
    #[must_use]
    pub const fn checked_sub(self, offset: u64) -> Option<Self>
    {
        match self.0.checked_sub(offset)
        {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Saturating addition. Clamps at `u64::MAX`.
    #[must_use]
    pub const fn saturating_add(self, offset: u64) -> Self
    {
        Self(self.0.saturating_add(offset))
    }

    /// Rounds the address down to the given power-of-two alignment.
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self
    {
        Self(self.0 & !(align - 1))
    }

    /// Returns `true` if the address is aligned to `align` bytes.
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool
    {
        self.0 % align == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl std::fmt::Display for Address
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "0x{:08x}", self.0)
    }
}

impl std::ops::Add<u64> for Address
{
    type Output = Self;

    fn add(self, offset: u64) -> Self
    {
        Self(self.0.wrapping_add(offset))
    }
}

impl std::ops::Sub<u64> for Address
{
    type Output = Self;

    fn sub(self, offset: u64) -> Self
    {
        Self(self.0.wrapping_sub(offset))
    }
}

impl std::ops::Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, other: Address) -> u64
    {
        self.0.wrapping_sub(other.0)
    }
}

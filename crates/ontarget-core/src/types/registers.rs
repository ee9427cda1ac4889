//! # Core Registers
//!
//! The Armv7-M integer register file as seen through a debug adapter:
//! `r0`-`r12`, `sp`, `lr`, `pc` and `xpsr`.

/// One core register of an Armv7-M target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CoreRegister
{
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
    Xpsr,
}

impl CoreRegister
{
    /// All registers in adapter transfer order.
    pub const ALL: [Self; 17] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::Sp,
        Self::Lr,
        Self::Pc,
        Self::Xpsr,
    ];

    /// Index of this register in a [`RegisterFile`].
    #[must_use]
    pub const fn index(self) -> usize
    {
        self as usize
    }

    /// Canonical lowercase name, e.g. `"r0"` or `"xpsr"`.
    #[must_use]
    pub const fn name(self) -> &'static str
    {
        match self
        {
            Self::R0 => "r0",
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::R3 => "r3",
            Self::R4 => "r4",
            Self::R5 => "r5",
            Self::R6 => "r6",
            Self::R7 => "r7",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::Sp => "sp",
            Self::Lr => "lr",
            Self::Pc => "pc",
            Self::Xpsr => "xpsr",
        }
    }

    /// Argument registers of the 32-bit Arm procedure call standard.
    pub const ARGUMENT: [Self; 4] = [Self::R0, Self::R1, Self::R2, Self::R3];
}

impl std::fmt::Display for CoreRegister
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CoreRegister
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str()
        {
            "r0" => Ok(Self::R0),
            "r1" => Ok(Self::R1),
            "r2" => Ok(Self::R2),
            "r3" => Ok(Self::R3),
            "r4" => Ok(Self::R4),
            "r5" => Ok(Self::R5),
            "r6" => Ok(Self::R6),
            "r7" => Ok(Self::R7),
            "r8" => Ok(Self::R8),
            "r9" => Ok(Self::R9),
            "r10" => Ok(Self::R10),
            "r11" => Ok(Self::R11),
            "r12" => Ok(Self::R12),
            "sp" | "r13" => Ok(Self::Sp),
            "lr" | "r14" => Ok(Self::Lr),
            "pc" | "r15" => Ok(Self::Pc),
            "xpsr" | "psr" => Ok(Self::Xpsr),
            other => Err(format!("Unknown register: {other}")),
        }
    }
}

/// Thumb state bit in the xPSR (EPSR.T).
pub const XPSR_THUMB_BIT: u32 = 1 << 24;

/// IT/ICI state bits in the xPSR: bits \[26:25\] and \[15:10\].
///
/// When any of these are set the core is inside an IT block (or a
/// load/store-multiple was interrupted). A context built for a synthetic
/// call must have them clear, and a halt must not leave the core parked
/// in the middle of an IT block.
pub const XPSR_IT_MASK: u32 = (0b11 << 25) | (0b11_1111 << 10);

/// Returns `true` if the given xPSR value has IT/ICI execution state bits set.
#[must_use]
pub const fn xpsr_in_it_block(xpsr: u32) -> bool
{
    xpsr & XPSR_IT_MASK != 0
}

/// Renders the xPSR fields for log and error messages, e.g.
/// `"N=0 Z=1 C=0 V=0 Q=0 T=1 IT/ICI=0x00 EXC=3"`.
///
/// `EXC` is the active exception number from the IPSR part; zero means
/// thread mode.
#[must_use]
pub fn describe_xpsr(xpsr: u32) -> String
{
    let flag = |bit: u32| (xpsr >> bit) & 1;
    let it = (((xpsr >> 10) & 0b11_1111) << 2) | ((xpsr >> 25) & 0b11);
    format!(
        "N={} Z={} C={} V={} Q={} T={} IT/ICI=0x{it:02x} EXC={}",
        flag(31),
        flag(30),
        flag(29),
        flag(28),
        flag(27),
        flag(24),
        xpsr & 0x1ff
    )
}

/// A full snapshot of the integer register file.
///
/// This is the unit of context save and restore around synthetic calls:
/// the engine captures one of these before touching the target and writes
/// it back verbatim afterwards.
///
/// ## Example
///
/// ```
/// use ontarget_core::types::{CoreRegister, RegisterFile};
///
/// let mut regs = RegisterFile::default();
/// regs.set(CoreRegister::R0, 42);
/// assert_eq!(regs.get(CoreRegister::R0), 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterFile
{
    words: [u32; 17],
}

impl RegisterFile
{
    /// Creates a register file from raw words in [`CoreRegister::ALL`] order.
    #[must_use]
    pub const fn from_words(words: [u32; 17]) -> Self
    {
        Self { words }
    }

    /// Returns the raw words in [`CoreRegister::ALL`] order.
    #[must_use]
    pub const fn words(&self) -> &[u32; 17]
    {
        &self.words
    }

    /// Reads a single register.
    #[must_use]
    pub const fn get(&self, register: CoreRegister) -> u32
    {
        self.words[register.index()]
    }

    /// Writes a single register.
    pub fn set(&mut self, register: CoreRegister, value: u32)
    {
        self.words[register.index()] = value;
    }

    /// The program counter.
    #[must_use]
    pub const fn pc(&self) -> u32
    {
        self.get(CoreRegister::Pc)
    }

    /// The stack pointer.
    #[must_use]
    pub const fn sp(&self) -> u32
    {
        self.get(CoreRegister::Sp)
    }

    /// The link register.
    #[must_use]
    pub const fn lr(&self) -> u32
    {
        self.get(CoreRegister::Lr)
    }

    /// The program status register.
    #[must_use]
    pub const fn xpsr(&self) -> u32
    {
        self.get(CoreRegister::Xpsr)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_register_roundtrip_by_name()
    {
        for reg in CoreRegister::ALL
        {
            let parsed: CoreRegister = reg.name().parse().unwrap();
            assert_eq!(parsed, reg);
        }
    }

    #[test]
    fn test_register_aliases()
    {
        assert_eq!("r13".parse::<CoreRegister>().unwrap(), CoreRegister::Sp);
        assert_eq!("R15".parse::<CoreRegister>().unwrap(), CoreRegister::Pc);
        assert!("r17".parse::<CoreRegister>().is_err());
    }

    #[test]
    fn test_it_block_detection()
    {
        assert!(!xpsr_in_it_block(XPSR_THUMB_BIT));
        assert!(xpsr_in_it_block(XPSR_THUMB_BIT | (1 << 25)));
        assert!(xpsr_in_it_block(XPSR_THUMB_BIT | (1 << 12)));
    }

    #[test]
    fn test_xpsr_description()
    {
        let desc = describe_xpsr(XPSR_THUMB_BIT | (1 << 30) | 3);
        assert_eq!(desc, "N=0 Z=1 C=0 V=0 Q=0 T=1 IT/ICI=0x00 EXC=3");
    }
}

//! # Symbols and Debug Info
//!
//! Resolution of names to target addresses and of type names to exact
//! in-memory layouts.
//!
//! Addresses come from the ELF symbol table; layouts come from DWARF.
//! Layouts are always taken verbatim from the compiler's debug info. The
//! engine never guesses a struct offset or recomputes padding from first
//! principles, because the compiler that built the firmware is the only
//! authority on how it laid out memory.

pub mod image;
pub mod layout;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use object::{Object, ObjectSymbol};
use tracing::{debug, trace};

use crate::error::{OnTargetError, OnTargetResult};
use crate::types::Address;

pub use image::{Image, Location};
pub use layout::{FunctionSignature, ScalarKind, StructField, TypeLayout};

/// What kind of thing a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind
{
    /// Executable code.
    Function,
    /// A data object.
    Object,
    /// Anything else (sections, file symbols, absolute values).
    Other,
}

/// One entry from an ELF symbol table.
#[derive(Debug, Clone)]
pub struct Symbol
{
    /// Linkage name as it appears in the symbol table.
    pub name: String,
    /// Demangled name, when the linkage name was mangled.
    pub demangled: Option<String>,
    /// Target address. For functions this is the instruction address with
    /// the Thumb bit already cleared.
    pub address: Address,
    /// Size in bytes, or zero when the symbol table does not say.
    pub size: u64,
    /// Symbol kind.
    pub kind: SymbolKind,
}

impl Symbol
{
    /// The name to show a human: demangled when available.
    #[must_use]
    pub fn display_name(&self) -> &str
    {
        self.demangled.as_deref().unwrap_or(&self.name)
    }
}

/// Name and address lookup over the symbols of one or more images.
///
/// Lookups by name use the linkage name. Lookups by address find the
/// symbol whose `[address, address + size)` range contains the query,
/// falling back to the nearest preceding symbol when sizes are absent.
#[derive(Debug, Default)]
pub struct SymbolTable
{
    by_name: HashMap<String, Arc<Symbol>>,
    by_address: BTreeMap<u64, Arc<Symbol>>,
}

impl SymbolTable
{
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Builds a table from the symbol table of a parsed object file.
    ///
    /// Thumb interworking bits on function symbols are cleared so that
    /// the stored address is the real instruction address.
    ///
    /// ## Errors
    ///
    /// Returns an error if a symbol name cannot be read from the file.
    pub fn from_object(file: &object::File<'_>) -> OnTargetResult<Self>
    {
        let mut table = Self::new();
        for symbol in file.symbols()
        {
            if !symbol.is_definition()
            {
                continue;
            }
            let name = symbol.name().map_err(|err| OnTargetError::DebugInfo {
                context: "reading ELF symbol table".to_string(),
                details: err.to_string(),
            })?;
            if name.is_empty()
            {
                continue;
            }
            let kind = match symbol.kind()
            {
                object::SymbolKind::Text => SymbolKind::Function,
                object::SymbolKind::Data => SymbolKind::Object,
                _ => SymbolKind::Other,
            };
            let address = if kind == SymbolKind::Function
            {
                Address::new(symbol.address()).code_address()
            }
            else
            {
                Address::new(symbol.address())
            };
            let demangled = demangle(name);
            table.insert(Symbol {
                name: name.to_string(),
                demangled,
                address,
                size: symbol.size(),
                kind,
            });
        }
        debug!(symbols = table.len(), "built symbol table");
        Ok(table)
    }

    /// Adds one symbol, replacing any previous entry with the same name.
    pub fn insert(&mut self, symbol: Symbol)
    {
        let symbol = Arc::new(symbol);
        self.by_address.insert(symbol.address.value(), Arc::clone(&symbol));
        self.by_name.insert(symbol.name.clone(), symbol);
    }

    /// Looks a symbol up by linkage name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Arc<Symbol>>
    {
        self.by_name.get(name)
    }

    /// Looks a symbol up by linkage name, failing with
    /// [`OnTargetError::UnknownSymbol`] when absent.
    pub fn resolve(&self, name: &str) -> OnTargetResult<Arc<Symbol>>
    {
        self.lookup(name)
            .cloned()
            .ok_or_else(|| OnTargetError::UnknownSymbol { name: name.to_string() })
    }

    /// Finds the symbol covering an address.
    #[must_use]
    pub fn containing(&self, address: Address) -> Option<&Arc<Symbol>>
    {
        let (_, symbol) = self.by_address.range(..=address.value()).next_back()?;
        if symbol.size > 0 && address.value() >= symbol.address.value() + symbol.size
        {
            trace!(%address, nearest = %symbol.name, "address past nearest symbol");
            return None;
        }
        Some(symbol)
    }

    /// Merges another table into this one, offsetting every incoming
    /// address. Used to add bootloader symbols at their load address.
    pub fn merge(&mut self, other: &Self, offset: u64)
    {
        for symbol in other.by_name.values()
        {
            let mut moved = (**symbol).clone();
            moved.address = moved.address + offset;
            self.insert(moved);
        }
    }

    /// Iterates all symbols in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Symbol>>
    {
        self.by_address.values()
    }

    /// Number of symbols in the table.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.by_name.len()
    }

    /// Returns `true` if the table has no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.by_name.is_empty()
    }
}

/// Demangles a linkage name, returning `None` when it was not mangled.
#[must_use]
pub fn demangle(name: &str) -> Option<String>
{
    rustc_demangle::try_demangle(name).ok().map(|d| d.to_string())
}

/// Converts a DWARF parser error into a crate error with context.
pub(crate) fn map_dwarf_error(context: &str, err: gimli::Error) -> OnTargetError
{
    OnTargetError::DebugInfo { context: context.to_string(), details: err.to_string() }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sym(name: &str, address: u64, size: u64, kind: SymbolKind) -> Symbol
    {
        Symbol { name: name.to_string(), demangled: None, address: Address::new(address), size, kind }
    }

    #[test]
    fn test_containing_respects_sizes()
    {
        let mut table = SymbolTable::new();
        table.insert(sym("example_Addition", 0x0800_0100, 0x20, SymbolKind::Function));
        table.insert(sym("example_NoArgs", 0x0800_0140, 0x10, SymbolKind::Function));

        let hit = table.containing(Address::new(0x0800_0110)).unwrap();
        assert_eq!(hit.name, "example_Addition");

        // Past the end of example_Addition but before example_NoArgs.
        assert!(table.containing(Address::new(0x0800_0130)).is_none());
        assert!(table.containing(Address::new(0x0800_00ff)).is_none());
    }

    #[test]
    fn test_merge_applies_offset()
    {
        let mut bl = SymbolTable::new();
        bl.insert(sym("bl_start", 0x100, 0x10, SymbolKind::Function));

        let mut table = SymbolTable::new();
        table.merge(&bl, 0x0800_0000);
        assert_eq!(table.resolve("bl_start").unwrap().address.value(), 0x0800_0100);
    }

    #[test]
    fn test_resolve_unknown_symbol()
    {
        let table = SymbolTable::new();
        match table.resolve("nope")
        {
            Err(OnTargetError::UnknownSymbol { name }) => assert_eq!(name, "nope"),
            other => panic!("Expected UnknownSymbol, got {other:?}"),
        }
    }
}

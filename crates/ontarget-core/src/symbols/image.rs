//! # Loaded Images
//!
//! An [`Image`] is one ELF file's worth of symbols and debug info: the
//! symbol table for addresses, DWARF for type layouts and function
//! signatures, and line info for describing arbitrary addresses.
//!
//! Parsing is lazy. The symbol table is built up front because every
//! session needs it; DWARF units and layouts are only parsed the first
//! time a type or function query needs them, and the results are cached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use object::{Object, ObjectSection};
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use super::layout::{FunctionSignature, LayoutReader, TypeLayout};
use super::{map_dwarf_error, SymbolTable};
use crate::error::{OnTargetError, OnTargetResult};
use crate::types::{Address, Endianness};

/// Reader over reference-counted section bytes.
pub(crate) type DwarfReader = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// DWARF sections worth pulling out of an ELF.
const DWARF_SECTION_NAMES: [&str; 12] = [
    ".debug_abbrev",
    ".debug_addr",
    ".debug_aranges",
    ".debug_info",
    ".debug_line",
    ".debug_line_str",
    ".debug_loc",
    ".debug_loclists",
    ".debug_ranges",
    ".debug_rnglists",
    ".debug_str",
    ".debug_str_offsets",
];

/// A source-level description of a target address.
#[derive(Debug, Clone, Default)]
pub struct Location
{
    /// Enclosing function, when known.
    pub function: Option<String>,
    /// Source file, when known.
    pub file: Option<String>,
    /// Source line, when known.
    pub line: Option<u32>,
}

impl std::fmt::Display for Location
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match (&self.function, &self.file, self.line)
        {
            (Some(function), Some(file), Some(line)) => write!(f, "{function} ({file}:{line})"),
            (Some(function), _, _) => write!(f, "{function}"),
            (None, Some(file), Some(line)) => write!(f, "{file}:{line}"),
            _ => write!(f, "<unknown>"),
        }
    }
}

/// Symbols and debug info from one ELF file.
pub struct Image
{
    path: PathBuf,
    endianness: Endianness,
    symbols: SymbolTable,
    debug_sections: HashMap<&'static str, Arc<[u8]>>,
    dwarf_cache: OnceCell<gimli::Dwarf<DwarfReader>>,
    units_cache: OnceCell<Vec<gimli::Unit<DwarfReader>>>,
    layout_cache: RwLock<HashMap<String, Arc<TypeLayout>>>,
    signature_cache: RwLock<HashMap<String, Arc<FunctionSignature>>>,
}

impl std::fmt::Debug for Image
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("endianness", &self.endianness)
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

impl Image
{
    /// Parses an ELF file from disk.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::Load`] if the file cannot be read or is
    /// not a valid object file.
    pub fn from_elf(path: impl AsRef<Path>) -> OnTargetResult<Self>
    {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|err| OnTargetError::Load {
            image: path.clone(),
            details: err.to_string(),
        })?;
        let file = object::File::parse(&*data).map_err(|err| OnTargetError::Load {
            image: path.clone(),
            details: format!("not a valid object file: {err}"),
        })?;

        let endianness =
            if file.is_little_endian() { Endianness::Little } else { Endianness::Big };
        let symbols = SymbolTable::from_object(&file)?;

        let mut debug_sections = HashMap::new();
        for name in DWARF_SECTION_NAMES
        {
            let Some(section) = file.section_by_name(name)
            else
            {
                continue;
            };
            let bytes = section.uncompressed_data().map_err(|err| OnTargetError::Load {
                image: path.clone(),
                details: format!("cannot read section {name}: {err}"),
            })?;
            trace!(section = name, len = bytes.len(), "loaded debug section");
            debug_sections.insert(name, Arc::from(bytes.into_owned()));
        }

        debug!(path = %path.display(), sections = debug_sections.len(), "parsed image");
        Ok(Self::from_parts(path, endianness, symbols, debug_sections))
    }

    /// Assembles an image from already-parsed pieces.
    ///
    /// This is how images that did not come from an ELF on disk enter the
    /// engine, e.g. synthetic debug info in the test suite.
    #[must_use]
    pub fn from_parts(
        path: impl Into<PathBuf>,
        endianness: Endianness,
        symbols: SymbolTable,
        debug_sections: HashMap<&'static str, Arc<[u8]>>,
    ) -> Self
    {
        Self {
            path: path.into(),
            endianness,
            symbols,
            debug_sections,
            dwarf_cache: OnceCell::new(),
            units_cache: OnceCell::new(),
            layout_cache: RwLock::new(HashMap::new()),
            signature_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Path this image was loaded from.
    #[must_use]
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Byte order of the file.
    #[must_use]
    pub const fn endianness(&self) -> Endianness
    {
        self.endianness
    }

    /// Symbol table of the file.
    #[must_use]
    pub const fn symbols(&self) -> &SymbolTable
    {
        &self.symbols
    }

    fn section_reader(&self, id: gimli::SectionId) -> DwarfReader
    {
        let endian = match self.endianness
        {
            Endianness::Little => gimli::RunTimeEndian::Little,
            Endianness::Big => gimli::RunTimeEndian::Big,
        };
        let bytes = self
            .debug_sections
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()));
        gimli::EndianArcSlice::new(bytes, endian)
    }

    fn dwarf(&self) -> OnTargetResult<&gimli::Dwarf<DwarfReader>>
    {
        self.dwarf_cache
            .get_or_try_init(|| {
                gimli::Dwarf::load(|section| -> Result<DwarfReader, gimli::Error> {
                    Ok(self.section_reader(section))
                })
            })
            .map_err(|e| map_dwarf_error("loading DWARF sections", e))
    }

    fn units(&self) -> OnTargetResult<&[gimli::Unit<DwarfReader>]>
    {
        let units = self.units_cache.get_or_try_init(|| -> OnTargetResult<_> {
            let dwarf = self.dwarf()?;
            let mut units = Vec::new();
            let mut headers = dwarf.units();
            while let Some(header) =
                headers.next().map_err(|e| map_dwarf_error("iterating units", e))?
            {
                units.push(
                    dwarf.unit(header).map_err(|e| map_dwarf_error("parsing unit", e))?,
                );
            }
            debug!(path = %self.path.display(), units = units.len(), "parsed DWARF units");
            Ok(units)
        })?;
        Ok(units)
    }

    /// Reads the layout of a named type from this image's debug info.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::UnknownSymbol`] when the image has no
    /// type of that name, or [`OnTargetError::DebugInfo`] when the DWARF
    /// cannot be interpreted.
    pub fn type_layout(&self, name: &str) -> OnTargetResult<Arc<TypeLayout>>
    {
        if let Ok(cache) = self.layout_cache.read()
        {
            if let Some(hit) = cache.get(name)
            {
                return Ok(Arc::clone(hit));
            }
        }
        let reader = LayoutReader::new(self.dwarf()?, self.units()?);
        let layout = reader
            .find_type(name)?
            .ok_or_else(|| OnTargetError::UnknownSymbol { name: name.to_string() })?;
        let layout = Arc::new(layout);
        if let Ok(mut cache) = self.layout_cache.write()
        {
            cache.insert(name.to_string(), Arc::clone(&layout));
        }
        Ok(layout)
    }

    /// Size in bytes of a named type.
    ///
    /// ## Errors
    ///
    /// Same failure modes as [`Image::type_layout`].
    pub fn sizeof(&self, name: &str) -> OnTargetResult<u64>
    {
        Ok(self.type_layout(name)?.size())
    }

    /// Reads the signature of a named function from debug info.
    ///
    /// ## Errors
    ///
    /// Returns [`OnTargetError::UnknownSymbol`] when no function of that
    /// name is defined in this image.
    pub fn function_signature(&self, name: &str) -> OnTargetResult<Arc<FunctionSignature>>
    {
        if let Ok(cache) = self.signature_cache.read()
        {
            if let Some(hit) = cache.get(name)
            {
                return Ok(Arc::clone(hit));
            }
        }
        let reader = LayoutReader::new(self.dwarf()?, self.units()?);
        let signature = reader
            .find_function(name)?
            .ok_or_else(|| OnTargetError::UnknownSymbol { name: name.to_string() })?;
        let signature = Arc::new(signature);
        if let Ok(mut cache) = self.signature_cache.write()
        {
            cache.insert(name.to_string(), Arc::clone(&signature));
        }
        Ok(signature)
    }

    /// Describes an address in source terms, for diagnostics.
    ///
    /// Falls back to the symbol table when line info is unavailable, and
    /// returns `None` when the address is not covered by this image.
    #[must_use]
    pub fn locate(&self, address: Address) -> Option<Location>
    {
        if let Some(found) = self.locate_via_line_info(address)
        {
            return Some(found);
        }
        self.symbols.containing(address).map(|symbol| Location {
            function: Some(symbol.display_name().to_string()),
            file: None,
            line: None,
        })
    }

    fn locate_via_line_info(&self, address: Address) -> Option<Location>
    {
        // The symbolication context is cheap to build relative to how
        // rarely diagnostics need it, and keeping one around would make
        // the image unshareable across threads.
        let ctx = addr2line::Context::from_dwarf(self.dwarf().ok()?.borrow(Clone::clone)).ok()?;
        let mut frames = ctx.find_frames(address.value()).skip_all_loads().ok()?;
        let mut best: Option<Location> = None;
        while let Ok(Some(frame)) = frames.next()
        {
            let function = frame
                .function
                .as_ref()
                .and_then(|name| name.raw_name().ok())
                .map(|name| name.into_owned());
            let (file, line) = frame
                .location
                .as_ref()
                .map_or((None, None), |loc| (loc.file.map(str::to_string), loc.line));
            best = Some(Location { function, file, line });
        }
        best.filter(|loc| loc.function.is_some() || loc.file.is_some())
    }
}

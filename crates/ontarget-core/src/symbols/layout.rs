//! Type layout extraction from DWARF debug info.
//!
//! Layouts mirror what the firmware compiler emitted. Sizes and member
//! offsets are read directly from `DW_AT_byte_size` and
//! `DW_AT_data_member_location`; nothing here recomputes padding.

use std::sync::Arc;

use gimli::{AttributeValue, Reader as _, UnitOffset, UnitSectionOffset};
use tracing::trace;

use super::image::DwarfReader;
use super::map_dwarf_error;
use crate::error::{OnTargetError, OnTargetResult};
use crate::types::Address;

/// Recursion limit when chasing type references.
const MAX_TYPE_DEPTH: usize = 32;

/// Interpretation of a scalar's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind
{
    /// Unsigned integer.
    Unsigned,
    /// Two's-complement signed integer.
    Signed,
    /// IEEE 754 float.
    Float,
    /// Boolean, nonzero meaning true.
    Bool,
}

/// One named member of a struct layout.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField
{
    /// Member name.
    pub name: String,
    /// Byte offset from the start of the struct, as the compiler placed it.
    pub offset: u64,
    /// Member type.
    pub layout: Arc<TypeLayout>,
}

/// Exact in-memory layout of one target type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeLayout
{
    /// An integer, float or bool.
    Scalar
    {
        /// Type name, e.g. `"uint32_t"`.
        name: String,
        /// Size in bytes.
        size: u64,
        /// How the bytes are interpreted.
        kind: ScalarKind,
    },
    /// A data or function pointer.
    Pointer
    {
        /// Display name, e.g. `"uint32_t*"`.
        name: String,
        /// Pointer size in bytes.
        size: u64,
        /// The pointed-to type. `None` for `void*` and for pointers whose
        /// target type forms a reference cycle.
        pointee: Option<Arc<TypeLayout>>,
    },
    /// A fixed-length array.
    Array
    {
        /// Element type.
        elem: Arc<TypeLayout>,
        /// Element count.
        count: u64,
        /// Total size in bytes.
        size: u64,
    },
    /// A struct with explicit member offsets.
    Struct
    {
        /// Struct name.
        name: String,
        /// Total size in bytes, padding included.
        size: u64,
        /// Members in declaration order.
        fields: Vec<StructField>,
    },
    /// A function type, seen through function pointers.
    Function
    {
        /// Parameter types in order.
        params: Vec<Arc<TypeLayout>>,
        /// Return type, or `None` for `void`.
        ret: Option<Arc<TypeLayout>>,
    },
}

impl TypeLayout
{
    /// Size of a value of this type in bytes.
    #[must_use]
    pub fn size(&self) -> u64
    {
        match self
        {
            Self::Scalar { size, .. } | Self::Pointer { size, .. } | Self::Array { size, .. }
            | Self::Struct { size, .. } => *size,
            Self::Function { .. } => 0,
        }
    }

    /// Natural alignment of this type in bytes.
    ///
    /// Scalars and pointers align to their size, composites to their most
    /// demanding member. This matches the Arm ABI's notion of natural
    /// alignment for the fundamental types.
    #[must_use]
    pub fn alignment(&self) -> u64
    {
        match self
        {
            Self::Scalar { size, .. } | Self::Pointer { size, .. } =>
            {
                if size.is_power_of_two() && *size <= 8
                {
                    *size
                }
                else
                {
                    1
                }
            }
            Self::Array { elem, .. } => elem.alignment(),
            Self::Struct { fields, .. } =>
            {
                fields.iter().map(|f| f.layout.alignment()).max().unwrap_or(1)
            }
            Self::Function { .. } => 1,
        }
    }

    /// Display name of the type.
    #[must_use]
    pub fn name(&self) -> String
    {
        match self
        {
            Self::Scalar { name, .. } | Self::Pointer { name, .. } | Self::Struct { name, .. } =>
            {
                name.clone()
            }
            Self::Array { elem, count, .. } => format!("{}[{count}]", elem.name()),
            Self::Function { .. } => "function".to_string(),
        }
    }

    /// Returns `true` for function types, i.e. values that can be the
    /// target of a call.
    #[must_use]
    pub const fn is_invocable(&self) -> bool
    {
        matches!(self, Self::Function { .. })
    }

    /// Returns `true` for single-byte character scalars.
    #[must_use]
    pub fn is_char(&self) -> bool
    {
        matches!(self, Self::Scalar { size: 1, name, .. } if name.contains("char"))
    }

    /// Looks a struct member up by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&StructField>
    {
        match self
        {
            Self::Struct { fields, .. } => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }
}

impl std::fmt::Display for TypeLayout
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}", self.name())
    }
}

/// Address, parameter types and return type of one function, straight
/// from its `DW_TAG_subprogram` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature
{
    /// Function name.
    pub name: String,
    /// Entry address from `DW_AT_low_pc`, when present.
    pub address: Option<Address>,
    /// Parameter types in declaration order.
    pub params: Vec<Arc<TypeLayout>>,
    /// Return type, or `None` for `void`.
    pub ret: Option<Arc<TypeLayout>>,
}

type Unit = gimli::Unit<DwarfReader>;
type Entry<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, DwarfReader>;

/// Walks DWARF units to answer type and function layout queries.
pub(crate) struct LayoutReader<'a>
{
    dwarf: &'a gimli::Dwarf<DwarfReader>,
    units: &'a [Unit],
}

impl<'a> LayoutReader<'a>
{
    pub(crate) fn new(dwarf: &'a gimli::Dwarf<DwarfReader>, units: &'a [Unit]) -> Self
    {
        Self { dwarf, units }
    }

    /// Finds a named type and reads its full layout.
    pub(crate) fn find_type(&self, name: &str) -> OnTargetResult<Option<TypeLayout>>
    {
        for unit in self.units
        {
            let mut entries = unit.entries();
            while let Some((_, entry)) =
                entries.next_dfs().map_err(|e| map_dwarf_error("walking debug info", e))?
            {
                let tag = entry.tag();
                let named_type = matches!(
                    tag,
                    gimli::DW_TAG_base_type
                        | gimli::DW_TAG_structure_type
                        | gimli::DW_TAG_enumeration_type
                        | gimli::DW_TAG_typedef
                );
                if !named_type || self.is_declaration(entry)?
                {
                    continue;
                }
                if self.attr_string(unit, entry, gimli::DW_AT_name)?.as_deref() == Some(name)
                {
                    let mut seen = Vec::new();
                    let layout = self.layout_at(unit, entry.offset(), &mut seen, 0)?;
                    return Ok(Some(layout));
                }
            }
        }
        Ok(None)
    }

    /// Finds a function definition and reads its signature.
    pub(crate) fn find_function(&self, name: &str) -> OnTargetResult<Option<FunctionSignature>>
    {
        for unit in self.units
        {
            let mut entries = unit.entries();
            while let Some((_, entry)) =
                entries.next_dfs().map_err(|e| map_dwarf_error("walking debug info", e))?
            {
                if entry.tag() != gimli::DW_TAG_subprogram || self.is_declaration(entry)?
                {
                    continue;
                }
                if self.attr_string(unit, entry, gimli::DW_AT_name)?.as_deref() != Some(name)
                {
                    continue;
                }
                return Ok(Some(self.signature_at(unit, entry.offset(), name)?));
            }
        }
        Ok(None)
    }

    fn signature_at(
        &self,
        unit: &'a Unit,
        offset: UnitOffset,
        name: &str,
    ) -> OnTargetResult<FunctionSignature>
    {
        let entry = unit
            .entry(offset)
            .map_err(|e| map_dwarf_error("reading function entry", e))?;
        let address = self.entry_address(unit, &entry)?;
        let ret = self.follow_optional_type(unit, &entry)?;

        let mut params = Vec::new();
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|e| map_dwarf_error("reading function parameters", e))?;
        let root = tree.root().map_err(|e| map_dwarf_error("reading function parameters", e))?;
        let mut children = root.children();
        while let Some(node) =
            children.next().map_err(|e| map_dwarf_error("reading function parameters", e))?
        {
            if node.entry().tag() != gimli::DW_TAG_formal_parameter
            {
                continue;
            }
            match self.follow_optional_type(unit, node.entry())?
            {
                Some(layout) => params.push(layout),
                None =>
                {
                    return Err(OnTargetError::DebugInfo {
                        context: format!("parameters of {name}"),
                        details: "formal parameter without a type".to_string(),
                    });
                }
            }
        }

        Ok(FunctionSignature { name: name.to_string(), address, params, ret })
    }

    /// Reads the layout of the type DIE at `offset` in `unit`.
    fn layout_at(
        &self,
        unit: &'a Unit,
        offset: UnitOffset,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        if depth > MAX_TYPE_DEPTH
        {
            return Err(OnTargetError::DebugInfo {
                context: "resolving type".to_string(),
                details: format!("type reference chain deeper than {MAX_TYPE_DEPTH}"),
            });
        }
        let entry =
            unit.entry(offset).map_err(|e| map_dwarf_error("reading type entry", e))?;
        let tag = entry.tag();
        trace!(?tag, offset = offset.0, "reading type layout");

        match tag
        {
            gimli::DW_TAG_base_type => self.scalar_layout(unit, &entry),
            gimli::DW_TAG_enumeration_type => self.enum_layout(unit, &entry, seen, depth),
            gimli::DW_TAG_pointer_type => self.pointer_layout(unit, &entry, seen, depth),
            gimli::DW_TAG_array_type => self.array_layout(unit, &entry, offset, seen, depth),
            gimli::DW_TAG_structure_type =>
            {
                self.struct_layout(unit, &entry, offset, seen, depth)
            }
            gimli::DW_TAG_subroutine_type =>
            {
                self.function_layout(unit, &entry, offset, seen, depth)
            }
            gimli::DW_TAG_typedef =>
            {
                let name = self.attr_string(unit, &entry, gimli::DW_AT_name)?;
                let inner = self.follow_required_type(unit, &entry, seen, depth)?;
                match (name, inner)
                {
                    // Carry the typedef name onto the underlying scalar or
                    // pointer so lookups read back as what was asked for.
                    (Some(alias), TypeLayout::Scalar { size, kind, .. }) =>
                    {
                        Ok(TypeLayout::Scalar { name: alias, size, kind })
                    }
                    (Some(alias), TypeLayout::Pointer { size, pointee, .. }) =>
                    {
                        Ok(TypeLayout::Pointer { name: alias, size, pointee })
                    }
                    (_, inner) => Ok(inner),
                }
            }
            gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type =>
            {
                self.follow_required_type(unit, &entry, seen, depth)
            }
            gimli::DW_TAG_union_type =>
            {
                let name = self
                    .attr_string(unit, &entry, gimli::DW_AT_name)?
                    .unwrap_or_else(|| "<anonymous>".to_string());
                Err(OnTargetError::DebugInfo {
                    context: format!("union {name}"),
                    details: "union layouts are not supported".to_string(),
                })
            }
            other => Err(OnTargetError::DebugInfo {
                context: "resolving type".to_string(),
                details: format!("unsupported DWARF tag {other}"),
            }),
        }
    }

    fn scalar_layout(&self, unit: &'a Unit, entry: &Entry<'_, '_>) -> OnTargetResult<TypeLayout>
    {
        let name = self
            .attr_string(unit, entry, gimli::DW_AT_name)?
            .unwrap_or_else(|| "<unnamed>".to_string());
        let size = self.byte_size(entry)?.ok_or_else(|| OnTargetError::DebugInfo {
            context: format!("base type {name}"),
            details: "missing DW_AT_byte_size".to_string(),
        })?;
        let kind = match self.attr_value(entry, gimli::DW_AT_encoding)?
        {
            Some(AttributeValue::Encoding(enc)) => match enc
            {
                gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => ScalarKind::Signed,
                gimli::DW_ATE_float => ScalarKind::Float,
                gimli::DW_ATE_boolean => ScalarKind::Bool,
                _ => ScalarKind::Unsigned,
            },
            _ => ScalarKind::Unsigned,
        };
        Ok(TypeLayout::Scalar { name, size, kind })
    }

    fn enum_layout(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        let name = self
            .attr_string(unit, entry, gimli::DW_AT_name)?
            .unwrap_or_else(|| "<anonymous enum>".to_string());
        // Enums marshal as their underlying integer.
        let (size, kind) = match self.follow_optional_type_inner(unit, entry, seen, depth)?
        {
            Some(TypeLayout::Scalar { size, kind, .. }) => (size, kind),
            _ =>
            {
                let size = self.byte_size(entry)?.ok_or_else(|| OnTargetError::DebugInfo {
                    context: format!("enum {name}"),
                    details: "missing DW_AT_byte_size".to_string(),
                })?;
                (size, ScalarKind::Unsigned)
            }
        };
        Ok(TypeLayout::Scalar { name, size, kind })
    }

    fn pointer_layout(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        let size = self
            .byte_size(entry)?
            .unwrap_or_else(|| u64::from(unit.header.address_size()));
        let target = self.type_ref(unit, entry)?;
        let pointee = match target
        {
            None => None,
            Some((target_unit, target_offset)) =>
            {
                if seen.contains(&Self::global_offset(target_unit, target_offset))
                {
                    // Self-referential struct (e.g. a linked list node).
                    // Leave the pointee opaque instead of recursing.
                    None
                }
                else
                {
                    Some(Arc::new(self.layout_at(target_unit, target_offset, seen, depth + 1)?))
                }
            }
        };
        let name = match &pointee
        {
            Some(inner) => format!("{}*", inner.name()),
            None => "void*".to_string(),
        };
        Ok(TypeLayout::Pointer { name, size, pointee })
    }

    fn array_layout(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        offset: UnitOffset,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        let elem = Arc::new(self.follow_required_type(unit, entry, seen, depth)?);

        let mut count = 0u64;
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|e| map_dwarf_error("reading array bounds", e))?;
        let root = tree.root().map_err(|e| map_dwarf_error("reading array bounds", e))?;
        let mut children = root.children();
        while let Some(node) =
            children.next().map_err(|e| map_dwarf_error("reading array bounds", e))?
        {
            if node.entry().tag() != gimli::DW_TAG_subrange_type
            {
                continue;
            }
            if let Some(n) = self.udata(node.entry(), gimli::DW_AT_count)?
            {
                count = n;
            }
            else if let Some(upper) = self.udata(node.entry(), gimli::DW_AT_upper_bound)?
            {
                count = upper + 1;
            }
        }

        let size = match self.byte_size(entry)?
        {
            Some(size) => size,
            None => elem.size() * count,
        };
        Ok(TypeLayout::Array { elem, count, size })
    }

    fn struct_layout(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        offset: UnitOffset,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        let name = self
            .attr_string(unit, entry, gimli::DW_AT_name)?
            .unwrap_or_else(|| "<anonymous>".to_string());
        let size = self.byte_size(entry)?.ok_or_else(|| OnTargetError::DebugInfo {
            context: format!("struct {name}"),
            details: "missing DW_AT_byte_size (incomplete type?)".to_string(),
        })?;

        seen.push(Self::global_offset(unit, offset));
        let result = self.struct_fields(unit, offset, &name, seen, depth);
        seen.pop();
        let fields = result?;

        Ok(TypeLayout::Struct { name, size, fields })
    }

    fn struct_fields(
        &self,
        unit: &'a Unit,
        offset: UnitOffset,
        name: &str,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<Vec<StructField>>
    {
        let mut fields = Vec::new();
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|e| map_dwarf_error("reading struct members", e))?;
        let root = tree.root().map_err(|e| map_dwarf_error("reading struct members", e))?;
        let mut children = root.children();
        while let Some(node) =
            children.next().map_err(|e| map_dwarf_error("reading struct members", e))?
        {
            let member = node.entry();
            if member.tag() != gimli::DW_TAG_member
            {
                continue;
            }
            let member_name = self
                .attr_string(unit, member, gimli::DW_AT_name)?
                .unwrap_or_else(|| "<unnamed>".to_string());
            if self.attr_value(member, gimli::DW_AT_bit_size)?.is_some()
                || self.attr_value(member, gimli::DW_AT_data_bit_offset)?.is_some()
            {
                return Err(OnTargetError::DebugInfo {
                    context: format!("struct {name}"),
                    details: format!("member {member_name} is a bitfield, which is not supported"),
                });
            }
            let member_offset =
                self.udata(member, gimli::DW_AT_data_member_location)?.unwrap_or(0);
            let layout = Arc::new(self.follow_required_type(unit, member, seen, depth)?);
            fields.push(StructField { name: member_name, offset: member_offset, layout });
        }
        Ok(fields)
    }

    fn function_layout(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        offset: UnitOffset,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        let ret = self.follow_optional_type_inner(unit, entry, seen, depth)?.map(Arc::new);

        let mut params = Vec::new();
        let mut tree = unit
            .entries_tree(Some(offset))
            .map_err(|e| map_dwarf_error("reading function type", e))?;
        let root = tree.root().map_err(|e| map_dwarf_error("reading function type", e))?;
        let mut children = root.children();
        while let Some(node) =
            children.next().map_err(|e| map_dwarf_error("reading function type", e))?
        {
            if node.entry().tag() != gimli::DW_TAG_formal_parameter
            {
                continue;
            }
            if let Some((u, o)) = self.type_ref(unit, node.entry())?
            {
                params.push(Arc::new(self.layout_at(u, o, seen, depth + 1)?));
            }
        }
        Ok(TypeLayout::Function { params, ret })
    }

    fn follow_required_type(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<TypeLayout>
    {
        match self.type_ref(unit, entry)?
        {
            Some((u, o)) => self.layout_at(u, o, seen, depth + 1),
            None => Err(OnTargetError::DebugInfo {
                context: "resolving type".to_string(),
                details: format!("{} entry has no DW_AT_type", entry.tag()),
            }),
        }
    }

    fn follow_optional_type_inner(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        seen: &mut Vec<usize>,
        depth: usize,
    ) -> OnTargetResult<Option<TypeLayout>>
    {
        match self.type_ref(unit, entry)?
        {
            Some((u, o)) => Ok(Some(self.layout_at(u, o, seen, depth + 1)?)),
            None => Ok(None),
        }
    }

    fn follow_optional_type(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
    ) -> OnTargetResult<Option<Arc<TypeLayout>>>
    {
        let mut seen = Vec::new();
        Ok(self.follow_optional_type_inner(unit, entry, &mut seen, 0)?.map(Arc::new))
    }

    /// Resolves a `DW_AT_type` reference to a (unit, offset) pair,
    /// following cross-unit references when necessary.
    fn type_ref(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
    ) -> OnTargetResult<Option<(&'a Unit, UnitOffset)>>
    {
        let Some(value) = self.attr_value(entry, gimli::DW_AT_type)?
        else
        {
            return Ok(None);
        };
        match value
        {
            AttributeValue::UnitRef(offset) => Ok(Some((unit, offset))),
            AttributeValue::DebugInfoRef(target) =>
            {
                for candidate in self.units
                {
                    let UnitSectionOffset::DebugInfoOffset(base) = candidate.header.offset()
                    else
                    {
                        continue;
                    };
                    let len = candidate.header.length_including_self();
                    if target.0 >= base.0 && target.0 < base.0 + len
                    {
                        return Ok(Some((candidate, UnitOffset(target.0 - base.0))));
                    }
                }
                Err(OnTargetError::DebugInfo {
                    context: "resolving type".to_string(),
                    details: "cross-unit type reference points outside all units".to_string(),
                })
            }
            other => Err(OnTargetError::DebugInfo {
                context: "resolving type".to_string(),
                details: format!("unsupported type reference form {other:?}"),
            }),
        }
    }

    fn entry_address(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
    ) -> OnTargetResult<Option<Address>>
    {
        match self.attr_value(entry, gimli::DW_AT_low_pc)?
        {
            Some(AttributeValue::Addr(addr)) => Ok(Some(Address::new(addr))),
            Some(AttributeValue::DebugAddrIndex(index)) =>
            {
                let addr = self
                    .dwarf
                    .address(unit, index)
                    .map_err(|e| map_dwarf_error("reading DW_AT_low_pc", e))?;
                Ok(Some(Address::new(addr)))
            }
            _ => Ok(None),
        }
    }

    fn is_declaration(&self, entry: &Entry<'_, '_>) -> OnTargetResult<bool>
    {
        Ok(matches!(
            self.attr_value(entry, gimli::DW_AT_declaration)?,
            Some(AttributeValue::Flag(true))
        ))
    }

    fn byte_size(&self, entry: &Entry<'_, '_>) -> OnTargetResult<Option<u64>>
    {
        self.udata(entry, gimli::DW_AT_byte_size)
    }

    fn udata(&self, entry: &Entry<'_, '_>, at: gimli::DwAt) -> OnTargetResult<Option<u64>>
    {
        Ok(self.attr_value(entry, at)?.and_then(|v| v.udata_value()))
    }

    fn attr_value(
        &self,
        entry: &Entry<'_, '_>,
        at: gimli::DwAt,
    ) -> OnTargetResult<Option<AttributeValue<DwarfReader>>>
    {
        entry.attr_value(at).map_err(|e| map_dwarf_error("reading attribute", e))
    }

    fn attr_string(
        &self,
        unit: &'a Unit,
        entry: &Entry<'_, '_>,
        at: gimli::DwAt,
    ) -> OnTargetResult<Option<String>>
    {
        let Some(value) = self.attr_value(entry, at)?
        else
        {
            return Ok(None);
        };
        let data = self
            .dwarf
            .attr_string(unit, value)
            .map_err(|e| map_dwarf_error("reading string attribute", e))?;
        let text = data
            .to_string_lossy()
            .map_err(|e| map_dwarf_error("reading string attribute", e))?;
        Ok(Some(text.into_owned()))
    }

    fn global_offset(unit: &Unit, offset: UnitOffset) -> usize
    {
        let base = match unit.header.offset()
        {
            UnitSectionOffset::DebugInfoOffset(o) => o.0,
            UnitSectionOffset::DebugTypesOffset(o) => o.0,
        };
        base + offset.0
    }
}

//! # Value Marshaling
//!
//! Conversion between host-side [`Value`]s and raw target memory, driven
//! entirely by [`TypeLayout`]s read from debug info.
//!
//! Encoding is strict: a value that does not fit its target type is
//! rejected with a [`TypeMismatch`] before any bytes are produced, and a
//! string that does not fit its buffer is rejected with a
//! [`BufferOverflow`] before anything is written. Struct padding is
//! zero-filled on encode and never inspected on decode, so
//! `decode(encode(v)) == v` holds for every supported value shape.
//!
//! [`TypeMismatch`]: crate::error::OnTargetError::TypeMismatch
//! [`BufferOverflow`]: crate::error::OnTargetError::BufferOverflow

use crate::error::{OnTargetError, OnTargetResult};
use crate::symbols::{ScalarKind, SymbolKind, SymbolTable, TypeLayout};
use crate::types::{Address, Endianness};

/// A host-side value heading to or from target memory.
#[derive(Debug, Clone, PartialEq)]
pub enum Value
{
    /// The absence of a value, as returned by a `void` function.
    Void,
    /// An unsigned integer of any target width.
    UInt(u64),
    /// A signed integer of any target width.
    Int(i64),
    /// A float or double.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// A data or function pointer.
    Pointer(Address),
    /// A NUL-terminated string, for `char` arrays.
    Str(String),
    /// Raw bytes, for byte arrays.
    Bytes(Vec<u8>),
    /// A struct as named fields. Order does not matter; names must match
    /// the target struct exactly.
    Struct(Vec<(String, Value)>),
    /// A fixed-length array.
    Array(Vec<Value>),
}

impl Value
{
    /// Numeric view of the value, when it has one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64>
    {
        match self
        {
            Self::UInt(v) => Some(*v),
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            Self::Bool(b) => Some(u64::from(*b)),
            Self::Pointer(a) => Some(a.value()),
            _ => None,
        }
    }

    /// Pointer view of the value, when it has one.
    #[must_use]
    pub const fn as_pointer(&self) -> Option<Address>
    {
        match self
        {
            Self::Pointer(a) => Some(*a),
            _ => None,
        }
    }

    fn describe(&self) -> String
    {
        match self
        {
            Self::Void => "void".to_string(),
            Self::UInt(v) => format!("integer {v}"),
            Self::Int(v) => format!("integer {v}"),
            Self::Float(v) => format!("float {v}"),
            Self::Bool(v) => format!("bool {v}"),
            Self::Pointer(a) => format!("pointer {a}"),
            Self::Str(s) => format!("string of {} bytes", s.len()),
            Self::Bytes(b) => format!("{} raw bytes", b.len()),
            Self::Struct(fields) => format!("struct with {} fields", fields.len()),
            Self::Array(items) => format!("array of {} elements", items.len()),
        }
    }
}

impl std::fmt::Display for Value
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::Void => write!(f, "void"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Pointer(a) => write!(f, "{a}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Struct(fields) =>
            {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate()
                {
                    if i > 0
                    {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Array(items) =>
            {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate()
                {
                    if i > 0
                    {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

fn mismatch(context: &str, expected: impl Into<String>, value: &Value) -> OnTargetError
{
    OnTargetError::TypeMismatch {
        context: context.to_string(),
        expected: expected.into(),
        found: value.describe(),
    }
}

/// Encodes and decodes values for one target's byte order.
#[derive(Debug, Clone, Copy)]
pub struct Marshaler<'a>
{
    endianness: Endianness,
    symbols: Option<&'a SymbolTable>,
}

impl<'a> Marshaler<'a>
{
    /// Creates a marshaler without symbol knowledge. Function pointer
    /// values are encoded without validation.
    #[must_use]
    pub const fn new(endianness: Endianness) -> Self
    {
        Self { endianness, symbols: None }
    }

    /// Creates a marshaler that validates function pointers against a
    /// symbol table.
    #[must_use]
    pub const fn with_symbols(endianness: Endianness, symbols: &'a SymbolTable) -> Self
    {
        Self { endianness, symbols: Some(symbols) }
    }

    /// Encodes a value into the exact byte image of `layout`.
    ///
    /// ## Errors
    ///
    /// Returns `TypeMismatch` when the value does not fit the layout and
    /// `BufferOverflow` when string or byte content exceeds its buffer.
    pub fn encode(&self, value: &Value, layout: &TypeLayout) -> OnTargetResult<Vec<u8>>
    {
        let mut out = vec![0u8; layout.size() as usize];
        self.encode_into(value, layout, &mut out)?;
        Ok(out)
    }

    fn encode_into(
        &self,
        value: &Value,
        layout: &TypeLayout,
        out: &mut [u8],
    ) -> OnTargetResult<()>
    {
        match layout
        {
            TypeLayout::Scalar { name, size, kind } =>
            {
                let raw = self.scalar_to_raw(value, name, *size, *kind)?;
                self.put_raw(out, raw);
                Ok(())
            }
            TypeLayout::Pointer { name, size, pointee } =>
            {
                let address = match value
                {
                    Value::Pointer(a) => a.value(),
                    Value::UInt(v) => *v,
                    other => return Err(mismatch(name, "a pointer", other)),
                };
                if !fits_unsigned(address, *size)
                {
                    return Err(mismatch(name, format!("a {}-byte pointer", size), value));
                }
                self.check_invocable(name, address, pointee.as_deref())?;
                self.put_raw(out, address);
                Ok(())
            }
            TypeLayout::Struct { name, fields, .. } =>
            {
                let Value::Struct(pairs) = value
                else
                {
                    return Err(mismatch(name, format!("struct {name}"), value));
                };
                for (field_name, _) in pairs
                {
                    if layout.field(field_name).is_none()
                    {
                        return Err(OnTargetError::TypeMismatch {
                            context: name.clone(),
                            expected: format!("fields of struct {name}"),
                            found: format!("unexpected field {field_name}"),
                        });
                    }
                }
                for field in fields
                {
                    let Some((_, field_value)) =
                        pairs.iter().find(|(n, _)| *n == field.name)
                    else
                    {
                        return Err(OnTargetError::TypeMismatch {
                            context: name.clone(),
                            expected: format!("a value for field {}", field.name),
                            found: "no such field in the supplied struct".to_string(),
                        });
                    };
                    let start = field.offset as usize;
                    let end = start + field.layout.size() as usize;
                    self.encode_into(field_value, &field.layout, &mut out[start..end])?;
                }
                Ok(())
            }
            TypeLayout::Array { elem, count, .. } => match value
            {
                Value::Array(items) =>
                {
                    if items.len() as u64 != *count
                    {
                        return Err(mismatch(
                            &layout.name(),
                            format!("{count} elements"),
                            value,
                        ));
                    }
                    let esize = elem.size() as usize;
                    for (i, item) in items.iter().enumerate()
                    {
                        self.encode_into(item, elem, &mut out[i * esize..(i + 1) * esize])?;
                    }
                    Ok(())
                }
                Value::Str(s) =>
                {
                    if !elem.is_char()
                    {
                        return Err(mismatch(&layout.name(), "array elements", value));
                    }
                    let required = s.len() + 1;
                    if required > out.len()
                    {
                        return Err(OnTargetError::BufferOverflow {
                            context: format!("string into {}", layout.name()),
                            capacity: out.len(),
                            required,
                        });
                    }
                    out[..s.len()].copy_from_slice(s.as_bytes());
                    out[s.len()] = 0;
                    Ok(())
                }
                Value::Bytes(bytes) =>
                {
                    if bytes.len() > out.len()
                    {
                        return Err(OnTargetError::BufferOverflow {
                            context: format!("bytes into {}", layout.name()),
                            capacity: out.len(),
                            required: bytes.len(),
                        });
                    }
                    out[..bytes.len()].copy_from_slice(bytes);
                    Ok(())
                }
                other => Err(mismatch(&layout.name(), "an array, string or bytes", other)),
            },
            TypeLayout::Function { .. } =>
            {
                Err(mismatch("function type", "a marshalable value type", value))
            }
        }
    }

    /// Decodes the byte image of `layout` back into a value.
    ///
    /// ## Errors
    ///
    /// Returns `TypeMismatch` when `bytes` is shorter than the layout.
    pub fn decode(&self, bytes: &[u8], layout: &TypeLayout) -> OnTargetResult<Value>
    {
        let size = layout.size() as usize;
        if bytes.len() < size
        {
            return Err(OnTargetError::TypeMismatch {
                context: layout.name(),
                expected: format!("{size} bytes"),
                found: format!("{} bytes", bytes.len()),
            });
        }
        let bytes = &bytes[..size];
        match layout
        {
            TypeLayout::Scalar { size, kind, name } =>
            {
                if *size == 0 || *size > 8
                {
                    return Err(OnTargetError::TypeMismatch {
                        context: name.clone(),
                        expected: "a scalar of at most 8 bytes".to_string(),
                        found: format!("{size} bytes"),
                    });
                }
                let raw = self.get_raw(bytes);
                Ok(match kind
                {
                    ScalarKind::Unsigned => Value::UInt(raw),
                    ScalarKind::Signed => Value::Int(sign_extend(raw, *size)),
                    ScalarKind::Bool => Value::Bool(raw != 0),
                    ScalarKind::Float => match size
                    {
                        4 => Value::Float(f64::from(f32::from_bits(raw as u32))),
                        _ => Value::Float(f64::from_bits(raw)),
                    },
                })
            }
            TypeLayout::Pointer { .. } => Ok(Value::Pointer(Address::new(self.get_raw(bytes)))),
            TypeLayout::Struct { fields, .. } =>
            {
                let mut pairs = Vec::with_capacity(fields.len());
                for field in fields
                {
                    let start = field.offset as usize;
                    let end = start + field.layout.size() as usize;
                    pairs.push((
                        field.name.clone(),
                        self.decode(&bytes[start..end], &field.layout)?,
                    ));
                }
                Ok(Value::Struct(pairs))
            }
            TypeLayout::Array { elem, count, .. } =>
            {
                if elem.is_char()
                {
                    let text = bytes.split(|b| *b == 0).next().unwrap_or(&[]);
                    return Ok(Value::Str(String::from_utf8_lossy(text).into_owned()));
                }
                let esize = elem.size() as usize;
                let mut items = Vec::with_capacity(*count as usize);
                for i in 0..*count as usize
                {
                    items.push(self.decode(&bytes[i * esize..(i + 1) * esize], elem)?);
                }
                Ok(Value::Array(items))
            }
            TypeLayout::Function { .. } => Err(OnTargetError::TypeMismatch {
                context: "function type".to_string(),
                expected: "a marshalable value type".to_string(),
                found: "a bare function".to_string(),
            }),
        }
    }

    fn scalar_to_raw(
        &self,
        value: &Value,
        name: &str,
        size: u64,
        kind: ScalarKind,
    ) -> OnTargetResult<u64>
    {
        if size == 0 || size > 8
        {
            return Err(mismatch(name, format!("a scalar of at most 8 bytes, not {size}"), value));
        }
        match kind
        {
            ScalarKind::Unsigned => match value
            {
                Value::UInt(v) if fits_unsigned(*v, size) => Ok(*v),
                Value::Int(v) if *v >= 0 && fits_unsigned(*v as u64, size) => Ok(*v as u64),
                other => Err(mismatch(name, format!("an unsigned {}-bit value", size * 8), other)),
            },
            ScalarKind::Signed => match value
            {
                Value::Int(v) if fits_signed(*v, size) => Ok(truncate(*v as u64, size)),
                Value::UInt(v) if i64::try_from(*v).map_or(false, |v| fits_signed(v, size)) =>
                {
                    Ok(truncate(*v, size))
                }
                other => Err(mismatch(name, format!("a signed {}-bit value", size * 8), other)),
            },
            ScalarKind::Bool => match value
            {
                Value::Bool(b) => Ok(u64::from(*b)),
                Value::UInt(v @ (0 | 1)) => Ok(*v),
                Value::Int(v @ (0 | 1)) => Ok(*v as u64),
                other => Err(mismatch(name, "a boolean", other)),
            },
            ScalarKind::Float => match value
            {
                Value::Float(f) => match size
                {
                    4 => Ok(u64::from((*f as f32).to_bits())),
                    8 => Ok(f.to_bits()),
                    _ => Err(mismatch(name, "a 4- or 8-byte float type", value)),
                },
                other => Err(mismatch(name, "a float", other)),
            },
        }
    }

    /// Rejects function pointer values that do not point at a function
    /// symbol. Null stays allowed so tests can exercise null-pointer
    /// handling in the firmware.
    fn check_invocable(
        &self,
        name: &str,
        address: u64,
        pointee: Option<&TypeLayout>,
    ) -> OnTargetResult<()>
    {
        let invocable = pointee.is_some_and(TypeLayout::is_invocable);
        if !invocable || address == 0
        {
            return Ok(());
        }
        let Some(symbols) = self.symbols
        else
        {
            return Ok(());
        };
        match symbols.containing(Address::new(address))
        {
            Some(symbol) if symbol.kind == SymbolKind::Function => Ok(()),
            Some(symbol) => Err(OnTargetError::TypeMismatch {
                context: name.to_string(),
                expected: "the address of a function".to_string(),
                found: format!("0x{address:08x} inside non-function symbol {}", symbol.name),
            }),
            None => Err(OnTargetError::TypeMismatch {
                context: name.to_string(),
                expected: "the address of a function".to_string(),
                found: format!("0x{address:08x}, which no known symbol covers"),
            }),
        }
    }

    fn put_raw(&self, out: &mut [u8], raw: u64)
    {
        let n = out.len();
        match self.endianness
        {
            Endianness::Little => out.copy_from_slice(&raw.to_le_bytes()[..n]),
            Endianness::Big => out.copy_from_slice(&raw.to_be_bytes()[8 - n..]),
        }
    }

    fn get_raw(&self, bytes: &[u8]) -> u64
    {
        let mut raw = [0u8; 8];
        match self.endianness
        {
            Endianness::Little => raw[..bytes.len()].copy_from_slice(bytes),
            Endianness::Big => raw[8 - bytes.len()..].copy_from_slice(bytes),
        }
        match self.endianness
        {
            Endianness::Little => u64::from_le_bytes(raw),
            Endianness::Big => u64::from_be_bytes(raw),
        }
    }
}

const fn fits_unsigned(value: u64, size: u64) -> bool
{
    size >= 8 || value < (1 << (size * 8))
}

const fn fits_signed(value: i64, size: u64) -> bool
{
    if size >= 8
    {
        return true;
    }
    let bits = size * 8;
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    value >= min && value <= max
}

const fn truncate(raw: u64, size: u64) -> u64
{
    if size >= 8
    {
        raw
    }
    else
    {
        raw & ((1 << (size * 8)) - 1)
    }
}

const fn sign_extend(raw: u64, size: u64) -> i64
{
    if size >= 8
    {
        return raw as i64;
    }
    let shift = 64 - size * 8;
    ((raw << shift) as i64) >> shift
}

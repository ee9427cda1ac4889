//! Name, signature and layout queries against the synthetic demo image.

mod common;

use common::{
    demo_image, ADDITION, ADDITION_STRUCT, CUSTOM_OPERATION, NOP, RAM_BASE, STRING_LEN,
};
use ontarget_core::error::OnTargetError;
use ontarget_core::symbols::{ScalarKind, SymbolKind, TypeLayout};
use ontarget_core::types::Address;

#[test]
fn test_resolve_by_name()
{
    let image = demo_image();
    let symbol = image.symbols().resolve("example_Addition").expect("known function");
    assert_eq!(symbol.address, Address::new(ADDITION));
    assert_eq!(symbol.kind, SymbolKind::Function);

    let data = image.symbols().resolve("g_counter").expect("known object");
    assert_eq!(data.address, Address::new(RAM_BASE + 0x10));
    assert_eq!(data.kind, SymbolKind::Object);
}

#[test]
fn test_resolve_unknown_symbol_fails()
{
    let image = demo_image();
    match image.symbols().resolve("example_Missing")
    {
        Err(OnTargetError::UnknownSymbol { name }) => assert_eq!(name, "example_Missing"),
        other => panic!("Expected UnknownSymbol, got {other:?}"),
    }
}

#[test]
fn test_containing_respects_symbol_size()
{
    let image = demo_image();
    let inside = image.symbols().containing(Address::new(ADDITION + 4)).expect("inside body");
    assert_eq!(inside.name, "example_Addition");

    // Function symbols are 0x20 long, the next one starts at +0x40. The
    // gap between them belongs to nobody.
    assert!(image.symbols().containing(Address::new(ADDITION + 0x30)).is_none());
}

#[test]
fn test_struct_layout_is_taken_verbatim()
{
    let image = demo_image();
    let layout = image.type_layout("my_add_t").expect("struct layout");
    let TypeLayout::Struct { name, size, fields } = layout.as_ref()
    else
    {
        panic!("Expected a struct layout, got {layout:?}");
    };
    assert_eq!(name, "my_add_t");
    assert_eq!(*size, 24);

    let offsets: Vec<(&str, u64)> =
        fields.iter().map(|f| (f.name.as_str(), f.offset)).collect();
    assert_eq!(
        offsets,
        [("paddA", 0), ("a", 4), ("paddB", 8), ("b", 12), ("paddC", 16), ("sum", 20)]
    );

    assert_eq!(layout.alignment(), 4);
    assert_eq!(layout.field("b").expect("member b").offset, 12);
    assert!(layout.field("missing").is_none());
}

#[test]
fn test_scalar_and_typedef_layouts()
{
    let image = demo_image();

    let uint32 = image.type_layout("uint32_t").expect("uint32_t");
    assert!(matches!(
        uint32.as_ref(),
        TypeLayout::Scalar { size: 4, kind: ScalarKind::Unsigned, .. }
    ));

    // Typedefs to scalars read back under the alias name.
    let alias = image.type_layout("my_uint").expect("typedef");
    match alias.as_ref()
    {
        TypeLayout::Scalar { name, size, kind } =>
        {
            assert_eq!(name, "my_uint");
            assert_eq!(*size, 4);
            assert_eq!(*kind, ScalarKind::Unsigned);
        }
        other => panic!("Expected a scalar, got {other:?}"),
    }

    let boolean = image.type_layout("bool").expect("bool");
    assert!(matches!(boolean.as_ref(), TypeLayout::Scalar { kind: ScalarKind::Bool, .. }));

    let chr = image.type_layout("char").expect("char");
    assert!(chr.is_char());
}

#[test]
fn test_array_typedef_layout()
{
    let image = demo_image();
    let quad = image.type_layout("quad_t").expect("array typedef");
    let TypeLayout::Array { elem, count, size } = quad.as_ref()
    else
    {
        panic!("Expected an array layout, got {quad:?}");
    };
    assert_eq!(*count, 4);
    assert_eq!(*size, 16);
    assert_eq!(elem.size(), 4);
    assert_eq!(quad.name(), "uint32_t[4]");
    assert_eq!(quad.alignment(), 4);
}

#[test]
fn test_sizeof()
{
    let image = demo_image();
    assert_eq!(image.sizeof("my_add_t").expect("struct"), 24);
    assert_eq!(image.sizeof("pair_t").expect("struct"), 8);
    assert_eq!(image.sizeof("uint16_t").expect("scalar"), 2);
    assert_eq!(image.sizeof("name_t").expect("char array"), 16);
}

#[test]
fn test_function_signature()
{
    let image = demo_image();

    let sig = image.function_signature("example_AdditionStruct").expect("signature");
    assert_eq!(sig.name, "example_AdditionStruct");
    assert_eq!(sig.address, Some(Address::new(ADDITION_STRUCT)));
    assert_eq!(sig.params.len(), 1);
    assert!(matches!(sig.params[0].as_ref(), TypeLayout::Struct { size: 24, .. }));
    assert_eq!(sig.ret.as_ref().expect("returns uint32_t").size(), 4);

    let nop = image.function_signature("example_Nop").expect("signature");
    assert_eq!(nop.address, Some(Address::new(NOP)));
    assert!(nop.params.is_empty());
    assert!(nop.ret.is_none());
}

#[test]
fn test_string_parameter_is_char_pointer()
{
    let image = demo_image();
    let sig = image.function_signature("example_StringLen").expect("signature");
    assert_eq!(sig.address, Some(Address::new(STRING_LEN)));
    let TypeLayout::Pointer { pointee: Some(pointee), .. } = sig.params[0].as_ref()
    else
    {
        panic!("Expected a char pointer parameter, got {:?}", sig.params[0]);
    };
    assert!(pointee.is_char());
}

#[test]
fn test_function_pointer_parameter_is_invocable()
{
    let image = demo_image();
    let sig = image.function_signature("example_CustomOperation").expect("signature");
    assert_eq!(sig.address, Some(Address::new(CUSTOM_OPERATION)));
    assert_eq!(sig.params.len(), 3);
    let TypeLayout::Pointer { pointee: Some(pointee), .. } = sig.params[0].as_ref()
    else
    {
        panic!("Expected a function pointer parameter, got {:?}", sig.params[0]);
    };
    assert!(pointee.is_invocable());
    let TypeLayout::Function { params, ret } = pointee.as_ref()
    else
    {
        panic!("Expected a function type, got {pointee:?}");
    };
    assert_eq!(params.len(), 2);
    assert!(ret.is_some());
}

#[test]
fn test_locate_falls_back_to_the_symbol_table()
{
    let image = demo_image();
    // The synthetic debug info has no line table, so source positions
    // come from the symbol table alone.
    let location = image.locate(Address::new(ADDITION + 2)).expect("covered address");
    assert_eq!(location.function.as_deref(), Some("example_Addition"));
    assert_eq!(location.file, None);
    assert_eq!(location.to_string(), "example_Addition");

    assert!(image.locate(Address::new(0x0700_0000)).is_none());
}

#[test]
fn test_unknown_type_fails()
{
    let image = demo_image();
    match image.type_layout("no_such_t")
    {
        Err(OnTargetError::UnknownSymbol { name }) => assert_eq!(name, "no_such_t"),
        other => panic!("Expected UnknownSymbol, got {other:?}"),
    }
}

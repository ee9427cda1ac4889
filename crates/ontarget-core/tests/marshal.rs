//! Value encoding and decoding through layouts read from the demo image.

mod common;

use common::{demo_image, ADDITION, RAM_BASE};
use ontarget_core::error::OnTargetError;
use ontarget_core::marshal::{Marshaler, Value};
use ontarget_core::types::{Address, Endianness};

#[test]
fn test_uint32_round_trip()
{
    let image = demo_image();
    let layout = image.type_layout("uint32_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    let bytes = marshaler.encode(&Value::UInt(42), &layout).expect("encode");
    assert_eq!(bytes, [42, 0, 0, 0]);
    assert_eq!(marshaler.decode(&bytes, &layout).expect("decode"), Value::UInt(42));
}

#[test]
fn test_signed_round_trip()
{
    let image = demo_image();
    let layout = image.type_layout("int").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    let bytes = marshaler.encode(&Value::Int(-7), &layout).expect("encode");
    assert_eq!(bytes, (-7i32).to_le_bytes());
    assert_eq!(marshaler.decode(&bytes, &layout).expect("decode"), Value::Int(-7));
}

#[test]
fn test_big_endian_byte_order()
{
    let image = demo_image();
    let layout = image.type_layout("uint32_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Big);

    let bytes = marshaler.encode(&Value::UInt(0x1122_3344), &layout).expect("encode");
    assert_eq!(bytes, [0x11, 0x22, 0x33, 0x44]);
    assert_eq!(marshaler.decode(&bytes, &layout).expect("decode"), Value::UInt(0x1122_3344));
}

#[test]
fn test_out_of_range_scalar_is_rejected()
{
    let image = demo_image();
    let layout = image.type_layout("uint8_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    match marshaler.encode(&Value::UInt(256), &layout)
    {
        Err(OnTargetError::TypeMismatch { expected, .. }) =>
        {
            assert!(expected.contains("8-bit"), "unexpected message: {expected}");
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_struct_padding_is_zero_filled_and_survives_round_trip()
{
    let image = demo_image();
    let layout = image.type_layout("my_add_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    // Field order in the value does not have to match declaration order.
    let value = Value::Struct(vec![
        ("sum".to_string(), Value::UInt(0)),
        ("a".to_string(), Value::UInt(9)),
        ("b".to_string(), Value::UInt(12)),
        ("paddA".to_string(), Value::UInt(1)),
        ("paddB".to_string(), Value::UInt(2)),
        ("paddC".to_string(), Value::UInt(3)),
    ]);
    let bytes = marshaler.encode(&value, &layout).expect("encode");
    assert_eq!(bytes.len(), 24);

    assert_eq!(bytes[0], 1);
    assert_eq!(&bytes[1..4], [0, 0, 0], "padding after paddA must stay zero");
    assert_eq!(&bytes[4..8], 9u32.to_le_bytes());
    assert_eq!(bytes[8], 2);
    assert_eq!(&bytes[9..12], [0, 0, 0], "padding after paddB must stay zero");
    assert_eq!(&bytes[12..16], 12u32.to_le_bytes());
    assert_eq!(bytes[16], 3);
    assert_eq!(&bytes[17..20], [0, 0, 0], "padding after paddC must stay zero");
    assert_eq!(&bytes[20..24], 0u32.to_le_bytes());

    // Decode reads fields back in declaration order.
    let expected = Value::Struct(vec![
        ("paddA".to_string(), Value::UInt(1)),
        ("a".to_string(), Value::UInt(9)),
        ("paddB".to_string(), Value::UInt(2)),
        ("b".to_string(), Value::UInt(12)),
        ("paddC".to_string(), Value::UInt(3)),
        ("sum".to_string(), Value::UInt(0)),
    ]);
    assert_eq!(marshaler.decode(&bytes, &layout).expect("decode"), expected);
}

#[test]
fn test_struct_requires_every_field()
{
    let image = demo_image();
    let layout = image.type_layout("pair_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    let value = Value::Struct(vec![("first".to_string(), Value::UInt(1))]);
    match marshaler.encode(&value, &layout)
    {
        Err(OnTargetError::TypeMismatch { expected, .. }) =>
        {
            assert!(expected.contains("field second"), "unexpected message: {expected}");
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_struct_rejects_unknown_fields()
{
    let image = demo_image();
    let layout = image.type_layout("pair_t").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    let value = Value::Struct(vec![
        ("first".to_string(), Value::UInt(1)),
        ("second".to_string(), Value::UInt(2)),
        ("third".to_string(), Value::UInt(3)),
    ]);
    match marshaler.encode(&value, &layout)
    {
        Err(OnTargetError::TypeMismatch { found, .. }) =>
        {
            assert!(found.contains("unexpected field third"), "unexpected message: {found}");
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_string_gets_a_nul_and_overflows_at_capacity()
{
    let image = demo_image();
    let layout = image.type_layout("name_t").expect("char[16] typedef");
    let marshaler = Marshaler::new(Endianness::Little);

    // 15 characters plus the terminator exactly fill the buffer.
    let fits = "abcdefghijklmno";
    let bytes = marshaler.encode(&Value::Str(fits.to_string()), &layout).expect("encode");
    assert_eq!(bytes.len(), 16);
    assert_eq!(&bytes[..15], fits.as_bytes());
    assert_eq!(bytes[15], 0);
    assert_eq!(
        marshaler.decode(&bytes, &layout).expect("decode"),
        Value::Str(fits.to_string())
    );

    // One more character and the terminator no longer fits.
    let too_long = "abcdefghijklmnop";
    match marshaler.encode(&Value::Str(too_long.to_string()), &layout)
    {
        Err(OnTargetError::BufferOverflow { capacity, required, .. }) =>
        {
            assert_eq!(capacity, 16);
            assert_eq!(required, 17);
        }
        other => panic!("Expected BufferOverflow, got {other:?}"),
    }
}

#[test]
fn test_array_round_trip_and_length_check()
{
    let image = demo_image();
    let layout = image.type_layout("quad_t").expect("uint32_t[4] typedef");
    let marshaler = Marshaler::new(Endianness::Little);

    let value = Value::Array(vec![
        Value::UInt(1),
        Value::UInt(2),
        Value::UInt(3),
        Value::UInt(4),
    ]);
    let bytes = marshaler.encode(&value, &layout).expect("encode");
    assert_eq!(bytes.len(), 16);
    assert_eq!(marshaler.decode(&bytes, &layout).expect("decode"), value);

    let short = Value::Array(vec![Value::UInt(1)]);
    match marshaler.encode(&short, &layout)
    {
        Err(OnTargetError::TypeMismatch { expected, .. }) =>
        {
            assert!(expected.contains("4 elements"), "unexpected message: {expected}");
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_bool_accepts_zero_and_one()
{
    let image = demo_image();
    let layout = image.type_layout("bool").expect("layout");
    let marshaler = Marshaler::new(Endianness::Little);

    assert_eq!(marshaler.encode(&Value::Bool(true), &layout).expect("encode"), [1]);
    assert_eq!(marshaler.encode(&Value::UInt(1), &layout).expect("encode"), [1]);
    assert_eq!(marshaler.encode(&Value::Int(0), &layout).expect("encode"), [0]);
    assert!(marshaler.encode(&Value::UInt(2), &layout).is_err());
    assert_eq!(marshaler.decode(&[0], &layout).expect("decode"), Value::Bool(false));
}

#[test]
fn test_function_pointer_must_point_at_a_function()
{
    let image = demo_image();
    let sig = image.function_signature("example_CustomOperation").expect("signature");
    let fn_ptr = &sig.params[0];
    let marshaler = Marshaler::with_symbols(Endianness::Little, image.symbols());

    // A real function entry is accepted.
    let bytes = marshaler
        .encode(&Value::Pointer(Address::new(ADDITION)), fn_ptr)
        .expect("function address");
    assert_eq!(bytes, (ADDITION as u32).to_le_bytes());

    // Null stays allowed so firmware null-pointer handling can be tested.
    marshaler.encode(&Value::Pointer(Address::new(0)), fn_ptr).expect("null pointer");

    // A data symbol is not callable.
    match marshaler.encode(&Value::Pointer(Address::new(RAM_BASE + 0x10)), fn_ptr)
    {
        Err(OnTargetError::TypeMismatch { found, .. }) =>
        {
            assert!(
                found.contains("non-function symbol g_counter"),
                "unexpected message: {found}"
            );
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }

    // Neither is an address nothing covers.
    match marshaler.encode(&Value::Pointer(Address::new(0x0900_0000)), fn_ptr)
    {
        Err(OnTargetError::TypeMismatch { found, .. }) =>
        {
            assert!(found.contains("no known symbol covers"), "unexpected message: {found}");
        }
        other => panic!("Expected TypeMismatch, got {other:?}"),
    }
}

#[test]
fn test_data_pointers_are_not_validated_against_symbols()
{
    let image = demo_image();
    let sig = image.function_signature("example_AdditionPtr").expect("signature");
    let data_ptr = &sig.params[0];
    let marshaler = Marshaler::with_symbols(Endianness::Little, image.symbols());

    // Data can live anywhere, e.g. in freshly allocated target memory.
    let address = RAM_BASE + 0x4000;
    let bytes = marshaler.encode(&Value::Pointer(Address::new(address)), data_ptr).expect("encode");
    assert_eq!(
        marshaler.decode(&bytes, data_ptr).expect("decode"),
        Value::Pointer(Address::new(address))
    );
}

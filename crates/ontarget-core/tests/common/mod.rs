#![allow(dead_code)]

//! Shared fixtures: a synthetic firmware image with real DWARF in it, and
//! a simulated session wired to that image.
//!
//! The image describes a small C test fixture: a couple of `example_*`
//! functions, a padded struct, and the hook and rendezvous symbols the
//! engine looks for. Addresses are arbitrary flash-like values; the
//! simulated adapter never executes them, behaviors script what "running"
//! does instead.

use std::collections::HashMap;
use std::sync::Arc;

use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Sections, UnitEntryId};
use gimli::{Encoding, Format, LittleEndian};

use ontarget_core::adapter::sim::{SimAdapter, SimEvent, SimState};
use ontarget_core::config::{MonitorType, TargetConfig};
use ontarget_core::mem::MemModel;
use ontarget_core::session::Session;
use ontarget_core::symbols::{Image, Symbol, SymbolKind, SymbolTable};
use ontarget_core::types::{Address, Endianness};

pub const RAM_BASE: u64 = 0x2000_0000;
pub const RAM_SIZE: usize = 64 * 1024;

pub const RESET_HANDLER: u64 = 0x0800_0004;
pub const MAIN: u64 = 0x0800_0050;
pub const ADDITION: u64 = 0x0800_0100;
pub const ADDITION_PTR: u64 = 0x0800_0140;
pub const ADDITION_STRUCT: u64 = 0x0800_0180;
pub const MANY_ARGS: u64 = 0x0800_01c0;
pub const STRING_LEN: u64 = 0x0800_0200;
pub const FUNCTOR_ADD: u64 = 0x0800_0240;
pub const CUSTOM_OPERATION: u64 = 0x0800_0280;
pub const TEST_HOOK: u64 = 0x0800_0300;
pub const MAKE_PAIR: u64 = 0x0800_0340;
pub const MAKE_U64: u64 = 0x0800_0380;
pub const NOP: u64 = 0x0800_03c0;
pub const NO_ARGS: u64 = 0x0800_0400;
pub const SUM_ELEMENTS: u64 = 0x0800_0440;
pub const REG_FUNC_PTR_A: u64 = 0x0800_0480;
pub const REG_FUNC_PTR_NULL: u64 = 0x0800_04c0;
pub const REG_FUNC_PTR_PARAM: u64 = 0x0800_0500;
pub const RUN_LOOP: u64 = 0x0800_0800;
pub const LED_TOGGLE: u64 = 0x0800_0840;

/// Global function pointer cell the `reg_func_ptr_*` setters write.
pub const FUNC_A: u64 = RAM_BASE + 0x14;

/// Hook buffer published by the scripted test hook, outside the stack.
pub const HOOK_BUFFER: u64 = 0x2000_8000;
pub const HOOK_BUFFER_SIZE: u32 = 0x100;

fn string(text: &str) -> AttributeValue
{
    AttributeValue::String(text.as_bytes().to_vec())
}

fn base_type(dwarf: &mut DwarfUnit, name: &str, size: u64, encoding: gimli::DwAte) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_base_type);
    let entry = dwarf.unit.get_mut(id);
    entry.set(gimli::DW_AT_name, string(name));
    entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(size));
    entry.set(gimli::DW_AT_encoding, AttributeValue::Encoding(encoding));
    id
}

fn pointer_to(dwarf: &mut DwarfUnit, target: UnitEntryId) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_pointer_type);
    let entry = dwarf.unit.get_mut(id);
    entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(4));
    entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(target));
    id
}

fn struct_type(dwarf: &mut DwarfUnit, name: &str, size: u64) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_structure_type);
    let entry = dwarf.unit.get_mut(id);
    entry.set(gimli::DW_AT_name, string(name));
    entry.set(gimli::DW_AT_byte_size, AttributeValue::Udata(size));
    id
}

fn member(dwarf: &mut DwarfUnit, parent: UnitEntryId, name: &str, offset: u64, ty: UnitEntryId)
{
    let id = dwarf.unit.add(parent, gimli::DW_TAG_member);
    let entry = dwarf.unit.get_mut(id);
    entry.set(gimli::DW_AT_name, string(name));
    entry.set(gimli::DW_AT_data_member_location, AttributeValue::Udata(offset));
    entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(ty));
}

fn typedef(dwarf: &mut DwarfUnit, name: &str, target: UnitEntryId) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_typedef);
    let entry = dwarf.unit.get_mut(id);
    entry.set(gimli::DW_AT_name, string(name));
    entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(target));
    id
}

fn array_of(dwarf: &mut DwarfUnit, elem: UnitEntryId, count: u64) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_array_type);
    dwarf.unit.get_mut(id).set(gimli::DW_AT_type, AttributeValue::UnitRef(elem));
    let subrange = dwarf.unit.add(id, gimli::DW_TAG_subrange_type);
    dwarf.unit.get_mut(subrange).set(gimli::DW_AT_count, AttributeValue::Udata(count));
    id
}

fn subroutine_type(
    dwarf: &mut DwarfUnit,
    ret: Option<UnitEntryId>,
    params: &[UnitEntryId],
) -> UnitEntryId
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_subroutine_type);
    if let Some(ret) = ret
    {
        dwarf.unit.get_mut(id).set(gimli::DW_AT_type, AttributeValue::UnitRef(ret));
    }
    for &param in params
    {
        let p = dwarf.unit.add(id, gimli::DW_TAG_formal_parameter);
        dwarf.unit.get_mut(p).set(gimli::DW_AT_type, AttributeValue::UnitRef(param));
    }
    id
}

fn subprogram(
    dwarf: &mut DwarfUnit,
    name: &str,
    low_pc: u64,
    ret: Option<UnitEntryId>,
    params: &[UnitEntryId],
)
{
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    {
        let entry = dwarf.unit.get_mut(id);
        entry.set(gimli::DW_AT_name, string(name));
        entry.set(
            gimli::DW_AT_low_pc,
            AttributeValue::Address(gimli::write::Address::Constant(low_pc)),
        );
        if let Some(ret) = ret
        {
            entry.set(gimli::DW_AT_type, AttributeValue::UnitRef(ret));
        }
    }
    for &param in params
    {
        let p = dwarf.unit.add(id, gimli::DW_TAG_formal_parameter);
        dwarf.unit.get_mut(p).set(gimli::DW_AT_type, AttributeValue::UnitRef(param));
    }
}

fn function_symbol(table: &mut SymbolTable, name: &str, address: u64)
{
    table.insert(Symbol {
        name: name.to_string(),
        demangled: None,
        address: Address::new(address),
        size: 0x20,
        kind: SymbolKind::Function,
    });
}

/// Builds the demo firmware image: DWARF the layout reader can walk plus
/// a symbol table that covers every function.
pub fn demo_image() -> Image
{
    let encoding = Encoding { format: Format::Dwarf32, version: 4, address_size: 4 };
    let mut dwarf = DwarfUnit::new(encoding);

    let uint8 = base_type(&mut dwarf, "uint8_t", 1, gimli::DW_ATE_unsigned);
    let uint32 = base_type(&mut dwarf, "uint32_t", 4, gimli::DW_ATE_unsigned);
    let int = base_type(&mut dwarf, "int", 4, gimli::DW_ATE_signed);
    let chr = base_type(&mut dwarf, "char", 1, gimli::DW_ATE_signed_char);
    let uint64 = base_type(&mut dwarf, "uint64_t", 8, gimli::DW_ATE_unsigned);
    let uint16 = base_type(&mut dwarf, "uint16_t", 2, gimli::DW_ATE_unsigned);
    base_type(&mut dwarf, "bool", 1, gimli::DW_ATE_boolean);

    // The classic padded accumulator struct: three one-byte pads force
    // three-byte holes before each word member.
    let my_add = struct_type(&mut dwarf, "my_add_t", 24);
    member(&mut dwarf, my_add, "paddA", 0, uint8);
    member(&mut dwarf, my_add, "a", 4, uint32);
    member(&mut dwarf, my_add, "paddB", 8, uint8);
    member(&mut dwarf, my_add, "b", 12, uint32);
    member(&mut dwarf, my_add, "paddC", 16, uint8);
    member(&mut dwarf, my_add, "sum", 20, uint32);

    let pair = struct_type(&mut dwarf, "pair_t", 8);
    member(&mut dwarf, pair, "first", 0, uint32);
    member(&mut dwarf, pair, "second", 4, uint32);

    typedef(&mut dwarf, "my_uint", uint32);
    let quad = array_of(&mut dwarf, uint32, 4);
    typedef(&mut dwarf, "quad_t", quad);
    let name_buf = array_of(&mut dwarf, chr, 16);
    typedef(&mut dwarf, "name_t", name_buf);

    let uint32_ptr = pointer_to(&mut dwarf, uint32);
    let uint16_ptr = pointer_to(&mut dwarf, uint16);
    let char_ptr = pointer_to(&mut dwarf, chr);
    let uint8_ptr = pointer_to(&mut dwarf, uint8);
    let binary_op = subroutine_type(&mut dwarf, Some(int), &[int, int]);
    let binary_op_ptr = pointer_to(&mut dwarf, binary_op);
    let nullary_op = subroutine_type(&mut dwarf, Some(uint32), &[]);
    let func_ptr = pointer_to(&mut dwarf, nullary_op);
    typedef(&mut dwarf, "func_ptr_t", func_ptr);

    subprogram(&mut dwarf, "Reset_Handler", RESET_HANDLER, None, &[]);
    subprogram(&mut dwarf, "main", MAIN, Some(int), &[]);
    subprogram(&mut dwarf, "example_Addition", ADDITION, Some(uint32), &[uint32, uint32]);
    subprogram(
        &mut dwarf,
        "example_AdditionPtr",
        ADDITION_PTR,
        Some(uint32),
        &[uint32_ptr, uint32_ptr],
    );
    subprogram(&mut dwarf, "example_AdditionStruct", ADDITION_STRUCT, Some(uint32), &[my_add]);
    subprogram(
        &mut dwarf,
        "example_ManyArgs",
        MANY_ARGS,
        Some(uint32),
        &[uint32, uint32, uint32, uint32, uint32, uint32],
    );
    subprogram(&mut dwarf, "example_StringLen", STRING_LEN, Some(uint32), &[char_ptr]);
    subprogram(&mut dwarf, "example_NoArgs", NO_ARGS, Some(uint32), &[]);
    subprogram(&mut dwarf, "example_SumElements", SUM_ELEMENTS, Some(int), &[uint16_ptr, uint16]);
    subprogram(&mut dwarf, "example_FunctorAdd", FUNCTOR_ADD, Some(int), &[int, int]);
    subprogram(
        &mut dwarf,
        "example_CustomOperation",
        CUSTOM_OPERATION,
        Some(int),
        &[binary_op_ptr, int, int],
    );
    subprogram(&mut dwarf, "reg_func_ptr_a", REG_FUNC_PTR_A, None, &[]);
    subprogram(&mut dwarf, "reg_func_ptr_null", REG_FUNC_PTR_NULL, None, &[]);
    subprogram(&mut dwarf, "reg_func_ptr_param", REG_FUNC_PTR_PARAM, None, &[func_ptr]);
    subprogram(&mut dwarf, "example_MakePair", MAKE_PAIR, Some(pair), &[uint32, uint32]);
    subprogram(&mut dwarf, "example_MakeU64", MAKE_U64, Some(uint64), &[uint32, uint32]);
    subprogram(&mut dwarf, "example_Nop", NOP, None, &[]);
    subprogram(
        &mut dwarf,
        "ontarget_test_hook_chained",
        TEST_HOOK,
        None,
        &[uint8_ptr, uint32],
    );
    subprogram(&mut dwarf, "run_loop", RUN_LOOP, None, &[]);
    subprogram(&mut dwarf, "led_toggle", LED_TOGGLE, None, &[]);

    let mut sections = Sections::new(EndianVec::new(LittleEndian));
    dwarf.write(&mut sections).expect("writing synthetic DWARF");
    let mut debug_sections: HashMap<&'static str, Arc<[u8]>> = HashMap::new();
    sections
        .for_each(|id, data| {
            debug_sections.insert(id.name(), Arc::from(data.slice().to_vec()));
            Ok::<(), gimli::Error>(())
        })
        .expect("collecting synthetic DWARF sections");

    let mut table = SymbolTable::new();
    for (name, address) in [
        ("Reset_Handler", RESET_HANDLER),
        ("main", MAIN),
        ("example_Addition", ADDITION),
        ("example_AdditionPtr", ADDITION_PTR),
        ("example_AdditionStruct", ADDITION_STRUCT),
        ("example_ManyArgs", MANY_ARGS),
        ("example_StringLen", STRING_LEN),
        ("example_NoArgs", NO_ARGS),
        ("example_SumElements", SUM_ELEMENTS),
        ("example_FunctorAdd", FUNCTOR_ADD),
        ("example_CustomOperation", CUSTOM_OPERATION),
        ("reg_func_ptr_a", REG_FUNC_PTR_A),
        ("reg_func_ptr_null", REG_FUNC_PTR_NULL),
        ("reg_func_ptr_param", REG_FUNC_PTR_PARAM),
        ("ontarget_test_hook_chained", TEST_HOOK),
        ("example_MakePair", MAKE_PAIR),
        ("example_MakeU64", MAKE_U64),
        ("example_Nop", NOP),
        ("run_loop", RUN_LOOP),
        ("led_toggle", LED_TOGGLE),
    ]
    {
        function_symbol(&mut table, name, address);
    }
    table.insert(Symbol {
        name: "g_counter".to_string(),
        demangled: None,
        address: Address::new(RAM_BASE + 0x10),
        size: 4,
        kind: SymbolKind::Object,
    });
    table.insert(Symbol {
        name: "func_a".to_string(),
        demangled: None,
        address: Address::new(FUNC_A),
        size: 4,
        kind: SymbolKind::Object,
    });

    Image::from_parts("demo.elf", Endianness::Little, table, debug_sections)
}

/// Configuration for a simulated target. Short timeout so a wedged test
/// fails in seconds, not minutes.
pub fn sim_config() -> TargetConfig
{
    let mut config = TargetConfig::new("sim-cortex-m4", "demo.elf");
    config.monitor_type = MonitorType::Sim;
    config.default_timeout_secs = 2;
    config
}

/// Like [`sim_config`], with a chosen on-target memory model.
pub fn sim_config_with_model(model: MemModel) -> TargetConfig
{
    let mut config = sim_config();
    config.on_target_mem_model = model;
    config
}

/// Connects a session over the given simulator and attaches the demo
/// image to it.
pub fn connect_sim(sim: SimAdapter, config: TargetConfig) -> Session
{
    let session = Session::connect_with(Box::new(sim), config).expect("simulated connect");
    session.attach_image(demo_image()).expect("attach demo image");
    session
}

/// One-call variant: new simulator, scripted behavior, demo image.
pub fn session_with_behavior(
    behavior: impl FnMut(&mut SimState) -> SimEvent + Send + 'static,
    config: TargetConfig,
) -> Session
{
    let mut sim = SimAdapter::new(RAM_BASE, RAM_SIZE);
    sim.set_behavior(behavior);
    connect_sim(sim, config)
}

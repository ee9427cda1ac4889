//! Session lifecycle and target access against the simulated adapter:
//! the run-state machine, raw memory and register IO, reset, and
//! teardown behavior.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{
    session_with_behavior, sim_config, sim_config_with_model, ADDITION, RAM_BASE, RAM_SIZE,
};
use ontarget_core::adapter::sim::{SimAdapter, SimEvent};
use ontarget_core::error::OnTargetError;
use ontarget_core::marshal::Value;
use ontarget_core::mem::MemModel;
use ontarget_core::session::{RunState, Session};
use ontarget_core::symbols::{Image, Symbol, SymbolKind, SymbolTable};
use ontarget_core::types::{Address, CoreRegister, Endianness};

fn idle_session() -> Session
{
    session_with_behavior(|_state| SimEvent::KeepRunning, sim_config())
}

#[test]
fn test_connect_leaves_the_target_halted()
{
    let session = idle_session();
    assert_eq!(session.run_state(), RunState::Halted);
    assert_eq!(session.default_timeout(), Duration::from_secs(2));
    assert_eq!(session.halt().expect("pc"), Address::new(0));
    session.disconnect().expect("disconnect");
}

#[test]
fn test_resume_and_halt_round_trip()
{
    let session = idle_session();

    session.resume().expect("resume");
    assert_eq!(session.run_state(), RunState::Running);

    // Resuming a running target is a no-op, not an error.
    session.resume().expect("second resume");

    let pc = session.halt().expect("halt");
    assert_eq!(pc, Address::new(0));
    assert_eq!(session.run_state(), RunState::Halted);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_single_step_advances_the_pc()
{
    let session = idle_session();
    assert_eq!(session.step_insn().expect("step"), Address::new(2));
    assert_eq!(session.step_insn().expect("step"), Address::new(4));
    assert_eq!(session.run_state(), RunState::Halted);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_target_access_requires_a_halted_target()
{
    let session = idle_session();
    session.resume().expect("resume");

    match session.read_registers()
    {
        Err(OnTargetError::UnsupportedOperation { operation, details }) =>
        {
            assert_eq!(operation, "read_registers");
            assert!(details.contains("running"), "details were {details:?}");
        }
        other => panic!("Expected a refusal, got {other:?}"),
    }
    assert!(session.write_reg("r0", 1).is_err());
    match session.step_insn()
    {
        Err(OnTargetError::UnsupportedOperation { operation, .. }) => assert_eq!(operation, "step"),
        other => panic!("Expected a refusal, got {other:?}"),
    }
    match session.with_stack_scratch(16, |_, _| Ok(()))
    {
        Err(OnTargetError::UnsupportedOperation { operation, .. }) =>
        {
            assert_eq!(operation, "with_stack_scratch")
        }
        other => panic!("Expected a refusal, got {other:?}"),
    }

    session.halt().expect("halt");
    session.read_registers().expect("registers after halt");
    session.disconnect().expect("disconnect");
}

#[test]
fn test_memory_io_round_trips()
{
    let session = idle_session();
    let address = Address::new(RAM_BASE + 0x100);

    session.write_mem(address, &[1, 2, 3, 4, 5]).expect("write");
    assert_eq!(session.read_mem(address, 5).expect("read"), vec![1, 2, 3, 4, 5]);

    // Words go through the configured device byte order.
    session.write_u32(address, 0xdead_beef).expect("write word");
    assert_eq!(session.read_mem(address, 4).expect("read"), vec![0xef, 0xbe, 0xad, 0xde]);
    assert_eq!(session.read_u32(address).expect("read word"), 0xdead_beef);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_read_cstring_stops_at_the_nul()
{
    let session = idle_session();
    let address = Address::new(RAM_BASE + 0x200);

    session.write_mem(address, b"hello\0world").expect("write");
    assert_eq!(session.read_cstring(address, 64).expect("read"), "hello");

    // Without a NUL inside the limit, the read stops at the limit.
    assert_eq!(session.read_cstring(address, 3).expect("read"), "hel");

    // Strings longer than one internal chunk still come back whole.
    let long = "x".repeat(70);
    let mut bytes = long.clone().into_bytes();
    bytes.push(0);
    session.write_mem(address, &bytes).expect("write long");
    assert_eq!(session.read_cstring(address, 256).expect("read long"), long);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_register_io_by_name_and_by_file()
{
    let session = idle_session();
    let stack_top = (RAM_BASE + RAM_SIZE as u64) as u32;
    assert_eq!(session.read_reg("sp").expect("sp"), stack_top);

    session.write_reg("r5", 0x1234).expect("write r5");
    assert_eq!(session.read_reg("r5").expect("r5"), 0x1234);

    let mut regs = session.read_registers().expect("registers");
    regs.set(CoreRegister::R9, 0xabcd);
    session.write_registers(&regs).expect("write file");
    assert_eq!(session.read_registers().expect("registers"), regs);

    match session.read_reg("floof")
    {
        Err(OnTargetError::UnknownSymbol { name }) => assert_eq!(name, "floof"),
        other => panic!("Expected an unknown register, got {other:?}"),
    }
    session.disconnect().expect("disconnect");
}

#[test]
fn test_reset_clears_engine_state()
{
    let session = idle_session();

    session.write_reg("sp", 0x2000_1000).expect("move sp");

    // A timed-out wait leaves its label armed and the target running.
    assert!(session.wait_for_label("led_toggle", Some(Duration::from_millis(10))).is_err());
    assert_eq!(session.installed_breakpoints().expect("breakpoints").len(), 1);

    session.reset().expect("reset");
    assert_eq!(session.run_state(), RunState::Halted);
    assert!(session.installed_breakpoints().expect("breakpoints").is_empty());
    assert_eq!(session.halt().expect("pc"), Address::new(0));
    let stack_top = (RAM_BASE + RAM_SIZE as u64) as u32;
    assert_eq!(session.read_reg("sp").expect("sp"), stack_top);

    // The label book was dropped too; waiting again arms from scratch.
    assert!(session.wait_for_label("led_toggle", Some(Duration::from_millis(10))).is_err());
    assert_eq!(session.installed_breakpoints().expect("breakpoints").len(), 1);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_session_symbol_lookups_cover_attached_images()
{
    let session = idle_session();

    assert_eq!(session.resolve("example_Addition").expect("symbol").address.value(), ADDITION);
    assert_eq!(session.sizeof("my_add_t").expect("sizeof"), 24);
    assert_eq!(session.function_signature("example_Addition").expect("signature").params.len(), 2);

    let location = session.locate(Address::new(ADDITION + 2)).expect("location");
    assert_eq!(location.function.as_deref(), Some("example_Addition"));

    match session.resolve("example_Missing")
    {
        Err(OnTargetError::UnknownSymbol { name }) => assert_eq!(name, "example_Missing"),
        other => panic!("Expected an unknown symbol, got {other:?}"),
    }
    session.disconnect().expect("disconnect");
}

#[test]
fn test_bootloader_symbols_attach_at_an_offset()
{
    let session = idle_session();

    // Bootloader symbol files are linked at zero; the configured load
    // address shifts every entry on attach.
    let mut table = SymbolTable::new();
    table.insert(Symbol {
        name: "bl_entry".to_string(),
        demangled: None,
        address: Address::new(0x40),
        size: 0x20,
        kind: SymbolKind::Function,
    });
    let image = Image::from_parts("bl.elf", Endianness::Little, table, HashMap::new());
    session.attach_image_at(image, 0x0800_0000).expect("attach");

    assert_eq!(session.resolve("bl_entry").expect("symbol").address.value(), 0x0800_0040);
    assert_eq!(session.resolve("example_Addition").expect("symbol").address.value(), ADDITION);
    session.disconnect().expect("disconnect");
}

#[test]
fn test_disconnect_is_idempotent_and_final()
{
    let session = idle_session();
    session.disconnect().expect("disconnect");
    session.disconnect().expect("second disconnect");
    assert_eq!(session.run_state(), RunState::Disconnected);

    let closed = |result: Result<(), OnTargetError>| {
        matches!(result, Err(OnTargetError::SessionClosed))
    };
    assert!(closed(session.resume()));
    assert!(closed(session.halt().map(drop)));
    assert!(closed(session.read_mem(Address::new(RAM_BASE), 4).map(drop)));
    assert!(closed(session.invoke("example_Addition", &[Value::UInt(1)]).map(drop)));
    assert!(closed(session.wait_for_label("led_toggle", None).map(drop)));
    assert!(closed(session.alloc_bytes(4, 4).map(drop)));
}

#[test]
fn test_connect_rejects_an_invalid_config()
{
    let mut config = sim_config_with_model(MemModel::PreStack);
    config.on_target_mem_prestack_alloc_size = 30;

    let adapter = Box::new(SimAdapter::new(RAM_BASE, RAM_SIZE));
    match Session::connect_with(adapter, config)
    {
        Err(OnTargetError::Config(_)) => {}
        other => panic!("Expected a configuration error, got {other:?}"),
    }
}

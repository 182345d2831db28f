mod shared;

use eb::{
    Config, Error, ExceptionBehavior, ExceptionMask, ExceptionMode, FaultInjection, Kernel as _,
    ThreadState, ThreadStateFlavor, PORT_NULL,
};
use shared::{eb, Harness};
use std::time::Duration;

fn foreign_handlers(h: &Harness) -> (eb::ThreadId, eb::Port, eb::Port) {
    let thread = h.kernel.spawn_thread(ThreadState::zeroed());
    let access = h.add_foreign_handler(thread, ExceptionMask::BAD_ACCESS);

    let arith = h.kernel.create_port(PORT_NULL).unwrap();
    h.kernel
        .set_exception_ports(
            thread,
            &eb::ChainBackEntry {
                mask: ExceptionMask::ARITHMETIC | ExceptionMask::BREAKPOINT,
                handler: arith,
                behavior: ExceptionBehavior::DEFAULT,
                flavor: ThreadStateFlavor::FLOAT,
            },
        )
        .unwrap();

    (thread, access, arith)
}

#[test]
fn uninstall_restores_previous_handlers() {
    let h = Harness::hook_all();
    let (thread, access, arith) = foreign_handlers(&h);
    let before = h.kernel.exception_ports(thread);
    let own = h.exception_port();

    h.coordinator.enable_for_thread(thread).unwrap();

    let mask = h.coordinator.config().exception_mask();
    for kind in mask.types() {
        assert_eq!(h.kernel.exception_ports(thread)[kind.0 as usize].0, own);
    }

    let table = h.coordinator.registry().table(thread).unwrap();
    assert!(table.entries().iter().all(|e| e.handler != own));
    assert!(table
        .entries()
        .iter()
        .any(|e| e.handler == access && e.mask == ExceptionMask::BAD_ACCESS));
    assert!(table.entries().iter().any(|e| e.handler == arith
        && e.mask == ExceptionMask::ARITHMETIC | ExceptionMask::BREAKPOINT));

    h.coordinator.disable_for_thread(thread).unwrap();
    assert!(h.coordinator.registry().table(thread).is_none());

    let after = h.kernel.exception_ports(thread);
    for (i, (before, after)) in before.iter().zip(after.iter()).enumerate() {
        assert_eq!(before.0, after.0, "exception {i}");

        if before.0 == PORT_NULL {
            // Unset handlers can't be restored with a zero behavior or flavor
            if mask.types().any(|kind| kind.0 as usize == i) {
                assert_eq!(after.1, ExceptionBehavior::DEFAULT);
                assert_eq!(after.2, ThreadStateFlavor::GENERAL);
            }
        } else {
            assert_eq!(before, after, "exception {i}");
        }
    }
}

#[test]
fn nested_installs_never_chain_to_ourselves() {
    let h = Harness::hook_all();
    let (thread, access, arith) = foreign_handlers(&h);
    let before = h.kernel.exception_ports(thread);
    let own = h.exception_port();

    for _ in 0..3 {
        h.coordinator.enable_for_thread(thread).unwrap();
    }

    let table = h.coordinator.registry().table(thread).unwrap();
    assert!(table.entries().iter().all(|e| e.handler != own));

    let access_entry = h
        .coordinator
        .registry()
        .lookup(&*h.kernel, thread, eb::ExceptionType::BAD_ACCESS)
        .unwrap();
    assert_eq!(access_entry.handler, access);

    let arith_entry = h
        .coordinator
        .registry()
        .lookup(&*h.kernel, thread, eb::ExceptionType::BREAKPOINT)
        .unwrap();
    assert_eq!(arith_entry.handler, arith);
    assert_eq!(arith_entry.flavor, ThreadStateFlavor::FLOAT);

    // Nothing was registered for illegal instructions
    assert!(h
        .coordinator
        .registry()
        .lookup(&*h.kernel, thread, eb::ExceptionType::BAD_INSTRUCTION)
        .is_none());

    h.coordinator.disable_for_thread(thread).unwrap();
    let after = h.kernel.exception_ports(thread);
    for (before, after) in before.iter().zip(after.iter()) {
        assert_eq!(before.0, after.0);
    }
}

#[test]
fn suppressed_modes_register_less() {
    let h = Harness::new(Config {
        mode: ExceptionMode::SUPPRESS_DEBUGGING | ExceptionMode::SUPPRESS_ILLEGAL,
        fault_injection: None,
    });
    let (thread, _access, arith) = foreign_handlers(&h);
    let own = h.exception_port();

    h.coordinator.enable_for_thread(thread).unwrap();

    let ports = h.kernel.exception_ports(thread);
    for kind in (ExceptionMask::BAD_ACCESS | ExceptionMask::ARITHMETIC).types() {
        assert_eq!(ports[kind.0 as usize].0, own);
    }

    // Left to the debugger
    assert_eq!(ports[eb::ExceptionType::BREAKPOINT.0 as usize].0, arith);
    assert_eq!(ports[eb::ExceptionType::BAD_INSTRUCTION.0 as usize].0, PORT_NULL);
}

#[test]
fn suppressing_everything_registers_nothing() {
    let h = Harness::new(Config {
        mode: ExceptionMode::all(),
        fault_injection: None,
    });
    let (thread, _access, _arith) = foreign_handlers(&h);
    let before = h.kernel.exception_ports(thread);

    h.coordinator.enable_for_thread(thread).unwrap();

    assert_eq!(h.kernel.exception_ports(thread), before);
    assert!(h.coordinator.registry().table(thread).is_none());
}

#[test]
fn injected_install_failures() {
    let h = Harness::new(Config {
        mode: ExceptionMode::empty(),
        fault_injection: Some(FaultInjection::Install),
    });
    let (thread, _access, _arith) = foreign_handlers(&h);
    let before = h.kernel.exception_ports(thread);

    assert!(matches!(
        h.coordinator.enable_for_thread(thread),
        Err(Error::InjectedFailure(_))
    ));
    assert_eq!(h.kernel.exception_ports(thread), before);
}

#[test]
fn uninstalling_unknown_threads_is_fine() {
    let h = Harness::hook_all();
    let thread = h.kernel.spawn_thread(ThreadState::zeroed());
    h.coordinator.disable_for_thread(thread).unwrap();
}

#[test]
fn registration_never_blocks_lookups() {
    let h = Harness::hook_all();
    let thread = h.kernel.spawn_thread(ThreadState::zeroed());
    h.coordinator.enable_for_thread(thread).unwrap();

    // Anything run while the ports are swapped may fault, which needs the
    // monitor to be able to look up the thread's handlers
    let registry = h.coordinator.registry().clone();
    h.kernel.on_swap(move || {
        let registry = registry.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _table = registry.table(thread);
            let _res = tx.send(());
        });

        assert!(
            rx.recv_timeout(Duration::from_secs(10)).is_ok(),
            "the registry stayed locked while exception ports were swapped"
        );
    });

    h.coordinator.enable_for_thread(thread).unwrap();
    assert!(h.coordinator.registry().table(thread).is_some());
}

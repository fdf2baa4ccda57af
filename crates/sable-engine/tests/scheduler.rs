//! Scheduler integration tests: tasks, timers, intervals and the worker
//! pool round trip
//!
//! Callbacks are native functions recording into per-test statics; worker
//! results are observed through a thread-local to prove the callback runs
//! on the thread driving the VM.

use parking_lot::Mutex;
use sable_bytecode::{BlockBuilder, Constant, Opcode};
use sable_core::{CompilerArtifacts, Value};
use sable_engine::{NativeError, RunFlags, Vm, VmContext, WorkerOutput};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_vm(artifacts: Arc<CompilerArtifacts>) -> Vm {
    let flags = RunFlags {
        single_worker: true,
        ..RunFlags::default()
    };
    Vm::new(VmContext::new(artifacts, flags))
}

#[test]
fn test_timers_fire_in_deadline_order() {
    static RECORDED: Mutex<Vec<i64>> = Mutex::new(Vec::new());

    fn record(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        RECORDED.lock().push(args[0].as_integer());
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("timer_order_record", 1, record);
    let callback = vm.native_value("timer_order_record").unwrap();

    let now = Instant::now();
    vm.register_timer(now + Duration::from_millis(30), callback, Value::integer(30));
    vm.register_timer(now + Duration::from_millis(10), callback, Value::integer(10));
    vm.register_timer(now + Duration::from_millis(20), callback, Value::integer(20));
    vm.start_runtime();

    assert_eq!(*RECORDED.lock(), vec![10, 20, 30]);
}

#[test]
fn test_equal_deadlines_preserve_insertion_order() {
    static RECORDED: Mutex<Vec<i64>> = Mutex::new(Vec::new());

    fn record(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        RECORDED.lock().push(args[0].as_integer());
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("tie_record", 1, record);
    let callback = vm.native_value("tie_record").unwrap();

    let deadline = Instant::now() + Duration::from_millis(10);
    vm.register_timer(deadline, callback, Value::integer(1));
    vm.register_timer(deadline, callback, Value::integer(2));
    vm.register_timer(deadline, callback, Value::integer(3));
    vm.start_runtime();

    assert_eq!(*RECORDED.lock(), vec![1, 2, 3]);
}

#[test]
fn test_tasks_dispatch_in_enqueue_order() {
    static RECORDED: Mutex<Vec<i64>> = Mutex::new(Vec::new());

    fn record(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        RECORDED.lock().push(args[0].as_integer());
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("task_record", 1, record);
    let callback = vm.native_value("task_record").unwrap();

    for i in 1..=4 {
        vm.register_task(callback, Value::integer(i));
    }
    vm.start_runtime();

    assert_eq!(*RECORDED.lock(), vec![1, 2, 3, 4]);
}

#[test]
fn test_clear_timer_is_idempotent() {
    static FIRED: Mutex<Vec<i64>> = Mutex::new(Vec::new());

    fn record(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        FIRED.lock().push(args[0].as_integer());
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("clear_record", 1, record);
    let callback = vm.native_value("clear_record").unwrap();

    let now = Instant::now();
    let cancelled =
        vm.register_timer(now + Duration::from_millis(10), callback, Value::integer(1));
    vm.register_timer(now + Duration::from_millis(20), callback, Value::integer(2));

    vm.clear_timer(cancelled);
    vm.clear_timer(cancelled);
    vm.clear_timer(9999);
    vm.start_runtime();

    assert_eq!(*FIRED.lock(), vec![2]);
}

#[test]
fn test_interval_reschedules_until_cleared() {
    static COUNT: AtomicUsize = AtomicUsize::new(0);
    static INTERVAL_ID: AtomicU64 = AtomicU64::new(0);

    fn tick(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        let fired = COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        if fired >= 3 {
            vm.clear_interval(INTERVAL_ID.load(Ordering::SeqCst));
        }
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("interval_tick", 0, tick);
    let callback = vm.native_value("interval_tick").unwrap();

    let id = vm.register_interval(Duration::from_millis(5), callback, Value::null());
    INTERVAL_ID.store(id, Ordering::SeqCst);
    vm.start_runtime();

    assert_eq!(COUNT.load(Ordering::SeqCst), 3);
}

#[test]
fn test_worker_round_trip_runs_callback_on_main_thread() {
    use std::cell::Cell;
    thread_local! {
        // Mutated without synchronization: only valid because the
        // callback runs on the thread driving the VM
        static SUM: Cell<i64> = const { Cell::new(0) };
    }

    fn on_done(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        SUM.with(|sum| sum.set(args[0].as_integer()));
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("worker_done", 1, on_done);
    let callback = vm.native_value("worker_done").unwrap();

    let k = 1000i64;
    vm.register_worker_task(
        Box::new(move || WorkerOutput::Int((1..=k).sum())),
        callback,
    );
    vm.start_runtime();

    SUM.with(|sum| assert_eq!(sum.get(), k * (k + 1) / 2));
}

#[test]
fn test_cancelled_worker_result_is_dropped() {
    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn on_done(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        FIRED.fetch_add(1, Ordering::SeqCst);
        Ok(Value::null())
    }

    fn noop(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("cancelled_done", 0, on_done);
    vm.register_native("keepalive", 0, noop);
    let callback = vm.native_value("cancelled_done").unwrap();

    let uid = vm.register_worker_task(Box::new(|| WorkerOutput::Int(1)), callback);
    vm.clear_worker_task(uid);

    // Keep the runtime alive long enough for the job to complete
    let keepalive = vm.native_value("keepalive").unwrap();
    vm.register_timer(
        Instant::now() + Duration::from_millis(100),
        keepalive,
        Value::null(),
    );
    vm.start_runtime();

    assert_eq!(FIRED.load(Ordering::SeqCst), 0);
}

#[test]
fn test_worker_error_delivers_message_string() {
    static MESSAGE: Mutex<String> = Mutex::new(String::new());

    fn on_done(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        *MESSAGE.lock() = vm.to_display(args[0]);
        Ok(Value::null())
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("error_done", 1, on_done);
    let callback = vm.native_value("error_done").unwrap();

    vm.register_worker_task(
        Box::new(|| WorkerOutput::Err("disk on fire".to_string())),
        callback,
    );
    vm.start_runtime();

    assert_eq!(*MESSAGE.lock(), "disk on fire");
}

#[test]
fn test_failed_task_does_not_stop_later_tasks() {
    static RECORDED: AtomicUsize = AtomicUsize::new(0);

    fn record(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        RECORDED.fetch_add(1, Ordering::SeqCst);
        Ok(Value::null())
    }

    // module returns a function that throws when called
    let artifacts = Arc::new(CompilerArtifacts::new());
    let thrower_name = artifacts.symtable.intern("thrower");
    let mut child = BlockBuilder::new();
    child.emit_put_value(Constant::Int(99));
    child.emit(Opcode::Throw);
    child.emit_put_value(Constant::Null);
    child.emit(Opcode::Return);
    let mut b = BlockBuilder::new();
    let child_index = b.child(child.finish());
    b.emit_put_function(thrower_name, child_index, 0, 0, false, false);
    b.emit(Opcode::Return);
    let artifact = b.finish();

    let mut vm = test_vm(artifacts);
    vm.register_native("after_failure", 0, record);

    let thrower = vm.exec_module(&artifact, 0);
    vm.heap_mut().register_temporary(thrower);
    let callback = vm.native_value("after_failure").unwrap();

    vm.register_task(thrower, Value::null());
    vm.register_task(callback, Value::null());
    vm.heap_mut().unregister_temporary(thrower);
    vm.start_runtime();

    assert_eq!(RECORDED.load(Ordering::SeqCst), 1);
    assert_eq!(vm.status_code(), 0);
}

#[test]
fn test_exit_sets_status_and_stops_runtime() {
    fn quit(vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        vm.exit(7);
        Ok(Value::null())
    }

    fn never(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        panic!("task after exit must not run");
    }

    let artifacts = Arc::new(CompilerArtifacts::new());
    let mut vm = test_vm(artifacts);
    vm.register_native("quit", 0, quit);
    vm.register_native("never", 0, never);
    let quit_cb = vm.native_value("quit").unwrap();
    let never_cb = vm.native_value("never").unwrap();

    vm.register_task(quit_cb, Value::null());
    vm.register_task(never_cb, Value::null());
    let status = vm.start_runtime();

    assert_eq!(status, 7);
    assert_eq!(vm.status_code(), 7);
}

#[test]
fn test_worker_pool_floor_is_tunable() {
    let artifacts = Arc::new(CompilerArtifacts::new());
    let flags = RunFlags {
        worker_floor: 2,
        ..RunFlags::default()
    };
    let vm = Vm::new(VmContext::new(artifacts, flags));
    assert!(vm.worker_count() >= 2);
}

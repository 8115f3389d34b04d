use glint_vm::object::{Array, Table};
use glint_vm::prelude::*;

#[test]
fn sweep_reclaims_unreferenced_interned_strings() {
    let mut vm = Vm::new();
    let baseline = vm.string_set_count();

    for i in 0..10_000 {
        vm.intern(&format!("{i:016}")).expect("intern");
    }
    assert_eq!(vm.string_set_count(), baseline + 10_000);

    // No roots reference the bulk strings; the cycle drops them from the
    // set and relinks their cells onto the free lists.
    vm.collect();
    assert_eq!(vm.string_set_count(), baseline);
    assert!(vm.heap.has_free_cells());

    // An equal-payload allocation lands on reclaimed chunks.
    vm.intern("0000000000000042").expect("intern");
    assert_eq!(vm.string_set_count(), baseline + 1);
}

#[test]
fn rooted_values_survive_collection() {
    let mut vm = Vm::new();

    let keep = vm.intern_value("keep me around").expect("intern");
    vm.push_root(keep);
    let drop_me = vm.intern_value("drop me").expect("intern");
    let baseline = vm.string_set_count();

    vm.collect();

    // The rooted string is still interned; the other one is gone.
    assert_eq!(vm.string_set_count(), baseline - 1);
    let again = vm.intern_value("keep me around").expect("intern");
    assert_eq!(again.raw(), keep.raw());

    let _ = drop_me;
    vm.pop_root();
}

#[test]
fn reachability_is_transitive_through_containers() {
    let mut vm = Vm::new();

    let tbl = Table::create(&mut vm, 0).expect("table");
    let key = vm.intern_value("key").expect("key");
    let arr = Array::create(&mut vm, 0).expect("array");
    let inner = vm.intern_value("inner payload").expect("inner");
    Array::push(&mut vm, arr, inner).expect("push");
    Table::set(&mut vm, tbl, key, Value::from(arr)).expect("set");

    vm.push_root(Value::from(tbl));
    vm.collect();

    // Table -> array -> string stayed alive through two hops.
    let got = tbl.get(key).as_array().expect("array survived");
    assert_eq!(got.get(0).raw(), inner.raw());
    let again = vm.intern_value("inner payload").expect("intern");
    assert_eq!(again.raw(), inner.raw());

    // Dropping the root lets the whole chain go.
    vm.pop_root();
    let baseline = vm.string_set_count();
    vm.collect();
    assert_eq!(vm.string_set_count(), baseline - 2);
}

#[test]
fn self_referencing_closures_mark_once() {
    use glint_asm::{Instruction as I, Opcode};

    let mut vm = Vm::new();
    let code = [I::new(Opcode::UGET, 0, 0, 0), I::new(Opcode::RET, 0, 0, 0)];
    let p = Proto::create(
        &mut vm,
        &ProtoDesc {
            code: &code,
            consts: &[],
            lines: &[],
            num_locals: 1,
            num_args: 0,
            num_uval: 1,
            is_vararg: false,
            chunk: "cycle",
            src_line: 1,
        },
    )
    .expect("prototype");
    let f = Function::create(&mut vm, p).expect("function");

    // The closure captures itself; marking must terminate on the stage
    // stamp instead of looping.
    unsafe { f.as_mut() }.set_upvalue(0, Value::from(f));
    vm.push_root(Value::from(f));
    vm.collect();
    vm.collect();

    // Calling it returns the closure itself through the upvalue.
    let r = vm.call_value(Value::from(f), &[]).expect("call");
    assert_eq!(r.raw(), Value::from(f).raw());

    // Dropping the root lets the cycle die as a unit.
    vm.pop_root();
    vm.collect();
}

#[test]
fn suspend_makes_collection_a_no_op() {
    let mut vm = Vm::new();
    vm.intern("suspended garbage").expect("intern");
    let before = vm.string_set_count();

    vm.heap.suspend = true;
    vm.collect();
    assert_eq!(vm.string_set_count(), before);

    vm.heap.suspend = false;
    vm.collect();
    assert_eq!(vm.string_set_count(), before - 1);
}

#[test]
fn collection_counter_and_debt_schedule() {
    let mut vm = Vm::new();
    let cycles = vm.heap.collect_counter;
    vm.collect();
    assert_eq!(vm.heap.collect_counter, cycles + 1);

    // Force the countdown with a tiny threshold, then tick it down.
    vm.heap.min_debt = 1;
    vm.heap.interval = 2;
    vm.intern("debt trigger").expect("intern");
    vm.gc_tick();
    assert_eq!(vm.heap.collect_counter, cycles + 1);
    vm.gc_tick();
    assert_eq!(vm.heap.collect_counter, cycles + 2);
}

#[test]
fn class_destructor_clears_the_type_set() {
    let mut vm = Vm::new();
    let cls = Class::create(&mut vm, "Ephemeral", None, &[]).expect("class");
    let tid = cls.vm_tid;
    assert!(vm.class_by_tid(tid).is_some());

    // Nothing roots the class; the sweep runs its destructor.
    vm.collect();
    assert!(vm.class_by_tid(tid).is_none());
}

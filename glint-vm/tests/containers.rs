use glint_vm::object::{Array, Table};
use glint_vm::prelude::*;
use glint_vm::runtime;

fn exception_text(e: Value) -> String {
    e.as_string()
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|| format!("{e:?}"))
}

#[test]
fn table_insert_lookup_and_rehash() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");

    for i in 0..64 {
        let key = vm.intern_value(&format!("k{i}")).expect("key");
        Table::set(&mut vm, tbl, key, Value::number(i as f64)).expect("set");
    }

    assert_eq!(tbl.len(), 64);
    for i in 0..64 {
        let key = vm.intern_value(&format!("k{i}")).expect("key");
        assert!(tbl.get(key).equals(Value::number(i as f64)), "k{i}");
    }
    assert!(tbl.capacity() >= 128);
    assert!(tbl.capacity().is_power_of_two());
}

#[test]
fn table_nil_assignment_removes() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");
    let key = vm.intern_value("gone").expect("key");

    Table::set(&mut vm, tbl, key, Value::number(1.0)).expect("set");
    assert_eq!(tbl.len(), 1);

    Table::set(&mut vm, tbl, key, Value::NIL).expect("remove");
    assert!(tbl.get(key).is_nil());
    assert_eq!(tbl.len(), 0);

    // Removing an absent key leaves the count alone.
    Table::set(&mut vm, tbl, key, Value::NIL).expect("remove absent");
    assert_eq!(tbl.len(), 0);
}

#[test]
fn table_keys_compare_by_value_equality() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");

    // Interned strings: equal text is the same pointer, so equal keys hit
    // the same slot.
    let k1 = vm.intern_value("shared").expect("key");
    let k2 = vm.intern_value("shared").expect("key");
    assert_eq!(k1.raw(), k2.raw());

    Table::set(&mut vm, tbl, k1, Value::number(9.0)).expect("set");
    assert!(tbl.get(k2).equals(Value::number(9.0)));

    // Signed zero: one slot for both spellings.
    Table::set(&mut vm, tbl, Value::number(0.0), Value::TRUE).expect("set");
    assert!(tbl.get(Value::number(-0.0)).equals(Value::TRUE));
}

#[test]
fn empty_containers_behave() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");
    let arr = Array::create(&mut vm, 0).expect("array");
    let missing = vm.intern_value("missing").expect("key");

    assert!(tbl.is_empty());
    assert!(tbl.get(missing).is_nil());
    assert!(arr.is_empty());
    assert!(arr.get(0).is_nil());

    let empty = vm.intern_value("").expect("empty string");
    let len = runtime::builtin_len(&mut vm, empty).expect("len");
    assert!(len.equals(Value::number(0.0)));
}

#[test]
fn array_out_of_bounds_write_raises() {
    let mut vm = Vm::new();
    let arr = runtime::array_new(&mut vm, 0).expect("array");

    let err = runtime::field_set_raw(&mut vm, arr, Value::number(5.0), Value::number(1.0))
        .expect_err("write past the end");
    assert!(exception_text(err).contains("out-of-boundaries"));

    // Reads past the end are nil, not errors.
    let v = runtime::field_get_raw(&mut vm, arr, Value::number(5.0)).expect("read");
    assert!(v.is_nil());
}

#[test]
fn array_growth_keeps_elements() {
    let mut vm = Vm::new();
    let arr = Array::create(&mut vm, 0).expect("array");

    for i in 0..100 {
        Array::push(&mut vm, arr, Value::number(i as f64)).expect("push");
    }
    assert_eq!(arr.len(), 100);
    assert!(arr.capacity() >= 100);
    for i in 0..100 {
        assert!(arr.get(i).equals(Value::number(i as f64)));
    }

    let popped = unsafe { arr.as_mut() }.pop();
    assert!(popped.equals(Value::number(99.0)));
    assert_eq!(arr.len(), 99);
}

#[test]
fn builtin_helpers_cover_the_container_kinds() {
    let mut vm = Vm::new();

    let a = vm.intern_value("ab").expect("a");
    let b = vm.intern_value("cd").expect("b");
    let joined = runtime::builtin_join(&mut vm, a, b).expect("join");
    assert_eq!(joined.as_string().expect("string").as_str(), "abcd");

    let len = runtime::builtin_len(&mut vm, joined).expect("len");
    assert!(len.equals(Value::number(4.0)));

    let needle = vm.intern_value("bc").expect("needle");
    let found = runtime::builtin_in(&mut vm, needle, joined).expect("in");
    assert!(found.equals(Value::TRUE));

    // Strings pass through duplication; arrays copy.
    let same = runtime::builtin_dup(&mut vm, joined).expect("dup");
    assert_eq!(same.raw(), joined.raw());

    let arr = Array::create(&mut vm, 0).expect("array");
    Array::push(&mut vm, arr, Value::number(1.0)).expect("push");
    let arr_v = Value::from(arr);
    let copy = runtime::builtin_dup(&mut vm, arr_v).expect("dup");
    assert_ne!(copy.raw(), arr_v.raw());
    let copy = copy.as_array().expect("array");
    assert!(copy.get(0).equals(Value::number(1.0)));

    // Mutating the copy leaves the original alone.
    unsafe { copy.as_mut() }.set(0, Value::number(5.0));
    assert!(arr.get(0).equals(Value::number(1.0)));
}

#[test]
fn trait_seal_and_freeze() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");
    let tbl_v = Value::from(tbl);
    let key = vm.intern_value("k").expect("key");

    // Freeze forbids value writes through the trait-aware path.
    runtime::trait_set(&mut vm, tbl_v, TraitKind::Freeze, Value::TRUE).expect("freeze");
    let err =
        runtime::field_set(&mut vm, tbl_v, key, Value::number(1.0)).expect_err("frozen write");
    assert!(exception_text(err).contains("frozen"));

    // Seal forbids trait mutation, including un-freezing.
    runtime::trait_set(&mut vm, tbl_v, TraitKind::Seal, Value::TRUE).expect("seal");
    let err = runtime::trait_set(&mut vm, tbl_v, TraitKind::Freeze, Value::FALSE)
        .expect_err("sealed trait write");
    assert!(exception_text(err).contains("sealed"));

    // Both flags read back as booleans.
    let sealed = runtime::trait_get(&mut vm, tbl_v, TraitKind::Seal).expect("read seal");
    let frozen = runtime::trait_get(&mut vm, tbl_v, TraitKind::Freeze).expect("read freeze");
    assert!(sealed.equals(Value::TRUE));
    assert!(frozen.equals(Value::TRUE));
}

#[test]
fn get_trait_table_chains_and_misses_to_nil() {
    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");
    let fallback = Table::create(&mut vm, 0).expect("fallback");
    let tbl_v = Value::from(tbl);
    let key = vm.intern_value("k").expect("key");
    let other = vm.intern_value("other").expect("key");

    Table::set(&mut vm, fallback, key, Value::number(7.0)).expect("set");
    runtime::trait_set(&mut vm, tbl_v, TraitKind::Get, Value::from(fallback)).expect("get trait");

    // Miss on the table itself falls through to the trait table.
    let v = runtime::field_get(&mut vm, tbl_v, key).expect("get");
    assert!(v.equals(Value::number(7.0)));

    // Miss on both ends of the chain reads nil.
    let v = runtime::field_get(&mut vm, tbl_v, other).expect("get");
    assert!(v.is_nil());

    // An own entry shadows the chain.
    Table::set(&mut vm, tbl, key, Value::number(1.0)).expect("set");
    let v = runtime::field_get(&mut vm, tbl_v, key).expect("get");
    assert!(v.equals(Value::number(1.0)));
}

#[test]
fn classes_lay_out_fields_and_instances() {
    let mut vm = Vm::new();
    let cls = Class::create(
        &mut vm,
        "Point",
        None,
        &[
            FieldDesc { name: "x", ty: Ty::F64, is_static: false, init: Value::number(1.5) },
            FieldDesc { name: "y", ty: Ty::F64, is_static: false, init: Value::number(-2.0) },
            FieldDesc { name: "count", ty: Ty::Any, is_static: true, init: Value::number(0.0) },
        ],
    )
    .expect("class");
    let cls_v = Value::from(cls);
    assert!(cls_v.is_class());
    assert!(cls.vm_tid < 0);
    assert_eq!(vm.class_by_tid(cls.vm_tid).map(|c| c.as_ptr()), Some(cls.as_ptr()));

    let v = runtime::object_new(&mut vm, cls_v).expect("instance");
    let obj = v.as_object().expect("object");

    let x = vm.intern("x").expect("x");
    let y = vm.intern("y").expect("y");
    assert!(obj.get(x).expect("x field").equals(Value::number(1.5)));
    assert!(obj.get(y).expect("y field").equals(Value::number(-2.0)));

    unsafe { obj.as_mut() }.set(x, Value::number(10.0)).expect("set x");
    assert!(obj.get(x).expect("x field").equals(Value::number(10.0)));

    // A second instance still sees the class defaults.
    let v2 = runtime::object_new(&mut vm, cls_v).expect("instance");
    let obj2 = v2.as_object().expect("object");
    assert!(obj2.get(x).expect("x field").equals(Value::number(1.5)));

    // Static fields read through both the class and the instance.
    let count = vm.intern("count").expect("count");
    assert!(cls.get_static(count).expect("static").equals(Value::number(0.0)));
    assert!(obj.get(count).expect("static via instance").equals(Value::number(0.0)));

    let is = runtime::instance_of(&mut vm, v, cls_v).expect("instance_of");
    assert!(is.equals(Value::TRUE));

    // Subclassing: fields inherit, the base relation holds one way.
    let sub = Class::create(
        &mut vm,
        "Point3",
        Some(cls),
        &[FieldDesc { name: "z", ty: Ty::F64, is_static: false, init: Value::number(9.0) }],
    )
    .expect("subclass");
    let sv = runtime::object_new(&mut vm, Value::from(sub)).expect("instance");
    let sobj = sv.as_object().expect("object");
    let z = vm.intern("z").expect("z");
    assert!(sobj.get(x).expect("inherited x").equals(Value::number(1.5)));
    assert!(sobj.get(z).expect("own z").equals(Value::number(9.0)));

    assert!(runtime::instance_of(&mut vm, sv, cls_v).expect("up").equals(Value::TRUE));
    assert!(runtime::instance_of(&mut vm, v, Value::from(sub)).expect("down").equals(Value::FALSE));
}

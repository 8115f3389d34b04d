use glint_asm::{reg_arg, Instruction as I, LineEntry, Opcode};
use glint_vm::object::{Array, NativeAttr, NativeInfo, NativeOverload, Table};
use glint_vm::prelude::*;

fn proto(vm: &mut Vm, code: &[I], consts: &[Value], locals: u32, args: u32) -> Gc<Proto> {
    Proto::create(
        vm,
        &ProtoDesc {
            code,
            consts,
            lines: &[],
            num_locals: locals,
            num_args: args,
            num_uval: 0,
            is_vararg: true,
            chunk: "test",
            src_line: 1,
        },
    )
    .expect("prototype")
}

fn function(vm: &mut Vm, p: Gc<Proto>) -> Value {
    Value::from(Function::create(vm, p).expect("function"))
}

fn num(v: f64) -> Value {
    Value::number(v)
}

fn exception_text(e: Value) -> String {
    e.as_string()
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|| format!("{e:?}"))
}

#[test]
fn arithmetic_on_an_argument() {
    let mut vm = Vm::new();
    // return a + 1
    let code = [
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),
        I::new(Opcode::AADD, 0, reg_arg(0), 1),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 2, 1);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[num(3.0)]).expect("call");
    assert!(r.equals(num(4.0)));

    // The polymorphic path raises a type error for a string operand.
    let s = vm.intern_value("x").expect("intern");
    let err = vm.call_value(f, &[s]).expect_err("type error");
    assert!(exception_text(err).contains("expected number"));
}

#[test]
fn addition_consults_the_add_trait() {
    static FORTY_TWO: NativeInfo = NativeInfo {
        name: "forty_two",
        attr: NativeAttr::PURE,
        overloads: &[NativeOverload { params: &[], ret: Ty::F64 }],
        invoke: |_vm, _this, _args| Ok(Value::number(42.0)),
    };

    let mut vm = Vm::new();
    let tbl = Table::create(&mut vm, 0).expect("table");
    let tbl_v = Value::from(tbl);
    let add = Value::from(Function::create_native(&mut vm, &FORTY_TWO).expect("native"));
    glint_vm::runtime::trait_set(&mut vm, tbl_v, TraitKind::Add, add).expect("trait");

    let code = [
        I::new(Opcode::AADD, 0, reg_arg(0), reg_arg(1)),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 1, 2);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[tbl_v, num(1.0)]).expect("trait add");
    assert!(r.equals(num(42.0)));
}

#[test]
fn comparisons_and_logic() {
    let mut vm = Vm::new();
    // return (a < b) && (a == a)
    let code = [
        I::new(Opcode::CLT, 0, reg_arg(0), reg_arg(1)),
        I::new(Opcode::CEQ, 1, reg_arg(0), reg_arg(0)),
        I::new(Opcode::LAND, 2, 0, 1),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 2);
    let f = function(&mut vm, p);

    assert!(vm.call_value(f, &[num(1.0), num(2.0)]).expect("lt").equals(Value::TRUE));
    assert!(vm.call_value(f, &[num(3.0), num(2.0)]).expect("ge").equals(Value::FALSE));

    // NaN: never equal, never less.
    let r = vm.call_value(f, &[num(f64::NAN), num(2.0)]).expect("nan");
    assert!(r.equals(Value::FALSE));
}

#[test]
fn loops_accumulate() {
    let mut vm = Vm::new();
    // s = 0; for i in 1..10 do s = s + i end; return s
    let code = [
        I::ext(Opcode::KIMM, 0, num(0.0).raw()),  // s
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),  // i
        I::ext(Opcode::KIMM, 2, num(10.0).raw()), // limit
        I::ext(Opcode::KIMM, 3, num(1.0).raw()),  // step
        // 4: loop header
        I::new(Opcode::CLT, 4, 1, 2),
        I::new(Opcode::JNS, 3, 4, 0), // exit -> 9
        I::new(Opcode::AADD, 0, 0, 1),
        I::new(Opcode::AADD, 1, 1, 3),
        I::new(Opcode::JMP, -5, 0, 0), // back to 4
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 5, 0);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[]).expect("loop");
    assert!(r.equals(num(45.0)));
}

#[test]
fn calls_nest_and_return() {
    let mut vm = Vm::new();

    // callee: return a * 2
    let callee_code = [
        I::ext(Opcode::KIMM, 0, num(2.0).raw()),
        I::new(Opcode::AMUL, 1, reg_arg(0), 0),
        I::new(Opcode::RET, 1, 0, 0),
    ];
    let callee_p = proto(&mut vm, &callee_code, &[], 2, 1);
    let callee = function(&mut vm, callee_p);

    // caller: return callee(21)
    let caller_code = [
        I::ext(Opcode::KIMM, 0, callee.raw()),
        I::ext(Opcode::KIMM, 1, num(21.0).raw()),
        I::new(Opcode::PUSHR, 1, 0, 0), // arg0
        I::new(Opcode::PUSHR, 0, 0, 0), // target
        I::ext(Opcode::PUSHI, 0, Value::NIL.raw()), // self
        I::new(Opcode::CALL, 2, 1, 0),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let caller_p = proto(&mut vm, &caller_code, &[callee], 3, 0);
    let caller = function(&mut vm, caller_p);

    let r = vm.call_value(caller, &[]).expect("nested call");
    assert!(r.equals(num(42.0)));
}

#[test]
fn closures_capture_upvalues() {
    let mut vm = Vm::new();

    // inner: return u0 + a0
    let inner_code = [
        I::new(Opcode::UGET, 0, 0, 0),
        I::new(Opcode::AADD, 1, 0, reg_arg(0)),
        I::new(Opcode::RET, 1, 0, 0),
    ];
    let inner_p = Proto::create(
        &mut vm,
        &ProtoDesc {
            code: &inner_code,
            consts: &[],
            lines: &[],
            num_locals: 2,
            num_args: 1,
            num_uval: 1,
            is_vararg: false,
            chunk: "test",
            src_line: 1,
        },
    )
    .expect("inner prototype");
    let inner = function(&mut vm, inner_p);

    // outer: f = dup(inner) capturing r5 = 7; return f(3)
    let outer_code = [
        I::ext(Opcode::KIMM, 5, num(7.0).raw()),
        I::new(Opcode::FDUP, 0, 0, 5),
        I::ext(Opcode::KIMM, 1, num(3.0).raw()),
        I::new(Opcode::PUSHR, 1, 0, 0),
        I::new(Opcode::PUSHR, 0, 0, 0),
        I::ext(Opcode::PUSHI, 0, Value::NIL.raw()),
        I::new(Opcode::CALL, 2, 1, 0),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let outer_p = proto(&mut vm, &outer_code, &[inner], 6, 0);
    let outer = function(&mut vm, outer_p);

    let r = vm.call_value(outer, &[]).expect("closure call");
    assert!(r.equals(num(10.0)));

    // The template's upvalue vector is untouched by the duplicate.
    assert!(inner.as_function().expect("fn").upvalue(0).is_nil());
}

#[test]
fn exception_handler_catches_and_reads() {
    let mut vm = Vm::new();
    let bad = vm.intern_value("x").expect("intern");

    let code = [
        I::new(Opcode::SETEH, 4, 0, 0), // handler at 5
        I::ext(Opcode::KIMM, 0, bad.raw()),
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),
        I::new(Opcode::AADD, 2, 0, 1), // string + number raises
        I::new(Opcode::RET, 2, 0, 0),  // skipped
        I::new(Opcode::GETEX, 2, 0, 0),
        I::new(Opcode::RET, 2, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 0);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[]).expect("caught");
    assert!(exception_text(r).contains("expected number"));
    assert!(exception_text(vm.last_exception()).contains("expected number"));
}

#[test]
fn uncaught_exceptions_unwind_nested_calls() {
    let mut vm = Vm::new();
    let bad = vm.intern_value("boom").expect("intern");

    // callee: raise by adding a string to a number
    let callee_code = [
        I::ext(Opcode::KIMM, 0, bad.raw()),
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),
        I::new(Opcode::AADD, 1, 0, 1),
        I::new(Opcode::RET, 1, 0, 0),
    ];
    let callee_p = proto(&mut vm, &callee_code, &[], 2, 0);
    let callee = function(&mut vm, callee_p);

    // caller without a handler: the exception escapes to the host.
    let caller_code = [
        I::ext(Opcode::KIMM, 0, callee.raw()),
        I::new(Opcode::PUSHR, 0, 0, 0),
        I::ext(Opcode::PUSHI, 0, Value::NIL.raw()),
        I::new(Opcode::CALL, 1, 0, 0),
        I::new(Opcode::RET, 1, 0, 0),
    ];
    let caller_p = proto(&mut vm, &caller_code, &[callee], 2, 0);
    let caller = function(&mut vm, caller_p);

    let err = vm.call_value(caller, &[]).expect_err("escaped");
    assert!(exception_text(err).contains("expected number"));

    // caller with a handler catches the callee's raise.
    let catching_code = [
        I::new(Opcode::SETEH, 5, 0, 0), // handler at 6
        I::ext(Opcode::KIMM, 0, callee.raw()),
        I::new(Opcode::PUSHR, 0, 0, 0),
        I::ext(Opcode::PUSHI, 0, Value::NIL.raw()),
        I::new(Opcode::CALL, 1, 0, 0),
        I::new(Opcode::RET, 1, 0, 0), // skipped
        I::new(Opcode::GETEX, 1, 0, 0),
        I::new(Opcode::RET, 1, 0, 0),
    ];
    let catching_p = proto(&mut vm, &catching_code, &[callee], 2, 0);
    let catching = function(&mut vm, catching_p);

    let r = vm.call_value(catching, &[]).expect("caught downstream");
    assert!(exception_text(r).contains("expected number"));
}

#[test]
fn varargs_count_check_and_get() {
    let mut vm = Vm::new();
    let too_few = vm.intern_value("too few arguments").expect("intern");

    let code = [
        I::ext(Opcode::VACHK, 2, too_few.raw()),
        I::new(Opcode::VACNT, 0, 0, 0),
        I::ext(Opcode::KIMM, 1, num(1.0).raw()),
        I::new(Opcode::VAGET, 2, 1, 0), // args[1]
        I::new(Opcode::AADD, 0, 0, 2),  // count + args[1]
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 0);
    let f = function(&mut vm, p);

    // Three args: 3 + args[1] = 3 + 20 = 23.
    let r = vm.call_value(f, &[num(10.0), num(20.0), num(30.0)]).expect("varargs");
    assert!(r.equals(num(23.0)));

    let err = vm.call_value(f, &[num(1.0)]).expect_err("too few");
    assert!(exception_text(err).contains("too few"));
}

#[test]
fn iteration_over_arrays_and_tables() {
    let mut vm = Vm::new();

    let arr = Array::create(&mut vm, 0).expect("array");
    for v in [1.0, 2.0, 3.0] {
        Array::push(&mut vm, arr, num(v)).expect("push");
    }

    // sum elements of the argument container's values
    let code = [
        I::ext(Opcode::KIMM, 0, num(0.0).raw()), // cursor
        I::ext(Opcode::KIMM, 3, num(0.0).raw()), // sum
        I::new(Opcode::ITER, 2, 0, reg_arg(0)),  // end -> 5
        I::new(Opcode::AADD, 3, 3, 2),
        I::new(Opcode::JMP, -3, 0, 0),
        I::new(Opcode::RET, 3, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 4, 1);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[Value::from(arr)]).expect("array iter");
    assert!(r.equals(num(6.0)));

    let tbl = Table::create(&mut vm, 0).expect("table");
    for (k, v) in [("a", 4.0), ("b", 5.0)] {
        let key = vm.intern_value(k).expect("key");
        Table::set(&mut vm, tbl, key, num(v)).expect("set");
    }
    let r = vm.call_value(f, &[Value::from(tbl)]).expect("table iter");
    assert!(r.equals(num(9.0)));
}

#[test]
fn concat_formats_values() {
    let mut vm = Vm::new();
    let prefix = vm.intern_value("n=").expect("intern");

    let code = [
        I::ext(Opcode::KIMM, 0, prefix.raw()),
        I::new(Opcode::MOV, 1, reg_arg(0), 0),
        I::new(Opcode::CCAT, 0, 2, 0),
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 2, 1);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[num(4.0)]).expect("concat");
    assert_eq!(r.as_string().expect("string").as_str(), "n=4");
}

#[test]
fn tables_and_arrays_through_bytecode() {
    let mut vm = Vm::new();
    let key = vm.intern_value("answer").expect("intern");

    let code = [
        I::new(Opcode::TNEW, 0, 0, 0),
        I::ext(Opcode::KIMM, 1, key.raw()),
        I::ext(Opcode::KIMM, 2, num(42.0).raw()),
        I::new(Opcode::TSET, 1, 2, 0), // t[key] = 42
        I::new(Opcode::TGET, 3, 1, 0), // r3 = t[key]
        I::new(Opcode::RET, 3, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 4, 0);
    let f = function(&mut vm, p);

    let r = vm.call_value(f, &[]).expect("table roundtrip");
    assert!(r.equals(num(42.0)));

    // Raw array write out of range raises through the bytecode path too.
    let code = [
        I::new(Opcode::ANEW, 0, 0, 0),
        I::ext(Opcode::KIMM, 1, num(5.0).raw()),
        I::ext(Opcode::KIMM, 2, num(1.0).raw()),
        I::new(Opcode::TSETR, 1, 2, 0), // a[5] = 1
        I::new(Opcode::RET, 0, 0, 0),
    ];
    let p = proto(&mut vm, &code, &[], 3, 0);
    let f = function(&mut vm, p);

    let err = vm.call_value(f, &[]).expect_err("oob");
    assert!(exception_text(err).contains("out-of-boundaries"));
}

#[test]
fn line_table_resolves_positions() {
    let mut vm = Vm::new();
    let code = [I::new(Opcode::RET, reg_arg(0), 0, 0)];
    let p = Proto::create(
        &mut vm,
        &ProtoDesc {
            code: &code,
            consts: &[],
            lines: &[LineEntry { pos: 0, delta: 2 }],
            num_locals: 0,
            num_args: 1,
            num_uval: 0,
            is_vararg: false,
            chunk: "lines",
            src_line: 10,
        },
    )
    .expect("prototype");

    assert_eq!(p.line_of(0), 12);
    assert_eq!(p.chunk().expect("chunk").as_str(), "lines");
}

//! The register bytecode interpreter.
//!
//! Registers are windows into the evaluation stack. A frame sees its locals
//! at non-negative indices from its base and the call slots below it:
//! `-1` is self, `-2` the target function and `-3 - n` the n-th argument
//! (so the stack holds `... arg1 arg0 target self | locals ...`). Callers
//! pass arguments by pushing them in reverse, then the target, then self.
//!
//! Exceptions are values. A failing operation raises by storing the payload
//! in the VM's last-exception slot and unwinding to the nearest handler
//! installed with `SETEH`; without one, the call chain collapses and the
//! host receives the payload as `Err`.

use glint_asm::{Opcode, Reg};

use crate::gc::Gc;
use crate::object::{Function, Proto};
use crate::runtime;
use crate::traits::TraitKind;
use crate::value::Value;
use crate::vm::Vm;

/// Hard recursion limit for interpreted frames.
pub const MAX_CALL_DEPTH: usize = 250;

/// Executing-frame state. Suspended callers keep theirs on the frame stack.
struct ExecFrame {
    proto: Gc<Proto>,
    pc: u32,
    /// Stack index of local register zero.
    base: usize,
    /// Stack index the frame collapses to on return; the first pushed
    /// argument lives here.
    args_base: usize,
    /// Arguments passed, varargs included.
    nargs: u32,
    /// Installed exception handler, cleared when taken.
    handler: Option<u32>,
    /// Caller-side destination register of the pending call.
    ret_dst: Reg,
}

impl ExecFrame {
    fn slot(&self, r: Reg) -> usize {
        (self.base as i64 + r as i64) as usize
    }
}

impl Vm {
    /// Calls a function value with an explicit receiver. Arguments are in
    /// call order. Returns the result, or the raised exception as `Err`.
    pub fn call(&mut self, target: Value, this: Value, args: &[Value]) -> Result<Value, Value> {
        let Some(f) = target.as_function() else {
            // A call trait makes any value callable.
            if let Some(o) = target.as_object() {
                if o.traits.has(TraitKind::Call) {
                    let cb = o.traits.get(TraitKind::Call);
                    return self.call(cb, target, args);
                }
            }
            return self.raise("invoking non-function");
        };

        if let Some(info) = f.native() {
            // Root the receiver and arguments across the native call.
            let root_base = self.stack.len();
            self.stack.push(target);
            self.stack.push(this);
            self.stack.extend_from_slice(args);
            let r = (info.invoke)(self, this, args);
            self.stack.truncate(root_base);
            return r;
        }

        let proto = f.proto().expect("virtual function has a prototype");
        if (args.len() as u32) < proto.num_args {
            return self.raise("insufficient arguments");
        }

        // Stack shape: ... arg_{n-1} .. arg_0 target self | locals.
        let args_base = self.stack.len();
        for v in args.iter().rev() {
            self.stack.push(*v);
        }
        self.stack.push(target);
        self.stack.push(this);
        let base = self.stack.len();
        for _ in 0..proto.num_locals {
            self.stack.push(Value::NIL);
        }

        let frame = ExecFrame {
            proto,
            pc: 0,
            base,
            args_base,
            nargs: args.len() as u32,
            handler: None,
            ret_dst: 0,
        };
        self.run(frame)
    }

    /// Convenience wrapper: call with a nil receiver.
    pub fn call_value(&mut self, target: Value, args: &[Value]) -> Result<Value, Value> {
        self.call(target, Value::NIL, args)
    }

    fn run(&mut self, frame: ExecFrame) -> Result<Value, Value> {
        let mut frame = frame;
        let mut frames: Vec<ExecFrame> = Vec::new();

        macro_rules! reg {
            ($r:expr) => {
                self.stack[frame.slot($r)]
            };
        }

        macro_rules! throw {
            ($e:expr) => {{
                let exc: Value = $e;
                self.last_exception = exc;
                loop {
                    if let Some(h) = frame.handler.take() {
                        // Drop any partially pushed call arguments.
                        self.stack.truncate(frame.base + frame.proto.num_locals as usize);
                        frame.pc = h;
                        break;
                    }
                    self.stack.truncate(frame.args_base);
                    match frames.pop() {
                        Some(caller) => frame = caller,
                        None => return Err(exc),
                    }
                }
                continue;
            }};
        }

        macro_rules! try_op {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(e) => throw!(e),
                }
            };
        }

        loop {
            let insn = frame.proto.code()[frame.pc as usize];
            frame.pc += 1;
            let (op, a, b, c) = insn.into_inner();

            match op {
                Opcode::NOP => {}

                Opcode::MOV => {
                    reg!(a) = reg!(b);
                }
                Opcode::LNOT => {
                    reg!(a) = Value::bool(!reg!(b).coerce_bool());
                }
                Opcode::ANEG => {
                    let v = reg!(b);
                    reg!(a) = try_op!(runtime::apply_unop(self, Opcode::ANEG, v));
                }

                Opcode::AADD
                | Opcode::ASUB
                | Opcode::AMUL
                | Opcode::ADIV
                | Opcode::AMOD
                | Opcode::APOW => {
                    let (x, y) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::apply_binop(self, op, x, y));
                }

                Opcode::CEQ
                | Opcode::CNE
                | Opcode::CLT
                | Opcode::CGE
                | Opcode::CGT
                | Opcode::CLE => {
                    let (x, y) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::apply_compare(self, op, x, y));
                }

                Opcode::LAND => {
                    let x = reg!(b);
                    reg!(a) = if x.coerce_bool() { reg!(c) } else { x };
                }
                Opcode::LOR => {
                    let x = reg!(b);
                    reg!(a) = if x.coerce_bool() { x } else { reg!(c) };
                }
                Opcode::NCS => {
                    let x = reg!(b);
                    reg!(a) = if x.is_nil() { reg!(c) } else { x };
                }
                Opcode::CTY => {
                    let x = reg!(b);
                    reg!(a) = Value::bool(x.kind() as i32 == c);
                }
                Opcode::CTYX => {
                    let (x, base) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::instance_of(self, x, base));
                }

                Opcode::KIMM => {
                    reg!(a) = Value::from_raw(insn.xmm());
                }

                Opcode::CCAT => {
                    let mut text = String::new();
                    for i in 0..b {
                        let part = reg!(a + i);
                        text.push_str(&try_op!(runtime::display(self, part)));
                    }
                    self.gc_tick();
                    reg!(a) = try_op!(self.intern_value(&text));
                }

                Opcode::SETEH => {
                    frame.handler = Some((frame.pc as i64 + a as i64) as u32);
                }
                Opcode::SETEX => {
                    self.last_exception = reg!(a);
                }
                Opcode::GETEX => {
                    reg!(a) = self.last_exception;
                }

                Opcode::UGET => {
                    let f = reg!(glint_asm::REG_TARGET)
                        .as_function()
                        .expect("target slot holds the running function");
                    reg!(a) = f.upvalue(b as usize);
                }
                Opcode::USET => {
                    let f = reg!(glint_asm::REG_TARGET)
                        .as_function()
                        .expect("target slot holds the running function");
                    let v = reg!(b);
                    unsafe { f.as_mut().set_upvalue(a as usize, v) };
                }

                Opcode::STRIV => {
                    self.gc_tick();
                    let cls = Value::from_raw(insn.xmm());
                    reg!(a) = try_op!(runtime::object_new(self, cls));
                }
                Opcode::SGET => {
                    let (key, obj) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::field_get(self, obj, key));
                }
                Opcode::SSET => {
                    let (val, key, obj) = (reg!(b), reg!(a), reg!(c));
                    try_op!(runtime::field_set(self, obj, key, val));
                }

                Opcode::VACNT => {
                    reg!(a) = Value::number(frame.nargs as f64);
                }
                Opcode::VACHK => {
                    if (frame.nargs as i64) < a as i64 {
                        throw!(Value::from_raw(insn.xmm()));
                    }
                }
                Opcode::VAGET => {
                    let idx = reg!(b).coerce_num().unwrap_or(-1.0);
                    reg!(a) = if idx >= 0.0 && (idx as u32) < frame.nargs {
                        reg!(glint_asm::reg_arg(idx as u32))
                    } else {
                        Value::NIL
                    };
                }

                Opcode::ANEW => {
                    self.gc_tick();
                    reg!(a) = try_op!(runtime::array_new(self, b.max(0) as usize));
                }
                Opcode::TNEW => {
                    self.gc_tick();
                    reg!(a) = try_op!(runtime::table_new(self, b.max(0) as usize));
                }
                Opcode::TGET => {
                    let (key, obj) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::field_get(self, obj, key));
                }
                Opcode::TSET => {
                    let (val, key, obj) = (reg!(b), reg!(a), reg!(c));
                    try_op!(runtime::field_set(self, obj, key, val));
                }
                Opcode::TGETR => {
                    let (key, obj) = (reg!(b), reg!(c));
                    reg!(a) = try_op!(runtime::field_get_raw(self, obj, key));
                }
                Opcode::TSETR => {
                    let (val, key, obj) = (reg!(b), reg!(a), reg!(c));
                    try_op!(runtime::field_set_raw(self, obj, key, val));
                }

                Opcode::FDUP => {
                    self.gc_tick();
                    let konst = frame.proto.consts()[b as usize];
                    let Some(f) = konst.as_function() else {
                        throw!(try_op!(self.intern_value("duplicating non-function constant")));
                    };
                    let dup = try_op!(Function::duplicate(self, f));
                    for i in 0..dup.num_uval {
                        let v = reg!(c + i as Reg);
                        unsafe { dup.as_mut().set_upvalue(i as usize, v) };
                    }
                    reg!(a) = Value::from_gc_parts(crate::types::ValueKind::Function, dup.header());
                }

                Opcode::PUSHR => {
                    let v = reg!(a);
                    self.stack.push(v);
                }
                Opcode::PUSHI => {
                    self.stack.push(Value::from_raw(insn.xmm()));
                }

                Opcode::TONUM => {
                    let v = reg!(b);
                    reg!(a) = try_op!(runtime::to_num(self, v));
                }
                Opcode::TOINT => {
                    let v = reg!(b);
                    reg!(a) = try_op!(runtime::to_int(self, v));
                }
                Opcode::TOSTR => {
                    self.gc_tick();
                    let v = reg!(b);
                    reg!(a) = try_op!(runtime::to_str(self, v));
                }
                Opcode::TOBOOL => {
                    reg!(a) = Value::bool(reg!(b).coerce_bool());
                }

                Opcode::TRGET => {
                    let Some(kind) = TraitKind::from_index(c) else {
                        throw!(try_op!(self.intern_value("unknown trait index")));
                    };
                    let obj = reg!(b);
                    reg!(a) = try_op!(runtime::trait_get(self, obj, kind));
                }
                Opcode::TRSET => {
                    let Some(kind) = TraitKind::from_index(c) else {
                        throw!(try_op!(self.intern_value("unknown trait index")));
                    };
                    let (obj, v) = (reg!(a), reg!(b));
                    try_op!(runtime::trait_set(self, obj, kind, v));
                }

                Opcode::CALL => {
                    let n = b.max(0) as usize;
                    let top = self.stack.len();
                    let this = self.stack[top - 1];
                    let target = self.stack[top - 2];
                    let args_base = top - 2 - n;

                    if let Some(f) = target.as_function() {
                        if let Some(info) = f.native() {
                            let args: Vec<Value> =
                                (0..n).map(|i| self.stack[top - 3 - i]).collect();
                            let r = (info.invoke)(self, this, &args);
                            self.stack.truncate(args_base);
                            reg!(a) = try_op!(r);
                            continue;
                        }

                        let proto = f.proto().expect("virtual function has a prototype");
                        if (n as u32) < proto.num_args {
                            self.stack.truncate(args_base);
                            throw!(try_op!(self.intern_value("insufficient arguments")));
                        }
                        if frames.len() >= MAX_CALL_DEPTH {
                            self.stack.truncate(args_base);
                            throw!(try_op!(self.intern_value("call stack overflow")));
                        }

                        let base = self.stack.len();
                        for _ in 0..proto.num_locals {
                            self.stack.push(Value::NIL);
                        }
                        let callee = ExecFrame {
                            proto,
                            pc: 0,
                            base,
                            args_base,
                            nargs: n as u32,
                            handler: None,
                            ret_dst: 0,
                        };
                        let mut caller = core::mem::replace(&mut frame, callee);
                        caller.ret_dst = a;
                        frames.push(caller);
                        continue;
                    }

                    // Call trait or error; evaluate out of line to keep the
                    // stack balanced.
                    let args: Vec<Value> = (0..n).map(|i| self.stack[top - 3 - i]).collect();
                    self.stack.truncate(args_base);
                    let r = self.call(target, this, &args);
                    reg!(a) = try_op!(r);
                }

                Opcode::RET => {
                    let result = reg!(a);
                    self.stack.truncate(frame.args_base);
                    match frames.pop() {
                        Some(caller) => {
                            let dst = caller.ret_dst;
                            frame = caller;
                            reg!(dst) = result;
                        }
                        None => return Ok(result),
                    }
                }

                Opcode::JMP => {
                    frame.pc = (frame.pc as i64 + a as i64) as u32;
                }
                Opcode::JS => {
                    if reg!(b).coerce_bool() {
                        frame.pc = (frame.pc as i64 + a as i64) as u32;
                    }
                }
                Opcode::JNS => {
                    if !reg!(b).coerce_bool() {
                        frame.pc = (frame.pc as i64 + a as i64) as u32;
                    }
                }

                Opcode::ITER => {
                    let container = reg!(c);
                    let cursor = reg!(b).coerce_num().unwrap_or(0.0).max(0.0) as usize;
                    let step = if let Some(arr) = container.as_array() {
                        if cursor < arr.len() {
                            Some((
                                cursor + 1,
                                Value::number(cursor as f64),
                                arr.get(cursor),
                            ))
                        } else {
                            None
                        }
                    } else if let Some(tbl) = container.as_table() {
                        tbl.next_entry(cursor)
                            .map(|(slot, e)| (slot + 1, e.key, e.value))
                    } else {
                        throw!(try_op!(self.intern_value("iterating non-container")));
                    };

                    match step {
                        Some((next, key, value)) => {
                            reg!(b) = Value::number(next as f64);
                            reg!(b + 1) = key;
                            reg!(b + 2) = value;
                        }
                        None => {
                            frame.pc = (frame.pc as i64 + a as i64) as u32;
                        }
                    }
                }

                Opcode::UD => {
                    throw!(try_op!(self.intern_value("undefined opcode")));
                }
            }
        }
    }
}

//! Runtime operators and the native helpers compiled code tail-calls.
//!
//! Every operation here is fallible in the language sense: it returns
//! `Result<Value, Value>` with the raised exception as the error. The
//! `NF_*` descriptors advertise each helper's behavior profile to the
//! compiler so call sites can be folded, de-duplicated or scheduled.

use glint_asm::Opcode;

use crate::object::{Array, Function, NativeAttr, NativeInfo, NativeOverload, Object, Table};
use crate::traits::TraitKind;
use crate::types::{Ty, ValueKind};
use crate::value::Value;
use crate::vm::Vm;

/// Maps an arithmetic opcode to its trait slot.
fn binop_trait(op: Opcode) -> Option<TraitKind> {
    Some(match op {
        Opcode::AADD => TraitKind::Add,
        Opcode::ASUB => TraitKind::Sub,
        Opcode::AMUL => TraitKind::Mul,
        Opcode::ADIV => TraitKind::Div,
        Opcode::AMOD => TraitKind::Mod,
        Opcode::APOW => TraitKind::Pow,
        _ => return None,
    })
}

/// The trait set of a value, when its kind carries one.
fn traits_of(v: Value) -> Option<&'static crate::traits::TraitSet> {
    if let Some(t) = v.as_table() {
        return Some(unsafe { &(*t.as_ptr()).traits });
    }
    if let Some(a) = v.as_array() {
        return Some(unsafe { &(*a.as_ptr()).traits });
    }
    if let Some(o) = v.as_object() {
        return Some(unsafe { &(*o.as_ptr()).traits });
    }
    None
}

fn traits_of_mut(v: Value) -> Option<&'static mut crate::traits::TraitSet> {
    if let Some(t) = v.as_table() {
        return Some(unsafe { &mut t.as_mut().traits });
    }
    if let Some(a) = v.as_array() {
        return Some(unsafe { &mut a.as_mut().traits });
    }
    if let Some(o) = v.as_object() {
        return Some(unsafe { &mut o.as_mut().traits });
    }
    None
}

/// Invokes a trait callback: functions are called, tables (get only) are
/// indexed by the first operand.
fn call_trait(vm: &mut Vm, cb: Value, this: Value, args: &[Value]) -> Result<Value, Value> {
    if cb.is_function() {
        return vm.call(cb, this, args);
    }
    if let Some(t) = cb.as_table() {
        return Ok(t.get(args[0]));
    }
    vm.raise("trait is not callable")
}

/// Unary operator dispatch.
pub fn apply_unop(vm: &mut Vm, op: Opcode, v: Value) -> Result<Value, Value> {
    match op {
        Opcode::LNOT => Ok(Value::bool(!v.coerce_bool())),
        Opcode::ANEG => {
            if v.is_number() {
                return Ok(Value::number(-v.as_number()));
            }
            if let Some(ts) = traits_of(v) {
                if ts.has(TraitKind::Neg) {
                    let cb = ts.get(TraitKind::Neg);
                    return call_trait(vm, cb, v, &[v]);
                }
            }
            vm.raise(&format!("expected number, got {}", v.type_name()))
        }
        _ => vm.raise("invalid unary operator"),
    }
}

/// Arithmetic on two doubles.
fn number_binop(op: Opcode, a: f64, b: f64) -> f64 {
    match op {
        Opcode::AADD => a + b,
        Opcode::ASUB => a - b,
        Opcode::AMUL => a * b,
        Opcode::ADIV => a / b,
        Opcode::AMOD => {
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        Opcode::APOW => a.powf(b),
        _ => f64::NAN,
    }
}

/// Binary arithmetic dispatch: fast path for numbers, trait slow path,
/// type error otherwise.
pub fn apply_binop(vm: &mut Vm, op: Opcode, a: Value, b: Value) -> Result<Value, Value> {
    if a.is_number() && b.is_number() {
        return Ok(Value::number(number_binop(op, a.as_number(), b.as_number())));
    }
    if op == Opcode::AADD && a.is_string() && b.is_string() {
        return builtin_join(vm, a, b);
    }
    if let Some(kind) = binop_trait(op) {
        for side in [a, b] {
            if let Some(ts) = traits_of(side) {
                if ts.has(kind) {
                    let cb = ts.get(kind);
                    return call_trait(vm, cb, side, &[a, b]);
                }
            }
        }
    }
    let odd = if a.is_number() { b } else { a };
    vm.raise(&format!("expected number, got {}", odd.type_name()))
}

/// Comparison dispatch.
pub fn apply_compare(vm: &mut Vm, op: Opcode, a: Value, b: Value) -> Result<Value, Value> {
    match op {
        Opcode::CEQ | Opcode::CNE => {
            let mut eq = a.equals(b);
            if !eq {
                // A user equality trait may still claim the pair.
                if let Some(ts) = traits_of(a) {
                    if ts.has(TraitKind::Eq) {
                        let cb = ts.get(TraitKind::Eq);
                        eq = call_trait(vm, cb, a, &[a, b])?.coerce_bool();
                    }
                }
            }
            Ok(Value::bool(if op == Opcode::CEQ { eq } else { !eq }))
        }
        Opcode::CLT | Opcode::CLE | Opcode::CGT | Opcode::CGE => {
            // Normalize to < and <= by swapping the greater-than forms.
            let (x, y, op) = match op {
                Opcode::CGT => (b, a, Opcode::CLT),
                Opcode::CGE => (b, a, Opcode::CLE),
                other => (a, b, other),
            };
            if x.is_number() && y.is_number() {
                let (xn, yn) = (x.as_number(), y.as_number());
                return Ok(Value::bool(if op == Opcode::CLT { xn < yn } else { xn <= yn }));
            }
            if let (Some(xs), Some(ys)) = (x.as_string(), y.as_string()) {
                let (xs, ys) = (xs.as_str(), ys.as_str());
                return Ok(Value::bool(if op == Opcode::CLT { xs < ys } else { xs <= ys }));
            }
            let kind = if op == Opcode::CLT { TraitKind::Lt } else { TraitKind::Le };
            if let Some(ts) = traits_of(x) {
                if ts.has(kind) {
                    let cb = ts.get(kind);
                    let r = call_trait(vm, cb, x, &[x, y])?;
                    return Ok(Value::bool(r.coerce_bool()));
                }
            }
            vm.raise(&format!("expected number, got {}", x.type_name()))
        }
        _ => vm.raise("invalid comparison operator"),
    }
}

/// Renders a value the way the `str` coercion does.
pub fn display(vm: &mut Vm, v: Value) -> Result<String, Value> {
    display_depth(vm, v, 0)
}

fn display_depth(vm: &mut Vm, v: Value, depth: u32) -> Result<String, Value> {
    use itertools::Itertools;

    // Self-referential containers bottom out instead of recursing.
    if depth > 8 {
        return Ok("...".to_owned());
    }
    match v.kind() {
        ValueKind::Nil => Ok("nil".to_owned()),
        ValueKind::Exception => Ok("<exception>".to_owned()),
        ValueKind::Bool => Ok(v.as_bool().to_string()),
        ValueKind::Number => Ok(v.as_number().to_string()),
        ValueKind::String => Ok(v.as_string().expect("string").as_str().to_owned()),
        ValueKind::Array => {
            let arr = v.as_array().expect("array");
            let parts: Result<Vec<String>, Value> = arr
                .as_slice()
                .to_vec()
                .into_iter()
                .map(|e| display_depth(vm, e, depth + 1))
                .collect();
            Ok(format!("[{}]", parts?.iter().join(", ")))
        }
        ValueKind::Object => {
            if let Some(ts) = traits_of(v) {
                if ts.has(TraitKind::Str) {
                    let cb = ts.get(TraitKind::Str);
                    let r = call_trait(vm, cb, v, &[v])?;
                    return display(vm, r);
                }
            }
            let name = v
                .as_object()
                .and_then(|o| o.class().name())
                .map(|n| n.as_str().to_owned())
                .unwrap_or_else(|| "object".to_owned());
            Ok(format!("<{} at {:#x}>", name, v.raw() & ((1 << 47) - 1)))
        }
        kind => Ok(format!("<{} at {:#x}>", kind, v.raw() & ((1 << 47) - 1))),
    }
}

/// `str` coercion: renders and interns.
pub fn to_str(vm: &mut Vm, v: Value) -> Result<Value, Value> {
    if v.is_string() {
        return Ok(v);
    }
    let text = display(vm, v)?;
    vm.intern_value(&text)
}

/// `num` coercion.
pub fn to_num(vm: &mut Vm, v: Value) -> Result<Value, Value> {
    match v.coerce_num() {
        Some(n) => Ok(Value::number(n)),
        None => vm.raise(&format!("cannot coerce {} to number", v.type_name())),
    }
}

/// `int` coercion: numeric coercion plus truncation.
pub fn to_int(vm: &mut Vm, v: Value) -> Result<Value, Value> {
    let n = to_num(vm, v)?;
    Ok(Value::number(n.as_number().trunc()))
}

/// Creates an array; `ANEW` and compiled `array_new` land here.
pub fn array_new(vm: &mut Vm, n: usize) -> Result<Value, Value> {
    let a = Array::create(vm, n)?;
    Ok(Value::from_gc_parts(ValueKind::Array, a.header()))
}

/// Creates a table; `TNEW` and compiled `table_new` land here.
pub fn table_new(vm: &mut Vm, n: usize) -> Result<Value, Value> {
    let t = Table::create(vm, n)?;
    Ok(Value::from_gc_parts(ValueKind::Table, t.header()))
}

/// Creates a trivially initialized instance of `cls`.
pub fn object_new(vm: &mut Vm, cls: Value) -> Result<Value, Value> {
    let Some(cls) = cls.as_class() else {
        return vm.raise("instantiating a non-class");
    };
    let obj = Object::create(vm, cls)?;
    Ok(Value::from_gc_parts(ValueKind::Object, obj.header()))
}

/// `CTYX`: whether `base` is a base class of `v`'s class.
pub fn instance_of(vm: &mut Vm, v: Value, base: Value) -> Result<Value, Value> {
    let Some(base) = base.as_class() else {
        return vm.raise("type check against a non-class");
    };
    let ok = v
        .as_object()
        .map(|o| base.is_base_of(o.class()))
        .unwrap_or(false);
    Ok(Value::bool(ok))
}

fn array_index(vm: &mut Vm, key: Value) -> Result<usize, Value> {
    let Some(n) = key.coerce_num().filter(|n| n.fract() == 0.0 && *n >= 0.0) else {
        return vm.raise("indexing array with non-integer or negative key");
    };
    Ok(n as usize)
}

/// Raw container read: tables by hash, arrays and strings by index. Nil
/// container reads nil.
pub fn field_get_raw(vm: &mut Vm, obj: Value, key: Value) -> Result<Value, Value> {
    if key.is_nil() {
        return vm.raise("indexing with null key");
    }
    if let Some(t) = obj.as_table() {
        return Ok(t.get(key));
    }
    if let Some(a) = obj.as_array() {
        let idx = array_index(vm, key)?;
        return Ok(a.get(idx));
    }
    if let Some(s) = obj.as_string() {
        let idx = array_index(vm, key)?;
        return match s.as_str().get(idx..).and_then(|r| r.chars().next()) {
            Some(c) => vm.intern_value(&c.to_string()),
            None => Ok(Value::NIL),
        };
    }
    if let Some(o) = obj.as_object() {
        if let Some(k) = key.as_string() {
            return Ok(unsafe { (*o.as_ptr()).get(k) }.unwrap_or(Value::NIL));
        }
    }
    if let Some(c) = obj.as_class() {
        if let Some(k) = key.as_string() {
            return Ok(c.get_static(k).unwrap_or(Value::NIL));
        }
    }
    if obj.is_nil() {
        return Ok(Value::NIL);
    }
    vm.raise("indexing non-table")
}

/// Raw container write.
pub fn field_set_raw(vm: &mut Vm, obj: Value, key: Value, value: Value) -> Result<Value, Value> {
    if key.is_nil() {
        return vm.raise("indexing with null key");
    }
    if let Some(t) = obj.as_table() {
        if t.traits.is_frozen() {
            return vm.raise("modifying frozen table.");
        }
        Table::set(vm, t, key, value)?;
        return Ok(Value::NIL);
    }
    if let Some(a) = obj.as_array() {
        if a.traits.is_frozen() {
            return vm.raise("modifying frozen array.");
        }
        let idx = array_index(vm, key)?;
        if !unsafe { a.as_mut().set(idx, value) } {
            return vm.raise("out-of-boundaries array access");
        }
        return Ok(Value::NIL);
    }
    if let Some(o) = obj.as_object() {
        if let Some(k) = key.as_string() {
            return match unsafe { o.as_mut().set(k, value) } {
                Ok(true) => Ok(Value::NIL),
                Ok(false) => vm.raise(&format!("no field named {}", k.as_str())),
                Err(msg) => vm.raise(msg),
            };
        }
        return vm.raise("indexing object with non-string key");
    }
    if let Some(c) = obj.as_class() {
        if let Some(k) = key.as_string() {
            return match unsafe { c.as_mut().set_static(k, value) } {
                Ok(true) => Ok(Value::NIL),
                Ok(false) => vm.raise(&format!("no static field named {}", k.as_str())),
                Err(msg) => vm.raise(msg),
            };
        }
    }
    vm.raise("indexing non-table")
}

/// Trait-aware container read.
pub fn field_get(vm: &mut Vm, obj: Value, key: Value) -> Result<Value, Value> {
    if let Some(t) = obj.as_table() {
        let hit = if key.is_nil() { Value::NIL } else { t.get(key) };
        if !hit.is_nil() || !t.traits.has(TraitKind::Get) {
            if key.is_nil() {
                return vm.raise("indexing with null key");
            }
            return Ok(hit);
        }
        let cb = t.traits.get(TraitKind::Get);
        return call_trait(vm, cb, obj, &[key]);
    }
    if let Some(ts) = traits_of(obj) {
        if ts.has(TraitKind::Get) {
            let cb = ts.get(TraitKind::Get);
            return call_trait(vm, cb, obj, &[key]);
        }
    }
    field_get_raw(vm, obj, key)
}

/// Trait-aware container write.
pub fn field_set(vm: &mut Vm, obj: Value, key: Value, value: Value) -> Result<Value, Value> {
    if let Some(ts) = traits_of(obj) {
        if ts.is_frozen() {
            let kind = match obj.kind() {
                ValueKind::Table => "modifying frozen table.",
                ValueKind::Array => "modifying frozen array.",
                _ => "modifying frozen object.",
            };
            return vm.raise(kind);
        }
        if ts.has(TraitKind::Set) {
            let cb = ts.get(TraitKind::Set);
            return call_trait(vm, cb, obj, &[key, value]);
        }
    }
    field_set_raw(vm, obj, key, value)
}

/// Reads a trait slot of a value; `TRGET`.
pub fn trait_get(vm: &mut Vm, obj: Value, kind: TraitKind) -> Result<Value, Value> {
    match traits_of(obj) {
        Some(ts) => {
            if ts.is_hidden() && !kind.is_flag() {
                return Ok(Value::NIL);
            }
            Ok(ts.get(kind))
        }
        None => vm.raise(&format!("{} values carry no traits", obj.type_name())),
    }
}

/// Writes a trait slot of a value; `TRSET`.
pub fn trait_set(vm: &mut Vm, obj: Value, kind: TraitKind, v: Value) -> Result<Value, Value> {
    match traits_of_mut(obj) {
        Some(ts) => {
            ts.set(vm, kind, v)?;
            Ok(Value::NIL)
        }
        None => vm.raise(&format!("{} values carry no traits", obj.type_name())),
    }
}

/// Length of a container, trait-aware.
pub fn builtin_len(vm: &mut Vm, v: Value) -> Result<Value, Value> {
    if let Some(ts) = traits_of(v) {
        if ts.has(TraitKind::Len) {
            let cb = ts.get(TraitKind::Len);
            return call_trait(vm, cb, v, &[v]);
        }
    }
    if let Some(s) = v.as_string() {
        return Ok(Value::number(s.len as f64));
    }
    if let Some(a) = v.as_array() {
        return Ok(Value::number(a.len() as f64));
    }
    if let Some(t) = v.as_table() {
        return Ok(Value::number(t.len() as f64));
    }
    vm.raise(&format!("expected container, got {}", v.type_name()))
}

/// Shallow duplication of containers and closures; other values pass
/// through unchanged.
pub fn builtin_dup(vm: &mut Vm, v: Value) -> Result<Value, Value> {
    if let Some(a) = v.as_array() {
        let d = Array::duplicate(vm, a)?;
        return Ok(Value::from_gc_parts(ValueKind::Array, d.header()));
    }
    if let Some(t) = v.as_table() {
        let d = Table::duplicate(vm, t)?;
        return Ok(Value::from_gc_parts(ValueKind::Table, d.header()));
    }
    if let Some(f) = v.as_function() {
        let d = Function::duplicate(vm, f)?;
        return Ok(Value::from_gc_parts(ValueKind::Function, d.header()));
    }
    if let Some(o) = v.as_object() {
        let d = Object::duplicate(vm, o)?;
        return Ok(Value::from_gc_parts(ValueKind::Object, d.header()));
    }
    Ok(v)
}

/// Concatenation of two same-kind containers.
pub fn builtin_join(vm: &mut Vm, a: Value, b: Value) -> Result<Value, Value> {
    if let (Some(x), Some(y)) = (a.as_string(), b.as_string()) {
        let mut s = String::with_capacity(x.len as usize + y.len as usize);
        s.push_str(x.as_str());
        s.push_str(y.as_str());
        return vm.intern_value(&s);
    }
    if let (Some(x), Some(y)) = (a.as_array(), b.as_array()) {
        let out = Array::create(vm, x.len() + y.len())?;
        for v in x.as_slice().iter().chain(y.as_slice()) {
            Array::push(vm, out, *v)?;
        }
        return Ok(Value::from_gc_parts(ValueKind::Array, out.header()));
    }
    if let (Some(x), Some(y)) = (a.as_table(), b.as_table()) {
        let out = Table::duplicate(vm, x)?;
        for (k, v) in y.iter().map(|e| (e.key, e.value)).collect::<Vec<_>>() {
            Table::set(vm, out, k, v)?;
        }
        return Ok(Value::from_gc_parts(ValueKind::Table, out.header()));
    }
    vm.raise(&format!(
        "cannot join {} with {}",
        a.type_name(),
        b.type_name()
    ))
}

/// Membership test: key in table, element in array, substring in string.
pub fn builtin_in(vm: &mut Vm, needle: Value, hay: Value) -> Result<Value, Value> {
    if let Some(t) = hay.as_table() {
        return Ok(Value::bool(t.contains(needle)));
    }
    if let Some(a) = hay.as_array() {
        return Ok(Value::bool(a.as_slice().iter().any(|v| v.equals(needle))));
    }
    if let (Some(h), Some(n)) = (hay.as_string(), needle.as_string()) {
        return Ok(Value::bool(h.as_str().contains(n.as_str())));
    }
    vm.raise(&format!("expected container, got {}", hay.type_name()))
}

// Native descriptors for the compiler. `params`/`ret` describe the typed
// signature after specialization; `Any` parameters are boxed.

macro_rules! native_adapters {
    ($($adapter:ident => $fn_name:ident ( $($param:ident),* );)*) => {
        $(
            fn $adapter(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, Value> {
                let mut it = args.iter().copied();
                $(let $param = it.next().unwrap_or(Value::NIL);)*
                $fn_name(vm $(, $param)*)
            }
        )*
    };
}

fn array_new_v(vm: &mut Vm, n: Value) -> Result<Value, Value> {
    array_new(vm, n.coerce_num().unwrap_or(0.0).max(0.0) as usize)
}

fn table_new_v(vm: &mut Vm, n: Value) -> Result<Value, Value> {
    table_new(vm, n.coerce_num().unwrap_or(0.0).max(0.0) as usize)
}

native_adapters! {
    nf_array_new => array_new_v(n);
    nf_table_new => table_new_v(n);
    nf_field_get_raw => field_get_raw(obj, key);
    nf_field_set_raw => field_set_raw(obj, key, value);
    nf_field_get => field_get(obj, key);
    nf_field_set => field_set(obj, key, value);
    nf_len => builtin_len(v);
    nf_dup => builtin_dup(v);
    nf_join => builtin_join(a, b);
    nf_in => builtin_in(a, b);
    nf_num => to_num(v);
    nf_int => to_int(v);
    nf_str => to_str(v);
    nf_object_new => object_new(cls);
    nf_instance_of => instance_of(v, base);
}

/// `array_new(vm, n)`.
pub static NF_ARRAY_NEW: NativeInfo = NativeInfo {
    name: "array_new",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::I32], ret: Ty::Arr }],
    invoke: nf_array_new,
};

/// `table_new(vm, n)`.
pub static NF_TABLE_NEW: NativeInfo = NativeInfo {
    name: "table_new",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::I32], ret: Ty::Tbl }],
    invoke: nf_table_new,
};

/// Raw field read.
pub static NF_FIELD_GET_RAW: NativeInfo = NativeInfo {
    name: "field_get_raw",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any], ret: Ty::Any }],
    invoke: nf_field_get_raw,
};

/// Raw field write.
pub static NF_FIELD_SET_RAW: NativeInfo = NativeInfo {
    name: "field_set_raw",
    attr: NativeAttr::SIDE_EFFECT,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any, Ty::Any], ret: Ty::None }],
    invoke: nf_field_set_raw,
};

/// Trait-aware field read.
pub static NF_FIELD_GET: NativeInfo = NativeInfo {
    name: "field_get",
    attr: NativeAttr::SIDE_EFFECT,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any], ret: Ty::Any }],
    invoke: nf_field_get,
};

/// Trait-aware field write.
pub static NF_FIELD_SET: NativeInfo = NativeInfo {
    name: "field_set",
    attr: NativeAttr::SIDE_EFFECT,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any, Ty::Any], ret: Ty::None }],
    invoke: nf_field_set,
};

/// Container length.
pub static NF_LEN: NativeInfo = NativeInfo {
    name: "builtin_len",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any], ret: Ty::F64 }],
    invoke: nf_len,
};

/// Container duplication.
pub static NF_DUP: NativeInfo = NativeInfo {
    name: "builtin_dup",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::Any], ret: Ty::Any }],
    invoke: nf_dup,
};

/// Container concatenation.
pub static NF_JOIN: NativeInfo = NativeInfo {
    name: "builtin_join",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any], ret: Ty::Any }],
    invoke: nf_join,
};

/// Membership test.
pub static NF_IN: NativeInfo = NativeInfo {
    name: "builtin_in",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Any], ret: Ty::I1 }],
    invoke: nf_in,
};

/// Numeric coercion.
pub static NF_NUM: NativeInfo = NativeInfo {
    name: "num",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any], ret: Ty::F64 }],
    invoke: nf_num,
};

/// Integer coercion.
pub static NF_INT: NativeInfo = NativeInfo {
    name: "int",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any], ret: Ty::F64 }],
    invoke: nf_int,
};

/// String coercion.
pub static NF_STR: NativeInfo = NativeInfo {
    name: "str",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::Any], ret: Ty::Str }],
    invoke: nf_str,
};

/// Trivial object construction.
pub static NF_OBJECT_NEW: NativeInfo = NativeInfo {
    name: "object_new",
    attr: NativeAttr::empty(),
    overloads: &[NativeOverload { params: &[Ty::Vcl], ret: Ty::Obj }],
    invoke: nf_object_new,
};

/// Class membership test.
pub static NF_INSTANCE_OF: NativeInfo = NativeInfo {
    name: "instance_of",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::Vcl], ret: Ty::I1 }],
    invoke: nf_instance_of,
};

/// Double remainder for specialized `mod`; compiled code calls this when
/// both operands proved `f64`.
pub static NF_FMOD: NativeInfo = NativeInfo {
    name: "fmod",
    attr: NativeAttr::CONST,
    overloads: &[NativeOverload { params: &[Ty::F64, Ty::F64], ret: Ty::F64 }],
    invoke: nf_fmod,
};

fn nf_fmod(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, Value> {
    let a = args.first().copied().unwrap_or(Value::NIL).as_number();
    let b = args.get(1).copied().unwrap_or(Value::NIL).as_number();
    Ok(Value::number(number_binop(Opcode::AMOD, a, b)))
}

/// Double exponentiation for specialized `pow`.
pub static NF_FPOW: NativeInfo = NativeInfo {
    name: "fpow",
    attr: NativeAttr::CONST,
    overloads: &[NativeOverload { params: &[Ty::F64, Ty::F64], ret: Ty::F64 }],
    invoke: nf_fpow,
};

fn nf_fpow(_vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, Value> {
    let a = args.first().copied().unwrap_or(Value::NIL).as_number();
    let b = args.get(1).copied().unwrap_or(Value::NIL).as_number();
    Ok(Value::number(a.powf(b)))
}

fn trait_kind_of(idx: Value) -> Option<TraitKind> {
    TraitKind::from_index(idx.coerce_num()? as i32)
}

fn nf_trait_get(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, Value> {
    let obj = args.first().copied().unwrap_or(Value::NIL);
    let Some(kind) = args.get(1).copied().and_then(trait_kind_of) else {
        return vm.raise("unknown trait index");
    };
    trait_get(vm, obj, kind)
}

fn nf_trait_set(vm: &mut Vm, _this: Value, args: &[Value]) -> Result<Value, Value> {
    let obj = args.first().copied().unwrap_or(Value::NIL);
    let Some(kind) = args.get(1).copied().and_then(trait_kind_of) else {
        return vm.raise("unknown trait index");
    };
    let v = args.get(2).copied().unwrap_or(Value::NIL);
    trait_set(vm, obj, kind, v)
}

/// Trait slot read.
pub static NF_TRAIT_GET: NativeInfo = NativeInfo {
    name: "trait_get",
    attr: NativeAttr::PURE,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::I32], ret: Ty::Any }],
    invoke: nf_trait_get,
};

/// Trait slot write.
pub static NF_TRAIT_SET: NativeInfo = NativeInfo {
    name: "trait_set",
    attr: NativeAttr::SIDE_EFFECT,
    overloads: &[NativeOverload { params: &[Ty::Any, Ty::I32, Ty::Any], ret: Ty::None }],
    invoke: nf_trait_set,
};

/// Resolves a well-known helper by name; the compiler's constant pool
/// stores these by reference.
pub fn native_by_name(name: &str) -> Option<&'static NativeInfo> {
    Some(match name {
        "array_new" => &NF_ARRAY_NEW,
        "table_new" => &NF_TABLE_NEW,
        "field_get_raw" => &NF_FIELD_GET_RAW,
        "field_set_raw" => &NF_FIELD_SET_RAW,
        "field_get" => &NF_FIELD_GET,
        "field_set" => &NF_FIELD_SET,
        "builtin_len" => &NF_LEN,
        "builtin_dup" => &NF_DUP,
        "builtin_join" => &NF_JOIN,
        "builtin_in" => &NF_IN,
        "num" => &NF_NUM,
        "int" => &NF_INT,
        "str" => &NF_STR,
        "object_new" => &NF_OBJECT_NEW,
        "instance_of" => &NF_INSTANCE_OF,
        "trait_get" => &NF_TRAIT_GET,
        "trait_set" => &NF_TRAIT_SET,
        "fmod" => &NF_FMOD,
        "fpow" => &NF_FPOW,
        _ => return None,
    })
}

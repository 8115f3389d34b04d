//! User classes and their instances.
//!
//! A class carries a field table (`name -> (type, offset, flags)`), a static
//! data area, a default data area cloned into every fresh instance and an
//! optional constructor. Instances own a byte data area laid out by the
//! class. The VM-wide type set maps negative type ids to live classes and
//! is maintained by the class destructor.

use core::ptr::NonNull;

use crate::gc::{Gc, GcObject, Header, ObjectTag};
use crate::object::{Function, GcString};
use crate::traits::TraitSet;
use crate::types::Ty;
use crate::value::Value;
use crate::vm::Vm;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// Field properties.
    pub struct FieldFlags: u8 {
        /// Lives in the class's static area instead of the instance.
        const STATIC = 1 << 0;
        /// Declared at runtime rather than in the class body.
        const DYNAMIC = 1 << 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
/// Field descriptor within a class layout.
pub struct FieldInfo {
    /// Declared data type.
    pub ty: Ty,
    /// Properties.
    pub flags: FieldFlags,
    _pad: u16,
    /// Byte offset into the owning data area.
    pub offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FieldPair {
    key: Option<NonNull<GcString>>,
    info: FieldInfo,
}

#[repr(C)]
/// A class. The static data area, the per-instance default data area and
/// the field table follow the fixed fields inline, in that order.
pub struct Class {
    hdr: Header,
    super_: Option<NonNull<Class>>,
    name: Option<NonNull<GcString>>,
    ctor: Option<NonNull<Function>>,
    /// Negative VM type id, assigned by the type set.
    pub vm_tid: i32,
    /// Instance data area size in bytes.
    pub object_size: u32,
    static_size: u32,
    num_fields: u32,
    data: [u64; 0],
}

// Safety: repr(C), header first; creation writes the full inline payload.
unsafe impl GcObject for Class {
    const TAG: ObjectTag = ObjectTag::Class;
}

/// Field description fed to [`Class::create`].
pub struct FieldDesc<'a> {
    /// Field name.
    pub name: &'a str,
    /// Declared type.
    pub ty: Ty,
    /// Whether the field is static.
    pub is_static: bool,
    /// Initial value, stored in the static area or the default area.
    pub init: Value,
}

impl Class {
    /// Creates a class and registers it in the VM type set.
    pub fn create(
        vm: &mut Vm,
        name: &str,
        super_: Option<Gc<Class>>,
        fields: &[FieldDesc<'_>],
    ) -> Result<Gc<Class>, Value> {
        let name = vm.intern(name)?;

        // Lay out both data areas. Offsets are aligned to the data size.
        let mut object_size = super_.map(|s| s.object_size).unwrap_or(0);
        let mut static_size = 0u32;
        let mut infos = Vec::with_capacity(fields.len());
        for f in fields {
            let size = f.ty.data_size();
            let area = if f.is_static { &mut static_size } else { &mut object_size };
            let offset = (*area + size - 1) & !(size - 1);
            *area = offset + size;
            infos.push(FieldInfo {
                ty: f.ty,
                flags: if f.is_static {
                    FieldFlags::STATIC
                } else {
                    FieldFlags::empty()
                },
                _pad: 0,
                offset,
            });
        }
        object_size = (object_size + 7) & !7;
        static_size = (static_size + 7) & !7;

        let extra = static_size as usize
            + object_size as usize
            + fields.len() * core::mem::size_of::<FieldPair>();
        let cls: Gc<Class> = vm.alloc(extra)?;
        unsafe {
            let c = cls.as_mut();
            c.super_ = super_.map(|s| NonNull::new_unchecked(s.as_ptr()));
            c.name = NonNull::new(name.as_ptr());
            c.ctor = None;
            c.object_size = object_size;
            c.static_size = static_size;
            c.num_fields = fields.len() as u32;
        }
        unsafe { cls.as_mut().vm_tid = vm.register_class(cls) };

        // Inherit the super's default area, then apply own initializers.
        unsafe {
            if let Some(s) = super_ {
                core::ptr::copy_nonoverlapping(
                    s.default_area(),
                    cls.default_area_mut(),
                    s.object_size as usize,
                );
            }
        }
        for (i, f) in fields.iter().enumerate() {
            let key = vm.intern(f.name)?;
            let info = infos[i];
            unsafe {
                *cls.fields_ptr().add(i) = FieldPair {
                    key: NonNull::new(key.as_ptr()),
                    info,
                };
                let area = if f.is_static {
                    cls.static_area_mut()
                } else {
                    cls.default_area_mut()
                };
                store_typed(area.add(info.offset as usize), info.ty, f.init);
            }
        }
        Ok(cls)
    }

    /// Class name.
    pub fn name(&self) -> Option<Gc<GcString>> {
        self.name.map(|p| unsafe { Gc::from_ptr(p.as_ptr()) })
    }

    /// Super class.
    pub fn super_class(&self) -> Option<Gc<Class>> {
        self.super_.map(|p| unsafe { Gc::from_ptr(p.as_ptr()) })
    }

    /// Constructor function.
    pub fn ctor(&self) -> Option<Gc<Function>> {
        self.ctor.map(|p| unsafe { Gc::from_ptr(p.as_ptr()) })
    }

    /// Installs the constructor.
    pub fn set_ctor(&mut self, f: Gc<Function>) {
        self.ctor = NonNull::new(f.as_ptr());
    }

    /// Whether `self` appears on `other`'s super chain (or is `other`).
    pub fn is_base_of(&self, other: Gc<Class>) -> bool {
        let mut cur = Some(other);
        while let Some(c) = cur {
            if core::ptr::eq(c.as_ptr(), self) {
                return true;
            }
            cur = c.super_class();
        }
        false
    }

    fn static_area(&self) -> *const u8 {
        self.data.as_ptr() as *const u8
    }

    unsafe fn static_area_mut(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    pub(crate) fn default_area(&self) -> *const u8 {
        unsafe { self.static_area().add(self.static_size as usize) }
    }

    unsafe fn default_area_mut(&self) -> *mut u8 {
        self.static_area_mut().add(self.static_size as usize)
    }

    fn fields_ptr(&self) -> *mut FieldPair {
        unsafe {
            self.static_area()
                .add(self.static_size as usize + self.object_size as usize) as *mut FieldPair
        }
    }

    fn fields(&self) -> &[FieldPair] {
        unsafe { core::slice::from_raw_parts(self.fields_ptr(), self.num_fields as usize) }
    }

    /// Looks a field up by name, walking the super chain.
    pub fn field(&self, key: Gc<GcString>) -> Option<FieldInfo> {
        for pair in self.fields() {
            if pair.key.map(|k| k.as_ptr()) == Some(key.as_ptr()) {
                return Some(pair.info);
            }
        }
        self.super_class().and_then(|s| s.field(key))
    }

    /// Reads a static field.
    pub fn get_static(&self, key: Gc<GcString>) -> Option<Value> {
        let info = self.field(key)?;
        if !info.flags.contains(FieldFlags::STATIC) {
            return None;
        }
        Some(unsafe { load_typed(self.static_area().add(info.offset as usize), info.ty) })
    }

    /// Writes a static field.
    pub fn set_static(&mut self, key: Gc<GcString>, v: Value) -> Result<bool, &'static str> {
        match self.field(key) {
            Some(info) if info.flags.contains(FieldFlags::STATIC) => {
                check_field_type(info.ty, v)?;
                unsafe { store_typed(self.static_area_mut().add(info.offset as usize), info.ty, v) };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) unsafe fn trace(&self, stage: u8) {
        if let Some(s) = self.super_ {
            crate::vm::mark_header(s.as_ptr() as *mut Header, stage);
        }
        if let Some(n) = self.name {
            crate::vm::mark_header(n.as_ptr() as *mut Header, stage);
        }
        if let Some(c) = self.ctor {
            crate::vm::mark_header(c.as_ptr() as *mut Header, stage);
        }
        for pair in self.fields() {
            if let Some(k) = pair.key {
                crate::vm::mark_header(k.as_ptr() as *mut Header, stage);
            }
            // GC-typed and `any` static fields hold traceable values.
            if pair.info.flags.contains(FieldFlags::STATIC)
                && (pair.info.ty.is_gc() || pair.info.ty == Ty::Any)
            {
                let v = load_typed(self.static_area().add(pair.info.offset as usize), pair.info.ty);
                crate::vm::mark_value(v, stage);
            }
        }
        // The default area seeds instances, so its reference fields are
        // roots too.
        self.trace_data_area(self.default_area(), stage);
    }

    pub(crate) unsafe fn trace_data_area(&self, area: *const u8, stage: u8) {
        let mut cur = Some(self);
        while let Some(c) = cur {
            for pair in c.fields() {
                let info = pair.info;
                if info.flags.contains(FieldFlags::STATIC) {
                    continue;
                }
                if info.ty.is_gc() || info.ty == Ty::Any {
                    let v = load_typed(area.add(info.offset as usize), info.ty);
                    crate::vm::mark_value(v, stage);
                }
            }
            cur = c.super_.map(|s| &*s.as_ptr());
        }
    }
}

/// Verifies that `v` may be stored into a field of type `ty`.
fn check_field_type(ty: Ty, v: Value) -> Result<(), &'static str> {
    let ok = match ty {
        Ty::Any => true,
        Ty::F64 | Ty::F32 | Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64 => v.is_number(),
        Ty::I1 => v.is_bool(),
        Ty::Nil => v.is_nil(),
        Ty::Str => v.is_string() || v.is_nil(),
        Ty::Arr => v.is_array() || v.is_nil(),
        Ty::Tbl => v.is_table() || v.is_nil(),
        Ty::Fn => v.is_function() || v.is_nil(),
        Ty::Vcl => v.is_class() || v.is_nil(),
        Ty::Obj => v.is_object() || v.is_nil(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err("field type mismatch")
    }
}

/// Stores a value into a typed data area slot.
unsafe fn store_typed(at: *mut u8, ty: Ty, v: Value) {
    match ty {
        Ty::I1 | Ty::I8 => *at = v.coerce_num().unwrap_or(0.0) as i64 as u8,
        Ty::I16 => *(at as *mut i16) = v.coerce_num().unwrap_or(0.0) as i64 as i16,
        Ty::I32 => *(at as *mut i32) = v.coerce_num().unwrap_or(0.0) as i64 as i32,
        Ty::I64 => *(at as *mut i64) = v.coerce_num().unwrap_or(0.0) as i64,
        Ty::F32 => *(at as *mut f32) = v.coerce_num().unwrap_or(0.0) as f32,
        Ty::F64 => *(at as *mut f64) = v.coerce_num().unwrap_or(0.0),
        _ => *(at as *mut Value) = v,
    }
}

/// Loads a value from a typed data area slot.
unsafe fn load_typed(at: *const u8, ty: Ty) -> Value {
    match ty {
        Ty::I1 => Value::bool(*at != 0),
        Ty::I8 => Value::number(*(at as *const i8) as f64),
        Ty::I16 => Value::number(*(at as *const i16) as f64),
        Ty::I32 => Value::number(*(at as *const i32) as f64),
        Ty::I64 => Value::number(*(at as *const i64) as f64),
        Ty::F32 => Value::number(*(at as *const f32) as f64),
        Ty::F64 => Value::number(*(at as *const f64)),
        _ => *(at as *const Value),
    }
}

#[repr(C)]
/// An instance of a user class. The data area follows inline, laid out by
/// the class field table.
pub struct Object {
    hdr: Header,
    /// Attached traits.
    pub traits: TraitSet,
    class: Option<NonNull<Class>>,
    data: [u8; 0],
}

// Safety: repr(C), header first; creation copies the class default area in.
unsafe impl GcObject for Object {
    const TAG: ObjectTag = ObjectTag::Object;
}

impl Object {
    /// Creates a trivially initialized instance: the class default data
    /// area is copied verbatim.
    pub fn create(vm: &mut Vm, cls: Gc<Class>) -> Result<Gc<Object>, Value> {
        let obj: Gc<Object> = vm.alloc(cls.object_size as usize)?;
        unsafe {
            let m = obj.as_mut();
            m.class = NonNull::new(cls.as_ptr());
            core::ptr::copy_nonoverlapping(
                cls.default_area(),
                m.data.as_mut_ptr(),
                cls.object_size as usize,
            );
        }
        Ok(obj)
    }

    /// The instance's class.
    pub fn class(&self) -> Gc<Class> {
        unsafe { Gc::from_ptr(self.class.expect("object without class").as_ptr()) }
    }

    fn data_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Reads an instance field. `None` when the class has no such field.
    pub fn get(&self, key: Gc<GcString>) -> Option<Value> {
        let info = self.class().field(key)?;
        if info.flags.contains(FieldFlags::STATIC) {
            return self.class().get_static(key);
        }
        Some(unsafe { load_typed(self.data_ptr().add(info.offset as usize), info.ty) })
    }

    /// Writes an instance field. `Ok(false)` when the field does not exist.
    pub fn set(&mut self, key: Gc<GcString>, v: Value) -> Result<bool, &'static str> {
        if self.traits.is_frozen() {
            return Err("modifying frozen object.");
        }
        let Some(info) = self.class().field(key) else {
            return Ok(false);
        };
        if info.flags.contains(FieldFlags::STATIC) {
            return unsafe { self.class().as_mut() }.set_static(key, v);
        }
        check_field_type(info.ty, v)?;
        unsafe { store_typed(self.data_ptr().add(info.offset as usize) as *mut u8, info.ty, v) };
        Ok(true)
    }

    /// Byte-copies the instance.
    pub fn duplicate(vm: &mut Vm, obj: Gc<Object>) -> Result<Gc<Object>, Value> {
        let cls = obj.class();
        let out: Gc<Object> = vm.alloc(cls.object_size as usize)?;
        unsafe {
            let m = out.as_mut();
            m.class = obj.class;
            core::ptr::copy_nonoverlapping(
                obj.data_ptr(),
                m.data.as_mut_ptr(),
                cls.object_size as usize,
            );
        }
        Ok(out)
    }

    pub(crate) unsafe fn trace(&self, stage: u8) {
        if let Some(c) = self.class {
            crate::vm::mark_header(c.as_ptr() as *mut Header, stage);
        }
        let cls = self.class();
        cls.trace_data_area(self.data_ptr(), stage);
        self.traits.trace(stage);
    }
}

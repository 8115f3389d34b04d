//! Arrays: an ordered value sequence with a separately allocated backing
//! store, so capacity can grow without moving the array header.

use core::ptr::NonNull;

use crate::gc::{Gc, GcObject, Header, ObjectTag};
use crate::traits::TraitSet;
use crate::value::Value;
use crate::vm::Vm;

#[repr(C)]
/// Backing store cell. Entries follow the header inline.
pub struct ArrayStore {
    hdr: Header,
    entries: [Value; 0],
}

// Safety: repr(C), header first; entries are filled before use.
unsafe impl GcObject for ArrayStore {
    const TAG: ObjectTag = ObjectTag::Private;
}

impl ArrayStore {
    fn capacity(&self) -> usize {
        self.hdr.object_bytes() / core::mem::size_of::<Value>()
    }

    fn entries(&self) -> *mut Value {
        self.entries.as_ptr() as *mut Value
    }
}

#[repr(C)]
/// Array object header.
pub struct Array {
    hdr: Header,
    /// Attached traits.
    pub traits: TraitSet,
    storage: Option<NonNull<ArrayStore>>,
    len: u32,
    _pad: u32,
}

// Safety: repr(C), header first, zero payload = empty array with no traits.
unsafe impl GcObject for Array {
    const TAG: ObjectTag = ObjectTag::Array;
}

impl Array {
    /// Creates an array, optionally reserving capacity.
    pub fn create(vm: &mut Vm, reserve: usize) -> Result<Gc<Array>, Value> {
        let arr: Gc<Array> = vm.alloc(0)?;
        if reserve != 0 {
            Self::reserve(vm, arr, reserve)?;
        }
        Ok(arr)
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity of the backing store.
    pub fn capacity(&self) -> usize {
        self.storage
            .map(|s| unsafe { (*s.as_ptr()).capacity() })
            .unwrap_or(0)
    }

    fn elems(&self) -> *mut Value {
        match self.storage {
            Some(s) => unsafe { (*s.as_ptr()).entries() },
            None => core::ptr::NonNull::dangling().as_ptr(),
        }
    }

    /// The elements as a slice.
    pub fn as_slice(&self) -> &[Value] {
        unsafe { core::slice::from_raw_parts(self.elems(), self.len()) }
    }

    /// Reads an element; out-of-range reads yield nil.
    pub fn get(&self, idx: usize) -> Value {
        if idx < self.len() {
            unsafe { *self.elems().add(idx) }
        } else {
            Value::NIL
        }
    }

    /// Writes an element. Fails when `idx >= len`.
    pub fn set(&mut self, idx: usize, v: Value) -> bool {
        if idx < self.len() {
            unsafe { *self.elems().add(idx) = v };
            true
        } else {
            false
        }
    }

    /// Grows the backing store to hold at least `n` elements. Growth goes by
    /// `max(n, cap + cap/2)` so repeated pushes amortize.
    pub fn reserve(vm: &mut Vm, arr: Gc<Array>, n: usize) -> Result<(), Value> {
        let cap = arr.capacity();
        if n <= cap {
            return Ok(());
        }
        let new_cap = if cap == 0 { n } else { n.max(cap + cap / 2) };
        let store: Gc<ArrayStore> = vm.alloc(new_cap * core::mem::size_of::<Value>())?;
        unsafe {
            if let Some(old) = arr.storage {
                core::ptr::copy_nonoverlapping(
                    (*old.as_ptr()).entries(),
                    store.as_mut().entries(),
                    arr.len(),
                );
                vm.heap.free_cell(old.as_ptr() as *mut Header, false);
            }
            arr.as_mut().storage = NonNull::new(store.as_ptr());
        }
        Ok(())
    }

    /// Resizes, filling fresh elements with nil.
    pub fn resize(vm: &mut Vm, arr: Gc<Array>, n: usize) -> Result<(), Value> {
        let old = arr.len();
        if n > old {
            Self::reserve(vm, arr, n)?;
            unsafe {
                for i in old..n {
                    *arr.elems().add(i) = Value::NIL;
                }
            }
        }
        unsafe { arr.as_mut().len = n as u32 };
        Ok(())
    }

    /// Appends an element.
    pub fn push(vm: &mut Vm, arr: Gc<Array>, v: Value) -> Result<(), Value> {
        if arr.len() == arr.capacity() {
            Self::reserve(vm, arr, arr.len() + 1)?;
        }
        unsafe {
            let len = arr.len();
            *arr.elems().add(len) = v;
            arr.as_mut().len = len as u32 + 1;
        }
        Ok(())
    }

    /// Removes and returns the last element, nil when empty.
    pub fn pop(&mut self) -> Value {
        if self.len == 0 {
            Value::NIL
        } else {
            self.len -= 1;
            unsafe { *self.elems().add(self.len as usize) }
        }
    }

    /// Shallow copy sharing no storage.
    pub fn duplicate(vm: &mut Vm, arr: Gc<Array>) -> Result<Gc<Array>, Value> {
        let out = Self::create(vm, arr.len())?;
        Self::resize(vm, out, arr.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(arr.elems(), out.elems(), arr.len());
        }
        Ok(out)
    }

    pub(crate) unsafe fn trace(&self, stage: u8) {
        if let Some(s) = self.storage {
            crate::vm::mark_header(s.as_ptr() as *mut Header, stage);
        }
        for v in self.as_slice() {
            crate::vm::mark_value(*v, stage);
        }
        self.traits.trace(stage);
    }
}

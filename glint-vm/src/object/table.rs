//! Open-addressed hash tables.
//!
//! Lookup probes the home slot plus a fixed overflow window without
//! wrapping; the entry storage over-allocates by the window size. Small
//! tables start on an inline four-entry store and spill to a separately
//! allocated node list on first growth. Assigning nil removes a key.
//! Iteration order is slot order and is not preserved across resize.

use core::ptr::NonNull;

use crate::gc::{Gc, GcObject, Header, ObjectTag};
use crate::traits::TraitSet;
use crate::value::Value;
use crate::vm::Vm;

/// Capacity of the inline small-table store.
pub const SMALL_TABLE_LEN: usize = 4;

/// Linear-probe window length.
pub const TABLE_OVERFLOW: usize = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
/// One key/value slot. A nil key marks the slot empty.
pub struct TableEntry {
    /// Slot key, nil when empty.
    pub key: Value,
    /// Slot value.
    pub value: Value,
}

impl TableEntry {
    const EMPTY: Self = Self {
        key: Value::NIL,
        value: Value::NIL,
    };
}

#[repr(C)]
/// Spilled entry storage.
pub struct TableNodes {
    hdr: Header,
    entries: [TableEntry; 0],
}

// Safety: repr(C), header first; entries are nil-filled before use.
unsafe impl GcObject for TableNodes {
    const TAG: ObjectTag = ObjectTag::Private;
}

#[repr(C)]
/// Table object header.
pub struct Table {
    hdr: Header,
    /// Attached traits.
    pub traits: TraitSet,
    node_list: Option<NonNull<TableNodes>>,
    mask: u32,
    active: u32,
    small: [TableEntry; SMALL_TABLE_LEN + TABLE_OVERFLOW],
}

// Safety: repr(C), header first; creation nil-fills the inline store (the
// zeroed payload is never read as entries before that).
unsafe impl GcObject for Table {
    const TAG: ObjectTag = ObjectTag::Table;
}

impl Table {
    /// Creates a table, optionally reserving capacity.
    pub fn create(vm: &mut Vm, reserve: usize) -> Result<Gc<Table>, Value> {
        let tbl: Gc<Table> = vm.alloc(0)?;
        unsafe {
            tbl.as_mut().small = [TableEntry::EMPTY; SMALL_TABLE_LEN + TABLE_OVERFLOW];
            tbl.as_mut().mask = SMALL_TABLE_LEN as u32 - 1;
        }
        if reserve > SMALL_TABLE_LEN {
            Self::rehash(vm, tbl, reserve)?;
        }
        Ok(tbl)
    }

    /// Slot capacity, excluding the overflow window.
    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.active as usize
    }

    /// Whether the table holds no keys.
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    fn entries(&self) -> *mut TableEntry {
        match self.node_list {
            Some(n) => unsafe { (*n.as_ptr()).entries.as_ptr() as *mut TableEntry },
            None => self.small.as_ptr() as *mut TableEntry,
        }
    }

    fn slots(&self) -> &[TableEntry] {
        unsafe {
            core::slice::from_raw_parts(self.entries(), self.capacity() + TABLE_OVERFLOW)
        }
    }

    fn slots_mut(&mut self) -> &mut [TableEntry] {
        unsafe {
            core::slice::from_raw_parts_mut(self.entries(), self.capacity() + TABLE_OVERFLOW)
        }
    }

    fn window(&self, key: Value) -> core::ops::Range<usize> {
        let at = (key.hash() & self.mask as u64) as usize;
        at..at + TABLE_OVERFLOW
    }

    /// Raw read; a miss yields nil.
    pub fn get(&self, key: Value) -> Value {
        for i in self.window(key) {
            let e = self.slots()[i];
            if e.key.equals(key) {
                return e.value;
            }
        }
        Value::NIL
    }

    /// Whether the key is present.
    pub fn contains(&self, key: Value) -> bool {
        !key.is_nil() && self.window(key).any(|i| self.slots()[i].key.equals(key))
    }

    /// Raw write. Assigning nil removes the key. Rehashes (doubling) when
    /// the probe window is full.
    pub fn set(vm: &mut Vm, tbl: Gc<Table>, key: Value, value: Value) -> Result<(), Value> {
        if key.is_nil() {
            return Err(vm.intern_value("indexing with null key")?);
        }

        if value.is_nil() {
            // Removal.
            let t = unsafe { tbl.as_mut() };
            let window = t.window(key);
            for i in window {
                let e = &mut t.slots_mut()[i];
                if e.key.equals(key) {
                    *e = TableEntry::EMPTY;
                    t.active -= 1;
                    return Ok(());
                }
            }
            return Ok(());
        }

        loop {
            let t = unsafe { tbl.as_mut() };
            let window = t.window(key);

            // Overwrite an existing slot.
            for i in window.clone() {
                let e = &mut t.slots_mut()[i];
                if e.key.equals(key) {
                    e.value = value;
                    return Ok(());
                }
            }
            // Claim a free slot in the window.
            for i in window {
                let e = &mut t.slots_mut()[i];
                if e.key.is_nil() {
                    *e = TableEntry { key, value };
                    t.active += 1;
                    return Ok(());
                }
            }
            let cap = t.capacity();
            Self::rehash(vm, tbl, cap * 2)?;
        }
    }

    /// Grows the slot storage to the next power of two holding `n` and
    /// re-inserts every live entry.
    pub fn rehash(vm: &mut Vm, tbl: Gc<Table>, n: usize) -> Result<(), Value> {
        let new_cap = n.max(SMALL_TABLE_LEN).next_power_of_two();
        if new_cap <= tbl.capacity() {
            return Ok(());
        }

        let bytes = (new_cap + TABLE_OVERFLOW) * core::mem::size_of::<TableEntry>();
        let nodes: Gc<TableNodes> = vm.alloc(bytes)?;
        unsafe {
            let fresh = (*nodes.as_ptr()).entries.as_ptr() as *mut TableEntry;
            for i in 0..new_cap + TABLE_OVERFLOW {
                *fresh.add(i) = TableEntry::EMPTY;
            }

            let old_nodes = tbl.node_list;
            let old_entries = tbl.entries();
            let old_total = tbl.capacity() + TABLE_OVERFLOW;

            let t = tbl.as_mut();
            t.node_list = NonNull::new(nodes.as_ptr());
            t.mask = new_cap as u32 - 1;
            t.active = 0;

            for i in 0..old_total {
                let e = *old_entries.add(i);
                if !e.key.is_nil() {
                    // The doubled window always takes the re-insert: a full
                    // window here would have rehashed before this point.
                    Self::set(vm, tbl, e.key, e.value)?;
                }
            }
            if let Some(old) = old_nodes {
                vm.heap.free_cell(old.as_ptr() as *mut Header, false);
            }
        }
        Ok(())
    }

    /// Slot-order iteration over live entries.
    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.slots().iter().filter(|e| !e.key.is_nil())
    }

    /// Finds the first live slot at or after `at`; used by the iterator
    /// opcode. Returns the slot index and entry.
    pub fn next_entry(&self, at: usize) -> Option<(usize, TableEntry)> {
        self.slots()
            .iter()
            .enumerate()
            .skip(at)
            .find(|(_, e)| !e.key.is_nil())
            .map(|(i, e)| (i, *e))
    }

    /// Shallow copy.
    pub fn duplicate(vm: &mut Vm, tbl: Gc<Table>) -> Result<Gc<Table>, Value> {
        let out = Self::create(vm, tbl.capacity())?;
        for i in 0..tbl.capacity() + TABLE_OVERFLOW {
            let e = tbl.slots()[i];
            if !e.key.is_nil() {
                Self::set(vm, out, e.key, e.value)?;
            }
        }
        Ok(out)
    }

    pub(crate) unsafe fn trace(&self, stage: u8) {
        if let Some(n) = self.node_list {
            crate::vm::mark_header(n.as_ptr() as *mut Header, stage);
        }
        for e in self.iter() {
            crate::vm::mark_value(e.key, stage);
            crate::vm::mark_value(e.value, stage);
        }
        self.traits.trace(stage);
    }
}

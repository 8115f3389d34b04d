//! The VM instance: heap, evaluation stack, interned strings, type set and
//! the collector driver. A VM is single-threaded; every operation on it is
//! serialized by the caller and there are no process globals.

use tracing::{debug, trace};

use crate::gc::{
    default_page_alloc, page, Gc, GcObject, Header, Heap, ObjectTag, PageAllocFn, HEADER_CHUNKS,
};
use crate::object::{Array, Class, Function, GcString, Object, Proto, StringSet, Table};
use crate::object::string;
use crate::traits::TraitKind;
use crate::value::Value;

/// Configuration of a fresh VM.
pub struct VmConfig {
    /// Page allocator callback.
    pub alloc_fn: PageAllocFn,
    /// Opaque context handed to the allocator.
    pub alloc_ctx: *mut (),
    /// Initial evaluation stack slots.
    pub stack_reserve: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            alloc_fn: default_page_alloc,
            alloc_ctx: core::ptr::null_mut(),
            stack_reserve: 4096,
        }
    }
}

/// A virtual machine instance.
pub struct Vm {
    /// Paged heap and collector state.
    pub heap: Heap,
    /// Evaluation stack; call frames index into it.
    pub(crate) stack: Vec<Value>,
    string_set: Option<Gc<StringSet>>,
    empty_string: Option<Gc<GcString>>,
    oom_exception: Value,
    /// Registered classes by `-vm_tid - 1`; entries are cleared by the
    /// class destructor, not by marking.
    pub(crate) type_set: Vec<Option<Gc<Class>>>,
    /// Module table, rooted.
    pub(crate) modules: Option<Gc<Table>>,
    /// Optional REPL scope table, rooted.
    pub repl_scope: Option<Gc<Table>>,
    /// Last raised exception payload.
    pub(crate) last_exception: Value,
    /// Current collection stage stamp, one bit.
    pub(crate) stage: u8,
    closed: bool,
}

impl Vm {
    /// Creates a VM with the default configuration.
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// Creates a VM with an explicit page allocator.
    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(config.alloc_fn, config.alloc_ctx),
            stack: Vec::with_capacity(config.stack_reserve),
            string_set: None,
            empty_string: None,
            oom_exception: Value::EXCEPTION,
            type_set: Vec::new(),
            modules: None,
            repl_scope: None,
            last_exception: Value::NIL,
            stage: 0,
            closed: false,
        };

        // Bootstrap order matters: the string set must exist before any
        // interning, and the out-of-memory exception must be pinned so
        // raising it can never allocate.
        let set = StringSet::bootstrap(&mut vm).expect("bootstrap string set");
        vm.string_set = Some(set);
        let empty = string::intern(&mut vm, "").expect("bootstrap empty string");
        vm.empty_string = Some(empty);
        let oom = string::intern(&mut vm, "out of memory").expect("bootstrap oom string");
        unsafe { (*oom.header()).set_static(true) };
        vm.oom_exception = Value::from_gc_parts(crate::types::ValueKind::String, oom.header());
        let modules = Table::create(&mut vm, 0).expect("bootstrap module table");
        vm.modules = Some(modules);
        vm
    }

    /// The interned empty string.
    pub fn empty_string(&self) -> Gc<GcString> {
        self.empty_string.expect("bootstrapped")
    }

    /// The module table.
    pub fn modules(&self) -> Gc<Table> {
        self.modules.expect("bootstrapped")
    }

    pub(crate) fn string_set(&self) -> Gc<StringSet> {
        self.string_set.expect("bootstrapped")
    }

    /// Number of interned strings currently held by the string set.
    pub fn string_set_count(&self) -> usize {
        self.string_set().count()
    }

    pub(crate) fn replace_string_set(&mut self, set: Gc<StringSet>) {
        self.string_set = Some(set);
    }

    /// The last raised exception payload.
    pub fn last_exception(&self) -> Value {
        self.last_exception
    }

    /// Allocates a heap object of type `T` with `extra` payload bytes. The
    /// payload is zeroed; `Err` carries the out-of-memory exception.
    pub fn alloc<T: GcObject>(&mut self, extra: usize) -> Result<Gc<T>, Value> {
        let bytes = core::mem::size_of::<T>() + extra;
        let chunks = (((bytes + 7) >> 3) as u32).max(HEADER_CHUNKS);
        let Some(hdr) = self.heap.allocate_uninit(chunks) else {
            return Err(self.oom_exception);
        };
        unsafe {
            let hdr = hdr.as_ptr();
            // Recycled cells carry stale payload bytes.
            core::ptr::write_bytes(
                (hdr as *mut u8).add(core::mem::size_of::<Header>()),
                0,
                (*hdr).object_bytes(),
            );
            let page = (*hdr).get_page();
            (*hdr).init(page, (*hdr).size_chunks(), T::TAG, self.stage);
            Ok(Gc::from_ptr(hdr as *mut T))
        }
    }

    /// Interns a string.
    pub fn intern(&mut self, text: &str) -> Result<Gc<GcString>, Value> {
        string::intern(self, text)
    }

    /// Interns a string and boxes it.
    pub fn intern_value(&mut self, text: &str) -> Result<Value, Value> {
        let s = self.intern(text)?;
        Ok(Value::from_gc_parts(crate::types::ValueKind::String, s.header()))
    }

    /// Builds an exception value from a message. The result is always an
    /// `Err` so raising sites can use `?` directly.
    pub fn raise<T>(&mut self, msg: &str) -> Result<T, Value> {
        let e = self.intern_value(msg)?;
        Err(e)
    }

    /// Registers a class in the type set and returns its negative type id.
    pub(crate) fn register_class(&mut self, cls: Gc<Class>) -> i32 {
        self.type_set.push(Some(cls));
        -(self.type_set.len() as i32)
    }

    /// Resolves a VM type id to a live class.
    pub fn class_by_tid(&self, tid: i32) -> Option<Gc<Class>> {
        if tid >= 0 {
            return None;
        }
        self.type_set.get((-tid - 1) as usize).copied().flatten()
    }

    /// Explicit collector tick: counts the armed countdown down and
    /// collects when it expires.
    pub fn gc_tick(&mut self) {
        self.heap.tick();
        if self.heap.wants_collection() {
            self.collect();
        }
    }

    /// Runs a full mark-and-sweep cycle. A no-op while suspended.
    pub fn collect(&mut self) {
        if self.heap.suspend {
            return;
        }
        self.heap.reset_schedule();
        self.heap.collect_counter += 1;

        unsafe {
            self.heap.for_each_page(|p| {
                (*p).alive_objects = 0;
            });

            // Mark.
            self.stage ^= 1;
            let stage = self.stage;
            for v in &self.stack {
                mark_value(*v, stage);
            }
            mark_value(self.last_exception, stage);
            mark_value(self.oom_exception, stage);
            if let Some(m) = self.modules {
                mark_header(m.header(), stage);
            }
            if let Some(r) = self.repl_scope {
                mark_header(r.header(), stage);
            }
            // The containers themselves are roots; their entries are weak.
            if let Some(s) = self.string_set {
                mark_header(s.header(), stage);
            }
            if let Some(e) = self.empty_string {
                mark_header(e.header(), stage);
            }

            // Sweep: free every stale object, running destructors where the
            // kind has one.
            let mut freed = 0usize;
            let mut dead: Vec<*mut Header> = Vec::new();
            self.heap.for_each_page(|p| {
                if (*p).alive_objects != (*p).num_objects {
                    page::for_each_object(p, |o| {
                        if !(*o).is_free() && (*o).stage() != stage && !(*o).is_static() {
                            dead.push(o);
                        }
                    });
                }
            });
            // Drop stale interned strings before any cell is recycled, so
            // the set never holds a reused cell.
            if let Some(s) = self.string_set {
                s.as_mut().sweep(stage);
            }

            for o in dead {
                self.destroy(o);
                self.heap.free_cell(o, true);
                freed += 1;
            }

            let released = self.heap.release_empty_pages();
            debug!(
                cycle = self.heap.collect_counter,
                freed, released, "collection finished"
            );
        }
    }

    /// Destructor dispatch ahead of freeing a cell.
    unsafe fn destroy(&mut self, o: *mut Header) {
        match (*o).tag() {
            ObjectTag::Class => {
                let cls = &*(o as *mut Class);
                let idx = (-cls.vm_tid - 1) as usize;
                if let Some(slot) = self.type_set.get_mut(idx) {
                    *slot = None;
                }
            }
            ObjectTag::Object => {
                let obj = &*(o as *mut Object);
                if obj.traits.has(TraitKind::Gc) {
                    // Run the finalizer with collection suspended so the
                    // callback cannot reenter the sweeper.
                    let cb = obj.traits.get(TraitKind::Gc);
                    let this = Value::from_gc_parts(crate::types::ValueKind::Object, o);
                    let was = self.heap.suspend;
                    self.heap.suspend = true;
                    let result = self.call(cb, this, &[]);
                    self.heap.suspend = was;
                    if let Err(e) = result {
                        trace!(error = ?e, "finalizer raised, exception dropped");
                    }
                }
            }
            _ => {}
        }
    }

    /// Total live objects across all pages, as counted by the last cycle.
    pub fn live_objects(&mut self) -> usize {
        let mut n = 0usize;
        unsafe {
            self.heap.for_each_page(|p| n += (*p).alive_objects as usize);
        }
        n
    }

    /// Pushes a root onto the evaluation stack, protecting it from
    /// collection.
    pub fn push_root(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Pops a root pushed by [`Vm::push_root`].
    pub fn pop_root(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::NIL)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            unsafe { self.heap.close() };
        }
    }
}

/// Marks a value reachable for the running cycle.
///
/// # Safety
///
/// Must only run inside a collection cycle of the owning VM.
pub(crate) unsafe fn mark_value(v: Value, stage: u8) {
    if v.is_gc() {
        mark_header(v.gc_header(), stage);
    }
}

/// Marks a heap object and traverses its children.
///
/// # Safety
///
/// `h` must point at a live header of the owning VM's heap.
pub(crate) unsafe fn mark_header(h: *mut Header, stage: u8) {
    debug_assert!(!(*h).is_free());
    if (*h).stage() == stage || (*h).is_static() {
        return;
    }
    (*h).set_stage(stage);

    match (*h).tag() {
        ObjectTag::Table => (*(h as *mut Table)).trace(stage),
        ObjectTag::Array => (*(h as *mut Array)).trace(stage),
        ObjectTag::Object => (*(h as *mut Object)).trace(stage),
        ObjectTag::Class => (*(h as *mut Class)).trace(stage),
        ObjectTag::Function => (*(h as *mut Function)).trace(stage),
        ObjectTag::Proto => (*(h as *mut Proto)).trace(stage),
        // Strings and private cells are leaves.
        _ => {}
    }

    (*(*h).get_page()).alive_objects += 1;
}

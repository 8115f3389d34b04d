//! Heap pages: 4 KiB-multiple arenas linked in a ring.

use core::ptr::NonNull;

use super::{Header, CHUNK_SHIFT, PAGE_SHIFT};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page backs generated code.
        const EXEC = 1 << 0;
        /// Page is never released back to the page allocator.
        const PERMANENT = 1 << 1;
        /// Transient mark used while releasing empty pages.
        const DEAD = 1 << 2;
    }
}

#[repr(C)]
/// A page header. The object arena follows it within the same allocation,
/// chunk-aligned.
pub struct Page {
    pub(crate) prev: *mut Page,
    pub(crate) next: *mut Page,
    /// Allocation size in 4 KiB units. Zero for the ring sentinel.
    pub(crate) num_pages: u32,
    /// Objects currently carved out of this page, free cells excluded.
    pub(crate) num_objects: u32,
    /// Objects found reachable by the running collection cycle.
    pub(crate) alive_objects: u32,
    /// Bump cursor, in chunks from the page base.
    pub(crate) next_chunk: u32,
    pub(crate) flags: PageFlags,
    _pad: u32,
}

/// First usable chunk index: the page header rounded up to a chunk.
pub(crate) const FIRST_CHUNK: u32 = ((core::mem::size_of::<Page>() + 7) >> CHUNK_SHIFT) as u32;

impl Page {
    /// Initializes a page header in place over a fresh allocation.
    ///
    /// # Safety
    ///
    /// `at` must point to a 4 KiB-aligned allocation of `num_pages << 12`
    /// zeroed bytes.
    pub(crate) unsafe fn init(at: *mut u8, num_pages: u32, flags: PageFlags) -> NonNull<Page> {
        let page = at as *mut Page;
        (*page).prev = page;
        (*page).next = page;
        (*page).num_pages = num_pages;
        (*page).num_objects = 0;
        (*page).alive_objects = 0;
        (*page).next_chunk = FIRST_CHUNK;
        (*page).flags = flags;
        NonNull::new_unchecked(page)
    }

    /// Total chunk capacity of the page, header included.
    pub(crate) fn total_chunks(&self) -> u32 {
        self.num_pages << (PAGE_SHIFT - CHUNK_SHIFT)
    }

    /// Whether `chunks` more chunks fit behind the bump cursor.
    pub(crate) fn check_space(&self, chunks: u32) -> bool {
        self.next_chunk as u64 + chunks as u64 <= self.total_chunks() as u64
    }

    pub(crate) fn is_exec(&self) -> bool {
        self.flags.contains(PageFlags::EXEC)
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self as *const Page as *mut u8
    }

    /// Carves an uninitialized cell off the bump region. The caller must
    /// have verified the space.
    ///
    /// # Safety
    ///
    /// `check_space(chunks)` must hold.
    pub(crate) unsafe fn alloc_arena(&mut self, chunks: u32) -> *mut Header {
        debug_assert!(self.check_space(chunks));
        let at = self.base().add((self.next_chunk as usize) << CHUNK_SHIFT);
        self.next_chunk += chunks;
        self.num_objects += 1;
        at as *mut Header
    }

    /// First object header of the page.
    pub(crate) fn first_object(&self) -> *mut Header {
        unsafe { self.base().add((FIRST_CHUNK as usize) << CHUNK_SHIFT) as *mut Header }
    }

    /// One past the last allocated chunk.
    pub(crate) fn arena_end(&self) -> *mut u8 {
        unsafe { self.base().add((self.next_chunk as usize) << CHUNK_SHIFT) }
    }

}

/// Walks every header on `page`, free cells included. The callback may free
/// the current object (which can shrink the arena) but must not touch its
/// successors.
pub(crate) unsafe fn for_each_object(page: *mut Page, mut f: impl FnMut(*mut Header)) {
    let mut it = (*page).first_object();
    while (it as *mut u8) < (*page).arena_end() {
        // Read the successor first: `f` may relink `it` into a free list.
        let next = (*it).next();
        f(it);
        it = next;
    }
}

/// Links `page` into the ring right before `anchor`.
pub(crate) unsafe fn link_before(anchor: *mut Page, page: *mut Page) {
    let prev = (*anchor).prev;
    (*page).prev = prev;
    (*page).next = anchor;
    (*prev).next = page;
    (*anchor).prev = page;
}

/// Unlinks `page` from its ring.
pub(crate) unsafe fn unlink(page: *mut Page) {
    let prev = (*page).prev;
    let next = (*page).next;
    (*prev).next = next;
    (*next).prev = prev;
    (*page).prev = page;
    (*page).next = page;
}

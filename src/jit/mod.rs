//! JIT code cache
//!
//! A bump-allocated heap of compiled blocks shared by all harts, keyed by
//! guest physical PC. The cache itself is codegen-agnostic: callers emit
//! host machine code into a per-hart `JitBlock` buffer and the cache owns
//! placement, publication, inter-block linking and invalidation.
//!
//! Invalidation protocol: writers to guest memory call `mark_dirty_mem`,
//! which atomically moves a page's bit from `jited_pages` to
//! `dirty_pages`; the next `block_lookup` on that page dequeues the dirty
//! bit with an atomic RMW and drops every block and pending link for the
//! page. The paired RMWs are the only ordering the protocol relies on.

pub mod vma;

use std::collections::HashMap;

use crate::atomics::AtomicBitmap;
use crate::spinlock::Spinlock;

/// Entry point of a compiled block, called with the owning hart
pub type BlockFn = unsafe extern "C" fn(hart: *mut core::ffi::c_void);

/// A deferred jump to a block that may not be compiled yet
struct BlockLink {
    target: u64,
    /// Patch site offset within the block's emit buffer
    offset: usize,
}

/// Per-hart emission buffer. The buffer and link list are reset by
/// `init` and consumed by `JitCache::block_finalize`.
pub struct JitBlock {
    phys_pc: u64,
    buf: Vec<u8>,
    links: Vec<BlockLink>,
}

impl JitBlock {
    pub fn new() -> Self {
        JitBlock {
            phys_pc: 0,
            buf: Vec::with_capacity(1024),
            links: Vec::new(),
        }
    }

    pub fn init(&mut self, phys_pc: u64) {
        self.phys_pc = phys_pc;
        self.buf.clear();
        self.links.clear();
    }

    pub fn emit(&mut self, code: &[u8]) {
        self.buf.extend_from_slice(code);
    }

    /// Record a link site at the current position. The caller emits its own
    /// exit sequence there; once `target` is compiled the site is patched
    /// into a direct jump.
    pub fn emit_link(&mut self, target: u64) {
        self.links.push(BlockLink {
            target,
            offset: self.buf.len(),
        });
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for JitBlock {
    fn default() -> Self {
        Self::new()
    }
}

struct JitRegistry {
    /// Bump cursor into the heap
    curr: usize,
    /// phys_pc -> code offset
    blocks: HashMap<u64, usize>,
    /// target phys_pc -> patch site offsets awaiting that target
    links: HashMap<u64, Vec<usize>>,
}

pub struct JitCache {
    /// Writable view of the heap
    data: *mut u8,
    /// Executable view; equals `data` unless the host refused RWX
    code: *const u8,
    size: usize,
    wxorx: bool,
    registry: Spinlock<JitRegistry>,
    jited_pages: AtomicBitmap,
    dirty_pages: AtomicBitmap,
}

unsafe impl Send for JitCache {}
unsafe impl Sync for JitCache {}

impl JitCache {
    /// Allocate the code heap. Tries a single RWX mapping first; hardened
    /// kernels that refuse it get the dual-mapped W^X fallback.
    pub fn new(heap_size: usize, mem_size: usize) -> Result<Self, String> {
        let (data, code, wxorx) = match vma::alloc_rwx(heap_size) {
            Some(ptr) => (ptr, ptr as *const u8, false),
            None => {
                log::info!("RWX mapping refused, falling back to W^X dual-mapped JIT heap");
                let (rw, exec) = vma::multi_mmap(heap_size)
                    .ok_or_else(|| "failed to allocate W^X JIT heap".to_string())?;
                (rw, exec, true)
            }
        };
        Ok(JitCache {
            data,
            code,
            size: heap_size,
            wxorx,
            registry: Spinlock::new(JitRegistry {
                curr: 0,
                blocks: HashMap::with_capacity(64),
                links: HashMap::with_capacity(64),
            }),
            jited_pages: AtomicBitmap::for_mem_size(mem_size),
            dirty_pages: AtomicBitmap::for_mem_size(mem_size),
        })
    }

    #[inline(always)]
    fn block_fn(&self, offset: usize) -> BlockFn {
        unsafe { std::mem::transmute(self.code.add(offset)) }
    }

    /// Mark every page in `[addr, addr + size)` dirty if it holds compiled
    /// code. Called on every guest store and host-side RAM write.
    pub fn mark_dirty_mem(&self, addr: u64, size: usize) {
        let mut page = addr & !0xFFF;
        while page < addr + size as u64 {
            if self.jited_pages.test(page) {
                self.dirty_pages.set(page);
                self.jited_pages.clear(page);
            }
            page += 0x1000;
        }
    }

    /// Look up the compiled entry point for a physical PC.
    ///
    /// A pending dirty bit is dequeued atomically; the caller that wins the
    /// dequeue drops every block and link of that 4 KiB page and reports a
    /// miss, so stale code is never entered.
    pub fn block_lookup(&self, phys_pc: u64) -> Option<BlockFn> {
        if self.dirty_pages.test_and_clear(phys_pc) {
            let page = phys_pc & !0xFFF;
            let mut reg = self.registry.lock();
            reg.blocks.retain(|pc, _| *pc & !0xFFF != page);
            reg.links.retain(|pc, _| *pc & !0xFFF != page);
            return None;
        }
        if !self.jited_pages.test(phys_pc) {
            // Lock-free fast miss
            return None;
        }
        let reg = self.registry.lock();
        reg.blocks.get(&phys_pc).map(|&off| self.block_fn(off))
    }

    /// Append the block to the heap and publish it. Returns None when the
    /// heap is out of space; the caller must `flush_cache` and recompile.
    pub fn block_finalize(&self, block: &mut JitBlock) -> Option<BlockFn> {
        let size = block.buf.len();
        let mut reg = self.registry.lock();
        if reg.curr + size > self.size {
            return None;
        }
        let off = reg.curr;

        vma::jit_write_protect(false);
        unsafe {
            std::ptr::copy_nonoverlapping(block.buf.as_ptr(), self.data.add(off), size);
        }
        reg.curr += size;
        reg.blocks.insert(block.phys_pc, off);

        if vma::NATIVE_LINKER {
            for link in &block.links {
                reg.links
                    .entry(link.target)
                    .or_default()
                    .push(off + link.offset);
            }
            // Sites that were waiting for this block as their target
            if let Some(waiters) = reg.links.remove(&block.phys_pc) {
                for site in waiters {
                    unsafe {
                        vma::patch_jump(self.data.add(site), off as i64 - site as i64);
                    }
                    if !vma::GLOBAL_ICACHE_FLUSH {
                        unsafe {
                            vma::flush_icache(self.code.add(site), vma::LINK_SITE_SIZE);
                        }
                    }
                }
            }
        }

        unsafe {
            vma::flush_icache(self.code.add(off), size);
        }
        vma::jit_write_protect(true);

        self.jited_pages.set(block.phys_pc);
        Some(self.block_fn(off))
    }

    /// Drop every compiled block and pending link and rewind the heap.
    /// Above a usage threshold the physical backing is released too, so a
    /// never-full cache does not pin host memory. Compilers must re-init
    /// any in-flight `JitBlock` afterwards.
    pub fn flush_cache(&self) {
        let mut reg = self.registry.lock();
        if reg.curr > 0x10000 {
            vma::clean(self.data, self.size, self.wxorx);
        }
        reg.blocks.clear();
        reg.links.clear();
        reg.curr = 0;
        self.dirty_pages.clear_all();
    }

    pub fn heap_used(&self) -> usize {
        self.registry.lock().curr
    }
}

impl Drop for JitCache {
    fn drop(&mut self) {
        vma::free(self.data, self.size);
        if self.wxorx {
            vma::free(self.code as *mut u8, self.size);
        }
    }
}

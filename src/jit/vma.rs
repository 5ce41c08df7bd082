//! Host virtual memory ports for the JIT heap
//!
//! Everything platform-specific the code cache needs: RWX allocation with a
//! W^X dual-mapping fallback, physical backing release, instruction cache
//! maintenance, per-thread JIT write protection (Apple Silicon) and the
//! near-jump patching used by the block linker.

use std::ptr;

/// Whether near-jump link patching is implemented for this host
pub const NATIVE_LINKER: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

/// Hosts where only a global icache flush is available; per-link flushes
/// are coalesced into the end-of-block flush there.
pub const GLOBAL_ICACHE_FLUSH: bool = cfg!(all(target_arch = "riscv64", target_os = "linux"));

/// Bytes reserved at a link site for the patched jump
pub const LINK_SITE_SIZE: usize = 8;

/// Map an anonymous read/write/execute region. Fails on hardened kernels
/// that refuse W+X mappings.
pub fn alloc_rwx(size: usize) -> Option<*mut u8> {
    #[cfg(target_os = "macos")]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_JIT;
    #[cfg(not(target_os = "macos"))]
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

/// Map the same physical pages twice: a writable view and an executable
/// view. Used when RWX mappings are refused.
#[cfg(target_os = "linux")]
pub fn multi_mmap(size: usize) -> Option<(*mut u8, *const u8)> {
    unsafe {
        let fd = libc::memfd_create(b"riscvm_jit\0".as_ptr() as *const libc::c_char, 0);
        if fd < 0 {
            return None;
        }
        if libc::ftruncate(fd, size as libc::off_t) < 0 {
            libc::close(fd);
            return None;
        }
        let rw = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        let exec = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        if rw == libc::MAP_FAILED || exec == libc::MAP_FAILED {
            if rw != libc::MAP_FAILED {
                libc::munmap(rw, size);
            }
            if exec != libc::MAP_FAILED {
                libc::munmap(exec, size);
            }
            return None;
        }
        Some((rw as *mut u8, exec as *const u8))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn multi_mmap(_size: usize) -> Option<(*mut u8, *const u8)> {
    None
}

pub fn free(ptr: *mut u8, size: usize) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, size);
    }
}

/// Release the physical backing of a mapping while keeping the mapping
/// itself. `shared` selects the dual-mapped (memfd) heap flavor.
pub fn clean(ptr: *mut u8, size: usize, shared: bool) {
    #[cfg(target_os = "linux")]
    let advice = if shared {
        libc::MADV_REMOVE
    } else {
        libc::MADV_DONTNEED
    };
    #[cfg(not(target_os = "linux"))]
    let advice = {
        let _ = shared;
        libc::MADV_DONTNEED
    };
    unsafe {
        libc::madvise(ptr as *mut libc::c_void, size, advice);
    }
}

/// Toggle this thread's write access to MAP_JIT memory (Apple Silicon).
/// Every write to the heap is bracketed by `jit_write_protect(false)` /
/// `jit_write_protect(true)`.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub fn jit_write_protect(protect: bool) {
    unsafe {
        libc::pthread_jit_write_protect_np(if protect { 1 } else { 0 });
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
pub fn jit_write_protect(_protect: bool) {}

/// x86 keeps data and instruction caches coherent
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub unsafe fn flush_icache(_addr: *const u8, _size: usize) {}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub unsafe fn flush_icache(addr: *const u8, size: usize) {
    extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }
    unsafe {
        sys_icache_invalidate(addr as *mut libc::c_void, size);
    }
}

/// Drain the data cache to the point of unification, then invalidate the
/// instruction cache. "dc civac" rather than "dc cvau" is the documented
/// workaround for Cortex-A53 errata 819472, 826319, 827319 and 824069.
#[cfg(all(target_arch = "aarch64", not(target_os = "macos")))]
pub unsafe fn flush_icache(addr: *const u8, size: usize) {
    const CACHELINE: usize = 64;
    let start = (addr as usize) & !(CACHELINE - 1);
    let end = addr as usize + size;
    unsafe {
        let mut line = start;
        while line < end {
            core::arch::asm!("dc civac, {0}", in(reg) line, options(nostack));
            line += CACHELINE;
        }
        core::arch::asm!("dsb ish", options(nostack));
        let mut line = start;
        while line < end {
            core::arch::asm!("ic ivau, {0}", in(reg) line, options(nostack));
            line += CACHELINE;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack));
    }
}

/// The compiler intrinsics are unreliable here on hosts with a
/// non-coherent icache, use the dedicated syscall
#[cfg(all(target_arch = "riscv64", target_os = "linux"))]
pub unsafe fn flush_icache(addr: *const u8, size: usize) {
    const SYS_RISCV_FLUSH_ICACHE: libc::c_long = 259;
    unsafe {
        libc::syscall(
            SYS_RISCV_FLUSH_ICACHE,
            addr,
            addr.add(size),
            0 as libc::c_long,
        );
    }
}

/// Patch a jump at `site` (writable view) to land `rel` bytes away from
/// the site's address in the executable view.
#[cfg(target_arch = "x86_64")]
pub unsafe fn patch_jump(site: *mut u8, rel: i64) {
    let disp = (rel - 5) as i32;
    unsafe {
        site.write(0xE9); // jmp rel32
        ptr::copy_nonoverlapping(disp.to_le_bytes().as_ptr(), site.add(1), 4);
    }
}

#[cfg(target_arch = "aarch64")]
pub unsafe fn patch_jump(site: *mut u8, rel: i64) {
    // b imm26
    let insn = 0x1400_0000u32 | (((rel >> 2) as u32) & 0x03FF_FFFF);
    unsafe {
        ptr::copy_nonoverlapping(insn.to_le_bytes().as_ptr(), site, 4);
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub unsafe fn patch_jump(_site: *mut u8, _rel: i64) {
    // No native linker on this host; block_finalize never records links
    unreachable!("jump patching without a native linker");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rwx_or_multi_mmap() {
        // One of the two strategies must work on any supported host
        if let Some(ptr) = alloc_rwx(0x10000) {
            unsafe { ptr.write(0x90) };
            free(ptr, 0x10000);
        } else {
            let (rw, exec) = multi_mmap(0x10000).expect("both JIT heap strategies failed");
            unsafe {
                rw.write(0x42);
                assert_eq!(exec.read(), 0x42);
            }
            free(rw, 0x10000);
            free(exec as *mut u8, 0x10000);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_patch_jump_encoding() {
        let mut buf = [0u8; 8];
        unsafe { patch_jump(buf.as_mut_ptr(), 0x100) };
        assert_eq!(buf[0], 0xE9);
        assert_eq!(i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 0xFB);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_patch_jump_encoding() {
        let mut buf = [0u8; 8];
        unsafe { patch_jump(buf.as_mut_ptr(), 0x100) };
        assert_eq!(
            u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            0x1400_0040
        );
    }
}

//! Registered memory regions.
//!
//! A region is the unit of remotely addressable memory: a page-aligned,
//! zeroed allocation whose base address travels to peers as a plain
//! integer. Incoming one-sided operations name raw addresses; the device
//! resolves them against the [`MemRegistry`] before touching memory.
//!
//! A region is written by the device thread (as the target of remote
//! writes) while caller threads poll it, so all access goes through
//! atomic loads and stores: release stores on the writing side, acquire
//! loads on the polling side.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::DevError;

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// A page-aligned registered memory region.
pub struct Region {
    base: *mut u8,
    len: usize,
    layout: Layout,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate a zeroed, page-aligned region of `len` bytes.
    pub fn alloc(len: usize) -> Result<Arc<Self>, DevError> {
        let layout = Layout::from_size_align(len.max(1), page_size())
            .map_err(|_| DevError::MemAlloc(len))?;

        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(DevError::MemAlloc(len));
        }

        Ok(Arc::new(Self { base, len, layout }))
    }

    /// The address peers use to target this region.
    pub fn addr(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn cell(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < self.len);
        unsafe { AtomicU8::from_ptr(self.base.add(off)) }
    }

    /// Copy `src` into the region at `off`, visible to acquire readers.
    pub fn write(&self, off: usize, src: &[u8]) {
        assert!(off + src.len() <= self.len);
        for (i, &b) in src.iter().enumerate() {
            self.cell(off + i).store(b, Ordering::Release);
        }
    }

    /// Copy `dst.len()` bytes out of the region at `off`.
    pub fn read(&self, off: usize, dst: &mut [u8]) {
        assert!(off + dst.len() <= self.len);
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.cell(off + i).load(Ordering::Acquire);
        }
    }

    /// Read one byte; the polling primitive of the collective engine.
    pub fn load_u8(&self, off: usize) -> u8 {
        self.cell(off).load(Ordering::Acquire)
    }

    /// Write one byte.
    pub fn store_u8(&self, off: usize, val: u8) {
        self.cell(off).store(val, Ordering::Release);
    }

    /// View an 8-byte-aligned word as an atomic, for remote atomics.
    pub fn atomic_u64(&self, off: usize) -> Result<&AtomicU64, DevError> {
        if off + 8 > self.len || (self.base as usize + off) % 8 != 0 {
            return Err(DevError::MisalignedAtomic(self.addr() + off as u64));
        }
        Ok(unsafe { AtomicU64::from_ptr(self.base.add(off).cast()) })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

/// Table of registered regions, resolving raw addresses to regions.
pub struct MemRegistry {
    regions: spin::Mutex<Vec<Arc<Region>>>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self {
            regions: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, region: Arc<Region>) {
        self.regions.lock().push(region);
    }

    pub fn unregister(&self, addr: u64) {
        self.regions.lock().retain(|r| r.addr() != addr);
    }

    /// Resolve `[addr, addr + len)` to a registered region and offset.
    pub fn find(&self, addr: u64, len: usize) -> Result<(Arc<Region>, usize), DevError> {
        let regions = self.regions.lock();
        for r in regions.iter() {
            let base = r.addr();
            if addr >= base && addr + len as u64 <= base + r.len() as u64 {
                return Ok((r.clone(), (addr - base) as usize));
            }
        }
        Err(DevError::UnregisteredAddr(addr))
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_zeroed_and_aligned() {
        let r = Region::alloc(8192).unwrap();
        assert_eq!(r.addr() as usize % page_size(), 0);

        let mut buf = vec![0xffu8; 8192];
        r.read(0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let r = Region::alloc(4096).unwrap();
        r.write(100, b"hello");
        let mut out = [0u8; 5];
        r.read(100, &mut out);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_registry_resolves_interior_addresses() {
        let reg = MemRegistry::new();
        let r = Region::alloc(4096).unwrap();
        reg.register(r.clone());

        let (found, off) = reg.find(r.addr() + 128, 64).unwrap();
        assert_eq!(found.addr(), r.addr());
        assert_eq!(off, 128);

        assert!(reg.find(r.addr() + 4090, 64).is_err());
        assert!(reg.find(0xdead_0000, 1).is_err());

        reg.unregister(r.addr());
        assert!(reg.find(r.addr(), 1).is_err());
    }

    #[test]
    fn test_atomic_word() {
        let r = Region::alloc(64).unwrap();
        let a = r.atomic_u64(8).unwrap();
        a.store(41, Ordering::Relaxed);
        assert_eq!(a.fetch_add(1, Ordering::Relaxed), 41);
        assert!(r.atomic_u64(3).is_err());
    }
}

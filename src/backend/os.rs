use core::ptr::{NonNull, null_mut};

use log::debug;

use super::{Backend, Mapping, align_up};

#[cfg(target_os = "linux")]
const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Anonymous private mappings from the operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemBackend {
  page_size: usize,
  huge_pages: bool,
}

impl SystemBackend {
  pub fn new() -> Self {
    Self {
      page_size: os_page_size(),
      huge_pages: false,
    }
  }
}

impl Default for SystemBackend {
  fn default() -> Self {
    Self::new()
  }
}

fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

pub(crate) unsafe fn os_mmap(size: usize, flags: libc::c_int) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  let rc = unsafe { libc::munmap(ptr.cast(), size) };
  debug_assert!(rc == 0, "munmap({:p}, {}) failed", ptr, size);
}

/// Drops the physical pages behind `ptr` while keeping the range reserved.
pub(crate) unsafe fn os_decommit(ptr: *mut u8, size: usize) {
  #[cfg(feature = "release-mem")]
  unsafe {
    libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED);
  }
  #[cfg(not(feature = "release-mem"))]
  let _ = (ptr, size);
}

unsafe impl Backend for SystemBackend {
  fn page_size(&self) -> usize {
    self.page_size
  }

  #[cfg(target_os = "linux")]
  fn use_huge_pages(&mut self) -> bool {
    self.huge_pages = true;
    self.page_size = HUGE_PAGE_SIZE;
    true
  }

  fn map(&self, size: usize, align: usize) -> Option<Mapping> {
    // mmap only guarantees page alignment; over-map and slide forward.
    let padding = if align > self.page_size { align } else { 0 };
    let total = size.checked_add(padding)?;

    let mut raw = null_mut();
    #[cfg(target_os = "linux")]
    if self.huge_pages {
      raw = unsafe { os_mmap(total, libc::MAP_HUGETLB) };
      if raw.is_null() {
        raw = unsafe { os_mmap(total, 0) };
        if !raw.is_null() {
          unsafe { libc::madvise(raw.cast(), total, libc::MADV_HUGEPAGE) };
        }
      }
    }
    if raw.is_null() {
      raw = unsafe { os_mmap(total, 0) };
    }
    if raw.is_null() {
      debug!("mmap of {} bytes failed", total);
      return None;
    }

    let aligned = align_up(raw as usize, align.max(1));
    let align_offset = aligned - raw as usize;
    debug_assert!(align_offset <= padding);
    Some(Mapping {
      ptr: NonNull::new(aligned as *mut u8)?,
      align_offset,
      extra: padding,
    })
  }

  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize, align_offset: usize, release: usize, extra: usize) {
    if release != 0 {
      let base = unsafe { ptr.as_ptr().sub(align_offset) };
      unsafe { os_munmap(base, release + extra) };
    } else {
      unsafe { os_decommit(ptr.as_ptr(), size) };
    }
  }
}

//! Platform virtual-memory service.
//!
//! Provides the primitives the allocator engine builds on: single RWX
//! mappings, dual RX/RW mappings over anonymous shared memory (for W^X
//! environments), hardened-runtime detection, instruction-cache flushing and
//! per-thread JIT write protection.
//!
//! Under `cfg(any(loom, miri))` every "mapping" is backed by a plain heap
//! allocation so the allocator logic can be model-checked without real
//! syscalls; see the mock impl at the bottom.

use std::fmt;
use std::ptr::NonNull;

/// Basic virtual-memory geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmInfo {
    /// OS page size.
    pub page_size: usize,
    /// Allocation granularity. At least 64 KiB so that default-configured
    /// blocks satisfy the minimum block size.
    pub page_granularity: usize,
}

/// Two views of the same physical pages: `rx` is executable but not
/// writable, `rw` is writable but not executable. For single mappings the
/// two pointers are equal.
#[derive(Debug, Clone, Copy)]
pub struct DualMapping {
    pub rx: NonNull<u8>,
    pub rw: NonNull<u8>,
}

// Safety: DualMapping is a pair of addresses; ownership semantics live in the
// block that holds it.
unsafe impl Send for DualMapping {}

/// What the host platform allows for JIT pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardenedRuntimeInfo {
    /// RWX mappings are refused; the runtime enforces W^X.
    pub enabled: bool,
    /// The platform offers a JIT mode (Apple `MAP_JIT` +
    /// `pthread_jit_write_protect_np`) that makes single mappings usable
    /// even under W^X.
    pub map_jit: bool,
}

/// Access mode for [`protect_jit_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectJitAccess {
    /// JIT memory becomes writable for the current thread.
    ReadWrite,
    /// JIT memory becomes executable again.
    ReadExecute,
}

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    ProtectFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    AnonymousMemoryFailed(std::io::Error),
    /// The process ran out of file descriptors while setting up the
    /// anonymous backing for a dual mapping.
    TooManyHandles,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "VM mapping failed: {e}"),
            VmError::ProtectFailed(e) => write!(f, "VM protection change failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::AnonymousMemoryFailed(e) => {
                write!(f, "anonymous memory setup failed: {e}")
            }
            VmError::TooManyHandles => write!(f, "too many open handles for dual mapping"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e)
            | VmError::ProtectFailed(e)
            | VmError::ReleaseFailed(e)
            | VmError::AnonymousMemoryFailed(e) => Some(e),
            VmError::TooManyHandles => None,
        }
    }
}

/// Abstract interface for the virtual-memory operations the allocator uses.
pub(crate) trait VmOps {
    /// Page size and allocation granularity (cached after first query).
    fn info() -> VmInfo;

    /// What the host allows for executable pages.
    fn hardened_runtime_info() -> HardenedRuntimeInfo;

    /// Map `size` bytes readable, writable and executable.
    unsafe fn alloc_rwx(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a region returned by [`alloc_rwx`](VmOps::alloc_rwx).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Map the same anonymous pages twice: one RX view, one RW view.
    unsafe fn alloc_dual_mapping(size: usize) -> Result<DualMapping, VmError>;

    /// Unmap both views of a dual mapping.
    unsafe fn release_dual_mapping(mapping: DualMapping, size: usize) -> Result<(), VmError>;

    /// Make freshly written code visible to the instruction fetcher.
    fn flush_instruction_cache(ptr: *const u8, size: usize);

    /// Toggle JIT page access for the current thread (Apple hardware only;
    /// a no-op elsewhere).
    fn protect_jit_memory(access: ProtectJitAccess);
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{DualMapping, HardenedRuntimeInfo, PlatformVmOps, ProtectJitAccess, VmError, VmInfo, VmOps};
    use crate::sync::atomic::{AtomicU32, Ordering};
    use crate::sync::OnceLock;
    use std::ffi::CString;
    use std::io;
    use std::ptr::NonNull;

    fn map_err(err: io::Error) -> VmError {
        match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => VmError::TooManyHandles,
            _ => VmError::MapFailed(err),
        }
    }

    fn page_size() -> usize {
        static CACHED: OnceLock<usize> = OnceLock::new();
        *CACHED.get_or_init(|| {
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(
                raw > 0,
                "sysconf(_SC_PAGESIZE) failed: {}",
                io::Error::last_os_error()
            );
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            {
                raw as usize
            }
        })
    }

    /// RWX availability probe: map one RWX page once and remember the answer.
    /// 0 = not probed, 1 = allowed, 2 = denied.
    #[cfg(not(target_vendor = "apple"))]
    fn rwx_mapping_allowed() -> bool {
        static PROBED: AtomicU32 = AtomicU32::new(0);

        let mut state = PROBED.load(Ordering::Acquire);
        if state == 0 {
            let size = page_size();
            // Safety: FFI call to mmap; the page is unmapped immediately.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                state = 2;
            } else {
                state = 1;
                // Safety: ptr was just mapped with the given size.
                unsafe { libc::munmap(ptr, size) };
            }
            PROBED.store(state, Ordering::Release);
        }

        state == 1
    }

    #[cfg(target_vendor = "apple")]
    fn has_hardened_runtime() -> bool {
        // Apple platforms are always treated as hardened: MAP_JIT plus
        // pthread_jit_write_protect_np is the supported path.
        true
    }

    #[cfg(not(target_vendor = "apple"))]
    fn has_hardened_runtime() -> bool {
        !rwx_mapping_allowed()
    }

    const fn has_map_jit_support() -> bool {
        cfg!(target_os = "macos")
    }

    fn map_jit_flag() -> libc::c_int {
        // MAP_JIT is incompatible with MAP_SHARED, so it is only applied to
        // single (private anonymous) mappings.
        #[cfg(target_os = "macos")]
        {
            if has_hardened_runtime() && has_map_jit_support() {
                return libc::MAP_JIT;
            }
        }
        0
    }

    // ----------------------------------------------------------------
    // Anonymous shared memory backing for dual mappings
    // ----------------------------------------------------------------

    #[derive(PartialEq, Eq, Clone, Copy)]
    #[allow(dead_code)] // not every platform constructs every backing kind
    enum AnonKind {
        Memfd,
        Shm,
        Tmp,
    }

    struct AnonymousMemory {
        fd: libc::c_int,
        kind: AnonKind,
        name: Option<CString>,
    }

    impl AnonymousMemory {
        /// Linux `memfd_create` when available; otherwise `shm_open` with a
        /// unique name, or a plain file in TMPDIR when the shm mount refuses
        /// executable mappings (`prefer_tmp`).
        fn open(prefer_tmp: bool) -> Result<Self, VmError> {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                use crate::sync::atomic::AtomicU8;
                // 0 = unknown, 1 = works, 2 = ENOSYS (never retry).
                static MEMFD_STATE: AtomicU8 = AtomicU8::new(0);

                if MEMFD_STATE.load(Ordering::Relaxed) != 2 {
                    // Safety: FFI call to memfd_create.
                    let fd = unsafe {
                        libc::memfd_create(c"jitmem".as_ptr(), libc::MFD_CLOEXEC)
                    };
                    if fd >= 0 {
                        MEMFD_STATE.store(1, Ordering::Relaxed);
                        return Ok(Self {
                            fd,
                            kind: AnonKind::Memfd,
                            name: None,
                        });
                    }
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ENOSYS) {
                        MEMFD_STATE.store(2, Ordering::Relaxed);
                    } else {
                        return Err(open_err(err));
                    }
                }
            }

            // Unique-name loop. Nothing cryptographic: address bits give a
            // per-process base, the counter separates concurrent openers,
            // O_EXCL catches the remaining collisions.
            static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);
            let mut nonce = (&NAME_COUNTER as *const _ as u64) >> 4;

            for _ in 0..100 {
                nonce = nonce
                    .rotate_left(13)
                    .wrapping_add(u64::from(NAME_COUNTER.fetch_add(1, Ordering::Relaxed)))
                    .wrapping_mul(0x9E37_79B9_7F4A_7C15);

                if prefer_tmp {
                    let dir = std::env::var_os("TMPDIR")
                        .map(|d| d.to_string_lossy().into_owned())
                        .unwrap_or_else(|| String::from("/tmp"));
                    let path = format!("{dir}/jitmem-{:016x}", nonce);
                    let name = CString::new(path).expect("tmp path contains NUL");
                    // Safety: FFI call to open; name is NUL-terminated.
                    let fd = unsafe {
                        libc::open(
                            name.as_ptr(),
                            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                            0o600 as libc::c_uint,
                        )
                    };
                    if fd >= 0 {
                        return Ok(Self {
                            fd,
                            kind: AnonKind::Tmp,
                            name: Some(name),
                        });
                    }
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EEXIST) {
                        return Err(open_err(err));
                    }
                } else {
                    // Short name: some platforms cap shm names at ~31 bytes.
                    let name = CString::new(format!("/jm-{:016x}", nonce))
                        .expect("shm name contains NUL");
                    // Safety: FFI call to shm_open; name is NUL-terminated.
                    let fd = unsafe {
                        libc::shm_open(
                            name.as_ptr(),
                            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                            0o600 as libc::c_uint,
                        )
                    };
                    if fd >= 0 {
                        return Ok(Self {
                            fd,
                            kind: AnonKind::Shm,
                            name: Some(name),
                        });
                    }
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EEXIST) {
                        return Err(open_err(err));
                    }
                }
            }

            Err(VmError::AnonymousMemoryFailed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "could not create a unique anonymous memory name",
            )))
        }

        fn truncate(&self, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to ftruncate on a descriptor we own.
            if unsafe { libc::ftruncate(self.fd, size as libc::off_t) } != 0 {
                return Err(VmError::AnonymousMemoryFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    fn open_err(err: io::Error) -> VmError {
        match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => VmError::TooManyHandles,
            _ => VmError::AnonymousMemoryFailed(err),
        }
    }

    impl Drop for AnonymousMemory {
        fn drop(&mut self) {
            if let Some(name) = &self.name {
                // Safety: FFI call; name is NUL-terminated.
                unsafe {
                    match self.kind {
                        AnonKind::Shm => {
                            libc::shm_unlink(name.as_ptr());
                        }
                        AnonKind::Tmp => {
                            libc::unlink(name.as_ptr());
                        }
                        AnonKind::Memfd => {}
                    }
                }
            }
            if self.fd >= 0 {
                // Safety: FFI call to close on a descriptor we own.
                unsafe { libc::close(self.fd) };
            }
        }
    }

    /// Whether dual mappings must fall back to TMPDIR-backed files.
    ///
    /// Some systems mount the shm filesystem `noexec` (systemd does this for
    /// /dev/shm in some configurations; Apple and Android restrict it too),
    /// in which case the RX view of a dual mapping cannot be created. Probe
    /// once by mapping a page of anonymous shared memory PROT_READ|PROT_EXEC.
    fn prefer_tmp_backing() -> Result<bool, VmError> {
        #[cfg(any(target_vendor = "apple", target_os = "android"))]
        {
            use crate::sync::atomic::AtomicU8;
            // 0 = unknown, 1 = shm works, 2 = use tmp.
            static STRATEGY: AtomicU8 = AtomicU8::new(0);

            let state = STRATEGY.load(Ordering::Acquire);
            if state != 0 {
                return Ok(state == 2);
            }

            let anon = AnonymousMemory::open(false)?;
            let probe_size = page_size();
            anon.truncate(probe_size)?;

            // Safety: FFI call to mmap over the probe descriptor.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    probe_size,
                    libc::PROT_READ | libc::PROT_EXEC,
                    libc::MAP_SHARED,
                    anon.fd,
                    0,
                )
            };

            let use_tmp = if ptr == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINVAL) | Some(libc::EACCES) | Some(libc::EPERM) => true,
                    _ => return Err(VmError::MapFailed(err)),
                }
            } else {
                // Safety: ptr was just mapped with probe_size.
                unsafe { libc::munmap(ptr, probe_size) };
                false
            };

            if use_tmp {
                log::debug!("shm backing refuses PROT_EXEC; dual mappings use TMPDIR files");
            }
            STRATEGY.store(if use_tmp { 2 } else { 1 }, Ordering::Release);
            Ok(use_tmp)
        }
        #[cfg(not(any(target_vendor = "apple", target_os = "android")))]
        {
            Ok(false)
        }
    }

    /// Map `size` bytes of `fd` with the given protection, MAP_SHARED so the
    /// RW view writes through to the RX view.
    unsafe fn map_shared(
        fd: libc::c_int,
        size: usize,
        prot: libc::c_int,
    ) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap; caller passes a live descriptor.
        let ptr = unsafe {
            libc::mmap(std::ptr::null_mut(), size, prot, libc::MAP_SHARED, fd, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(map_err(io::Error::last_os_error()));
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
    }

    impl VmOps for PlatformVmOps {
        fn info() -> VmInfo {
            static CACHED: OnceLock<VmInfo> = OnceLock::new();
            *CACHED.get_or_init(|| {
                let page_size = page_size();
                VmInfo {
                    page_size,
                    page_granularity: page_size.max(65536),
                }
            })
        }

        fn hardened_runtime_info() -> HardenedRuntimeInfo {
            HardenedRuntimeInfo {
                enabled: has_hardened_runtime(),
                map_jit: has_map_jit_support(),
            }
        }

        unsafe fn alloc_rwx(size: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANON | map_jit_flag(),
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(map_err(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::MapFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap on a region we mapped.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn alloc_dual_mapping(size: usize) -> Result<DualMapping, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }

            let anon = AnonymousMemory::open(prefer_tmp_backing()?)?;
            anon.truncate(size)?;

            // Safety: anon.fd is a live descriptor of `size` bytes.
            let rx = unsafe { map_shared(anon.fd, size, libc::PROT_READ | libc::PROT_EXEC)? };
            // Safety: same descriptor; failure unmaps the first view.
            let rw = match unsafe { map_shared(anon.fd, size, libc::PROT_READ | libc::PROT_WRITE) }
            {
                Ok(rw) => rw,
                Err(e) => {
                    // Safety: rx was mapped above with `size`.
                    unsafe { libc::munmap(rx.as_ptr().cast::<libc::c_void>(), size) };
                    return Err(e);
                }
            };

            // The descriptor is no longer needed once both views exist; the
            // mappings keep the pages alive. `anon` unlinks and closes on drop.
            Ok(DualMapping { rx, rw })
        }

        unsafe fn release_dual_mapping(mapping: DualMapping, size: usize) -> Result<(), VmError> {
            // Safety: both views were mapped with `size` by alloc_dual_mapping.
            let err1 = unsafe { Self::release(mapping.rx, size) };
            let err2 = if mapping.rx != mapping.rw {
                // Safety: as above.
                unsafe { Self::release(mapping.rw, size) }
            } else {
                Ok(())
            };
            err1?;
            err2
        }

        fn flush_instruction_cache(ptr: *const u8, size: usize) {
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            {
                // Coherent instruction caches; nothing to do.
                let _ = (ptr, size);
            }
            #[cfg(all(target_vendor = "apple", not(any(target_arch = "x86", target_arch = "x86_64"))))]
            {
                extern "C" {
                    fn sys_icache_invalidate(start: *const libc::c_void, len: libc::size_t);
                }
                // Safety: FFI call over a range the caller owns.
                unsafe { sys_icache_invalidate(ptr.cast(), size) };
            }
            #[cfg(all(
                target_arch = "aarch64",
                not(target_vendor = "apple"),
                not(any(target_arch = "x86", target_arch = "x86_64"))
            ))]
            {
                // Conservative 4-byte stride: correct for any cache line size.
                use std::arch::asm;
                let start = ptr as usize & !3;
                let end = ptr as usize + size;
                let mut addr = start;
                while addr < end {
                    // Safety: cache maintenance by VA; no memory is accessed.
                    unsafe { asm!("dc cvau, {}", in(reg) addr) };
                    addr += 4;
                }
                // Safety: barriers only.
                unsafe { asm!("dsb ish") };
                let mut addr = start;
                while addr < end {
                    // Safety: cache maintenance by VA; no memory is accessed.
                    unsafe { asm!("ic ivau, {}", in(reg) addr) };
                    addr += 4;
                }
                // Safety: barriers only.
                unsafe {
                    asm!("dsb ish");
                    asm!("isb");
                }
            }
            #[cfg(not(any(
                target_arch = "x86",
                target_arch = "x86_64",
                target_vendor = "apple",
                target_arch = "aarch64"
            )))]
            {
                let _ = (ptr, size);
            }
        }

        fn protect_jit_memory(access: ProtectJitAccess) {
            #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
            {
                // Safety: FFI call; toggles MAP_JIT page access for this thread.
                unsafe {
                    libc::pthread_jit_write_protect_np(match access {
                        ProtectJitAccess::ReadWrite => 0,
                        ProtectJitAccess::ReadExecute => 1,
                    });
                }
            }
            let _ = access;
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{DualMapping, HardenedRuntimeInfo, PlatformVmOps, ProtectJitAccess, VmError, VmInfo, VmOps};
    use crate::sync::OnceLock;
    use std::io;
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;
    use winapi::shared::minwindef::DWORD;
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::memoryapi::{
        CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        FILE_MAP_EXECUTE, FILE_MAP_READ, FILE_MAP_WRITE,
    };
    use winapi::um::processthreadsapi::{FlushInstructionCache, GetCurrentProcess};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{
        HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    struct ScopedHandle(HANDLE);

    impl Drop for ScopedHandle {
        fn drop(&mut self) {
            if !self.0.is_null() {
                // Safety: FFI call on a handle we own.
                unsafe { CloseHandle(self.0) };
            }
        }
    }

    impl VmOps for PlatformVmOps {
        fn info() -> VmInfo {
            static CACHED: OnceLock<VmInfo> = OnceLock::new();
            *CACHED.get_or_init(|| {
                let mut system_info = MaybeUninit::<SYSTEM_INFO>::uninit();
                // Safety: FFI call to GetSystemInfo with a valid out-pointer.
                let system_info = unsafe {
                    GetSystemInfo(system_info.as_mut_ptr());
                    system_info.assume_init()
                };
                VmInfo {
                    page_size: system_info.dwPageSize as usize,
                    page_granularity: system_info.dwAllocationGranularity as usize,
                }
            })
        }

        fn hardened_runtime_info() -> HardenedRuntimeInfo {
            // Windows permits RWX VirtualAlloc.
            HardenedRuntimeInfo::default()
        }

        unsafe fn alloc_rwx(size: usize) -> Result<NonNull<u8>, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                )
            };
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::MapFailed(io::Error::last_os_error()))
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE requires size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree on a region we allocated.
            if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn alloc_dual_mapping(size: usize) -> Result<DualMapping, VmError> {
            if size == 0 {
                return Err(VmError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }

            // Safety: FFI call to CreateFileMappingW (pagefile-backed section).
            let handle = ScopedHandle(unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    std::ptr::null_mut(),
                    PAGE_EXECUTE_READWRITE,
                    ((size as u64) >> 32) as DWORD,
                    (size as u64 & 0xFFFF_FFFF) as DWORD,
                    std::ptr::null(),
                )
            });
            if handle.0.is_null() {
                return Err(VmError::MapFailed(io::Error::last_os_error()));
            }

            let views = [
                FILE_MAP_READ | FILE_MAP_EXECUTE,
                FILE_MAP_READ | FILE_MAP_WRITE,
            ];
            let mut ptr = [std::ptr::null_mut(); 2];
            for (i, &access) in views.iter().enumerate() {
                // Safety: FFI call to MapViewOfFile on a live section handle.
                ptr[i] = unsafe { MapViewOfFile(handle.0, access, 0, 0, size) };
                if ptr[i].is_null() {
                    let err = io::Error::last_os_error();
                    if i == 1 {
                        // Safety: the first view was mapped above.
                        unsafe { UnmapViewOfFile(ptr[0]) };
                    }
                    return Err(VmError::MapFailed(err));
                }
            }

            Ok(DualMapping {
                // Safety: both pointers were checked non-null above.
                rx: unsafe { NonNull::new_unchecked(ptr[0].cast::<u8>()) },
                rw: unsafe { NonNull::new_unchecked(ptr[1].cast::<u8>()) },
            })
        }

        unsafe fn release_dual_mapping(mapping: DualMapping, _size: usize) -> Result<(), VmError> {
            let mut failed = false;
            // Safety: FFI calls over views mapped by alloc_dual_mapping.
            unsafe {
                if UnmapViewOfFile(mapping.rx.as_ptr().cast()) == 0 {
                    failed = true;
                }
                if mapping.rx != mapping.rw && UnmapViewOfFile(mapping.rw.as_ptr().cast()) == 0 {
                    failed = true;
                }
            }
            if failed {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn flush_instruction_cache(ptr: *const u8, size: usize) {
            // Safety: FFI call over a range the caller owns.
            unsafe {
                FlushInstructionCache(GetCurrentProcess(), ptr.cast(), size);
            }
        }

        fn protect_jit_memory(_access: ProtectJitAccess) {}
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed mappings (no real syscalls)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead every "mapping" is a
// plain heap allocation and a dual mapping returns the same pointer for both
// views, which preserves the rx/rw aliasing contract the engine relies on.
// Sufficient for model-checking the allocator's synchronization and for
// detecting undefined behaviour in the pointer arithmetic under Miri; real
// page protections are exercised by the platform impls in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    fn info() -> VmInfo {
        VmInfo {
            page_size: 4096,
            page_granularity: 65536,
        }
    }

    fn hardened_runtime_info() -> HardenedRuntimeInfo {
        HardenedRuntimeInfo::default()
    }

    unsafe fn alloc_rwx(size: usize) -> Result<NonNull<u8>, VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size (engine block sizes are >= 64 KiB).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via alloc_rwx.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn alloc_dual_mapping(size: usize) -> Result<DualMapping, VmError> {
        // Safety: forwarded; same contract.
        let ptr = unsafe { Self::alloc_rwx(size)? };
        Ok(DualMapping { rx: ptr, rw: ptr })
    }

    unsafe fn release_dual_mapping(mapping: DualMapping, size: usize) -> Result<(), VmError> {
        // rx == rw under the mock; free once.
        // Safety: forwarded; same contract.
        unsafe { Self::release(mapping.rx, size) }
    }

    fn flush_instruction_cache(_ptr: *const u8, _size: usize) {}

    fn protect_jit_memory(_access: ProtectJitAccess) {}
}

/// Flushes the instruction cache for a freshly written code range.
///
/// A no-op on x86/x86_64; required on ARM after writing through an RW view
/// before executing through the RX view.
pub fn flush_instruction_cache(ptr: *const u8, size: usize) {
    PlatformVmOps::flush_instruction_cache(ptr, size);
}

/// Toggles JIT page access for the current thread.
///
/// Call with [`ProtectJitAccess::ReadWrite`] before writing code into a
/// single-mapped JIT page on Apple hardware, and with
/// [`ProtectJitAccess::ReadExecute`] afterwards. A no-op on platforms
/// without a thread-local JIT protection primitive.
pub fn protect_jit_memory(access: ProtectJitAccess) {
    PlatformVmOps::protect_jit_memory(access);
}

/// RAII window during which a JIT span is writable for the current thread.
///
/// Flips protection to read-write on construction and back to read-execute
/// (plus an instruction-cache flush of the span) when dropped — on every
/// path out of the scope, including panics.
pub struct ProtectJitReadWriteScope {
    ptr: *const u8,
    size: usize,
}

impl ProtectJitReadWriteScope {
    pub fn new(ptr: *const u8, size: usize) -> Self {
        protect_jit_memory(ProtectJitAccess::ReadWrite);
        Self { ptr, size }
    }
}

impl Drop for ProtectJitReadWriteScope {
    fn drop(&mut self) {
        protect_jit_memory(ProtectJitAccess::ReadExecute);
        flush_instruction_cache(self.ptr, self.size);
    }
}

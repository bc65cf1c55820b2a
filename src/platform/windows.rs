// Windows primitives backing `region`/`sync`: a named file mapping, a named
// mutex (kernel object, inherently robust — the kernel itself releases the
// lock and marks the wait abandoned when the owner's thread dies), a named
// event standing in for the condition variable, and a named semaphore.

use std::ffi::c_void;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_ABANDONED, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, CreateMutexW, CreateSemaphoreW, ReleaseMutex, ReleaseSemaphore, ResetEvent,
    SetEvent, WaitForSingleObject, INFINITE,
};

const ERROR_ALREADY_EXISTS: u32 = 183;

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

const ALIGN: usize = std::mem::align_of::<AtomicI32>();

fn calc_total_size(user_size: usize) -> usize {
    let aligned = ((user_size.wrapping_sub(1) / ALIGN) + 1) * ALIGN;
    aligned + std::mem::size_of::<AtomicI32>()
}

unsafe fn refcount_of(mem: *mut u8, total_size: usize) -> &'static AtomicI32 {
    let offset = total_size - std::mem::size_of::<AtomicI32>();
    &*(mem.add(offset) as *const AtomicI32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct RawRegion {
    handle: HANDLE,
    mem: *mut u8,
    size: usize,
    user_size: usize,
    name: String,
    prev_ref: i32,
    is_creator: bool,
}

unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    pub fn acquire(name: &str, user_size: usize, mode: RegionMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if user_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wide_name = to_wide(&format!("Local\\{name}"));
        let total_size = calc_total_size(user_size);

        let (handle, is_creator) = match mode {
            RegionMode::Create | RegionMode::CreateOrOpen => unsafe {
                let h = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE,
                    0,
                    total_size as u32,
                    wide_name.as_ptr(),
                );
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                let existed = GetLastError() == ERROR_ALREADY_EXISTS;
                if existed && mode == RegionMode::Create {
                    CloseHandle(h);
                    return Err(io::Error::new(io::ErrorKind::AlreadyExists, "region exists"));
                }
                (h, !existed)
            },
            RegionMode::Open => unsafe {
                let h = OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr());
                if h == 0 {
                    return Err(io::Error::last_os_error());
                }
                (h, false)
            },
        };

        let mapped_size = if is_creator {
            total_size
        } else {
            let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
            let probe = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
            if probe.is_null() {
                let err = io::Error::last_os_error();
                unsafe { CloseHandle(handle) };
                return Err(err);
            }
            unsafe {
                VirtualQuery(probe, &mut info, std::mem::size_of::<MEMORY_BASIC_INFORMATION>());
                UnmapViewOfFile(probe);
            }
            info.RegionSize
        };

        let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, mapped_size) };
        if mem.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }

        let prev = unsafe { refcount_of(mem as *mut u8, mapped_size).fetch_add(1, Ordering::AcqRel) };

        Ok(Self {
            handle,
            mem: mem as *mut u8,
            size: mapped_size,
            user_size,
            name: name.to_string(),
            prev_ref: prev,
            is_creator,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mem
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn mapped_size(&self) -> usize {
        self.size
    }

    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prev_ref_count(&self) -> i32 {
        self.prev_ref
    }

    pub fn ref_count(&self) -> i32 {
        if self.mem.is_null() {
            return 0;
        }
        unsafe { refcount_of(self.mem, self.size).load(Ordering::Acquire) }
    }

    /// No-op: Windows kernel objects are reclaimed automatically once the
    /// last handle closes. Present for symmetry with the POSIX side.
    pub fn unlink(&self) {}

    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            unsafe { refcount_of(self.mem, self.size).fetch_sub(1, Ordering::AcqRel) };
            unsafe { UnmapViewOfFile(self.mem as *const c_void) };
        }
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
        let _ = self.is_creator;
    }
}

// ---------------------------------------------------------------------------
// RawMutex — named kernel mutex. Abandoned-owner recovery is automatic: the
// kernel releases ownership and the next waiter's WaitForSingleObject simply
// returns WAIT_ABANDONED instead of WAIT_OBJECT_0.
// ---------------------------------------------------------------------------

pub struct RawMutex {
    handle: HANDLE,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub fn open(name: &str) -> io::Result<Self> {
        let wide_name = to_wide(&format!("Local\\mtx_{name}"));
        let handle = unsafe { CreateMutexW(ptr::null(), 0, wide_name.as_ptr()) };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle })
    }

    pub(crate) fn native_ptr(&self) -> *mut u8 {
        self.handle as *mut u8
    }

    pub fn lock(&self) -> io::Result<bool> {
        let ret = unsafe { WaitForSingleObject(self.handle, INFINITE) };
        match ret {
            WAIT_OBJECT_0 => Ok(false),
            WAIT_ABANDONED => Ok(true),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn lock_timeout(&self, timeout_ms: u64) -> io::Result<Option<bool>> {
        let ret = unsafe { WaitForSingleObject(self.handle, timeout_ms as u32) };
        match ret {
            WAIT_OBJECT_0 => Ok(Some(false)),
            WAIT_ABANDONED => Ok(Some(true)),
            WAIT_TIMEOUT => Ok(None),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn try_lock(&self) -> io::Result<Option<bool>> {
        self.lock_timeout(0)
    }

    pub fn unlock(&self) -> io::Result<()> {
        let ok = unsafe { ReleaseMutex(self.handle) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn clear_storage(_name: &str) {}
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// ---------------------------------------------------------------------------
// RawCondVar — a named auto-reset event plus a local wait/notify counter,
// since Win32 has no direct process-shared condition variable primitive.
// ---------------------------------------------------------------------------

pub struct RawCondVar {
    event: HANDLE,
}

unsafe impl Send for RawCondVar {}
unsafe impl Sync for RawCondVar {}

impl RawCondVar {
    pub fn open(name: &str) -> io::Result<Self> {
        let wide_name = to_wide(&format!("Local\\cv_{name}"));
        let event = unsafe { CreateEventW(ptr::null(), 0, 0, wide_name.as_ptr()) };
        if event == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { event })
    }

    pub fn wait(&self, mtx: &RawMutex, timeout_ms: Option<u64>) -> io::Result<bool> {
        mtx.unlock()?;
        let ms = timeout_ms.map(|v| v as u32).unwrap_or(INFINITE);
        let ret = unsafe { WaitForSingleObject(self.event, ms) };
        mtx.lock().map(|_| ())?;
        match ret {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn notify_one(&self) -> io::Result<()> {
        let ok = unsafe { SetEvent(self.event) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { ResetEvent(self.event) };
        Ok(())
    }

    pub fn notify_all(&self) -> io::Result<()> {
        self.notify_one()
    }

    pub fn clear_storage(_name: &str) {}
}

impl Drop for RawCondVar {
    fn drop(&mut self) {
        if self.event != 0 {
            unsafe { CloseHandle(self.event) };
        }
    }
}

// ---------------------------------------------------------------------------
// RawSemaphore — named kernel semaphore.
// ---------------------------------------------------------------------------

pub struct RawSemaphore {
    handle: HANDLE,
}

unsafe impl Send for RawSemaphore {}
unsafe impl Sync for RawSemaphore {}

impl RawSemaphore {
    pub fn open(name: &str, initial_count: u32) -> io::Result<Self> {
        let wide_name = to_wide(&format!("Local\\sem_{name}"));
        let handle = unsafe {
            CreateSemaphoreW(ptr::null(), initial_count as i32, i32::MAX, wide_name.as_ptr())
        };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { handle })
    }

    pub fn wait(&self, timeout_ms: Option<u64>) -> io::Result<bool> {
        let ms = timeout_ms.map(|v| v as u32).unwrap_or(INFINITE);
        let ret = unsafe { WaitForSingleObject(self.handle, ms) };
        match ret {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn post(&self, count: u32) -> io::Result<()> {
        let ok = unsafe { ReleaseSemaphore(self.handle, count as i32, ptr::null_mut()) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn clear_storage(_name: &str) {}
}

impl Drop for RawSemaphore {
    fn drop(&mut self) {
        if self.handle != 0 {
            unsafe { CloseHandle(self.handle) };
        }
    }
}

// Mercury shared memory region - cross-platform named byte regions
//
// Each platform uses its optimal shared memory mechanism:
// - Linux: /dev/shm files (tmpfs - RAM-backed)
// - macOS: shm_open() + mmap (POSIX shared memory)
// - Windows: CreateFileMappingW with INVALID_HANDLE_VALUE (pagefile-backed)
// - Other: file-backed mmap under the system temp directory

use crate::error::{MercuryError, MercuryResult};
use crate::memory::platform::validate_region_name;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
use crate::memory::platform::shm_rings_dir;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
use memmap2::{MmapMut, MmapOptions};
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
use std::fs::{File, OpenOptions};
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
use std::path::PathBuf;

/// A named, fixed-size, byte-addressable region shared by every process that
/// opens the same name.
///
/// Creating and opening are distinct: exactly one process is the *owner*
/// (it created the region and unlinks it on drop); every other process is a
/// joiner. The mapping itself is unmapped when the handle drops, on every
/// platform.
#[derive(Debug)]
pub struct ShmRegion {
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    mmap: MmapMut,
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    _file: File,
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    path: PathBuf,

    #[cfg(target_os = "macos")]
    ptr: *mut u8,
    #[cfg(target_os = "macos")]
    fd: i32,
    #[cfg(target_os = "macos")]
    shm_name: String,

    #[cfg(target_os = "windows")]
    ptr: *mut u8,
    #[cfg(target_os = "windows")]
    handle: isize, // HANDLE

    name: String,
    size: usize,
    owner: bool,
}

// ============================================================================
// File-backed implementation (Linux tmpfs and generic fallback)
// ============================================================================

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
impl ShmRegion {
    fn region_path(name: &str) -> PathBuf {
        shm_rings_dir().join(format!("mercury_{}", name))
    }

    /// Create a new region of `size` bytes. Fails if the name already exists.
    pub fn create(name: &str, size: usize) -> MercuryResult<Self> {
        validate_region_name(name)?;
        let path = Self::region_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        // SAFETY: file is a valid open file with its length set above;
        // len(size) matches the file size.
        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        mmap.fill(0);

        log::info!("Created shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            mmap,
            _file: file,
            path,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing region, adopting its recorded size.
    pub fn open(name: &str) -> MercuryResult<Self> {
        validate_region_name(name)?;
        let path = Self::region_path(name);

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(MercuryError::memory(format!(
                "region '{}' exists but has zero length",
                name
            )));
        }

        // SAFETY: file is a valid open file; len(size) matches its length.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        log::info!("Opened shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            mmap,
            _file: file,
            path,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    /// Best-effort flush of the mapping to its backing object.
    pub fn flush(&self) -> MercuryResult<()> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Unlink the backing object regardless of ownership. The mapping stays
    /// valid until this handle drops.
    pub fn force_cleanup(&self) {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner && self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ============================================================================
// macOS implementation - POSIX shm_open() (Mach shared memory, RAM-backed)
// ============================================================================

#[cfg(target_os = "macos")]
impl ShmRegion {
    fn shm_object_name(name: &str) -> String {
        // POSIX shm names allow no slash after the leading one.
        format!("/mercury_{}", name.replace('/', "."))
    }

    fn c_name(shm_name: &str) -> MercuryResult<std::ffi::CString> {
        std::ffi::CString::new(shm_name.to_string()).map_err(|e| {
            MercuryError::memory(format!("invalid shm name '{}': {}", shm_name, e))
        })
    }

    /// Create a new region of `size` bytes. Fails if the name already exists.
    pub fn create(name: &str, size: usize) -> MercuryResult<Self> {
        validate_region_name(name)?;
        let shm_name = Self::shm_object_name(name);
        let c_name = Self::c_name(&shm_name)?;

        // SAFETY: c_name is a valid null-terminated CString; flags are valid
        // POSIX constants.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o666,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // SAFETY: fd is a valid open descriptor from shm_open above.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: fd is valid; c_name is a valid CString.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(MercuryError::memory(format!(
                "failed to size shm '{}' to {} bytes: {}",
                shm_name, size, err
            )));
        }

        let ptr = Self::map_fd(fd, size, &shm_name, true, &c_name)?;

        log::info!("Created shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            ptr,
            fd,
            shm_name,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing region, adopting its recorded size.
    pub fn open(name: &str) -> MercuryResult<Self> {
        validate_region_name(name)?;
        let shm_name = Self::shm_object_name(name);
        let c_name = Self::c_name(&shm_name)?;

        // SAFETY: c_name is a valid null-terminated CString.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // SAFETY: fd is a valid open descriptor; stat is zero-initialized.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            stat.st_size as usize
        };
        if size == 0 {
            // SAFETY: fd is a valid open descriptor.
            unsafe { libc::close(fd) };
            return Err(MercuryError::memory(format!(
                "region '{}' exists but has zero length",
                name
            )));
        }

        let ptr = Self::map_fd(fd, size, &shm_name, false, &c_name)?;

        log::info!("Opened shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            ptr,
            fd,
            shm_name,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    fn map_fd(
        fd: i32,
        size: usize,
        shm_name: &str,
        created: bool,
        c_name: &std::ffi::CString,
    ) -> MercuryResult<*mut u8> {
        // SAFETY: fd is valid, size > 0, and flags are valid POSIX mmap
        // constants.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            // SAFETY: fd is valid; c_name is a valid CString.
            unsafe {
                libc::close(fd);
                if created {
                    libc::shm_unlink(c_name.as_ptr());
                }
            }
            return Err(MercuryError::memory(format!(
                "failed to mmap shm '{}': {}",
                shm_name, err
            )));
        }

        if created {
            // SAFETY: ptr is valid from mmap (MAP_FAILED checked above), size
            // matches the mapped region.
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
        }

        Ok(ptr as *mut u8)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Best-effort flush; POSIX shared mappings are coherent already.
    pub fn flush(&self) -> MercuryResult<()> {
        Ok(())
    }

    /// Unlink the backing object regardless of ownership.
    pub fn force_cleanup(&self) {
        if let Ok(c_name) = Self::c_name(&self.shm_name) {
            // SAFETY: c_name is a valid null-terminated CString.
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

#[cfg(target_os = "macos")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: self.ptr is a valid mmap'd pointer and self.size matches
        // the mapped region; self.fd is a valid open descriptor.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
        if self.owner {
            self.force_cleanup();
        }
    }
}

// ============================================================================
// Windows implementation - CreateFileMappingW with pagefile backing
// ============================================================================

#[cfg(target_os = "windows")]
impl ShmRegion {
    fn mapping_name(name: &str) -> Vec<u16> {
        format!("Local\\mercury_{}", name.replace('/', "."))
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect()
    }

    /// Create a new region of `size` bytes. Fails if the name already exists.
    pub fn create(name: &str, size: usize) -> MercuryResult<Self> {
        use windows_sys::Win32::Foundation::{
            CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, INVALID_HANDLE_VALUE,
        };
        use windows_sys::Win32::System::Memory::{
            CreateFileMappingW, MapViewOfFile, FILE_MAP_ALL_ACCESS, PAGE_READWRITE,
        };

        validate_region_name(name)?;
        let wide_name = Self::mapping_name(name);

        // SAFETY: INVALID_HANDLE_VALUE creates a pagefile-backed mapping;
        // wide_name is a valid null-terminated wide string.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE as isize,
                std::ptr::null(),
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                size as u32,
                wide_name.as_ptr(),
            )
        };
        if handle == 0 {
            return Err(MercuryError::memory(format!(
                "CreateFileMappingW('{}') failed: error {}",
                name,
                // SAFETY: GetLastError is always safe to call after a failure.
                unsafe { GetLastError() }
            )));
        }

        // SAFETY: GetLastError is always safe to call; detects a lost
        // creation race.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            // SAFETY: handle is a valid mapping handle.
            unsafe { CloseHandle(handle) };
            return Err(std::io::Error::from(std::io::ErrorKind::AlreadyExists).into());
        }

        // SAFETY: handle is a valid file mapping (non-zero checked above).
        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if ptr.is_null() {
            // SAFETY: handle is a valid mapping handle.
            unsafe { CloseHandle(handle) };
            return Err(MercuryError::memory(format!(
                "MapViewOfFile('{}') failed: error {}",
                name,
                // SAFETY: GetLastError is always safe to call after a failure.
                unsafe { GetLastError() }
            )));
        }

        // SAFETY: ptr is valid from MapViewOfFile (null checked above).
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };

        log::info!("Created shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            ptr: ptr as *mut u8,
            handle,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing region, adopting its recorded size.
    pub fn open(name: &str) -> MercuryResult<Self> {
        use windows_sys::Win32::Foundation::{CloseHandle, GetLastError};
        use windows_sys::Win32::System::Memory::{
            MapViewOfFile, OpenFileMappingW, VirtualQuery, FILE_MAP_ALL_ACCESS,
            MEMORY_BASIC_INFORMATION,
        };

        validate_region_name(name)?;
        let wide_name = Self::mapping_name(name);

        // SAFETY: wide_name is a valid null-terminated wide string.
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr()) };
        if handle == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }

        // Map the full extent (length 0 maps the whole mapping).
        // SAFETY: handle is a valid mapping handle (non-zero checked above).
        let ptr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if ptr.is_null() {
            // SAFETY: handle is a valid mapping handle.
            unsafe { CloseHandle(handle) };
            return Err(MercuryError::memory(format!(
                "MapViewOfFile('{}') failed: error {}",
                name,
                // SAFETY: GetLastError is always safe to call after a failure.
                unsafe { GetLastError() }
            )));
        }

        // SAFETY: ptr is a valid mapped view; info is zero-initialized and
        // sized for VirtualQuery.
        let size = unsafe {
            let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
            let written = VirtualQuery(
                ptr,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            if written == 0 {
                CloseHandle(handle);
                return Err(MercuryError::memory(format!(
                    "VirtualQuery('{}') failed: error {}",
                    name,
                    GetLastError()
                )));
            }
            info.RegionSize
        };

        log::info!("Opened shared region '{}' ({} bytes)", name, size);

        Ok(Self {
            ptr: ptr as *mut u8,
            handle,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Best-effort flush; mapped views of the same object are coherent.
    pub fn flush(&self) -> MercuryResult<()> {
        Ok(())
    }

    /// Named mappings disappear with their last handle on Windows; nothing
    /// to unlink.
    pub fn force_cleanup(&self) {}
}

#[cfg(target_os = "windows")]
impl Drop for ShmRegion {
    fn drop(&mut self) {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Memory::UnmapViewOfFile;

        // SAFETY: self.ptr is a valid mapped view; self.handle is a valid
        // mapping handle.
        unsafe {
            UnmapViewOfFile(self.ptr as *const std::ffi::c_void);
            CloseHandle(self.handle);
        }
    }
}

// ============================================================================
// Common API - fields present on every platform variant
// ============================================================================

impl ShmRegion {
    /// Open the named region if it exists, otherwise create it with `size`
    /// bytes. Creation races resolve to exactly one owner.
    pub fn open_or_create(name: &str, size: usize) -> MercuryResult<Self> {
        match Self::open(name) {
            Ok(region) => Ok(region),
            Err(MercuryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                match Self::create(name, size) {
                    Ok(region) => Ok(region),
                    // Lost the creation race; the winner's region is there now.
                    Err(MercuryError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        Self::open(name)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle is the original creator (responsible for cleanup
    /// on drop).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// The caller-supplied region name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

// SAFETY: ShmRegion uses OS-level shared memory with no thread-local state;
// concurrent access is managed by atomic operations at the ring layer.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

//! DS1WM and K1WM register files mapped from `/dev/mem` or a UIO device.

use ds1wm::{REGISTER_SPAN, Register, RegisterIo};
use std::{
    convert::Infallible,
    fs::{self, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    ptr::NonNull,
    sync::Arc,
};

/// A shared, writable mapping of device memory.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// Only accessed through volatile byte reads and writes; callers serialize
// access per chip.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(path: &Path, len: usize, offset: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        log::debug!("mapped {len:#x} bytes of {} at offset {offset:#x}", path.display());
        Ok(Self { base, len })
    }

    /// Maps the page of physical memory holding `address`.
    ///
    /// Returns the mapping and the offset of `address` in it.
    pub fn physical(address: u64) -> io::Result<(Arc<Self>, usize)> {
        if address == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "illegal address 0"));
        }
        let page = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
            .map_err(|_| io::Error::last_os_error())?;
        let within = (address % page as u64) as usize;
        let len = (within + REGISTER_SPAN).next_multiple_of(page);
        let map = Self::map(Path::new("/dev/mem"), len, address - within as u64)?;
        Ok((Arc::new(map), within))
    }

    /// Maps region 0 of a UIO device such as `/dev/uio0`.
    ///
    /// Returns the mapping and the offset of the region in it.
    pub fn uio(device: &Path) -> io::Result<(Arc<Self>, usize)> {
        let name = device
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a UIO device"))?;
        let maps = Path::new("/sys/class/uio").join(name).join("maps/map0");
        let size = read_hex(&maps.join("size"))?;
        let within = read_hex(&maps.join("offset"))?;
        let map = Self::map(device, size + within, 0)?;
        Ok((Arc::new(map), within))
    }

    /// Size of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

fn read_hex(path: &Path) -> io::Result<usize> {
    let text = fs::read_to_string(path)?;
    let digits = text.trim().trim_start_matches("0x");
    usize::from_str_radix(digits, 16).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {e}", path.display()),
        )
    })
}

/// One register file inside a [`Mapping`].
pub struct MappedRegisters {
    map: Arc<Mapping>,
    offset: usize,
}

impl MappedRegisters {
    /// Registers at `offset` bytes into `map`.
    pub fn new(map: Arc<Mapping>, offset: usize) -> io::Result<Self> {
        if offset.checked_add(REGISTER_SPAN).is_none_or(|end| end > map.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("registers at {offset:#x} outside the {:#x} byte mapping", map.len()),
            ));
        }
        Ok(Self { map, offset })
    }

    fn at(&self, reg: Register) -> *mut u8 {
        // In bounds: checked against the mapping length in `new`.
        unsafe { self.map.base.as_ptr().add(self.offset + reg.offset()) }
    }
}

impl RegisterIo for MappedRegisters {
    type Error = Infallible;

    fn read(&mut self, reg: Register) -> Result<u8, Self::Error> {
        Ok(unsafe { self.at(reg).read_volatile() })
    }

    fn write(&mut self, reg: Register, value: u8) -> Result<(), Self::Error> {
        unsafe { self.at(reg).write_volatile(value) };
        Ok(())
    }
}

//! Block & file IO layer
//!
//! Host file access for device models (disk images, block devices).
//! Positioned reads and writes take an explicit offset and are
//! thread-safe; passing `RVFILE_CUR` selects cursor mode, which is not
//! suitable for concurrent IO. The core itself never touches this
//! module.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};

pub const RVFILE_RW: u8 = 0x01; // open read/write
pub const RVFILE_CREAT: u8 = 0x02; // create if missing (RW only)
pub const RVFILE_EXCL: u8 = 0x04; // keep other processes out
pub const RVFILE_TRUNC: u8 = 0x08; // truncate on open (RW only)
pub const RVFILE_DIRECT: u8 = 0x10; // bypass the page cache
pub const RVFILE_SYNC: u8 = 0x20; // no writeback buffering

pub const RVFILE_LEGAL_FLAGS: u8 = 0x3F;

pub const RVFILE_SEEK_SET: u8 = 0;
pub const RVFILE_SEEK_CUR: u8 = 1;
pub const RVFILE_SEEK_END: u8 = 2;

/// Use the file cursor as the IO offset
pub const RVFILE_CUR: u64 = u64::MAX;

pub struct RvFile {
    file: File,
    pos: AtomicU64,
}

impl RvFile {
    pub fn open(path: &str, mode: u8) -> Result<RvFile, String> {
        if mode & !RVFILE_LEGAL_FLAGS != 0 {
            return Err(format!("illegal file mode {:#x}", mode));
        }
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode & RVFILE_RW != 0 {
            opts.write(true);
            if mode & RVFILE_CREAT != 0 {
                opts.create(true);
            }
            if mode & RVFILE_TRUNC != 0 {
                opts.truncate(true);
            }
        }
        let mut custom = 0;
        #[cfg(target_os = "linux")]
        if mode & RVFILE_DIRECT != 0 {
            custom |= libc::O_DIRECT;
        }
        if mode & RVFILE_SYNC != 0 {
            custom |= libc::O_SYNC;
        }
        if custom != 0 {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(custom);
        }
        let file = opts
            .open(path)
            .map_err(|err| format!("cannot open {}: {}", path, err))?;
        if mode & RVFILE_EXCL != 0 {
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(format!("{} is locked by another process", path));
            }
        }
        Ok(RvFile {
            file,
            pos: AtomicU64::new(0),
        })
    }

    /// File size; not synced across processes
    pub fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    /// Positioned read; `RVFILE_CUR` reads at the cursor and advances it,
    /// any other offset leaves the cursor alone.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> usize {
        let pos = if offset == RVFILE_CUR {
            self.pos.load(Ordering::Acquire)
        } else {
            offset
        };
        let done = self.file.read_at(dst, pos).unwrap_or(0);
        if offset == RVFILE_CUR {
            self.pos.fetch_add(done as u64, Ordering::AcqRel);
        }
        done
    }

    pub fn write(&self, src: &[u8], offset: u64) -> usize {
        let pos = if offset == RVFILE_CUR {
            self.pos.load(Ordering::Acquire)
        } else {
            offset
        };
        let done = self.file.write_at(src, pos).unwrap_or(0);
        if offset == RVFILE_CUR {
            self.pos.fetch_add(done as u64, Ordering::AcqRel);
        }
        done
    }

    pub fn seek(&self, offset: i64, start: u8) -> bool {
        let base = match start {
            RVFILE_SEEK_SET => 0,
            RVFILE_SEEK_CUR => self.pos.load(Ordering::Acquire) as i64,
            RVFILE_SEEK_END => self.size() as i64,
            _ => return false,
        };
        let new = base.wrapping_add(offset);
        if new < 0 {
            return false;
        }
        self.pos.store(new as u64, Ordering::Release);
        true
    }

    pub fn tell(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Punch a hole: reads as zeroes, space released on the host
    pub fn trim(&self, offset: u64, size: u64) -> bool {
        #[cfg(target_os = "linux")]
        {
            let ret = unsafe {
                libc::fallocate(
                    self.file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    size as libc::off_t,
                )
            };
            ret == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (offset, size);
            false
        }
    }

    pub fn truncate(&self, length: u64) -> bool {
        self.file.set_len(length).is_ok()
    }

    /// Preallocate space without changing visible contents
    pub fn fallocate(&self, length: u64) -> bool {
        #[cfg(target_os = "linux")]
        {
            let ret = unsafe {
                libc::fallocate(self.file.as_raw_fd(), 0, 0, length as libc::off_t)
            };
            ret == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.size() >= length || self.file.set_len(length).is_ok()
        }
    }

    /// Sync buffers to disk. If this fails, stop issuing writes.
    pub fn fsync(&self) -> bool {
        self.file.sync_all().is_ok()
    }
}

/// A fixed-size block device over a host file. Out-of-bounds access and
/// seeks are illegal; the device can never be resized through this
/// interface.
pub struct BlkDev {
    file: RvFile,
    size: u64,
    pos: AtomicU64,
}

impl BlkDev {
    pub fn open(path: &str, opts: u8) -> Result<BlkDev, String> {
        let file = RvFile::open(path, opts)?;
        let size = file.size();
        Ok(BlkDev {
            file,
            size,
            pos: AtomicU64::new(0),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&self, dst: &mut [u8], offset: u64) -> usize {
        let pos = if offset == RVFILE_CUR {
            self.pos.load(Ordering::Acquire)
        } else {
            offset
        };
        if pos + dst.len() as u64 > self.size {
            return 0;
        }
        let done = self.file.read(dst, pos);
        if offset == RVFILE_CUR {
            self.pos.fetch_add(done as u64, Ordering::AcqRel);
        }
        done
    }

    pub fn write(&self, src: &[u8], offset: u64) -> usize {
        let pos = if offset == RVFILE_CUR {
            self.pos.load(Ordering::Acquire)
        } else {
            offset
        };
        if pos + src.len() as u64 > self.size {
            return 0;
        }
        let done = self.file.write(src, pos);
        if offset == RVFILE_CUR {
            self.pos.fetch_add(done as u64, Ordering::AcqRel);
        }
        done
    }

    pub fn seek(&self, offset: i64, start: u8) -> bool {
        let pos = match start {
            RVFILE_SEEK_SET => offset,
            RVFILE_SEEK_CUR => self.pos.load(Ordering::Acquire) as i64 + offset,
            RVFILE_SEEK_END => self.size as i64 - offset,
            _ => return false,
        };
        if pos < 0 || pos as u64 >= self.size {
            return false;
        }
        self.pos.store(pos as u64, Ordering::Release);
        true
    }

    pub fn tell(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn trim(&self, offset: u64, count: u64) -> bool {
        let pos = if offset == RVFILE_CUR {
            self.pos.load(Ordering::Acquire)
        } else {
            offset
        };
        if pos + count > self.size {
            return false;
        }
        self.file.trim(pos, count)
    }

    pub fn sync(&self) -> bool {
        self.file.fsync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> String {
        let mut path = std::env::temp_dir();
        path.push(format!("riscvm_{}_{}", name, std::process::id()));
        path.to_str().unwrap().to_string()
    }

    fn scratch_file(name: &str, len: u64) -> (RvFile, String) {
        let path = tmp_path(name);
        let file = RvFile::open(&path, RVFILE_RW | RVFILE_CREAT | RVFILE_TRUNC).unwrap();
        file.truncate(len);
        (file, path)
    }

    #[test]
    fn test_positional_io_ignores_cursor() {
        let (file, path) = scratch_file("pos", 0x1000);
        file.seek(0x10, RVFILE_SEEK_SET);
        assert_eq!(file.write(b"hello", 0x100), 5);
        assert_eq!(file.tell(), 0x10);
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf, 0x100), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.tell(), 0x10);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_cursor_mode_advances() {
        let (file, path) = scratch_file("cur", 0);
        assert_eq!(file.write(b"abc", RVFILE_CUR), 3);
        assert_eq!(file.write(b"def", RVFILE_CUR), 3);
        assert_eq!(file.tell(), 6);
        file.seek(0, RVFILE_SEEK_SET);
        let mut buf = [0u8; 6];
        assert_eq!(file.read(&mut buf, RVFILE_CUR), 6);
        assert_eq!(&buf, b"abcdef");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_truncate_and_size() {
        let (file, path) = scratch_file("trunc", 0);
        file.truncate(0x2000);
        assert_eq!(file.size(), 0x2000);
        assert!(file.fsync());
        std::fs::remove_file(path).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_trim_reads_zeroes() {
        let (file, path) = scratch_file("trim", 0x2000);
        file.write(&[0xFF; 0x1000], 0x1000);
        assert!(file.trim(0x1000, 0x1000));
        let mut buf = [0xAAu8; 16];
        file.read(&mut buf, 0x1000);
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(file.size(), 0x2000);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_blkdev_bounds() {
        let path = tmp_path("blk");
        {
            let file = RvFile::open(&path, RVFILE_RW | RVFILE_CREAT).unwrap();
            file.truncate(0x1000);
        }
        let dev = BlkDev::open(&path, RVFILE_RW).unwrap();
        assert_eq!(dev.size(), 0x1000);

        let mut buf = [0u8; 16];
        assert_eq!(dev.read(&mut buf, 0xFF0), 16);
        // Crossing the end of the device yields nothing
        assert_eq!(dev.read(&mut buf, 0xFF8), 0);
        assert_eq!(dev.write(&buf, 0xFF8), 0);

        // Seeking out of bounds is rejected and keeps the cursor
        assert!(dev.seek(0x10, RVFILE_SEEK_SET));
        assert!(!dev.seek(0x1000, RVFILE_SEEK_SET));
        assert_eq!(dev.tell(), 0x10);
        assert!(dev.sync());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_illegal_mode_rejected() {
        assert!(RvFile::open("/dev/null", 0x40).is_err());
    }
}

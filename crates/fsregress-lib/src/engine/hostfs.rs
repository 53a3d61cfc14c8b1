//! Host directory engine
//!
//! `HostDirEngine` maps the engine contract onto a directory of the host
//! filesystem:
//!
//! 1. Every run works inside its own scratch directory `fsregress-<uuid>`
//!    under the configured root, removed again when the engine is dropped
//! 2. Capacity comes from `statvfs` on that directory
//! 3. Bulk allocation uses `fallocate(2)`
//! 4. AIO requests are executed with positioned reads/writes at submit time
//!    and handed back on the next `reap`
//! 5. `Direct` alignment opens the target with `O_DIRECT` when the host
//!    filesystem supports it and falls back to buffered I/O otherwise

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::sys::statvfs::statvfs;

use super::{
    AioCompletion, AioDirection, AioQueue, AioRequest, AlignMode, CapacitySnapshot, EngineError,
    EntryKind, FileAttr, FileHandle, StorageEngine,
};

/// Buffer alignment used for `O_DIRECT` transfers.
const DIRECT_ALIGNMENT: usize = 4096;

/// Fill byte for AIO writes and `mkfile` payloads.
const FILL_BYTE: u8 = 0x5a;

/// Stored file handle - keeps the File alive until `close`
struct OpenFile {
    file: File,
    path: String,
}

pub struct HostDirEngine {
    /// Root supplied by the caller
    root: PathBuf,
    /// Per-run scratch directory inside `root`
    run_dir: PathBuf,
    /// Next file handle to assign
    next_fh: u64,
    /// Maps fh → OpenFile
    handles: HashMap<u64, OpenFile>,
    /// Leave the scratch directory behind on drop
    keep: bool,
}

impl HostDirEngine {
    /// Create an engine working under `root`.
    ///
    /// # Errors
    /// Returns an error if `root` doesn't exist, isn't a directory, or the
    /// scratch directory can't be created
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, EngineError> {
        let root = root.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(EngineError::InvalidRoot(root));
        }

        let run_dir = root.join(format!("fsregress-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&run_dir)?;

        info!(
            "Initialized HostDirEngine with root: {:?}, run_dir: {:?}",
            root, run_dir
        );

        Ok(Self {
            root,
            run_dir,
            next_fh: 1,
            handles: HashMap::new(),
            keep: false,
        })
    }

    /// Keep the scratch directory after the engine is dropped.
    pub fn keep_run_dir(&mut self, keep: bool) {
        self.keep = keep;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Convert an engine path to the real path in the scratch directory
    fn to_real(&self, path: &str) -> PathBuf {
        self.run_dir.join(path.trim_start_matches('/'))
    }

    /// Allocate a new file handle
    fn alloc_fh(&mut self) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }
}

/// Map an io error on `path` onto the engine taxonomy.
fn io_error(path: &str, err: io::Error) -> EngineError {
    match err.raw_os_error() {
        Some(libc::ENOENT) => EngineError::NotFound(path.to_string()),
        Some(libc::EEXIST) => EngineError::AlreadyExists(path.to_string()),
        Some(libc::EISDIR) => EngineError::IsADirectory(path.to_string()),
        Some(libc::ENOTDIR) => EngineError::NotADirectory(path.to_string()),
        Some(libc::ENOTEMPTY) => EngineError::NotEmpty(path.to_string()),
        Some(libc::ENOSPC) | Some(libc::EDQUOT) => EngineError::NoSpace,
        _ => EngineError::Io(err),
    }
}

/// `fallocate(2)` with mode 0 (allocate and extend).
fn fallocate_file(file: &File, offset: u64, len: u64) -> io::Result<()> {
    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
    let len =
        libc::off_t::try_from(len).map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;

    // SAFETY: the fd is owned by `file` and stays open for the duration of the call.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, offset, len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl StorageEngine for HostDirEngine {
    fn name(&self) -> &str {
        "dir"
    }

    fn capacity(&mut self) -> Result<CapacitySnapshot, EngineError> {
        let stat = statvfs(&self.run_dir)?;
        let snapshot = CapacitySnapshot {
            free_inodes: stat.files_available() as u64,
            free_blocks: stat.blocks_available() as u64,
            block_size: stat.fragment_size() as u64,
        };
        debug!("HostDirEngine::capacity {:?}", snapshot);
        Ok(snapshot)
    }

    fn open(&mut self, path: &str, create: bool) -> Result<FileHandle, EngineError> {
        let real = self.to_real(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&real)
            .map_err(|e| io_error(path, e))?;

        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            OpenFile {
                file,
                path: path.to_string(),
            },
        );
        Ok(FileHandle(fh))
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), EngineError> {
        match self.handles.remove(&handle.0) {
            Some(open) => {
                let size = open
                    .file
                    .metadata()
                    .map_err(|e| io_error(&open.path, e))?
                    .len();
                debug!(
                    "HostDirEngine::close fh={} path={} size={}",
                    handle.0, open.path, size
                );
                Ok(())
            }
            None => Err(EngineError::BadHandle(handle.0)),
        }
    }

    fn unlink(&mut self, path: &str) -> Result<(), EngineError> {
        fs::remove_file(self.to_real(path)).map_err(|e| io_error(path, e))
    }

    fn mkdir(&mut self, path: &str) -> Result<(), EngineError> {
        fs::create_dir(self.to_real(path)).map_err(|e| io_error(path, e))
    }

    fn rmdir(&mut self, path: &str) -> Result<(), EngineError> {
        fs::remove_dir(self.to_real(path)).map_err(|e| io_error(path, e))
    }

    fn getattr(&mut self, path: &str) -> Result<FileAttr, EngineError> {
        let meta = fs::metadata(self.to_real(path)).map_err(|e| io_error(path, e))?;
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Ok(FileAttr {
            kind,
            size: meta.len(),
        })
    }

    fn fallocate(&mut self, path: &str, offset: u64, len: u64) -> Result<(), EngineError> {
        let file = OpenOptions::new()
            .write(true)
            .open(self.to_real(path))
            .map_err(|e| io_error(path, e))?;

        match fallocate_file(&file, offset, len) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                warn!(
                    "fallocate unsupported on {:?}, extending {} sparsely",
                    self.root, path
                );
                file.set_len(offset.saturating_add(len))
                    .map_err(|e| io_error(path, e))
            }
            Err(e) => Err(io_error(path, e)),
        }
    }

    fn mkfile(&mut self, path: &str, size: u64) -> Result<(), EngineError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.to_real(path))
            .map_err(|e| io_error(path, e))?;

        let chunk = vec![FILL_BYTE; DIRECT_ALIGNMENT];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..n]).map_err(|e| io_error(path, e))?;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn open_aio<'a>(
        &'a mut self,
        path: &str,
        direction: AioDirection,
        align: AlignMode,
    ) -> Result<Box<dyn AioQueue + 'a>, EngineError> {
        let real = self.to_real(path);
        let file = open_for_aio(&real, direction, align).map_err(|e| io_error(path, e))?;

        Ok(Box::new(HostAioQueue {
            file,
            path: path.to_string(),
            direction,
            buffer: Vec::new(),
            completed: VecDeque::new(),
        }))
    }
}

impl Drop for HostDirEngine {
    fn drop(&mut self) {
        self.handles.clear();
        if self.keep {
            info!("Keeping run directory {:?}", self.run_dir);
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.run_dir) {
            warn!("Failed to remove run directory {:?}: {}", self.run_dir, e);
        }
    }
}

fn open_for_aio(real: &Path, direction: AioDirection, align: AlignMode) -> io::Result<File> {
    let mut options = OpenOptions::new();
    match direction {
        AioDirection::Write => options.read(true).write(true).create(true).truncate(false),
        AioDirection::Read => options.read(true),
    };

    if align == AlignMode::Direct {
        let mut direct = options.clone();
        direct.custom_flags(direct_flag());
        match direct.open(real) {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                warn!(
                    "O_DIRECT not supported for {:?}, falling back to buffered I/O",
                    real
                );
            }
            Err(e) => return Err(e),
        }
    }
    options.open(real)
}

#[cfg(target_os = "linux")]
fn direct_flag() -> i32 {
    libc::O_DIRECT
}

#[cfg(not(target_os = "linux"))]
fn direct_flag() -> i32 {
    0
}

/// AIO queue over a host file.
///
/// Requests run to completion inside `submit`; their results are queued and
/// returned by the next `reap`.
struct HostAioQueue {
    file: File,
    path: String,
    direction: AioDirection,
    /// Backing storage for an aligned transfer window
    buffer: Vec<u8>,
    completed: VecDeque<AioCompletion>,
}

impl HostAioQueue {
    fn transfer(&mut self, request: &AioRequest) -> Result<u32, EngineError> {
        let len = request.len as usize;
        let needed = len + DIRECT_ALIGNMENT;
        if self.buffer.len() < needed {
            self.buffer = vec![FILL_BYTE; needed];
        }

        // Aligned window of `len` bytes inside `buffer`
        let start = self.buffer.as_ptr().align_offset(DIRECT_ALIGNMENT);
        let window = &mut self.buffer[start..start + len];

        let done = match self.direction {
            AioDirection::Write => self.file.write_at(window, request.offset),
            AioDirection::Read => self.file.read_at(window, request.offset),
        }
        .map_err(|e| io_error(&self.path, e))?;

        Ok(done as u32)
    }
}

impl AioQueue for HostAioQueue {
    fn submit(&mut self, request: AioRequest) -> Result<(), EngineError> {
        let result = self.transfer(&request);
        self.completed.push_back(AioCompletion {
            tag: request.tag,
            result,
        });
        Ok(())
    }

    fn reap(&mut self) -> Result<Vec<AioCompletion>, EngineError> {
        Ok(self.completed.drain(..).collect())
    }

    fn in_flight(&self) -> usize {
        self.completed.len()
    }
}

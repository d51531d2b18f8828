//! Shared segment handle.
//!
//! One [`SharedSegment`] owns the mapping of the arena region and the
//! process-wide reader/writer lock over it. The lock has two layers: an
//! in-process `RwLock` around the mapping and an advisory `flock` on the
//! segment file, so cooperating processes serialise on the file itself and
//! a restarted process finds the lock exactly where it left it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::{info, warn};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::arena::{ArenaRead, ArenaWrite};
use crate::error::{ArenaError, ArenaResult};
use crate::layout::{SegmentHeader, SegmentLayout};
use crate::slot;

/// Default location of the BFD session segment.
pub const DEFAULT_SEGMENT_PATH: &str = "/dev/shm/sonic-bfd.seg";

/// How to obtain the segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub path: PathBuf,
    /// Reattach to an existing, matching segment instead of reinitialising it.
    pub warm_restart: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SEGMENT_PATH),
            warm_restart: true,
        }
    }
}

impl SegmentConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_warm_restart(mut self, warm_restart: bool) -> Self {
        self.warm_restart = warm_restart;
        self
    }
}

/// Whether `open` built the segment or found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOrigin {
    Created,
    Attached,
}

/// Cross-process half of the lock.
///
/// `flock` locks belong to the open file description, so all readers in
/// this process share one shared lock: the first reader takes it and the
/// last one drops it.
struct SegmentFileLock {
    file: File,
    readers: Mutex<usize>,
}

impl SegmentFileLock {
    fn lock_shared(&self) -> io::Result<()> {
        let mut readers = self.readers.lock();
        if *readers == 0 {
            FileExt::lock_shared(&self.file)?;
        }
        *readers += 1;
        Ok(())
    }

    fn unlock_shared(&self) {
        let mut readers = self.readers.lock();
        *readers = readers.saturating_sub(1);
        if *readers == 0 {
            if let Err(e) = FileExt::unlock(&self.file) {
                warn!("Failed to release shared segment lock: {}", e);
            }
        }
    }

    fn lock_exclusive(&self) -> io::Result<()> {
        FileExt::lock_exclusive(&self.file)
    }

    fn unlock_exclusive(&self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release exclusive segment lock: {}", e);
        }
    }
}

/// Handle to a mapped arena segment.
///
/// All arena operations go through [`read`](Self::read) or
/// [`write`](Self::write) guards; a full allocate-then-populate sequence
/// done through one write guard is never observed half-finished.
pub struct SharedSegment {
    layout: SegmentLayout,
    map: RwLock<MmapMut>,
    file_lock: Option<SegmentFileLock>,
    path: Option<PathBuf>,
    origin: SegmentOrigin,
    generation: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Writes the header and stamps every slot of every type as free.
fn initialise(bytes: &mut [u8], layout: &SegmentLayout) -> io::Result<()> {
    layout.encode_header(bytes, 0, now_secs())?;
    for desc in layout.descriptors() {
        for n in 0..desc.capacity {
            let start = desc.slot_offset(n);
            slot::stamp(&mut bytes[start..start + desc.stride()], desc.object_type);
        }
    }
    Ok(())
}

fn map_file(file: &File, len: usize) -> io::Result<MmapMut> {
    // SAFETY: the segment file is only written through mappings guarded by
    // the segment lock; truncation happens under the exclusive flock before
    // any mapping exists.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
}

impl SharedSegment {
    /// Opens the file-backed segment, attaching to it when possible.
    ///
    /// With warm restart enabled an existing segment must match `layout`
    /// exactly; anything else is a terminal [`ArenaError::LayoutMismatch`].
    /// Without it the file is reinitialised.
    pub fn open(config: &SegmentConfig, layout: SegmentLayout) -> ArenaResult<Self> {
        let path = config.path.clone();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ArenaError::segment(&path, e))?;

        FileExt::lock_exclusive(&file).map_err(|e| ArenaError::segment(&path, e))?;
        let prepared = Self::prepare(&file, &path, config.warm_restart, &layout);
        if let Err(e) = FileExt::unlock(&file) {
            warn!("{}: failed to release setup lock: {}", path.display(), e);
        }
        let (map, origin, generation) = prepared?;

        match origin {
            SegmentOrigin::Created => info!(
                "Created segment {} ({} bytes, {} types)",
                path.display(),
                layout.total_len(),
                layout.descriptors().len()
            ),
            SegmentOrigin::Attached => info!(
                "Attached segment {} at generation {}",
                path.display(),
                generation
            ),
        }

        Ok(Self {
            layout,
            map: RwLock::new(map),
            file_lock: Some(SegmentFileLock {
                file,
                readers: Mutex::new(0),
            }),
            path: Some(path),
            origin,
            generation,
        })
    }

    fn prepare(
        file: &File,
        path: &Path,
        warm_restart: bool,
        layout: &SegmentLayout,
    ) -> ArenaResult<(MmapMut, SegmentOrigin, u64)> {
        let existing = file.metadata().map_err(|e| ArenaError::segment(path, e))?.len();

        if existing > 0 && warm_restart {
            if existing != layout.total_len() as u64 {
                return Err(ArenaError::LayoutMismatch(format!(
                    "file is {} bytes, layout needs {}",
                    existing,
                    layout.total_len()
                )));
            }
            let mut map = map_file(file, existing as usize).map_err(|e| ArenaError::segment(path, e))?;
            let header = SegmentHeader::decode(&map[..])
                .map_err(|e| ArenaError::LayoutMismatch(format!("unreadable header: {}", e)))?;
            layout.check_matches(&header).map_err(ArenaError::LayoutMismatch)?;

            let generation = header.generation + 1;
            SegmentLayout::write_generation(&mut map, generation)
                .map_err(|e| ArenaError::segment(path, e))?;
            return Ok((map, SegmentOrigin::Attached, generation));
        }

        if existing > 0 {
            info!("{}: cold start, discarding previous contents", path.display());
        }
        file.set_len(0).map_err(|e| ArenaError::segment(path, e))?;
        file.set_len(layout.total_len() as u64)
            .map_err(|e| ArenaError::segment(path, e))?;

        let mut map = map_file(file, layout.total_len()).map_err(|e| ArenaError::segment(path, e))?;
        initialise(&mut map, layout).map_err(|e| ArenaError::segment(path, e))?;
        map.flush().map_err(|e| ArenaError::segment(path, e))?;
        Ok((map, SegmentOrigin::Created, 0))
    }

    /// Creates a private segment that lives only as long as the handle.
    pub fn anonymous(layout: SegmentLayout) -> ArenaResult<Self> {
        let mut map = MmapMut::map_anon(layout.total_len())
            .map_err(|e| ArenaError::segment("<anonymous>", e))?;
        initialise(&mut map, &layout).map_err(|e| ArenaError::segment("<anonymous>", e))?;
        Ok(Self {
            layout,
            map: RwLock::new(map),
            file_lock: None,
            path: None,
            origin: SegmentOrigin::Created,
            generation: 0,
        })
    }

    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    pub fn origin(&self) -> SegmentOrigin {
        self.origin
    }

    /// Attach generation: 0 for a fresh segment, +1 per warm attach.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Takes the shared lock.
    pub fn read(&self) -> ArenaResult<SegmentReadGuard<'_>> {
        let map = self.map.read();
        if let Some(lock) = &self.file_lock {
            lock.lock_shared().map_err(|e| self.io_error(e))?;
        }
        Ok(SegmentReadGuard { segment: self, map })
    }

    /// Takes the exclusive lock.
    pub fn write(&self) -> ArenaResult<SegmentWriteGuard<'_>> {
        let map = self.map.write();
        if let Some(lock) = &self.file_lock {
            lock.lock_exclusive().map_err(|e| self.io_error(e))?;
        }
        Ok(SegmentWriteGuard { segment: self, map })
    }

    /// Re-reads the header from the mapping.
    pub fn header(&self) -> ArenaResult<SegmentHeader> {
        let guard = self.read()?;
        SegmentHeader::decode(guard.bytes()).map_err(|e| self.io_error(e))
    }

    pub fn flush(&self) -> ArenaResult<()> {
        self.map.read().flush().map_err(|e| self.io_error(e))
    }

    /// Flushes and unmaps, leaving the file for the next warm attach.
    pub fn detach(self) -> ArenaResult<()> {
        self.flush()?;
        if let Some(path) = &self.path {
            info!("Detached segment {} at generation {}", path.display(), self.generation);
        }
        Ok(())
    }

    /// Unmaps and removes the segment file.
    pub fn destroy(self) -> ArenaResult<()> {
        let path = self.path.clone();
        drop(self);
        if let Some(path) = path {
            fs::remove_file(&path).map_err(|e| ArenaError::segment(&path, e))?;
            info!("Removed segment {}", path.display());
        }
        Ok(())
    }

    fn io_error(&self, source: io::Error) -> ArenaError {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("<anonymous>"));
        ArenaError::segment(path, source)
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("path", &self.path)
            .field("origin", &self.origin)
            .field("generation", &self.generation)
            .field("total_len", &self.layout.total_len())
            .finish()
    }
}

/// Shared-mode access to the segment.
pub struct SegmentReadGuard<'a> {
    segment: &'a SharedSegment,
    map: RwLockReadGuard<'a, MmapMut>,
}

impl Drop for SegmentReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = &self.segment.file_lock {
            lock.unlock_shared();
        }
    }
}

impl ArenaRead for SegmentReadGuard<'_> {
    fn layout(&self) -> &SegmentLayout {
        &self.segment.layout
    }

    fn bytes(&self) -> &[u8] {
        &self.map[..]
    }
}

/// Exclusive-mode access to the segment.
pub struct SegmentWriteGuard<'a> {
    segment: &'a SharedSegment,
    map: RwLockWriteGuard<'a, MmapMut>,
}

impl Drop for SegmentWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(lock) = &self.segment.file_lock {
            lock.unlock_exclusive();
        }
    }
}

impl ArenaRead for SegmentWriteGuard<'_> {
    fn layout(&self) -> &SegmentLayout {
        &self.segment.layout
    }

    fn bytes(&self) -> &[u8] {
        &self.map[..]
    }
}

impl ArenaWrite for SegmentWriteGuard<'_> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }
}

//! Reference-counted pixel buffer handle
//!
//! An [`Image`] is a view (geometry + offset) onto shared storage. Cloning a
//! handle bumps the shared count; the storage is freed or unmapped when the
//! last handle goes away. Storage comes in three flavors:
//!
//! - owned: allocated here, lockable
//! - mapped: a region of a file mapped with `memmap2`, lockable
//! - external: a zero-copy alias of someone else's bytes (a "weak" image),
//!   read-only and not lockable
//!
//! A handle without storage is a placeholder: it keeps size and format but
//! carries no pixels. Frames whose data was discarded hold one.

use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use tracing::error;

use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::pipeline::semaphore::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Bayer mosaic, 16 bits per sample.
    Raw,
    /// Planar Y then U then V, chroma subsampled 2x2.
    Yuv420p,
    Rgb24,
    Unknown,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Raw => 2,
            PixelFormat::Yuv420p => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Unknown => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn covering(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }
}

enum Backing {
    Owned(RwLock<Box<[u8]>>),
    Mapped(RwLock<MmapMut>),
    External(Bytes),
}

struct Storage {
    backing: Backing,
    /// Advisory lock guarding in-place mutation. External storage has none.
    lock: Option<Semaphore>,
}

impl Storage {
    fn lockable(backing: Backing) -> Arc<Self> {
        Arc::new(Self {
            backing,
            lock: Some(Semaphore::new(1)),
        })
    }
}

pub struct Image {
    size: Size,
    format: PixelFormat,
    bytes_per_row: usize,
    offset: usize,
    storage: Option<Arc<Storage>>,
    holding_lock: AtomicBool,
}

impl Image {
    /// Allocate a zeroed image owned by this handle.
    pub fn new(size: Size, format: PixelFormat) -> Self {
        let bytes_per_row = size.width as usize * format.bytes_per_pixel();
        let len = bytes_per_row * allocate_height(size, format);
        Self {
            size,
            format,
            bytes_per_row,
            offset: 0,
            storage: Some(Storage::lockable(Backing::Owned(RwLock::new(
                vec![0u8; len].into_boxed_slice(),
            )))),
            holding_lock: AtomicBool::new(false),
        }
    }

    /// A handle that remembers geometry but holds no pixels.
    pub fn placeholder(size: Size, format: PixelFormat) -> Self {
        Self {
            size,
            format,
            bytes_per_row: size.width as usize * format.bytes_per_pixel(),
            offset: 0,
            storage: None,
            holding_lock: AtomicBool::new(false),
        }
    }

    /// Alias bytes owned elsewhere without copying them.
    ///
    /// `bytes_per_row` defaults to a tightly packed row.
    pub fn from_bytes(
        size: Size,
        format: PixelFormat,
        bytes: Bytes,
        bytes_per_row: Option<usize>,
    ) -> Result<Self> {
        let bytes_per_row =
            bytes_per_row.unwrap_or(size.width as usize * format.bytes_per_pixel());
        if bytes.len() < required_len(size, format, bytes_per_row) {
            return Err(Error::InvalidGeometry { size, format });
        }
        Ok(Self {
            size,
            format,
            bytes_per_row,
            offset: 0,
            storage: Some(Arc::new(Storage {
                backing: Backing::External(bytes),
                lock: None,
            })),
            holding_lock: AtomicBool::new(false),
        })
    }

    /// Map a region of `file` starting at `offset`.
    ///
    /// With `write_through` the mapping is shared and writes reach the file;
    /// otherwise writes stay private to this process.
    pub fn map_file(
        file: &File,
        offset: u64,
        size: Size,
        format: PixelFormat,
        write_through: bool,
    ) -> Result<Self> {
        let bytes_per_row = size.width as usize * format.bytes_per_pixel();
        let len = bytes_per_row * size.height as usize;
        if len == 0 {
            return Err(Error::InvalidGeometry { size, format });
        }
        let file_len = file.metadata()?.len();
        if offset + len as u64 > file_len {
            return Err(Error::MapOutOfRange {
                offset,
                len,
                file_len,
            });
        }

        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        // SAFETY: the mapping is only reached through the storage lock, and the
        // caller is responsible for not truncating the file underneath us.
        let map = unsafe {
            if write_through {
                options.map_mut(file)?
            } else {
                options.map_copy(file)?
            }
        };

        Ok(Self {
            size,
            format,
            bytes_per_row,
            offset: 0,
            storage: Some(Storage::lockable(Backing::Mapped(RwLock::new(map)))),
            holding_lock: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    pub fn bytes_per_row(&self) -> usize {
        self.bytes_per_row
    }

    /// Rows backing the image, including the chroma planes of YUV420p.
    pub fn allocate_height(&self) -> usize {
        allocate_height(self.size, self.format)
    }

    /// Whether the handle points at pixel data at all.
    pub fn valid(&self) -> bool {
        self.storage.is_some()
    }

    /// Whether the pixels belong to someone else (or there are none).
    pub fn is_weak(&self) -> bool {
        match &self.storage {
            Some(storage) => matches!(storage.backing, Backing::External(_)),
            None => true,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(
            self.storage.as_deref().map(|s| &s.backing),
            Some(Backing::Mapped(_))
        )
    }

    /// Number of handles sharing this storage, zero for placeholders.
    pub fn ref_count(&self) -> usize {
        self.storage.as_ref().map_or(0, Arc::strong_count)
    }

    /// Read access to the pixels, starting at this view's first pixel.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let storage = self.storage.as_ref()?;
        let offset = self.offset;
        Some(match &storage.backing {
            Backing::Owned(buf) => f(&buf.read().unwrap_or_else(PoisonError::into_inner)[offset..]),
            Backing::Mapped(map) => f(&map.read().unwrap_or_else(PoisonError::into_inner)[offset..]),
            Backing::External(bytes) => f(&bytes[offset..]),
        })
    }

    /// Write access to the pixels. External images are read-only and yield `None`.
    pub fn with_pixels_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let storage = self.storage.as_ref()?;
        let offset = self.offset;
        match &storage.backing {
            Backing::Owned(buf) => {
                Some(f(&mut buf.write().unwrap_or_else(PoisonError::into_inner)[offset..]))
            }
            Backing::Mapped(map) => {
                Some(f(&mut map.write().unwrap_or_else(PoisonError::into_inner)[offset..]))
            }
            Backing::External(_) => None,
        }
    }

    /// A view onto part of this image, clipped to its bounds. Shares the
    /// parent's storage, count and lock.
    pub fn sub_image(&self, x: u32, y: u32, size: Size) -> Image {
        if !self.valid() || x >= self.width() || y >= self.height() {
            return Image::placeholder(Size::default(), self.format);
        }
        let clipped = Size::new(
            size.width.min(self.width() - x),
            size.height.min(self.height() - y),
        );
        Image {
            size: clipped,
            format: self.format,
            bytes_per_row: self.bytes_per_row,
            offset: self.offset
                + y as usize * self.bytes_per_row
                + x as usize * self.bytes_per_pixel(),
            storage: self.storage.clone(),
            holding_lock: AtomicBool::new(false),
        }
    }

    /// Deep copy into freshly owned memory.
    pub fn copy(&self) -> Image {
        if !self.valid() {
            return Image::placeholder(self.size, self.format);
        }
        let duplicate = Image::new(self.size, self.format);
        duplicate.copy_from(self);
        duplicate
    }

    /// Copy pixels row by row from `src`, honoring both strides and clipping
    /// to the smaller of the two images.
    pub fn copy_from(&self, src: &Image) {
        let Some(snapshot) = src.snapshot() else {
            return;
        };
        let rows = src.allocate_height().min(self.allocate_height());
        let width_bytes = (src.width() as usize * src.bytes_per_pixel())
            .min(self.width() as usize * self.bytes_per_pixel());
        let src_stride = src.bytes_per_row;
        let dst_stride = self.bytes_per_row;

        self.with_pixels_mut(|dst| {
            for row in 0..rows {
                let s = row * src_stride;
                let d = row * dst_stride;
                if s + width_bytes > snapshot.len() || d + width_bytes > dst.len() {
                    break;
                }
                dst[d..d + width_bytes].copy_from_slice(&snapshot[s..s + width_bytes]);
            }
        });
    }

    /// Source bytes for a copy. Aliased storage is handed out as-is; lockable
    /// storage is copied out so two images never hold each other's guards.
    fn snapshot(&self) -> Option<Bytes> {
        let storage = self.storage.as_ref()?;
        match &storage.backing {
            Backing::External(bytes) => Some(bytes.slice(self.offset..)),
            _ => self.with_pixels(Bytes::copy_from_slice),
        }
    }

    /// Acquire the advisory lock guarding in-place mutation.
    ///
    /// `timeout_us < 0` waits forever, `0` only tries, `> 0` waits at most that
    /// many microseconds. Returns whether this handle now holds the lock.
    pub fn lock(&self, timeout_us: i64) -> bool {
        if self.holding_lock.load(Ordering::Acquire) {
            error!(
                kind = ?EventKind::ImageLockError,
                "image handle trying to acquire a lock it already holds; \
                 use a separate handle per thread"
            );
            return false;
        }
        let Some(lock) = self.storage.as_ref().and_then(|s| s.lock.as_ref()) else {
            error!(kind = ?EventKind::InternalError, "locking an image with no mutex");
            return false;
        };

        let acquired = match timeout_us {
            t if t < 0 => {
                lock.acquire();
                true
            }
            0 => lock.try_acquire(),
            t => lock.acquire_timeout(Duration::from_micros(t as u64)),
        };
        self.holding_lock.store(acquired, Ordering::Release);
        acquired
    }

    /// Release a lock taken with [`Image::lock`] through this handle.
    pub fn unlock(&self) {
        if !self.holding_lock.swap(false, Ordering::AcqRel) {
            error!(
                kind = ?EventKind::ImageLockError,
                "cannot unlock a lock not held by this image handle"
            );
            return;
        }
        if let Some(lock) = self.storage.as_ref().and_then(|s| s.lock.as_ref()) {
            lock.post();
        }
    }

    /// Scope-bound variant of [`Image::lock`]: the lock is released when the
    /// guard drops, on every exit path.
    pub fn lock_guard(&self, timeout_us: i64) -> Option<ImageGuard<'_>> {
        self.lock(timeout_us).then_some(ImageGuard { image: self })
    }

    /// Whether this handle has an advisory lock at all. Aliased and
    /// placeholder images do not.
    pub fn lockable(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.lock.is_some())
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.holding_lock.load(Ordering::Acquire)
    }
}

fn allocate_height(size: Size, format: PixelFormat) -> usize {
    let height = size.height as usize;
    match format {
        PixelFormat::Yuv420p => height + height / 2,
        _ => height,
    }
}

fn required_len(size: Size, format: PixelFormat, bytes_per_row: usize) -> usize {
    let rows = allocate_height(size, format);
    if rows == 0 {
        return 0;
    }
    (rows - 1) * bytes_per_row + size.width as usize * format.bytes_per_pixel()
}

impl Clone for Image {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            format: self.format,
            bytes_per_row: self.bytes_per_row,
            offset: self.offset,
            storage: self.storage.clone(),
            holding_lock: AtomicBool::new(false),
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.holding_lock.load(Ordering::Acquire) {
            self.unlock();
        }
    }
}

/// Identity and geometry, never pixel contents.
impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        let same_storage = match (&self.storage, &other.storage) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_storage
            && self.offset == other.offset
            && self.size == other.size
            && self.format == other.format
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backing = match self.storage.as_deref().map(|s| &s.backing) {
            None => "placeholder",
            Some(Backing::Owned(_)) => "owned",
            Some(Backing::Mapped(_)) => "mapped",
            Some(Backing::External(_)) => "external",
        };
        f.debug_struct("Image")
            .field("size", &self.size)
            .field("format", &self.format)
            .field("bytes_per_row", &self.bytes_per_row)
            .field("offset", &self.offset)
            .field("backing", &backing)
            .field("ref_count", &self.ref_count())
            .field("holding_lock", &self.is_locked_by_me())
            .finish()
    }
}

/// Holds an image's advisory lock until dropped.
pub struct ImageGuard<'a> {
    image: &'a Image,
}

impl ImageGuard<'_> {
    pub fn image(&self) -> &Image {
        self.image
    }
}

impl Drop for ImageGuard<'_> {
    fn drop(&mut self) {
        self.image.unlock();
    }
}

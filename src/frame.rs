//! Frame containers and the bounded queues that move frames between workers.
//!
//! - `Frame`: cheaply clonable handle to decoded RGB pixels.
//! - `CapturedFrame`: a frame as handed from the capture worker to the process worker.
//! - `FrameQueue`: bounded queue with explicit drop policies. It never blocks a producer.
//! - `LatestSlot`: single-slot "most recent item" cache (drop-oldest).
//!
//! Correctness never depends on delivering every frame; only the most recent one
//! eventually appearing.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default capacity of the raw frame queue between capture and process workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB frame. Clones share the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// Solid black frame, mostly useful for tests and synthetic sources.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Owned copy of the pixels, for rendering overlays without touching the original.
    pub fn to_image(&self) -> RgbImage {
        self.image.as_ref().clone()
    }

    /// True when both handles share the same pixel buffer.
    pub fn same_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

/// Frame handed from the capture worker to the process worker.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub frame: Frame,
    pub captured_at: DateTime<Utc>,
    /// Connection epoch; bumps on every verified (re)connect.
    pub epoch: u64,
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

/// Bounded multi-producer queue with non-blocking push.
pub struct FrameQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Push, discarding `item` when the queue is full. Returns false when dropped.
    pub fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Push, evicting the oldest queued item when full. Returns true when an item was evicted.
    pub fn push_drop_oldest(&self, item: T) -> bool {
        let mut item = item;
        let mut evicted = false;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(rejected)) => {
                    evicted |= self.rx.try_recv().is_ok();
                    item = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Discard everything currently queued. Returns the number of dropped items.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ----------------------------------------------------------------------------
// LatestSlot
// ----------------------------------------------------------------------------

/// Single-slot cache holding the most recently published item.
///
/// Publishing never blocks; an unread item is replaced by the newer one. Reading does
/// not consume: the last seen item is kept and returned until something newer arrives.
pub struct LatestSlot<T: Clone> {
    slot: FrameQueue<T>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: FrameQueue::new(1),
            last: Mutex::new(None),
        }
    }

    pub fn publish(&self, item: T) {
        self.slot.push_drop_oldest(item);
    }

    pub fn latest(&self) -> Option<T> {
        let mut newest = None;
        while let Some(item) = self.slot.try_pop() {
            newest = Some(item);
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if newest.is_some() {
            *last = newest;
        }
        last.clone()
    }
}

impl<T: Clone> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

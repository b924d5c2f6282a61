//! Camera frames and the drop-newest queue feeding the vision worker.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::VedaError;
use crate::scheduler::WorkloadId;
use crate::trace::{PerfTrace, TraceEventBody};

/// Pixel layout of a [`Frame`].
///
/// The core requires pre-converted packed RGB; colorspace conversion stays
/// in the host app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit RGB, row-major, no padding.
    Rgb8,
}

/// One captured frame. Immutable; clones share the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Arc<[u8]>,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp_ms: i64,
}

impl Frame {
    /// Build a frame, validating that `pixels` is `width * height * 3` bytes.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        timestamp_ms: i64,
    ) -> Result<Self, VedaError> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(VedaError::Config(format!(
                "frame must be width * height * 3 = {expected} bytes (got {})",
                pixels.len()
            )));
        }
        Ok(Self {
            pixels: pixels.into(),
            width,
            height,
            format: PixelFormat::Rgb8,
            timestamp_ms,
        })
    }

    /// Raw pixel bytes.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Frame width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel layout.
    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Capture timestamp, unix milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Longest side, used against the QoS `vision_max_side_px` cap.
    #[must_use]
    pub fn max_side(&self) -> u32 {
        self.width.max(self.height)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<Frame>,
    in_flight: bool,
    dropped: u64,
}

/// Single-slot drop-newest buffer between the camera and the vision worker.
///
/// Holds at most one pending frame and at most one in-flight frame. A new
/// frame displaces any pending one (newest wins); the displaced frame counts
/// toward `dropped_count`.
#[derive(Debug, Default)]
pub struct FrameQueue {
    state: Mutex<QueueState>,
    trace: Option<PerfTrace>,
}

impl FrameQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that records `frame_drop` trace events.
    #[must_use]
    pub fn with_trace(trace: PerfTrace) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            trace: Some(trace),
        }
    }

    /// Offer a frame, displacing any pending one.
    pub fn enqueue(&self, frame: Frame) {
        let dropped_total = {
            let mut state = self.lock();
            let displaced = state.pending.replace(frame).is_some();
            if displaced {
                state.dropped += 1;
                Some(state.dropped)
            } else {
                None
            }
        };
        if let (Some(dropped_total), Some(trace)) = (dropped_total, &self.trace) {
            trace.emit(
                TraceEventBody::FrameDrop { dropped_total },
                Some(WorkloadId::Vision),
            );
        }
    }

    /// Take the pending frame and mark it in-flight.
    ///
    /// Returns `None` if nothing is pending or a frame is already in flight.
    pub fn dequeue(&self) -> Option<Frame> {
        let mut state = self.lock();
        if state.in_flight {
            return None;
        }
        let frame = state.pending.take()?;
        state.in_flight = true;
        Some(frame)
    }

    /// Clear the in-flight marker, enabling the next dequeue.
    pub fn mark_done(&self) {
        self.lock().in_flight = false;
    }

    /// Whether a frame is waiting.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Whether a frame is currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Total frames displaced since construction. Monotonic.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

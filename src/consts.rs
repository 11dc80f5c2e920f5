//! Shared constants for the sync engine.

use crate::element::Size;

// ── Echo suppression ────────────────────────────────────────────

/// Ordinary echo window in milliseconds. A remote event for an element the
/// local client wrote within this window is treated as that write's echo.
pub const ECHO_WINDOW_MS: u64 = 1000;

/// Extended window in milliseconds while a drag or resize is live. Remote
/// updates for the element are dropped until the terminal write lands.
pub const GESTURE_WINDOW_MS: u64 = 3000;

// ── Element defaults ────────────────────────────────────────────

/// Background color for freshly created notes.
pub const DEFAULT_NOTE_COLOR: &str = "#FFEB3B";

/// Size of a freshly created note.
pub const DEFAULT_NOTE_SIZE: Size = Size { width: 200.0, height: 150.0 };

/// Size of a freshly created text block.
pub const DEFAULT_TEXT_SIZE: Size = Size { width: 200.0, height: 50.0 };

/// Bounding box an inserted image is scaled down to fit.
pub const MAX_IMAGE_SIZE: Size = Size { width: 400.0, height: 300.0 };

/// Font size in pixels for freshly created text blocks.
pub const DEFAULT_TEXT_FONT_SIZE: u32 = 24;

/// Smallest size a note or image can be resized to.
pub const MIN_BLOCK_SIZE: Size = Size { width: 100.0, height: 80.0 };

/// Smallest size a text block can be resized to.
pub const MIN_TEXT_SIZE: Size = Size { width: 100.0, height: 40.0 };

// ── Transport ───────────────────────────────────────────────────

/// First reconnect delay after the change stream drops.
pub const RECONNECT_BASE_MS: u64 = 1000;

/// Ceiling for the exponential reconnect delay.
pub const RECONNECT_MAX_MS: u64 = 10_000;

/// Interval between change-stream heartbeats.
pub const HEARTBEAT_SECS: u64 = 25;

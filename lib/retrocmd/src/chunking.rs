//! Adaptive read-chunk sizing.
//!
//! Emulator cores differ in the largest read they accept; the policy shrinks
//! on failure and cautiously grows again after a window of clean reads.

/// Smallest chunk the policy will shrink to.
pub const CHUNK_FLOOR: usize = 16;
/// Default largest chunk the policy will grow to.
pub const DEFAULT_CHUNK_CEILING: usize = 2048;
/// Consecutive successes required before the chunk size doubles.
pub const DEFAULT_GROWTH_WINDOW: u32 = 32;

/// Initial chunk size for a known platform, conservative default otherwise.
pub fn initial_chunk(platform: &str) -> usize {
    match platform.to_ascii_lowercase().as_str() {
        // 8-bit cores tend to accept only small reads.
        "gb" | "gbc" | "nes" | "sms" | "gg" => 128,
        "gba" | "snes" | "genesis" | "md" => 256,
        "n64" | "psx" | "ps1" => 512,
        _ => 256,
    }
}

/// Feedback-driven chunk-size state for one emulator connection.
#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    current: usize,
    ceiling: usize,
    growth_window: u32,
    success_streak: u32,
}

impl ChunkPolicy {
    pub fn new(initial: usize, ceiling: usize, growth_window: u32) -> Self {
        let ceiling = ceiling.max(CHUNK_FLOOR);
        Self {
            current: initial.clamp(CHUNK_FLOOR, ceiling),
            ceiling,
            growth_window: growth_window.max(1),
            success_streak: 0,
        }
    }

    /// Chunk size to use for the next read request.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Records a refused or timed-out read. Returns `true` while a retry at
    /// a smaller size is still worth attempting, `false` at the floor.
    pub fn on_failure(&mut self) -> bool {
        self.success_streak = 0;
        if self.current > CHUNK_FLOOR {
            self.current = (self.current / 2).max(CHUNK_FLOOR);
            true
        } else {
            false
        }
    }

    /// Records a clean read; doubles the chunk after a full success window.
    pub fn on_success(&mut self) {
        if self.current >= self.ceiling {
            return;
        }
        self.success_streak += 1;
        if self.success_streak >= self.growth_window {
            self.current = (self.current * 2).min(self.ceiling);
            self.success_streak = 0;
        }
    }
}

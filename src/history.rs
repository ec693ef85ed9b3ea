//! Scrollback replay progress.
//!
//! A reattached terminal receives its scrollback as a `history_start`
//! marker, a run of `history` chunks and a `history_end` marker, in that
//! order. Chunks render through the same path as live output; this module
//! only tracks how far the transfer has got.

use serde::Serialize;

/// Progress of one history transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryProgress {
    /// Declared byte size of the scrollback.
    pub total_size: u64,
    /// Declared chunk count.
    pub total_chunks: u32,
    /// Chunks received so far, never above `total_chunks`.
    pub loaded_chunks: u32,
    /// Rounded completion percentage.
    pub percent: u8,
    /// Whether a transfer is in progress.
    pub loading: bool,
}

/// What the caller should do with an inbound history message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStep {
    /// Clear the rendering surface and report progress.
    Begin(HistoryProgress),
    /// Write the payload to the rendering surface and report progress.
    Chunk {
        /// Chunk payload.
        data: String,
        /// Progress after this chunk.
        progress: HistoryProgress,
    },
    /// Chunk seen outside a transfer. Render it as live output.
    Live(String),
    /// Report final progress.
    Finish(HistoryProgress),
}

/// Tracks one transfer at a time; a new start marker abandons the previous.
#[derive(Debug, Default)]
pub struct HistoryAssembler {
    progress: HistoryProgress,
}

impl HistoryAssembler {
    /// Idle assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current progress.
    pub fn progress(&self) -> HistoryProgress {
        self.progress
    }

    /// Whether a transfer is in progress.
    pub fn is_loading(&self) -> bool {
        self.progress.loading
    }

    /// Start marker.
    pub fn start(&mut self, total_size: u64, total_chunks: u32) -> HistoryStep {
        if self.progress.loading {
            log::debug!(
                "[History] Abandoning transfer at {}/{} chunks",
                self.progress.loaded_chunks,
                self.progress.total_chunks
            );
        }
        self.progress = HistoryProgress {
            total_size,
            total_chunks,
            loaded_chunks: 0,
            percent: 0,
            loading: true,
        };
        log::debug!(
            "[History] Replaying {} bytes in {} chunks",
            total_size,
            total_chunks
        );
        HistoryStep::Begin(self.progress)
    }

    /// One chunk.
    pub fn chunk(&mut self, data: String) -> HistoryStep {
        if !self.progress.loading {
            return HistoryStep::Live(data);
        }

        let p = &mut self.progress;
        p.loaded_chunks = p.loaded_chunks.saturating_add(1).min(p.total_chunks);
        p.percent = p.percent.max(percent(p.loaded_chunks, p.total_chunks));
        HistoryStep::Chunk {
            data,
            progress: *p,
        }
    }

    /// End marker.
    pub fn end(&mut self) -> HistoryStep {
        self.progress.percent = 100;
        self.progress.loading = false;
        HistoryStep::Finish(self.progress)
    }

    /// Drop any transfer in flight, e.g. when the socket goes away.
    pub fn abandon(&mut self) {
        self.progress.loading = false;
    }
}

/// `round(loaded / total * 100)`, 0 when `total` is 0.
fn percent(loaded: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let loaded = u64::from(loaded.min(total));
    let total = u64::from(total);
    // Integer round-half-up.
    ((loaded * 200 + total) / (total * 2)) as u8
}

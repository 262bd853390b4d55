// src/double_buffer.rs
//
// Double-buffered frame handoff.
//
// Two render/copy pairs, MAIN and CUE. The engine thread writes the
// render side exclusively; consumers (UI copies, the network thread)
// read the copy side under the buffer lock. The flip swaps the
// underlying storage of render and copy (an O(1) label swap, never a
// pixel copy) and records whether the cue bus carried content this
// frame. Flips happen only at frame boundaries.
//
// In single-threaded operation no flip is needed: the host reads the
// render side directly through the non-thread-safe accessor.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::ColorBuffer;
use crate::color::Argb;

/// The consumer-visible side of the double buffer.
pub struct UiFrame {
    pub main: ColorBuffer,
    pub cue: ColorBuffer,
    /// True iff the cue bus had content when this frame was published.
    pub cue_on: bool,
}

impl UiFrame {
    /// Copy the published frame into a caller-provided buffer: the cue
    /// bus when cue is on, the main bus otherwise.
    pub fn copy_to(&self, dst: &mut [Argb]) {
        let src = if self.cue_on { &self.cue } else { &self.main };
        assert_eq!(dst.len(), src.len(), "color buffer length mismatch");
        dst.copy_from_slice(src.as_slice());
    }
}

/// Engine-side handle: exclusive render buffers plus the shared frame.
pub struct DoubleBuffer {
    render_main: ColorBuffer,
    render_cue: ColorBuffer,
    cue_on: bool,
    shared: Arc<Mutex<UiFrame>>,
}

impl DoubleBuffer {
    pub fn new(num_points: usize) -> Self {
        Self {
            render_main: ColorBuffer::new(num_points),
            render_cue: ColorBuffer::new(num_points),
            cue_on: false,
            shared: Arc::new(Mutex::new(UiFrame {
                main: ColorBuffer::new(num_points),
                cue: ColorBuffer::new(num_points),
                cue_on: false,
            })),
        }
    }

    #[inline]
    pub fn render_main_mut(&mut self) -> &mut ColorBuffer {
        &mut self.render_main
    }

    #[inline]
    pub fn render_cue_mut(&mut self) -> &mut ColorBuffer {
        &mut self.render_cue
    }

    /// Record whether this frame's cue bus has content. Read by the flip
    /// and by the non-thread-safe accessor.
    pub fn set_cue_on(&mut self, cue_on: bool) {
        self.cue_on = cue_on;
    }

    /// Swap render and copy for both pairs under the buffer lock.
    pub fn flip(&mut self) {
        let mut shared = self.shared.lock();
        shared.main.swap(&mut self.render_main);
        shared.cue.swap(&mut self.render_cue);
        shared.cue_on = self.cue_on;
    }

    /// Copy render into copy for both pairs, so a consumer promoted by a
    /// mode transition observes a fully-written frame before the next
    /// flip.
    pub fn sync(&mut self) {
        let mut shared = self.shared.lock();
        shared.main.copy_from(self.render_main.as_slice());
        shared.cue.copy_from(self.render_cue.as_slice());
        shared.cue_on = self.cue_on;
    }

    /// The shared side, for UI copy-out and the network thread.
    pub fn shared(&self) -> Arc<Mutex<UiFrame>> {
        Arc::clone(&self.shared)
    }

    /// Threaded read: copy the published frame out under the lock.
    pub fn copy_ui_buffer(&self, dst: &mut [Argb]) {
        self.shared.lock().copy_to(dst);
    }

    /// Non-thread-safe read for single-threaded hosts: the render side,
    /// cue bus when cue is on.
    pub fn front(&self) -> &[Argb] {
        if self.cue_on {
            self.render_cue.as_slice()
        } else {
            self.render_main.as_slice()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{BLACK, rgb};

    #[test]
    fn test_flip_publishes_render_side() {
        let mut db = DoubleBuffer::new(4);
        db.render_main_mut().fill(rgb(255, 0, 0));
        db.flip();

        let mut out = vec![BLACK; 4];
        db.copy_ui_buffer(&mut out);
        assert!(out.iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    fn test_cue_on_selects_cue_side() {
        let mut db = DoubleBuffer::new(4);
        db.render_main_mut().fill(rgb(255, 0, 0));
        db.render_cue_mut().fill(rgb(0, 0, 255));
        db.set_cue_on(true);
        db.flip();

        let mut out = vec![BLACK; 4];
        db.copy_ui_buffer(&mut out);
        assert!(out.iter().all(|&c| c == rgb(0, 0, 255)));
        assert!(db.front().iter().all(|&c| c != rgb(0, 0, 255)));
    }

    #[test]
    fn test_sync_preserves_render_side() {
        let mut db = DoubleBuffer::new(4);
        db.render_main_mut().fill(rgb(9, 9, 9));
        db.sync();

        // Render side still holds the frame after sync (unlike flip).
        assert!(db.front().iter().all(|&c| c == rgb(9, 9, 9)));
        let mut out = vec![BLACK; 4];
        db.copy_ui_buffer(&mut out);
        assert!(out.iter().all(|&c| c == rgb(9, 9, 9)));
    }
}

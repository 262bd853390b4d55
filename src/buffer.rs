// src/buffer.rs
//
// Fixed-size color point buffers.
//
// Every buffer in the engine is allocated once, at engine construction,
// with exactly the model's point count. Sizes never change afterwards;
// a length mismatch between cooperating buffers is an invariant violation
// and panics.

use crate::color::{Argb, BLACK};

/// A fixed-length buffer of packed ARGB color points.
#[derive(Debug, Clone)]
pub struct ColorBuffer {
    data: Vec<Argb>,
}

impl ColorBuffer {
    /// Allocate a buffer of `len` points, initialized to opaque black.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![BLACK; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Argb] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Argb] {
        &mut self.data
    }

    /// Fill every point with one color.
    #[inline]
    pub fn fill(&mut self, color: Argb) {
        self.data.fill(color);
    }

    /// Copy the full contents of `src` into this buffer.
    ///
    /// Panics if the lengths differ.
    #[inline]
    pub fn copy_from(&mut self, src: &[Argb]) {
        assert_eq!(self.data.len(), src.len(), "color buffer length mismatch");
        self.data.copy_from_slice(src);
    }

    /// Swap the underlying storage with another buffer of the same length.
    ///
    /// This is the flip primitive of the double buffer: O(1), no copying.
    #[inline]
    pub fn swap(&mut self, other: &mut ColorBuffer) {
        assert_eq!(
            self.data.len(),
            other.data.len(),
            "color buffer length mismatch"
        );
        std::mem::swap(&mut self.data, &mut other.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::rgb;

    #[test]
    fn test_new_is_black() {
        let buf = ColorBuffer::new(8);
        assert_eq!(buf.len(), 8);
        assert!(buf.as_slice().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_swap_is_exchange() {
        let mut a = ColorBuffer::new(4);
        let mut b = ColorBuffer::new(4);
        a.fill(rgb(255, 0, 0));
        b.fill(rgb(0, 255, 0));
        a.swap(&mut b);
        assert!(a.as_slice().iter().all(|&c| c == rgb(0, 255, 0)));
        assert!(b.as_slice().iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn test_copy_length_mismatch_panics() {
        let mut a = ColorBuffer::new(4);
        let b = ColorBuffer::new(5);
        a.copy_from(b.as_slice());
    }
}

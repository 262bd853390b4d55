// src/blend.rs
//
// Blend capability and the stock blend set.
//
// A blend combines a source buffer into a destination buffer at a given
// amount. Blends are pure per-pixel kernels shared across channels and the
// crossfader; they carry no state and may be invoked from channel worker
// threads, so they are Send + Sync.

use std::sync::Arc;

use crate::color::{self, Argb};

/// A pure function combining two color buffers.
pub trait Blend: Send + Sync {
    fn label(&self) -> &'static str;

    /// Blend `src` into `dst` at `amount` in [0, 1], in place.
    ///
    /// Panics if the buffer lengths differ.
    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64);
}

#[inline]
fn check_lengths(dst: &[Argb], src: &[Argb]) {
    assert_eq!(dst.len(), src.len(), "blend buffer length mismatch");
}

/// Linear interpolation toward the source.
pub struct NormalBlend;

impl Blend for NormalBlend {
    fn label(&self) -> &'static str {
        "Normal"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = color::lerp(*d, s, amount);
        }
    }
}

/// Saturating add of the scaled source.
pub struct AddBlend;

impl Blend for AddBlend {
    fn label(&self) -> &'static str {
        "Add"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        let t = amount.clamp(0.0, 1.0);
        for (d, &s) in dst.iter_mut().zip(src) {
            let add = |a: u8, b: u8| -> u8 {
                let sum = a as f64 + b as f64 * t;
                sum.round().min(255.0) as u8
            };
            *d = color::rgb(
                add(color::red(*d), color::red(s)),
                add(color::green(*d), color::green(s)),
                add(color::blue(*d), color::blue(s)),
            );
        }
    }
}

/// Saturating subtract of the scaled source.
pub struct SubtractBlend;

impl Blend for SubtractBlend {
    fn label(&self) -> &'static str {
        "Subtract"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        let t = amount.clamp(0.0, 1.0);
        for (d, &s) in dst.iter_mut().zip(src) {
            let sub = |a: u8, b: u8| -> u8 {
                let diff = a as f64 - b as f64 * t;
                diff.round().max(0.0) as u8
            };
            *d = color::rgb(
                sub(color::red(*d), color::red(s)),
                sub(color::green(*d), color::green(s)),
                sub(color::blue(*d), color::blue(s)),
            );
        }
    }
}

/// Per-component product, faded in by amount.
pub struct MultiplyBlend;

impl Blend for MultiplyBlend {
    fn label(&self) -> &'static str {
        "Multiply"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        for (d, &s) in dst.iter_mut().zip(src) {
            let mul = |a: u8, b: u8| -> u8 { ((a as u32 * b as u32) / 255) as u8 };
            let product = color::rgb(
                mul(color::red(*d), color::red(s)),
                mul(color::green(*d), color::green(s)),
                mul(color::blue(*d), color::blue(s)),
            );
            *d = color::lerp(*d, product, amount);
        }
    }
}

/// Inverse multiply, faded in by amount.
pub struct ScreenBlend;

impl Blend for ScreenBlend {
    fn label(&self) -> &'static str {
        "Screen"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        for (d, &s) in dst.iter_mut().zip(src) {
            let screen =
                |a: u8, b: u8| -> u8 { 255 - (((255 - a as u32) * (255 - b as u32)) / 255) as u8 };
            let screened = color::rgb(
                screen(color::red(*d), color::red(s)),
                screen(color::green(*d), color::green(s)),
                screen(color::blue(*d), color::blue(s)),
            );
            *d = color::lerp(*d, screened, amount);
        }
    }
}

/// Symmetric mix: full amount yields an even split of both inputs.
pub struct DissolveBlend;

impl Blend for DissolveBlend {
    fn label(&self) -> &'static str {
        "Dissolve"
    }

    fn apply(&self, dst: &mut [Argb], src: &[Argb], amount: f64) {
        check_lengths(dst, src);
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = color::lerp(*d, s, 0.5 * amount);
        }
    }
}

/// The blend set offered to channels, in parameter order.
pub fn channel_blends() -> Vec<Arc<dyn Blend>> {
    vec![
        Arc::new(NormalBlend),
        Arc::new(AddBlend),
        Arc::new(MultiplyBlend),
        Arc::new(ScreenBlend),
        Arc::new(SubtractBlend),
    ]
}

/// The blend set offered to the crossfader, in parameter order.
pub fn crossfader_blends() -> Vec<Arc<dyn Blend>> {
    vec![
        Arc::new(DissolveBlend),
        Arc::new(AddBlend),
        Arc::new(MultiplyBlend),
        Arc::new(ScreenBlend),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::rgb;

    #[test]
    fn test_normal_full_amount_is_source() {
        let mut dst = vec![rgb(10, 20, 30); 4];
        let src = vec![rgb(200, 100, 50); 4];
        NormalBlend.apply(&mut dst, &src, 1.0);
        assert!(dst.iter().all(|&c| c == rgb(200, 100, 50)));
    }

    #[test]
    fn test_normal_zero_amount_is_destination() {
        let mut dst = vec![rgb(10, 20, 30); 4];
        let src = vec![rgb(200, 100, 50); 4];
        NormalBlend.apply(&mut dst, &src, 0.0);
        assert!(dst.iter().all(|&c| c == rgb(10, 20, 30)));
    }

    #[test]
    fn test_add_saturates() {
        let mut dst = vec![rgb(200, 0, 0); 2];
        let src = vec![rgb(200, 0, 0); 2];
        AddBlend.apply(&mut dst, &src, 1.0);
        assert!(dst.iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    fn test_dissolve_full_amount_is_even_split() {
        let mut dst = vec![rgb(255, 0, 0); 2];
        let src = vec![rgb(0, 255, 0); 2];
        DissolveBlend.apply(&mut dst, &src, 1.0);
        assert!(dst.iter().all(|&c| c == rgb(128, 128, 0)));
    }

    #[test]
    fn test_multiply_black_annihilates() {
        let mut dst = vec![rgb(255, 255, 255); 2];
        let src = vec![rgb(0, 0, 0); 2];
        MultiplyBlend.apply(&mut dst, &src, 1.0);
        assert!(dst.iter().all(|&c| c == rgb(0, 0, 0)));
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn test_length_mismatch_panics() {
        let mut dst = vec![rgb(0, 0, 0); 2];
        let src = vec![rgb(0, 0, 0); 3];
        NormalBlend.apply(&mut dst, &src, 1.0);
    }
}

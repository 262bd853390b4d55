// src/mixer.rs
//
// The compositor: blends channel buffers into the MAIN bus plus two
// crossfade buses, applies the crossfader, and produces the CUE preview
// bus.
//
// Four working buffers plus an immutable black background seed, all of
// the model's point count and allocated once. Channels route by their
// crossfade group: A and B accumulate into the left/right buses and are
// crossfaded into MAIN; BYPASS channels blend straight into MAIN.
// Sub-channels of groups are skipped (their group composited them
// already) but still contribute to the cue preview.

use std::sync::Arc;

use crate::blend::{AddBlend, Blend};
use crate::buffer::ColorBuffer;
use crate::channel::CrossfadeGroup;
use crate::color::Argb;

/// Per-channel snapshot the mixer consumes. Built by the engine while it
/// holds the channel locks, after all channel work is collected.
pub struct ChannelInput<'a> {
    pub colors: &'a [Argb],
    pub fader: f64,
    pub blend: Arc<dyn Blend>,
    pub crossfade_group: CrossfadeGroup,
    pub enabled: bool,
    pub animating: bool,
    pub cue_active: bool,
    /// Member of a group: excluded from bus blending.
    pub grouped: bool,
}

/// Crossfader position and cue state for one mix pass.
#[derive(Debug, Clone, Copy)]
pub struct MixParams {
    pub crossfader: f64,
    pub cue_a: bool,
    pub cue_b: bool,
}

pub struct Mixer {
    main: ColorBuffer,
    left: ColorBuffer,
    right: ColorBuffer,
    cue: ColorBuffer,
    background: ColorBuffer,
    add: AddBlend,
}

impl Mixer {
    pub fn new(num_points: usize) -> Self {
        Self {
            main: ColorBuffer::new(num_points),
            left: ColorBuffer::new(num_points),
            right: ColorBuffer::new(num_points),
            cue: ColorBuffer::new(num_points),
            background: ColorBuffer::new(num_points),
            add: AddBlend,
        }
    }

    /// The final mixed output of the last pass (before master effects are
    /// layered on by the caller, which mutates this buffer in place).
    #[inline]
    pub fn main(&self) -> &[Argb] {
        self.main.as_slice()
    }

    #[inline]
    pub fn main_mut(&mut self) -> &mut [Argb] {
        self.main.as_mut_slice()
    }

    /// The cue preview bus of the last pass.
    #[inline]
    pub fn cue(&self) -> &[Argb] {
        self.cue.as_slice()
    }

    /// The all-black seed buffer.
    #[inline]
    pub fn background(&self) -> &[Argb] {
        self.background.as_slice()
    }

    /// One compositing pass. Returns true iff the cue bus carries
    /// content (any cued channel, or a cue override of a crossfade bus).
    pub fn mix(
        &mut self,
        inputs: &[ChannelInput<'_>],
        crossfade_blend: &Arc<dyn Blend>,
        params: MixParams,
    ) -> bool {
        let x = params.crossfader.clamp(0.0, 1.0);
        let left_active = x < 1.0 || params.cue_a;
        let right_active = x > 0.0 || params.cue_b;

        let mut left_exists = false;
        let mut right_exists = false;
        let mut main_exists = false;
        let mut cue_exists = false;

        for input in inputs {
            if !input.grouped {
                let (bus_active, out, exists) = match input.crossfade_group {
                    CrossfadeGroup::A => (left_active, &mut self.left, &mut left_exists),
                    CrossfadeGroup::B => (right_active, &mut self.right, &mut right_exists),
                    CrossfadeGroup::Bypass => (true, &mut self.main, &mut main_exists),
                };
                if input.enabled && input.animating && bus_active {
                    if !*exists {
                        // First contributor reads from the background.
                        out.copy_from(self.background.as_slice());
                        *exists = true;
                    }
                    if input.fader > 0.0 {
                        input
                            .blend
                            .apply(out.as_mut_slice(), input.colors, input.fader);
                    }
                }
            }

            if input.cue_active {
                if !cue_exists {
                    self.cue.copy_from(self.background.as_slice());
                    cue_exists = true;
                }
                self.add.apply(self.cue.as_mut_slice(), input.colors, 1.0);
            }
        }

        // Cue overrides come before the crossfade consumes the buses.
        if params.cue_a && left_exists {
            self.cue.copy_from(self.left.as_slice());
            cue_exists = true;
        }
        if params.cue_b && right_exists {
            self.cue.copy_from(self.right.as_slice());
            cue_exists = true;
        }

        match (left_exists, right_exists) {
            (true, true) => {
                // Blend the lesser side into the dominant side in place,
                // then add the result into MAIN at full strength.
                let crossfaded = if x <= 0.5 {
                    crossfade_blend.apply(
                        self.left.as_mut_slice(),
                        self.right.as_slice(),
                        (2.0 * x).min(1.0),
                    );
                    &self.left
                } else {
                    crossfade_blend.apply(
                        self.right.as_mut_slice(),
                        self.left.as_slice(),
                        (2.0 * (1.0 - x)).min(1.0),
                    );
                    &self.right
                };
                if !main_exists {
                    self.main.copy_from(self.background.as_slice());
                }
                self.add.apply(self.main.as_mut_slice(), crossfaded.as_slice(), 1.0);
            }
            (true, false) => {
                if !main_exists {
                    self.main.copy_from(self.background.as_slice());
                }
                self.add.apply(
                    self.main.as_mut_slice(),
                    self.left.as_slice(),
                    (2.0 * (1.0 - x)).min(1.0),
                );
            }
            (false, true) => {
                if !main_exists {
                    self.main.copy_from(self.background.as_slice());
                }
                self.add
                    .apply(self.main.as_mut_slice(), self.right.as_slice(), (2.0 * x).min(1.0));
            }
            (false, false) => {
                if !main_exists {
                    // Nothing contributed: clear stale data.
                    self.main.copy_from(self.background.as_slice());
                }
            }
        }

        let cue_on = cue_exists || params.cue_a || params.cue_b;
        if cue_on && !cue_exists {
            self.cue.copy_from(self.background.as_slice());
        }
        cue_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::{DissolveBlend, NormalBlend, channel_blends};
    use crate::color::{BLACK, rgb};

    fn params(crossfader: f64) -> MixParams {
        MixParams {
            crossfader,
            cue_a: false,
            cue_b: false,
        }
    }

    fn crossfade() -> Arc<dyn Blend> {
        Arc::new(DissolveBlend)
    }

    fn input<'a>(
        colors: &'a [Argb],
        fader: f64,
        group: CrossfadeGroup,
    ) -> ChannelInput<'a> {
        ChannelInput {
            colors,
            fader,
            blend: Arc::new(NormalBlend),
            crossfade_group: group,
            enabled: true,
            animating: true,
            cue_active: false,
            grouped: false,
        }
    }

    #[test]
    fn test_zero_channels_is_background() {
        let mut mixer = Mixer::new(8);
        let cue_on = mixer.mix(&[], &crossfade(), params(0.5));
        assert!(!cue_on);
        assert!(mixer.main().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_bypass_fader_zero_is_background() {
        let mut mixer = Mixer::new(8);
        let colors = vec![rgb(255, 0, 0); 8];
        mixer.mix(
            &[input(&colors, 0.0, CrossfadeGroup::Bypass)],
            &crossfade(),
            params(0.5),
        );
        assert!(mixer.main().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_bypass_full_fader_normal_is_channel() {
        let mut mixer = Mixer::new(8);
        let colors = vec![rgb(255, 0, 0); 8];
        mixer.mix(
            &[input(&colors, 1.0, CrossfadeGroup::Bypass)],
            &crossfade(),
            params(0.5),
        );
        assert!(mixer.main().iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    fn test_crossfader_extremes() {
        let red = vec![rgb(255, 0, 0); 8];
        let green = vec![rgb(0, 255, 0); 8];

        // Hard left: A at full weight. The B bus is inactive, so the
        // right channel never renders into it.
        let mut mixer = Mixer::new(8);
        mixer.mix(
            &[
                input(&red, 1.0, CrossfadeGroup::A),
                input(&green, 1.0, CrossfadeGroup::B),
            ],
            &crossfade(),
            params(0.0),
        );
        assert!(mixer.main().iter().all(|&c| c == rgb(255, 0, 0)));

        // Hard right.
        let mut mixer = Mixer::new(8);
        mixer.mix(
            &[
                input(&red, 1.0, CrossfadeGroup::A),
                input(&green, 1.0, CrossfadeGroup::B),
            ],
            &crossfade(),
            params(1.0),
        );
        assert!(mixer.main().iter().all(|&c| c == rgb(0, 255, 0)));
    }

    #[test]
    fn test_crossfader_center_dissolve_is_even_mix() {
        let red = vec![rgb(255, 0, 0); 8];
        let green = vec![rgb(0, 255, 0); 8];
        let mut mixer = Mixer::new(8);
        mixer.mix(
            &[
                input(&red, 1.0, CrossfadeGroup::A),
                input(&green, 1.0, CrossfadeGroup::B),
            ],
            &crossfade(),
            params(0.5),
        );
        assert!(mixer.main().iter().all(|&c| c == rgb(128, 128, 0)));
    }

    #[test]
    fn test_disabled_channel_contributes_nothing() {
        let mut mixer = Mixer::new(8);
        let colors = vec![rgb(255, 0, 0); 8];
        let mut ch = input(&colors, 1.0, CrossfadeGroup::Bypass);
        ch.enabled = false;
        mixer.mix(&[ch], &crossfade(), params(0.5));
        assert!(mixer.main().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_cue_channel_fills_cue_bus() {
        let mut mixer = Mixer::new(8);
        let colors = vec![rgb(0, 0, 255); 8];
        let mut ch = input(&colors, 1.0, CrossfadeGroup::Bypass);
        ch.cue_active = true;
        let cue_on = mixer.mix(&[ch], &crossfade(), params(0.5));
        assert!(cue_on);
        assert!(mixer.cue().iter().all(|&c| c == rgb(0, 0, 255)));
        // Main is mixed independently of the cue preview.
        assert!(mixer.main().iter().all(|&c| c == rgb(0, 0, 255)));
    }

    #[test]
    fn test_cue_a_overrides_cue_with_left_bus() {
        let mut mixer = Mixer::new(8);
        let red = vec![rgb(255, 0, 0); 8];
        let cue_on = mixer.mix(
            &[input(&red, 1.0, CrossfadeGroup::A)],
            &crossfade(),
            MixParams {
                // Hard right: A would normally be inactive, cueA keeps
                // it rendering.
                crossfader: 1.0,
                cue_a: true,
                cue_b: false,
            },
        );
        assert!(cue_on);
        assert!(mixer.cue().iter().all(|&c| c == rgb(255, 0, 0)));
    }

    #[test]
    fn test_grouped_channel_skips_bus_blending() {
        let mut mixer = Mixer::new(8);
        let colors = vec![rgb(255, 0, 0); 8];
        let mut ch = input(&colors, 1.0, CrossfadeGroup::Bypass);
        ch.grouped = true;
        mixer.mix(&[ch], &crossfade(), params(0.5));
        assert!(mixer.main().iter().all(|&c| c == BLACK));
    }
}

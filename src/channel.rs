// src/channel.rs
//
// Channels: the per-frame generator units.
//
// A channel owns a pattern list (one active, one pending during a
// transition), an effect chain, a color buffer of the model's point
// count, and the parameters the mixer reads: fader, blend mode,
// crossfade group, enabled, cue, selected. A group is a channel that
// composites an ordered list of sub-channels into its own buffer instead
// of running patterns. The master channel carries only effects and clips,
// applied to the final mixed output.
//
// The engine owns all channels; groups hold child ids, not children.
// Back-links (channel -> group) are ids as well, so the graph stays
// acyclic in ownership terms.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::blend::Blend;
use crate::buffer::ColorBuffer;
use crate::clip::ClipSlots;
use crate::color::{self, Argb};
use crate::effect::{Effect, EffectRegistry};
use crate::parameter::{
    BooleanParameter, BoundedParameter, EnumParameter, ObjectParameter, Units,
};
use crate::pattern::{Pattern, PatternRegistry};
use crate::worker::ChannelWorker;

/// Stable channel identity, assigned once and never reused.
pub type ChannelId = u32;

/// Which mixer bus a channel feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeGroup {
    A,
    B,
    #[default]
    Bypass,
}

impl CrossfadeGroup {
    pub fn options() -> Vec<(&'static str, CrossfadeGroup)> {
        vec![
            ("A", CrossfadeGroup::A),
            ("B", CrossfadeGroup::B),
            ("Bypass", CrossfadeGroup::Bypass),
        ]
    }
}

/// The engine-facing handle for one channel: its stable id, the shared
/// core, and the lazily-started worker thread used in channel-threaded
/// mode.
pub struct Channel {
    pub id: ChannelId,
    core: Arc<Mutex<ChannelCore>>,
    pub(crate) worker: Option<ChannelWorker>,
}

impl Channel {
    pub fn new(core: ChannelCore) -> Self {
        Self {
            id: core.id,
            core: Arc::new(Mutex::new(core)),
            worker: None,
        }
    }

    #[inline]
    pub fn core(&self) -> &Arc<Mutex<ChannelCore>> {
        &self.core
    }
}

/// All channel state. Shared with at most one worker thread; the worker
/// only holds the lock while executing a requested frame, so the engine
/// thread has exclusive access outside the channel-work window.
pub struct ChannelCore {
    id: ChannelId,
    pub label: String,
    path: String,

    // Mixer-facing parameters.
    pub fader: BoundedParameter,
    pub blend_mode: ObjectParameter<dyn Blend>,
    pub crossfade_group: EnumParameter<CrossfadeGroup>,
    pub enabled: BooleanParameter,
    pub cue_active: BooleanParameter,
    pub selected: BooleanParameter,

    // Pattern transition control.
    pub transition_enabled: BooleanParameter,
    pub transition_millis: BoundedParameter,

    // Structure. `index` mirrors the channel's position in the engine
    // list and is rewritten after every structural change.
    index: usize,
    group: Option<ChannelId>,
    children: Vec<ChannelId>,
    is_group: bool,

    // Runtime state.
    patterns: Vec<Box<dyn Pattern>>,
    active_pattern: usize,
    next_pattern: Option<usize>,
    transition_progress: f64,
    pub effects: Vec<Box<dyn Effect>>,
    colors: ColorBuffer,
    scratch: ColorBuffer,
    is_animating: bool,
    pub clips: ClipSlots,
}

impl ChannelCore {
    pub fn new(
        id: ChannelId,
        label: impl Into<String>,
        num_points: usize,
        blends: Vec<Arc<dyn Blend>>,
        patterns: Vec<Box<dyn Pattern>>,
    ) -> Self {
        let label = label.into();
        let path = format!("/lumen/engine/channel/{id}");

        let mut fader = BoundedParameter::new("fader", 0.0, 0.0, 1.0);
        let mut blend_mode = ObjectParameter::new("blendMode", blends);
        let mut crossfade_group =
            EnumParameter::new("crossfadeGroup", CrossfadeGroup::Bypass, CrossfadeGroup::options());
        let mut enabled = BooleanParameter::new("enabled", true);
        let mut cue_active = BooleanParameter::new("cue", false);
        let mut selected = BooleanParameter::new("selected", false);
        let mut transition_enabled = BooleanParameter::new("transitionEnabled", false);
        let mut transition_millis =
            BoundedParameter::new("transitionMillis", 1000.0, 0.0, 180_000.0).units(Units::Ms);

        // Fresh parameters; first bind cannot fail.
        fader.bind(format!("{path}/fader")).expect("fresh parameter");
        blend_mode
            .bind(format!("{path}/blendMode"))
            .expect("fresh parameter");
        crossfade_group
            .bind(format!("{path}/crossfadeGroup"))
            .expect("fresh parameter");
        enabled
            .bind(format!("{path}/enabled"))
            .expect("fresh parameter");
        cue_active
            .bind(format!("{path}/cue"))
            .expect("fresh parameter");
        selected
            .bind(format!("{path}/selected"))
            .expect("fresh parameter");
        transition_enabled
            .bind(format!("{path}/transitionEnabled"))
            .expect("fresh parameter");
        transition_millis
            .bind(format!("{path}/transitionMillis"))
            .expect("fresh parameter");

        Self {
            id,
            label,
            path,
            fader,
            blend_mode,
            crossfade_group,
            enabled,
            cue_active,
            selected,
            transition_enabled,
            transition_millis,
            index: 0,
            group: None,
            children: Vec::new(),
            is_group: false,
            patterns,
            active_pattern: 0,
            next_pattern: None,
            transition_progress: 0.0,
            effects: Vec::new(),
            colors: ColorBuffer::new(num_points),
            scratch: ColorBuffer::new(num_points),
            is_animating: false,
            clips: ClipSlots::new(),
        }
    }

    /// A group channel: composites children, runs no patterns.
    pub fn new_group(
        id: ChannelId,
        label: impl Into<String>,
        num_points: usize,
        blends: Vec<Arc<dyn Blend>>,
    ) -> Self {
        let mut core = Self::new(id, label, num_points, blends, Vec::new());
        core.is_group = true;
        core
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    #[inline]
    pub fn group(&self) -> Option<ChannelId> {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: Option<ChannelId>) {
        self.group = group;
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        self.is_group
    }

    pub fn children(&self) -> &[ChannelId] {
        &self.children
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<ChannelId> {
        &mut self.children
    }

    #[inline]
    pub fn is_animating(&self) -> bool {
        self.is_animating
    }

    #[inline]
    pub fn colors(&self) -> &[Argb] {
        self.colors.as_slice()
    }

    // ───────────────────────────────────────────────────────────────
    // Patterns
    // ───────────────────────────────────────────────────────────────

    pub fn patterns(&self) -> &[Box<dyn Pattern>] {
        &self.patterns
    }

    pub fn add_pattern(&mut self, pattern: Box<dyn Pattern>) {
        self.patterns.push(pattern);
    }

    pub fn active_pattern_index(&self) -> usize {
        self.active_pattern
    }

    /// Begin moving to pattern `index`. With transitions disabled or a
    /// zero transition time the switch is immediate.
    pub fn go_pattern(&mut self, index: usize) {
        if index >= self.patterns.len() || index == self.active_pattern {
            return;
        }
        if self.transition_enabled.is_on() && self.transition_millis.value() > 0.0 {
            self.next_pattern = Some(index);
            self.transition_progress = 0.0;
        } else {
            self.active_pattern = index;
            self.next_pattern = None;
        }
    }

    /// Move to the next pattern in list order, wrapping.
    pub fn go_next(&mut self) {
        if self.patterns.len() > 1 {
            self.go_pattern((self.active_pattern + 1) % self.patterns.len());
        }
    }

    pub fn in_transition(&self) -> bool {
        self.next_pattern.is_some()
    }

    // ───────────────────────────────────────────────────────────────
    // Frame work
    // ───────────────────────────────────────────────────────────────

    /// One frame of channel work: advance the active (and pending)
    /// pattern, mix the transition, run the effect chain.
    ///
    /// Groups skip pattern work; their buffer is produced by
    /// `composite_children` after every leaf has run.
    pub fn loop_frame(&mut self, delta_ms: f64) {
        if self.is_group {
            for effect in &mut self.effects {
                effect.advance(delta_ms);
            }
            return;
        }

        if self.patterns.is_empty() {
            self.is_animating = false;
            return;
        }

        self.patterns[self.active_pattern].advance(delta_ms);
        self.patterns[self.active_pattern].render(self.colors.as_mut_slice());

        if let Some(next) = self.next_pattern {
            let millis = self.transition_millis.value();
            self.transition_progress = if millis > 0.0 {
                (self.transition_progress + delta_ms / millis).min(1.0)
            } else {
                1.0
            };
            let progress = self.transition_progress;

            self.patterns[next].advance(delta_ms);
            self.patterns[next].render(self.scratch.as_mut_slice());
            for (c, &s) in self
                .colors
                .as_mut_slice()
                .iter_mut()
                .zip(self.scratch.as_slice())
            {
                *c = color::lerp(*c, s, progress);
            }

            if progress >= 1.0 {
                self.active_pattern = next;
                self.next_pattern = None;
                self.transition_progress = 0.0;
            }
        }

        for effect in &mut self.effects {
            effect.advance(delta_ms);
            effect.apply(self.colors.as_mut_slice());
        }

        self.is_animating = true;
    }

    /// Composite sub-channel buffers into this group's buffer, in channel
    /// order, exactly as the top-level mixer does: the first contributor
    /// reads from the background, later ones accumulate.
    pub fn composite_children(
        &mut self,
        background: &[Argb],
        contributions: &[GroupContribution<'_>],
    ) {
        debug_assert!(self.is_group);
        let mut seeded = false;
        for child in contributions {
            if !child.active {
                continue;
            }
            if !seeded {
                self.colors.copy_from(background);
                seeded = true;
            }
            if child.fader > 0.0 {
                child
                    .blend
                    .apply(self.colors.as_mut_slice(), child.colors, child.fader);
            }
        }
        if seeded {
            for effect in &mut self.effects {
                effect.apply(self.colors.as_mut_slice());
            }
        }
        self.is_animating = seeded;
    }

    // ───────────────────────────────────────────────────────────────
    // Persistence
    // ───────────────────────────────────────────────────────────────

    /// Channel-local state tree. The engine adds the `class` tag and, for
    /// groups, the nested child array.
    pub fn save(&self) -> Value {
        let patterns: Vec<Value> = self
            .patterns
            .iter()
            .map(|p| {
                let mut obj = p.save();
                if let Some(map) = obj.as_object_mut() {
                    map.insert("class".into(), json!(p.class_name()));
                }
                obj
            })
            .collect();
        let effects: Vec<Value> = self
            .effects
            .iter()
            .map(|e| {
                let mut obj = e.save();
                if let Some(map) = obj.as_object_mut() {
                    map.insert("class".into(), json!(e.class_name()));
                }
                obj
            })
            .collect();

        json!({
            "label": self.label,
            "fader": self.fader.value(),
            "blendMode": self.blend_mode.selected().label(),
            "crossfadeGroup": self.crossfade_group.value_label(),
            "enabled": self.enabled.is_on(),
            "cue": self.cue_active.is_on(),
            "selected": self.selected.is_on(),
            "transitionEnabled": self.transition_enabled.is_on(),
            "transitionMillis": self.transition_millis.value(),
            "patterns": patterns,
            "activePattern": self.active_pattern,
            "effects": effects,
            "clips": self.clips.save(),
        })
    }

    /// Restore channel-local state. Unknown keys are ignored; missing
    /// keys keep defaults.
    pub fn load(&mut self, obj: &Value, patterns: &PatternRegistry, effects: &EffectRegistry) {
        if let Some(label) = obj.get("label").and_then(Value::as_str) {
            self.label = label.to_string();
        }
        if let Some(v) = obj.get("fader").and_then(Value::as_f64) {
            self.fader.set_value(v);
        }
        if let Some(name) = obj.get("blendMode").and_then(Value::as_str) {
            if let Some(i) = self
                .blend_mode
                .objects()
                .iter()
                .position(|b| b.label() == name)
            {
                self.blend_mode.set_index(i);
            }
        }
        if let Some(name) = obj.get("crossfadeGroup").and_then(Value::as_str) {
            if let Some(group) = self.crossfade_group.from_label(name) {
                self.crossfade_group.set_value(group);
            }
        }
        if let Some(v) = obj.get("enabled").and_then(Value::as_bool) {
            self.enabled.set_value(v);
        }
        if let Some(v) = obj.get("cue").and_then(Value::as_bool) {
            self.cue_active.set_value(v);
        }
        if let Some(v) = obj.get("selected").and_then(Value::as_bool) {
            self.selected.set_value(v);
        }
        if let Some(v) = obj.get("transitionEnabled").and_then(Value::as_bool) {
            self.transition_enabled.set_value(v);
        }
        if let Some(v) = obj.get("transitionMillis").and_then(Value::as_f64) {
            self.transition_millis.set_value(v);
        }

        if let Some(list) = obj.get("patterns").and_then(Value::as_array) {
            self.patterns.clear();
            self.active_pattern = 0;
            self.next_pattern = None;
            for entry in list {
                let Some(class) = entry.get("class").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(mut pattern) = patterns.create(class) {
                    pattern.load(entry);
                    self.patterns.push(pattern);
                }
            }
            if let Some(active) = obj.get("activePattern").and_then(Value::as_u64) {
                let active = active as usize;
                if active < self.patterns.len() {
                    self.active_pattern = active;
                }
            }
        }

        if let Some(list) = obj.get("effects").and_then(Value::as_array) {
            self.effects.clear();
            for entry in list {
                let Some(class) = entry.get("class").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(mut effect) = effects.create(class) {
                    effect.load(entry);
                    self.effects.push(effect);
                }
            }
        }

        if let Some(clips) = obj.get("clips") {
            self.clips.load(clips);
        }
    }
}

/// One sub-channel's input to a group composite.
pub struct GroupContribution<'a> {
    pub colors: &'a [Argb],
    pub fader: f64,
    pub blend: Arc<dyn Blend>,
    pub active: bool,
}

// ───────────────────────────────────────────────────────────────────
// Master channel
// ───────────────────────────────────────────────────────────────────

/// The distinguished output channel: no patterns, only effects applied
/// to the final mixed buffer, plus its own clip rack.
pub struct MasterChannel {
    pub effects: Vec<Box<dyn Effect>>,
    pub clips: ClipSlots,
}

impl MasterChannel {
    pub fn new() -> Self {
        Self {
            effects: Vec::new(),
            clips: ClipSlots::new(),
        }
    }

    pub fn path(&self) -> &'static str {
        "/lumen/engine/master"
    }

    /// Advance effect (and clip) time.
    pub fn loop_frame(&mut self, delta_ms: f64) {
        for effect in &mut self.effects {
            effect.advance(delta_ms);
        }
    }

    /// Run the master effect chain over the mixed output.
    pub fn apply_effects(&mut self, colors: &mut [Argb]) {
        for effect in &mut self.effects {
            effect.apply(colors);
        }
    }

    pub fn save(&self) -> Value {
        let effects: Vec<Value> = self
            .effects
            .iter()
            .map(|e| {
                let mut obj = e.save();
                if let Some(map) = obj.as_object_mut() {
                    map.insert("class".into(), json!(e.class_name()));
                }
                obj
            })
            .collect();
        json!({ "effects": effects, "clips": self.clips.save() })
    }

    pub fn load(&mut self, obj: &Value, registry: &EffectRegistry) {
        if let Some(list) = obj.get("effects").and_then(Value::as_array) {
            self.effects.clear();
            for entry in list {
                let Some(class) = entry.get("class").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(mut effect) = registry.create(class) {
                    effect.load(entry);
                    self.effects.push(effect);
                }
            }
        }
        if let Some(clips) = obj.get("clips") {
            self.clips.load(clips);
        }
    }
}

impl Default for MasterChannel {
    fn default() -> Self {
        Self::new()
    }
}

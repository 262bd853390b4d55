// src/project.rs
//
// Project persistence: the engine saves to and loads from an opaque
// key-value tree. Save walks the component tree; load rebuilds channels
// by class name and then delegates to each piece in a fixed order:
// modulation is cleared first, channels are re-added, then master,
// palette, tempo, audio, components, output, modulation, osc, midi, and
// finally the engine's own parameters.
//
// Tolerance rules: unknown keys are ignored, missing optional keys keep
// defaults, a missing `channels` key produces one default channel at
// full fader, and a channel element without a `class` key is skipped.

use log::warn;
use serde_json::{Map, Value, json};

use crate::channel::{Channel, ChannelCore, ChannelId};
use crate::engine::Engine;

const CLASS_CHANNEL: &str = "channel";
const CLASS_GROUP: &str = "group";

impl Engine {
    /// Serialize the full project state.
    pub fn save(&self) -> Value {
        let channels: Vec<Value> = self
            .channels()
            .iter()
            .filter(|c| c.core().lock().group().is_none())
            .map(|c| self.save_channel_element(c))
            .collect();

        let mut components = Map::new();
        for (key, component) in &self.components {
            components.insert(key.clone(), component.save());
        }

        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "palette": self.palette.as_ref().map(|p| p.save()).unwrap_or(json!({})),
            "channels": channels,
            "master": self.master.save(),
            "tempo": self.tempo.as_ref().map(|t| t.save()).unwrap_or(json!({})),
            "audio": self.audio.as_ref().map(|a| a.save()).unwrap_or(json!({})),
            "output": self.output().lock().save(),
            "components": components,
            "modulation": self.modulation.as_ref().map(|m| m.save()).unwrap_or(json!({})),
            "osc": self.osc.as_ref().map(|o| o.save()).unwrap_or(json!({})),
            "midi": self.midi.as_ref().map(|m| m.save()).unwrap_or(json!({})),
            "parameters": {
                "speed": self.speed.value(),
                "framesPerSecond": self.frames_per_second.value(),
                "crossfader": self.crossfader.base().value(),
                "crossfaderBlendMode": self.crossfader_blend.selected().label(),
                "cueA": self.cue_a.is_on(),
                "cueB": self.cue_b.is_on(),
                "focusedChannel": self.focused_channel.index(),
                "focusedClip": self.focused_clip.index(),
                "channelMultithreaded": self.channel_multithreaded.is_on(),
                "networkMultithreaded": self.network_multithreaded.is_on(),
            },
        })
    }

    fn save_channel_element(&self, channel: &Channel) -> Value {
        let core = channel.core().lock();
        let mut element = core.save();
        let Some(map) = element.as_object_mut() else {
            return element;
        };
        if core.is_group() {
            map.insert("class".into(), json!(CLASS_GROUP));
            let children: Vec<Value> = core
                .children()
                .iter()
                .filter_map(|id| self.channel(*id))
                .map(|child| self.save_channel_element(child))
                .collect();
            map.insert("channels".into(), Value::Array(children));
        } else {
            map.insert("class".into(), json!(CLASS_CHANNEL));
        }
        element
    }

    /// Restore project state from a tree produced by `save`.
    pub fn load(&mut self, obj: &Value) {
        // Modulation resets before anything references it.
        if let Some(modulation) = &mut self.modulation {
            modulation.load(&Value::Null);
        }

        self.clear_channels();
        match obj.get("channels").and_then(Value::as_array) {
            Some(elements) => {
                for element in elements {
                    self.load_channel_element(element, None);
                }
            }
            None => {
                // An empty project still renders: one default channel at
                // full fader.
                let id = self.add_channel();
                if let Some(core) = self.channel_core(id) {
                    core.lock().fader.set_value(1.0);
                }
            }
        }

        if let Some(master) = obj.get("master") {
            self.master.load(master, &self.effects);
        }
        if let Some(palette) = obj.get("palette") {
            if let Some(target) = &mut self.palette {
                target.load(palette);
            }
        }
        if let Some(tempo) = obj.get("tempo") {
            if let Some(target) = &mut self.tempo {
                target.load(tempo);
            }
        }
        if let Some(audio) = obj.get("audio") {
            if let Some(target) = &mut self.audio {
                target.load(audio);
            }
        }
        if let Some(components) = obj.get("components").and_then(Value::as_object) {
            for (key, component) in &mut self.components {
                if let Some(saved) = components.get(key) {
                    component.load(saved);
                }
            }
        }
        if let Some(output) = obj.get("output") {
            self.output().lock().load(output);
        }
        if let Some(modulation) = obj.get("modulation") {
            if let Some(target) = &mut self.modulation {
                target.load(modulation);
            }
        }
        if let Some(osc) = obj.get("osc") {
            if let Some(target) = &mut self.osc {
                target.load(osc);
            }
        }
        if let Some(midi) = obj.get("midi") {
            if let Some(target) = &mut self.midi {
                target.load(midi);
            }
        }

        if let Some(params) = obj.get("parameters") {
            self.load_own_parameters(params);
        }
    }

    /// Rebuild one channel element. Returns the new id, or None when the
    /// element is unusable (no `class` key).
    fn load_channel_element(
        &mut self,
        element: &Value,
        group: Option<ChannelId>,
    ) -> Option<ChannelId> {
        let Some(class) = element.get("class").and_then(Value::as_str) else {
            warn!("channel element without class key, skipping");
            return None;
        };

        let id = match class {
            CLASS_CHANNEL => self.add_channel_with_patterns(Vec::new()),
            CLASS_GROUP => self.add_group(),
            other => {
                warn!("unknown channel class '{other}', skipping");
                return None;
            }
        };

        if let Some(core) = self.channel_core(id) {
            let mut core = core.lock();
            load_core(&mut core, element, self);
        }

        if let Some(parent) = group {
            let _ = self.add_to_group(parent, id);
        }

        if class == CLASS_GROUP {
            if let Some(children) = element.get("channels").and_then(Value::as_array) {
                for child in children {
                    self.load_channel_element(child, Some(id));
                }
            }
        }

        Some(id)
    }

    fn load_own_parameters(&mut self, params: &Value) {
        if let Some(v) = params.get("speed").and_then(Value::as_f64) {
            self.speed.set_value(v);
        }
        if let Some(v) = params.get("framesPerSecond").and_then(Value::as_f64) {
            self.frames_per_second.set_value(v);
        }
        if let Some(v) = params.get("crossfader").and_then(Value::as_f64) {
            self.crossfader.set_value(v);
        }
        if let Some(name) = params.get("crossfaderBlendMode").and_then(Value::as_str) {
            if let Some(i) = self
                .crossfader_blend
                .objects()
                .iter()
                .position(|b| b.label() == name)
            {
                self.crossfader_blend.set_index(i);
            }
        }
        if let Some(v) = params.get("cueA").and_then(Value::as_bool) {
            self.cue_a.set_value(v);
        }
        if let Some(v) = params.get("cueB").and_then(Value::as_bool) {
            self.cue_b.set_value(v);
        }
        if let Some(v) = params.get("focusedChannel").and_then(Value::as_u64) {
            self.focused_channel.set_index(v as usize);
        }
        if let Some(v) = params.get("focusedClip").and_then(Value::as_u64) {
            self.focused_clip.set_index(v as usize);
        }
        if let Some(v) = params.get("channelMultithreaded").and_then(Value::as_bool) {
            self.channel_multithreaded.set_value(v);
        }
        if let Some(v) = params.get("networkMultithreaded").and_then(Value::as_bool) {
            self.network_multithreaded.set_value(v);
        }
        self.drain_intents();
    }
}

// Free helper so the channel-core lock guard and the engine's registry
// borrows do not overlap in a method body.
fn load_core(core: &mut ChannelCore, element: &Value, engine: &Engine) {
    core.load(element, &engine.patterns, &engine.effects);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CrossfadeGroup;
    use crate::color::rgb;
    use crate::pattern::SolidPattern;

    fn sample_engine() -> Engine {
        let mut engine = Engine::new(12);
        let a = engine.add_channel_with_patterns(vec![Box::new(SolidPattern::new(rgb(255, 0, 0)))]);
        {
            let core = engine.channel_core(a).unwrap();
            let mut core = core.lock();
            core.fader.set_value(0.8);
            core.crossfade_group.set_value(CrossfadeGroup::A);
        }
        let b = engine.add_channel_with_patterns(vec![Box::new(SolidPattern::new(rgb(0, 255, 0)))]);
        engine
            .channel_core(b)
            .unwrap()
            .lock()
            .fader
            .set_value(0.25);
        engine.speed.set_value(1.5);
        engine.crossfader.set_value(0.3);
        engine
    }

    #[test]
    fn test_round_trip_preserves_channels_and_parameters() {
        let original = sample_engine();
        let saved = original.save();

        let mut restored = Engine::new(12);
        restored.load(&saved);

        assert_eq!(restored.channels().len(), original.channels().len());
        for (a, b) in original.channels().iter().zip(restored.channels()) {
            let a = a.core().lock();
            let b = b.core().lock();
            assert_eq!(a.fader.value(), b.fader.value());
            assert_eq!(a.crossfade_group.value(), b.crossfade_group.value());
            assert_eq!(a.patterns().len(), b.patterns().len());
        }
        assert_eq!(restored.speed.value(), 1.5);
        assert_eq!(restored.crossfader.base().value(), 0.3);
    }

    #[test]
    fn test_round_trip_preserves_group_structure() {
        let mut engine = Engine::new(12);
        let group = engine.add_group();
        let member = engine.add_channel();
        engine.add_to_group(group, member).unwrap();

        let saved = engine.save();
        let mut restored = Engine::new(12);
        restored.load(&saved);

        // One group with one member, both in the flat list.
        assert_eq!(restored.channels().len(), 2);
        let groups: Vec<_> = restored
            .channels()
            .iter()
            .filter(|c| c.core().lock().is_group())
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].core().lock().children().len(), 1);
    }

    #[test]
    fn test_missing_channels_key_creates_default() {
        let mut engine = Engine::new(12);
        engine.load(&json!({}));
        assert_eq!(engine.channels().len(), 1);
        assert_eq!(
            engine.channels()[0].core().lock().fader.value(),
            1.0
        );
    }

    #[test]
    fn test_element_without_class_is_skipped() {
        let mut engine = Engine::new(12);
        engine.load(&json!({
            "channels": [
                { "fader": 0.5 },
                { "class": "channel", "fader": 0.5 },
            ]
        }));
        assert_eq!(engine.channels().len(), 1);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let mut engine = Engine::new(12);
        engine.load(&json!({
            "channels": [],
            "somethingElse": { "nested": true },
            "parameters": { "speed": 0.5, "bogus": 12 },
        }));
        assert_eq!(engine.channels().len(), 0);
        assert_eq!(engine.speed.value(), 0.5);
    }
}

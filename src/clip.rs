// src/clip.rs
//
// Triggerable clips and per-channel clip slots.
//
// The engine core only observes trigger/stop; what a clip plays back is
// a concern of the channel's patterns and parameters. Slot indices line
// up with the engine's scene triggers.

use serde_json::{Value, json};

/// Number of clip slots per channel, matching the scene trigger count.
pub const SCENE_COUNT: usize = 5;

/// A time-bound entity attached to a channel.
#[derive(Debug, Clone)]
pub struct Clip {
    pub label: String,
    running: bool,
}

impl Clip {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            running: false,
        }
    }

    pub fn trigger(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// A channel's clip rack: one optional clip per scene slot.
#[derive(Debug, Default)]
pub struct ClipSlots {
    slots: [Option<Clip>; SCENE_COUNT],
}

impl ClipSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: usize, clip: Option<Clip>) {
        if slot < SCENE_COUNT {
            self.slots[slot] = clip;
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Clip> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Trigger the clip in `slot`, if any.
    pub fn trigger(&mut self, slot: usize) {
        if let Some(Some(clip)) = self.slots.get_mut(slot) {
            clip.trigger();
        }
    }

    /// Stop every running clip.
    pub fn stop_all(&mut self) {
        for clip in self.slots.iter_mut().flatten() {
            clip.stop();
        }
    }

    pub fn any_running(&self) -> bool {
        self.slots.iter().flatten().any(Clip::is_running)
    }

    pub fn save(&self) -> Value {
        let slots: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .map(|clip| json!({ "slot": i, "label": clip.label }))
            })
            .collect();
        json!({ "slots": slots })
    }

    pub fn load(&mut self, obj: &Value) {
        self.slots = Default::default();
        let Some(slots) = obj.get("slots").and_then(Value::as_array) else {
            return;
        };
        for entry in slots {
            let Some(slot) = entry.get("slot").and_then(Value::as_u64) else {
                continue;
            };
            let label = entry
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or("Clip");
            self.set(slot as usize, Some(Clip::new(label)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_and_stop() {
        let mut slots = ClipSlots::new();
        slots.set(2, Some(Clip::new("intro")));
        assert!(!slots.any_running());

        slots.trigger(2);
        assert!(slots.get(2).unwrap().is_running());

        // Triggering an empty slot is a no-op.
        slots.trigger(0);

        slots.stop_all();
        assert!(!slots.any_running());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut slots = ClipSlots::new();
        slots.set(0, Some(Clip::new("a")));
        slots.set(4, Some(Clip::new("b")));

        let mut restored = ClipSlots::new();
        restored.load(&slots.save());
        assert_eq!(restored.get(0).unwrap().label, "a");
        assert_eq!(restored.get(4).unwrap().label, "b");
        assert!(restored.get(1).is_none());
    }
}

// src/engine.rs
//
// The frame scheduler and engine state.
//
// One call to `run()` produces one frame: advance time, pump input
// dispatchers, tick the time-based collaborators, drain marshalled
// tasks, run the channel pipeline, mix, apply master effects, publish
// through the double buffer, and hand the frame to the output stage.
//
// Three orthogonal thread modes:
//   - engine-threaded: `start()` moves the engine onto a dedicated
//     thread that calls `run()` at the target frame rate; the caller
//     keeps an `EngineHandle` with the thread-safe surface.
//   - channel-threaded: each channel runs on a persistent worker,
//     signaled per frame and collected before the mixer.
//   - network-threaded: the output stage runs on its own worker fed by
//     the published frame.
//
// Mode transitions are applied only at frame boundaries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::blend::{Blend, channel_blends, crossfader_blends};
use crate::channel::{Channel, ChannelCore, ChannelId, MasterChannel};
use crate::clip::SCENE_COUNT;
use crate::color::Argb;
use crate::double_buffer::{DoubleBuffer, UiFrame};
use crate::effect::EffectRegistry;
use crate::error::EngineError;
use crate::mixer::{ChannelInput, MixParams, Mixer};
use crate::output::{NetworkWorker, Output};
use crate::parameter::{
    BooleanParameter, BoundedParameter, CompoundParameter, DiscreteParameter, ObjectParameter,
    Polarity, Units,
};
use crate::pattern::{ChasePattern, Pattern, PatternRegistry};
use crate::worker::ChannelWorker;

/// A one-shot action marshalled from any thread onto the engine thread.
pub type Task = Box<dyn FnOnce(&mut Engine) + Send>;

/// An input dispatcher hook, invoked once per frame to drain its queue.
pub trait EventPump: Send {
    fn dispatch(&mut self);

    fn save(&self) -> Value {
        json!({})
    }

    fn load(&mut self, _obj: &Value) {}
}

/// A time-advancing collaborator or per-frame loop task.
pub trait LoopTarget: Send {
    fn tick(&mut self, _delta_ms: f64) {}

    fn save(&self) -> Value {
        json!({})
    }

    fn load(&mut self, _obj: &Value) {}
}

/// Structural change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    ChannelAdded(ChannelId),
    ChannelRemoved(ChannelId),
    ChannelMoved(ChannelId, usize),
}

/// Deferred side effects recorded by parameter listeners. The outer
/// mutation drains these after unwinding, so cue exclusivity and scene
/// triggers never re-enter listener dispatch.
enum Intent {
    CueAEngaged,
    CueBEngaged,
    ChannelCueEngaged,
    SceneFired(usize),
}

type IntentQueue = Arc<Mutex<Vec<Intent>>>;

/// The synchronized once-task list: any thread appends, only the engine
/// thread drains. A task that enqueues more tasks defers them to the
/// next frame because the drain swaps the whole list out first.
pub struct TaskQueue {
    queue: Mutex<Vec<Task>>,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, task: Task) {
        self.queue.lock().push(task);
    }

    fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.queue.lock())
    }
}

/// Per-frame timing counters, in nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Profiler {
    pub run_nanos: u64,
    pub channel_nanos: u64,
    pub effect_nanos: u64,
    pub midi_nanos: u64,
    pub osc_nanos: u64,
    pub input_nanos: u64,
}

pub struct Engine {
    num_points: usize,

    // Input dispatchers, pumped once per frame.
    pub(crate) midi: Option<Box<dyn EventPump>>,
    pub(crate) osc: Option<Box<dyn EventPump>>,
    input: Option<Box<dyn EventPump>>,

    // Wall-clock collaborators (unscaled dt) and animation collaborators
    // (speed-scaled dt).
    pub(crate) tempo: Option<Box<dyn LoopTarget>>,
    pub(crate) audio: Option<Box<dyn LoopTarget>>,
    pub(crate) modulation: Option<Box<dyn LoopTarget>>,
    pub(crate) palette: Option<Box<dyn LoopTarget>>,
    loop_tasks: Vec<Arc<Mutex<dyn LoopTarget>>>,

    // User components registered for persistence.
    pub(crate) components: Vec<(String, Box<dyn LoopTarget>)>,

    // Channels. The flat list holds every channel including group
    // members; `index` on each core mirrors its position here.
    channels: Vec<Channel>,
    next_channel_id: ChannelId,
    pub master: MasterChannel,

    // Mixing.
    mixer: Mixer,
    channel_blend_set: Vec<Arc<dyn Blend>>,
    pub crossfader_blend: ObjectParameter<dyn Blend>,
    pub crossfader: CompoundParameter,
    pub(crate) cue_a: BooleanParameter,
    pub(crate) cue_b: BooleanParameter,

    // Engine parameters.
    pub speed: BoundedParameter,
    pub frames_per_second: BoundedParameter,
    pub paused: BooleanParameter,
    pub focused_channel: DiscreteParameter,
    pub focused_clip: DiscreteParameter,
    scenes: [BooleanParameter; SCENE_COUNT],

    // Registries for persistence reconstruction.
    pub patterns: PatternRegistry,
    pub effects: EffectRegistry,

    // Timing.
    epoch: Instant,
    last_millis: Option<f64>,
    fixed_delta_ms: Option<f64>,
    pub profiler: Profiler,
    actual_fps: f64,

    // Thread modes.
    engine_threaded: bool,
    host_driven: bool,
    pub channel_multithreaded: BooleanParameter,
    pub network_multithreaded: BooleanParameter,
    channel_threaded_active: bool,
    network_worker: Option<NetworkWorker>,

    // Buffers and output.
    buffer: DoubleBuffer,
    output: Arc<Mutex<Output>>,

    // Queues and listeners.
    tasks: Arc<TaskQueue>,
    intents: IntentQueue,
    listeners: Vec<(u64, Box<dyn FnMut(&EngineEvent) + Send>)>,
    next_listener: u64,
}

impl Engine {
    /// Construct an engine for a model of `num_points` color points.
    ///
    /// Initialization order matters: buffers, then blends, then engine
    /// parameters, then the master channel, then listeners. Later
    /// pieces assume the earlier ones exist.
    pub fn new(num_points: usize) -> Self {
        let mixer = Mixer::new(num_points);
        let buffer = DoubleBuffer::new(num_points);

        let channel_blend_set = channel_blends();
        let mut crossfader_blend = ObjectParameter::new("crossfaderBlendMode", crossfader_blends());
        crossfader_blend
            .bind("/lumen/engine/crossfaderBlendMode")
            .expect("fresh parameter");

        let mut crossfader =
            CompoundParameter::new("crossfader", 0.5, 0.0, 1.0).polarity(Polarity::Bipolar);
        crossfader
            .base_mut()
            .bind("/lumen/engine/crossfader")
            .expect("fresh parameter");

        let mut cue_a = BooleanParameter::new("cueA", false);
        let mut cue_b = BooleanParameter::new("cueB", false);
        cue_a.bind("/lumen/engine/cueA").expect("fresh parameter");
        cue_b.bind("/lumen/engine/cueB").expect("fresh parameter");

        let mut speed = BoundedParameter::new("speed", 1.0, 0.0, 2.0);
        let mut frames_per_second =
            BoundedParameter::new("framesPerSecond", 60.0, 0.0, 300.0).units(Units::Fps);
        let mut paused = BooleanParameter::new("paused", false);
        let mut focused_channel = DiscreteParameter::new("focusedChannel", 0, 1);
        let mut focused_clip = DiscreteParameter::new("focusedClip", 0, SCENE_COUNT);
        speed.bind("/lumen/engine/speed").expect("fresh parameter");
        frames_per_second
            .bind("/lumen/engine/framesPerSecond")
            .expect("fresh parameter");
        paused.bind("/lumen/engine/paused").expect("fresh parameter");
        focused_channel
            .bind("/lumen/engine/focusedChannel")
            .expect("fresh parameter");
        focused_clip
            .bind("/lumen/engine/focusedClip")
            .expect("fresh parameter");

        let mut channel_multithreaded = BooleanParameter::new("channelMultithreaded", false);
        let mut network_multithreaded = BooleanParameter::new("networkMultithreaded", false);
        channel_multithreaded
            .bind("/lumen/engine/channelMultithreaded")
            .expect("fresh parameter");
        network_multithreaded
            .bind("/lumen/engine/networkMultithreaded")
            .expect("fresh parameter");

        let scenes = std::array::from_fn(|i| {
            let mut scene = BooleanParameter::new(format!("scene-{}", i + 1), false);
            scene
                .bind(format!("/lumen/engine/scene/{}", i + 1))
                .expect("fresh parameter");
            scene
        });

        let intents: IntentQueue = Arc::new(Mutex::new(Vec::new()));

        let mut engine = Self {
            num_points,
            midi: None,
            osc: None,
            input: None,
            tempo: None,
            audio: None,
            modulation: None,
            palette: None,
            loop_tasks: Vec::new(),
            components: Vec::new(),
            channels: Vec::new(),
            next_channel_id: 0,
            master: MasterChannel::new(),
            mixer,
            channel_blend_set,
            crossfader_blend,
            crossfader,
            cue_a,
            cue_b,
            speed,
            frames_per_second,
            paused,
            focused_channel,
            focused_clip,
            scenes,
            patterns: PatternRegistry::with_standard(),
            effects: EffectRegistry::with_standard(),
            epoch: Instant::now(),
            last_millis: None,
            fixed_delta_ms: None,
            profiler: Profiler::default(),
            actual_fps: 0.0,
            engine_threaded: false,
            host_driven: false,
            channel_multithreaded,
            network_multithreaded,
            channel_threaded_active: false,
            network_worker: None,
            buffer,
            output: Arc::new(Mutex::new(Output::new("root", num_points))),
            tasks: Arc::new(TaskQueue::new()),
            intents,
            listeners: Vec::new(),
            next_listener: 0,
        };
        engine.wire_cue_listeners();
        engine
    }

    fn wire_cue_listeners(&mut self) {
        let intents = Arc::clone(&self.intents);
        self.cue_a.add_listener(Box::new(move |on| {
            if on {
                intents.lock().push(Intent::CueAEngaged);
            }
        }));
        let intents = Arc::clone(&self.intents);
        self.cue_b.add_listener(Box::new(move |on| {
            if on {
                intents.lock().push(Intent::CueBEngaged);
            }
        }));
        for (i, scene) in self.scenes.iter_mut().enumerate() {
            let intents = Arc::clone(&self.intents);
            scene.add_listener(Box::new(move |on| {
                if on {
                    intents.lock().push(Intent::SceneFired(i));
                }
            }));
        }
    }

    #[inline]
    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn path(&self) -> &'static str {
        "/lumen/engine"
    }

    /// Measured frame rate: min(1000/frame_ms, target).
    pub fn actual_frames_per_second(&self) -> f64 {
        self.actual_fps
    }

    // ───────────────────────────────────────────────────────────────
    // Collaborators
    // ───────────────────────────────────────────────────────────────

    pub fn set_midi(&mut self, pump: Box<dyn EventPump>) {
        self.midi = Some(pump);
    }

    pub fn set_osc(&mut self, pump: Box<dyn EventPump>) {
        self.osc = Some(pump);
    }

    pub fn set_input(&mut self, pump: Box<dyn EventPump>) {
        self.input = Some(pump);
    }

    pub fn set_tempo(&mut self, target: Box<dyn LoopTarget>) {
        self.tempo = Some(target);
    }

    pub fn set_audio(&mut self, target: Box<dyn LoopTarget>) {
        self.audio = Some(target);
    }

    pub fn set_modulation(&mut self, target: Box<dyn LoopTarget>) {
        self.modulation = Some(target);
    }

    pub fn set_palette(&mut self, target: Box<dyn LoopTarget>) {
        self.palette = Some(target);
    }

    /// Register a per-frame hook. Each task registers exactly once.
    pub fn add_loop_task(&mut self, task: Arc<Mutex<dyn LoopTarget>>) -> Result<(), EngineError> {
        if self.loop_tasks.iter().any(|t| Arc::ptr_eq(t, &task)) {
            return Err(EngineError::DuplicateLoopTask);
        }
        self.loop_tasks.push(task);
        Ok(())
    }

    pub fn remove_loop_task(
        &mut self,
        task: &Arc<Mutex<dyn LoopTarget>>,
    ) -> Result<(), EngineError> {
        let before = self.loop_tasks.len();
        self.loop_tasks.retain(|t| !Arc::ptr_eq(t, task));
        if self.loop_tasks.len() == before {
            return Err(EngineError::UnknownLoopTask);
        }
        Ok(())
    }

    /// Register a user component under the persistence tree.
    pub fn register_component(&mut self, key: impl Into<String>, component: Box<dyn LoopTarget>) {
        self.components.push((key.into(), component));
    }

    /// Enqueue a one-shot engine-thread action. Safe from any thread via
    /// `tasks()`; the queue is drained once per frame.
    pub fn add_task(&self, task: Task) {
        self.tasks.add(task);
    }

    /// The shareable once-task queue, for foreign threads.
    pub fn tasks(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.tasks)
    }

    // ───────────────────────────────────────────────────────────────
    // Channels
    // ───────────────────────────────────────────────────────────────

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn channel_core(&self, id: ChannelId) -> Option<Arc<Mutex<ChannelCore>>> {
        self.channel(id).map(|c| Arc::clone(c.core()))
    }

    fn channel_position(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| c.id == id)
    }

    /// Add a channel with one default pattern.
    pub fn add_channel(&mut self) -> ChannelId {
        self.add_channel_with_patterns(vec![Box::new(ChasePattern::default())])
    }

    pub fn add_channel_with_patterns(&mut self, patterns: Vec<Box<dyn Pattern>>) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        let core = ChannelCore::new(
            id,
            format!("Channel {}", id + 1),
            self.num_points,
            self.channel_blend_set.clone(),
            patterns,
        );
        self.install_channel(Channel::new(core))
    }

    pub fn add_group(&mut self) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        let core = ChannelCore::new_group(
            id,
            format!("Group {}", id + 1),
            self.num_points,
            self.channel_blend_set.clone(),
        );
        self.install_channel(Channel::new(core))
    }

    fn install_channel(&mut self, channel: Channel) -> ChannelId {
        let id = channel.id;
        {
            let intents = Arc::clone(&self.intents);
            channel.core().lock().cue_active.add_listener(Box::new(move |on| {
                if on {
                    intents.lock().push(Intent::ChannelCueEngaged);
                }
            }));
        }
        self.channels.push(channel);
        self.reindex_channels();
        self.focused_channel.set_cardinality(self.channels.len() + 1);
        self.fire_event(EngineEvent::ChannelAdded(id));
        id
    }

    /// Remove a channel the engine owns. Removing a group unlinks its
    /// members first; they stay in the top-level list.
    pub fn remove_channel(&mut self, id: ChannelId) -> Result<(), EngineError> {
        let position = self
            .channel_position(id)
            .ok_or(EngineError::UnknownChannel(id))?;

        let core = Arc::clone(self.channels[position].core());
        let (is_group, children, parent) = {
            let core = core.lock();
            (core.is_group(), core.children().to_vec(), core.group())
        };

        if is_group {
            for child in children {
                if let Some(child_core) = self.channel_core(child) {
                    child_core.lock().set_group(None);
                }
            }
        }
        if let Some(parent) = parent {
            if let Some(parent_core) = self.channel_core(parent) {
                parent_core.lock().children_mut().retain(|c| *c != id);
            }
        }

        // Dropping the handle interrupts and joins any worker thread.
        self.channels.remove(position);
        self.reindex_channels();

        let focus = self.focused_channel.index();
        self.focused_channel
            .set_cardinality(self.channels.len() + 1);
        if focus >= position && focus > 0 {
            self.focused_channel.set_index(focus - 1);
        }
        self.focused_channel.bang();

        self.fire_event(EngineEvent::ChannelRemoved(id));
        Ok(())
    }

    /// Remove every channel whose `selected` parameter is on.
    pub fn remove_selected_channels(&mut self) -> Result<(), EngineError> {
        let selected: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|c| c.core().lock().selected.is_on())
            .map(|c| c.id)
            .collect();
        for id in selected {
            self.remove_channel(id)?;
        }
        Ok(())
    }

    pub fn move_channel(&mut self, id: ChannelId, index: usize) -> Result<(), EngineError> {
        let position = self
            .channel_position(id)
            .ok_or(EngineError::UnknownChannel(id))?;
        if index >= self.channels.len() {
            return Err(EngineError::IndexOutOfRange {
                index,
                len: self.channels.len(),
            });
        }
        let channel = self.channels.remove(position);
        self.channels.insert(index, channel);
        self.reindex_channels();
        self.fire_event(EngineEvent::ChannelMoved(id, index));
        Ok(())
    }

    /// Put a leaf channel into a group.
    pub fn add_to_group(&mut self, group: ChannelId, channel: ChannelId) -> Result<(), EngineError> {
        let group_core = self
            .channel_core(group)
            .ok_or(EngineError::UnknownChannel(group))?;
        let channel_core = self
            .channel_core(channel)
            .ok_or(EngineError::UnknownChannel(channel))?;
        {
            let group_guard = group_core.lock();
            if !group_guard.is_group() {
                return Err(EngineError::WrongChannelKind(group));
            }
        }
        {
            let mut channel_guard = channel_core.lock();
            if channel_guard.is_group() {
                return Err(EngineError::WrongChannelKind(channel));
            }
            if channel_guard.group() == Some(group) {
                return Ok(());
            }
            if let Some(previous) = channel_guard.group() {
                if let Some(previous_core) = self.channel_core(previous) {
                    previous_core.lock().children_mut().retain(|c| *c != channel);
                }
            }
            channel_guard.set_group(Some(group));
        }
        group_core.lock().children_mut().push(channel);
        Ok(())
    }

    /// Detach a channel from its group, keeping it top-level.
    pub fn ungroup(&mut self, id: ChannelId) -> Result<(), EngineError> {
        let core = self
            .channel_core(id)
            .ok_or(EngineError::UnknownChannel(id))?;
        let parent = core.lock().group().ok_or(EngineError::NotGrouped(id))?;
        if let Some(parent_core) = self.channel_core(parent) {
            parent_core.lock().children_mut().retain(|c| *c != id);
        }
        core.lock().set_group(None);
        Ok(())
    }

    /// Remove every channel, without firing per-channel focus updates.
    pub(crate) fn clear_channels(&mut self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|c| c.id).collect();
        self.channels.clear();
        self.focused_channel.set_cardinality(1);
        for id in ids {
            self.fire_event(EngineEvent::ChannelRemoved(id));
        }
    }

    fn reindex_channels(&mut self) {
        for (i, channel) in self.channels.iter().enumerate() {
            channel.core().lock().set_index(i);
        }
    }

    pub fn add_listener(&mut self, listener: Box<dyn FnMut(&EngineEvent) + Send>) -> u64 {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn fire_event(&mut self, event: EngineEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Cue and scenes
    // ───────────────────────────────────────────────────────────────

    /// Engage or release the A-bus cue preview. Engaging clears cueB and
    /// every channel cue through the intent queue.
    pub fn set_cue_a(&mut self, on: bool) {
        self.cue_a.set_value(on);
        self.drain_intents();
    }

    pub fn set_cue_b(&mut self, on: bool) {
        self.cue_b.set_value(on);
        self.drain_intents();
    }

    pub fn cue_a_on(&self) -> bool {
        self.cue_a.is_on()
    }

    pub fn cue_b_on(&self) -> bool {
        self.cue_b.is_on()
    }

    /// Engage or release one channel's cue. Engaging clears cueA/cueB;
    /// multiple channel cues may be active at once (the cue bus is
    /// additive).
    pub fn set_channel_cue(&mut self, id: ChannelId, on: bool) -> Result<(), EngineError> {
        let core = self
            .channel_core(id)
            .ok_or(EngineError::UnknownChannel(id))?;
        core.lock().cue_active.set_value(on);
        self.drain_intents();
        Ok(())
    }

    /// Fire scene `index`: an edge trigger that launches the scene and
    /// resets itself.
    pub fn trigger_scene(&mut self, index: usize) {
        if index < SCENE_COUNT {
            self.scenes[index].set_value(true);
            self.drain_intents();
        }
    }

    /// Trigger the clip at `slot` on every channel and the master.
    pub fn launch_scene(&mut self, slot: usize) {
        for channel in &self.channels {
            channel.core().lock().clips.trigger(slot);
        }
        self.master.clips.trigger(slot);
    }

    /// Stop every running clip on every channel and the master.
    pub fn stop_clips(&mut self) {
        for channel in &self.channels {
            channel.core().lock().clips.stop_all();
        }
        self.master.clips.stop_all();
    }

    pub(crate) fn drain_intents(&mut self) {
        loop {
            let batch = std::mem::take(&mut *self.intents.lock());
            if batch.is_empty() {
                return;
            }
            for intent in batch {
                match intent {
                    Intent::CueAEngaged => {
                        self.cue_b.set_value(false);
                        self.clear_channel_cues();
                    }
                    Intent::CueBEngaged => {
                        self.cue_a.set_value(false);
                        self.clear_channel_cues();
                    }
                    Intent::ChannelCueEngaged => {
                        // Channel cues are additive among themselves but
                        // exclusive with the bus cues.
                        self.cue_a.set_value(false);
                        self.cue_b.set_value(false);
                    }
                    Intent::SceneFired(index) => {
                        self.launch_scene(index);
                        self.scenes[index].set_value(false);
                    }
                }
            }
        }
    }

    fn clear_channel_cues(&mut self) {
        for channel in &self.channels {
            channel.core().lock().cue_active.set_value(false);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Timing and modes
    // ───────────────────────────────────────────────────────────────

    fn now_millis(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Force a deterministic per-frame delta. A non-positive value
    /// restores wall-clock timing.
    pub fn set_fixed_delta_ms(&mut self, delta_ms: f64) {
        self.fixed_delta_ms = (delta_ms > 0.0).then_some(delta_ms);
    }

    /// Host-driven mode: the embedding host calls `run()` from its own
    /// draw loop and `start()`/`stop()` are contract errors.
    pub fn set_host_driven(&mut self, host_driven: bool) {
        self.host_driven = host_driven;
    }

    pub fn set_channel_multithreaded(&mut self, on: bool) {
        self.channel_multithreaded.set_value(on);
    }

    pub fn set_network_multithreaded(&mut self, on: bool) {
        self.network_multithreaded.set_value(on);
    }

    pub fn is_channel_multithreaded(&self) -> bool {
        self.channel_multithreaded.is_on()
    }

    pub fn is_network_multithreaded(&self) -> bool {
        self.network_worker.is_some()
    }

    /// Apply pending thread-mode parameters. Called at the top of each
    /// frame so transitions only ever happen at frame boundaries.
    fn apply_thread_modes(&mut self) {
        let want_channel = self.channel_multithreaded.is_on();
        if self.channel_threaded_active && !want_channel {
            debug!("leaving channel-threaded mode");
            for channel in &mut self.channels {
                channel.worker = None;
            }
        } else if !self.channel_threaded_active && want_channel {
            debug!("entering channel-threaded mode");
        }
        self.channel_threaded_active = want_channel;

        let want_network = self.network_multithreaded.is_on();
        if want_network && self.network_worker.is_none() {
            info!("starting network-threaded output");
            // The promoted consumer side must hold a complete frame
            // before the worker's first read.
            self.buffer.sync();
            self.buffer.flip();
            self.network_worker = Some(NetworkWorker::start(
                self.buffer.shared(),
                Arc::clone(&self.output),
                self.num_points,
                self.epoch,
            ));
        } else if !want_network && self.network_worker.is_some() {
            info!("stopping network-threaded output");
            self.network_worker = None;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // The frame
    // ───────────────────────────────────────────────────────────────

    /// Advance one frame.
    pub fn run(&mut self) {
        let frame_start = Instant::now();

        // 1-2: frame delta, with the fixed override for offline render.
        let now_millis = self.now_millis();
        let mut delta_ms = match self.last_millis {
            Some(last) => now_millis - last,
            None => 16.0,
        };
        self.last_millis = Some(now_millis);
        if let Some(fixed) = self.fixed_delta_ms {
            delta_ms = fixed;
        }

        // 3: paused frames leave every buffer untouched.
        if self.paused.is_on() {
            self.profiler.channel_nanos = 0;
            self.profiler.effect_nanos = 0;
            self.profiler.run_nanos = frame_start.elapsed().as_nanos() as u64;
            return;
        }

        self.apply_thread_modes();

        // 4: input dispatchers.
        if let Some(midi) = &mut self.midi {
            let t = Instant::now();
            midi.dispatch();
            self.profiler.midi_nanos = t.elapsed().as_nanos() as u64;
        }
        if let Some(osc) = &mut self.osc {
            let t = Instant::now();
            osc.dispatch();
            self.profiler.osc_nanos = t.elapsed().as_nanos() as u64;
        }
        if let Some(input) = &mut self.input {
            let t = Instant::now();
            input.dispatch();
            self.profiler.input_nanos = t.elapsed().as_nanos() as u64;
        }

        // 5: tempo and audio follow wall-clock time.
        if let Some(tempo) = &mut self.tempo {
            tempo.tick(delta_ms);
        }
        if let Some(audio) = &mut self.audio {
            audio.tick(delta_ms);
        }

        // 6-7: everything after this runs on scaled time.
        let scaled_ms = delta_ms * self.speed.value();
        if let Some(modulation) = &mut self.modulation {
            modulation.tick(scaled_ms);
        }
        if let Some(palette) = &mut self.palette {
            palette.tick(scaled_ms);
        }
        for task in &self.loop_tasks {
            task.lock().tick(scaled_ms);
        }
        for (_, component) in &mut self.components {
            component.tick(scaled_ms);
        }

        // 8: marshalled once-tasks, in enqueue order. Tasks added during
        // the drain land in the next frame's batch.
        let tasks = self.tasks.drain();
        for task in tasks {
            task(self);
        }
        self.drain_intents();

        // 9: channel pipeline.
        let channel_start = Instant::now();
        if self.channel_threaded_active {
            for channel in &mut self.channels {
                let core = Arc::clone(channel.core());
                let id = channel.id;
                channel
                    .worker
                    .get_or_insert_with(|| ChannelWorker::start(&id.to_string(), core))
                    .request(scaled_ms);
            }
            for channel in &self.channels {
                if let Some(worker) = &channel.worker {
                    worker.collect();
                }
            }
        } else {
            for channel in &self.channels {
                channel.core().lock().loop_frame(scaled_ms);
            }
        }
        self.master.loop_frame(scaled_ms);
        self.composite_groups();
        self.profiler.channel_nanos = channel_start.elapsed().as_nanos() as u64;

        // 10: mix.
        let crossfade_blend = Arc::clone(self.crossfader_blend.selected());
        let params = MixParams {
            crossfader: self.crossfader.value(),
            cue_a: self.cue_a.is_on(),
            cue_b: self.cue_b.is_on(),
        };
        let cue_on = {
            let guards: Vec<_> = self.channels.iter().map(|c| c.core().lock()).collect();
            let inputs: Vec<ChannelInput<'_>> = guards
                .iter()
                .map(|core| ChannelInput {
                    colors: core.colors(),
                    fader: core.fader.value(),
                    blend: Arc::clone(core.blend_mode.selected()),
                    crossfade_group: core.crossfade_group.value(),
                    enabled: core.enabled.is_on(),
                    animating: core.is_animating(),
                    cue_active: core.cue_active.is_on(),
                    grouped: core.group().is_some(),
                })
                .collect();
            self.mixer.mix(&inputs, &crossfade_blend, params)
        };

        // 11: master effects over the mixed output.
        let effect_start = Instant::now();
        self.master.apply_effects(self.mixer.main_mut());
        self.profiler.effect_nanos = effect_start.elapsed().as_nanos() as u64;

        // 12: publish. The flip is only needed when a consumer thread
        // may be reading; single-threaded hosts read the render side.
        self.buffer.render_main_mut().copy_from(self.mixer.main());
        self.buffer.render_cue_mut().copy_from(self.mixer.cue());
        self.buffer.set_cue_on(cue_on);
        if self.engine_threaded || self.network_worker.is_some() {
            self.buffer.flip();
        }

        // 13: output, inline or via the network worker.
        if let Some(worker) = &self.network_worker {
            worker.notify();
        } else {
            self.output.lock().send(self.mixer.main(), now_millis);
        }

        // 14: frame accounting.
        self.profiler.run_nanos = frame_start.elapsed().as_nanos() as u64;
        let frame_ms = self.profiler.run_nanos as f64 / 1_000_000.0;
        let target = self.frames_per_second.value();
        self.actual_fps = if frame_ms > 0.0 {
            (1000.0 / frame_ms).min(target)
        } else {
            target
        };
    }

    /// Composite every group's sub-channels into the group buffer, in
    /// channel order, after all leaf work is collected.
    fn composite_groups(&mut self) {
        let group_ids: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|c| c.core().lock().is_group())
            .map(|c| c.id)
            .collect();

        for group_id in group_ids {
            let Some(group_core) = self.channel_core(group_id) else {
                continue;
            };
            let children = group_core.lock().children().to_vec();
            let child_cores: Vec<Arc<Mutex<ChannelCore>>> = children
                .iter()
                .filter_map(|id| self.channel_core(*id))
                .collect();
            let guards: Vec<_> = child_cores.iter().map(|c| c.lock()).collect();
            let contributions: Vec<crate::channel::GroupContribution<'_>> = guards
                .iter()
                .map(|core| crate::channel::GroupContribution {
                    colors: core.colors(),
                    fader: core.fader.value(),
                    blend: Arc::clone(core.blend_mode.selected()),
                    active: core.enabled.is_on() && core.is_animating(),
                })
                .collect();
            group_core
                .lock()
                .composite_children(self.mixer.background(), &contributions);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Buffers and output
    // ───────────────────────────────────────────────────────────────

    /// Threaded read of the published frame.
    pub fn copy_ui_buffer(&self, dst: &mut [Argb]) {
        self.buffer.copy_ui_buffer(dst);
    }

    /// Single-threaded read of the just-rendered frame. Not safe while
    /// any engine or network thread runs.
    pub fn ui_buffer_non_thread_safe(&self) -> &[Argb] {
        self.buffer.front()
    }

    /// Attach a sink under the output root.
    pub fn add_output(&mut self, sink: Output) {
        self.output.lock().add_child(sink);
    }

    pub fn output(&self) -> Arc<Mutex<Output>> {
        Arc::clone(&self.output)
    }

    // ───────────────────────────────────────────────────────────────
    // Engine thread
    // ───────────────────────────────────────────────────────────────

    /// Move the engine onto a dedicated thread running `run()` at the
    /// target frame rate. Both double-buffer pairs are synchronized
    /// first so consumers never observe a half-written frame.
    pub fn start(mut self) -> Result<EngineHandle, EngineError> {
        if self.host_driven {
            return Err(EngineError::HostDriven);
        }
        self.buffer.sync();
        self.buffer.flip();
        self.engine_threaded = true;

        let shared = Arc::new(EngineShared {
            tasks: Arc::clone(&self.tasks),
            frame: self.buffer.shared(),
            interrupt: AtomicBool::new(false),
            running: AtomicBool::new(true),
        });
        let thread_shared = Arc::clone(&shared);

        info!("starting engine thread");
        let thread = thread::Builder::new()
            .name("lumen-engine".into())
            .spawn(move || {
                while !thread_shared.interrupt.load(Ordering::Acquire) {
                    let frame_start = Instant::now();
                    self.run();
                    let target = self.frames_per_second.value();
                    if target > 0.0 {
                        let frame_ms = frame_start.elapsed().as_secs_f64() * 1000.0;
                        let sleep_ms = (1000.0 / target - frame_ms).max(0.0);
                        if sleep_ms > 0.0 {
                            thread::sleep(Duration::from_secs_f64(sleep_ms / 1000.0));
                        }
                    }
                }
                thread_shared.running.store(false, Ordering::Release);
                self.engine_threaded = false;
                self
            })
            .map_err(|_| EngineError::ThreadSpawn)?;

        Ok(EngineHandle { shared, thread })
    }
}

/// The thread-safe surface shared between an engine thread and its
/// handle.
struct EngineShared {
    tasks: Arc<TaskQueue>,
    frame: Arc<Mutex<UiFrame>>,
    interrupt: AtomicBool,
    running: AtomicBool,
}

/// Host-side handle to a running engine thread. Foreign threads reach
/// the engine only through the once-task queue and the published frame;
/// `stop` interrupts, joins, and returns the engine.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    thread: JoinHandle<Engine>,
}

impl EngineHandle {
    /// Enqueue a one-shot engine-thread action.
    pub fn add_task(&self, task: Task) {
        self.shared.tasks.add(task);
    }

    /// Copy the most recently published frame.
    pub fn copy_ui_buffer(&self, dst: &mut [Argb]) {
        self.shared.frame.lock().copy_to(dst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Interrupt the engine thread, join it, and take the engine back.
    /// A failed join is a fatal mode-transition error; engine state is
    /// lost with the thread.
    pub fn stop(self) -> Result<Engine, EngineError> {
        info!("stopping engine thread");
        self.shared.interrupt.store(true, Ordering::Release);
        self.thread.join().map_err(|_| EngineError::ThreadJoin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CrossfadeGroup;
    use crate::color::{BLACK, rgb};
    use crate::pattern::SolidPattern;
    use std::sync::atomic::AtomicUsize;

    fn solid_channel(engine: &mut Engine, color: Argb, group: CrossfadeGroup) -> ChannelId {
        let id = engine.add_channel_with_patterns(vec![Box::new(SolidPattern::new(color))]);
        let core = engine.channel_core(id).unwrap();
        let mut core = core.lock();
        core.fader.set_value(1.0);
        core.crossfade_group.set_value(group);
        id
    }

    #[test]
    fn test_zero_channels_leaves_background() {
        let mut engine = Engine::new(16);
        engine.run();
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == BLACK)
        );
    }

    #[test]
    fn test_solo_bypass_channel_on_main() {
        let mut engine = Engine::new(16);
        solid_channel(&mut engine, rgb(255, 0, 0), CrossfadeGroup::Bypass);
        engine.run();
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == rgb(255, 0, 0))
        );
    }

    #[test]
    fn test_fader_zero_is_background() {
        let mut engine = Engine::new(16);
        let id = solid_channel(&mut engine, rgb(255, 0, 0), CrossfadeGroup::Bypass);
        engine
            .channel_core(id)
            .unwrap()
            .lock()
            .fader
            .set_value(0.0);
        engine.run();
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == BLACK)
        );
    }

    #[test]
    fn test_crossfade_center_dissolve() {
        let mut engine = Engine::new(16);
        solid_channel(&mut engine, rgb(255, 0, 0), CrossfadeGroup::A);
        solid_channel(&mut engine, rgb(0, 255, 0), CrossfadeGroup::B);
        engine.crossfader.set_value(0.5);
        engine.run();
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == rgb(128, 128, 0))
        );
    }

    #[test]
    fn test_pause_freezes_buffers() {
        let mut engine = Engine::new(16);
        let id = solid_channel(&mut engine, rgb(10, 20, 30), CrossfadeGroup::Bypass);
        engine.run();
        let before = engine.ui_buffer_non_thread_safe().to_vec();

        engine.paused.set_value(true);
        // Mutations while paused must not reach the buffers.
        engine
            .channel_core(id)
            .unwrap()
            .lock()
            .fader
            .set_value(0.0);
        for _ in 0..10 {
            engine.run();
        }
        assert_eq!(engine.ui_buffer_non_thread_safe(), &before[..]);
    }

    #[test]
    fn test_fixed_delta_is_deterministic() {
        let build = || {
            let mut engine = Engine::new(16);
            engine.set_fixed_delta_ms(16.0);
            let id = engine.add_channel();
            let core = engine.channel_core(id).unwrap();
            core.lock().fader.set_value(1.0);
            engine
        };
        let mut a = build();
        let mut b = build();
        for _ in 0..20 {
            a.run();
            b.run();
        }
        assert_eq!(
            a.ui_buffer_non_thread_safe(),
            b.ui_buffer_non_thread_safe()
        );
    }

    #[test]
    fn test_channel_index_tracks_position() {
        let mut engine = Engine::new(8);
        let a = engine.add_channel();
        let b = engine.add_channel();
        let c = engine.add_channel();

        engine.move_channel(c, 0).unwrap();
        let index_of = |engine: &Engine, id| {
            engine.channel_core(id).unwrap().lock().index()
        };
        assert_eq!(index_of(&engine, c), 0);
        assert_eq!(index_of(&engine, a), 1);
        assert_eq!(index_of(&engine, b), 2);

        engine.remove_channel(a).unwrap();
        assert_eq!(index_of(&engine, c), 0);
        assert_eq!(index_of(&engine, b), 1);
    }

    #[test]
    fn test_remove_unknown_channel_is_error() {
        let mut engine = Engine::new(8);
        assert!(matches!(
            engine.remove_channel(42),
            Err(EngineError::UnknownChannel(42))
        ));
    }

    #[test]
    fn test_cue_exclusivity_cascade() {
        let mut engine = Engine::new(8);
        let id = engine.add_channel();

        engine.set_cue_a(true);
        assert!(engine.cue_a_on());

        engine.set_cue_b(true);
        assert!(!engine.cue_a_on());
        assert!(engine.cue_b_on());

        engine.set_channel_cue(id, true).unwrap();
        assert!(!engine.cue_a_on());
        assert!(!engine.cue_b_on());
        assert!(
            engine
                .channel_core(id)
                .unwrap()
                .lock()
                .cue_active
                .is_on()
        );

        engine.set_cue_a(true);
        assert!(
            !engine
                .channel_core(id)
                .unwrap()
                .lock()
                .cue_active
                .is_on()
        );
    }

    #[test]
    fn test_cue_preview_bus() {
        let mut engine = Engine::new(16);
        let id = solid_channel(&mut engine, rgb(0, 0, 255), CrossfadeGroup::Bypass);
        engine.set_channel_cue(id, true).unwrap();
        engine.run();

        // Non-threaded accessor follows the cue flag.
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == rgb(0, 0, 255))
        );
    }

    #[test]
    fn test_scene_trigger_resets_and_fires_clips() {
        let mut engine = Engine::new(8);
        let id = engine.add_channel();
        engine
            .channel_core(id)
            .unwrap()
            .lock()
            .clips
            .set(2, Some(crate::clip::Clip::new("hit")));

        engine.trigger_scene(2);
        assert!(
            engine
                .channel_core(id)
                .unwrap()
                .lock()
                .clips
                .get(2)
                .unwrap()
                .is_running()
        );
        // Edge trigger: the scene boolean resets itself.
        assert!(!engine.scenes[2].is_on());

        engine.stop_clips();
        assert!(
            !engine
                .channel_core(id)
                .unwrap()
                .lock()
                .clips
                .get(2)
                .unwrap()
                .is_running()
        );
    }

    #[test]
    fn test_duplicate_loop_task_is_error() {
        struct Noop;
        impl LoopTarget for Noop {}

        let mut engine = Engine::new(8);
        let task: Arc<Mutex<dyn LoopTarget>> = Arc::new(Mutex::new(Noop));
        assert!(engine.add_loop_task(Arc::clone(&task)).is_ok());
        assert!(matches!(
            engine.add_loop_task(Arc::clone(&task)),
            Err(EngineError::DuplicateLoopTask)
        ));
        assert!(engine.remove_loop_task(&task).is_ok());
        assert!(matches!(
            engine.remove_loop_task(&task),
            Err(EngineError::UnknownLoopTask)
        ));
    }

    #[test]
    fn test_tasks_run_in_order_and_defer_nested() {
        let mut engine = Engine::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks = engine.tasks();
        for i in 0..5 {
            let order = Arc::clone(&order);
            tasks.add(Box::new(move |_engine| order.lock().push(i)));
        }
        // A task that enqueues another: the nested one waits a frame.
        let nested_ran = Arc::new(AtomicBool::new(false));
        {
            let nested_ran = Arc::clone(&nested_ran);
            tasks.add(Box::new(move |engine: &mut Engine| {
                let nested_ran = Arc::clone(&nested_ran);
                engine.add_task(Box::new(move |_| {
                    nested_ran.store(true, Ordering::SeqCst);
                }));
            }));
        }

        engine.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!nested_ran.load(Ordering::SeqCst));

        engine.run();
        assert!(nested_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_foreign_thread_tasks_marshal_in_order() {
        let mut engine = Engine::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let tasks = engine.tasks();
        let producer = {
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for i in 0..1000 {
                    let seen = Arc::clone(&seen);
                    tasks.add(Box::new(move |_engine| seen.lock().push(i)));
                }
            })
        };
        producer.join().expect("producer thread");

        engine.run();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1000);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_channel_threaded_frame_matches_single_threaded() {
        let mut single = Engine::new(32);
        let mut threaded = Engine::new(32);
        for engine in [&mut single, &mut threaded] {
            engine.set_fixed_delta_ms(16.0);
            solid_channel(engine, rgb(200, 10, 0), CrossfadeGroup::Bypass);
            solid_channel(engine, rgb(0, 99, 0), CrossfadeGroup::A);
        }
        threaded.set_channel_multithreaded(true);

        for _ in 0..3 {
            single.run();
            threaded.run();
        }
        assert_eq!(
            single.ui_buffer_non_thread_safe(),
            threaded.ui_buffer_non_thread_safe()
        );

        // And back off again at a frame boundary.
        threaded.set_channel_multithreaded(false);
        threaded.run();
        single.run();
        assert_eq!(
            single.ui_buffer_non_thread_safe(),
            threaded.ui_buffer_non_thread_safe()
        );
    }

    #[test]
    fn test_group_composites_before_mixer() {
        let mut engine = Engine::new(16);
        let group = engine.add_group();
        let member = solid_channel(&mut engine, rgb(0, 200, 0), CrossfadeGroup::Bypass);
        engine.add_to_group(group, member).unwrap();
        {
            let core = engine.channel_core(group).unwrap();
            let mut core = core.lock();
            core.fader.set_value(1.0);
            core.crossfade_group.set_value(CrossfadeGroup::Bypass);
        }

        engine.run();
        assert!(
            engine
                .ui_buffer_non_thread_safe()
                .iter()
                .all(|&c| c == rgb(0, 200, 0))
        );
    }

    #[test]
    fn test_start_stop_round_trip() {
        let mut engine = Engine::new(8);
        engine.set_fixed_delta_ms(16.0);
        solid_channel(&mut engine, rgb(77, 0, 0), CrossfadeGroup::Bypass);

        let handle = engine.start().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            handle.add_task(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Wait for the marshalled task to run on the engine thread.
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Let the frame that ran the task finish publishing.
        thread::sleep(Duration::from_millis(100));
        let mut out = vec![BLACK; 8];
        handle.copy_ui_buffer(&mut out);

        let engine = handle.stop().unwrap();
        assert!(!engine.engine_threaded);
        assert!(out.iter().all(|&c| c == rgb(77, 0, 0)));
    }

    #[test]
    fn test_host_driven_forbids_start() {
        let mut engine = Engine::new(8);
        engine.set_host_driven(true);
        match engine.start() {
            Err(EngineError::HostDriven) => {}
            Ok(_) => panic!("start must fail in host-driven mode"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

// src/lib.rs
//
// Library entry point.

mod blend;
mod buffer;
mod channel;
mod clip;
mod color;
mod double_buffer;
mod effect;
mod engine;
mod error;
mod mixer;
mod output;
mod parameter;
mod pattern;
mod project;
mod worker;

// Re-export key types for consumers
pub use blend::{
    AddBlend, Blend, DissolveBlend, MultiplyBlend, NormalBlend, ScreenBlend, SubtractBlend,
    channel_blends, crossfader_blends,
};
pub use buffer::ColorBuffer;
pub use channel::{
    Channel, ChannelCore, ChannelId, CrossfadeGroup, GroupContribution, MasterChannel,
};
pub use clip::{Clip, ClipSlots, SCENE_COUNT};
pub use color::{Argb, BLACK, WHITE, argb, blue, green, hsb, red, rgb, to_hsb};
pub use double_buffer::{DoubleBuffer, UiFrame};
pub use effect::{DesaturateEffect, Effect, EffectRegistry, InvertEffect};
pub use engine::{
    Engine, EngineEvent, EngineHandle, EventPump, LoopTarget, Profiler, Task, TaskQueue,
};
pub use error::EngineError;
pub use mixer::{ChannelInput, MixParams, Mixer};
pub use output::{NetworkWorker, Output, OutputMode, OutputTransport};
pub use parameter::{
    BooleanParameter, BoundedParameter, CompoundParameter, DiscreteParameter, EnumParameter,
    ListenerId, ObjectParameter, Polarity, Units,
};
pub use pattern::{ChasePattern, GradientPattern, Pattern, PatternRegistry, SolidPattern};

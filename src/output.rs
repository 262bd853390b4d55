// src/output.rs
//
// The output stage: a tree of sinks with per-sink throttling, color
// correction, and child fanout, plus the optional network worker thread
// that decouples sending from rendering.
//
// A sink without a transport is pure fanout (the engine root is one).
// Children receive the already-corrected buffer, so correction composes
// down the tree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::debug;
use parking_lot::{Condvar, Mutex};
use serde_json::{Value, json};

use crate::buffer::ColorBuffer;
use crate::color::{self, Argb};
use crate::double_buffer::UiFrame;
use crate::parameter::{
    BooleanParameter, BoundedParameter, DiscreteParameter, EnumParameter, Units,
};

/// The wire side of a sink. The engine core never sees protocols or
/// sockets, only this capability.
pub trait OutputTransport: Send {
    fn on_send(&mut self, colors: &[Argb]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Normal,
    White,
    Raw,
    Off,
}

impl OutputMode {
    pub fn options() -> Vec<(&'static str, OutputMode)> {
        vec![
            ("Normal", OutputMode::Normal),
            ("White", OutputMode::White),
            ("Raw", OutputMode::Raw),
            ("Off", OutputMode::Off),
        ]
    }
}

/// One node of the sink tree.
pub struct Output {
    pub label: String,
    pub enabled: BooleanParameter,
    pub mode: EnumParameter<OutputMode>,
    /// 0 means uncapped.
    pub frames_per_second: BoundedParameter,
    pub gamma: DiscreteParameter,
    pub brightness: BoundedParameter,

    transport: Option<Box<dyn OutputTransport>>,
    children: Vec<Output>,

    // Reusable scratch for corrected/white/off frames. Rewritten every
    // send that needs it; not a cached constant.
    scratch: ColorBuffer,
    last_frame_millis: f64,
}

impl Output {
    pub fn new(label: impl Into<String>, num_points: usize) -> Self {
        let label = label.into();
        let path = format!("/lumen/output/{label}");

        let mut enabled = BooleanParameter::new("enabled", true);
        let mut mode = EnumParameter::new("mode", OutputMode::Normal, OutputMode::options());
        let mut frames_per_second =
            BoundedParameter::new("framesPerSecond", 0.0, 0.0, 300.0).units(Units::Fps);
        let mut gamma = DiscreteParameter::new("gammaCorrection", 0, 4);
        let mut brightness = BoundedParameter::new("brightness", 1.0, 0.0, 1.0);

        enabled.bind(format!("{path}/enabled")).expect("fresh parameter");
        mode.bind(format!("{path}/mode")).expect("fresh parameter");
        frames_per_second
            .bind(format!("{path}/framesPerSecond"))
            .expect("fresh parameter");
        gamma
            .bind(format!("{path}/gammaCorrection"))
            .expect("fresh parameter");
        brightness
            .bind(format!("{path}/brightness"))
            .expect("fresh parameter");

        Self {
            label,
            enabled,
            mode,
            frames_per_second,
            gamma,
            brightness,
            transport: None,
            children: Vec::new(),
            scratch: ColorBuffer::new(num_points),
            last_frame_millis: f64::NEG_INFINITY,
        }
    }

    pub fn with_transport(
        label: impl Into<String>,
        num_points: usize,
        transport: Box<dyn OutputTransport>,
    ) -> Self {
        let mut output = Self::new(label, num_points);
        output.transport = Some(transport);
        output
    }

    pub fn add_child(&mut self, child: Output) {
        self.children.push(child);
    }

    pub fn children(&self) -> &[Output] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Output] {
        &mut self.children
    }

    /// Send one frame through this sink and its children.
    ///
    /// `now_millis` comes from the engine clock so throttling stays
    /// consistent across the whole tree.
    pub fn send(&mut self, colors: &[Argb], now_millis: f64) {
        if !self.enabled.is_on() {
            return;
        }

        let fps = self.frames_per_second.value();
        if fps > 0.0 && now_millis - self.last_frame_millis <= 1000.0 / fps {
            return;
        }

        let gamma = self.gamma.index() as u32;
        let brightness = self.brightness.value();

        let frame: &[Argb] = match self.mode.value() {
            OutputMode::Off => {
                self.scratch.fill(color::BLACK);
                self.scratch.as_slice()
            }
            OutputMode::White => {
                self.scratch.fill(color::hsb(0.0, 0.0, 100.0 * brightness));
                self.scratch.as_slice()
            }
            OutputMode::Raw => colors,
            OutputMode::Normal => {
                if gamma > 0 || brightness < 1.0 {
                    assert_eq!(
                        colors.len(),
                        self.scratch.len(),
                        "color buffer length mismatch"
                    );
                    for (dst, &src) in self.scratch.as_mut_slice().iter_mut().zip(colors) {
                        *dst = color::corrected(src, gamma, brightness);
                    }
                    self.scratch.as_slice()
                } else {
                    colors
                }
            }
        };

        if let Some(transport) = &mut self.transport {
            transport.on_send(frame);
        }
        for child in &mut self.children {
            child.send(frame, now_millis);
        }

        self.last_frame_millis = now_millis;
    }

    pub fn save(&self) -> Value {
        let children: Vec<Value> = self.children.iter().map(Output::save).collect();
        json!({
            "label": self.label,
            "enabled": self.enabled.is_on(),
            "mode": self.mode.value_label(),
            "framesPerSecond": self.frames_per_second.value(),
            "gammaCorrection": self.gamma.index(),
            "brightness": self.brightness.value(),
            "children": children,
        })
    }

    /// Restore sink parameters. The tree shape is built by the host;
    /// children are matched positionally and extras on either side are
    /// ignored.
    pub fn load(&mut self, obj: &Value) {
        if let Some(v) = obj.get("enabled").and_then(Value::as_bool) {
            self.enabled.set_value(v);
        }
        if let Some(name) = obj.get("mode").and_then(Value::as_str) {
            if let Some(mode) = self.mode.from_label(name) {
                self.mode.set_value(mode);
            }
        }
        if let Some(v) = obj.get("framesPerSecond").and_then(Value::as_f64) {
            self.frames_per_second.set_value(v);
        }
        if let Some(v) = obj.get("gammaCorrection").and_then(Value::as_u64) {
            self.gamma.set_index(v as usize);
        }
        if let Some(v) = obj.get("brightness").and_then(Value::as_f64) {
            self.brightness.set_value(v);
        }
        if let Some(children) = obj.get("children").and_then(Value::as_array) {
            for (child, entry) in self.children.iter_mut().zip(children) {
                child.load(entry);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Network worker
// ───────────────────────────────────────────────────────────────────

struct NetworkSignal {
    pending: Mutex<bool>,
    wake: Condvar,
    interrupt: AtomicBool,
}

/// The long-running sender thread of network-threaded mode.
///
/// `notify` at frame end wakes it; it copies the published MAIN frame
/// into a private buffer under the buffer lock, then drops the lock
/// before sending so the engine can render the next frame concurrently.
pub struct NetworkWorker {
    signal: Arc<NetworkSignal>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkWorker {
    pub fn start(
        frame: Arc<Mutex<UiFrame>>,
        output: Arc<Mutex<Output>>,
        num_points: usize,
        epoch: Instant,
    ) -> Self {
        let signal = Arc::new(NetworkSignal {
            pending: Mutex::new(false),
            wake: Condvar::new(),
            interrupt: AtomicBool::new(false),
        });

        let thread_signal = Arc::clone(&signal);
        debug!("starting network output worker");
        let handle = thread::Builder::new()
            .name("network-output".into())
            .spawn(move || {
                let mut private = ColorBuffer::new(num_points);
                loop {
                    {
                        let mut pending = thread_signal.pending.lock();
                        while !*pending {
                            if thread_signal.interrupt.load(Ordering::Acquire) {
                                return;
                            }
                            thread_signal.wake.wait(&mut pending);
                        }
                        if thread_signal.interrupt.load(Ordering::Acquire) {
                            return;
                        }
                        *pending = false;
                    }

                    {
                        let frame = frame.lock();
                        private.copy_from(frame.main.as_slice());
                    }

                    let now_millis = epoch.elapsed().as_secs_f64() * 1000.0;
                    output.lock().send(private.as_slice(), now_millis);
                }
            })
            .expect("failed to spawn network worker");

        Self {
            signal,
            handle: Some(handle),
        }
    }

    /// Wake the worker to send the most recently published frame.
    pub fn notify(&self) {
        let mut pending = self.signal.pending.lock();
        *pending = true;
        self.signal.wake.notify_one();
    }
}

impl Drop for NetworkWorker {
    fn drop(&mut self) {
        self.signal.interrupt.store(true, Ordering::Release);
        self.signal.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{BLACK, rgb};
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        count: Arc<AtomicUsize>,
        last: Arc<Mutex<Vec<Argb>>>,
    }

    impl OutputTransport for Recorder {
        fn on_send(&mut self, colors: &[Argb]) {
            self.count.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = colors.to_vec();
        }
    }

    fn recorder(num_points: usize) -> (Output, Arc<AtomicUsize>, Arc<Mutex<Vec<Argb>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(Vec::new()));
        let output = Output::with_transport(
            "test",
            num_points,
            Box::new(Recorder {
                count: Arc::clone(&count),
                last: Arc::clone(&last),
            }),
        );
        (output, count, last)
    }

    #[test]
    fn test_throttle_caps_sends() {
        let (mut output, count, _) = recorder(4);
        output.frames_per_second.set_value(10.0);

        let frame = vec![rgb(1, 1, 1); 4];
        // 30 sends at 100 Hz: only ~3 survive a 10 fps throttle.
        for i in 0..30 {
            output.send(&frame, i as f64 * 10.0);
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_disabled_sends_nothing() {
        let (mut output, count, _) = recorder(4);
        output.enabled.set_value(false);
        output.send(&vec![rgb(1, 1, 1); 4], 0.0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_off_mode_sends_black() {
        let (mut output, _, last) = recorder(4);
        output.mode.set_value(OutputMode::Off);
        output.send(&vec![rgb(200, 200, 200); 4], 0.0);
        assert!(last.lock().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_white_mode_scales_with_brightness() {
        let (mut output, _, last) = recorder(4);
        output.mode.set_value(OutputMode::White);
        output.brightness.set_value(0.5);
        output.send(&vec![rgb(1, 2, 3); 4], 0.0);
        assert!(last.lock().iter().all(|&c| c == rgb(128, 128, 128)));
    }

    #[test]
    fn test_normal_mode_passthrough_without_correction() {
        let (mut output, _, last) = recorder(4);
        output.send(&vec![rgb(10, 20, 30); 4], 0.0);
        assert!(last.lock().iter().all(|&c| c == rgb(10, 20, 30)));
    }

    #[test]
    fn test_children_receive_corrected_frame() {
        let (child, count, last) = recorder(4);
        let mut root = Output::new("root", 4);
        root.brightness.set_value(0.5);
        root.add_child(child);

        root.send(&vec![rgb(255, 255, 255); 4], 0.0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // The child saw the parent's dimmed frame, not the raw input.
        assert!(last.lock().iter().all(|&c| c == rgb(128, 128, 128)));
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut output = Output::new("root", 4);
        output.mode.set_value(OutputMode::Raw);
        output.gamma.set_index(2);
        output.brightness.set_value(0.25);

        let mut restored = Output::new("root", 4);
        restored.load(&output.save());
        assert_eq!(restored.mode.value(), OutputMode::Raw);
        assert_eq!(restored.gamma.index(), 2);
        assert_eq!(restored.brightness.value(), 0.25);
    }
}

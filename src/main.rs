// src/main.rs

use lumen::{
    Argb, CrossfadeGroup, Engine, GradientPattern, Output, OutputTransport, SolidPattern, rgb,
};

/// Prints a one-line summary of each frame it receives.
struct ConsoleOutput;

impl OutputTransport for ConsoleOutput {
    fn on_send(&mut self, colors: &[Argb]) {
        let peak = colors
            .iter()
            .map(|&c| lumen::red(c).max(lumen::green(c)).max(lumen::blue(c)))
            .max()
            .unwrap_or(0);
        println!("  sent {} points, peak component {}", colors.len(), peak);
    }
}

fn main() {
    env_logger::init();

    let num_points = 64;
    let mut engine = Engine::new(num_points);
    engine.set_fixed_delta_ms(16.0);

    // --------------------------------
    // Two channels across the crossfader
    // --------------------------------

    let red = engine.add_channel_with_patterns(vec![Box::new(SolidPattern::new(rgb(255, 0, 0)))]);
    {
        let core = engine.channel_core(red).expect("channel exists");
        let mut core = core.lock();
        core.fader.set_value(1.0);
        core.crossfade_group.set_value(CrossfadeGroup::A);
    }

    let rainbow = engine.add_channel_with_patterns(vec![Box::new(GradientPattern::new(4000.0))]);
    {
        let core = engine.channel_core(rainbow).expect("channel exists");
        let mut core = core.lock();
        core.fader.set_value(1.0);
        core.crossfade_group.set_value(CrossfadeGroup::B);
    }

    // Throttled console sink: 10 fps no matter how fast we render.
    let mut sink = Output::with_transport("console", num_points, Box::new(ConsoleOutput));
    sink.frames_per_second.set_value(10.0);
    engine.add_output(sink);

    // --------------------------------
    // Sweep the crossfader over 60 frames
    // --------------------------------

    println!("Rendering 60 frames, crossfader A -> B...");
    for frame in 0..60 {
        engine.crossfader.set_value(frame as f64 / 59.0);
        engine.run();

        if frame % 20 == 0 {
            let first = engine.ui_buffer_non_thread_safe()[0];
            println!(
                "frame {:2}: crossfader {:.2}, first point #{:06X}, {:.1} fps measured",
                frame,
                engine.crossfader.value(),
                first & 0x00FF_FFFF,
                engine.actual_frames_per_second(),
            );
        }
    }

    // --------------------------------
    // A second of engine-threaded running
    // --------------------------------

    println!();
    println!("Running engine-threaded for one second...");
    let handle = match engine.start() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("failed to start engine thread: {e}");
            return;
        }
    };
    std::thread::sleep(std::time::Duration::from_secs(1));

    let mut frame = vec![lumen::BLACK; num_points];
    handle.copy_ui_buffer(&mut frame);
    println!("published frame, first point #{:06X}", frame[0] & 0x00FF_FFFF);

    match handle.stop() {
        Ok(engine) => {
            println!(
                "engine stopped, measured {:.1} fps",
                engine.actual_frames_per_second()
            );
        }
        Err(e) => eprintln!("failed to stop engine thread: {e}"),
    }
}

//! Forwards everything from the first input port to the first output port.

use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use unimidi_io::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let observer = Observer::new(default_api(), ObserverConfig::default())?;
    let (Some(in_port), Some(out_port)) = (
        observer.enumerate(Direction::Input)?.into_iter().next(),
        observer.enumerate(Direction::Output)?.into_iter().next(),
    ) else {
        println!("Need at least one input and one output port");
        return Ok(());
    };

    let output = Arc::new(Mutex::new(MidiOutput::open(&out_port, OutputConfig::default())?));
    let forward = Arc::clone(&output);
    let config = InputConfig::builder()
        .on_message(move |message| {
            if let Err(e) = forward.lock().send(&message) {
                eprintln!("send failed: {}", e);
            }
        })
        .on_error(|e| eprintln!("input error: {}", e))
        .build()?;
    let _input = MidiInput::open(&in_port, config)?;

    println!("Echoing {} -> {} for 30 seconds", in_port, out_port);
    std::thread::sleep(Duration::from_secs(30));
    Ok(())
}

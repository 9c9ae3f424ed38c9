//! Prints port hot-plug events for ten seconds.

use std::time::Duration;
use unimidi_io::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ObserverConfig::builder()
        .on_input_added(|p| println!("+ input  {}", p))
        .on_input_removed(|p| println!("- input  {}", p))
        .on_output_added(|p| println!("+ output {}", p))
        .on_output_removed(|p| println!("- output {}", p))
        .build()?;

    let observer = Observer::new(default_api(), config)?;
    observer.start()?;
    println!("Watching {} (Ctrl-C to quit)", observer.api().display_name());
    std::thread::sleep(Duration::from_secs(10));
    observer.stop();
    Ok(())
}

use unimidi_io::prelude::*;
use unimidi_io::registry;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Available APIs: {:?}", available_apis());
    let api = default_api();
    println!("Default API: {}", api.display_name());

    let observer = Observer::new(api, ObserverConfig::default())?;
    for (title, direction) in [("Input", Direction::Input), ("Output", Direction::Output)] {
        println!("\n=== MIDI {} Ports ===", title);
        let ports = observer.enumerate(direction)?;
        if ports.is_empty() {
            println!("  (none found)");
        }
        for port in &ports {
            println!("  [{}] {} ({:?})", port.key(), port.display_name(), port.transport());
        }
    }

    let caps = registry::resolve(api)?.capabilities();
    println!("\nCapabilities: {:?}", caps);
    Ok(())
}

//! Integration tests for unimidi-io.
//!
//! Everything runs on the in-memory loopback backend; no MIDI hardware needed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use unimidi_core::{
    Api, Direction, Error, ErrorKind, InputConfig, MalformedPolicy, Message, ObserverConfig,
    OutputConfig, TimestampMode,
};
use unimidi_io::{
    clock, Backend, BackendRegistry, DummyBackend, LoopbackBackend, MidiInput, MidiOutput, Observer,
    PortEvent, RawData, RawPayload,
};

fn open_pair(
    backend: &LoopbackBackend,
    name: &str,
    input: InputConfig,
    output: OutputConfig,
) -> (u64, MidiInput, MidiOutput) {
    let key = backend.add_port(name);
    let shared: Arc<dyn Backend> = Arc::new(backend.clone());
    let in_port = backend.port(key, Direction::Input).unwrap();
    let out_port = backend.port(key, Direction::Output).unwrap();
    let midi_in = MidiInput::open_with(Arc::clone(&shared), &in_port, input).unwrap();
    let midi_out = MidiOutput::open_with(shared, &out_port, output).unwrap();
    (key, midi_in, midi_out)
}

fn drain(input: &MidiInput) -> Vec<Message> {
    std::iter::from_fn(|| input.poll().unwrap()).collect()
}

// ---------------------------------------------------------------------------
// 1. Output -> backend -> input round trip
// ---------------------------------------------------------------------------

#[test]
fn test_messages_round_trip_through_loopback() {
    let backend = LoopbackBackend::new();
    let (_, input, mut output) = open_pair(
        &backend,
        "Loop",
        InputConfig::default(),
        OutputConfig::builder().running_status(true).build().unwrap(),
    );

    let sent = vec![
        Message::note_on(0, 60, 100),
        Message::note_on(0, 64, 90),
        Message::control_change(3, 74, 12),
        Message::pitch_bend(15, -8192),
        Message::sysex(&[0x7E, 0x7F, 0x06, 0x01]),
        Message::program_change(9, 33),
        Message::note_off(0, 60, 0),
    ];
    for m in &sent {
        output.send(m).unwrap();
    }

    let received: Vec<_> = drain(&input).into_iter().map(|m| m.payload).collect();
    let expected: Vec<_> = sent.into_iter().map(|m| m.payload).collect();
    assert_eq!(received, expected);
}

#[test]
fn test_running_status_bytes_decode_to_two_note_ons() {
    let backend = LoopbackBackend::new();
    let (key, input, _output) =
        open_pair(&backend, "Keys", InputConfig::default(), OutputConfig::default());

    backend.inject(key, RawData::Bytes(&[0x90, 0x40, 0x7F, 0x41, 0x7F]));
    let messages = drain(&input);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].bytes(), Some(&[0x90, 0x40, 0x7F][..]));
    assert_eq!(messages[1].bytes(), Some(&[0x90, 0x41, 0x7F][..]));
}

#[test]
fn test_midi1_to_midi2_listener() {
    let backend = LoopbackBackend::new();
    let input_config = InputConfig::builder()
        .protocol(unimidi_core::MidiProtocol::Midi2)
        .upgrade_midi1_to_midi2(true)
        .build()
        .unwrap();
    let output_config = OutputConfig::builder()
        .protocol(unimidi_core::MidiProtocol::Midi2)
        .build()
        .unwrap();
    let (_, input, mut output) = open_pair(&backend, "UMP", input_config, output_config);

    output.send(&Message::note_on(2, 60, 127)).unwrap();
    let message = input.poll().unwrap().unwrap();
    let words = message.words().unwrap();
    assert_eq!(words[0] & 0xFFFF_FF00, 0x4092_3C00);
    assert_eq!(words[1] >> 16, 0xFFFF);
}

// ---------------------------------------------------------------------------
// 2. SysEx chunking
// ---------------------------------------------------------------------------

#[test]
fn test_300_byte_sysex_in_64_byte_chunks() {
    let backend = LoopbackBackend::builder()
        .sysex_chunk_limit(64)
        .record_sends(true)
        .build();
    let (_, input, mut output) =
        open_pair(&backend, "Slow", InputConfig::default(), OutputConfig::default());

    let mut sysex = vec![0xF0];
    sysex.extend((0..298).map(|i| (i % 128) as u8));
    sysex.push(0xF7);
    output.send_bytes(&sysex).unwrap();

    let chunks: Vec<Vec<u8>> = backend
        .take_sent()
        .into_iter()
        .map(|(_, p)| match p {
            RawPayload::Bytes(b) => b.to_vec(),
            RawPayload::Words(_) => unreachable!(),
        })
        .collect();
    assert_eq!(chunks.len(), 5);
    assert!(chunks.iter().all(|c| c.len() <= 64));
    assert_eq!(chunks.concat(), sysex);

    // Receiver reassembles the chunks.
    let received = drain(&input);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].bytes(), Some(&sysex[..]));
}

// ---------------------------------------------------------------------------
// 3. Queue overflow and close
// ---------------------------------------------------------------------------

#[test]
fn test_poll_queue_overflow_evicts_exactly_one() {
    let capacity = 8;
    let backend = LoopbackBackend::new();
    let (_, input, mut output) = open_pair(
        &backend,
        "Flood",
        InputConfig::builder().buffer_size(capacity).build().unwrap(),
        OutputConfig::default(),
    );

    for note in 0..=capacity as u8 {
        output.send(&Message::note_on(0, note, 1)).unwrap();
    }
    assert_eq!(input.dropped(), 1);

    let received = drain(&input);
    assert_eq!(received.len(), capacity);
    assert_eq!(received[0].bytes(), Some(&[0x90, 1, 1][..]));
}

#[test]
fn test_double_close_releases_once() {
    let backend = LoopbackBackend::new();
    let (_, mut input, mut output) =
        open_pair(&backend, "Loop", InputConfig::default(), OutputConfig::default());
    assert_eq!(backend.open_connections(), 2);

    input.close().unwrap();
    input.close().unwrap();
    output.close().unwrap();
    output.close().unwrap();
    assert_eq!(backend.open_connections(), 0);

    // The port is free again.
    let port = backend.port(0, Direction::Input).unwrap();
    assert!(MidiInput::open_with(Arc::new(backend.clone()), &port, InputConfig::default()).is_ok());
}

#[test]
fn test_callback_errors_go_to_error_callback() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let config = InputConfig::builder()
        .on_message(|_| {})
        .on_error(move |e| {
            let _ = tx.send(e);
        })
        .build()
        .unwrap();
    let backend = LoopbackBackend::new();
    let (key, _input, _output) = open_pair(&backend, "Noisy", config, OutputConfig::default());

    backend.inject(key, RawData::Bytes(&[0xF7]));
    let err = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(err.kind(), ErrorKind::MalformedMessage);

    backend.remove_port(key);
    let err = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(err, Error::PortUnavailable(_)));
}

#[test]
fn test_poll_mode_errors_go_to_error_callback() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let config = InputConfig::builder()
        .on_error(move |e| {
            let _ = tx.send(e.kind());
        })
        .build()
        .unwrap();
    let backend = LoopbackBackend::new();
    let (key, input, _output) = open_pair(&backend, "Polled", config, OutputConfig::default());

    backend.inject(key, RawData::Bytes(&[0xF7]));
    assert!(input.poll().unwrap().is_none());
    assert_eq!(rx.try_recv(), Ok(ErrorKind::MalformedMessage));
    assert!(input.poll_error().is_none());
}

#[test]
fn test_absolute_timestamps_follow_engine_clock() {
    let config = InputConfig::builder()
        .timestamp_mode(TimestampMode::Absolute)
        .build()
        .unwrap();
    let backend = LoopbackBackend::new();
    let (_, input, mut output) = open_pair(&backend, "Clocked", config, OutputConfig::default());

    let before = clock::now_ns();
    output.send(&Message::note_on(0, 60, 100)).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    output.send(&Message::note_off(0, 60, 0)).unwrap();
    let after = clock::now_ns();

    let stamps: Vec<u64> = drain(&input).iter().map(|m| m.timestamp.unwrap()).collect();
    assert_eq!(stamps.len(), 2);
    assert!(before <= stamps[0]);
    assert!(stamps[1] - stamps[0] >= 1_000_000);
    assert!(stamps[1] <= after);
}

#[test]
fn test_abort_policy_drops_rest_of_delivery() {
    let config = InputConfig::builder()
        .malformed_policy(MalformedPolicy::Abort)
        .build()
        .unwrap();
    let backend = LoopbackBackend::new();
    let (key, input, _output) = open_pair(&backend, "Strict", config, OutputConfig::default());

    backend.inject(key, RawData::Bytes(&[0x40, 0x90, 0x3C, 0x40]));
    assert!(drain(&input).is_empty());
    assert_eq!(input.poll_error().map(|e| e.kind()), Some(ErrorKind::MalformedMessage));
    assert!(input.poll_error().is_none());

    // The next delivery decodes normally.
    backend.inject(key, RawData::Bytes(&[0x90, 0x3C, 0x40]));
    let messages = drain(&input);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].bytes(), Some(&[0x90, 0x3C, 0x40][..]));
}

#[test]
fn test_resync_policy_keeps_rest_of_delivery() {
    let backend = LoopbackBackend::new();
    let (key, input, _output) =
        open_pair(&backend, "Lenient", InputConfig::default(), OutputConfig::default());

    backend.inject(key, RawData::Bytes(&[0x40, 0x90, 0x3C, 0x40]));
    assert_eq!(drain(&input).len(), 1);
    assert_eq!(input.poll_error().map(|e| e.kind()), Some(ErrorKind::MalformedMessage));
}

// ---------------------------------------------------------------------------
// 4. Observer
// ---------------------------------------------------------------------------

#[test]
fn test_observer_converges_with_enumeration() {
    let backend = LoopbackBackend::builder().hotplug(false).build();
    let observer =
        Observer::with_backend(Arc::new(backend.clone()), ObserverConfig::default()).unwrap();

    let mut live: Vec<u64> = Vec::new();
    let mut seed: u32 = 0x2545_F491;
    for step in 0..200 {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        if live.is_empty() || seed % 3 != 0 {
            live.push(backend.add_port(&format!("Device {}", step)));
        } else {
            let key = live.swap_remove(seed as usize % live.len());
            backend.remove_port(key);
        }
        if step % 7 == 0 {
            observer.refresh().unwrap();
        }
    }
    observer.refresh().unwrap();

    for direction in [Direction::Input, Direction::Output] {
        let snapshot: HashSet<_> = observer.snapshot(direction).iter().cloned().collect();
        let enumerated: HashSet<_> = backend.list_ports(direction).unwrap().into_iter().collect();
        assert_eq!(snapshot, enumerated);
        assert_eq!(snapshot.len(), live.len());
    }
}

#[test]
fn test_observer_hotplug_reaches_snapshot() {
    let backend = LoopbackBackend::new();
    let observer =
        Observer::with_backend(Arc::new(backend.clone()), ObserverConfig::default()).unwrap();
    observer.start().unwrap();
    let events = observer.events();

    let key = backend.add_port("USB MIDI");
    let added: Vec<PortEvent> = (0..2)
        .map(|_| events.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert!(added.iter().all(PortEvent::is_added));

    backend.remove_port(key);
    let removed = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(!removed.is_added());
    assert_eq!(removed.port().display_name(), "USB MIDI");

    observer.stop();
    backend.add_port("After stop");
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

// ---------------------------------------------------------------------------
// 5. API selection
// ---------------------------------------------------------------------------

#[test]
fn test_default_api_with_no_outputs_is_not_an_error() {
    let registry = BackendRegistry::builder()
        .register(Api::Dummy, || Ok(Arc::new(DummyBackend::new()) as Arc<dyn Backend>))
        .build()
        .unwrap();
    let backend = registry.resolve(Api::Default).unwrap();
    let outputs = backend.list_ports(Direction::Output).unwrap();
    assert!(outputs.is_empty());

    let observer = Observer::with_backend(backend, ObserverConfig::default()).unwrap();
    assert!(observer.enumerate(Direction::Output).unwrap().is_empty());
}

#[test]
fn test_unknown_api_rejected() {
    let registry = BackendRegistry::builder().build().unwrap();
    assert!(matches!(
        registry.resolve(Api::CoreMidiUmp),
        Err(Error::UnknownApi(_))
    ));
}

#[test]
fn test_stale_handle_after_unplug() {
    let backend = LoopbackBackend::new();
    let key = backend.add_port("Gone soon");
    let port = backend.port(key, Direction::Output).unwrap();
    backend.remove_port(key);

    let result = MidiOutput::open_with(Arc::new(backend), &port, OutputConfig::default());
    assert!(matches!(result, Err(Error::PortUnavailable(_))));
}

#[test]
fn test_handles_compare_by_api_and_key() {
    let backend = LoopbackBackend::new();
    backend.add_port("Same Name");
    backend.add_port("Same Name");
    let ports = backend.list_ports(Direction::Input).unwrap();
    assert_eq!(ports.len(), 2);
    assert_ne!(ports[0], ports[1]);
    assert!(ports[0].same_name(&ports[1]));

    let again = backend.list_ports(Direction::Input).unwrap();
    assert_eq!(ports, again);
}

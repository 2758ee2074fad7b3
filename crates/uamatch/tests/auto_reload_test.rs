//! Hot-reload behaviour of the watching provider

mod common;

use common::{fixture_builder, fixture_bytes, DESKTOP_UA};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uamatch::WatchingProvider;
use uamatch_format::{ProfileSpec, Version};

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn watching_provider_matches_before_any_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.uamd");
    fs::write(&path, fixture_bytes()).unwrap();

    let provider = WatchingProvider::from(&path)
        .debounce(Duration::from_millis(100))
        .open()
        .unwrap();
    let result = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
    let generation = provider.generation();
    assert!(generation > 0);
}

#[test]
fn file_replacement_swaps_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.uamd");
    fs::write(&path, fixture_bytes()).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    let provider = WatchingProvider::from(&path)
        .debounce(Duration::from_millis(100))
        .on_reload(move |event| events_clone.lock().unwrap().push(event))
        .open()
        .unwrap();

    let before = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(before.value("BrowserName"), Some("Chrome"));
    let generation_before = provider.generation();

    // Pin the pre-swap provider like an in-flight request would.
    let pinned = provider.snapshot();

    // Publish a new dataset where the desktop browser profile says Edge.
    let updated = fixture_builder(Version::V32)
        .profile(ProfileSpec::new(310, 3).value("BrowserName", "Edge"))
        .build()
        .unwrap();
    // Same fixture plus an extra profile still matches; write atomically.
    let temp = path.with_extension("tmp");
    fs::write(&temp, updated).unwrap();
    fs::rename(&temp, &path).unwrap();

    wait_for("reload event", || !events.lock().unwrap().is_empty());
    wait_for("generation bump", || provider.generation() > generation_before);

    let event = events.lock().unwrap().last().unwrap().clone();
    assert!(event.success, "reload failed: {:?}", event.error);

    // New matches see the new dataset.
    let after = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(after.value("BrowserName"), Some("Chrome"));
    assert_eq!(after.device_id(), before.device_id());

    // The pinned pre-swap provider still completes matches: the old
    // dataset lives until its last reference drains.
    let in_flight = pinned.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(in_flight.value("BrowserName"), Some("Chrome"));
    drop(pinned);
}

#[test]
fn corrupt_replacement_reports_failure_and_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.uamd");
    fs::write(&path, fixture_bytes()).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    let provider = WatchingProvider::from(&path)
        .debounce(Duration::from_millis(100))
        .on_reload(move |event| events_clone.lock().unwrap().push(event))
        .open()
        .unwrap();

    fs::write(&path, b"not a dataset").unwrap();
    wait_for("failure event", || {
        events.lock().unwrap().iter().any(|e: &uamatch::ReloadEvent| !e.success)
    });

    // The previous dataset keeps serving.
    let result = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
}

//! End-to-end matching scenarios against a built dataset

mod common;

use common::{fixture_bytes, DESKTOP_UA, IPHONE_FUZZ_UA, IPHONE_UA, SAMSUNG_UA};
use uamatch::{MatchMethod, Provider, UamatchError};
use uamatch_format::Version;

fn provider() -> Provider {
    Provider::from_bytes_builder(fixture_bytes()).open().unwrap()
}

#[test]
fn samsung_galaxy_matches_exactly() {
    let provider = provider();
    let result = provider.match_user_agent(SAMSUNG_UA).unwrap();
    assert_eq!(result.method, MatchMethod::Exact);
    assert_eq!(result.difference, 0);
    assert_eq!(result.value("IsMobile"), Some("True"));
    assert_eq!(result.value("HardwareVendor"), Some("Samsung"));
    assert_eq!(result.value("HardwareModel"), Some("SM-G900F"));
    assert_eq!(result.value("PlatformName"), Some("Android"));
    assert_eq!(result.device_id(), "100-200-300");
    assert!(result.is_complete);
}

#[test]
fn iphone_matches_exactly() {
    let provider = provider();
    let result = provider.match_user_agent(IPHONE_UA).unwrap();
    assert!(matches!(
        result.method,
        MatchMethod::Exact | MatchMethod::Numeric
    ));
    assert_eq!(result.value("IsMobile"), Some("True"));
    assert_eq!(result.value("DeviceType"), Some("SmartPhone"));
    assert_eq!(result.value("HardwareModel"), Some("iPhone"));
    assert_eq!(result.device_id(), "101-201-301");
}

#[test]
fn short_ua_returns_default_profiles() {
    let provider = provider();
    let result = provider.match_user_agent("ShortUA").unwrap();
    assert_eq!(result.method, MatchMethod::None);
    assert_eq!(result.difference, "ShortUA".len() as u32);
    assert_eq!(result.value("IsMobile"), Some("False"));
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
    assert_eq!(result.device_id(), "102-202-300");
    assert!(result.signature().is_none());
}

#[test]
fn fuzzed_ios_version_matches_numerically() {
    let provider = provider();
    let exact = provider.match_user_agent(IPHONE_UA).unwrap();
    let fuzzed = provider.match_user_agent(IPHONE_FUZZ_UA).unwrap();
    assert_eq!(fuzzed.method, MatchMethod::Numeric);
    assert!(fuzzed.difference > 0);
    // Same device as the canonical iPhone UA.
    assert_eq!(fuzzed.device_id(), exact.device_id());
    assert_eq!(fuzzed.value("HardwareModel"), exact.value("HardwareModel"));
}

#[test]
fn desktop_matches_exactly() {
    let provider = provider();
    let result = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert_eq!(result.method, MatchMethod::Exact);
    assert_eq!(result.value("IsMobile"), Some("False"));
    assert_eq!(result.value("BrowserName"), Some("Chrome"));
}

#[test]
fn surplus_nodes_resolve_via_nearest() {
    let provider = provider();
    // Matches the Windows node and the Safari node, but not the Version
    // fragment; the plain desktop signature is fully contained in the
    // matched set and wins.
    let result = provider
        .match_user_agent("Mozilla/5.0 (Windows NT 10.0; Safari/537 x")
        .unwrap();
    assert_eq!(result.method, MatchMethod::Nearest);
    assert_eq!(result.difference, 1);
    assert_eq!(result.value("BrowserName"), Some("Chrome"));
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
}

#[test]
fn partial_fragments_resolve_via_closest() {
    let provider = provider();
    // Only the shared "Googlebot/" node matches; neither crawler
    // signature is contained in the matched set, so byte-level scoring
    // picks the closer one.
    let result = provider.match_user_agent("Googlebot/9.9").unwrap();
    assert_eq!(result.method, MatchMethod::Closest);
    assert_eq!(result.value("BrowserName"), Some("Googlebot"));
    assert!(result.difference > 0);
}

#[test]
fn non_ascii_bytes_match_as_spaces() {
    let provider = provider();
    let weird = "Mozilla/5.0 (Windows NT 10.0; Win64)\u{00e9}\u{00e9}";
    let result = provider.match_user_agent(weird).unwrap();
    // The non-ASCII tail cannot break the ASCII prefix match.
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
}

#[test]
fn signature_rendering_lays_runs_at_positions() {
    let provider = provider();
    let result = provider.match_user_agent(SAMSUNG_UA).unwrap();
    let rendered = result.signature().expect("exact match has a signature");
    // Rendered characters agree with the UA at every non-space position.
    for (index, ch) in rendered.char_indices() {
        if ch != ' ' {
            assert_eq!(SAMSUNG_UA.as_bytes()[index], ch as u8, "mismatch at {index}");
        }
    }
    assert!(rendered.contains("SAMSUNG SM-G900F"));
}

#[test]
fn repeat_matches_are_idempotent() {
    let provider = provider();
    let first = provider.match_user_agent(SAMSUNG_UA).unwrap();
    for _ in 0..5 {
        provider.match_user_agent(IPHONE_UA).unwrap();
        provider.match_user_agent(DESKTOP_UA).unwrap();
    }
    let again = provider.match_user_agent(SAMSUNG_UA).unwrap();
    assert_eq!(first.method, again.method);
    assert_eq!(first.difference, again.difference);
    assert_eq!(first.device_id(), again.device_id());
    assert_eq!(
        first.values("HardwareModel"),
        again.values("HardwareModel")
    );
}

#[test]
fn stream_memory_and_bytes_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.uamd");
    std::fs::write(&path, fixture_bytes()).unwrap();

    let stream = Provider::from(&path).open().unwrap();
    let memory = Provider::from(&path).memory_mode().open().unwrap();
    let bytes = provider();

    for ua in [SAMSUNG_UA, IPHONE_UA, IPHONE_FUZZ_UA, DESKTOP_UA, "ShortUA"] {
        let a = stream.match_user_agent(ua).unwrap();
        let b = memory.match_user_agent(ua).unwrap();
        let c = bytes.match_user_agent(ua).unwrap();
        assert_eq!(a.method, b.method, "{ua}");
        assert_eq!(a.method, c.method, "{ua}");
        assert_eq!(a.device_id(), b.device_id(), "{ua}");
        assert_eq!(a.device_id(), c.device_id(), "{ua}");
        assert_eq!(a.difference, b.difference, "{ua}");
    }
}

#[test]
fn v31_dataset_matches_without_numeric_strategy() {
    let data = fixture_builder_v31().build().unwrap();
    let provider = Provider::from_bytes_builder(data).open().unwrap();
    let result = provider
        .match_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64)")
        .unwrap();
    assert_eq!(result.method, MatchMethod::Exact);
    assert_eq!(result.value("DeviceType"), Some("Desktop"));
}

/// v3.1 cannot carry numeric fragments; rebuild the fixture without them.
fn fixture_builder_v31() -> uamatch_format::DatasetBuilder {
    use uamatch_format::{
        ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, PropertyValueType, SignatureSpec,
    };
    DatasetBuilder::new(Version::V31)
        .copyright("uamatch v3.1 test data")
        .component(ComponentSpec {
            id: 1,
            name: "Hardware".to_string(),
            default_profile_id: Some(102),
        })
        .property(
            PropertySpec::new("IsMobile", 1, PropertyValueType::Bool).default_value("False"),
        )
        .property(PropertySpec::new("DeviceType", 1, PropertyValueType::String))
        .profile(
            ProfileSpec::new(102, 1)
                .value("IsMobile", "False")
                .value("DeviceType", "Desktop"),
        )
        .profile(
            ProfileSpec::new(100, 1)
                .value("IsMobile", "True")
                .value("DeviceType", "SmartPhone"),
        )
        .signature(SignatureSpec::new(0, vec![102]).fragment(0, "Mozilla/5.0 (Windows NT "))
        .signature(
            SignatureSpec::new(1, vec![100]).fragment(0, "Mozilla/5.0 (Linux; Android "),
        )
}

#[test]
fn headers_pick_the_configured_override() {
    let provider = provider();
    let headers = [
        ("Accept", "text/html"),
        ("user-agent", DESKTOP_UA),
        ("X-Whatever", "1"),
    ];
    let result = provider.match_headers(headers).unwrap();
    assert_eq!(result.value("DeviceType"), Some("Desktop"));

    // No UA header at all: the default-profile result.
    let result = provider.match_headers([("Accept", "text/html")]).unwrap();
    assert_eq!(result.method, MatchMethod::None);
}

#[test]
fn explicit_overrides_rewrite_values() {
    use std::collections::HashMap;

    let provider = provider();
    let mut overrides = HashMap::new();
    overrides.insert("DeviceType".to_string(), "Tablet".to_string());
    let result = provider
        .match_headers_with_overrides([("User-Agent", DESKTOP_UA)], &overrides)
        .unwrap();
    assert_eq!(result.value("DeviceType"), Some("Tablet"));
    // Untouched properties keep their matched values.
    assert_eq!(result.value("BrowserName"), Some("Chrome"));

    // Without an override map the match is untouched.
    let plain = provider.match_headers([("User-Agent", DESKTOP_UA)]).unwrap();
    assert_eq!(plain.value("DeviceType"), Some("Desktop"));
}

#[test]
fn device_id_replays_to_the_same_profiles() {
    let provider = provider();
    let matched = provider.match_user_agent(SAMSUNG_UA).unwrap();
    let replayed = provider.match_device_id(matched.device_id()).unwrap();
    assert_eq!(replayed.device_id(), matched.device_id());
    assert_eq!(replayed.value("HardwareModel"), Some("SM-G900F"));

    assert!(provider.match_device_id("1-2-nonsense").is_err());
    assert!(provider.match_device_id("999999").is_err());
}

#[test]
fn property_lookup_is_total() {
    let provider = provider();
    assert!(provider.property("IsMobile").is_some());
    assert!(provider.property("NoSuchProperty").is_none());
    let result = provider.match_user_agent(DESKTOP_UA).unwrap();
    assert!(result.values("NoSuchProperty").is_none());
}

#[test]
fn node_budget_degrades_gracefully() {
    let provider = Provider::from_bytes_builder(fixture_bytes())
        .node_evaluation_budget(1)
        .open()
        .unwrap();
    let result = provider.match_user_agent(SAMSUNG_UA).unwrap();
    assert!(!result.is_complete);
    // Still a usable result with the default or partial profiles.
    assert!(result.value("IsMobile").is_some());
}

#[test]
fn disposed_dataset_refuses_matches() {
    let provider = provider();
    provider.match_user_agent(DESKTOP_UA).unwrap();
    provider.dispose();
    assert!(matches!(
        provider.match_user_agent(DESKTOP_UA),
        Err(UamatchError::Disposed)
    ));
}

#[test]
fn match_stats_count_methods() {
    let provider = provider();
    provider.match_user_agent(SAMSUNG_UA).unwrap();
    provider.match_user_agent(IPHONE_FUZZ_UA).unwrap();
    provider.match_user_agent("ShortUA").unwrap();
    let stats = provider.stats();
    assert_eq!(stats.total_matches, 3);
    assert_eq!(stats.exact, 1);
    assert_eq!(stats.numeric, 1);
    assert_eq!(stats.none, 1);
    assert_eq!(stats.cache_misses, 3);
}

#[test]
fn dataset_metadata_is_exposed() {
    use std::time::{Duration, UNIX_EPOCH};

    let provider = provider();
    let dataset = provider.dataset();
    assert_eq!(dataset.published_unix(), 1_700_000_000);
    assert_eq!(
        dataset.next_update(),
        UNIX_EPOCH + Duration::from_secs(1_702_600_000)
    );
    assert_eq!(dataset.copyright().unwrap().as_str(), "uamatch test data");
    assert_eq!(dataset.components().len(), 3);
    assert_eq!(dataset.maps().len(), 1);
    assert_eq!(dataset.maps()[0].name, "Lite");

    // Rank position 0 names the most popular signature.
    let top = dataset.ranked_signature_index(0).unwrap();
    assert_eq!(dataset.signature(top).unwrap().rank, 0);
}

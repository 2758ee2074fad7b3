#![allow(dead_code)] // each test binary uses a different fixture subset

//! Shared dataset fixture for integration tests
//!
//! A small but realistic device catalog: a Samsung Galaxy S5, an iPhone, a
//! Windows desktop (with a Safari variant) and Googlebot, across Hardware,
//! Software and Browser components.

use uamatch_format::{
    ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, PropertyValueType, SignatureSpec,
    Version,
};

pub const SAMSUNG_UA: &str = "Mozilla/5.0 (Linux; Android 5.0; SAMSUNG SM-G900F Build/LRX21T)";
pub const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 9_0 like Mac OS X)";
pub const IPHONE_FUZZ_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 9_123_456)";
pub const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64)";

pub fn fixture_builder(version: Version) -> DatasetBuilder {
    let builder = DatasetBuilder::new(version)
        .copyright("uamatch test data")
        .dates(1_700_000_000, 1_702_600_000)
        .age_months(1)
        .component(ComponentSpec {
            id: 1,
            name: "Hardware".to_string(),
            default_profile_id: Some(102),
        })
        .component(ComponentSpec {
            id: 2,
            name: "Software".to_string(),
            default_profile_id: Some(202),
        })
        .component(ComponentSpec {
            id: 3,
            name: "Browser".to_string(),
            default_profile_id: Some(300),
        })
        .property(
            PropertySpec::new("IsMobile", 1, PropertyValueType::Bool)
                .map("Lite")
                .default_value("False"),
        )
        .property(PropertySpec::new("HardwareVendor", 1, PropertyValueType::String).map("Lite"))
        .property(PropertySpec::new("HardwareModel", 1, PropertyValueType::String).map("Lite"))
        .property(PropertySpec::new("DeviceType", 1, PropertyValueType::String).map("Lite"))
        .property(PropertySpec::new("PlatformName", 2, PropertyValueType::String).map("Lite"))
        .property(PropertySpec::new("BrowserName", 3, PropertyValueType::String).map("Lite"))
        .profile(
            ProfileSpec::new(100, 1)
                .value("IsMobile", "True")
                .value("HardwareVendor", "Samsung")
                .value("HardwareModel", "SM-G900F")
                .value("DeviceType", "SmartPhone"),
        )
        .profile(
            ProfileSpec::new(101, 1)
                .value("IsMobile", "True")
                .value("HardwareVendor", "Apple")
                .value("HardwareModel", "iPhone")
                .value("DeviceType", "SmartPhone"),
        )
        .profile(
            ProfileSpec::new(102, 1)
                .value("IsMobile", "False")
                .value("HardwareVendor", "Unknown")
                .value("HardwareModel", "Desktop")
                .value("DeviceType", "Desktop"),
        )
        .profile(ProfileSpec::new(200, 2).value("PlatformName", "Android"))
        .profile(ProfileSpec::new(201, 2).value("PlatformName", "iOS"))
        .profile(ProfileSpec::new(202, 2).value("PlatformName", "Windows"))
        .profile(ProfileSpec::new(300, 3).value("BrowserName", "Chrome"))
        .profile(ProfileSpec::new(301, 3).value("BrowserName", "Safari"))
        .profile(ProfileSpec::new(303, 3).value("BrowserName", "Googlebot"));

    // Samsung Galaxy S5 on Android 5.0.
    let samsung = SignatureSpec::new(0, vec![100, 200, 300])
        .fragment(0, "Mozilla/5.0 (Linux; Android ")
        .numeric_fragment(28, 5)
        .fragment(29, ".0; SAMSUNG SM-G900F");
    // iPhone on iOS 9_0.
    let iphone = SignatureSpec::new(1, vec![101, 201, 301])
        .fragment(0, "Mozilla/5.0 (iPhone; CPU iPhone OS ")
        .numeric_fragment(35, 9)
        .fragment(36, "_")
        .numeric_fragment(37, 0);
    // Windows desktop, and its Safari variant used by the Nearest tests.
    let desktop = SignatureSpec::new(2, vec![102, 202, 300]).fragment(0, "Mozilla/5.0 (Windows NT ");
    let desktop_safari = SignatureSpec::new(3, vec![102, 202, 301])
        .fragment(0, "Mozilla/5.0 (Windows NT ")
        .fragment(30, "Safari/")
        .fragment(40, "Version/");
    // Googlebot pair used by the Closest tests.
    let googlebot = SignatureSpec::new(4, vec![102, 202, 303])
        .fragment(0, "Googlebot/")
        .numeric_fragment(10, 2)
        .fragment(11, ".1");
    let googlebot_mobile = SignatureSpec::new(5, vec![102, 202, 303])
        .fragment(0, "Googlebot/")
        .fragment(13, "Mobile");

    builder
        .signature(samsung)
        .signature(iphone)
        .signature(desktop)
        .signature(desktop_safari)
        .signature(googlebot)
        .signature(googlebot_mobile)
}

pub fn fixture_bytes() -> Vec<u8> {
    fixture_builder(Version::V32).build().expect("fixture builds")
}

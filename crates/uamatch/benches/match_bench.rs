//! Match throughput over a small synthetic dataset

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uamatch::Provider;
use uamatch_format::{
    ComponentSpec, DatasetBuilder, ProfileSpec, PropertySpec, PropertyValueType, SignatureSpec,
    Version,
};

const SAMSUNG_UA: &str = "Mozilla/5.0 (Linux; Android 5.0; SAMSUNG SM-G900F Build/LRX21T)";
const UNKNOWN_UA: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101";

fn dataset() -> Vec<u8> {
    DatasetBuilder::new(Version::V32)
        .component(ComponentSpec::new(1, "Hardware"))
        .property(
            PropertySpec::new("IsMobile", 1, PropertyValueType::Bool).default_value("False"),
        )
        .property(PropertySpec::new("HardwareModel", 1, PropertyValueType::String))
        .profile(
            ProfileSpec::new(100, 1)
                .value("IsMobile", "True")
                .value("HardwareModel", "SM-G900F"),
        )
        .profile(ProfileSpec::new(102, 1).value("IsMobile", "False"))
        .signature(
            SignatureSpec::new(0, vec![100])
                .fragment(0, "Mozilla/5.0 (Linux; Android ")
                .numeric_fragment(28, 5)
                .fragment(29, ".0; SAMSUNG SM-G900F"),
        )
        .signature(SignatureSpec::new(1, vec![102]).fragment(0, "Mozilla/5.0 (Windows NT "))
        .build()
        .expect("bench dataset builds")
}

fn bench_matching(c: &mut Criterion) {
    let cached = Provider::from_bytes_builder(dataset()).open().unwrap();
    let uncached = Provider::from_bytes_builder(dataset())
        .no_cache()
        .open()
        .unwrap();

    c.bench_function("exact_match_cached", |b| {
        b.iter(|| cached.match_user_agent(black_box(SAMSUNG_UA)).unwrap())
    });
    c.bench_function("exact_match_uncached", |b| {
        b.iter(|| uncached.match_user_agent(black_box(SAMSUNG_UA)).unwrap())
    });
    c.bench_function("no_match_fallback", |b| {
        b.iter(|| uncached.match_user_agent(black_box(UNKNOWN_UA)).unwrap())
    });
}

criterion_group!(benches, bench_matching);
criterion_main!(benches);

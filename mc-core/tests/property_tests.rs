//! Property tests for the codec, discovery, datapoint store, registry and
//! enrollment cascade.

use std::collections::BTreeMap;

use mc_core::{
    compile, decode_frame, encode_frame, ApplyOutcome, Catalog, ChannelClassifier, CompileOptions, DataType,
    Datapoint, DatapointRecord, DatapointStore, DatapointValue, DiscoverySettings, EnrollmentMachine,
    EnrollmentPhase, EnrollmentSettings, Profile, VendorFrame, ZoneCategory,
};
use mc_protocol::EndpointDescriptor;
use proptest::prelude::*;

// ── Codec ─────────────────────────────────────────────────────

fn arb_value() -> impl Strategy<Value = DatapointValue> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 1..=8).prop_map(DatapointValue::Raw),
        any::<bool>().prop_map(DatapointValue::Boolean),
        any::<i32>().prop_map(DatapointValue::Integer32),
        "[a-zA-Z0-9 ]{1,12}".prop_map(DatapointValue::String),
        any::<u8>().prop_map(DatapointValue::Enum),
        any::<u8>().prop_map(|b| DatapointValue::Bitmap { bits: b as u32, width: 1 }),
        any::<u16>().prop_map(|b| DatapointValue::Bitmap { bits: b as u32, width: 2 }),
        any::<u32>().prop_map(|bits| DatapointValue::Bitmap { bits, width: 4 }),
    ]
}

fn arb_frame() -> impl Strategy<Value = VendorFrame> {
    (
        any::<u16>(),
        proptest::collection::vec((any::<u8>(), arb_value()), 1..=4),
    )
        .prop_map(|(seq, dps)| VendorFrame {
            seq,
            datapoints: dps.into_iter().map(|(id, v)| Datapoint::new(id, v)).collect(),
        })
}

proptest! {
    #[test]
    fn encoded_frames_decode_to_the_same_frame(frame in arb_frame()) {
        let bytes = encode_frame(&frame).unwrap();
        prop_assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    /// Cutting into the last datapoint fails the whole frame
    #[test]
    fn truncated_frames_never_decode(frame in arb_frame(), cut in 1usize..=3) {
        let bytes = encode_frame(&frame).unwrap();
        let truncated = &bytes[..bytes.len() - cut];
        prop_assert!(decode_frame(truncated).is_err());
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = decode_frame(&bytes);
    }
}

// ── Discovery ─────────────────────────────────────────────────

fn arb_endpoints() -> impl Strategy<Value = Vec<EndpointDescriptor>> {
    let cluster = prop_oneof![
        Just(0x0000u16),
        Just(0x0006u16),
        Just(0xEF00u16),
        Just(0xE000u16),
        Just(0xE001u16),
        Just(0xED00u16),
        0xFC00u16..=0xFFFF,
    ];
    proptest::collection::vec((1u8..=4, proptest::collection::vec(cluster, 0..6)), 1..4)
        .prop_map(|eps| eps.into_iter().map(|(id, c)| EndpointDescriptor::new(id, &c)).collect())
}

proptest! {
    #[test]
    fn discovery_is_idempotent(endpoints in arb_endpoints()) {
        let mut classifier = ChannelClassifier::new(&DiscoverySettings::default());
        classifier.discover(&endpoints, 0);
        let channels = classifier.channels().count();
        let listeners = classifier.listeners().len();
        let timers = classifier.pending_timers();

        let again = classifier.discover(&endpoints, 50);
        prop_assert!(again.is_empty());
        prop_assert_eq!(classifier.channels().count(), channels);
        prop_assert_eq!(classifier.listeners().len(), listeners);
        prop_assert_eq!(classifier.pending_timers(), timers);

        let (removed, cancelled) = classifier.teardown();
        prop_assert_eq!(removed, listeners);
        prop_assert_eq!(cancelled, timers);
    }
}

// ── Datapoint store ───────────────────────────────────────────

fn record(dp_id: u8, value: i32, timestamp: u64) -> DatapointRecord {
    DatapointRecord {
        dp_id,
        data_type: DataType::Integer32,
        raw_bytes: value.to_be_bytes().to_vec(),
        value: DatapointValue::Integer32(value),
        timestamp,
        occurrence_count: 1,
    }
}

proptest! {
    /// The stored record always carries the greatest timestamp seen so far
    #[test]
    fn stale_records_never_replace_newer_state(
        updates in proptest::collection::vec((any::<i32>(), 0u64..1000), 1..30),
    ) {
        let mut store = DatapointStore::new();
        let mut newest: Option<(u64, i32)> = None;
        let mut applied = 0u32;

        for (value, ts) in updates {
            let outcome = store.apply(record(7, value, ts));
            match newest {
                Some((t, _)) if ts < t => {
                    prop_assert!(matches!(outcome, ApplyOutcome::Stale { .. }), "expected ApplyOutcome::Stale");
                }
                _ => {
                    prop_assert!(outcome.is_applied());
                    newest = Some((ts, value));
                    applied += 1;
                }
            }
            let stored = store.get(7).unwrap();
            let (t, v) = newest.unwrap();
            prop_assert_eq!(stored.timestamp, t);
            prop_assert_eq!(&stored.value, &DatapointValue::Integer32(v));
            prop_assert_eq!(stored.occurrence_count, applied);
        }
    }
}

// ── Registry ──────────────────────────────────────────────────

const CATEGORIES: &[&str] = &["switch", "plug", "climate_sensor", "motion_sensor", "generic", "dimmer"];

proptest! {
    /// Every identity resolves to exactly one profile, and one collision is
    /// recorded per identity claimed more than once
    #[test]
    fn every_identity_resolves_to_one_profile(
        claims in proptest::collection::vec((0usize..CATEGORIES.len(), 0usize..3, 0usize..3), 1..8),
    ) {
        let profiles: Vec<Profile> = claims
            .iter()
            .enumerate()
            .map(|(i, (cat, vendor, model))| {
                let mut p = Profile::observe_only(format!("profile_{}", i));
                p.category = CATEGORIES[*cat].to_string();
                p.vendor_ids = vec![format!("_TZE200_{}", vendor)];
                p.model_ids = vec![format!("TS060{}", model)];
                p
            })
            .collect();

        let registry = compile(&Catalog { version: 1, profiles }, &CompileOptions::default()).unwrap();

        let mut claimed: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for (_, vendor, model) in &claims {
            *claimed.entry((*vendor, *model)).or_default() += 1;
        }

        prop_assert_eq!(registry.identity_count(), claimed.len());
        prop_assert_eq!(registry.collisions().len(), claimed.values().filter(|n| **n > 1).count());

        for (vendor, model) in claimed.keys() {
            let vendor = format!("_TZE200_{}", vendor);
            let model = format!("TS060{}", model);
            prop_assert!(registry.resolve(&vendor, &model).is_some());
        }
    }
}

// ── Enrollment ────────────────────────────────────────────────

proptest! {
    /// With no response from the device the cascade always ends in Failed
    /// with no timers left, whatever the tick cadence
    #[test]
    fn silent_device_exhausts_every_method(step in 100u64..5_000) {
        let settings = EnrollmentSettings::default();
        let mut machine = EnrollmentMachine::new(1, ZoneCategory::Contact, &settings);
        machine.start(0);

        let mut now = 0;
        let mut ticks = 0;
        while machine.phase() != EnrollmentPhase::Failed {
            now += step;
            machine.on_tick(now);
            ticks += 1;
            prop_assert!(ticks < 10_000);
        }
        prop_assert_eq!(machine.pending_timers(), 0);
        prop_assert_eq!(machine.next_deadline(), None);
    }
}

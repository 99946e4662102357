/*
 * Integration tests for Meshcap
 *
 * These tests drive the command layer end to end: catalogs on disk,
 * captured event logs, and the JSON-lines host message log.
 */

use std::fs;
use std::path::{Path, PathBuf};

use meshcap::commands::{compile_report, decode_report, estimate_report, replay_file, resolve_report, Replayer};
use meshcap::logger;
use mc_core::{compile, Catalog, Chemistry, CompileOptions, CoreSettings, DatapointValue};
use mc_protocol::{parse_envelope, CapabilityValue, DeviceAddress, HostMessage, OutboundCommand};
use serde_json::Value;
use serial_test::serial;

// Test utilities
const CATALOG: &str = r#"{
  "version": 1,
  "profiles": [
    {
      "id": "ts0601_switch",
      "category": "switch",
      "vendor_ids": ["_TZE200_abc"],
      "model_ids": ["TS0601"],
      "datapoints": [{ "dp_id": 1, "data_type": "boolean" }],
      "bindings": [
        { "source": { "datapoint": { "dp_id": 1 } }, "capability": "onoff", "transform": { "kind": "boolean" } }
      ]
    },
    {
      "id": "ts0601_climate",
      "name": "Climate sensor",
      "category": "climate_sensor",
      "vendor_ids": ["_TZE200_abc", "_TZE200_xyz"],
      "model_ids": ["TS0601"],
      "datapoints": [
        { "dp_id": 4, "data_type": "integer32" },
        { "dp_id": 15, "data_type": "integer32" }
      ],
      "bindings": [
        { "source": { "datapoint": { "dp_id": 4 } }, "capability": "measure_temperature", "transform": { "kind": "divide", "by": 10.0 } }
      ],
      "power": {
        "chemistry": "CR2032",
        "voltage": { "source": { "datapoint": { "dp_id": 15 } }, "divisor": 100.0 }
      }
    },
    {
      "id": "pir",
      "category": "motion_sensor",
      "vendor_ids": ["_TZ3000_pir"],
      "model_ids": ["TS0202"],
      "zones": [{ "endpoint": 1, "category": "motion", "capability": "alarm_motion" }]
    }
  ]
}"#;

const CLIMATE: &str = "0x00124b0001";
const PIR: &str = "0x00124b0002";

fn write_catalog(dir: &Path) -> PathBuf {
    let path = dir.join("profiles.json");
    fs::write(&path, CATALOG).unwrap();
    path
}

fn paired(id: u64, device: &str, ts: u64, vendor: &str, model: &str, clusters: &[u16]) -> String {
    let clusters: Vec<String> = clusters.iter().map(|c| format!(r#"{{"id":{}}}"#, c)).collect();
    format!(
        r#"{{"id":{},"device":"{}","timestamp_ms":{},"event":"paired","data":{{"vendor_id":"{}","model_id":"{}","endpoints":[{{"id":1,"clusters":[{}]}}]}}}}"#,
        id,
        device,
        ts,
        vendor,
        model,
        clusters.join(",")
    )
}

fn frame(id: u64, device: &str, ts: u64, hex: &str) -> String {
    format!(
        r#"{{"id":{},"device":"{}","timestamp_ms":{},"event":"cluster","data":{{"endpoint":1,"cluster":61184,"name":"dataReport","payload":{{"frame":{{"bytes":"{}"}}}}}}}}"#,
        id, device, ts, hex
    )
}

fn zone_event(id: u64, device: &str, ts: u64, event: &str, data: &str) -> String {
    format!(
        r#"{{"id":{},"device":"{}","timestamp_ms":{},"event":"{}","data":{}}}"#,
        id, device, ts, event, data
    )
}

fn capability_updates(messages: &[HostMessage], device: &str) -> Vec<(String, CapabilityValue)> {
    messages
        .iter()
        .filter_map(|m| match m {
            HostMessage::Capability {
                device: d,
                capability,
                value,
            } if d.as_str() == device => Some((capability.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

fn registry() -> mc_core::ProfileRegistry {
    compile(&Catalog::from_json(CATALOG).unwrap(), &CompileOptions::default()).unwrap()
}

// ============================================================================
// Catalog
// ============================================================================

#[test]
fn test_compile_report_lists_collision() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());

    let report = compile_report(&catalog, &CoreSettings::default(), false).unwrap();
    assert!(report.contains("Compiled 3 profiles"));
    assert!(report.contains("Collisions (1):"));
    assert!(report.contains("_TZE200_abc / TS0601: [ts0601_switch, ts0601_climate] -> ts0601_climate (specificity 90 > 30)"));
}

#[test]
fn test_resolve_report() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());
    let settings = CoreSettings::default();

    let report = resolve_report(&catalog, &settings, "_TZE200_abc", "TS0601").unwrap();
    assert!(report.starts_with("_TZE200_abc / TS0601 -> ts0601_climate (climate_sensor)"));
    assert!(report.contains("measure_temperature <- datapoint 4 (divide)"));
    assert!(report.contains("Battery: CR2032"));

    let report = resolve_report(&catalog, &settings, "_TZE200_nope", "TS0601").unwrap();
    assert!(report.contains("no profile"));
}

#[test]
fn test_compile_report_rejects_invalid_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(
        &path,
        r#"{"profiles":[{"id":"a","category":"switch","vendor_ids":[],"model_ids":["TS0001"]}]}"#,
    )
    .unwrap();
    assert!(compile_report(&path, &CoreSettings::default(), false).is_err());
}

// ============================================================================
// Frames and power
// ============================================================================

#[test]
fn test_decode_and_estimate_reports() {
    let report = decode_report(&["00010402000400000262".to_string()]).unwrap();
    assert!(report.contains("dp   4"));

    let report = estimate_report(Chemistry::Cr2032, Some(2.85), None, None, &CoreSettings::default()).unwrap();
    assert!(report.contains("Level 3"));
    assert!(report.contains("75.0%"));
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn test_replay_climate_sensor() {
    let registry = registry();
    let settings = CoreSettings::default();
    let mut replayer = Replayer::new(&registry, &settings);

    let mut messages = Vec::new();
    for line in [
        paired(1, CLIMATE, 0, "_TZE200_abc", "TS0601", &[0x0000, 0xEF00]),
        frame(2, CLIMATE, 1_000, "00010402000400000262"),
        frame(3, CLIMATE, 2_000, "00020f0200040000011d"),
    ] {
        messages.extend(replayer.feed(parse_envelope(&line).unwrap()));
    }

    let updates = capability_updates(&messages, CLIMATE);
    // placeholder battery announced at pairing
    assert_eq!(updates[0], ("measure_battery".to_string(), CapabilityValue::Number(100.0)));
    assert!(updates.contains(&("measure_temperature".to_string(), CapabilityValue::Number(61.0))));
    assert!(updates.contains(&("measure_battery".to_string(), CapabilityValue::Number(75.0))));
    assert!(!updates.iter().any(|(c, _)| c == "onoff"));

    let session = replayer.session(&DeviceAddress::new(CLIMATE)).unwrap();
    assert_eq!(session.profile().id, "ts0601_climate");
    assert_eq!(replayer.clock(), 2_000);
}

#[test]
fn test_replay_discards_out_of_order_frame() {
    let registry = registry();
    let settings = CoreSettings::default();
    let mut replayer = Replayer::new(&registry, &settings);

    let mut messages = Vec::new();
    for line in [
        paired(1, CLIMATE, 0, "_TZE200_abc", "TS0601", &[0xEF00]),
        // dp4 = 610 at 2000, then a late dp4 = 200 captured at 1000
        frame(2, CLIMATE, 2_000, "00010402000400000262"),
        frame(3, CLIMATE, 1_000, "000204020004000000c8"),
    ] {
        messages.extend(replayer.feed(parse_envelope(&line).unwrap()));
    }

    let temperatures: Vec<CapabilityValue> = capability_updates(&messages, CLIMATE)
        .into_iter()
        .filter(|(c, _)| c == "measure_temperature")
        .map(|(_, v)| v)
        .collect();
    assert_eq!(temperatures, vec![CapabilityValue::Number(61.0)]);

    let session = replayer.session(&DeviceAddress::new(CLIMATE)).unwrap();
    let stored = session.datapoints().get(4).unwrap();
    assert_eq!(stored.value, DatapointValue::Integer32(610));
    assert_eq!(stored.timestamp, 2_000);
    assert_eq!(stored.occurrence_count, 1);
    assert_eq!(replayer.clock(), 2_000);
}

#[test]
fn test_replay_queries_declared_datapoints() {
    let registry = registry();
    let settings = CoreSettings::default();
    let mut replayer = Replayer::new(&registry, &settings);

    replayer.feed(parse_envelope(&paired(1, CLIMATE, 0, "_TZE200_abc", "TS0601", &[0xEF00])).unwrap());
    let messages = replayer.drain();
    assert!(messages.contains(&HostMessage::Command {
        device: DeviceAddress::new(CLIMATE),
        command: OutboundCommand::QueryDatapoints {
            endpoint: 1,
            cluster: 0xEF00,
            dp_ids: vec![4, 15],
        },
    }));
    // no wall clock during replay, so no time sync frame
    assert!(!messages.iter().any(|m| matches!(
        m,
        HostMessage::Command { command: OutboundCommand::SendVendorFrame { .. }, .. }
    )));
}

#[test]
fn test_replay_fires_timers_between_events() {
    let registry = registry();
    let settings = CoreSettings::default();
    let mut replayer = Replayer::new(&registry, &settings);

    let opening = [
        paired(1, PIR, 0, "_TZ3000_pir", "TS0202", &[0x0000, 0x0500]),
        zone_event(2, PIR, 5, "zone_enroll_request", r#"{"endpoint":1,"zone_type":13}"#),
        zone_event(3, PIR, 10, "zone_info", r#"{"endpoint":1,"ok":true,"zone_type":13}"#),
        zone_event(4, PIR, 100, "zone_status", r#"{"endpoint":1,"status":1}"#),
    ];
    let mut messages = Vec::new();
    for line in &opening {
        messages.extend(replayer.feed(parse_envelope(line).unwrap()));
    }
    assert!(messages.iter().any(|m| matches!(
        m,
        HostMessage::Command { command: OutboundCommand::ReadZoneInfo { endpoint: 1 }, .. }
    )));
    assert_eq!(
        capability_updates(&messages, PIR).last(),
        Some(&("alarm_motion".to_string(), CapabilityValue::Bool(true)))
    );

    // a later unrelated event lets the motion auto-reset fire first
    let later = replayer.feed(parse_envelope(&paired(5, CLIMATE, 120_000, "_TZE200_xyz", "TS0601", &[0xEF00])).unwrap());
    let first_reset = later
        .iter()
        .position(|m| matches!(m, HostMessage::Capability { capability, .. } if capability == "alarm_motion"))
        .unwrap();
    let first_climate = later
        .iter()
        .position(|m| matches!(m, HostMessage::Capability { device, .. } if device.as_str() == CLIMATE))
        .unwrap();
    assert!(first_reset < first_climate);
    assert_eq!(
        capability_updates(&later, PIR),
        vec![("alarm_motion".to_string(), CapabilityValue::Bool(false))]
    );
    assert_eq!(replayer.device_count(), 2);
}

#[test]
fn test_replay_unknown_device_and_unpair() {
    let registry = registry();
    let settings = CoreSettings::default();
    let mut replayer = Replayer::new(&registry, &settings);

    let out = replayer.feed(parse_envelope(&frame(1, CLIMATE, 0, "00010402000400000262")).unwrap());
    assert!(matches!(
        &out[..],
        [HostMessage::Error { envelope_id: Some(1), .. }]
    ));

    replayer.feed(parse_envelope(&paired(2, CLIMATE, 10, "_TZE200_abc", "TS0601", &[0xEF00])).unwrap());
    assert_eq!(replayer.device_count(), 1);
    let unpaired = format!(r#"{{"id":3,"device":"{}","timestamp_ms":20,"event":"unpaired"}}"#, CLIMATE);
    replayer.feed(parse_envelope(&unpaired).unwrap());
    assert_eq!(replayer.device_count(), 0);
    assert!(replayer.drain().is_empty());
}

#[test]
#[serial]
fn test_replay_file_records_host_messages() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());
    let events = dir.path().join("capture.jsonl");
    let out = dir.path().join("out").join("messages.jsonl");

    let log = [
        paired(1, CLIMATE, 0, "_TZE200_abc", "TS0601", &[0xEF00]),
        String::new(),
        frame(2, CLIMATE, 1_000, "00010402000400000262"),
    ]
    .join("\n");
    fs::write(&events, log).unwrap();

    logger::init_logging(&out).unwrap();
    let messages = replay_file(&catalog, &events, &CoreSettings::default(), true).unwrap();
    logger::close_logging();

    assert!(capability_updates(&messages, CLIMATE)
        .contains(&("measure_temperature".to_string(), CapabilityValue::Number(61.0))));

    let lines: Vec<Value> = fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let recorded = lines.iter().filter(|l| l["event"] == "host_message").count();
    assert_eq!(recorded, messages.len());
    let last = lines.last().unwrap();
    assert_eq!(last["event"], "replay_finished");
    assert_eq!(last["data"]["devices"], 1);
}

#[test]
#[serial]
fn test_replay_file_reports_bad_line() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = write_catalog(dir.path());
    let events = dir.path().join("capture.jsonl");
    fs::write(&events, format!("{}\n{{not json}}\n", paired(1, CLIMATE, 0, "_TZE200_abc", "TS0601", &[0xEF00]))).unwrap();

    let err = replay_file(&catalog, &events, &CoreSettings::default(), false).unwrap_err();
    assert!(err.to_string().contains("capture.jsonl:2"));
}

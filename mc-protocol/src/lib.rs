use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global envelope ID counter for correlation
static ENVELOPE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for one line of the stack bridge (64KB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum length of a vendor or model identity string
const MAX_IDENTITY_LENGTH: usize = 64;

/// Maximum length of a device address string
const MAX_ADDRESS_LENGTH: usize = 32;

/// Maximum size of a single vendor frame carried in a cluster event
const MAX_FRAME_BYTES: usize = 1024;

/// Maximum number of endpoints announced for a single device
const MAX_ENDPOINTS: usize = 32;

/// Maximum length of a local event name
const MAX_EVENT_NAME_LENGTH: usize = 32;

/// Generate a unique envelope ID for correlation
pub fn generate_envelope_id() -> u64 {
    ENVELOPE_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Device addressing and discovery descriptors
// ============================================================================

/// Network address of a paired device (usually the IEEE address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(pub String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cluster as enumerated by the underlying mesh stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub id: u16,
    /// Local name the stack uses for the cluster, if any
    #[serde(default)]
    pub name: Option<String>,
}

impl ClusterDescriptor {
    pub fn new(id: u16) -> Self {
        Self { id, name: None }
    }
}

/// One endpoint with the clusters it exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: u8,
    pub clusters: Vec<ClusterDescriptor>,
}

impl EndpointDescriptor {
    pub fn new(id: u8, cluster_ids: &[u16]) -> Self {
        Self {
            id,
            clusters: cluster_ids.iter().copied().map(ClusterDescriptor::new).collect(),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// Attribute value as reported by the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl AttributeValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Float(f) => Some(*f),
            AttributeValue::Text(_) | AttributeValue::Bytes(_) => None,
        }
    }
}

/// Typed capability value emitted to the host device-state layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Bool(b) => write!(f, "{}", b),
            CapabilityValue::Number(n) => write!(f, "{}", n),
            CapabilityValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

// ============================================================================
// Stack -> core events
// ============================================================================

/// Payload of a cluster event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// A single attribute report
    Attribute { attribute: u16, value: AttributeValue },
    /// An opaque frame (vendor datapoint frames travel this way)
    Frame {
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
}

/// Event surfaced by the underlying mesh-network stack for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StackEvent {
    /// Device paired (or re-announced) with its full endpoint enumeration
    Paired {
        vendor_id: String,
        model_id: String,
        endpoints: Vec<EndpointDescriptor>,
    },
    /// Device removed from the network
    Unpaired,
    /// Event received on a cluster under a firmware-dependent local name
    Cluster {
        endpoint: u8,
        cluster: u16,
        name: String,
        payload: EventPayload,
    },
    /// Result of a deferred channel probe read
    ProbeResult { endpoint: u8, cluster: u16, ok: bool },
    /// Result of reading the zone-capable channel
    ZoneInfo {
        endpoint: u8,
        ok: bool,
        #[serde(default)]
        zone_type: Option<u16>,
    },
    /// Unsolicited (or solicited) zone enroll request from the device
    ZoneEnrollRequest { endpoint: u8, zone_type: u16 },
    /// Zone state attribute report
    ZoneState { endpoint: u8, enrolled: bool },
    /// Acknowledgement of a zone configuration write
    ZoneConfigWritten { endpoint: u8, ok: bool },
    /// Zone status change notification (alarm bits)
    ZoneStatus { endpoint: u8, status: u16 },
}

impl StackEvent {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            StackEvent::Paired { .. } => "paired",
            StackEvent::Unpaired => "unpaired",
            StackEvent::Cluster { .. } => "cluster",
            StackEvent::ProbeResult { .. } => "probe_result",
            StackEvent::ZoneInfo { .. } => "zone_info",
            StackEvent::ZoneEnrollRequest { .. } => "zone_enroll_request",
            StackEvent::ZoneState { .. } => "zone_state",
            StackEvent::ZoneConfigWritten { .. } => "zone_config_written",
            StackEvent::ZoneStatus { .. } => "zone_status",
        }
    }

    /// Validate event parameters before routing them to a device
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StackEvent::Paired { vendor_id, model_id, endpoints } => {
                validate_identity("vendor_id", vendor_id)?;
                validate_identity("model_id", model_id)?;
                if endpoints.len() > MAX_ENDPOINTS {
                    return Err(format!("Too many endpoints: {} (max {})", endpoints.len(), MAX_ENDPOINTS));
                }
                Ok(())
            }
            StackEvent::Cluster { name, payload, .. } => {
                if name.is_empty() || name.len() > MAX_EVENT_NAME_LENGTH {
                    return Err(format!("Invalid event name length: {}", name.len()));
                }
                if let EventPayload::Frame { bytes } = payload {
                    if bytes.len() > MAX_FRAME_BYTES {
                        return Err(format!("Frame too large: {} bytes (max {})", bytes.len(), MAX_FRAME_BYTES));
                    }
                }
                Ok(())
            }
            StackEvent::Unpaired
            | StackEvent::ProbeResult { .. }
            | StackEvent::ZoneInfo { .. }
            | StackEvent::ZoneEnrollRequest { .. }
            | StackEvent::ZoneState { .. }
            | StackEvent::ZoneConfigWritten { .. }
            | StackEvent::ZoneStatus { .. } => Ok(()),
        }
    }
}

/// One line received from the stack bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Unique envelope ID for correlation and debugging
    pub id: u64,
    pub device: DeviceAddress,
    /// Capture timestamp, used when replaying recorded logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(flatten)]
    pub event: StackEvent,
}

impl WireEnvelope {
    pub fn new(device: DeviceAddress, event: StackEvent) -> Self {
        Self {
            id: generate_envelope_id(),
            device,
            timestamp_ms: None,
            event,
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Validate the envelope before dispatching it
    pub fn validate(&self) -> Result<(), String> {
        validate_address(&self.device)?;
        self.event.validate()
    }
}

// ============================================================================
// Core -> host messages
// ============================================================================

/// Command the core asks the stack to send to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Read attributes of a channel (deferred probing)
    ReadAttributes { endpoint: u8, cluster: u16, attributes: Vec<u16> },
    /// Send an encoded vendor datapoint frame
    SendVendorFrame {
        endpoint: u8,
        cluster: u16,
        #[serde(with = "hex_bytes")]
        bytes: Vec<u8>,
    },
    /// Ask the vendor channel to report the given datapoints (dataQuery)
    QueryDatapoints { endpoint: u8, cluster: u16, dp_ids: Vec<u8> },
    /// Read zone type / zone state of the zone-capable channel
    ReadZoneInfo { endpoint: u8 },
    /// Answer the device's enroll request
    SendEnrollResponse { endpoint: u8, zone_id: u8 },
    /// Write zone configuration (CIE address and zone type) directly
    WriteZoneConfig { endpoint: u8, zone_type: u16 },
    /// Poll the zone status attribute
    PollZoneStatus { endpoint: u8 },
}

/// Message emitted to the host platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum HostMessage {
    Capability {
        device: DeviceAddress,
        capability: String,
        value: CapabilityValue,
    },
    Command {
        device: DeviceAddress,
        command: OutboundCommand,
    },
    Error {
        #[serde(default)]
        device: Option<DeviceAddress>,
        #[serde(default)]
        envelope_id: Option<u64>,
        message: String,
    },
}

impl HostMessage {
    pub fn error(device: Option<DeviceAddress>, envelope_id: Option<u64>, message: impl Into<String>) -> Self {
        HostMessage::Error {
            device,
            envelope_id,
            message: message.into(),
        }
    }

    /// Serialize to a single protocol line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, String> {
        let line = serde_json::to_string(self).map_err(|e| format!("Failed to serialize message: {}", e))?;
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(format!("Message too large: {} bytes", line.len()));
        }
        Ok(line)
    }
}

// ============================================================================
// Validation
// ============================================================================

fn validate_identity(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is empty", field));
    }
    if value.len() > MAX_IDENTITY_LENGTH {
        return Err(format!("{} too long: {} chars (max {})", field, value.len(), MAX_IDENTITY_LENGTH));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(format!("{} contains control characters", field));
    }
    Ok(())
}

/// Validate a device address: non-empty printable ASCII of bounded length
pub fn validate_address(address: &DeviceAddress) -> Result<(), String> {
    let s = address.as_str();
    if s.is_empty() {
        return Err("Device address is empty".into());
    }
    if s.len() > MAX_ADDRESS_LENGTH {
        return Err(format!("Device address too long: {} chars (max {})", s.len(), MAX_ADDRESS_LENGTH));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '-' || c == '_') {
        return Err(format!("Device address contains invalid characters: {}", s));
    }
    Ok(())
}

/// Parse one protocol line into a validated envelope
pub fn parse_envelope(line: &str) -> Result<WireEnvelope, String> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(format!("Message too large: {} bytes (max {})", line.len(), MAX_MESSAGE_SIZE));
    }
    let envelope: WireEnvelope =
        serde_json::from_str(line.trim()).map_err(|e| format!("Invalid envelope: {}", e))?;
    envelope.validate()?;
    Ok(envelope)
}

/// Serde helper carrying byte payloads as lowercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let trimmed = s.trim_start_matches("0x");
        hex::decode(trimmed).map_err(serde::de::Error::custom)
    }
}

//! Vendor datapoint wire format
//!
//! A frame is a big-endian u16 sequence number followed by one or more
//! datapoints, each `[dp_id:u8][type:u8][len:u16be][data]`. Multi-byte
//! payloads are big-endian.

use mc_error::{MeshcapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::codec::{
    DP_HEADER_LEN, SEQ_LEN, TYPE_BITMAP, TYPE_BOOL, TYPE_ENUM, TYPE_INT32, TYPE_RAW, TYPE_STRING,
};
use crate::timers::Millis;

/// Datapoint wire type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Raw,
    Boolean,
    Integer32,
    String,
    Enum,
    Bitmap,
}

impl DataType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            TYPE_RAW => Ok(DataType::Raw),
            TYPE_BOOL => Ok(DataType::Boolean),
            TYPE_INT32 => Ok(DataType::Integer32),
            TYPE_STRING => Ok(DataType::String),
            TYPE_ENUM => Ok(DataType::Enum),
            TYPE_BITMAP => Ok(DataType::Bitmap),
            other => Err(MeshcapError::UnknownDataType(other)),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            DataType::Raw => TYPE_RAW,
            DataType::Boolean => TYPE_BOOL,
            DataType::Integer32 => TYPE_INT32,
            DataType::String => TYPE_STRING,
            DataType::Enum => TYPE_ENUM,
            DataType::Bitmap => TYPE_BITMAP,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Raw => "raw",
            DataType::Boolean => "boolean",
            DataType::Integer32 => "integer32",
            DataType::String => "string",
            DataType::Enum => "enum",
            DataType::Bitmap => "bitmap",
        }
    }

    /// Whether a payload of `len` bytes is valid for this type
    pub fn accepts_len(&self, len: usize) -> bool {
        match self {
            DataType::Raw | DataType::String => true,
            DataType::Boolean | DataType::Enum => len == 1,
            DataType::Integer32 => len == 4,
            DataType::Bitmap => matches!(len, 1 | 2 | 4),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded datapoint value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DatapointValue {
    Raw(Vec<u8>),
    Boolean(bool),
    Integer32(i32),
    String(String),
    Enum(u8),
    /// Bitmap with its wire width in bytes (1, 2 or 4)
    Bitmap { bits: u32, width: u8 },
}

impl DatapointValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DatapointValue::Raw(_) => DataType::Raw,
            DatapointValue::Boolean(_) => DataType::Boolean,
            DatapointValue::Integer32(_) => DataType::Integer32,
            DatapointValue::String(_) => DataType::String,
            DatapointValue::Enum(_) => DataType::Enum,
            DatapointValue::Bitmap { .. } => DataType::Bitmap,
        }
    }

    /// Numeric view of the value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatapointValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            DatapointValue::Integer32(v) => Some(*v as f64),
            DatapointValue::Enum(v) => Some(*v as f64),
            DatapointValue::Bitmap { bits, .. } => Some(*bits as f64),
            DatapointValue::Raw(_) | DatapointValue::String(_) => None,
        }
    }

    /// Payload bytes as they appear on the wire
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            DatapointValue::Raw(b) => b.clone(),
            DatapointValue::Boolean(b) => vec![u8::from(*b)],
            DatapointValue::Integer32(v) => v.to_be_bytes().to_vec(),
            DatapointValue::String(s) => s.as_bytes().to_vec(),
            DatapointValue::Enum(v) => vec![*v],
            DatapointValue::Bitmap { bits, width } => match width {
                1 if *bits <= u8::MAX as u32 => vec![*bits as u8],
                2 if *bits <= u16::MAX as u32 => (*bits as u16).to_be_bytes().to_vec(),
                4 => bits.to_be_bytes().to_vec(),
                _ => {
                    return Err(MeshcapError::ValueOutOfRange {
                        dp_id: 0,
                        reason: format!("bitmap 0x{:x} does not fit width {}", bits, width),
                    })
                }
            },
        };
        if bytes.len() > u16::MAX as usize {
            return Err(MeshcapError::ValueOutOfRange {
                dp_id: 0,
                reason: format!("payload of {} bytes exceeds the 16-bit length field", bytes.len()),
            });
        }
        Ok(bytes)
    }

    fn from_wire(dp_id: u8, data_type: DataType, data: &[u8]) -> Result<Self> {
        if !data_type.accepts_len(data.len()) {
            return Err(MeshcapError::LengthMismatch {
                dp_id,
                data_type: data_type.to_string(),
                len: data.len(),
            });
        }
        Ok(match data_type {
            DataType::Raw => DatapointValue::Raw(data.to_vec()),
            DataType::Boolean => DatapointValue::Boolean(data[0] != 0),
            DataType::Integer32 => DatapointValue::Integer32(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            DataType::String => DatapointValue::String(String::from_utf8_lossy(data).into_owned()),
            DataType::Enum => DatapointValue::Enum(data[0]),
            DataType::Bitmap => {
                let bits = data.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
                DatapointValue::Bitmap {
                    bits,
                    width: data.len() as u8,
                }
            }
        })
    }
}

/// One datapoint inside a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    pub dp_id: u8,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(dp_id: u8, value: DatapointValue) -> Self {
        Self { dp_id, value }
    }
}

/// A decoded vendor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorFrame {
    pub seq: u16,
    pub datapoints: Vec<Datapoint>,
}

/// Stored datapoint with its receive metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatapointRecord {
    pub dp_id: u8,
    pub data_type: DataType,
    #[serde(with = "hex_serde")]
    pub raw_bytes: Vec<u8>,
    pub value: DatapointValue,
    pub timestamp: Millis,
    pub occurrence_count: u32,
}

mod hex_serde {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}

/// Decode a full frame. All-or-nothing: any malformed datapoint fails the frame.
pub fn decode_frame(buf: &[u8]) -> Result<VendorFrame> {
    if buf.len() < SEQ_LEN {
        return Err(MeshcapError::TruncatedFrame {
            needed: SEQ_LEN,
            available: buf.len(),
        });
    }
    let seq = u16::from_be_bytes([buf[0], buf[1]]);

    let mut datapoints = Vec::new();
    let mut offset = SEQ_LEN;
    while offset < buf.len() {
        let (dp, consumed) = decode_datapoint(&buf[offset..])?;
        datapoints.push(dp);
        offset += consumed;
    }

    Ok(VendorFrame { seq, datapoints })
}

/// Decode one datapoint from the start of `buf`. Returns it with the number
/// of bytes consumed.
pub fn decode_datapoint(buf: &[u8]) -> Result<(Datapoint, usize)> {
    if buf.len() < DP_HEADER_LEN {
        return Err(MeshcapError::TruncatedFrame {
            needed: DP_HEADER_LEN,
            available: buf.len(),
        });
    }
    let dp_id = buf[0];
    let data_type = DataType::from_tag(buf[1])?;
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

    let end = DP_HEADER_LEN + len;
    if buf.len() < end {
        return Err(MeshcapError::TruncatedFrame {
            needed: end,
            available: buf.len(),
        });
    }

    let value = DatapointValue::from_wire(dp_id, data_type, &buf[DP_HEADER_LEN..end])?;
    Ok((Datapoint { dp_id, value }, end))
}

/// Decode a frame into timestamped records
pub fn decode_records(buf: &[u8], timestamp: Millis) -> Result<(u16, Vec<DatapointRecord>)> {
    let frame = decode_frame(buf)?;
    let mut records = Vec::with_capacity(frame.datapoints.len());
    for dp in frame.datapoints {
        let raw_bytes = dp.value.to_wire()?;
        records.push(DatapointRecord {
            dp_id: dp.dp_id,
            data_type: dp.value.data_type(),
            raw_bytes,
            value: dp.value,
            timestamp,
            occurrence_count: 1,
        });
    }
    Ok((frame.seq, records))
}

/// Append one datapoint in wire form
pub fn encode_datapoint(dp: &Datapoint, out: &mut Vec<u8>) -> Result<()> {
    let payload = dp.value.to_wire().map_err(|e| match e {
        MeshcapError::ValueOutOfRange { reason, .. } => MeshcapError::ValueOutOfRange {
            dp_id: dp.dp_id,
            reason,
        },
        other => other,
    })?;
    out.push(dp.dp_id);
    out.push(dp.value.data_type().tag());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Encode a full frame
pub fn encode_frame(frame: &VendorFrame) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(SEQ_LEN + frame.datapoints.len() * (DP_HEADER_LEN + 4));
    out.extend_from_slice(&frame.seq.to_be_bytes());
    for dp in &frame.datapoints {
        encode_datapoint(dp, &mut out)?;
    }
    Ok(out)
}

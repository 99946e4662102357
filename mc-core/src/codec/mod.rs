//! Vendor datapoint codec and store

mod datapoint;
mod store;

pub use datapoint::{
    decode_datapoint, decode_frame, decode_records, encode_datapoint, encode_frame, DataType, Datapoint,
    DatapointRecord, DatapointValue, VendorFrame,
};
pub use store::{ApplyOutcome, DatapointStore};

use mc_error::{MeshcapError, Result};

use crate::catalog::Profile;

/// Encode an outbound command for one datapoint.
///
/// The datapoint must be declared by the profile with the same type the
/// value carries; undeclared ids and type mismatches are rejected before
/// anything is written.
pub fn encode_command(profile: &Profile, seq: u16, dp: &Datapoint) -> Result<Vec<u8>> {
    let decl = profile
        .datapoint(dp.dp_id)
        .ok_or(MeshcapError::UndeclaredDatapoint(dp.dp_id))?;

    let given = dp.value.data_type();
    if decl.data_type != given {
        return Err(MeshcapError::TypeMismatch {
            dp_id: dp.dp_id,
            declared: decl.data_type.to_string(),
            given: given.to_string(),
        });
    }

    if let (Some(width), DatapointValue::Bitmap { width: given_width, .. }) = (decl.bitmap_width, &dp.value) {
        if width != *given_width {
            return Err(MeshcapError::ValueOutOfRange {
                dp_id: dp.dp_id,
                reason: format!("bitmap width {} does not match declared width {}", given_width, width),
            });
        }
    }

    encode_frame(&VendorFrame {
        seq,
        datapoints: vec![dp.clone()],
    })
}

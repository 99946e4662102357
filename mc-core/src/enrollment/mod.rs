//! Alarm zone enrollment

mod machine;
mod zone;

pub use machine::{EnrollmentMachine, EnrollmentMethod, EnrollmentOutput, EnrollmentPhase, ZoneEvent};
pub use zone::{AlarmState, ZoneCategory};

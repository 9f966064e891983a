//! `setTime(..)setTimeZone(..)` clock updates
//!
//! The companion app pushes wall-clock time as Unix seconds followed by the
//! timezone offset. Each field is parsed independently; a non-numeric
//! argument aborts only that field's update.

use crate::ble::adapter::Clock;

/// Extract the argument between `key` and the following `)`
fn field_arg<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let start = body.find(key)? + key.len();
    let rest = &body[start..];
    let end = rest.find(')')?;
    Some(&rest[..end])
}

/// Apply a `setTime(..)setTimeZone(..)` command to the clock collaborator.
/// Offsets pass through in whole units; the collaborator owns the unit
/// contract.
pub fn parse_set_time(body: &str, clock: &dyn Clock) {
    match field_arg(body, "setTime(") {
        Some(arg) => match arg.trim().parse::<i64>() {
            Ok(seconds) => {
                tracing::debug!("Setting clock to {}", seconds);
                clock.set_realtime(seconds);
            }
            Err(_) => {
                tracing::warn!("Ignoring non-numeric setTime argument: {:?}", arg);
            }
        },
        None => tracing::warn!("Malformed setTime command"),
    }

    match field_arg(body, "setTimeZone(") {
        Some(arg) => match arg.trim().parse::<i32>() {
            Ok(offset) => {
                tracing::debug!("Setting timezone offset to {}", offset);
                clock.set_timezone(offset);
            }
            Err(_) => {
                tracing::warn!("Ignoring non-numeric setTimeZone argument: {:?}", arg);
            }
        },
        None => tracing::debug!("No timezone field present"),
    }
}

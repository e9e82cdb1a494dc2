//! Sensor presets and per-quantity sampling defaults.
//!
//! Pure lookups: nothing here touches a device.

use super::{ExperimentRequest, QuantityType, SensorRequest};

/// Fast default for force-like quantities, in seconds.
pub const FAST_PERIOD: f32 = 0.01;
/// Default for everything without a faster or slower need, in seconds.
pub const MEDIUM_PERIOD: f32 = 0.1;
/// Slow default for gas-concentration quantities, in seconds.
pub const SLOW_PERIOD: f32 = 1.0;

const TEMPERATURE: SensorRequest =
    SensorRequest::new(QuantityType::Temperature, -1, 0.0, 40.0, 0, 0.1);

/// Named presets, in lookup order. Several names can share one preset.
pub const PRESETS: &[(&str, SensorRequest)] = &[
    ("light", SensorRequest::new(QuantityType::Light, 0, 0.0, 4000.0, 0, 0.1)),
    ("position", SensorRequest::new(QuantityType::Distance, -2, 0.0, 4.0, 0, 0.1)),
    ("distance", SensorRequest::new(QuantityType::Distance, -2, 0.0, 4.0, 0, 0.1)),
    ("co2", SensorRequest::new(QuantityType::Co2Gas, 1, 0.0, 5000.0, 0, 20.0)),
    ("carbon dioxide", SensorRequest::new(QuantityType::Co2Gas, 1, 0.0, 5000.0, 0, 20.0)),
    ("carbon-dioxide", SensorRequest::new(QuantityType::Co2Gas, 1, 0.0, 5000.0, 0, 20.0)),
    ("force", SensorRequest::new(QuantityType::Force, -2, -4.0, 4.0, 0, 0.01)),
    ("force 5n", SensorRequest::new(QuantityType::Force, -2, -4.0, 4.0, 0, 0.01)),
    ("force 50n", SensorRequest::new(QuantityType::Force, -1, -40.0, 40.0, 0, 0.1)),
    ("o2", SensorRequest::new(QuantityType::OxygenGas, -2, 0.0, 100.0, 0, 0.01)),
    ("oxygen", SensorRequest::new(QuantityType::OxygenGas, -2, 0.0, 100.0, 0, 0.01)),
    ("ph", SensorRequest::new(QuantityType::Ph, -1, 0.0, 14.0, 0, 0.1)),
    ("temperature", TEMPERATURE),
];

/// Map a logical sensor name to its channel request, ignoring case.
///
/// `"manual"` yields an unconfigured request so the device reports whatever
/// is plugged in. Unrecognized names fall back to the temperature preset.
pub fn sensor_request_for(name: &str) -> SensorRequest {
    let name = name.trim().to_lowercase();
    if name == "manual" {
        return SensorRequest::default();
    }

    PRESETS
        .iter()
        .find(|(preset, _)| *preset == name)
        .map(|(_, request)| *request)
        .unwrap_or(TEMPERATURE)
}

/// Default sampling period for one quantity, in seconds.
pub fn default_period(quantity: QuantityType) -> f32 {
    match quantity {
        QuantityType::Co2Gas | QuantityType::OxygenGas => SLOW_PERIOD,
        QuantityType::Force => FAST_PERIOD,
        _ => MEDIUM_PERIOD,
    }
}

/// The fastest default period among `channels`, or `None` for an empty set.
pub fn acquisition_period(channels: &[SensorRequest]) -> Option<f32> {
    channels
        .iter()
        .map(|channel| default_period(channel.quantity()))
        .reduce(f32::min)
}

/// Build the continuous-acquisition request sent when configuring a device.
pub fn experiment_request(channels: &[SensorRequest]) -> ExperimentRequest {
    ExperimentRequest {
        period: acquisition_period(channels).unwrap_or(MEDIUM_PERIOD),
        number_of_samples: None,
        sensor_requests: channels.to_vec(),
    }
}

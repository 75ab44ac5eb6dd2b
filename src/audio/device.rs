//! Audio device enumeration for the host

use cpal::traits::{DeviceTrait, HostTrait};
use pyo3::prelude::*;

/// Information about an audio device
#[derive(Clone, Debug)]
#[pyclass]
pub struct DeviceInfo {
    #[pyo3(get)]
    pub name: String,
    #[pyo3(get)]
    pub sample_rate: u32,
    #[pyo3(get)]
    pub channels: u16,
    #[pyo3(get)]
    pub is_default: bool,
}

#[pymethods]
impl DeviceInfo {
    fn __repr__(&self) -> String {
        format!(
            "DeviceInfo(name='{}', sample_rate={}, channels={}, is_default={})",
            self.name, self.sample_rate, self.channels, self.is_default
        )
    }
}

/// List all available capture devices
#[pyfunction]
pub fn list_input_devices() -> PyResult<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(e.to_string()))?
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some(DeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
                name,
            })
        })
        .collect();

    Ok(devices)
}

/// List all available playback devices
#[pyfunction]
pub fn list_output_devices() -> PyResult<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(e.to_string()))?
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_output_config().ok()?;
            Some(DeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
                name,
            })
        })
        .collect();

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // Headless CI may report zero devices or an error; either is
        // acceptable as long as enumeration never panics.
        let _ = list_input_devices();
        let _ = list_output_devices();
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use super::config::DEVICE_WATCH_INTERVAL_SECS;
use super::errors::DeviceError;
use super::types::ChannelRouting;

/// Everything the selection policy needs to know about one output device.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub name: String,
    pub max_output_channels: u16,
    pub supports_f32: bool,
    pub is_default: bool,
}

/// The negotiated output: which device to open and how to lay channels on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPlan {
    pub device_name: String,
    pub channels: u16,
    pub routing: ChannelRouting,
}

/// Enumerates output-capable devices on the default host.
pub fn enumerate_outputs() -> Result<Vec<DeviceDescriptor>, DeviceError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut descriptors = Vec::new();
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
    for device in devices {
        let name = match device.name() {
            Ok(name) => name,
            Err(e) => {
                log::warn!("Devices: skipping unnamed output device: {}", e);
                continue;
            }
        };
        if descriptors.iter().any(|d: &DeviceDescriptor| d.name == name) {
            continue;
        }

        let mut max_output_channels = 0u16;
        let mut supports_f32 = false;
        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                max_output_channels = max_output_channels.max(config.channels());
                if config.sample_format() == SampleFormat::F32 {
                    supports_f32 = true;
                }
            }
        }

        descriptors.push(DeviceDescriptor {
            is_default: default_name.as_deref() == Some(&name),
            name,
            max_output_channels,
            supports_f32,
        });
    }

    log::debug!("Devices: enumerated {} output devices", descriptors.len());
    Ok(descriptors)
}

/// Finds the cpal device handle for a planned device name.
pub fn open_output(name: &str) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    // Name-stable lookup failed (device unplugged between plan and open).
    host.default_output_device().ok_or(DeviceError::Unavailable)
}

/// Resolves the configured device and routing into a concrete output plan.
///
/// Selection: the configured id wins when it exists with at least two f32
/// output channels; otherwise a known multi-channel interface (>= 4 outputs)
/// is preferred, then the first f32-capable device. The channel count is
/// `max(2, 1 + highest routed index)` clamped to the device; routing that the
/// device cannot carry collapses to stereo main {0, 1} with cue unrouted.
pub fn plan_output(
    descriptors: &[DeviceDescriptor],
    configured_id: Option<&str>,
    routing: ChannelRouting,
) -> Result<OutputPlan, DeviceError> {
    let usable = |d: &&DeviceDescriptor| d.supports_f32 && d.max_output_channels >= 2;

    let configured = configured_id.and_then(|id| {
        let found = descriptors.iter().filter(usable).find(|d| d.name == id);
        if found.is_none() {
            log::warn!("Devices: configured device '{}' unavailable; falling back", id);
        }
        found
    });

    let device = configured
        .or_else(|| {
            descriptors
                .iter()
                .filter(usable)
                .find(|d| d.max_output_channels >= 4)
        })
        .or_else(|| descriptors.iter().find(|d| d.supports_f32))
        .ok_or(DeviceError::Unavailable)?;

    let wanted = routing
        .max_used_index()
        .map(|max| max as u16 + 1)
        .unwrap_or(2)
        .max(2);

    let (channels, routing) = if wanted <= device.max_output_channels {
        (wanted, routing)
    } else {
        log::warn!(
            "Devices: routing needs {} channels but '{}' has {}; remapping to stereo",
            wanted,
            device.name,
            device.max_output_channels
        );
        (
            2,
            ChannelRouting {
                main: [Some(0), Some(1)],
                cue: [None, None],
            },
        )
    };

    Ok(OutputPlan {
        device_name: device.name.clone(),
        channels,
        routing,
    })
}

/// Polls the device list and reports output-count changes.
///
/// The control plane re-probes on a change; the watcher itself never touches
/// the running stream.
pub struct DeviceWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    pub fn spawn(on_change: impl Fn(usize) + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            let mut last_count = enumerate_outputs().map(|d| d.len()).unwrap_or(0);
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(DEVICE_WATCH_INTERVAL_SECS));
                let count = match enumerate_outputs() {
                    Ok(devices) => devices.len(),
                    Err(e) => {
                        log::warn!("Devices: watcher enumeration failed: {}", e);
                        continue;
                    }
                };
                if count != last_count {
                    log::info!("Devices: output count changed {} -> {}", last_count, count);
                    last_count = count;
                    on_change(count);
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, channels: u16, f32_ok: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            max_output_channels: channels,
            supports_f32: f32_ok,
            is_default: false,
        }
    }

    #[test]
    fn configured_device_wins_when_usable() {
        let devices = vec![
            descriptor("Built-in Output", 2, true),
            descriptor("DJ Interface", 4, true),
        ];
        let plan =
            plan_output(&devices, Some("Built-in Output"), ChannelRouting::default()).unwrap();
        assert_eq!(plan.device_name, "Built-in Output");
        assert_eq!(plan.channels, 2);
    }

    #[test]
    fn fallback_prefers_multichannel_interface() {
        let devices = vec![
            descriptor("Built-in Output", 2, true),
            descriptor("DJ Interface", 4, true),
        ];
        let plan = plan_output(&devices, Some("Gone"), ChannelRouting::default()).unwrap();
        assert_eq!(plan.device_name, "DJ Interface");
    }

    #[test]
    fn channel_count_covers_highest_routed_index() {
        let devices = vec![descriptor("DJ Interface", 8, true)];
        let routing = ChannelRouting {
            main: [Some(0), Some(1)],
            cue: [Some(2), Some(3)],
        };
        let plan = plan_output(&devices, None, routing).unwrap();
        assert_eq!(plan.channels, 4);
        assert_eq!(plan.routing, routing);
    }

    #[test]
    fn oversized_routing_remaps_to_stereo() {
        let devices = vec![descriptor("Built-in Output", 2, true)];
        let routing = ChannelRouting {
            main: [Some(0), Some(1)],
            cue: [Some(2), Some(3)],
        };
        let plan = plan_output(&devices, None, routing).unwrap();
        assert_eq!(plan.channels, 2);
        assert_eq!(plan.routing.main, [Some(0), Some(1)]);
        assert_eq!(plan.routing.cue, [None, None]);
    }

    #[test]
    fn non_float_devices_are_rejected() {
        let devices = vec![descriptor("Legacy Card", 2, false)];
        assert!(matches!(
            plan_output(&devices, None, ChannelRouting::default()),
            Err(DeviceError::Unavailable)
        ));
    }
}

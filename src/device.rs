//! GPU selection and VRAM mode types.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The device an instance is pinned to: a single GPU index or the CPU.
///
/// Wire shape is the string `"cpu"` or the decimal GPU index; a bare JSON
/// integer is accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(u8),
}

impl Device {
    /// Component used in derived instance ids: `cpu` or `gpu<i>`.
    pub fn id_component(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Gpu(i) => format!("gpu{i}"),
        }
    }

    /// Component used in log prefixes: `CPU` or `GPU<i>`.
    pub fn prefix_component(&self) -> String {
        match self {
            Device::Cpu => "CPU".to_string(),
            Device::Gpu(i) => format!("GPU{i}"),
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(i) => write!(f, "{i}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        s.parse::<u8>()
            .map(Device::Gpu)
            .map_err(|_| format!("invalid GPU device '{s}' (expected 'cpu' or an index)"))
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DeviceVisitor;

        impl Visitor<'_> for DeviceVisitor {
            type Value = Device;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"cpu\" or a GPU index")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Device, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Device, E> {
                u8::try_from(v)
                    .map(Device::Gpu)
                    .map_err(|_| E::custom(format!("GPU index {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Device, E> {
                u8::try_from(v)
                    .map(Device::Gpu)
                    .map_err(|_| E::custom(format!("GPU index {v} out of range")))
            }
        }

        deserializer.deserialize_any(DeviceVisitor)
    }
}

/// Engine VRAM management mode. Maps onto the engine's startup flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VramMode {
    Normal,
    Low,
    None,
    Cpu,
}

impl VramMode {
    pub fn flags(&self) -> &'static [&'static str] {
        match self {
            VramMode::Normal => &[],
            VramMode::Low => &["--lowvram"],
            VramMode::None => &["--novram"],
            VramMode::Cpu => &["--cpu"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VramMode::Normal => "normal",
            VramMode::Low => "low",
            VramMode::None => "none",
            VramMode::Cpu => "cpu",
        }
    }

    pub const ALL: &'static [VramMode] =
        &[VramMode::Normal, VramMode::Low, VramMode::None, VramMode::Cpu];
}

impl fmt::Display for VramMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

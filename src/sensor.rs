use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::decoder;
use crate::error::DecodeError;

// --- DeviceHealth ---
/// Device-level status carried once per fragment.
///
/// Every field is optional. A record with nothing set is the normal
/// "no health data in this fragment" value, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceHealth {
    /// Hex identifier of the hub (MAC-like, e.g. `4437190077C6`).
    pub device_id: Option<String>,
    /// Unix timestamp (seconds) of the hub's last update.
    pub last_update: Option<u64>,
    /// Radio link signal strength (dBm, negative).
    pub signal_strength: Option<f64>,
    /// Radio link quality (0..100 in practice).
    pub link_quality: Option<f64>,
    /// Battery level in percent. Not bounds-checked.
    pub battery_level: Option<f64>,
}

impl DeviceHealth {
    /// Decode a fragment, see [`decoder::decode_health`].
    pub fn decode(raw: Option<&str>) -> Self {
        decoder::decode_health(raw)
    }

    /// Replace every field from `raw`, or leave the record untouched.
    pub fn apply(&mut self, raw: Option<&str>) -> Result<(), DecodeError> {
        let decoded = decoder::try_decode_health(raw.unwrap_or_default())?;
        *self = decoded;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The device id as colon-separated octets, e.g. `44:37:19:00:77:C6`.
    ///
    /// Returns `None` if there is no id or it is not a whole number of hex
    /// octets. The stored id is never altered.
    pub fn mac_address(&self) -> Option<String> {
        let id = self.device_id.as_deref()?;
        let octets = hex::decode(id).ok()?;
        if octets.is_empty() {
            return None;
        }
        Some(
            octets
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }
}

// --- ChannelReading ---
/// Power draw of one metered channel.
///
/// `channel` is chosen by the caller before decoding and survives a failed
/// decode unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelReading {
    pub channel: u32,
    pub device_id: Option<String>,
    /// Instantaneous power in watts.
    pub current: Option<f64>,
    /// Energy used today in watt-hours.
    pub total_current: Option<f64>,
}

impl ChannelReading {
    /// An unset reading for `channel`.
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    /// Decode `channel` from a fragment, see [`decoder::decode_channel`].
    pub fn decode(raw: Option<&str>, channel: u32) -> Self {
        decoder::decode_channel(raw, channel)
    }

    /// Re-decode this reading's channel from `raw`. All data fields are
    /// replaced on success; on failure nothing changes.
    pub fn apply(&mut self, raw: Option<&str>) -> Result<(), DecodeError> {
        let decoded = decoder::try_decode_channel(raw.unwrap_or_default(), self.channel)?;
        *self = decoded;
        Ok(())
    }

    /// True when no data field is set. The channel number does not count.
    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.current.is_none() && self.total_current.is_none()
    }
}

// --- Telemetry ---
/// Everything decoded from one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Sender of the datagram.
    pub source: SocketAddr,
    pub health: DeviceHealth,
    /// One entry per requested channel, including channels with no data.
    pub readings: BTreeMap<u32, ChannelReading>,
}

impl Telemetry {
    /// Readings that actually carried data.
    pub fn populated(&self) -> impl Iterator<Item = &ChannelReading> {
        self.readings.values().filter(|r| !r.is_empty())
    }

    /// Sum of instantaneous power over every populated channel.
    pub fn total_power(&self) -> f64 {
        self.populated().filter_map(|r| r.current).sum()
    }
}

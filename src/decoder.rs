//! Decoders for OWL telemetry fragments.
//!
//! A fragment looks like markup but is not well-formed, so it is scanned
//! for a fixed sequence of literal tokens rather than parsed as a tree:
//!
//! ```text
//! <electricity id='ID'><timestamp>SECS</timestamp>
//! <signal rssi='-N' lqi='N'/><battery level='N%'/>
//! <chan id='K'><curr units='w'>D.D</curr><day units='wh'>D.D</day></chan>...
//! </electricity>
//! ```
//!
//! Each decoder either captures every field it needs or none of them.
//! The lenient entry points (`decode_*`) never fail: they log the reason
//! and hand back an unset record. The `try_decode_*` forms return the
//! [`DecodeError`] instead.

use std::collections::BTreeMap;

use tracing::{debug, error, info, trace, warn};

use crate::error::DecodeError;
use crate::sensor::{ChannelReading, DeviceHealth};

// --- Grammar ---
const ELECTRICITY_OPEN: &str = "<electricity id='";
const TIMESTAMP_OPEN: &str = "'><timestamp>";
const RSSI_OPEN: &str = "rssi='";
const LQI_OPEN: &str = "lqi='";
const LEVEL_OPEN: &str = "level='";
const CHAN_OPEN: &str = "chan id='";
const CHAN_CLOSE: &str = "'>";
const CURR_OPEN: &str = "<curr units='w'>";
const CURR_CLOSE: &str = "</curr>";
const DAY_OPEN: &str = "<day units='wh'>";
const DAY_CLOSE: &str = "</day";

/// Forward-only cursor over a fragment.
///
/// Every method consumes input only on success, except inside a probe
/// started by [`Scanner::seek_with`] or [`Scanner::seek_last_with`], which
/// is thrown away on failure.
#[derive(Debug, Clone, Copy)]
struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    /// Consume `lit` if the input starts with it.
    fn eat(&mut self, lit: &str) -> Option<()> {
        self.rest = self.rest.strip_prefix(lit)?;
        Some(())
    }

    /// Return the text before the next `lit` and move past `lit`.
    fn take_until(&mut self, lit: &str) -> Option<&'a str> {
        let pos = self.rest.find(lit)?;
        let head = &self.rest[..pos];
        self.rest = &self.rest[pos + lit.len()..];
        Some(head)
    }

    /// One or more ASCII digits.
    fn digits(&mut self) -> Option<&'a str> {
        let end = self
            .rest
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        Some(head)
    }

    /// `-` followed by digits, sign included in the capture.
    fn negative_digits(&mut self) -> Option<&'a str> {
        let start = self.rest;
        let mut probe = *self;
        probe.eat("-")?;
        let magnitude = probe.digits()?;
        *self = probe;
        Some(&start[..1 + magnitude.len()])
    }

    /// Fixed-point decimal: digits, `.`, digits.
    fn decimal(&mut self) -> Option<&'a str> {
        let start = self.rest;
        let mut probe = *self;
        let whole = probe.digits()?;
        probe.eat(".")?;
        let fraction = probe.digits()?;
        *self = probe;
        Some(&start[..whole.len() + 1 + fraction.len()])
    }

    /// Try `f` after each occurrence of `lit`, left to right, and commit to
    /// the first attempt that succeeds.
    fn seek_with<T>(
        &mut self,
        lit: &str,
        mut f: impl FnMut(&mut Scanner<'a>) -> Option<T>,
    ) -> Option<T> {
        let mut from = 0;
        while let Some(pos) = self.rest[from..].find(lit) {
            let after = from + pos + lit.len();
            let mut probe = Scanner::new(&self.rest[after..]);
            if let Some(value) = f(&mut probe) {
                *self = probe;
                return Some(value);
            }
            from = after;
        }
        None
    }

    /// Try `f` after every occurrence of `lit` and commit to the last
    /// attempt that succeeds. Repeated fields resolve to the latest value.
    fn seek_last_with<T>(
        &mut self,
        lit: &str,
        mut f: impl FnMut(&mut Scanner<'a>) -> Option<T>,
    ) -> Option<T> {
        let mut from = 0;
        let mut last = None;
        while let Some(pos) = self.rest[from..].find(lit) {
            let after = from + pos + lit.len();
            let mut probe = Scanner::new(&self.rest[after..]);
            if let Some(value) = f(&mut probe) {
                last = Some((value, probe));
            }
            from = after;
        }
        let (value, probe) = last?;
        *self = probe;
        Some(value)
    }
}

// --- Numeric helpers ---
fn parse_int<T: std::str::FromStr>(numeral: &str, field: &str) -> Result<T, DecodeError> {
    numeral
        .parse()
        .map_err(|_| DecodeError::malformed(format!("{field} '{numeral}' out of range")))
}

fn parse_float(numeral: &str, field: &str) -> Result<f64, DecodeError> {
    numeral
        .parse()
        .map_err(|_| DecodeError::malformed(format!("{field} '{numeral}' is not a number")))
}

/// The `<electricity id='..'><timestamp>` preamble shared by both decoders.
fn preamble<'a>(scanner: &mut Scanner<'a>) -> Result<&'a str, DecodeError> {
    scanner.skip_ws();
    scanner
        .eat(ELECTRICITY_OPEN)
        .ok_or(DecodeError::no_match("<electricity id='ID'>"))?;
    scanner
        .take_until(TIMESTAMP_OPEN)
        .ok_or(DecodeError::no_match("<timestamp>"))
}

/// `-N' lqi='N'`, following `rssi='`.
fn signal_pair<'a>(scanner: &mut Scanner<'a>) -> Option<(&'a str, &'a str)> {
    let rssi = scanner.negative_digits()?;
    scanner.eat("'")?;
    scanner.skip_ws();
    scanner.eat(LQI_OPEN)?;
    let lqi = scanner.digits()?;
    scanner.eat("'")?;
    Some((rssi, lqi))
}

/// `N%`, following `level='`.
fn battery_level<'a>(scanner: &mut Scanner<'a>) -> Option<&'a str> {
    let level = scanner.digits()?;
    scanner.eat("%")?;
    Some(level)
}

/// `<curr units='w'>D.D</curr><day units='wh'>D.D</day`
fn channel_block<'a>(scanner: &mut Scanner<'a>) -> Option<(&'a str, &'a str)> {
    scanner.skip_ws();
    scanner.eat(CURR_OPEN)?;
    let current = scanner.decimal()?;
    scanner.eat(CURR_CLOSE)?;
    scanner.skip_ws();
    scanner.eat(DAY_OPEN)?;
    let total = scanner.decimal()?;
    scanner.eat(DAY_CLOSE)?;
    Some((current, total))
}

fn channel_reading(
    device_id: &str,
    index: &str,
    current: &str,
    total: &str,
) -> Result<ChannelReading, DecodeError> {
    Ok(ChannelReading {
        channel: parse_int(index, "channel")?,
        device_id: Some(device_id.to_string()),
        current: Some(parse_float(current, "current")?),
        total_current: Some(parse_float(total, "day total")?),
    })
}

// --- Device health ---
/// Decode device identity, timestamp, signal and battery from a fragment.
///
/// Fails unless every field is present in order: id, timestamp, rssi, lqi,
/// battery level. When the signal pair or battery level repeats, the last
/// signal pair followed by a battery level wins, then the last level after it.
pub fn try_decode_health(raw: &str) -> Result<DeviceHealth, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::Absent);
    }

    let mut scanner = Scanner::new(raw);
    let device_id = preamble(&mut scanner)?;

    let timestamp = scanner
        .digits()
        .ok_or(DecodeError::no_match("<timestamp>SECONDS"))?;
    scanner
        .eat("<")
        .ok_or(DecodeError::no_match("</timestamp>"))?;

    let found = scanner.seek_last_with(RSSI_OPEN, |s| {
        let (rssi, lqi) = signal_pair(s)?;
        let level = s.seek_last_with(LEVEL_OPEN, battery_level)?;
        Some((rssi, lqi, level))
    });

    let Some((rssi, lqi, level)) = found else {
        let mut signal_only = scanner;
        return Err(match signal_only.seek_with(RSSI_OPEN, signal_pair) {
            Some(_) => DecodeError::no_match("level='N%'"),
            None => DecodeError::no_match("rssi='-N' lqi='N'"),
        });
    };

    Ok(DeviceHealth {
        device_id: Some(device_id.to_string()),
        last_update: Some(parse_int(timestamp, "timestamp")?),
        signal_strength: Some(parse_float(rssi, "rssi")?),
        link_quality: Some(parse_float(lqi, "lqi")?),
        battery_level: Some(parse_float(level, "battery level")?),
    })
}

/// Decode device health, folding every failure into an unset record.
pub fn decode_health(raw: Option<&str>) -> DeviceHealth {
    match try_decode_health(raw.unwrap_or_default()) {
        Ok(health) => {
            debug!(
                device_id = health.device_id.as_deref().unwrap_or_default(),
                last_update = health.last_update,
                rssi = health.signal_strength,
                lqi = health.link_quality,
                battery = health.battery_level,
                "Decoded device health"
            );
            health
        }
        Err(DecodeError::Absent) => {
            debug!("No fragment, device health left unset");
            DeviceHealth::default()
        }
        Err(e @ DecodeError::NoMatch { .. }) => {
            info!(error = %e, "No device health data in fragment");
            DeviceHealth::default()
        }
        Err(e @ DecodeError::Malformed { .. }) => {
            error!(error = %e, "Failed to decode device health");
            DeviceHealth::default()
        }
    }
}

/// Decode device health from a raw datagram payload.
///
/// A payload that is not UTF-8 text is logged and yields an unset record.
pub fn decode_health_bytes(raw: &[u8]) -> DeviceHealth {
    match std::str::from_utf8(raw) {
        Ok(text) => decode_health(Some(text)),
        Err(e) => {
            error!(error = %e, bytes = raw.len(), "Fragment is not text, device health left unset");
            DeviceHealth::default()
        }
    }
}

// --- Channel readings ---
/// Decode the reading for `channel` from a fragment.
///
/// Only the block tagged `chan id='channel'` is considered; blocks for other
/// channels are skipped. If the channel repeats, the last complete block wins.
pub fn try_decode_channel(raw: &str, channel: u32) -> Result<ChannelReading, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::Absent);
    }

    let mut scanner = Scanner::new(raw);
    let device_id = preamble(&mut scanner)?;

    let wanted = channel.to_string();
    let found = scanner.seek_last_with(CHAN_OPEN, |s| {
        let index = s.digits()?;
        if index != wanted {
            return None;
        }
        s.eat(CHAN_CLOSE)?;
        let (current, total) = channel_block(s)?;
        Some((index, current, total))
    });

    let Some((index, current, total)) = found else {
        let tag = format!("{CHAN_OPEN}{wanted}{CHAN_CLOSE}");
        return Err(if raw.contains(&tag) {
            DecodeError::no_match("<curr units='w'>D.D</curr><day units='wh'>D.D</day>")
        } else {
            DecodeError::no_match("chan id='N'")
        });
    };

    channel_reading(device_id, index, current, total)
}

/// Decode the reading for `channel`, folding every failure into a reading
/// that keeps `channel` and has no data.
pub fn decode_channel(raw: Option<&str>, channel: u32) -> ChannelReading {
    match try_decode_channel(raw.unwrap_or_default(), channel) {
        Ok(reading) => {
            debug!(channel, current = reading.current, "Decoded current");
            debug!(channel, total = reading.total_current, "Decoded day total");
            reading
        }
        Err(DecodeError::Absent) => {
            debug!(channel, "No fragment, channel reading left unset");
            ChannelReading::new(channel)
        }
        Err(e @ DecodeError::NoMatch { .. }) => {
            warn!(channel, error = %e, "No data available on channel");
            ChannelReading::new(channel)
        }
        Err(e @ DecodeError::Malformed { .. }) => {
            error!(channel, error = %e, "Failed to decode channel reading");
            ChannelReading::new(channel)
        }
    }
}

/// Decode `channel` from a raw datagram payload.
pub fn decode_channel_bytes(raw: &[u8], channel: u32) -> ChannelReading {
    match std::str::from_utf8(raw) {
        Ok(text) => decode_channel(Some(text), channel),
        Err(e) => {
            error!(channel, error = %e, bytes = raw.len(), "Fragment is not text, channel reading left unset");
            ChannelReading::new(channel)
        }
    }
}

/// Decode every well-formed channel block in one pass.
///
/// Malformed blocks are skipped. When a channel appears more than once the
/// last complete block wins. Returns an empty map if the preamble is missing.
pub fn decode_channels(raw: &str) -> BTreeMap<u32, ChannelReading> {
    let mut readings = BTreeMap::new();

    let mut scanner = Scanner::new(raw);
    let device_id = match preamble(&mut scanner) {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "No channel data in fragment");
            return readings;
        }
    };

    while let Some((index, current, total)) = scanner.seek_with(CHAN_OPEN, |s| {
        let index = s.digits()?;
        s.eat(CHAN_CLOSE)?;
        let (current, total) = channel_block(s)?;
        Some((index, current, total))
    }) {
        match channel_reading(device_id, index, current, total) {
            Ok(reading) => {
                trace!(channel = reading.channel, "Decoded channel block");
                readings.insert(reading.channel, reading);
            }
            Err(e) => warn!(error = %e, "Skipping channel block"),
        }
    }

    readings
}

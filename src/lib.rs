//! Decoder and listener for OWL Intuition energy monitor telemetry.
//!
//! The hub multicasts short markup-like fragments carrying its own health
//! (radio signal, battery) and per-channel power draw. [`decoder`] turns a
//! fragment into a [`DeviceHealth`] and one [`ChannelReading`] per channel
//! of interest without ever failing the caller; [`client`] receives the
//! fragments off the network.

pub mod client;
pub mod decoder;
pub mod error;
pub mod sensor;

pub use client::{ClientConfig, Datagram, OwlClient};
pub use decoder::{
    decode_channel, decode_channel_bytes, decode_channels, decode_health, decode_health_bytes,
    try_decode_channel, try_decode_health,
};
pub use error::{ClientError, DecodeError};
pub use sensor::{ChannelReading, DeviceHealth, Telemetry};

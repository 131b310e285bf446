//! Protocol module for decoding beacon payloads.
//!
//! This module contains the implementation of the fixed five-byte
//! weather payload layout.

pub mod payload;

pub use payload::{decode, RawWeatherSample, WeatherPayload};

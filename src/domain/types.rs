//! Shared types for the headrest controller

use serde::{Serialize, Serializer};

/// Speed of sound used for echo timing (cm/s at ~20°C)
pub const SPEED_OF_SOUND_CM_PER_S: f64 = 34_300.0;

/// Round a centimeter value to 2 decimal places for reporting
#[inline]
pub fn round_cm(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Newtype wrapper for GPIO line numbers (BCM numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PinId(pub u32);

impl std::fmt::Display for PinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digital signal level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[inline]
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// A single valid distance reading in centimeters (full precision)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct DistanceSample(f64);

impl DistanceSample {
    /// Build a sample from a centimeter value.
    /// Returns None for negative or non-finite values.
    pub fn from_cm(cm: f64) -> Option<Self> {
        if cm.is_finite() && cm >= 0.0 {
            Some(Self(cm))
        } else {
            None
        }
    }

    /// Convert an echo high-time into a one-way distance
    pub fn from_echo_secs(secs: f64) -> Option<Self> {
        Self::from_cm(secs * SPEED_OF_SOUND_CM_PER_S / 2.0)
    }

    #[inline]
    pub fn cm(self) -> f64 {
        self.0
    }

    /// Reported value, rounded to 2 decimals
    #[inline]
    pub fn rounded(self) -> f64 {
        round_cm(self.0)
    }
}

impl std::fmt::Display for DistanceSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Outcome of one rangefinder measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Distance(DistanceSample),
    /// Echo edge not observed within the timeout
    NoEcho,
}

/// Seat occupancy reported by the seat module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeatToken {
    Seated,
    Empty,
}

impl SeatToken {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatToken::Seated => "SEATED",
            SeatToken::Empty => "EMPTY",
        }
    }
}

impl Serialize for SeatToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Derived posture classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Posture {
    Good,
    Bad,
    Empty,
}

impl Posture {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Posture::Good => "GOOD",
            Posture::Bad => "BAD",
            Posture::Empty => "EMPTY",
        }
    }

    /// Gauge value for metrics (0=empty, 1=good, 2=bad)
    #[inline]
    pub fn gauge(&self) -> u64 {
        match self {
            Posture::Empty => 0,
            Posture::Good => 1,
            Posture::Bad => 2,
        }
    }
}

impl Serialize for Posture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Command sent to the seat module's vibration motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Vibrate,
    StopVibrate,
}

impl PeerCommand {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerCommand::Vibrate => "vibrate",
            PeerCommand::StopVibrate => "stop_vibrate",
        }
    }
}

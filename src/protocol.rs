//! Wire Protocol Module
//!
//! JSON text frames exchanged over the realtime channel. One object per frame,
//! tagged by its `type` field.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned identifier of an emergency-sharing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages sent by this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    StartSession,
    EmergencyAlert {
        lat: f64,
        lng: f64,
    },
    LocationUpdate {
        lat: f64,
        lng: f64,
        accuracy: Option<f64>,
    },
    EndSession {
        session_id: Option<SessionId>,
    },
}

impl OutboundMessage {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::StartSession => "start_session",
            OutboundMessage::EmergencyAlert { .. } => "emergency_alert",
            OutboundMessage::LocationUpdate { .. } => "location_update",
            OutboundMessage::EndSession { .. } => "end_session",
        }
    }

    /// Validate and encode as a text frame.
    pub fn to_frame(&self) -> Result<String, FrameError> {
        match self {
            OutboundMessage::EmergencyAlert { lat, lng } => check_coordinates(*lat, *lng)?,
            OutboundMessage::LocationUpdate { lat, lng, accuracy } => {
                check_coordinates(*lat, *lng)?;
                if let Some(accuracy) = accuracy {
                    if !accuracy.is_finite() || *accuracy < 0.0 {
                        return Err(FrameError::InvalidAccuracy(*accuracy));
                    }
                }
            }
            OutboundMessage::StartSession | OutboundMessage::EndSession { .. } => {}
        }

        serde_json::to_string(self).map_err(|e| FrameError::Encode(e.to_string()))
    }
}

fn check_coordinates(lat: f64, lng: f64) -> Result<(), FrameError> {
    let lat_ok = lat.is_finite() && (-90.0..=90.0).contains(&lat);
    let lng_ok = lng.is_finite() && (-180.0..=180.0).contains(&lng);
    if lat_ok && lng_ok {
        Ok(())
    } else {
        Err(FrameError::InvalidCoordinates { lat, lng })
    }
}

/// Messages pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SessionStarted {
        session_id: SessionId,
    },
    ContactStarted {
        user_id: UserId,
    },
    ContactEnded {
        user_id: UserId,
    },
    ContactLocation {
        user_id: UserId,
        lat: f64,
        lng: f64,
        #[serde(default)]
        accuracy: Option<f64>,
    },
    /// Any `type` this client does not understand
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Decode a text frame.
    pub fn from_frame(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::SessionStarted { .. } => "session_started",
            InboundMessage::ContactStarted { .. } => "contact_started",
            InboundMessage::ContactEnded { .. } => "contact_ended",
            InboundMessage::ContactLocation { .. } => "contact_location",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// Frame encode/decode errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Coordinates out of range: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error("Invalid accuracy: {0}")]
    InvalidAccuracy(f64),
}

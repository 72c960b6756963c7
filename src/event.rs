//! Feed event model.
//!
//! Every message carries `_id`, `code` and `time`. The code selects the
//! payload shape; codes without a notification rule parse as [`EventKind::Other`].

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::scale::SCALE_UNKNOWN;

pub const CODE_JMA_QUAKE: i32 = 551;
pub const CODE_EEW: i32 = 556;
pub const CODE_USERQUAKE_EVALUATION: i32 = 9611;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Display name of a feed code, if it is one the feed documents.
pub fn code_name(code: i32) -> Option<&'static str> {
    let name = match code {
        551 => "JMAQuake",
        552 => "JMATsunami",
        554 => "EEWDetection",
        555 => "Areapeers",
        556 => "EEW",
        561 => "Userquake",
        9611 => "UserquakeEvaluation",
        _ => return None,
    };
    Some(name)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "_id")]
    id: String,
    code: i32,
    time: String,
}

/// A parsed feed message. Never mutated after parsing.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub code: i32,
    pub time: String,
    pub kind: EventKind,
    /// The payload as received, for persistence.
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    QuakeObservation(QuakeObservation),
    EarlyWarning(EarlyWarning),
    UserquakeEvaluation(UserquakeEvaluation),
    Other,
}

impl Event {
    pub fn parse(text: &str) -> Result<Self, EventError> {
        let raw: Value = serde_json::from_str(text)?;
        let envelope = Envelope::deserialize(&raw)?;

        let kind = match envelope.code {
            CODE_JMA_QUAKE => EventKind::QuakeObservation(QuakeObservation::deserialize(&raw)?),
            CODE_EEW => EventKind::EarlyWarning(EarlyWarning::deserialize(&raw)?),
            CODE_USERQUAKE_EVALUATION => {
                EventKind::UserquakeEvaluation(UserquakeEvaluation::deserialize(&raw)?)
            }
            _ => EventKind::Other,
        };

        Ok(Self {
            id: envelope.id,
            code: envelope.code,
            time: envelope.time,
            kind,
            raw,
        })
    }

    pub fn name(&self) -> String {
        code_name(self.code)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unknown({})", self.code))
    }
}

/// Code 551: intensities observed per area. Points arrive ordered by
/// intensity, so the first one is representative.
#[derive(Debug, Clone, Deserialize)]
pub struct QuakeObservation {
    #[serde(default)]
    pub points: Vec<ObservationPoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationPoint {
    pub pref: String,
    pub scale: i32,
}

impl QuakeObservation {
    pub fn primary(&self) -> Option<&ObservationPoint> {
        self.points.first()
    }
}

/// Code 556: earthquake early warning.
#[derive(Debug, Clone, Deserialize)]
pub struct EarlyWarning {
    #[serde(default)]
    pub areas: Vec<WarningArea>,
    #[serde(default)]
    pub issue: Issue,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningArea {
    pub name: String,
    pub scale_from: i32,
    pub scale_to: i32,
}

impl WarningArea {
    /// The upper bound, or the lower bound when the upper one is unknown.
    pub fn effective_scale(&self) -> i32 {
        if self.scale_to == SCALE_UNKNOWN {
            self.scale_from
        } else {
            self.scale_to
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Issue {
    #[serde(default, deserialize_with = "lenient_serial")]
    pub serial: Option<u32>,
}

impl EarlyWarning {
    pub fn primary(&self) -> Option<&WarningArea> {
        self.areas.first()
    }

    /// Issue serial; a missing or unreadable serial counts as the first report.
    pub fn serial(&self) -> u32 {
        self.issue.serial.unwrap_or(1)
    }
}

/// The feed sends the serial as a string; accept numbers too.
fn lenient_serial<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    })
}

/// Code 9611: evaluation of user-sensed shaking reports.
#[derive(Debug, Clone, Deserialize)]
pub struct UserquakeEvaluation {
    pub started_at: String,
    #[serde(default)]
    pub area_confidences: HashMap<String, AreaConfidence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaConfidence {
    #[serde(default)]
    pub count: u64,
    pub confidence: f64,
}

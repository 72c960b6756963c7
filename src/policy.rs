//! Notification policy: which events get a jingle and a spoken announcement.
//!
//! - 551 quake observation: info jingle, then "{area}で、震度Nの地震が発生しました"
//! - 556 early warning: eew1 + "震度N、{area}" for the first report,
//!   eew2 + "震度N" for follow-ups
//! - 9611 user-sensed evaluation: detect jingle once per episode when a
//!   watched area is confident enough
//!
//! Voice playback waits for both the synthesis and a minimum gap after the
//! jingle, whichever finishes last.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::event::{EarlyWarning, Event, EventKind, QuakeObservation, UserquakeEvaluation};
use crate::player::{Jingle, Player};
use crate::scale::{Scale, ScaleError};
use crate::voice::{Synthesizer, VoiceError};

/// Minimum confidence for a watched area to count as detected.
pub const DETECT_CONFIDENCE: f64 = 0.2;

const QUAKE_VOICE_DELAY: Duration = Duration::from_millis(800);
const WARNING_FIRST_VOICE_DELAY: Duration = Duration::from_millis(1000);
const WARNING_FOLLOWUP_VOICE_DELAY: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Scale(#[from] ScaleError),

    #[error(transparent)]
    Voice(#[from] VoiceError),
}

#[derive(Debug, Clone, Default)]
pub struct PolicySettings {
    /// Nothing is played at or below this intensity.
    pub silent: Option<Scale>,
    /// Watched areas for user-sensed evaluations, first qualifying one wins.
    pub detect_areas: Vec<String>,
}

pub struct NotificationPolicy {
    settings: PolicySettings,
    voice: Arc<dyn Synthesizer>,
    player: Arc<dyn Player>,
    /// `started_at` of the last evaluation that played the detect jingle.
    last_detected: Mutex<Option<String>>,
}

impl NotificationPolicy {
    pub fn new(settings: PolicySettings, voice: Arc<dyn Synthesizer>, player: Arc<dyn Player>) -> Self {
        Self {
            settings,
            voice,
            player,
            last_detected: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn with_last_detected(self, started_at: Option<String>) -> Self {
        *self.last_detected.lock().unwrap() = started_at;
        self
    }

    #[cfg(test)]
    pub fn last_detected(&self) -> Option<String> {
        self.last_detected.lock().unwrap().clone()
    }

    pub async fn on_event(&self, event: &Event) -> Result<(), NotifyError> {
        match &event.kind {
            EventKind::QuakeObservation(quake) => self.on_quake(quake).await,
            EventKind::EarlyWarning(warning) => self.on_warning(warning).await,
            EventKind::UserquakeEvaluation(evaluation) => {
                self.on_evaluation(evaluation);
                Ok(())
            }
            EventKind::Other => Ok(()),
        }
    }

    fn is_silenced(&self, scale: Scale) -> bool {
        match self.settings.silent {
            Some(threshold) if scale <= threshold => {
                info!("Skipped sound playback: {scale} (silent: <= {threshold})");
                true
            }
            _ => false,
        }
    }

    async fn on_quake(&self, quake: &QuakeObservation) -> Result<(), NotifyError> {
        let Some(point) = quake.primary() else {
            return Ok(());
        };
        let scale = Scale::from_code(point.scale)?;
        if self.is_silenced(scale) {
            return Ok(());
        }

        self.player.play_jingle(Jingle::QuakeInfo);
        let (voice, ()) = tokio::join!(
            self.voice.quake_observation_voice(&point.pref, scale),
            tokio::time::sleep(QUAKE_VOICE_DELAY),
        );
        self.player.play(&voice?);
        Ok(())
    }

    async fn on_warning(&self, warning: &EarlyWarning) -> Result<(), NotifyError> {
        let Some(area) = warning.primary() else {
            debug!("Early warning without areas (cancelled: {})", warning.cancelled);
            return Ok(());
        };
        let scale = Scale::from_code(area.effective_scale())?;
        if self.is_silenced(scale) {
            return Ok(());
        }

        let voice = if warning.serial() > 1 {
            self.player.play_jingle(Jingle::WarningFollowup);
            let (voice, ()) = tokio::join!(
                self.voice.warning_followup_voice(scale),
                tokio::time::sleep(WARNING_FOLLOWUP_VOICE_DELAY),
            );
            voice?
        } else {
            self.player.play_jingle(Jingle::WarningFirst);
            let (voice, ()) = tokio::join!(
                self.voice.warning_voice(&area.name, scale),
                tokio::time::sleep(WARNING_FIRST_VOICE_DELAY),
            );
            voice?
        };
        self.player.play(&voice);
        Ok(())
    }

    fn on_evaluation(&self, evaluation: &UserquakeEvaluation) {
        if self.settings.detect_areas.is_empty() {
            return;
        }

        let mut last = self.last_detected.lock().unwrap();
        if last.as_deref() == Some(evaluation.started_at.as_str()) {
            return;
        }

        let detected = self.settings.detect_areas.iter().find_map(|area| {
            evaluation
                .area_confidences
                .get(area)
                .filter(|c| c.confidence >= DETECT_CONFIDENCE)
                .map(|c| (area, c))
        });

        if let Some((area, c)) = detected {
            info!(
                "Shaking detected in {area}: confidence {:.2} from {} reports (started at {})",
                c.confidence, c.count, evaluation.started_at
            );
            self.player.play_jingle(Jingle::Detected);
            *last = Some(evaluation.started_at.clone());
        }
    }
}

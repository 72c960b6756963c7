//! Fire-and-forget audio playback through an external player (aplay).
//!
//! The player process is spawned detached from the caller, in its own process
//! group so a terminal Ctrl+C does not cut an announcement short. Its exit
//! status is never observed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::PlayerConfig;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Failed to launch {command}: {source}")]
    LaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pre-recorded sounds shipped in the sounds directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jingle {
    Connected,
    Disconnected,
    QuakeInfo,
    WarningFirst,
    WarningFollowup,
    Detected,
}

impl Jingle {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Connected => "tada.wav",
            Self::Disconnected => "chimes.wav",
            Self::QuakeInfo => "info.wav",
            Self::WarningFirst => "eew1.wav",
            Self::WarningFollowup => "eew2.wav",
            Self::Detected => "detect.wav",
        }
    }
}

pub trait Player: Send + Sync {
    /// Start playback and return immediately. Failures are logged, never returned.
    fn play(&self, path: &Path);

    fn play_jingle(&self, jingle: Jingle);
}

pub struct CommandPlayer {
    command: String,
    sounds_dir: PathBuf,
}

impl CommandPlayer {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            command: config.command.clone(),
            sounds_dir: config.sounds_dir.clone(),
        }
    }

    pub fn jingle_path(&self, jingle: Jingle) -> PathBuf {
        self.sounds_dir.join(jingle.file_name())
    }

    fn spawn(&self, path: &Path) -> Result<(), PlayerError> {
        let mut command = Command::new(&self.command);
        command
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .map_err(|source| PlayerError::LaunchFailed {
                command: self.command.clone(),
                source,
            })?;
        Ok(())
    }
}

impl Player for CommandPlayer {
    fn play(&self, path: &Path) {
        if !path.exists() {
            warn!("Sound file not found: {}", path.display());
            return;
        }

        match self.spawn(path) {
            Ok(()) => info!("Playing: {}", path.display()),
            Err(e) => error!("Error playing sound: {e}"),
        }
    }

    fn play_jingle(&self, jingle: Jingle) {
        self.play(&self.jingle_path(jingle));
    }
}

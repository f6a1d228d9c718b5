//! Notification sink for new build outcomes.
//!
//! [`Notifier`] is the only seam the poll loop sees. The platform-specific
//! part (which text-to-speech program exists) is resolved once, when the
//! notifier is selected, never inside the loop.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),

    #[error("speech command failed: {0}")]
    Failed(String),

    #[error("speech command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `message`. `succeeded` lets a sink vary tone or urgency.
    async fn announce(&self, message: &str, succeeded: bool) -> Result<(), NotifierError>;

    /// Short human-readable description for logs and `status`.
    fn describe(&self) -> String;
}

/// Speaks messages by running an external program with the message as the
/// last argument.
pub struct SpeechNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SpeechNotifier {
    /// `command` is the program followed by its fixed arguments.
    pub fn new(command: Vec<String>, timeout: Duration) -> Option<Self> {
        let mut parts = command.into_iter();
        let program = parts.next().filter(|p| !p.is_empty())?;
        Some(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

#[async_trait]
impl Notifier for SpeechNotifier {
    async fn announce(&self, message: &str, _succeeded: bool) -> Result<(), NotifierError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(message)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(NotifierError::Unavailable(format!("{}: {e}", self.program)))
            }
            Err(_) => return Err(NotifierError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NotifierError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Picks the notifier for `config`: `None` when speech is disabled or no
/// speech program is available, in which case announcements are only logged.
pub fn select(config: &Config) -> Option<Box<dyn Notifier>> {
    if !config.speech_enabled {
        return None;
    }
    let command = match &config.speech_command {
        Some(custom) => custom.split_whitespace().map(str::to_string).collect(),
        None => detect_speech_command()?,
    };
    let notifier = SpeechNotifier::new(command, config.effective_command_timeout())?;
    Some(Box::new(notifier))
}

/// Detects the best available speech command for this platform.
pub fn detect_speech_command() -> Option<Vec<String>> {
    #[cfg(target_os = "macos")]
    {
        first_installed(&[&["mysay"], &["say"]])
    }
    #[cfg(target_os = "windows")]
    {
        Some(vec![
            "powershell".to_string(),
            "-Command".to_string(),
            "Add-Type -AssemblyName System.Speech; \
             (New-Object System.Speech.Synthesis.SpeechSynthesizer).Speak"
                .to_string(),
        ])
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        first_installed(&[
            &["espeak"],
            &["espeak-ng"],
            &["festival", "--tts"],
            &["spd-say"],
        ])
    }
}

#[cfg(not(target_os = "windows"))]
fn first_installed(candidates: &[&[&str]]) -> Option<Vec<String>> {
    candidates
        .iter()
        .find(|cmd| cmd.first().is_some_and(|bin| which::which(bin).is_ok()))
        .map(|cmd| cmd.iter().map(|s| s.to_string()).collect())
}

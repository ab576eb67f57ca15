//! Periodic energy gate deciding whether the local user is talking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{CaptureManager, FrequencyAnalyser};
use crate::config::SpeakingConfig;

/// Speaking iff unmuted and the mean energy is strictly above `threshold`
pub fn speaking_gate(mean_energy: f32, muted: bool, threshold: f32) -> bool {
    !muted && mean_energy > threshold
}

/// Samples the local stream on a fixed interval and publishes the result.
///
/// Mute state is re-read from the capture manager on every tick.
pub struct SpeakingDetector {
    task: Option<JoinHandle<()>>,
    output: Arc<watch::Sender<bool>>,
}

impl SpeakingDetector {
    /// Start analysing the first audio track of the local stream.
    /// Returns `None` when no local stream is held.
    pub fn start(
        capture: Arc<CaptureManager>,
        config: &SpeakingConfig,
        output: Arc<watch::Sender<bool>>,
    ) -> Option<Self> {
        let Some(track) = capture.stream().and_then(|s| s.audio_tracks().into_iter().next()) else {
            tracing::info!("No local stream available for audio analysis");
            return None;
        };

        let mut frames = track.subscribe();
        let mut analyser = FrequencyAnalyser::new(config);
        let threshold = config.threshold;
        let interval = Duration::from_millis(config.interval_ms);
        let sink = output.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let mut source_gone = track.is_ended();
                loop {
                    match frames.try_recv() {
                        Ok(frame) => analyser.push_samples(&frame),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Lagged(skipped)) => {
                            tracing::debug!("Speaking detector skipped {} frames", skipped);
                        }
                        Err(TryRecvError::Closed) => {
                            source_gone = true;
                            break;
                        }
                    }
                }

                let speaking = if source_gone || capture.is_muted() {
                    false
                } else {
                    speaking_gate(analyser.mean_energy(), false, threshold)
                };
                publish(&sink, speaking);

                if source_gone {
                    tracing::debug!("Local track ended, speaking detector exiting");
                    break;
                }
            }
        });

        Some(Self {
            task: Some(task),
            output,
        })
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel sampling, drop the analyser and report "not speaking"
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        publish(&self.output, false);
    }
}

impl Drop for SpeakingDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(output: &watch::Sender<bool>, speaking: bool) {
    output.send_if_modified(|current| {
        if *current != speaking {
            *current = speaking;
            true
        } else {
            false
        }
    });
}

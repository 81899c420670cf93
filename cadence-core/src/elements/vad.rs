//! `vad_trim`: trims leading and trailing silence with an energy VAD.
//!
//! ## Algorithm
//!
//! 1. Split the audio into fixed frames (`frameMs`, default 20 ms).
//! 2. A frame whose RMS is ≥ `threshold` is speech and resets the hangover
//!    counter; a quieter frame is still speech while the counter is > 0.
//! 3. Keep everything from the first to the last speech frame.
//!
//! Audio with no speech frame is left untouched and a warning is recorded.

use std::any::Any;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::PipelineContext;
use crate::element::descriptor::{ConnectionRules, ConstraintSet, DataType};
use crate::element::{Element, ElementMetadata, ElementSettings};

use super::VAD_TRIM;

const DEFAULT_THRESHOLD: f32 = 0.01;
const DEFAULT_HANGOVER_FRAMES: u32 = 8;
const DEFAULT_FRAME_MS: u32 = 20;
const MAX_FRAME_MS: u64 = 1_000;

/// RMS threshold + hangover speech detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// Frames at or above this RMS are speech. Typical range: 0.01–0.05.
    threshold: f32,
    /// Quiet frames still counted as speech after real speech ends.
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    pub fn is_speech(&mut self, frame: &[f32]) -> bool {
        if rms(frame) >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            true
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_HANGOVER_FRAMES)
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Sample range `[start, end)` spanning all speech frames, if any.
pub fn speech_bounds(samples: &[f32], frame_len: usize, vad: &mut EnergyVad) -> Option<(usize, usize)> {
    let frame_len = frame_len.max(1);
    let mut bounds: Option<(usize, usize)> = None;
    for (index, frame) in samples.chunks(frame_len).enumerate() {
        if vad.is_speech(frame) {
            let start = index * frame_len;
            let end = start + frame.len();
            bounds = Some(match bounds {
                Some((first, _)) => (first, end),
                None => (start, end),
            });
        }
    }
    bounds
}

/// Custom data recorded under `vadTrimmedSamples`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimmedSamples {
    pub leading: usize,
    pub trailing: usize,
}

pub struct VadTrimElement {
    settings: ElementSettings,
}

impl VadTrimElement {
    pub fn new() -> Self {
        Self {
            settings: ElementSettings::default(),
        }
    }

    fn detector(&self) -> EnergyVad {
        let threshold = self
            .settings
            .config_f64("threshold")
            .map(|t| t as f32)
            .unwrap_or(DEFAULT_THRESHOLD);
        let hangover = self
            .settings
            .config_u64("hangoverFrames")
            .map(|h| h.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(DEFAULT_HANGOVER_FRAMES);
        EnergyVad::new(threshold, hangover)
    }

    fn frame_len(&self, sample_rate: u32) -> usize {
        let frame_ms = self
            .settings
            .config_u64("frameMs")
            .filter(|ms| *ms > 0)
            .unwrap_or(u64::from(DEFAULT_FRAME_MS))
            .min(MAX_FRAME_MS);
        ((u64::from(sample_rate) * frame_ms) / 1_000).max(1) as usize
    }
}

impl Default for VadTrimElement {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Element for VadTrimElement {
    fn element_type(&self) -> &str {
        VAD_TRIM
    }

    fn metadata(&self) -> ElementMetadata {
        ElementMetadata::new(
            "Trim Silence",
            "Removes leading and trailing silence before transcription",
            "waveform",
        )
    }

    fn constraints(&self) -> ConstraintSet {
        ConstraintSet::MUST_BE_FIRST | ConstraintSet::OPTIONAL
    }

    fn connection_rules(&self) -> ConnectionRules {
        ConnectionRules::new([DataType::Audio], DataType::Audio)
    }

    fn settings(&self) -> &ElementSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut ElementSettings {
        &mut self.settings
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn process(&mut self, ctx: &PipelineContext) -> anyhow::Result<()> {
        let Some(samples) = ctx.audio_samples() else {
            ctx.add_warning("silence trimming skipped: no audio samples");
            ctx.set_custom_data("vadApplied", &false)?;
            return Ok(());
        };

        let sample_rate = ctx.sample_rate();
        let mut vad = self.detector();
        let Some((start, end)) = speech_bounds(&samples, self.frame_len(sample_rate), &mut vad) else {
            ctx.add_warning("no speech detected in audio");
            ctx.set_custom_data("vadApplied", &false)?;
            return Ok(());
        };

        let trimmed = TrimmedSamples {
            leading: start,
            trailing: samples.len() - end,
        };
        debug!(
            leading = trimmed.leading,
            trailing = trimmed.trailing,
            kept = end - start,
            "silence trimmed"
        );
        if trimmed.leading > 0 || trimmed.trailing > 0 {
            ctx.set_audio(samples[start..end].to_vec(), sample_rate);
        }
        ctx.set_custom_data("vadApplied", &true)?;
        ctx.set_custom_data("vadTrimmedSamples", &trimmed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use serde_json::json;

    use super::*;

    fn tone(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 2);
        assert!(vad.is_speech(&[0.5; 160]));
        assert!(vad.is_speech(&[0.0; 160]));
        assert!(vad.is_speech(&[0.0; 160]));
        assert!(!vad.is_speech(&[0.0; 160]));

        vad.is_speech(&[0.5; 160]);
        vad.reset();
        assert!(!vad.is_speech(&[0.0; 160]));
    }

    #[test]
    fn rms_of_square_wave() {
        assert_relative_eq!(rms(&tone(256, 0.5)), 0.5, epsilon = 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn speech_bounds_cover_first_to_last_speech_frame() {
        let mut samples = vec![0.0; 320];
        samples.extend(tone(160, 0.3));
        samples.extend(vec![0.0; 480]);
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(speech_bounds(&samples, 160, &mut vad), Some((320, 480)));

        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(speech_bounds(&[0.0; 800], 160, &mut vad), None);
    }

    #[tokio::test]
    async fn process_trims_and_records_custom_data() {
        // 16 kHz, 20 ms frames = 320 samples.
        let mut samples = vec![0.0; 640];
        samples.extend(tone(320, 0.4));
        samples.extend(vec![0.0; 960]);
        let ctx = PipelineContext::new().with_audio(samples, 16_000);

        let mut element = VadTrimElement::new();
        element.set_configuration(
            json!({"hangoverFrames": 1})
                .as_object()
                .cloned()
                .expect("object"),
        );
        element.process(&ctx).await.expect("process");

        assert_eq!(ctx.audio_samples().map(|s| s.len()), Some(640));
        assert_eq!(ctx.custom_data::<bool>("vadApplied"), Some(true));
        assert_eq!(
            ctx.custom_data::<TrimmedSamples>("vadTrimmedSamples"),
            Some(TrimmedSamples {
                leading: 640,
                trailing: 640
            })
        );
    }

    #[tokio::test]
    async fn silence_is_kept_with_warning() {
        let ctx = PipelineContext::new().with_audio(vec![0.0; 1_600], 16_000);
        VadTrimElement::new().process(&ctx).await.expect("process");

        assert_eq!(ctx.audio_samples().map(|s| s.len()), Some(1_600));
        assert_eq!(ctx.custom_data::<bool>("vadApplied"), Some(false));
        assert_eq!(ctx.warnings(), vec!["no speech detected in audio".to_string()]);
    }

    #[tokio::test]
    async fn oversized_frame_length_is_clamped() {
        let mut element = VadTrimElement::new();
        element.set_configuration(
            json!({"frameMs": u64::MAX})
                .as_object()
                .cloned()
                .expect("object"),
        );
        assert_eq!(element.frame_len(16_000), 16_000);

        let ctx = PipelineContext::new().with_audio(tone(1_600, 0.4), 16_000);
        element.process(&ctx).await.expect("process");
        assert_eq!(ctx.audio_samples().map(|s| s.len()), Some(1_600));
    }

    #[tokio::test]
    async fn missing_audio_is_not_an_error() {
        let ctx = PipelineContext::new().with_audio_file("/tmp/clip.wav");
        VadTrimElement::new().process(&ctx).await.expect("process");
        assert_eq!(ctx.warnings().len(), 1);
    }
}

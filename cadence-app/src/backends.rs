//! Host-side backends bound into built-in elements.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use cadence_core::elements::{
    insert::{InsertMethod, InsertTextElement, TextInserter},
    notify::{Notifier, NotifyElement},
    transcription::{StubTranscriber, TranscriptionElement},
};
use cadence_core::{Element, ElementConfigurator};
use serde_json::Value;
use tracing::{debug, info};

use crate::settings::AppSettings;

/// Writes inserted text to stdout.
#[derive(Debug, Default)]
pub struct ConsoleInserter;

#[async_trait]
impl TextInserter for ConsoleInserter {
    async fn insert(&self, text: &str, method: InsertMethod) -> anyhow::Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{text}")?;
        out.flush()?;
        debug!(method = %method, "text written to console");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, title: &str, body: &str) -> anyhow::Result<()> {
        info!(title, "{body}");
        Ok(())
    }
}

/// Binds host backends and fills in configuration the pipeline left unset.
pub struct HostConfigurator {
    transcriber: Arc<StubTranscriber>,
    inserter: Arc<dyn TextInserter>,
    notifier: Arc<dyn Notifier>,
    language: Option<String>,
    insert_method: InsertMethod,
}

impl HostConfigurator {
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            transcriber: Arc::new(StubTranscriber),
            inserter: Arc::new(ConsoleInserter),
            notifier: Arc::new(TracingNotifier),
            language: settings.language().map(str::to_string),
            insert_method: settings.insert_method(),
        }
    }
}

impl ElementConfigurator for HostConfigurator {
    fn configure(&self, element: &mut dyn Element, instance_id: &str) {
        let defaults: Vec<(&str, Value)> = {
            let any = element.as_any_mut();
            if let Some(stt) = any.downcast_mut::<TranscriptionElement>() {
                stt.bind_transcriber(self.transcriber.clone());
                self.language
                    .iter()
                    .map(|lang| ("language", Value::from(lang.as_str())))
                    .collect()
            } else if let Some(insert) = any.downcast_mut::<InsertTextElement>() {
                insert.bind_inserter(Arc::clone(&self.inserter));
                vec![("method", Value::from(self.insert_method.as_str()))]
            } else if let Some(notify) = any.downcast_mut::<NotifyElement>() {
                notify.bind_notifier(Arc::clone(&self.notifier));
                Vec::new()
            } else {
                Vec::new()
            }
        };

        let configuration = &mut element.settings_mut().configuration;
        for (key, value) in defaults {
            configuration.entry(key).or_insert(value);
        }
        debug!(element_id = instance_id, element_type = element.element_type(), "host backends bound");
    }
}

/// Decode a WAV file into mono `f32` samples.
pub fn load_wav(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .context("decoding float samples")?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .context("decoding integer samples")?
        }
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels,
        samples = mono.len(),
        "wav decoded"
    );
    Ok((mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use cadence_core::elements::register_builtin_elements;
    use cadence_core::ElementRegistry;

    use super::*;

    fn write_wav(path: &Path, channels: u16, frames: &[[i16; 2]]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for frame in frames {
            for sample in &frame[..usize::from(channels)] {
                writer.write_sample(*sample).expect("write sample");
            }
        }
        writer.finalize().expect("finalize");
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, &[[16_384, 0], [-16_384, -16_384]]);

        let (samples, rate) = load_wav(&path).expect("load");
        assert_eq!(rate, 8_000);
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 0.25).abs() < 1e-4);
        assert!((samples[1] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn mono_wav_keeps_every_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mono.wav");
        write_wav(&path, 1, &[[8_192, 0], [0, 0], [-8_192, 0]]);

        let (samples, _) = load_wav(&path).expect("load");
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.25).abs() < 1e-4);
    }

    #[test]
    fn missing_wav_is_an_error() {
        let err = load_wav(Path::new("/nonexistent/cadence.wav")).expect_err("missing");
        assert!(err.to_string().contains("opening"));
    }

    #[test]
    fn configurator_fills_unset_configuration() {
        let registry = ElementRegistry::new();
        register_builtin_elements(&registry);
        let settings = AppSettings {
            language_hint: "de".into(),
            insert_method: "typing".into(),
            ..AppSettings::default()
        };
        let configurator = HostConfigurator::new(&settings);

        let mut stt = registry.create("transcription").expect("transcription");
        configurator.configure(stt.as_mut(), "stt");
        assert_eq!(stt.settings().config_str("language"), Some("de"));

        let mut insert = registry.create("insert_text").expect("insert_text");
        insert
            .settings_mut()
            .configuration
            .insert("method".into(), Value::from("clipboard"));
        configurator.configure(insert.as_mut(), "insert");
        assert_eq!(insert.settings().config_str("method"), Some("clipboard"));
    }
}

//! Corpus access: listing audio files and decoding them to mono waveforms.
//!
//! Decoding sits behind [`ClipReader`] so the synthesizer can run against
//! in-memory clips in tests. [`SymphoniaReader`] handles WAV and FLAC.

use mixverify_core::{Result, VerifierError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// File extensions recognized as corpus audio.
pub const AUDIO_EXTENSIONS: [&str; 2] = ["wav", "flac"];

/// Decoded mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Reads one corpus file into a waveform.
pub trait ClipReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Waveform>;
}

/// List every WAV and FLAC file directly inside `dir`.
///
/// WAV files come first, then FLAC, each group sorted by path so the
/// shuffled order depends only on the seed.
pub fn list_corpus(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| VerifierError::CorpusRead {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut by_ext: Vec<Vec<PathBuf>> = vec![Vec::new(); AUDIO_EXTENSIONS.len()];
    for entry in entries {
        let entry = entry.map_err(|e| VerifierError::CorpusRead {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if let Some(slot) = ext
            .as_deref()
            .and_then(|e| AUDIO_EXTENSIONS.iter().position(|known| *known == e))
        {
            by_ext[slot].push(path);
        }
    }

    Ok(by_ext
        .into_iter()
        .flat_map(|mut group| {
            group.sort();
            group
        })
        .collect())
}

/// Average interleaved channels into one.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

// ---------------------------------------------------------------------------
// Symphonia decoder
// ---------------------------------------------------------------------------

/// Decodes WAV / FLAC files with symphonia.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaReader;

impl SymphoniaReader {
    fn corpus_err(path: &Path, reason: impl std::fmt::Display) -> VerifierError {
        VerifierError::CorpusRead {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl ClipReader for SymphoniaReader {
    fn read(&self, path: &Path) -> Result<Waveform> {
        let file = std::fs::File::open(path).map_err(|e| Self::corpus_err(path, e))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Self::corpus_err(path, e))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Self::corpus_err(path, "no decodable audio track"))?;
        let track_id = track.id;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Self::corpus_err(path, "unknown sample rate"))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Self::corpus_err(path, e))?;

        let mut samples = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => return Err(Self::corpus_err(path, e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = decoder
                .decode(&packet)
                .map_err(|e| Self::corpus_err(path, e))?;
            let spec = *decoded.spec();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buf.copy_interleaved_ref(decoded);
            samples.extend(downmix(buf.samples(), spec.channels.count()));
        }

        tracing::debug!(
            path = %path.display(),
            samples = samples.len(),
            sample_rate,
            "Decoded clip"
        );
        Ok(Waveform::new(samples, sample_rate))
    }
}

// ---------------------------------------------------------------------------
// In-memory reader
// ---------------------------------------------------------------------------

/// Serves pre-built waveforms keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    clips: HashMap<PathBuf, Waveform>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, waveform: Waveform) {
        self.clips.insert(path.into(), waveform);
    }

    /// Paths of all stored clips, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.clips.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl ClipReader for MemoryReader {
    fn read(&self, path: &Path) -> Result<Waveform> {
        self.clips
            .get(path)
            .cloned()
            .ok_or_else(|| VerifierError::CorpusRead {
                path: path.to_path_buf(),
                reason: "no such clip".to_string(),
            })
    }
}

//! File-backed data probes.
//!
//! A probe taps a port or stream and either records what passes through it
//! into `<prefix>.wav` or injects the file's contents in its place. The
//! real-time side ([`DataProbe`]) only pushes to or pops from an `rtrb` sample
//! queue. A dedicated probe thread owned by [`ProbeFile`] does the file I/O.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use xbar_core::{ChannelCount, Error, Frames, Result, Sample, SampleRate};

/// How often the probe thread polls its queue
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Lower bound for the sample queue, in frames
const MIN_QUEUE_FRAMES: usize = 8192;

/// Direction of a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Capture samples into a file
    Record,
    /// Replace samples with file contents
    Inject,
}

impl ProbeKind {
    #[must_use]
    pub fn from_inject(inject: bool) -> Self {
        if inject { Self::Inject } else { Self::Record }
    }
}

enum SampleQueue {
    Record(rtrb::Producer<Sample>),
    Inject(rtrb::Consumer<Sample>),
}

/// Real-time half of a probe
///
/// Never blocks or allocates. When the queue to the probe thread is full
/// (recording) or empty (injecting) the affected frames pass untouched.
pub struct DataProbe {
    num_channels: ChannelCount,
    frames_left: u64,
    queue: SampleQueue,
    exhausted: Arc<AtomicBool>,
}

impl std::fmt::Debug for DataProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProbe")
            .field("kind", &self.kind())
            .field("num_channels", &self.num_channels)
            .field("frames_left", &self.frames_left)
            .finish_non_exhaustive()
    }
}

impl DataProbe {
    #[must_use]
    pub fn kind(&self) -> ProbeKind {
        match self.queue {
            SampleQueue::Record(_) => ProbeKind::Record,
            SampleQueue::Inject(_) => ProbeKind::Inject,
        }
    }

    #[must_use]
    pub fn num_channels(&self) -> ChannelCount {
        self.num_channels
    }

    /// True once the duration elapsed or the injected file is used up
    #[must_use]
    pub fn is_finished(&self) -> bool {
        if self.frames_left == 0 {
            return true;
        }
        match &self.queue {
            SampleQueue::Record(producer) => producer.is_abandoned(),
            SampleQueue::Inject(consumer) => {
                self.exhausted.load(Ordering::Acquire) && consumer.slots() < self.num_channels
            }
        }
    }

    /// Record up to `frames` frames; `sample(frame, channel)` supplies the data
    ///
    /// Returns the number of frames charged against the probe duration.
    pub fn record<F>(&mut self, frames: Frames, mut sample: F) -> Frames
    where
        F: FnMut(Frames, usize) -> Sample,
    {
        let SampleQueue::Record(producer) = &mut self.queue else {
            return 0;
        };
        let frames = frames.min(usize::try_from(self.frames_left).unwrap_or(usize::MAX));
        for frame in 0..frames {
            // Queue full: drop the frame rather than wait
            if producer.slots() < self.num_channels {
                continue;
            }
            for channel in 0..self.num_channels {
                let _ = producer.push(sample(frame, channel));
            }
        }
        self.frames_left -= frames as u64;
        frames
    }

    /// Inject up to `frames` frames; `store(frame, channel, value)` writes the data
    ///
    /// Returns the number of frames replaced.
    pub fn inject<F>(&mut self, frames: Frames, mut store: F) -> Frames
    where
        F: FnMut(Frames, usize, Sample),
    {
        let SampleQueue::Inject(consumer) = &mut self.queue else {
            return 0;
        };
        let frames = frames.min(usize::try_from(self.frames_left).unwrap_or(usize::MAX));
        let mut injected = 0;
        while injected < frames && consumer.slots() >= self.num_channels {
            for channel in 0..self.num_channels {
                let value = consumer.pop().unwrap_or(0.0);
                store(injected, channel, value);
            }
            injected += 1;
        }
        self.frames_left -= injected as u64;
        injected
    }
}

/// Control half of a probe: owns the file and the probe thread
pub struct ProbeFile {
    path: PathBuf,
    kind: ProbeKind,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProbeFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeFile")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl ProbeFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// True once the probe thread has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the probe thread and wait for it; the file is finalized on return
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Probe thread for {} panicked", self.path.display());
            }
        }
    }
}

impl Drop for ProbeFile {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Path of the WAV file used for `prefix`
#[must_use]
pub fn probe_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.wav"))
}

fn wav_error(err: hound::Error) -> Error {
    match err {
        hound::Error::IoError(err) => Error::Io(err),
        other => Error::Failed(other.to_string()),
    }
}

/// Open a probe file and start its thread
///
/// Injection pre-fills the sample queue before returning so the first
/// period already sees file data.
pub fn open_probe(
    prefix: &str,
    kind: ProbeKind,
    num_channels: ChannelCount,
    sample_rate: SampleRate,
    seconds: u32,
) -> Result<(DataProbe, ProbeFile)> {
    if num_channels == 0 || sample_rate == 0 || seconds == 0 {
        return Err(Error::InvalidParam(format!(
            "probe '{prefix}' needs channels, sample rate and duration > 0"
        )));
    }

    let path = probe_path(prefix);
    let capacity = (sample_rate as usize / 2).max(MIN_QUEUE_FRAMES) * num_channels;
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    let stop = Arc::new(AtomicBool::new(false));
    let exhausted = Arc::new(AtomicBool::new(false));

    let (queue, thread) = match kind {
        ProbeKind::Record => {
            let spec = hound::WavSpec {
                channels: u16::try_from(num_channels)
                    .map_err(|_| Error::InvalidParam(format!("{num_channels} channels")))?,
                sample_rate,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            };
            let writer = hound::WavWriter::create(&path, spec).map_err(wav_error)?;
            let thread = spawn_probe_thread(&path, {
                let stop = Arc::clone(&stop);
                let path = path.clone();
                move || run_recorder(writer, consumer, &stop, &path)
            })?;
            (SampleQueue::Record(producer), thread)
        }
        ProbeKind::Inject => {
            let reader = hound::WavReader::open(&path).map_err(wav_error)?;
            let spec = reader.spec();
            if usize::from(spec.channels) != num_channels {
                return Err(Error::InvalidParam(format!(
                    "{} has {} channels, port needs {num_channels}",
                    path.display(),
                    spec.channels
                )));
            }
            if spec.sample_rate != sample_rate {
                tracing::warn!(
                    "{} is {} Hz, injecting at {} Hz without conversion",
                    path.display(),
                    spec.sample_rate,
                    sample_rate
                );
            }
            let mut samples = wav_samples(reader);
            let mut producer = producer;
            fill_queue(&mut producer, &mut samples, &exhausted);
            let thread = spawn_probe_thread(&path, {
                let stop = Arc::clone(&stop);
                let exhausted = Arc::clone(&exhausted);
                move || run_injector(samples, producer, &stop, &exhausted)
            })?;
            (SampleQueue::Inject(consumer), thread)
        }
    };

    tracing::info!(
        "Probe {:?} on {} ({} ch, {} Hz, {} s)",
        kind,
        path.display(),
        num_channels,
        sample_rate,
        seconds
    );

    Ok((
        DataProbe {
            num_channels,
            frames_left: u64::from(seconds) * u64::from(sample_rate),
            queue,
            exhausted,
        },
        ProbeFile {
            path,
            kind,
            stop,
            thread: Some(thread),
        },
    ))
}

fn spawn_probe_thread<F>(path: &Path, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let name = path
        .file_stem()
        .map_or_else(|| "probe".to_string(), |s| format!("probe-{}", s.to_string_lossy()));
    Ok(thread::Builder::new().name(name).spawn(body)?)
}

type WavSamples = Box<dyn Iterator<Item = hound::Result<Sample>> + Send>;

fn wav_samples(reader: hound::WavReader<BufReader<File>>) -> WavSamples {
    let spec = reader.spec();
    match spec.sample_format {
        hound::SampleFormat::Float => Box::new(reader.into_samples::<f32>()),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            Box::new(
                reader
                    .into_samples::<i32>()
                    .map(move |s| s.map(|v| v as f32 * scale)),
            )
        }
    }
}

fn fill_queue(producer: &mut rtrb::Producer<Sample>, samples: &mut WavSamples, exhausted: &AtomicBool) {
    while producer.slots() > 0 {
        match samples.next() {
            Some(Ok(sample)) => {
                let _ = producer.push(sample);
            }
            Some(Err(err)) => {
                tracing::warn!("Probe file read failed: {}", err);
                exhausted.store(true, Ordering::Release);
                return;
            }
            None => {
                exhausted.store(true, Ordering::Release);
                return;
            }
        }
    }
}

fn run_recorder(
    mut writer: hound::WavWriter<std::io::BufWriter<File>>,
    mut consumer: rtrb::Consumer<Sample>,
    stop: &AtomicBool,
    path: &Path,
) {
    loop {
        // Read the exit condition before draining so nothing pushed earlier is lost
        let done = stop.load(Ordering::Acquire) || consumer.is_abandoned();
        while let Ok(sample) = consumer.pop() {
            if let Err(err) = writer.write_sample(sample) {
                tracing::error!("Writing {} failed: {}", path.display(), err);
                return;
            }
        }
        if done {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    if let Err(err) = writer.finalize() {
        tracing::error!("Finalizing {} failed: {}", path.display(), err);
    } else {
        tracing::debug!("Probe file {} finalized", path.display());
    }
}

fn run_injector(
    mut samples: WavSamples,
    mut producer: rtrb::Producer<Sample>,
    stop: &AtomicBool,
    exhausted: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) && !producer.is_abandoned() {
        fill_queue(&mut producer, &mut samples, exhausted);
        if exhausted.load(Ordering::Acquire) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prefix(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_record_then_inject() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix(&dir, "tap");

        let (mut probe, mut file) = open_probe(&prefix, ProbeKind::Record, 2, 100, 1).unwrap();
        assert_eq!(probe.kind(), ProbeKind::Record);
        let charged = probe.record(150, |frame, channel| (frame * 2 + channel) as f32 / 1000.0);
        assert_eq!(charged, 100);
        assert!(probe.is_finished());
        drop(probe);
        file.stop();
        assert!(file.is_finished());

        let reader = hound::WavReader::open(probe_path(&prefix)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 200);

        let (mut probe, _file) = open_probe(&prefix, ProbeKind::Inject, 2, 100, 10).unwrap();
        let mut out = vec![[0.0_f32; 2]; 40];
        assert_eq!(probe.inject(40, |frame, channel, v| out[frame][channel] = v), 40);
        assert_eq!(out[3], [0.006, 0.007]);
    }

    #[test]
    fn test_inject_finishes_at_end_of_file() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix(&dir, "short");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(probe_path(&prefix), spec).unwrap();
        for _ in 0..10 {
            writer.write_sample(16384_i16).unwrap();
        }
        writer.finalize().unwrap();

        let (mut probe, _file) = open_probe(&prefix, ProbeKind::Inject, 1, 8000, 5).unwrap();
        let mut seen = Vec::new();
        assert_eq!(probe.inject(64, |_, _, v| seen.push(v)), 10);
        assert!(seen.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        assert!(probe.is_finished());
    }

    #[test]
    fn test_inject_channel_mismatch() {
        let dir = TempDir::new().unwrap();
        let prefix = prefix(&dir, "stereo");
        drop(open_probe(&prefix, ProbeKind::Record, 2, 8000, 1).unwrap());

        let err = open_probe(&prefix, ProbeKind::Inject, 1, 8000, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn test_missing_inject_file() {
        let dir = TempDir::new().unwrap();
        assert!(open_probe(&prefix(&dir, "absent"), ProbeKind::Inject, 1, 8000, 1).is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let dir = TempDir::new().unwrap();
        let err = open_probe(&prefix(&dir, "zero"), ProbeKind::Record, 1, 8000, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }
}

//! # Recorder
//!
//! Lossless sample sink that saves named segments (one per song or trial) to
//! CSV.
//!
//! ```text
//! <output_dir>/
//! └── EEGdata-<MMDD>-<n>/        first missing or empty n ≥ 1, chosen on first save
//!     ├── session.json          device, montage, scale divisor, creation time
//!     ├── <segment>.csv         index,<channel names…>,trigger
//!     └── …
//! ```
//!
//! Channel values are divided by the configured scale divisor (raw counts →
//! µV); the trigger column is written unscaled so marker values stay exact.
//!
//! This differs from the legacy recorder's files, which divided every column
//! (trigger included) by the divisor and carried bare `0..N` column headers.
//! Analysis scripts written for those files must read triggers as raw tags
//! and select channels by name.
//!
//! A spawned recorder ([`Recorder::spawn`]) writes segments on tokio's
//! blocking pool so a long recording never stalls a runtime worker.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::stream::{PublishedCount, SampleSubscription};
use crate::types::SampleVector;

/// Where and how segments are written.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub output_dir: PathBuf,
    pub channel_names: Vec<String>,
    pub scale_divisor: f64,
    /// Written to `session.json`.
    pub device_name: String,
}

/// A segment that has been written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSegment {
    pub path: PathBuf,
    pub rows: usize,
    pub duration: Duration,
}

#[derive(Serialize)]
struct SessionInfo<'a> {
    device: &'a str,
    channels: &'a [String],
    scale_divisor: f64,
    created: String,
}

struct Segment {
    name: String,
    started: Instant,
    samples: Vec<SampleVector>,
}

// ── File helpers ──────────────────────────────────────────────────────────────

/// First `EEGdata-<date>-<n>` under `base` that does not exist or is empty.
pub fn next_session_dir(base: &Path, date: &str) -> io::Result<PathBuf> {
    for n in 1u32.. {
        let dir = base.join(format!("EEGdata-{date}-{n}"));
        if !dir.exists() || fs::read_dir(&dir)?.next().is_none() {
            return Ok(dir);
        }
    }
    Err(io::Error::new(io::ErrorKind::Other, "session directories exhausted"))
}

/// Write `samples` as CSV.  Returns the number of data rows.
pub fn write_csv(
    path: &Path,
    samples: &[SampleVector],
    channel_names: &[String],
    scale_divisor: f64,
) -> io::Result<usize> {
    let mut out = BufWriter::new(File::create(path)?);

    write!(out, "index")?;
    for name in channel_names {
        write!(out, ",{name}")?;
    }
    writeln!(out, ",trigger")?;

    for (i, v) in samples.iter().enumerate() {
        write!(out, "{i}")?;
        for &c in &v.channels {
            write!(out, ",{}", c as f64 / scale_divisor)?;
        }
        writeln!(out, ",{}", v.trigger)?;
    }
    out.flush()?;
    Ok(samples.len())
}

fn file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    if stem.is_empty() {
        "segment".into()
    } else {
        stem
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

pub struct Recorder {
    settings: RecorderSettings,
    session_dir: Option<PathBuf>,
    active: Option<Segment>,
}

impl Recorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            session_dir: None,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Session folder, once the first segment has been saved.
    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }

    /// Begin a new segment.  A segment already in progress is saved first and
    /// returned.
    pub fn start(&mut self, name: &str) -> Result<Option<SavedSegment>> {
        let previous = self.stop()?;
        self.begin(name);
        Ok(previous)
    }

    fn begin(&mut self, name: &str) {
        info!("recording segment {name:?}");
        self.active = Some(Segment {
            name: file_stem(name),
            started: Instant::now(),
            samples: Vec::new(),
        });
    }

    /// Buffer one vector if a segment is in progress.
    pub fn push(&mut self, vector: SampleVector) {
        if let Some(segment) = self.active.as_mut() {
            segment.samples.push(vector);
        }
    }

    /// Save the current segment, if any.
    pub fn stop(&mut self) -> Result<Option<SavedSegment>> {
        match self.finish()? {
            Some(pending) => pending.write().map(Some),
            None => Ok(None),
        }
    }

    /// Close the current segment and resolve its file path; the CSV itself is
    /// written by [`PendingSave::write`].
    fn finish(&mut self) -> Result<Option<PendingSave>> {
        let Some(segment) = self.active.take() else {
            return Ok(None);
        };
        let dir = self.ensure_session_dir()?;
        Ok(Some(PendingSave {
            path: dir.join(format!("{}.csv", segment.name)),
            duration: segment.started.elapsed(),
            samples: segment.samples,
            channel_names: self.settings.channel_names.clone(),
            scale_divisor: self.settings.scale_divisor,
        }))
    }

    fn ensure_session_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.session_dir {
            return Ok(dir.clone());
        }
        let date = chrono::Local::now().format("%m%d").to_string();
        let dir = next_session_dir(&self.settings.output_dir, &date)?;
        fs::create_dir_all(&dir)?;

        let info = SessionInfo {
            device: &self.settings.device_name,
            channels: &self.settings.channel_names,
            scale_divisor: self.settings.scale_divisor,
            created: chrono::Local::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join("session.json"), json)?;

        debug!("session directory {}", dir.display());
        self.session_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Run the recorder on its own task, fed by a lossless subscription.
    pub fn spawn(self, subscription: SampleSubscription) -> RecorderHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let published = subscription.published_count();
        let task = tokio::spawn(recorder_loop(self, subscription, rx));
        RecorderHandle {
            tx,
            published,
            task,
        }
    }
}

/// A closed segment waiting to be written.
struct PendingSave {
    path: PathBuf,
    duration: Duration,
    samples: Vec<SampleVector>,
    channel_names: Vec<String>,
    scale_divisor: f64,
}

impl PendingSave {
    fn write(self) -> Result<SavedSegment> {
        let rows = write_csv(
            &self.path,
            &self.samples,
            &self.channel_names,
            self.scale_divisor,
        )?;

        let secs = self.duration.as_secs_f64();
        let rate = if secs > 0.0 { rows as f64 / secs } else { 0.0 };
        info!(
            "saved {rows} samples to {} ({secs:.1} s, {rate:.1} samples/s)",
            self.path.display()
        );
        Ok(SavedSegment {
            path: self.path,
            rows,
            duration: self.duration,
        })
    }
}

// ── Background task ───────────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<Option<SavedSegment>>>;

/// `at` is the stream position when the command was issued.
enum RecorderCommand {
    Start { name: String, at: u64 },
    Stop { reply: Reply, at: u64 },
    Shutdown { reply: Reply, at: u64 },
}

/// Move queued vectors published before stream position `end` into the
/// active segment.
fn catch_up(recorder: &mut Recorder, subscription: &mut SampleSubscription, end: u64) {
    for v in subscription.drain_until(end) {
        recorder.push(v);
    }
}

/// Save the active segment off the runtime.
async fn save(recorder: &mut Recorder) -> Result<Option<SavedSegment>> {
    let Some(pending) = recorder.finish()? else {
        return Ok(None);
    };
    tokio::task::spawn_blocking(move || pending.write())
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .map(Some)
}

async fn recorder_loop(
    mut recorder: Recorder,
    mut subscription: SampleSubscription,
    mut commands: mpsc::UnboundedReceiver<RecorderCommand>,
) {
    let mut stream_open = true;
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(RecorderCommand::Start { name, at }) => {
                    catch_up(&mut recorder, &mut subscription, at);
                    if let Err(e) = save(&mut recorder).await {
                        warn!("recorder: could not save previous segment: {e}");
                    }
                    recorder.begin(&name);
                }
                Some(RecorderCommand::Stop { reply, at }) => {
                    catch_up(&mut recorder, &mut subscription, at);
                    let _ = reply.send(save(&mut recorder).await);
                }
                Some(RecorderCommand::Shutdown { reply, at }) => {
                    catch_up(&mut recorder, &mut subscription, at);
                    let _ = reply.send(save(&mut recorder).await);
                    break;
                }
                None => {
                    catch_up(&mut recorder, &mut subscription, u64::MAX);
                    if let Err(e) = save(&mut recorder).await {
                        warn!("recorder: could not save segment: {e}");
                    }
                    break;
                }
            },
            vector = subscription.recv(), if stream_open => match vector {
                Some(v) => recorder.push(v),
                None => {
                    debug!("recorder: sample stream closed");
                    stream_open = false;
                }
            },
        }
    }
}

/// Control side of a spawned [`Recorder`].
///
/// Every command is stamped with the stream position at the moment it is
/// issued: vectors published before a `start` or `stop` call land in the
/// segment that call closes, however far the recorder task lags behind.
pub struct RecorderHandle {
    tx: mpsc::UnboundedSender<RecorderCommand>,
    published: PublishedCount,
    task: JoinHandle<()>,
}

impl RecorderHandle {
    /// Start recording segment `name`, saving any segment in progress.
    pub fn start(&self, name: impl Into<String>) -> Result<()> {
        let command = RecorderCommand::Start {
            name: name.into(),
            at: self.published.get(),
        };
        self.tx.send(command).map_err(|_| ClientError::Stopped)
    }

    /// Save the segment in progress.  `Ok(None)` if nothing was recording.
    pub async fn stop(&self) -> Result<Option<SavedSegment>> {
        let (reply, rx) = oneshot::channel();
        let at = self.published.get();
        self.tx
            .send(RecorderCommand::Stop { reply, at })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Save the segment in progress and end the task.
    pub async fn shutdown(self) -> Result<Option<SavedSegment>> {
        let (reply, rx) = oneshot::channel();
        let at = self.published.get();
        self.tx
            .send(RecorderCommand::Shutdown { reply, at })
            .map_err(|_| ClientError::Stopped)?;
        let saved = rx.await.map_err(|_| ClientError::Stopped)?;
        if let Err(e) = self.task.await {
            warn!("recorder task ended abnormally: {e}");
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SampleStream;
    use tempfile::tempdir;

    fn settings(dir: &Path) -> RecorderSettings {
        RecorderSettings {
            output_dir: dir.to_path_buf(),
            channel_names: vec!["Fp1".into(), "Fp2".into()],
            scale_divisor: 120.0,
            device_name: "MSM-8C".into(),
        }
    }

    fn vector(a: i32, b: i32, trigger: u32) -> SampleVector {
        SampleVector {
            timestamp: 0.0,
            channels: vec![a, b],
            trigger,
        }
    }

    #[test]
    fn csv_scales_channels_but_not_trigger() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("song.csv");
        let names = vec!["Fp1".to_string(), "Fp2".to_string()];
        let rows = write_csv(
            &path,
            &[vector(240, -60, 7), vector(0, 120, 0)],
            &names,
            120.0,
        )
        .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "index,Fp1,Fp2,trigger\n0,2,-0.5,7\n1,0,1,0\n"
        );
    }

    #[test]
    fn session_dir_skips_non_empty_folders() {
        let base = tempdir().unwrap();
        assert_eq!(
            next_session_dir(base.path(), "0315").unwrap(),
            base.path().join("EEGdata-0315-1")
        );

        let first = base.path().join("EEGdata-0315-1");
        fs::create_dir_all(&first).unwrap();
        assert_eq!(next_session_dir(base.path(), "0315").unwrap(), first);

        fs::write(first.join("a.csv"), "x").unwrap();
        assert_eq!(
            next_session_dir(base.path(), "0315").unwrap(),
            base.path().join("EEGdata-0315-2")
        );
    }

    #[test]
    fn restart_saves_previous_segment() {
        let base = tempdir().unwrap();
        let mut rec = Recorder::new(settings(base.path()));
        assert!(rec.stop().unwrap().is_none());

        assert!(rec.start("song 1").unwrap().is_none());
        rec.push(vector(1, 2, 1));
        rec.push(vector(3, 4, 1));
        let first = rec.start("song/2").unwrap().unwrap();
        assert_eq!(first.rows, 2);
        rec.push(vector(5, 6, 2));
        let second = rec.stop().unwrap().unwrap();

        let session = rec.session_dir().unwrap();
        assert_eq!(first.path, session.join("song 1.csv"));
        assert_eq!(second.path, session.join("song_2.csv"));
        assert_eq!(second.rows, 1);
        assert!(!rec.is_recording());

        let info: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(session.join("session.json")).unwrap())
                .unwrap();
        assert_eq!(info["device"], "MSM-8C");
        assert_eq!(info["channels"][1], "Fp2");
    }

    #[test]
    fn vectors_outside_a_segment_are_ignored() {
        let base = tempdir().unwrap();
        let mut rec = Recorder::new(settings(base.path()));
        rec.push(vector(1, 1, 0));
        rec.start("a").unwrap();
        let saved = rec.stop().unwrap().unwrap();
        assert_eq!(saved.rows, 0);
    }

    #[tokio::test]
    async fn restart_keeps_queued_vectors_in_previous_segment() {
        let base = tempdir().unwrap();
        let stream = SampleStream::new();
        let handle = Recorder::new(settings(base.path())).spawn(stream.subscribe_lossless());

        handle.start("song_a").unwrap();
        stream.publish_all((0..10).map(|i| vector(i, 0, 1)));
        handle.start("song_b").unwrap();
        stream.publish_all((0..3).map(|i| vector(i, 0, 2)));
        let song_b = handle.stop().await.unwrap().unwrap();
        assert_eq!(song_b.rows, 3);

        let song_a = fs::read_to_string(song_b.path.with_file_name("song_a.csv")).unwrap();
        assert_eq!(song_a.lines().count(), 11);
        assert!(song_a.lines().skip(1).all(|l| l.ends_with(",1")));
        let song_b = fs::read_to_string(&song_b.path).unwrap();
        assert!(song_b.lines().skip(1).all(|l| l.ends_with(",2")));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn spawned_recorder_captures_published_vectors() {
        let base = tempdir().unwrap();
        let stream = SampleStream::new();
        let handle = Recorder::new(settings(base.path())).spawn(stream.subscribe_lossless());

        handle.start("trial").unwrap();
        stream.publish_all((0..10).map(|i| vector(i * 120, 0, 3)));
        let saved = handle.stop().await.unwrap().unwrap();
        assert_eq!(saved.rows, 10);

        let csv = fs::read_to_string(&saved.path).unwrap();
        let last = csv.lines().last().unwrap();
        assert_eq!(last, "9,9,0,3");

        assert!(handle.stop().await.unwrap().is_none());
        assert!(handle.shutdown().await.unwrap().is_none());
    }
}

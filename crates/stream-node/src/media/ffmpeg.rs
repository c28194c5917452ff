//! ffmpeg / ffprobe child-process media backend.
//!
//! Inputs are probed with ffprobe, then decoded by an ffmpeg child writing
//! raw RGB frames to stdout. A reader thread slices stdout into frames and
//! hands them over a bounded channel so `read_frame` can honour its timeout.
//! Outputs pipe raw RGB frames into an ffmpeg libx264/MP4 encoder.

use common::{ConnectionInfo, Credentials, Protocol, VideoFrame};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use serde::Deserialize;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{MediaConnector, MediaError, MediaResult, MediaSource, SinkFactory, SourceInfo, VideoSink};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Input
// ============================================================================

#[derive(Debug, Clone)]
pub struct FfmpegConnector {
    ffmpeg: String,
    ffprobe: String,
    /// Decoded frames buffered between the reader thread and the pipeline.
    queue_depth: usize,
}

impl Default for FfmpegConnector {
    fn default() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe: std::env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()),
            queue_depth: 4,
        }
    }
}

impl FfmpegConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn probe(&self, protocol: Protocol, uri: &str, timeout: Duration) -> MediaResult<SourceInfo> {
        let mut child = Command::new(&self.ffprobe)
            .args(probe_args(protocol, uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MediaError::Connect(format!("spawn ffprobe failed: {}", e)))?;

        let status = wait_with_timeout(&mut child, timeout)?;

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)?;
        }
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                err.read_to_string(&mut stderr).ok();
            }
            return Err(MediaError::Connect(format!("ffprobe exited with {}: {}", status, stderr.trim())));
        }

        parse_probe(&stdout)
    }
}

impl MediaConnector for FfmpegConnector {
    fn connect(
        &self,
        connection: &ConnectionInfo,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> MediaResult<Box<dyn MediaSource>> {
        let uri = connection.uri(credentials);
        let info = self.probe(connection.protocol, &uri, timeout)?;
        debug!(uri = %connection.redacted_uri(), ?info, "probed input");

        let mut child = Command::new(&self.ffmpeg)
            .args(decode_args(connection.protocol, &uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MediaError::Connect(format!("spawn ffmpeg failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Connect("ffmpeg stdout not captured".to_string()))?;

        let (tx, rx) = bounded(self.queue_depth.max(1));
        let (width, height) = (info.width, info.height);
        let reader = match thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || read_frames(stdout, width, height, tx))
        {
            Ok(reader) => reader,
            Err(e) => {
                child.kill().ok();
                child.wait().ok();
                return Err(e.into());
            }
        };

        info!(uri = %connection.redacted_uri(), width, height, fps = info.fps, "input connected");

        Ok(Box::new(FfmpegSource {
            child: Some(child),
            frames: Some(rx),
            reader: Some(reader),
            info,
            decoded: 0,
        }))
    }
}

pub struct FfmpegSource {
    child: Option<Child>,
    frames: Option<Receiver<MediaResult<RgbImage>>>,
    reader: Option<JoinHandle<()>>,
    info: SourceInfo,
    decoded: i64,
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self, timeout: Duration) -> MediaResult<Option<VideoFrame>> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(MediaError::EndOfStream);
        };

        match frames.recv_timeout(timeout) {
            Ok(Ok(image)) => {
                let pts = self.decoded;
                self.decoded += 1;
                Ok(Some(VideoFrame::new(image).with_pts(pts)))
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MediaError::EndOfStream),
        }
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
        // Unblocks a reader stuck on a full channel.
        drop(self.frames.take());
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("ffmpeg reader thread panicked");
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_frames(mut stdout: ChildStdout, width: u32, height: u32, tx: Sender<MediaResult<RgbImage>>) {
    let frame_len = width as usize * height as usize * 3;
    loop {
        let mut buf = vec![0u8; frame_len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {
                let Some(image) = RgbImage::from_raw(width, height, buf) else {
                    tx.send(Err(MediaError::Decode("short frame buffer".to_string()))).ok();
                    return;
                };
                if tx.send(Ok(image)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tx.send(Err(MediaError::EndOfStream)).ok();
                return;
            }
            Err(e) => {
                tx.send(Err(MediaError::Io(e))).ok();
                return;
            }
        }
    }
}

fn protocol_input_args(protocol: Protocol) -> &'static [&'static str] {
    match protocol {
        Protocol::Rtsp => &["-rtsp_transport", "tcp"],
        Protocol::Usb => &["-f", "v4l2"],
        Protocol::Http | Protocol::Https | Protocol::File => &[],
    }
}

fn probe_args(protocol: Protocol, uri: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-v", "error"].iter().map(|s| s.to_string()).collect();
    args.extend(protocol_input_args(protocol).iter().map(|s| s.to_string()));
    args.extend(
        [
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate",
            "-of",
            "json",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(uri.to_string());
    args
}

fn decode_args(protocol: Protocol, uri: &str) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(protocol_input_args(protocol).iter().map(|s| s.to_string()));
    if protocol == Protocol::File {
        // Files stand in for live cameras: paced and looped.
        args.extend(["-re", "-stream_loop", "-1"].iter().map(|s| s.to_string()));
    }
    args.push("-i".to_string());
    args.push(uri.to_string());
    args.extend(
        ["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

fn parse_probe(json: &str) -> MediaResult<SourceInfo> {
    let output: ProbeOutput =
        serde_json::from_str(json).map_err(|e| MediaError::Decode(format!("unreadable ffprobe output: {}", e)))?;

    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::Connect("no video stream".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(MediaError::Decode("video stream without dimensions".to_string())),
    };

    let fps = [stream.avg_frame_rate.as_deref(), stream.r_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .map(parse_rate)
        .find(|r| *r > 0.0)
        .unwrap_or(0.0);

    Ok(SourceInfo { width, height, fps })
}

/// Parse an ffprobe rational such as `30000/1001`.
fn parse_rate(rate: &str) -> f32 {
    match rate.split_once('/') {
        Some((num, den)) => match (num.parse::<f32>(), den.parse::<f32>()) {
            (Ok(n), Ok(d)) if d != 0.0 => n / d,
            _ => 0.0,
        },
        None => rate.parse().unwrap_or(0.0),
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> MediaResult<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            return Err(MediaError::Timeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone)]
pub struct FfmpegSinkFactory {
    ffmpeg: String,
    preset: String,
    crf: u8,
    /// Upper bound on waiting for the encoder to drain on `finish`.
    finish_timeout: Duration,
}

impl Default for FfmpegSinkFactory {
    fn default() -> Self {
        Self {
            ffmpeg: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
            preset: "veryfast".to_string(),
            crf: 23,
            finish_timeout: Duration::from_secs(30),
        }
    }
}

impl FfmpegSinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder_args(&self, path: &Path, width: u32, height: u32, fps: f32) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push("-s".to_string());
        args.push(format!("{}x{}", width, height));
        args.push("-r".to_string());
        args.push(format!("{}", fps));
        args.extend(["-i", "-", "-an", "-c:v", "libx264"].iter().map(|s| s.to_string()));
        args.push("-preset".to_string());
        args.push(self.preset.clone());
        args.push("-crf".to_string());
        args.push(self.crf.to_string());
        // yuv420p needs even dimensions.
        args.extend(
            [
                "-vf",
                "scale=trunc(iw/2)*2:trunc(ih/2)*2",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "-f",
                "mp4",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(path.to_string_lossy().to_string());
        args
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn open(&self, path: &Path, width: u32, height: u32, fps: f32) -> MediaResult<Box<dyn VideoSink>> {
        if width == 0 || height == 0 || !(fps > 0.0) {
            return Err(MediaError::Encode(format!("invalid output geometry {}x{} @ {}", width, height, fps)));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let args = self.encoder_args(path, width, height, fps);
        debug!(path = ?path, args = ?args, "launching ffmpeg encoder");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MediaError::Encode(format!("spawn ffmpeg failed: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MediaError::Encode("ffmpeg stdin not captured".to_string()))?;

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            width,
            height,
            written: 0,
            path: path.to_path_buf(),
            finish_timeout: self.finish_timeout,
        }))
    }
}

pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    written: u64,
    path: PathBuf,
    finish_timeout: Duration,
}

impl VideoSink for FfmpegSink {
    fn write(&mut self, frame: &RgbImage) -> MediaResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(MediaError::Encode(format!(
                "frame is {}x{}, output opened for {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::Encode("output already finished".to_string()))?;
        stdin.write_all(frame.as_raw()).map_err(|e| match e.kind() {
            ErrorKind::BrokenPipe => MediaError::Encode("encoder exited".to_string()),
            _ => MediaError::Io(e),
        })?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> MediaResult<u64> {
        let mut this = *self;
        // EOF on stdin makes ffmpeg flush the encoder and write the trailer.
        drop(this.stdin.take());
        let status = wait_with_timeout(&mut this.child, this.finish_timeout)?;
        if !status.success() {
            return Err(MediaError::Encode(format!("ffmpeg exited with {}", status)));
        }
        debug!(path = ?this.path, packets = this.written, "output finalized");
        Ok(this.written)
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        // Dropped without finish: abandon the container.
        if self.stdin.take().is_some() {
            self.child.kill().ok();
            self.child.wait().ok();
        }
    }
}

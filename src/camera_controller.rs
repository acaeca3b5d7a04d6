use anyhow::{anyhow, Context, Result};
use crossbeam::channel::Sender;
use image::ImageFormat;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::CameraConfig;
use crate::frame::Frame;
use crate::sensor_modes::SensorMode;

/// Completion notifications delivered back to the coordinating thread.
#[derive(Debug)]
pub enum SourceEvent {
    FrameReady(Frame),
    StillCaptured { path: PathBuf },
    StillFailed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub preview_size: (u32, u32),
    pub sensor_mode: Option<SensorMode>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            preview_size: (800, 600),
            sensor_mode: None,
        }
    }
}

/// The camera device. Every request answers asynchronously through the
/// sender it was given.
pub trait FrameSource: Send {
    fn configure(&mut self, config: StreamConfig) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    /// Sends exactly one `FrameReady` once the next preview frame is decoded.
    fn request_frame(&mut self, done: Sender<SourceEvent>);
    /// Switches to the raw still mode, writes a DNG at `path`, then resumes
    /// the preview and reports `StillCaptured` or `StillFailed`.
    fn capture_still(&mut self, path: &Path, done: Sender<SourceEvent>);
}

type PendingRequest = Arc<Mutex<Option<Sender<SourceEvent>>>>;

/// Camera controller for the Raspberry Pi camera using rpicam-apps:
/// an MJPEG `rpicam-vid` stream for preview, `rpicam-still --raw` for stills.
pub struct RpicamFrameSource {
    video_command: String,
    still_command: String,
    quality: u8,
    config: StreamConfig,
    running: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<PreviewStream>>>,
    pending: PendingRequest,
    capture_thread: Option<JoinHandle<()>>,
}

impl RpicamFrameSource {
    pub fn new(camera: &CameraConfig) -> Result<Self> {
        log::info!("Initializing camera controller...");

        Command::new(&camera.video_command)
            .arg("--help")
            .output()
            .with_context(|| format!("{} not found", camera.video_command))?;
        Command::new(&camera.still_command)
            .arg("--help")
            .output()
            .with_context(|| format!("{} not found", camera.still_command))?;

        log::info!(
            "Raspberry Pi Camera initialized (using {} and {})",
            camera.video_command,
            camera.still_command
        );

        Ok(Self {
            video_command: camera.video_command.clone(),
            still_command: camera.still_command.clone(),
            quality: camera.preview_quality.min(100),
            config: StreamConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
            stream: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            capture_thread: None,
        })
    }

    fn preview_args(&self) -> Vec<String> {
        let (width, height) = self.config.preview_size;
        let mut args = vec![
            "-t".to_string(), "0".to_string(),   // run until killed
            "-n".to_string(),                    // no system preview window
            "--codec".to_string(), "mjpeg".to_string(),
            "-q".to_string(), self.quality.to_string(),
            "--width".to_string(), width.to_string(),
            "--height".to_string(), height.to_string(),
        ];
        if let Some(mode) = &self.config.sensor_mode {
            args.push("--mode".to_string());
            args.push(mode.rpicam_arg());
        }
        args.push("-o".to_string());
        args.push("-".to_string());
        args
    }

    fn stop_stream(&self) {
        let stream = self.stream.lock().ok().and_then(|mut s| s.take());
        if let Some(stream) = stream {
            stream.shutdown();
        }
    }

    fn join_capture_thread(&mut self) {
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSource for RpicamFrameSource {
    fn configure(&mut self, config: StreamConfig) -> Result<()> {
        log::info!(
            "Preview {}x{}, sensor mode {}",
            config.preview_size.0,
            config.preview_size.1,
            config
                .sensor_mode
                .as_ref()
                .map(|m| m.rpicam_arg())
                .unwrap_or_else(|| "default".to_string())
        );
        self.config = config;

        if self.running.load(Ordering::Acquire) {
            self.stop_stream();
            let stream = PreviewStream::spawn(&self.video_command, &self.preview_args(), Arc::clone(&self.pending))?;
            if let Ok(mut slot) = self.stream.lock() {
                *slot = Some(stream);
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.running.store(true, Ordering::Release);

        let mut slot = self
            .stream
            .lock()
            .map_err(|_| anyhow!("Preview stream lock poisoned"))?;
        if slot.is_none() {
            *slot = Some(PreviewStream::spawn(
                &self.video_command,
                &self.preview_args(),
                Arc::clone(&self.pending),
            )?);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.join_capture_thread();
        self.stop_stream();
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
    }

    fn request_frame(&mut self, done: Sender<SourceEvent>) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(done);
        }
    }

    fn capture_still(&mut self, path: &Path, done: Sender<SourceEvent>) {
        self.join_capture_thread();
        // the sensor can only run one configuration at a time
        self.stop_stream();
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }

        let still_command = self.still_command.clone();
        let video_command = self.video_command.clone();
        let preview_args = self.preview_args();
        let running = Arc::clone(&self.running);
        let stream = Arc::clone(&self.stream);
        let pending = Arc::clone(&self.pending);
        let path = path.to_path_buf();

        let spawned = std::thread::Builder::new()
            .name("still-capture".to_string())
            .spawn(move || {
                let event = match run_still(&still_command, &path) {
                    Ok(()) => SourceEvent::StillCaptured { path },
                    Err(e) => SourceEvent::StillFailed {
                        path,
                        reason: format!("{:#}", e),
                    },
                };

                if running.load(Ordering::Acquire) {
                    match PreviewStream::spawn(&video_command, &preview_args, pending) {
                        Ok(restarted) => {
                            if let Ok(mut slot) = stream.lock() {
                                *slot = Some(restarted);
                            }
                        }
                        Err(e) => log::error!("Failed to resume preview: {:#}", e),
                    }
                }

                let _ = done.send(event);
            });

        match spawned {
            Ok(handle) => self.capture_thread = Some(handle),
            Err(e) => log::error!("Failed to start still capture thread: {}", e),
        }
    }
}

impl Drop for RpicamFrameSource {
    fn drop(&mut self) {
        self.stop();
        log::info!("Camera controller dropped");
    }
}

/// Stills never take the preview's `--mode`; rpicam-still then reads out the
/// full sensor at its deepest bit depth.
fn still_args(jpeg_path: &Path) -> Vec<String> {
    vec![
        "-n".to_string(),
        "-t".to_string(), "1000".to_string(),   // let AGC/AWB settle
        "-r".to_string(),
        "-o".to_string(), jpeg_path.to_string_lossy().into_owned(),
    ]
}

fn run_still(program: &str, path: &Path) -> Result<()> {
    // --raw writes the DNG next to the JPEG output, with a .dng extension
    let jpeg_path = path.with_extension("jpg");
    let raw_path = path.with_extension("dng");
    let args = still_args(&jpeg_path);

    log::info!("Capture command: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(&args)
        .output()
        .with_context(|| format!("Failed to run {}", program))?;

    let _ = std::fs::remove_file(&jpeg_path);

    if !output.status.success() {
        return Err(anyhow!(
            "{} failed with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    if raw_path != path {
        std::fs::rename(&raw_path, path)
            .with_context(|| format!("Failed to move {} to {}", raw_path.display(), path.display()))?;
    }

    if !path.exists() {
        return Err(anyhow!("{} did not write {}", program, path.display()));
    }
    log::info!("Still saved to {}", path.display());
    Ok(())
}

struct PreviewStream {
    child: Child,
    reader: Option<JoinHandle<()>>,
}

impl PreviewStream {
    fn spawn(program: &str, args: &[String], pending: PendingRequest) -> Result<Self> {
        log::info!("Preview command: {} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to start preview with {}", program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Preview process has no stdout"))?;

        let reader = std::thread::Builder::new()
            .name("preview-reader".to_string())
            .spawn(move || read_mjpeg(stdout, pending))
            .context("Failed to start preview reader")?;

        log::info!("Camera preview started");
        Ok(Self {
            child,
            reader: Some(reader),
        })
    }

    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        log::info!("Camera preview stopped");
    }
}

fn read_mjpeg(mut stdout: ChildStdout, pending: PendingRequest) {
    let mut splitter = MjpegSplitter::default();
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("Preview stream read failed: {}", e);
                break;
            }
        };

        for jpeg in splitter.push(&chunk[..n]) {
            let waiting = pending.lock().ok().and_then(|mut p| p.take());
            // nobody asked for this frame; skip decoding it
            let Some(done) = waiting else { continue };

            match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                Ok(img) => {
                    let _ = done.send(SourceEvent::FrameReady(Frame::new(img.to_rgb8())));
                }
                Err(e) => {
                    log::debug!("Dropping undecodable preview frame: {}", e);
                    if let Ok(mut p) = pending.lock() {
                        p.get_or_insert(done);
                    }
                }
            }
        }
    }
    log::debug!("Preview stream ended");
}

const MAX_JPEG_BYTES: usize = 16 * 1024 * 1024;

/// Cuts a concatenated MJPEG byte stream into individual JPEG images.
#[derive(Default)]
struct MjpegSplitter {
    buffer: Vec<u8>,
}

impl MjpegSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut images = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buffer, 0xD8, 0) else {
                // keep a trailing 0xFF that may start the next marker
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let drop = self.buffer.len() - keep;
                self.buffer.drain(..drop);
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            match find_marker(&self.buffer, 0xD9, 2) {
                Some(end) => {
                    images.push(self.buffer.drain(..end + 2).collect());
                }
                None => {
                    if self.buffer.len() > MAX_JPEG_BYTES {
                        log::warn!("Discarding oversized preview frame");
                        self.buffer.clear();
                    }
                    break;
                }
            }
        }

        images
    }
}

fn find_marker(buffer: &[u8], marker: u8, from: usize) -> Option<usize> {
    if buffer.len() < 2 || from >= buffer.len() - 1 {
        return None;
    }
    buffer[from..]
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Jpeg).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_splitter_handles_split_chunks() {
        let first = jpeg(8, 8);
        let second = jpeg(16, 4);
        let mut stream = vec![0x00, 0x12];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let mut splitter = MjpegSplitter::default();
        let mut images = Vec::new();
        for piece in stream.chunks(7) {
            images.extend(splitter.push(piece));
        }

        assert_eq!(images.len(), 2);
        assert_eq!(images[0], first);
        assert_eq!(images[1], second);

        let decoded = image::load_from_memory_with_format(&images[1], ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 4));
    }

    #[test]
    fn test_splitter_waits_for_end_marker() {
        let image = jpeg(8, 8);
        let (head, tail) = image.split_at(image.len() - 1);

        let mut splitter = MjpegSplitter::default();
        assert!(splitter.push(head).is_empty());
        assert_eq!(splitter.push(tail), vec![image]);
    }

    fn source_with_mode(mode: SensorMode) -> RpicamFrameSource {
        RpicamFrameSource {
            video_command: "rpicam-vid".to_string(),
            still_command: "rpicam-still".to_string(),
            quality: 70,
            config: StreamConfig {
                preview_size: (800, 600),
                sensor_mode: Some(mode),
            },
            running: Arc::new(AtomicBool::new(false)),
            stream: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            capture_thread: None,
        }
    }

    #[test]
    fn test_binned_mode_only_applies_to_preview() {
        let binned = SensorMode {
            format: "SRGGB10_CSI2P".to_string(),
            bit_depth: 10,
            size: (1640, 1232),
            crop: (0, 0, 3280, 2464),
        };
        let source = source_with_mode(binned);

        let preview = source.preview_args();
        let mode_at = preview.iter().position(|a| a == "--mode").unwrap();
        assert_eq!(preview[mode_at + 1], "1640:1232:10:P");

        let still = still_args(Path::new("/home/pi/imx219/.staging/3200K_1000L.jpg"));
        assert!(!still.iter().any(|a| a == "--mode"));
        assert!(still.iter().any(|a| a == "-r"));
        assert_eq!(still.last().unwrap(), "/home/pi/imx219/.staging/3200K_1000L.jpg");
    }

    #[test]
    fn test_splitter_discards_garbage() {
        let mut splitter = MjpegSplitter::default();
        assert!(splitter.push(&[0x01, 0x02, 0x03, 0xFF]).is_empty());
        assert_eq!(splitter.buffer, vec![0xFF]);
    }
}

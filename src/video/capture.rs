//! V4L2 capture driver
//!
//! One driver owns one device. A dedicated capture thread runs either the
//! mmap streaming loop (poll with timeout, dequeue, publish, requeue) or the
//! blocking `read()` loop for devices without streaming I/O, and publishes
//! whole frames into a mutex-guarded latest-frame buffer that any number of
//! responders snapshot from.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type as BufferType;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::device::resolve_device_path;
use super::format::PixelFormat;
use crate::error::{AppError, Result};
use crate::params::{CaptureParams, Codec};

/// Number of mmap capture buffers requested from the driver
const NUM_BUFFERS: u32 = 4;
/// Poll timeout for the mmap loop
const POLL_TIMEOUT_MS: u16 = 100;
/// Scratch size for the read() fallback, enough for 1080p YUYV and then some
const READ_SCRATCH_SIZE: usize = 8 * 1024 * 1024;
/// How long start() waits for the capture thread to report readiness
const START_TIMEOUT: Duration = Duration::from_secs(5);

// V4L2 JPEG class compression quality control (v4l2-controls.h)
const V4L2_CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;

/// Legacy JPEG compression ("Q factor") ioctl payload, for drivers that
/// predate the JPEG control class (videodev2.h `struct v4l2_jpegcompression`).
#[repr(C)]
#[derive(Copy, Clone)]
struct V4l2JpegCompression {
    quality: i32,
    app_n: i32,
    app_len: i32,
    app_data: [u8; 60],
    com_len: i32,
    com_data: [u8; 60],
    jpeg_markers: u32,
}

nix::ioctl_read!(vidioc_g_jpegcomp, b'V', 61, V4l2JpegCompression);
nix::ioctl_write_ptr!(vidioc_s_jpegcomp, b'V', 62, V4l2JpegCompression);

/// Mode the device actually agreed to after negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
    pub pixel_format: PixelFormat,
}

/// State shared between the driver handle and its capture thread.
struct Shared {
    /// Most recent complete frame; written only by the capture thread.
    latest: Mutex<Vec<u8>>,
    has_frame: AtomicBool,
    running: AtomicBool,
    stop: AtomicBool,
}

/// Capture driver: created idle, started on first client, stopped by the
/// reaper or on drop.
pub struct CaptureDriver {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    negotiated: RwLock<Option<NegotiatedMode>>,
    start_lock: Mutex<()>,
}

impl CaptureDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                latest: Mutex::new(Vec::new()),
                has_frame: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
            negotiated: RwLock::new(None),
            start_lock: Mutex::new(()),
        }
    }

    /// Open and configure the device, then spawn the capture thread.
    ///
    /// `params` is updated in place with the negotiated width, height,
    /// framerate and JPEG quality. Idempotent while running.
    pub fn start(&self, device_id: &str, params: &mut CaptureParams) -> Result<()> {
        let _guard = self.start_lock.lock();
        if self.running() {
            return Ok(());
        }

        let path = resolve_device_path(device_id);
        let device = Device::with_path(&path).map_err(|e| {
            AppError::DeviceUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| AppError::DeviceUnavailable(format!("capability query failed: {}", e)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(AppError::DeviceUnavailable(
                "device does not support video capture".into(),
            ));
        }
        let use_mmap = caps.capabilities.contains(Flags::STREAMING);
        if !use_mmap && !caps.capabilities.contains(Flags::READ_WRITE) {
            return Err(AppError::DeviceUnavailable(
                "device supports neither streaming nor read I/O".into(),
            ));
        }
        info!(
            "Opening {} ({}): {}",
            path.display(),
            caps.card,
            if use_mmap { "mmap streaming" } else { "read()" }
        );

        // The device-side pixel format follows the requested codec: MJPEG
        // passes through, H.264 wants raw frames the encoder can take.
        let wanted = match params.codec {
            Codec::Mjpeg => PixelFormat::Mjpeg,
            Codec::H264 => PixelFormat::Yuyv,
        };
        let requested = Format::new(params.width, params.height, wanted.to_fourcc());
        let actual = device
            .set_format(&requested)
            .map_err(|e| AppError::DeviceUnavailable(format!("failed to set format: {}", e)))?;

        if actual.width != params.width || actual.height != params.height {
            warn!(
                "Device clamped {}x{} to {}x{}",
                params.width, params.height, actual.width, actual.height
            );
        }
        params.width = actual.width;
        params.height = actual.height;

        let pixel_format = PixelFormat::from_fourcc(actual.fourcc);
        match params.codec {
            Codec::Mjpeg if pixel_format != PixelFormat::Mjpeg => {
                return Err(AppError::DeviceUnavailable(format!(
                    "device did not accept MJPEG, got {:?}",
                    actual.fourcc
                )));
            }
            Codec::H264 if !pixel_format.is_encodable() => {
                return Err(AppError::DeviceUnavailable(format!(
                    "device does not provide raw frames for H264, got {:?}",
                    actual.fourcc
                )));
            }
            _ => {}
        }

        if params.codec == Codec::Mjpeg {
            negotiate_jpeg_quality(&device, params);
        }

        // Framerate is best effort; read back what the driver programmed.
        if let Err(e) = device.set_params(&Parameters::with_fps(params.fps)) {
            warn!("Failed to set hardware FPS: {}", e);
        }
        if let Ok(p) = device.params() {
            if p.interval.numerator > 0 && p.interval.denominator > 0 {
                let fps = p.interval.denominator / p.interval.numerator;
                if fps > 0 {
                    params.fps = fps;
                }
            }
        }
        info!(
            "Format set: {}x{} {} @ {} fps",
            params.width, params.height, pixel_format, params.fps
        );

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.has_frame.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", device_id))
            .spawn(move || {
                if use_mmap {
                    run_mmap_loop(device, shared, ready_tx);
                } else {
                    run_read_loop(device, shared, ready_tx);
                }
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                self.shared.stop.store(true, Ordering::SeqCst);
                let _ = handle.join();
                return Err(AppError::DeviceUnavailable(
                    "capture thread did not become ready".into(),
                ));
            }
        }

        *self.thread.lock() = Some(handle);
        *self.negotiated.write() = Some(NegotiatedMode {
            width: params.width,
            height: params.height,
            fps: params.fps,
            quality: params.quality,
            pixel_format,
        });

        Ok(())
    }

    /// Signal the capture thread and join it. Safe on a never-started or
    /// already-stopped driver; idempotent.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.has_frame.store(false, Ordering::SeqCst);
        self.shared.stop.store(false, Ordering::SeqCst);
    }

    /// Copy the most recent complete frame into `out`. Returns false when no
    /// frame has been captured yet.
    pub fn latest_frame(&self, out: &mut Vec<u8>) -> bool {
        if !self.shared.has_frame.load(Ordering::Acquire) {
            return false;
        }
        let latest = self.shared.latest.lock();
        if latest.is_empty() {
            return false;
        }
        out.clear();
        out.extend_from_slice(&latest);
        true
    }

    pub fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Option<NegotiatedMode> {
        *self.negotiated.read()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.mode()
            .map(|m| m.pixel_format)
            .unwrap_or(PixelFormat::Unknown)
    }

    pub fn width(&self) -> u32 {
        self.mode().map(|m| m.width).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.mode().map(|m| m.height).unwrap_or(0)
    }

    pub fn fps(&self) -> u32 {
        self.mode().map(|m| m.fps).unwrap_or(0)
    }
}

impl Default for CaptureDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CaptureDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

type ReadySender = mpsc::Sender<std::result::Result<(), AppError>>;

/// Streaming capture: buffers are requested, mapped and queued by the stream
/// setup; the loop polls the fd with a 100 ms timeout, dequeues one buffer,
/// publishes the used byte range under the frame lock and requeues.
fn run_mmap_loop(device: Device, shared: Arc<Shared>, ready: ReadySender) {
    let mut stream = match MmapStream::with_buffers(&device, BufferType::VideoCapture, NUM_BUFFERS)
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(AppError::DeviceUnavailable(format!(
                "failed to set up capture buffers: {}",
                e
            ))));
            return;
        }
    };
    if let Err(e) = stream.start() {
        let _ = ready.send(Err(AppError::DeviceUnavailable(format!(
            "failed to start streaming: {}",
            e
        ))));
        return;
    }

    shared.running.store(true, Ordering::SeqCst);
    let _ = ready.send(Ok(()));
    info!("Capture started (mmap)");

    let raw_fd = device.handle().fd();
    while !shared.stop.load(Ordering::Relaxed) {
        // SAFETY: the device is owned by this loop and its fd stays open for
        // the duration of the poll.
        let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("Capture poll failed: {}", e);
                break;
            }
        }

        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                if used == 0 {
                    continue;
                }
                {
                    let mut latest = shared.latest.lock();
                    latest.clear();
                    latest.extend_from_slice(&buf[..used]);
                }
                shared.has_frame.store(true, Ordering::Release);
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!("Capture dequeue failed: {}", e);
                break;
            }
        }
    }

    let _ = stream.stop();
    // Remaining kernel buffers are released when the stream drops.
    shared.running.store(false, Ordering::SeqCst);
    info!("Capture stopped (mmap)");
}

/// Blocking-read fallback for devices without streaming I/O.
fn run_read_loop(device: Device, shared: Arc<Shared>, ready: ReadySender) {
    let mut scratch = vec![0u8; READ_SCRATCH_SIZE];

    shared.running.store(true, Ordering::SeqCst);
    let _ = ready.send(Ok(()));
    info!("Capture started (read)");

    let raw_fd = device.handle().fd();
    while !shared.stop.load(Ordering::Relaxed) {
        match nix::unistd::read(raw_fd, &mut scratch) {
            Ok(0) => std::thread::sleep(Duration::from_millis(5)),
            Ok(n) => {
                {
                    let mut latest = shared.latest.lock();
                    latest.clear();
                    latest.extend_from_slice(&scratch[..n]);
                }
                shared.has_frame.store(true, Ordering::Release);
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                error!("Capture read failed: {}", e);
                break;
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    info!("Capture stopped (read)");
}

/// Program the requested JPEG quality into the device, preferring the JPEG
/// control class and falling back to the legacy compression ioctl. The value
/// the driver actually applied is written back into `params`.
fn negotiate_jpeg_quality(device: &Device, params: &mut CaptureParams) {
    params.quality = params.quality.clamp(1, 100);

    let ctrl = Control {
        id: V4L2_CID_JPEG_COMPRESSION_QUALITY,
        value: Value::Integer(params.quality as i64),
    };
    match device.set_control(ctrl) {
        Ok(()) => {
            if let Ok(applied) = device.control(V4L2_CID_JPEG_COMPRESSION_QUALITY) {
                if let Value::Integer(v) = applied.value {
                    if v > 0 {
                        params.quality = v as u32;
                    }
                }
            }
            debug!("MJPEG quality set to {} via control", params.quality);
        }
        Err(e) => {
            debug!("JPEG compression quality control rejected: {}", e);
            match set_quality_jpegcomp(device.handle().fd(), &mut params.quality) {
                Ok(()) => debug!("MJPEG quality set to {} via JPEGCOMP", params.quality),
                Err(e) => warn!("Device does not expose JPEG quality: {}", e),
            }
        }
    }
}

fn set_quality_jpegcomp(fd: RawFd, quality: &mut u32) -> io::Result<()> {
    // SAFETY: the struct layout matches the kernel's v4l2_jpegcompression and
    // the fd belongs to an open V4L2 device.
    unsafe {
        let mut comp: V4l2JpegCompression = std::mem::zeroed();
        vidioc_g_jpegcomp(fd, &mut comp).map_err(io::Error::from)?;
        comp.quality = *quality as i32;
        vidioc_s_jpegcomp(fd, &comp).map_err(io::Error::from)?;
        vidioc_g_jpegcomp(fd, &mut comp).map_err(io::Error::from)?;
        if comp.quality > 0 {
            *quality = comp.quality as u32;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_driver_accessors() {
        let driver = CaptureDriver::new();
        assert!(!driver.running());
        assert_eq!(driver.pixel_format(), PixelFormat::Unknown);
        assert_eq!(driver.width(), 0);
        assert_eq!(driver.height(), 0);

        let mut out = Vec::new();
        assert!(!driver.latest_frame(&mut out));
    }

    #[test]
    fn test_stop_is_idempotent_on_idle_driver() {
        let driver = CaptureDriver::new();
        driver.stop();
        driver.stop();
        assert!(!driver.running());
    }

    #[test]
    fn test_jpegcomp_struct_layout() {
        // Kernel struct layout: 3 ints, 60 bytes, int, 60 bytes, u32 for a
        // total of 140 bytes on all supported targets.
        assert_eq!(std::mem::size_of::<V4l2JpegCompression>(), 140);
    }
}

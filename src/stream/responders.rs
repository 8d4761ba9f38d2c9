//! Per-response stream workers
//!
//! Each HTTP stream is served by one blocking worker pulling frames from the
//! session's capture driver, optionally transcoding, and pushing framed
//! chunks into a bounded channel that the chunked response body drains.
//! A failed or closed send means the client went away; the worker returns
//! and its [`ClientGuard`] runs the disconnect path.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
#[cfg(feature = "h264")]
use tracing::warn;

use crate::error::Result;
use crate::params::{CaptureParams, Codec};
use crate::session::{ClientGuard, Session};
use crate::video::PixelFormat;

#[cfg(feature = "h264")]
use crate::error::AppError;
#[cfg(feature = "h264")]
use crate::stream::bitstream;
#[cfg(feature = "h264")]
use crate::stream::mp4frag::{self, Mp4Fragmenter};
#[cfg(feature = "h264")]
use crate::video::convert::{self, I420Buffer};
#[cfg(feature = "h264")]
use crate::video::encoder::H264Encoder;

/// Whether the H.264 paths were compiled in.
pub const H264_AVAILABLE: bool = cfg!(feature = "h264");

/// Wait when the capture driver is not running yet
const NOT_RUNNING_WAIT: Duration = Duration::from_millis(20);
/// Wait when the driver runs but has no usable frame
const EMPTY_WAIT: Duration = Duration::from_millis(10);
/// Wait after a transient per-frame encode failure
const ENCODE_RETRY_WAIT: Duration = Duration::from_millis(5);
/// SPS/PPS preflight: frames to attempt before giving up
#[cfg(feature = "h264")]
const PREFLIGHT_TRIES: usize = 200;

/// UDP datagram budget per packet
pub const UDP_MTU: usize = 1400;
/// Fixed framing header: frame_id u32, frag_id u16, num_frags u16, data_size u32
pub const UDP_HEADER_LEN: usize = 12;
/// Payload bytes per fragment
pub const UDP_MAX_PAYLOAD: usize = UDP_MTU - UDP_HEADER_LEN;

type ChunkSender = mpsc::Sender<Bytes>;

/// Multipart part for one JPEG frame: boundary, part headers, payload, CRLF.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg.len());
    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// MJPEG responder: passes device JPEG frames through as
/// `multipart/x-mixed-replace` parts, paced at the requested framerate.
/// Re-sends the latest frame when the device is slower than the pace.
pub fn run_mjpeg(guard: ClientGuard, params: CaptureParams, tx: ChunkSender) {
    let session = guard.session().clone();
    let capture = session.capture.clone();
    let interval = Duration::from_millis(params.frame_interval_ms());
    let mut frame = Vec::new();

    loop {
        if tx.is_closed() {
            return;
        }
        if !capture.running() {
            std::thread::sleep(NOT_RUNNING_WAIT);
            continue;
        }
        if capture.pixel_format() != PixelFormat::Mjpeg || !capture.latest_frame(&mut frame) {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }

        let part = mjpeg_part(&frame);
        let len = part.len();
        if tx.blocking_send(part).is_err() {
            return;
        }
        session.record_sent(len);
        std::thread::sleep(interval);
    }
}

/// Convert a captured frame into the caller's I420 buffer. Returns false for
/// frames that are short or in a format the encoder cannot take.
#[cfg(feature = "h264")]
fn convert_to_i420(frame: &[u8], format: PixelFormat, params: &CaptureParams, buf: &mut I420Buffer) -> bool {
    let width = params.width as usize;
    let height = params.height as usize;
    match format {
        PixelFormat::Yuyv => {
            if frame.len() < width * height * 2 {
                return false;
            }
            let (y, u, v) = buf.planes_mut();
            convert::yuyv_to_i420(frame, width, height, y, u, v);
            true
        }
        PixelFormat::Nv12 => {
            if frame.len() < width * height * 3 / 2 {
                return false;
            }
            let (src_y, src_uv) = frame.split_at(width * height);
            let (y, u, v) = buf.planes_mut();
            convert::nv12_to_i420(src_y, src_uv, width, height, width, width, y, u, v);
            true
        }
        _ => false,
    }
}

/// Raw H.264 responder: encodes raw frames and writes each as a four-byte
/// start code followed by the frame's Annex-B NAL bytes.
#[cfg(feature = "h264")]
pub fn run_h264_raw(guard: ClientGuard, params: CaptureParams, tx: ChunkSender) {
    let session = guard.session().clone();
    let capture = session.capture.clone();

    let mut encoder = match H264Encoder::new(&params) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("H264 responder failed to start: {}", e);
            return;
        }
    };

    let interval = Duration::from_millis(params.frame_interval_ms());
    let mut i420 = I420Buffer::new(params.width, params.height);
    let mut frame = Vec::new();
    let mut annexb = Vec::new();

    loop {
        if tx.is_closed() {
            return;
        }
        if !capture.running() {
            std::thread::sleep(NOT_RUNNING_WAIT);
            continue;
        }
        let format = capture.pixel_format();
        if !format.is_encodable() || !capture.latest_frame(&mut frame) {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if !convert_to_i420(&frame, format, &params, &mut i420) {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if encoder
            .encode_i420(i420.y(), i420.u(), i420.v(), &mut annexb)
            .is_err()
        {
            std::thread::sleep(ENCODE_RETRY_WAIT);
            continue;
        }

        let mut chunk = BytesMut::with_capacity(4 + annexb.len());
        chunk.put_slice(&[0, 0, 0, 1]);
        chunk.put_slice(&annexb);
        let len = chunk.len();
        if tx.blocking_send(chunk.freeze()).is_err() {
            return;
        }
        session.record_sent(len);
        std::thread::sleep(interval);
    }
}

#[cfg(not(feature = "h264"))]
pub fn run_h264_raw(_guard: ClientGuard, _params: CaptureParams, _tx: ChunkSender) {}

/// Synchronously encode frames until SPS and PPS are observed and cached on
/// the session, so the fMP4 response can fail before any body is written.
#[cfg(feature = "h264")]
pub fn preflight_parameter_sets(session: &Arc<Session>, params: &CaptureParams) -> Result<()> {
    if !session.capture.running() {
        return Err(AppError::Fmp4Unavailable("capture not running".into()));
    }
    if session.parameter_sets().is_some() {
        return Ok(());
    }

    let mut encoder = H264Encoder::new(params)
        .map_err(|_| AppError::Fmp4Unavailable("h264 encoder init failed".into()))?;
    let mut i420 = I420Buffer::new(params.width, params.height);
    let mut frame = Vec::new();
    let mut annexb = Vec::new();

    for _ in 0..PREFLIGHT_TRIES {
        if !session.capture.latest_frame(&mut frame) {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        let format = session.capture.pixel_format();
        if !format.is_encodable() {
            return Err(AppError::Fmp4Unavailable(format!(
                "unsupported pixel format: {}",
                format
            )));
        }
        if !convert_to_i420(&frame, format, params, &mut i420) {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if encoder
            .encode_i420(i420.y(), i420.u(), i420.v(), &mut annexb)
            .is_err()
        {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if let (Some(sps), Some(pps)) = bitstream::extract_sps_pps(&annexb) {
            session.cache_parameter_sets(sps.to_vec(), pps.to_vec());
            return Ok(());
        }
    }

    Err(AppError::Fmp4Unavailable("timed out waiting for SPS/PPS".into()))
}

#[cfg(not(feature = "h264"))]
pub fn preflight_parameter_sets(_session: &Arc<Session>, _params: &CaptureParams) -> Result<()> {
    Err(crate::error::AppError::H264Unavailable(
        "OpenH264 support not compiled in".into(),
    ))
}

/// fMP4 responder: emits the init segment once SPS/PPS are known, then one
/// moof+mdat per encoded frame. Sequence numbers and decode times are local
/// to this response.
#[cfg(feature = "h264")]
pub fn run_fmp4(guard: ClientGuard, params: CaptureParams, tx: ChunkSender) {
    let session = guard.session().clone();
    let capture = session.capture.clone();

    let mut encoder = match H264Encoder::new(&params) {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("fMP4 responder failed to start: {}", e);
            return;
        }
    };

    let sample_duration = mp4frag::sample_duration_for_fps(params.fps);
    let interval = Duration::from_millis(params.frame_interval_ms());
    let mut mux = session
        .parameter_sets()
        .map(|(sps, pps)| Mp4Fragmenter::new(params.width, params.height, params.fps, sps, pps));
    let mut sent_init = false;
    let mut sequence_number: u32 = 1;
    let mut decode_time: u64 = 0;

    let mut i420 = I420Buffer::new(params.width, params.height);
    let mut frame = Vec::new();
    let mut annexb = Vec::new();

    loop {
        if tx.is_closed() {
            return;
        }
        if !capture.running() {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if !capture.latest_frame(&mut frame) {
            std::thread::sleep(ENCODE_RETRY_WAIT);
            continue;
        }
        let format = capture.pixel_format();
        if !format.is_encodable() || !convert_to_i420(&frame, format, &params, &mut i420) {
            std::thread::sleep(ENCODE_RETRY_WAIT);
            continue;
        }
        if encoder
            .encode_i420(i420.y(), i420.u(), i420.v(), &mut annexb)
            .is_err()
        {
            std::thread::sleep(ENCODE_RETRY_WAIT);
            continue;
        }

        if mux.is_none() {
            if let (Some(sps), Some(pps)) = bitstream::extract_sps_pps(&annexb) {
                session.cache_parameter_sets(sps.to_vec(), pps.to_vec());
                mux = Some(Mp4Fragmenter::new(
                    params.width,
                    params.height,
                    params.fps,
                    sps.to_vec(),
                    pps.to_vec(),
                ));
            }
        }
        let Some(mux) = mux.as_ref() else { continue };

        if !sent_init {
            let init = Bytes::from(mux.build_init_segment());
            if tx.blocking_send(init).is_err() {
                return;
            }
            sent_init = true;
        }

        let avcc = bitstream::annexb_to_avcc(&annexb);
        let keyframe = bitstream::is_idr_frame(&annexb);
        let fragment = mux.build_fragment(
            &avcc,
            sequence_number,
            decode_time,
            sample_duration,
            keyframe,
        );
        sequence_number += 1;
        decode_time += sample_duration as u64;

        let len = fragment.len();
        if tx.blocking_send(Bytes::from(fragment)).is_err() {
            return;
        }
        session.record_sent(len);
        std::thread::sleep(interval);
    }
}

#[cfg(not(feature = "h264"))]
pub fn run_fmp4(_guard: ClientGuard, _params: CaptureParams, _tx: ChunkSender) {}

/// Split one frame into MTU-sized fragments, each prefixed with the framing
/// header (all fields big-endian). Fragments of one frame share `frame_id`
/// and `num_frags`; `frag_id` is a dense 0-based index.
pub fn packetize(frame_id: u32, frame: &[u8]) -> Vec<Vec<u8>> {
    if frame.is_empty() {
        return Vec::new();
    }
    let num_frags = frame.len().div_ceil(UDP_MAX_PAYLOAD) as u16;
    let mut packets = Vec::with_capacity(num_frags as usize);
    for (frag_id, chunk) in frame.chunks(UDP_MAX_PAYLOAD).enumerate() {
        let mut packet = Vec::with_capacity(UDP_HEADER_LEN + chunk.len());
        packet.extend_from_slice(&frame_id.to_be_bytes());
        packet.extend_from_slice(&(frag_id as u16).to_be_bytes());
        packet.extend_from_slice(&num_frags.to_be_bytes());
        packet.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        packet.extend_from_slice(chunk);
        packets.push(packet);
    }
    packets
}

fn send_fragmented(session: &Session, socket: &UdpSocket, frame: &[u8]) {
    if frame.is_empty() {
        return;
    }
    let frame_id = session.frame_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut total = 0;
    for packet in packetize(frame_id, frame) {
        if socket.send(&packet).is_err() {
            return;
        }
        total += packet.len();
    }
    session.record_sent(total);
}

/// UDP push sender: runs detached from the HTTP response for `duration`,
/// fragmenting each frame to the connected socket. For H.264 the session's
/// IDR-request counter is polled every iteration and an advance forces the
/// next frame to be an IDR.
pub fn run_udp(guard: ClientGuard, params: CaptureParams, socket: UdpSocket, duration: Duration) {
    let session = guard.session().clone();
    let capture = session.capture.clone();
    let interval = Duration::from_millis(params.frame_interval_ms());
    let deadline = Instant::now() + duration;
    let mut frame = Vec::new();

    #[cfg(feature = "h264")]
    let mut h264_state = if params.codec == Codec::H264 {
        match H264Encoder::new(&params) {
            Ok(encoder) => Some((
                encoder,
                I420Buffer::new(params.width, params.height),
                session.idr_requests.load(std::sync::atomic::Ordering::Relaxed),
            )),
            Err(e) => {
                warn!("UDP sender failed to start encoder: {}", e);
                return;
            }
        }
    } else {
        None
    };
    #[cfg(feature = "h264")]
    let mut annexb = Vec::new();

    while Instant::now() < deadline {
        if !capture.running() {
            std::thread::sleep(EMPTY_WAIT);
            continue;
        }
        if !capture.latest_frame(&mut frame) {
            std::thread::sleep(ENCODE_RETRY_WAIT);
            continue;
        }

        match params.codec {
            Codec::Mjpeg => {
                send_fragmented(&session, &socket, &frame);
            }
            Codec::H264 => {
                #[cfg(feature = "h264")]
                {
                    let Some((encoder, i420, last_idr)) = h264_state.as_mut() else {
                        return;
                    };
                    let format = capture.pixel_format();
                    if !format.is_encodable() || !convert_to_i420(&frame, format, &params, i420) {
                        std::thread::sleep(ENCODE_RETRY_WAIT);
                        continue;
                    }

                    let requested = session
                        .idr_requests
                        .load(std::sync::atomic::Ordering::Relaxed);
                    if requested != *last_idr {
                        encoder.force_idr();
                        *last_idr = requested;
                    }

                    if encoder
                        .encode_i420(i420.y(), i420.u(), i420.v(), &mut annexb)
                        .is_err()
                    {
                        std::thread::sleep(ENCODE_RETRY_WAIT);
                        continue;
                    }
                    send_fragmented(&session, &socket, &annexb);
                }
                #[cfg(not(feature = "h264"))]
                return;
            }
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal 1x1 white JPEG used as a framing fixture.
    const TINY_JPEG: &[u8] = &[
        0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43, 0x00, 0x03, 0x02, 0x02, 0x03, 0x02, 0x02, 0x03, 0x03,
        0x03, 0x03, 0x04, 0x03, 0x03, 0x04, 0x05, 0x08, 0x05, 0x05, 0x04, 0x04, 0x05, 0x0A, 0x07,
        0x07, 0x06, 0x08, 0x0C, 0x0A, 0x0C, 0x0C, 0x0B, 0x0A, 0x0B, 0x0B, 0x0D, 0x0E, 0x12, 0x10,
        0x0D, 0x0E, 0x11, 0x0E, 0x0B, 0x0B, 0x10, 0x16, 0x10, 0x11, 0x13, 0x14, 0x15, 0x15, 0x15,
        0x0C, 0x0F, 0x17, 0x18, 0x16, 0x14, 0x18, 0x12, 0x14, 0x15, 0x14, 0xFF, 0xC0, 0x00, 0x11,
        0x08, 0x00, 0x01, 0x00, 0x01, 0x03, 0x01, 0x11, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01,
        0xFF, 0xC4, 0x00, 0x14, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xC4, 0x00, 0x14, 0x10, 0x01, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF,
        0xDA, 0x00, 0x0C, 0x03, 0x01, 0x00, 0x02, 0x11, 0x03, 0x11, 0x00, 0x3F, 0x00, 0xFF, 0xD9,
    ];

    #[test]
    fn test_mjpeg_part_framing() {
        let part = mjpeg_part(TINY_JPEG);
        let text_end = part.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let header = std::str::from_utf8(&part[..text_end]).unwrap();

        assert!(header.starts_with("--frame\r\n"));
        assert!(header.contains("Content-Type: image/jpeg\r\n"));
        assert!(header.contains(&format!("Content-Length: {}\r\n", TINY_JPEG.len())));

        let body = &part[text_end..];
        assert_eq!(&body[..2], &[0xFF, 0xD8]); // SOI
        assert_eq!(&body[body.len() - 4..body.len() - 2], &[0xFF, 0xD9]); // EOI
        assert_eq!(&body[body.len() - 2..], b"\r\n");
    }

    #[test]
    fn test_packetize_single_fragment() {
        let frame = vec![0xAB; 100];
        let packets = packetize(7, &frame);
        assert_eq!(packets.len(), 1);

        let packet = &packets[0];
        assert_eq!(&packet[0..4], &7u32.to_be_bytes());
        assert_eq!(&packet[4..6], &0u16.to_be_bytes()); // frag_id
        assert_eq!(&packet[6..8], &1u16.to_be_bytes()); // num_frags
        assert_eq!(&packet[8..12], &100u32.to_be_bytes()); // data_size
        assert_eq!(&packet[12..], &frame[..]);
    }

    #[test]
    fn test_packetize_multi_fragment_reassembly() {
        let frame: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        let packets = packetize(42, &frame);
        assert_eq!(packets.len(), 3); // ceil(3000 / 1388)

        let mut reassembled = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.len() <= UDP_MTU);
            assert_eq!(&packet[0..4], &42u32.to_be_bytes());
            assert_eq!(&packet[4..6], &(i as u16).to_be_bytes());
            assert_eq!(&packet[6..8], &3u16.to_be_bytes());
            let data_size =
                u32::from_be_bytes(packet[8..12].try_into().unwrap()) as usize;
            assert_eq!(data_size, packet.len() - UDP_HEADER_LEN);
            reassembled.extend_from_slice(&packet[UDP_HEADER_LEN..]);
        }
        assert_eq!(reassembled, frame);
    }

    #[test]
    fn test_packetize_exact_boundary() {
        let frame = vec![1u8; UDP_MAX_PAYLOAD];
        let packets = packetize(0, &frame);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), UDP_MTU);

        let frame = vec![1u8; UDP_MAX_PAYLOAD + 1];
        let packets = packetize(0, &frame);
        assert_eq!(packets.len(), 2);
        assert_eq!(
            u32::from_be_bytes(packets[1][8..12].try_into().unwrap()),
            1
        );
    }

    #[test]
    fn test_packetize_empty_frame() {
        assert!(packetize(0, &[]).is_empty());
    }
}

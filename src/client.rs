//! Pull-mode client
//!
//! `--connect` turns the binary into a consumer: it fetches a raw H.264
//! stream from a running server, splits the chunked body into NAL units and
//! decodes them, reporting the decoded framerate as it goes.

use std::time::Instant;

use anyhow::{bail, Context};
use futures::StreamExt;
use openh264::decoder::Decoder;
use tracing::{debug, info};

/// Incremental Annex-B splitter over a chunked byte stream. Buffers input
/// until a complete NAL (delimited by the next start code) is available.
pub struct AnnexBSplitter {
    buffer: Vec<u8>,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn find_start_code(&self, from: usize) -> Option<(usize, usize)> {
        let buf = &self.buffer;
        let mut pos = from;
        while pos + 3 <= buf.len() {
            if buf[pos] == 0 && buf[pos + 1] == 0 {
                if buf[pos + 2] == 1 {
                    return Some((pos, 3));
                }
                if pos + 4 <= buf.len() && buf[pos + 2] == 0 && buf[pos + 3] == 1 {
                    return Some((pos, 4));
                }
            }
            pos += 1;
        }
        None
    }

    /// Next complete NAL payload (start code stripped), or None until more
    /// data arrives.
    pub fn next_nal(&mut self) -> Option<Vec<u8>> {
        let (start, prefix_len) = match self.find_start_code(0) {
            Some(found) => found,
            None => {
                // Keep a small tail so a start code split across chunks is
                // not lost.
                if self.buffer.len() > 3 {
                    self.buffer.drain(..self.buffer.len() - 3);
                }
                return None;
            }
        };

        let data_begin = start + prefix_len;
        let (next, _) = match self.find_start_code(data_begin) {
            Some(found) => found,
            None => {
                if start > 0 {
                    self.buffer.drain(..start);
                }
                return None;
            }
        };

        let nal = self.buffer[data_begin..next].to_vec();
        self.buffer.drain(..next);
        Some(nal)
    }
}

impl Default for AnnexBSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect to `host[:port]`, pull a raw H.264 stream for `device_id` and
/// decode it until the server closes the connection.
pub async fn run_client(connect_to: &str, device_id: &str) -> anyhow::Result<()> {
    let (host, port) = match connect_to.split_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().context("invalid port")?),
        None => (connect_to, 8080),
    };

    let url = format!(
        "http://{}:{}/stream/live/{}?codec=h264&w=1280&h=720&fps=30",
        host, port, device_id
    );
    info!("Connecting to {}", url);

    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .context("connection failed")?;
    if !response.status().is_success() {
        bail!("server returned {}", response.status());
    }

    let mut decoder = Decoder::new().context("OpenH264 decoder init failed")?;
    let mut splitter = AnnexBSplitter::new();
    let mut frames = 0u64;
    let started = Instant::now();

    let mut body = response.bytes_stream();
    let mut packet = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("stream read failed")?;
        splitter.feed(&chunk);

        while let Some(nal) = splitter.next_nal() {
            packet.clear();
            packet.extend_from_slice(&[0, 0, 0, 1]);
            packet.extend_from_slice(&nal);

            match decoder.decode(&packet) {
                Ok(Some(frame)) => {
                    frames += 1;
                    if frames % 30 == 0 {
                        let (width, height) = frame.dimensions();
                        let fps = frames as f64 / started.elapsed().as_secs_f64().max(0.001);
                        info!(
                            "Decoded {} frames ({}x{}) @ {:.1} fps",
                            frames, width, height, fps
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Decode error: {}", e),
            }
        }
    }

    info!("Stream ended after {} decoded frames", frames);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_yields_complete_nals() {
        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&[0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3]);

        // The second NAL has no terminator yet.
        assert_eq!(splitter.next_nal(), Some(vec![0x67, 1, 2]));
        assert_eq!(splitter.next_nal(), None);

        // Terminate it with the next start code.
        splitter.feed(&[0, 0, 0, 1, 0x65]);
        assert_eq!(splitter.next_nal(), Some(vec![0x68, 3]));
    }

    #[test]
    fn test_splitter_handles_split_start_code() {
        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&[0, 0, 0, 1, 0x41, 9, 9, 0, 0]);
        assert_eq!(splitter.next_nal(), None);
        // Start code completes across the chunk boundary.
        splitter.feed(&[1, 0x42, 0, 0, 0, 1]);
        assert_eq!(splitter.next_nal(), Some(vec![0x41, 9, 9]));
        assert_eq!(splitter.next_nal(), Some(vec![0x42]));
    }

    #[test]
    fn test_splitter_discards_leading_garbage() {
        let mut splitter = AnnexBSplitter::new();
        splitter.feed(&[7, 7, 7, 0, 0, 1, 0x67, 5, 0, 0, 1, 0x68]);
        assert_eq!(splitter.next_nal(), Some(vec![0x67, 5]));
    }
}

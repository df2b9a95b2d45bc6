//! Network video stream: MJPEG over HTTP (`multipart/x-mixed-replace`), a
//! JPEG snapshot endpoint re-fetched on every capture, or RTSP through
//! GStreamer when built with the `rtsp-gstreamer` feature.

use crate::frame::{self, Frame};
#[cfg(feature = "rtsp-gstreamer")]
use crate::rtsp::RtspPipeline;
use crate::source::SourceError;
use std::io::Read;
use std::time::Duration;
use url::Url;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

enum Transport {
    Mjpeg(MjpegReader),
    Snapshot(ureq::Agent),
    #[cfg(feature = "rtsp-gstreamer")]
    Rtsp(RtspPipeline),
}

/// Decoded network stream handle.
pub struct NetworkStream {
    url: String,
    timeout: Duration,
    stream: Option<Transport>,
    sequence: u64,
}

impl NetworkStream {
    /// `timeout` bounds both the connect and every individual read.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            stream: None,
            sequence: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn initialize(&mut self) -> Result<(), SourceError> {
        if self.url.trim().is_empty() {
            return Err(SourceError::MissingUrl);
        }

        let parsed = Url::parse(&self.url).map_err(|e| self.open_error(e.to_string()))?;
        let stream = match parsed.scheme() {
            "http" | "https" => self.open_http()?,
            #[cfg(feature = "rtsp-gstreamer")]
            "rtsp" | "rtsps" => Transport::Rtsp(RtspPipeline::open(&self.url, self.timeout)?),
            #[cfg(not(feature = "rtsp-gstreamer"))]
            "rtsp" | "rtsps" => {
                return Err(self.open_error(
                    "RTSP streams need mirrorface-hw built with the rtsp-gstreamer feature"
                        .into(),
                ))
            }
            other => {
                return Err(self.open_error(format!(
                    "unsupported scheme '{other}'; expected http(s) or rtsp"
                )))
            }
        };

        self.stream = Some(stream);
        Ok(())
    }

    fn open_http(&self) -> Result<Transport, SourceError> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .build();
        let response = agent
            .get(&self.url)
            .call()
            .map_err(|e| self.open_error(e.to_string()))?;

        let content_type = response
            .header("Content-Type")
            .unwrap_or("")
            .to_ascii_lowercase();

        let stream = if content_type.contains("multipart") {
            Transport::Mjpeg(MjpegReader::new(response.into_reader()))
        } else {
            // A snapshot URL must answer with a decodable image now, not on
            // the first capture.
            let body = read_body(response.into_reader())
                .map_err(|e| self.open_error(format!("read snapshot: {e}")))?;
            frame::decode_jpeg(&body).map_err(|e| {
                self.open_error(format!("'{content_type}' response is not a JPEG image: {e}"))
            })?;
            Transport::Snapshot(agent)
        };

        tracing::info!(
            url = %self.url,
            content_type = %content_type,
            mjpeg = matches!(stream, Transport::Mjpeg(_)),
            "network stream opened"
        );
        Ok(stream)
    }

    /// Read the next picture, decode it and normalize it to a frame.
    pub fn capture(&mut self) -> Result<Frame, SourceError> {
        let stream = self.stream.as_mut().ok_or(SourceError::NotInitialized)?;
        let rgb = match stream {
            Transport::Mjpeg(reader) => frame::decode_jpeg(&reader.read_next_jpeg()?)?,
            Transport::Snapshot(agent) => frame::decode_jpeg(&fetch_snapshot(agent, &self.url)?)?,
            #[cfg(feature = "rtsp-gstreamer")]
            Transport::Rtsp(pipeline) => pipeline.next_image()?,
        };

        self.sequence += 1;
        tracing::debug!(
            url = %self.url,
            seq = self.sequence,
            width = rgb.width(),
            height = rgb.height(),
            "decoded network frame"
        );
        Ok(Frame::normalized(rgb, self.sequence))
    }

    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(url = %self.url, "network stream closed");
        }
    }

    fn open_error(&self, reason: String) -> SourceError {
        SourceError::StreamOpen {
            url: self.url.clone(),
            reason,
        }
    }
}

/// Splits an MJPEG byte stream into complete JPEGs.
struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, SourceError> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| SourceError::CaptureFailed(format!("read mjpeg chunk: {e}")))?;
            if read == 0 {
                return Err(SourceError::StreamEnded);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn read_body(reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, SourceError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| SourceError::CaptureFailed(format!("fetch snapshot: {e}")))?;
    let bytes = read_body(response.into_reader())
        .map_err(|e| SourceError::CaptureFailed(format!("read snapshot: {e}")))?;
    if bytes.is_empty() {
        return Err(SourceError::CaptureFailed("empty snapshot".into()));
    }
    Ok(bytes)
}

enum JpegEnd {
    Found(usize),
    Incomplete,
    Corrupt,
}

/// Locate the first complete JPEG in `buffer`.
///
/// Header segments are skipped by their length field, so an FF D9 pair inside
/// a comment or an EXIF thumbnail does not end the image. EOI is only taken
/// from entropy-coded data, where a literal 0xFF is always stuffed.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut from = 0;
    loop {
        let start = from + buffer[from..].windows(2).position(|w| w == [0xFF, 0xD8])?;
        match jpeg_end(buffer, start + 2) {
            JpegEnd::Found(end) => return Some((start, end)),
            JpegEnd::Incomplete => return None,
            // Resynchronize on the next SOI.
            JpegEnd::Corrupt => from = start + 2,
        }
    }
}

/// Walk marker segments from `pos` (just past SOI) to the end of EOI.
fn jpeg_end(buf: &[u8], mut pos: usize) -> JpegEnd {
    let mut in_scan = false;
    loop {
        if in_scan {
            let Some(offset) = buf
                .get(pos..)
                .and_then(|rest| rest.iter().position(|&b| b == 0xFF))
            else {
                return JpegEnd::Incomplete;
            };
            pos += offset;
            match buf.get(pos + 1) {
                None => return JpegEnd::Incomplete,
                // Stuffed zero or restart marker: still inside the scan.
                Some(0x00) | Some(0xD0..=0xD7) => {
                    pos += 2;
                    continue;
                }
                Some(0xFF) => {
                    pos += 1;
                    continue;
                }
                Some(_) => in_scan = false,
            }
        }

        match buf.get(pos) {
            None => return JpegEnd::Incomplete,
            Some(0xFF) => {}
            Some(_) => return JpegEnd::Corrupt,
        }
        let Some(&marker) = buf.get(pos + 1) else {
            return JpegEnd::Incomplete;
        };
        match marker {
            0xFF => pos += 1,
            0xD9 => return JpegEnd::Found(pos + 2),
            0x01 | 0xD0..=0xD7 => pos += 2,
            0x00 | 0xD8 => return JpegEnd::Corrupt,
            _ => {
                let (Some(&hi), Some(&lo)) = (buf.get(pos + 2), buf.get(pos + 3)) else {
                    return JpegEnd::Incomplete;
                };
                let len = u16::from_be_bytes([hi, lo]) as usize;
                if len < 2 {
                    return JpegEnd::Corrupt;
                }
                pos += 2 + len;
                // SOS: compressed data follows its header.
                in_scan = marker == 0xDA;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FRAME_HEIGHT, FRAME_WIDTH};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::{BufRead, BufReader, Cursor, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .unwrap();
        bytes
    }

    fn read_request(stream: &TcpStream) {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while reader.read_line(&mut line).unwrap_or(0) > 0 {
            if line == "\r\n" {
                break;
            }
            line.clear();
        }
    }

    /// Serve one connection per entry in `responses`, then stop.
    fn serve(responses: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                read_request(&stream);
                let _ = stream.write_all(&response);
            }
        });
        format!("http://{addr}/stream")
    }

    fn mjpeg_response(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = b"HTTP/1.1 200 OK\r\n\
            Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
            Connection: close\r\n\r\n"
            .to_vec();
        for frame in frames {
            body.extend_from_slice(
                format!(
                    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    frame.len()
                )
                .as_bytes(),
            );
            body.extend_from_slice(frame);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    fn snapshot_response(frame: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            frame.len()
        )
        .into_bytes();
        body.extend_from_slice(frame);
        body
    }

    /// Insert a COM segment holding an FF D9 pair right after SOI.
    fn with_eoi_in_comment(jpeg: &[u8]) -> Vec<u8> {
        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x06, b'x', 0xFF, 0xD9, b'y']);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn test_find_jpeg_bounds() {
        // SOI, SOS header (length 2), scan data with a stuffed FF, EOI.
        let buf = [
            0x00, 0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x11, 0xFF, 0x00, 0x22, 0xFF, 0xD9, 0x03,
        ];
        assert_eq!(find_jpeg_bounds(&buf), Some((1, 13)));
    }

    #[test]
    fn test_find_jpeg_bounds_incomplete() {
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0xFF]), None);
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A]), None);
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x11]), None);
        assert_eq!(find_jpeg_bounds(&[0x01, 0x02]), None);
    }

    #[test]
    fn test_find_jpeg_bounds_skips_eoi_inside_header_segment() {
        let buf = [
            0xFF, 0xD8, // SOI
            0xFF, 0xFE, 0x00, 0x04, 0xFF, 0xD9, // COM containing FF D9
            0xFF, 0xDA, 0x00, 0x02, 0x42, 0xFF, 0xD0, 0x43, // scan with RST0
            0xFF, 0xD9,
        ];
        assert_eq!(find_jpeg_bounds(&buf), Some((0, buf.len())));
    }

    #[test]
    fn test_find_jpeg_bounds_resyncs_after_garbage() {
        let buf = [
            0xFF, 0xD8, 0x13, 0x37, // SOI followed by a non-marker
            0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x55, 0xFF, 0xD9,
        ];
        assert_eq!(find_jpeg_bounds(&buf), Some((4, buf.len())));
    }

    #[test]
    fn test_encoded_jpeg_with_comment_is_found_whole() {
        let jpeg = with_eoi_in_comment(&jpeg(32, 24, [10, 10, 10]));
        let mut buf = b"--frame\r\n\r\n".to_vec();
        buf.extend_from_slice(&jpeg);
        buf.extend_from_slice(b"\r\n--frame");

        let (start, end) = find_jpeg_bounds(&buf).unwrap();
        assert_eq!(&buf[start..end], jpeg.as_slice());
        assert!(frame::decode_jpeg(&buf[start..end]).is_ok());
    }

    #[test]
    fn test_missing_url_fails_before_io() {
        let mut stream = NetworkStream::new("", Duration::from_secs(1));
        assert!(matches!(stream.initialize(), Err(SourceError::MissingUrl)));
        let mut stream = NetworkStream::new("   ", Duration::from_secs(1));
        assert!(matches!(stream.initialize(), Err(SourceError::MissingUrl)));
    }

    #[test]
    fn test_unsupported_scheme_fails_before_io() {
        let mut stream = NetworkStream::new("ftp://10.0.0.5/live", Duration::from_secs(1));
        let err = stream.initialize().err().unwrap();
        assert!(matches!(err, SourceError::StreamOpen { ref reason, .. } if reason.contains("ftp")));
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn test_rtsp_without_gstreamer_names_the_feature() {
        let mut stream = NetworkStream::new("rtsp://10.0.0.5/live", Duration::from_secs(1));
        let err = stream.initialize().err().unwrap();
        assert!(matches!(
            err,
            SourceError::StreamOpen { ref reason, .. } if reason.contains("rtsp-gstreamer")
        ));
    }

    #[test]
    fn test_snapshot_that_is_not_jpeg_fails_initialize() {
        let page = b"<html>login required</html>";
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            page.len()
        )
        .into_bytes();
        response.extend_from_slice(page);
        let url = serve(vec![response]);

        let mut stream = NetworkStream::new(url, Duration::from_secs(5));
        let err = stream.initialize().err().unwrap();
        assert!(matches!(
            err,
            SourceError::StreamOpen { ref reason, .. } if reason.contains("text/html")
        ));
        assert!(matches!(stream.capture(), Err(SourceError::NotInitialized)));
    }

    #[test]
    fn test_http_error_fails_initialize() {
        let url = serve(vec![
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
        ]);
        let mut stream = NetworkStream::new(url, Duration::from_secs(5));
        assert!(matches!(
            stream.initialize(),
            Err(SourceError::StreamOpen { .. })
        ));
    }

    #[test]
    fn test_mjpeg_frames_are_normalized_rgb() {
        let frames = vec![jpeg(640, 480, [220, 20, 20]), jpeg(160, 120, [20, 20, 220])];
        let url = serve(vec![mjpeg_response(&frames)]);

        let mut stream = NetworkStream::new(url, Duration::from_secs(5));
        stream.initialize().unwrap();

        let first = stream.capture().unwrap();
        assert_eq!((first.width(), first.height()), (FRAME_WIDTH, FRAME_HEIGHT));
        assert_eq!(first.sequence, 1);
        let [r, g, b] = first.image().get_pixel(160, 120).0;
        assert!(r > 180 && g < 60 && b < 60, "expected red, got {r},{g},{b}");

        let second = stream.capture().unwrap();
        assert_eq!((second.width(), second.height()), (FRAME_WIDTH, FRAME_HEIGHT));
        let [r, g, b] = second.image().get_pixel(160, 120).0;
        assert!(b > 180 && r < 60 && g < 60, "expected blue, got {r},{g},{b}");

        // Server closed the connection: the stream has ended.
        assert!(matches!(stream.capture(), Err(SourceError::StreamEnded)));
    }

    #[test]
    fn test_mjpeg_frame_with_eoi_in_comment_decodes() {
        let frames = vec![
            with_eoi_in_comment(&jpeg(64, 48, [20, 200, 20])),
            jpeg(64, 48, [20, 20, 220]),
        ];
        let url = serve(vec![mjpeg_response(&frames)]);

        let mut stream = NetworkStream::new(url, Duration::from_secs(5));
        stream.initialize().unwrap();

        let first = stream.capture().unwrap();
        let [r, g, b] = first.image().get_pixel(160, 120).0;
        assert!(g > 160 && r < 60 && b < 60, "expected green, got {r},{g},{b}");
        let second = stream.capture().unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn test_snapshot_endpoint_refetches() {
        let frame = jpeg(320, 240, [20, 200, 20]);
        let url = serve(vec![snapshot_response(&frame), snapshot_response(&frame)]);

        let mut stream = NetworkStream::new(url, Duration::from_secs(5));
        stream.initialize().unwrap();
        let captured = stream.capture().unwrap();
        assert_eq!((captured.width(), captured.height()), (FRAME_WIDTH, FRAME_HEIGHT));
        let [r, g, b] = captured.image().get_pixel(10, 10).0;
        assert!(g > 160 && r < 60 && b < 60, "expected green, got {r},{g},{b}");
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut stream = NetworkStream::new("http://127.0.0.1:9/", Duration::from_secs(1));
        stream.release();
        stream.release();
        assert!(matches!(stream.capture(), Err(SourceError::NotInitialized)));
    }
}

//! RTSP capture through a GStreamer decode pipeline ending in an RGB appsink.

use crate::frame;
use crate::source::SourceError;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSink;
use image::RgbImage;
use std::time::Duration;

pub(crate) struct RtspPipeline {
    url: String,
    pipeline: gst::Pipeline,
    appsink: AppSink,
    timeout: gst::ClockTime,
}

impl RtspPipeline {
    /// Build the pipeline and bring it to Playing.
    ///
    /// Waits up to `timeout` for the state change so an unreachable camera
    /// fails here rather than on the first capture.
    pub(crate) fn open(url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::StreamOpen {
            url: url.to_string(),
            reason,
        };

        gst::init().map_err(|e| open_error(format!("initialize gstreamer: {e}")))?;

        let pipeline = gst::parse::launch(&pipeline_description(url))
            .map_err(|e| open_error(format!("build pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("pipeline description is not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_error("appsink element missing from pipeline".into()))?
            .downcast::<AppSink>()
            .map_err(|_| open_error("appsink element has unexpected type".into()))?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let rtsp = Self {
            url: url.to_string(),
            pipeline,
            appsink,
            timeout: gst::ClockTime::from_mseconds(timeout.as_millis() as u64),
        };

        rtsp.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(format!("start pipeline: {e}")))?;
        let (result, _, _) = rtsp.pipeline.state(rtsp.timeout);
        if result.is_err() {
            let reason = rtsp
                .bus_failure()
                .unwrap_or_else(|| "pipeline failed to reach Playing".into());
            return Err(open_error(reason));
        }

        tracing::info!(url = %rtsp.url, "RTSP stream opened");
        Ok(rtsp)
    }

    /// Pull the next decoded picture.
    pub(crate) fn next_image(&mut self) -> Result<RgbImage, SourceError> {
        if let Some(reason) = self.bus_failure() {
            return Err(SourceError::CaptureFailed(reason));
        }

        let Some(sample) = self.appsink.try_pull_sample(self.timeout) else {
            if self.appsink.is_eos() {
                return Err(SourceError::StreamEnded);
            }
            return Err(SourceError::CaptureFailed("RTSP stream stalled".into()));
        };
        sample_to_image(&sample)
    }

    /// Drain the bus and report the first error or end-of-stream.
    fn bus_failure(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            match message.view() {
                gst::MessageView::Error(err) => {
                    return Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                gst::MessageView::Eos(..) => return Some("gstreamer reached EOS".into()),
                _ => {}
            }
        }
        None
    }
}

impl Drop for RtspPipeline {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!(url = %self.url, error = %e, "failed to stop RTSP pipeline");
        }
    }
}

/// `gst-launch` description for an RTSP URL, quoting the location.
fn pipeline_description(url: &str) -> String {
    let location = url.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "rtspsrc location=\"{location}\" latency=0 ! decodebin ! videoconvert ! \
         video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true"
    )
}

fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, SourceError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| SourceError::CaptureFailed("RTSP sample missing buffer".into()))?;
    let caps = sample
        .caps()
        .ok_or_else(|| SourceError::CaptureFailed("RTSP sample missing caps".into()))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| SourceError::CaptureFailed(format!("parse RTSP caps: {e}")))?;
    let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;

    let map = buffer
        .map_readable()
        .map_err(|e| SourceError::CaptureFailed(format!("map RTSP buffer: {e}")))?;
    Ok(frame::rgb24_to_image(
        map.as_slice(),
        info.width(),
        info.height(),
        stride,
    )?)
}

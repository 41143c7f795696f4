//! GStreamer-based network stream capture (RTSP and generic URIs)

use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::capture::source::{redact, StreamBackend};
use crate::error::CaptureError;

/// Decodes a network stream into packed RGB frames through an appsink
pub struct GstStreamSource {
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
    capture_size: Option<(u32, u32)>,
    read_timeout: Duration,
    sequence: u64,
}

impl GstStreamSource {
    pub fn new(capture_size: Option<(u32, u32)>, read_timeout: Duration) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Unsupported(format!("GStreamer init failed: {}", e)))?;

        Ok(Self {
            pipeline: None,
            appsink: None,
            capture_size,
            read_timeout,
            sequence: 0,
        })
    }

    /// Build the decode pipeline string for `uri`
    fn build_pipeline_string(&self, uri: &str) -> String {
        let source = if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            format!(
                "rtspsrc location=\"{}\" latency=0 protocols=tcp ! decodebin",
                uri
            )
        } else {
            format!("uridecodebin uri=\"{}\"", uri)
        };

        let size = match self.capture_size {
            Some((w, h)) => format!(",width={},height={}", w, h),
            None => String::new(),
        };

        format!(
            "{} ! \
             queue max-size-buffers=2 leaky=downstream ! \
             videoconvert ! \
             videoscale ! \
             video/x-raw,format=RGB{} ! \
             appsink name=appsink",
            source, size
        )
    }

    /// Surface pipeline errors posted on the bus since the last poll
    fn poll_bus(&self) -> Result<(), CaptureError> {
        let Some(bus) = self.pipeline.as_ref().and_then(|p| p.bus()) else {
            return Ok(());
        };

        while let Some(msg) = bus.pop() {
            use gst::MessageView;

            match msg.view() {
                MessageView::Error(err) => {
                    return Err(CaptureError::Read(format!(
                        "error from {:?}: {} ({:?})",
                        err.src().map(|s| s.path_string()),
                        err.error(),
                        err.debug()
                    )));
                }
                MessageView::Warning(warning) => {
                    warn!(
                        "Warning from {:?}: {}",
                        warning.src().map(|s| s.path_string()),
                        warning.error()
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl StreamBackend for GstStreamSource {
    fn connect(&mut self, uri: &str) -> Result<(), CaptureError> {
        self.release();

        let connect_err = |reason: String| CaptureError::Connect {
            uri: redact(uri),
            reason,
        };

        let pipeline_str = self.build_pipeline_string(uri);
        debug!("Pipeline: {}", redact(&pipeline_str));

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| connect_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| connect_err("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| connect_err("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| connect_err("Failed to cast to AppSink".into()))?;

        appsink.set_max_buffers(3);
        appsink.set_drop(true); // Drop old buffers if we can't keep up
        appsink.set_sync(false); // Don't sync to clock for lowest latency

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| connect_err(format!("Failed to start pipeline: {:?}", e)))?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);

        // Live sources report NoPreroll; only an outright failure is fatal here
        let (state_change, _, _) = self
            .pipeline
            .as_ref()
            .map(|p| p.state(gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64)))
            .ok_or(CaptureError::NotConnected)?;

        if let Err(e) = state_change.map_err(|e| connect_err(format!("{:?}", e))) {
            self.release();
            return Err(e);
        }
        if let Err(e) = self.poll_bus() {
            self.release();
            return Err(connect_err(e.to_string()));
        }

        info!("Pipeline started for {}", redact(uri));
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let timestamp = Instant::now();
        self.poll_bus()?;

        let appsink = self.appsink.as_ref().ok_or(CaptureError::NotConnected)?;

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            if appsink.is_eos() {
                return Ok(None);
            }
            return Err(CaptureError::Timeout(self.read_timeout));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::InvalidFrame("Sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::InvalidFrame("Sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| CaptureError::InvalidFrame("Failed to parse video info from caps".into()))?;

        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::InvalidFrame("Failed to map buffer".into()))?;

        let width = video_info.width();
        let height = video_info.height();
        let row_bytes = width as usize * 3;
        let stride = video_info.stride()[0] as usize;
        let data = map.as_slice();

        // Repack rows when the decoder pads its stride
        let pixels = if stride == row_bytes {
            data.to_vec()
        } else {
            let mut packed = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                match data.get(start..start + row_bytes) {
                    Some(slice) => packed.extend_from_slice(slice),
                    None => break,
                }
            }
            packed
        };

        self.sequence += 1;

        let mut frame = Frame::new(pixels, width, height, PixelFormat::Rgb24, self.sequence)
            .with_device_timestamp(buffer.pts().map(|pts| pts.into()));
        frame.timestamp = timestamp;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!("Failed to stop pipeline: {:?}", e);
            }
        }
    }
}

impl Drop for GstStreamSource {
    fn drop(&mut self) {
        self.release();
    }
}

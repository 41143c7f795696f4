//! GStreamer H.264/MP4 encoder with the moov atom up front for progressive playback

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{info, warn};

use super::encoder::VideoEncoder;
use crate::error::EncodeError;

pub struct Mp4Encoder {
    speed_preset: &'static str,
}

impl Default for Mp4Encoder {
    fn default() -> Self {
        Self {
            speed_preset: "veryfast",
        }
    }
}

fn backend<E: std::fmt::Debug>(context: &str) -> impl FnOnce(E) -> EncodeError + '_ {
    move |e| EncodeError::Backend(format!("{}: {:?}", context, e))
}

impl Mp4Encoder {
    /// Build pipeline string: appsrc -> H.264 -> faststart MP4 -> file
    fn build_pipeline_string(&self, path: &Path) -> String {
        format!(
            "appsrc name=appsrc ! \
             videoconvert ! \
             video/x-raw,format=I420 ! \
             x264enc speed-preset={} ! \
             video/x-h264,profile=main ! \
             mp4mux faststart=true ! \
             filesink location=\"{}\"",
            self.speed_preset,
            path.display()
        )
    }

    fn push_frames(
        appsrc: &gst_app::AppSrc,
        info: &gst_video::VideoInfo,
        frames: &[RgbImage],
        fps: u32,
    ) -> Result<(), EncodeError> {
        let row_bytes = info.width() as usize * 3;
        let stride = info.stride()[0] as usize;
        let frame_ns = 1_000_000_000u64 / fps as u64;

        for (i, frame) in frames.iter().enumerate() {
            // RGB rows are padded to 4 bytes in GStreamer's layout
            let mut data = vec![0u8; info.size()];
            for (row, src) in frame.as_raw().chunks_exact(row_bytes).enumerate() {
                data[row * stride..row * stride + row_bytes].copy_from_slice(src);
            }

            let mut buffer = gst::Buffer::from_mut_slice(data);
            {
                let buffer_ref = buffer.make_mut();
                buffer_ref.set_pts(gst::ClockTime::from_nseconds(i as u64 * frame_ns));
                buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns));
            }

            appsrc
                .push_buffer(buffer)
                .map_err(backend("Failed to push buffer"))?;
        }

        appsrc
            .end_of_stream()
            .map_err(backend("Failed to signal end of stream"))?;
        Ok(())
    }
}

impl VideoEncoder for Mp4Encoder {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn encode(&self, frames: &[RgbImage], fps: u32, path: &Path) -> Result<(), EncodeError> {
        let first = frames.first().ok_or(EncodeError::Empty)?;
        let (width, height) = first.dimensions();
        let fps = fps.max(1);

        gst::init().map_err(backend("Failed to initialize GStreamer"))?;

        let pipeline = gst::parse::launch(&self.build_pipeline_string(path))
            .map_err(backend("Failed to parse pipeline"))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncodeError::Backend("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("appsrc")
            .ok_or_else(|| EncodeError::Backend("Failed to find appsrc".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| EncodeError::Backend("Failed to cast to AppSrc".into()))?;

        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
            .fps(gst::Fraction::new(fps as i32, 1))
            .build()
            .map_err(backend("Invalid video info"))?;
        let caps = info.to_caps().map_err(backend("Invalid caps"))?;

        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(false);
        appsrc.set_block(true);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(backend("Failed to start pipeline"))?;

        let result = Self::push_frames(&appsrc, &info, frames, fps).and_then(|()| {
            let bus = pipeline
                .bus()
                .ok_or_else(|| EncodeError::Backend("Pipeline has no bus".into()))?;

            for msg in bus.iter_timed(gst::ClockTime::NONE) {
                use gst::MessageView;

                match msg.view() {
                    MessageView::Eos(..) => return Ok(()),
                    MessageView::Error(err) => {
                        return Err(EncodeError::Backend(format!(
                            "Error from {:?}: {} ({:?})",
                            err.src().map(|s| s.path_string()),
                            err.error(),
                            err.debug()
                        )));
                    }
                    MessageView::Warning(warning) => {
                        warn!("Encoder warning: {}", warning.error());
                    }
                    _ => {}
                }
            }
            Err(EncodeError::Backend("Bus closed before end of stream".into()))
        });

        if let Err(e) = pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop encoder pipeline: {:?}", e);
        }

        result?;
        info!(frames = frames.len(), fps, "Saved web-optimized video: {}", path.display());
        Ok(())
    }
}

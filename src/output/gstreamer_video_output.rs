// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! # GStreamer 视频文件输出模块
//!
//! 将画好检测框的帧编码为视频文件，容器由扩展名决定：
//!
//! - **MP4** / **MKV** (H.264)
//! - **AVI**
//! - **WebM** (VP8)
//!
//! URL 形如 `gst:///records/meal.mp4?fps=15`，`fps` 默认 30。
//! 分辨率取第一帧的尺寸，之后的帧尺寸必须一致。

use std::sync::{Mutex, PoisonError};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  aggregate::FrameReport,
  frame::RgbFrame,
  output::{Render, draw::Draw},
  url_local_path,
};

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  /// URI scheme 不匹配
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 无法转换元素为 appsrc
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 帧尺寸与第一帧不同
  #[error("Frame size changed from {expected:?} to {actual:?}")]
  FrameSizeChanged {
    expected: (usize, usize),
    actual: (usize, usize),
  },
}

#[derive(Default)]
struct EncoderState {
  frame_count: u64,
  size: Option<(usize, usize)>,
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  path: String,
  draw: Draw,
  state: Mutex<EncoderState>,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gst";
}

fn encoder_for(path: &str) -> &'static str {
  let ext = path.rsplit('.').next().unwrap_or_default();
  match ext {
    "mkv" => "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux",
    "avi" => "video/x-raw,format=I420 ! x264enc ! avimux",
    "webm" => "vp8enc ! webmmux",
    _ => {
      "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
    }
  }
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    gst::init()?;

    let fps: i32 = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(30);
    let path = url_local_path(url);

    let pipeline_desc = format!(
      "appsrc name=src format=time ! videoconvert ! {} ! filesink location=\"{}\"",
      encoder_for(&path),
      path
    );
    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      fps,
      path,
      draw: Draw::default(),
      state: Mutex::new(EncoderState::default()),
    })
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.size.is_some() {
      let _ = self.appsrc.end_of_stream();
      // 等待 EOS 写完文件尾
      if let Some(bus) = self.pipeline.bus() {
        let _ = bus.timed_pop_filtered(
          gst::ClockTime::from_seconds(5),
          &[gst::MessageType::Eos, gst::MessageType::Error],
        );
      }
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }

    info!(
      "Video output closed. Total frames written: {} -> {}",
      state.frame_count, self.path
    );
  }
}

impl GStreamerVideoOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  fn push_frame(&self, width: usize, height: usize, data: Vec<u8>) -> Result<(), GStreamerVideoOutputError> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

    match state.size {
      None => {
        let caps = gst::Caps::builder("video/x-raw")
          .field("format", "RGB")
          .field("width", width as i32)
          .field("height", height as i32)
          .field("framerate", gst::Fraction::new(self.fps, 1))
          .build();
        self.appsrc.set_caps(Some(&caps));
        self.pipeline.set_state(gst::State::Playing)?;
        state.size = Some((width, height));
        info!(
          "Video output initialized: {}x{} @ {} fps -> {}",
          width, height, self.fps, self.path
        );
      }
      Some(expected) if expected != (width, height) => {
        return Err(GStreamerVideoOutputError::FrameSizeChanged {
          expected,
          actual: (width, height),
        });
      }
      Some(_) => {}
    }

    let frame_duration = 1_000_000_000 / self.fps as u64;
    let mut buffer = gst::Buffer::from_mut_slice(data);
    if let Some(buffer_ref) = buffer.get_mut() {
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(state.frame_count * frame_duration));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }
    state.frame_count += 1;

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;

    Ok(())
  }
}

impl Render for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn render_result(&self, frame: &RgbFrame, report: &FrameReport) -> Result<(), Self::Error> {
    let image = self.draw.draw_detection(frame, &report.detections);
    let (width, height) = (image.width() as usize, image.height() as usize);
    self.push_frame(width, height, image.into_raw())
  }
}

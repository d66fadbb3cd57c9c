// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/input/gstreamer_live.rs - 摄像头实时推送
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

//! # 摄像头实时推送
//!
//! 摄像头管道每产生一帧就调用注册的回调，回调返回的帧推送到显示管道。
//!
//! URL 形如 `gst://camera/dev/video0?width=640&height=480&fps=15&display=autovideosink`。

use std::{collections::HashMap, time::Duration};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  input::{FrameCallback, PushTransport, gstreamer_input::sample_to_frame},
  url_local_path,
};

#[derive(Error, Debug)]
pub enum GStreamerLiveError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("Failed to get element: {0}")]
  ElementNotFound(&'static str),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Callback already registered")]
  AlreadyRegistered,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 摄像头到显示窗口的实时传输
pub struct GStreamerLiveTransport {
  capture: gst::Pipeline,
  appsink: gst_app::AppSink,
  display: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  registered: bool,
  stopped: bool,
}

fn launch(description: &str) -> Result<gst::Pipeline, GStreamerLiveError> {
  info!("GStreamer pipeline description: {}", description);
  gst::parse::launch(description)?
    .downcast::<gst::Pipeline>()
    .map_err(|_| GStreamerLiveError::PipelineError("Failed to create pipeline".to_string()))
}

impl FromUrl for GStreamerLiveTransport {
  type Error = GStreamerLiveError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != "gst" || url.host_str() != Some("camera") {
      error!("实时传输只支持 gst://camera/<device>，收到 {}", url);
      return Err(GStreamerLiveError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };
    let display_sink = query
      .get("display")
      .map(String::as_str)
      .unwrap_or("autovideosink");

    gst::init()?;

    let capture = launch(&format!(
      "v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1 ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink max-buffers=2 drop=true",
      url_local_path(url),
      number("width", 640),
      number("height", 480),
      number("fps", 15),
    ))?;
    let appsink = capture
      .by_name("sink")
      .ok_or(GStreamerLiveError::ElementNotFound("appsink"))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerLiveError::ElementNotFound("appsink"))?;

    let display = launch(&format!(
      "appsrc name=src is-live=true do-timestamp=true format=time ! videoconvert ! {} sync=false",
      display_sink
    ))?;
    let appsrc = display
      .by_name("src")
      .ok_or(GStreamerLiveError::ElementNotFound("appsrc"))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerLiveError::ElementNotFound("appsrc"))?;

    Ok(GStreamerLiveTransport {
      capture,
      appsink,
      display,
      appsrc,
      registered: false,
      stopped: false,
    })
  }
}

impl PushTransport for GStreamerLiveTransport {
  type Error = GStreamerLiveError;

  fn register(&mut self, callback: FrameCallback) -> Result<(), Self::Error> {
    if self.registered {
      return Err(GStreamerLiveError::AlreadyRegistered);
    }

    let appsrc = self.appsrc.clone();
    let mut last_size: Option<(usize, usize)> = None;
    self.appsink.set_callbacks(
      gst_app::AppSinkCallbacks::builder()
        .new_sample(move |sink| {
          let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
          let frame = match sample_to_frame(&sample) {
            Ok(frame) => frame,
            Err(e) => {
              warn!("丢弃无法转换的帧: {}", e);
              return Ok(gst::FlowSuccess::Ok);
            }
          };

          let out = callback(frame);
          let size = (out.width(), out.height());
          if last_size != Some(size) {
            debug!("显示分辨率: {}x{}", size.0, size.1);
            let caps = gst::Caps::builder("video/x-raw")
              .field("format", "RGB")
              .field("width", size.0 as i32)
              .field("height", size.1 as i32)
              .field("framerate", gst::Fraction::new(0, 1))
              .build();
            appsrc.set_caps(Some(&caps));
            last_size = Some(size);
          }

          appsrc.push_buffer(gst::Buffer::from_mut_slice(out.into_raw()))
        })
        .build(),
    );

    self.display.set_state(gst::State::Playing)?;
    self.capture.set_state(gst::State::Playing)?;
    self.registered = true;
    info!("摄像头实时传输已启动");
    Ok(())
  }
}

impl GStreamerLiveTransport {
  /// 阻塞直到 `should_stop` 返回 true、摄像头结束或出错
  pub fn run_until(&self, mut should_stop: impl FnMut() -> bool) -> Result<(), GStreamerLiveError> {
    let bus = self
      .capture
      .bus()
      .ok_or(GStreamerLiveError::ElementNotFound("bus"))?;

    loop {
      if should_stop() {
        info!("收到停止请求");
        return Ok(());
      }
      let Some(msg) = bus.timed_pop_filtered(
        gst::ClockTime::from_nseconds(POLL_INTERVAL.as_nanos() as u64),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      ) else {
        continue;
      };
      match msg.view() {
        gst::MessageView::Eos(..) => {
          info!("摄像头流结束");
          return Ok(());
        }
        gst::MessageView::Error(err) => {
          return Err(GStreamerLiveError::PipelineError(err.error().to_string()));
        }
        _ => {}
      }
    }
  }

  /// 停止两条管道并释放摄像头；可重复调用
  pub fn stop(&mut self) {
    if self.stopped {
      return;
    }
    self.stopped = true;
    let _ = self.appsrc.end_of_stream();
    for pipeline in [&self.capture, &self.display] {
      if let Err(e) = pipeline.set_state(gst::State::Null) {
        warn!("Failed to stop GStreamer pipeline: {}", e);
      }
    }
    info!("摄像头实时传输已关闭");
  }
}

impl Drop for GStreamerLiveTransport {
  fn drop(&mut self) {
    self.stop();
  }
}

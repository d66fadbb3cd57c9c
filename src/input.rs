// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{fmt, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::{FromUrl, frame::RgbFrame};

/// 输入来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
  /// 单张图片
  Image,
  /// 视频文件
  VideoFile,
  /// 本地摄像头
  LiveCamera,
  /// 网络摄像头（RTSP/HTTP）
  IpCamera,
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SourceKind::Image => "图片",
      SourceKind::VideoFile => "视频文件",
      SourceKind::LiveCamera => "摄像头",
      SourceKind::IpCamera => "网络摄像头",
    };
    f.write_str(name)
  }
}

/// 拉取式帧来源
///
/// `next_frame` 返回 `None` 表示来源正常结束，返回 `Some(Err(_))` 表示读取失败。
pub trait FrameSource {
  type Error: std::error::Error + Send + Sync + 'static;

  fn kind(&self) -> SourceKind;

  fn next_frame(&mut self) -> Option<Result<RgbFrame, Self::Error>>;

  /// 释放文件句柄、设备或网络连接；会话在终止时调用一次
  fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  type Error = S::Error;

  fn kind(&self) -> SourceKind {
    (**self).kind()
  }

  fn next_frame(&mut self) -> Option<Result<RgbFrame, Self::Error>> {
    (**self).next_frame()
  }

  fn release(&mut self) {
    (**self).release()
  }
}

/// 推送式传输对每一帧调用的处理函数：收到一帧，返回叠加了检测框的一帧
pub type FrameCallback = Arc<dyn Fn(RgbFrame) -> RgbFrame + Send + Sync>;

/// 推送式实时传输，由外部事件循环驱动回调
pub trait PushTransport {
  type Error;

  fn register(&mut self, callback: FrameCallback) -> Result<(), Self::Error>;
}

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_live;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_live::{GStreamerLiveError, GStreamerLiveTransport};

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFileInputError(#[from] ImageFileInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
}

pub enum InputWrapper {
  #[cfg(feature = "read_image_file")]
  ReadImageFile(ImageFileInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamerInput(GStreamerInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "read_image_file")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageFileInput::SCHEME {
        let input = ImageFileInput::from_url(url)?;
        return Ok(InputWrapper::ReadImageFile(input));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      if GStreamerInputPipelineBuilder::accepts(url) {
        let input = GStreamerInputPipelineBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamerInput(input));
      }
    }
    Err(InputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl FrameSource for InputWrapper {
  type Error = InputError;

  fn kind(&self) -> SourceKind {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.kind(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.kind(),
      #[allow(unreachable_patterns)]
      _ => SourceKind::Image,
    }
  }

  fn next_frame(&mut self) -> Option<Result<RgbFrame, Self::Error>> {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.next_frame().map(|r| r.map_err(InputError::from)),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.next_frame().map(|r| r.map_err(InputError::from)),
      #[allow(unreachable_patterns)]
      _ => None,
    }
  }

  fn release(&mut self) {
    match self {
      #[cfg(feature = "read_image_file")]
      InputWrapper::ReadImageFile(input) => input.release(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamerInput(input) => input.release(),
      #[allow(unreachable_patterns)]
      _ => {}
    }
  }
}

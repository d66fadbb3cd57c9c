// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  SizeMismatch { expected: usize, actual: usize },
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: usize, height: usize },
}

/// 一帧 RGB 图像，内存布局为 HWC（即 NHWC 去掉 batch 维）
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
  height: usize,
  width: usize,
  data: Box<[u8]>,
}

impl RgbFrame {
  pub fn with_shape(height: usize, width: usize) -> Self {
    let size = RGB_CHANNELS * height * width;
    Self {
      height,
      width,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  pub fn from_raw(height: usize, width: usize, data: Vec<u8>) -> Result<Self, FrameError> {
    if height == 0 || width == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }
    let expected = RGB_CHANNELS * height * width;
    if data.len() != expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      height,
      width,
      data: data.into_boxed_slice(),
    })
  }

  /// 从 BGR 排列的数据构造帧，多余的尾部数据（行对齐填充）会被忽略
  pub fn from_bgr(height: usize, width: usize, bgr: &[u8]) -> Result<Self, FrameError> {
    let expected = RGB_CHANNELS * height * width;
    if bgr.len() < expected {
      return Err(FrameError::SizeMismatch {
        expected,
        actual: bgr.len(),
      });
    }

    let mut frame = Self::with_shape(height, width);
    for (dst, src) in frame
      .data
      .chunks_exact_mut(RGB_CHANNELS)
      .zip(bgr[..expected].chunks_exact(RGB_CHANNELS))
    {
      dst[0] = src[2];
      dst[1] = src[1];
      dst[2] = src[0];
    }
    Ok(frame)
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }

  pub fn into_raw(self) -> Vec<u8> {
    self.data.into_vec()
  }

  /// 转为 NCHW 排列
  pub fn to_nchw(&self) -> Vec<u8> {
    let plane = self.height * self.width;
    let mut out = vec![0u8; plane * RGB_CHANNELS];
    for (idx, pixel) in self.data.chunks_exact(RGB_CHANNELS).enumerate() {
      for (c, value) in pixel.iter().enumerate() {
        out[c * plane + idx] = *value;
      }
    }
    out
  }

  pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y * self.width + x) * RGB_CHANNELS;
    Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
  }
}

impl AsMut<[u8]> for RgbFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsRef<[u8]> for RgbFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

#[cfg(feature = "image")]
impl From<image::RgbImage> for RgbFrame {
  fn from(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      height: height as usize,
      width: width as usize,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

#[cfg(feature = "image")]
impl RgbFrame {
  pub fn to_rgb_image(&self) -> image::RgbImage {
    // 尺寸与数据长度在构造时已校验
    image::RgbImage::from_raw(self.width as u32, self.height as u32, self.data.to_vec())
      .unwrap_or_else(|| image::RgbImage::new(self.width as u32, self.height as u32))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn from_raw_rejects_wrong_length() {
    let err = RgbFrame::from_raw(2, 2, vec![0; 11]).unwrap_err();
    assert_eq!(
      err,
      FrameError::SizeMismatch {
        expected: 12,
        actual: 11
      }
    );
  }

  #[test]
  fn from_raw_rejects_empty_shape() {
    assert!(matches!(
      RgbFrame::from_raw(0, 4, vec![]),
      Err(FrameError::InvalidShape { .. })
    ));
  }

  #[test]
  fn bgr_is_swapped_to_rgb() {
    let frame = RgbFrame::from_bgr(1, 2, &[1, 2, 3, 4, 5, 6, 99]).unwrap();
    assert_eq!(frame.as_nhwc(), &[3, 2, 1, 6, 5, 4]);
  }

  #[test]
  fn nchw_groups_channels_into_planes() {
    let frame = RgbFrame::from_raw(1, 2, vec![1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(frame.to_nchw(), vec![1, 4, 2, 5, 3, 6]);
    assert_eq!(frame.pixel(1, 0), Some([4, 5, 6]));
    assert_eq!(frame.pixel(2, 0), None);
  }
}

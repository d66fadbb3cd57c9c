// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/model.rs - 检测模型
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

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, config::Confidence, frame::RgbFrame};

/// 目标检测器
///
/// 实现需在内部过滤掉低于 `confidence` 的结果。核心逻辑不做重试。
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error>;
}

impl<D: Detector + ?Sized> Detector for &D {
  type Error = D::Error;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error> {
    (**self).detect(frame, confidence)
  }
}

impl<D: Detector + ?Sized> Detector for Arc<D> {
  type Error = D::Error;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error> {
    (**self).detect(frame, confidence)
  }
}

/// 未声明线程安全的检测器在跨线程复用时以互斥锁包裹
impl<D: Detector> Detector for Mutex<D> {
  type Error = D::Error;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error> {
    let detector = self.lock().unwrap_or_else(|e| e.into_inner());
    detector.detect(frame, confidence)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，帧像素坐标
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn new(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }

  /// 保留置信度不低于阈值的结果，顺序不变
  pub fn above(&self, confidence: Confidence) -> Self {
    Self::new(
      self
        .items
        .iter()
        .filter(|item| item.score >= confidence.value())
        .copied()
        .collect(),
    )
  }
}

impl<'a> IntoIterator for &'a DetectResult {
  type Item = &'a DetectItem;
  type IntoIter = std::slice::Iter<'a, DetectItem>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

mod replay;
pub use self::replay::{RecordReplay, RecordReplayError};

#[cfg(feature = "model_yolo26")]
mod yolo26;
#[cfg(feature = "model_yolo26")]
pub use self::yolo26::{Yolo26, Yolo26Builder, Yolo26Error};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("检测结果回放错误: {0}")]
  RecordReplayError(#[from] RecordReplayError),
  #[cfg(feature = "model_yolo26")]
  #[error("YOLO26 模型错误: {0}")]
  Yolo26Error(#[from] Yolo26Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

pub enum ModelWrapper {
  RecordReplay(RecordReplay),
  #[cfg(feature = "model_yolo26")]
  Yolo26(Yolo26),
}

impl ModelWrapper {
  /// 按 URL 构建检测器；`num_classes` 在 URL 未指定类别数时使用
  #[cfg_attr(not(feature = "model_yolo26"), allow(unused_variables))]
  pub fn from_url_with_classes(url: &Url, num_classes: usize) -> Result<Self, ModelError> {
    match url.scheme() {
      RecordReplay::SCHEME => Ok(ModelWrapper::RecordReplay(RecordReplay::from_url(url)?)),
      #[cfg(feature = "model_yolo26")]
      Yolo26Builder::SCHEME => {
        let builder = Yolo26Builder::from_url(url)?;
        let builder = if builder.has_num_classes() {
          builder
        } else {
          builder.num_classes(num_classes)
        };
        Ok(ModelWrapper::Yolo26(builder.build()?))
      }
      other => Err(ModelError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Detector for ModelWrapper {
  type Error = ModelError;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error> {
    match self {
      ModelWrapper::RecordReplay(model) => Ok(model.detect(frame, confidence)?),
      #[cfg(feature = "model_yolo26")]
      ModelWrapper::Yolo26(model) => Ok(model.detect(frame, confidence)?),
    }
  }
}

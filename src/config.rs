// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/config.rs - 参数配置与启动加载
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

use std::{path::PathBuf, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl,
  aggregate::AggregationPolicy,
  catalog::{CatalogError, NutritionCatalog},
  model::{ModelError, ModelWrapper},
  output::{OutputError, OutputWrapper},
};

#[cfg(feature = "save_image_file")]
use crate::output::{Draw, DrawError};

pub const DEFAULT_CONFIDENCE_PERCENT: u8 = 40;
pub const MIN_CONFIDENCE_PERCENT: u8 = 10;
pub const MAX_CONFIDENCE_PERCENT: u8 = 100;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("置信度阈值必须在 [0, 1] 之间: {0}")]
  ConfidenceOutOfRange(f32),
  #[error("置信度百分比必须在 10..=100 之间: {0}")]
  PercentOutOfRange(u8),
}

/// 置信度阈值，取值 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Confidence(f32);

impl Confidence {
  pub fn new(value: f32) -> Result<Self, ConfigError> {
    if !(0.0..=1.0).contains(&value) {
      return Err(ConfigError::ConfidenceOutOfRange(value));
    }
    Ok(Self(value))
  }

  /// 界面滑块的百分比（10–100）转为阈值（0.10–1.00）
  pub fn from_percent(percent: u8) -> Result<Self, ConfigError> {
    if !(MIN_CONFIDENCE_PERCENT..=MAX_CONFIDENCE_PERCENT).contains(&percent) {
      return Err(ConfigError::PercentOutOfRange(percent));
    }
    Ok(Self(percent as f32 / 100.0))
  }

  pub fn value(&self) -> f32 {
    self.0
  }
}

impl Default for Confidence {
  fn default() -> Self {
    Self(DEFAULT_CONFIDENCE_PERCENT as f32 / 100.0)
  }
}

/// 各程序共用的命令行参数
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
  /// 检测模型，例如 yolo26:///models/food.rknn 或 replay:///data/detections.jsonl
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 营养数据文件（JSON）
  #[arg(long, value_name = "FILE")]
  pub catalog: PathBuf,

  /// 置信度阈值百分比 (10 - 100)
  #[arg(
    long,
    default_value_t = DEFAULT_CONFIDENCE_PERCENT,
    value_parser = clap::value_parser!(u8).range(10..=100),
    value_name = "PERCENT"
  )]
  pub confidence: u8,

  /// 输出，可重复指定，例如 report:stdout、image:///out.png、folder:///records
  #[arg(long, value_name = "OUTPUT", default_value = "report:stdout")]
  pub output: Vec<Url>,

  /// 标签字体（TTF/OTF）；不指定时只画检测框
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
}

impl CommonArgs {
  pub fn confidence(&self) -> Result<Confidence, ConfigError> {
    Confidence::from_percent(self.confidence)
  }
}

/// 单次会话的配置
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
  pub confidence: Confidence,
  pub policy: AggregationPolicy,
  /// 流式会话最多处理的帧数，`None` 表示不限
  pub max_frames: Option<usize>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      confidence: Confidence::default(),
      policy: AggregationPolicy::FrameLocal,
      max_frames: None,
    }
  }
}

impl SessionConfig {
  pub fn with_confidence(mut self, confidence: Confidence) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_max_frames(mut self, max_frames: Option<usize>) -> Self {
    self.max_frames = max_frames.filter(|n| *n > 0);
    self
  }
}

#[derive(Error, Debug)]
pub enum StartupError {
  #[error("营养数据加载失败: {0}")]
  CatalogError(#[from] CatalogError),
  #[error("模型加载失败: {0}")]
  ModelError(#[from] ModelError),
  #[error("配置错误: {0}")]
  ConfigError(#[from] ConfigError),
  #[error("输出创建失败: {0}")]
  OutputError(#[from] OutputError),
  #[cfg(feature = "save_image_file")]
  #[error("字体加载失败: {0}")]
  DrawError(#[from] DrawError),
}

/// 启动时加载完毕、可注入各会话的资源
pub struct Runtime {
  pub catalog: Arc<NutritionCatalog>,
  pub detector: ModelWrapper,
  pub confidence: Confidence,
}

/// 加载营养数据与模型；任一失败都在开始会话之前返回
pub fn bootstrap(args: &CommonArgs) -> Result<Runtime, StartupError> {
  let confidence = args.confidence()?;
  let catalog = Arc::new(NutritionCatalog::from_path(&args.catalog)?);

  info!("正在加载模型: {}", args.model);
  let detector = ModelWrapper::from_url_with_classes(&args.model, catalog.len())?;
  info!("模型加载完成");

  Ok(Runtime {
    catalog,
    detector,
    confidence,
  })
}

impl Runtime {
  /// 检测框绘制方式：标签使用营养数据表中的名称
  #[cfg(feature = "save_image_file")]
  pub fn draw(&self, args: &CommonArgs) -> Result<Draw, StartupError> {
    let draw = Draw::new(Arc::clone(&self.catalog));
    Ok(match &args.font {
      Some(path) => draw.with_font(Draw::load_font(path)?),
      None => draw,
    })
  }

  /// 按 `--output` 创建全部输出
  pub fn outputs(&self, args: &CommonArgs) -> Result<Vec<OutputWrapper>, StartupError> {
    #[cfg(feature = "save_image_file")]
    let draw = self.draw(args)?;
    #[cfg(not(feature = "save_image_file"))]
    if args.font.is_some() {
      tracing::warn!("未启用 save_image_file 特性，忽略 --font");
    }

    args
      .output
      .iter()
      .map(|url| -> Result<OutputWrapper, StartupError> {
        info!("输出: {}", url);
        let output = OutputWrapper::from_url(url)?;
        #[cfg(feature = "save_image_file")]
        let output = output.with_draw(&draw);
        Ok(output)
      })
      .collect()
  }
}

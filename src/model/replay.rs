// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/model/replay.rs - 检测结果回放
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

//! 按帧回放预先计算好的检测结果。
//!
//! 文件每行一个 JSON 数组，对应一帧的检测结果，空行表示该帧没有检测到物体：
//!
//! ```text
//! [{"class_id":3,"score":0.92,"bbox":[12.0,40.0,300.0,280.0]}]
//!
//! [{"class_id":3,"score":0.81,"bbox":[10.0,42.0,298.0,275.0]},{"class_id":999,"score":0.6,"bbox":[0,0,5,5]}]
//! ```
//!
//! URL 形如 `replay:///path/detections.jsonl`，加上 `?loop` 后回放结束时从头开始。

use std::{
  fs::File,
  io::{BufRead, BufReader},
  sync::Mutex,
};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::Confidence,
  frame::RgbFrame,
  model::{DetectResult, Detector},
  url_local_path,
};

#[derive(Error, Debug)]
pub enum RecordReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("第 {line} 行格式错误: {source}")]
  ParseError {
    line: usize,
    source: serde_json::Error,
  },
}

pub struct RecordReplay {
  frames: Vec<DetectResult>,
  cursor: Mutex<usize>,
  looped: bool,
}

impl FromUrlWithScheme for RecordReplay {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for RecordReplay {
  type Error = RecordReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RecordReplayError::SchemeMismatch);
    }

    let path = url_local_path(url);
    info!("加载检测结果回放文件: {}", path);
    let reader = BufReader::new(File::open(&path)?);
    let mut replay = Self::from_reader(reader)?;
    replay.looped = url.query_pairs().any(|(k, _)| k == "loop");
    info!("回放文件共 {} 帧", replay.frames.len());
    Ok(replay)
  }
}

impl RecordReplay {
  pub fn new(frames: Vec<DetectResult>) -> Self {
    Self {
      frames,
      cursor: Mutex::new(0),
      looped: false,
    }
  }

  pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, RecordReplayError> {
    let mut frames = Vec::new();
    for (index, line) in reader.lines().enumerate() {
      let line = line?;
      let line = line.trim();
      if line.is_empty() {
        frames.push(DetectResult::default());
        continue;
      }
      let result = serde_json::from_str::<DetectResult>(line).map_err(|source| {
        RecordReplayError::ParseError {
          line: index + 1,
          source,
        }
      })?;
      frames.push(result);
    }
    Ok(Self::new(frames))
  }

  pub fn with_loop(mut self, looped: bool) -> Self {
    self.looped = looped;
    self
  }

  fn next_record(&self) -> DetectResult {
    let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
    if self.looped && !self.frames.is_empty() {
      *cursor %= self.frames.len();
    }
    let result = self.frames.get(*cursor).cloned().unwrap_or_default();
    *cursor = cursor.saturating_add(1);
    result
  }
}

impl Detector for RecordReplay {
  type Error = RecordReplayError;

  fn detect(&self, frame: &RgbFrame, confidence: Confidence) -> Result<DetectResult, Self::Error> {
    let result = self.next_record().above(confidence);
    debug!(
      "回放 {}x{} 帧的检测结果: {} 个物体",
      frame.width(),
      frame.height(),
      result.len()
    );
    Ok(result)
  }
}

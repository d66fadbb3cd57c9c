// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/output/directory_record.rs - 按日期目录记录每一帧
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

//! # 目录记录
//!
//! `folder:///records` 把帧保存到 `records/年/月/日/时-分-秒-序号.png`，
//! 同名 `.json` 为该帧的营养报告。
//!
//! - `record=name|id`：保存原图，另写 `.txt` 检测记录（名称或编号、置信度、框）
//! - `always`：没有检测结果的帧也保存

use std::{
  fs::File,
  io::BufWriter,
  path::{Path, PathBuf},
  sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  aggregate::FrameReport,
  catalog::NutritionCatalog,
  frame::RgbFrame,
  output::{Render, draw::Draw},
  url_local_path,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 文本检测记录
#[derive(Clone)]
pub struct Record {
  pub label_with_name: bool,
  catalog: Option<Arc<NutritionCatalog>>,
}

impl Record {
  fn name(&self, class_id: u32) -> String {
    if self.label_with_name
      && let Some(food) = self.catalog.as_ref().and_then(|c| c.lookup(class_id))
    {
      return food.name.clone();
    }
    class_id.to_string()
  }

  pub fn record(&self, report: &FrameReport, path: &Path) -> Result<(), std::io::Error> {
    let records: Vec<String> = report
      .detections
      .iter()
      .map(|item| {
        format!(
          "{}, {:.4}, {:.1}, {:.1}, {:.1}, {:.1}",
          self.name(item.class_id),
          item.score,
          item.bbox[0],
          item.bbox[1],
          item.bbox[2],
          item.bbox[3]
        )
      })
      .collect();
    std::fs::write(path.with_extension("txt"), records.join("\n"))
  }
}

pub enum DrawWrapper {
  Draw(Box<Draw>),
  Record(Record),
}

impl DrawWrapper {
  fn save_result(
    &self,
    path: &Path,
    frame: &RgbFrame,
    report: &FrameReport,
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      DrawWrapper::Draw(draw) => {
        draw.draw_detection(frame, &report.detections).save(path)?;
      }
      DrawWrapper::Record(record) => {
        frame.to_rgb_image().save(path)?;
        record.record(report, path)?;
      }
    };

    let writer = BufWriter::new(File::create(path.with_extension("json"))?);
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
  }

  fn with(kind: &str) -> Self {
    match kind {
      "record-name" => DrawWrapper::Record(Record {
        label_with_name: true,
        catalog: None,
      }),
      "record-id" => DrawWrapper::Record(Record {
        label_with_name: false,
        catalog: None,
      }),
      _ => DrawWrapper::Draw(Box::default()),
    }
  }
}

pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: DrawWrapper,
  frame_counter: Mutex<u16>,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let kind = match uri.query_pairs().find(|(k, _)| k == "record") {
      Some((_, v)) if v == "id" => "record-id",
      Some(_) => "record-name",
      None => "draw",
    };
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(url_local_path(uri)),
      draw: DrawWrapper::with(kind),
      frame_counter: Mutex::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  /// 画框模式下替换画框方式；记录模式下只取其中的营养数据表用于名称
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = match self.draw {
      DrawWrapper::Draw(_) => DrawWrapper::Draw(Box::new(draw)),
      DrawWrapper::Record(record) => DrawWrapper::Record(Record {
        catalog: draw.catalog().cloned(),
        ..record
      }),
    };
    self
  }

  fn frame_id(&self) -> u16 {
    let mut counter = self
      .frame_counter
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    *counter = counter.wrapping_add(1);
    *counter
  }

  fn frame_path(&self, now: DateTime<Utc>) -> Result<PathBuf, std::io::Error> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbFrame, report: &FrameReport) -> Result<(), Self::Error> {
    if !self.always && report.detections.is_empty() {
      return Ok(());
    }
    let path = self.frame_path(report.timestamp)?;
    debug!("记录第 {} 帧到 {}", report.frame_index, path.display());
    self.draw.save_result(&path, frame, report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    aggregate::{AggregationPolicy, FrameAggregator},
    model::{DetectItem, DetectResult},
  };

  fn catalog() -> Arc<NutritionCatalog> {
    Arc::new(NutritionCatalog::from_json_str(r#"[{ "name": "Bún chả" }, { "name": "Xôi" }]"#).unwrap())
  }

  fn report(items: Vec<DetectItem>) -> FrameReport {
    FrameAggregator::new(catalog(), AggregationPolicy::FrameLocal).push_frame(DetectResult::new(items))
  }

  fn files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
      let path = entry.unwrap().path();
      if path.is_dir() {
        out.extend(files(&path));
      } else {
        out.push(path);
      }
    }
    out.sort();
    out
  }

  #[test]
  fn empty_frames_are_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    output
      .render_result(&RgbFrame::with_shape(4, 4), &report(vec![]))
      .unwrap();
    assert!(files(dir.path()).is_empty());

    let url = url::Url::parse(&format!("folder://{}?always", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    output
      .render_result(&RgbFrame::with_shape(4, 4), &report(vec![]))
      .unwrap();
    let written = files(dir.path());
    assert_eq!(written.len(), 2);
    assert!(written.iter().any(|p| p.extension().unwrap() == "json"));
    assert!(written.iter().any(|p| p.extension().unwrap() == "png"));
  }

  #[test]
  fn record_mode_writes_names_from_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}?record=name", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url)
      .unwrap()
      .with_draw(Draw::new(catalog()));

    let item = DetectItem {
      class_id: 1,
      score: 0.5,
      bbox: [1.0, 2.0, 3.0, 4.0],
    };
    output
      .render_result(&RgbFrame::with_shape(8, 8), &report(vec![item]))
      .unwrap();

    let txt = files(dir.path())
      .into_iter()
      .find(|p| p.extension().unwrap() == "txt")
      .unwrap();
    assert_eq!(
      std::fs::read_to_string(txt).unwrap(),
      "Xôi, 0.5000, 1.0, 2.0, 3.0, 4.0"
    );
  }
}

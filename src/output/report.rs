// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/output/report.rs - 营养报告输出
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

//! # 营养报告
//!
//! - `report:stdout`：文本报告写到标准输出
//! - `report:///path/to/report.jsonl`：每帧一行 JSON 写到文件
//!
//! `format=text|json` 可覆盖默认格式。

use std::{
  fs::File,
  io::{self, BufWriter, Write},
  path::Path,
  sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  aggregate::{AggregationPolicy, FrameReport},
  frame::RgbFrame,
  output::Render,
  url_local_path,
};

#[derive(Error, Debug)]
pub enum ReportOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("未知的报告格式: {0}")]
  UnknownFormat(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
  Text,
  Json,
}

impl std::str::FromStr for ReportFormat {
  type Err = ReportOutputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "text" => Ok(ReportFormat::Text),
      "json" => Ok(ReportFormat::Json),
      other => Err(ReportOutputError::UnknownFormat(other.to_string())),
    }
  }
}

pub struct ReportOutput {
  writer: Mutex<Box<dyn Write + Send>>,
  format: ReportFormat,
}

impl FromUrlWithScheme for ReportOutput {
  const SCHEME: &'static str = "report";
}

impl FromUrl for ReportOutput {
  type Error = ReportOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReportOutputError::SchemeMismatch);
    }

    let format = url
      .query_pairs()
      .find(|(k, _)| k == "format")
      .map(|(_, v)| v.parse::<ReportFormat>())
      .transpose()?;

    match url.path() {
      "stdout" | "-" => Ok(Self::new(
        io::stdout(),
        format.unwrap_or(ReportFormat::Text),
      )),
      "stderr" => Ok(Self::new(
        io::stderr(),
        format.unwrap_or(ReportFormat::Text),
      )),
      _ => {
        let path = url_local_path(url);
        if let Some(parent) = Path::new(&path).parent()
          && !parent.as_os_str().is_empty()
        {
          std::fs::create_dir_all(parent)?;
        }
        debug!("营养报告写入文件: {}", path);
        Ok(Self::new(
          BufWriter::new(File::create(&path)?),
          format.unwrap_or(ReportFormat::Json),
        ))
      }
    }
  }
}

impl ReportOutput {
  pub fn new(writer: impl Write + Send + 'static, format: ReportFormat) -> Self {
    Self {
      writer: Mutex::new(Box::new(writer)),
      format,
    }
  }

  pub fn format(&self) -> ReportFormat {
    self.format
  }
}

impl Render for ReportOutput {
  type Error = ReportOutputError;

  fn render_result(&self, _frame: &RgbFrame, report: &FrameReport) -> Result<(), Self::Error> {
    let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
    match self.format {
      ReportFormat::Text => writeln!(writer, "{}", format_report(report))?,
      ReportFormat::Json => {
        serde_json::to_writer(&mut *writer, report)?;
        writeln!(writer)?;
      }
    }
    writer.flush()?;
    Ok(())
  }
}

fn amount(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

/// 面向用户的文本报告
pub fn format_report(report: &FrameReport) -> String {
  let scope = match report.policy {
    AggregationPolicy::FrameLocal => "本帧",
    AggregationPolicy::Cumulative => "累计",
  };
  let mut lines = vec![format!(
    "== 第 {} 帧 | {} | {} ==",
    report.frame_index + 1,
    scope,
    report.timestamp.format("%Y-%m-%d %H:%M:%S")
  )];

  let summary = &report.summary;
  for fact in summary.facts() {
    let food = &fact.food;
    lines.push(format!(
      "- {}（{}）置信度 {}%",
      food.name, food.serving_description, fact.confidence_percent
    ));
    lines.push(format!(
      "  热量 {} kcal | 脂肪 {} g | 糖 {} g | 盐 {} g | 饱和脂肪 {} g",
      amount(food.calories()),
      amount(food.fat()),
      amount(food.sugar()),
      amount(food.salt()),
      amount(food.saturates()),
    ));
  }

  if summary.any_resolved() {
    lines.push(format!(
      "合计：约 {} kcal，脂肪 {} g",
      amount(summary.total_calories()),
      amount(summary.total_fat())
    ));
  } else {
    lines.push("未识别到营养数据表中的菜品".to_string());
  }

  if report.unresolved > 0 {
    lines.push(format!("另有 {} 个检测不在营养数据表中", report.unresolved));
  }

  lines.join("\n")
}

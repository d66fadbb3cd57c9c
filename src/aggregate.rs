// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/aggregate.rs - 检测结果到营养汇总
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

//! # 营养汇总
//!
//! 将一帧的检测结果按营养数据表解析为可展示的条目，并累加热量与脂肪。
//!
//! - 类别编号不在数据表中的检测被跳过，不影响汇总；
//! - 条目顺序与检测顺序一致，同一菜品出现两次就计两次；
//! - 置信度百分比按四舍五入（0.5 远离零）取整，如 0.873 → 87，0.875 → 88。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::{
  catalog::{FoodClass, NutritionCatalog},
  model::DetectResult,
};

/// 将置信度转换为整数百分比
pub fn confidence_percent(score: f32) -> u8 {
  // 先对齐到 0.01% 的十进制网格，消除 f32 表示误差
  let percent = ((score as f64) * 1e4).round() / 100.0;
  percent.round().clamp(0.0, 100.0) as u8
}

/// 一条已解析的检测
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutritionFact {
  pub food: Arc<FoodClass>,
  pub confidence_percent: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NutritionSummary {
  facts: Vec<NutritionFact>,
  total_calories: f64,
  total_fat: f64,
}

impl NutritionSummary {
  pub fn facts(&self) -> &[NutritionFact] {
    &self.facts
  }

  pub fn total_calories(&self) -> f64 {
    self.total_calories
  }

  pub fn total_fat(&self) -> f64 {
    self.total_fat
  }

  /// 至少有一条检测在数据表中找到
  pub fn any_resolved(&self) -> bool {
    !self.facts.is_empty()
  }

  pub fn clear(&mut self) {
    self.facts.clear();
    self.total_calories = 0.0;
    self.total_fat = 0.0;
  }

  fn push(&mut self, food: &Arc<FoodClass>, score: f32) {
    self.total_calories += food.calories();
    self.total_fat += food.fat();
    self.facts.push(NutritionFact {
      food: Arc::clone(food),
      confidence_percent: confidence_percent(score),
    });
  }
}

/// 将一帧检测结果累加进 `summary`，返回本帧（仅本次调用）的汇总
///
/// 不在数据表中的检测被忽略；返回值中同时给出被忽略的数量。
pub fn aggregate(
  detections: &DetectResult,
  catalog: &NutritionCatalog,
  summary: &mut NutritionSummary,
) -> (NutritionSummary, usize) {
  let mut frame = NutritionSummary::default();
  let mut unresolved = 0usize;

  for item in detections {
    match catalog.lookup(item.class_id) {
      Some(food) => {
        summary.push(food, item.score);
        frame.push(food, item.score);
      }
      None => {
        debug!("类别 {} 不在营养数据表中，跳过", item.class_id);
        unresolved += 1;
      }
    }
  }

  (frame, unresolved)
}

/// 多帧会话中汇总的保留方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
  /// 每帧重新计算，只展示当前帧
  #[default]
  FrameLocal,
  /// 在整个会话内累加
  Cumulative,
}

/// 每处理一帧产生的可渲染结果
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
  pub frame_index: u64,
  pub timestamp: DateTime<Utc>,
  pub policy: AggregationPolicy,
  /// 检测器原始输出，包括不在数据表中的类别
  pub detections: DetectResult,
  /// 按策略选定的汇总：当前帧或整个会话
  pub summary: NutritionSummary,
  pub unresolved: usize,
}

/// 会话级别的汇总器，独占其汇总状态
pub struct FrameAggregator {
  catalog: Arc<NutritionCatalog>,
  policy: AggregationPolicy,
  summary: NutritionSummary,
  frames: u64,
}

impl FrameAggregator {
  pub fn new(catalog: Arc<NutritionCatalog>, policy: AggregationPolicy) -> Self {
    Self {
      catalog,
      policy,
      summary: NutritionSummary::default(),
      frames: 0,
    }
  }

  pub fn policy(&self) -> AggregationPolicy {
    self.policy
  }

  pub fn catalog(&self) -> &Arc<NutritionCatalog> {
    &self.catalog
  }

  /// 当前会话汇总；逐帧策略下即最近一帧
  pub fn summary(&self) -> &NutritionSummary {
    &self.summary
  }

  pub fn frames(&self) -> u64 {
    self.frames
  }

  pub fn push_frame(&mut self, detections: DetectResult) -> FrameReport {
    if self.policy == AggregationPolicy::FrameLocal {
      self.summary.clear();
    }

    let (frame, unresolved) = aggregate(&detections, &self.catalog, &mut self.summary);
    let summary = match self.policy {
      AggregationPolicy::FrameLocal => frame,
      AggregationPolicy::Cumulative => self.summary.clone(),
    };

    let report = FrameReport {
      frame_index: self.frames,
      timestamp: Utc::now(),
      policy: self.policy,
      detections,
      summary,
      unresolved,
    };
    self.frames += 1;
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectItem;
  use approx::assert_relative_eq;

  fn catalog() -> NutritionCatalog {
    let mut entries = Vec::with_capacity(67);
    for i in 0..67 {
      let entry = match i {
        1 => r#"{ "name": "Bánh mì", "serving_type": "1 ổ", "nutrition": { "Calories": 400, "Fat": 12.5 } }"#.to_string(),
        3 => r#"{ "name": "Pho", "serving_type": "1 tô", "nutrition": { "Calories": 350, "Fat": 8 } }"#.to_string(),
        5 => r#"{ "name": "Trà đá" }"#.to_string(),
        _ => format!(r#"{{ "name": "Món {}", "nutrition": {{ "Calories": 100 }} }}"#, i),
      };
      entries.push(entry);
    }
    NutritionCatalog::from_json_str(&format!("[{}]", entries.join(","))).unwrap()
  }

  fn det(class_id: u32, score: f32) -> DetectItem {
    DetectItem {
      class_id,
      score,
      bbox: [0.0, 0.0, 1.0, 1.0],
    }
  }

  fn result(items: &[(u32, f32)]) -> DetectResult {
    DetectResult::new(items.iter().map(|&(c, s)| det(c, s)).collect())
  }

  #[test]
  fn single_known_detection() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let (frame, unresolved) = aggregate(&result(&[(3, 0.92)]), &catalog, &mut summary);

    assert_eq!(unresolved, 0);
    assert_eq!(frame.facts().len(), 1);
    assert_eq!(frame.facts()[0].food.name, "Pho");
    assert_eq!(frame.facts()[0].confidence_percent, 92);
    assert_relative_eq!(frame.total_calories(), 350.0);
    assert_relative_eq!(frame.total_fat(), 8.0);
    assert_eq!(frame, summary);
  }

  #[test]
  fn unknown_class_is_dropped_silently() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let (frame, unresolved) =
      aggregate(&result(&[(3, 0.9), (999, 0.8)]), &catalog, &mut summary);

    assert_eq!(unresolved, 1);
    assert_eq!(frame.facts().len(), 1);
    assert_eq!(frame.facts()[0].food.id, 3);
    assert_relative_eq!(frame.total_calories(), 350.0);
  }

  #[test]
  fn empty_input_leaves_summary_unchanged() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    aggregate(&result(&[(1, 0.5)]), &catalog, &mut summary);
    let before = summary.clone();

    let (frame, unresolved) = aggregate(&DetectResult::default(), &catalog, &mut summary);
    assert_eq!(summary, before);
    assert_eq!(unresolved, 0);
    assert!(!frame.any_resolved());
    assert!(frame.facts().is_empty());
    assert_eq!(frame.total_calories(), 0.0);
    assert_eq!(frame.total_fat(), 0.0);
  }

  #[test]
  fn all_unknown_means_nothing_resolved() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let (frame, unresolved) = aggregate(&result(&[(67, 0.9), (500, 0.9)]), &catalog, &mut summary);
    assert_eq!(unresolved, 2);
    assert!(!frame.any_resolved());
    assert!(!summary.any_resolved());
  }

  #[test]
  fn order_is_preserved_and_duplicates_count_twice() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let (frame, _) = aggregate(
      &result(&[(3, 0.9), (200, 0.9), (1, 0.7), (3, 0.6)]),
      &catalog,
      &mut summary,
    );

    let ids: Vec<u32> = frame.facts().iter().map(|f| f.food.id).collect();
    assert_eq!(ids, vec![3, 1, 3]);
    assert_relative_eq!(frame.total_calories(), 350.0 + 400.0 + 350.0);
    assert_relative_eq!(frame.total_fat(), 8.0 + 12.5 + 8.0);
  }

  #[test]
  fn totals_match_sum_over_facts() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let inputs: Vec<(u32, f32)> = (0..80u32).map(|i| (i * 7 % 90, 0.5)).collect();
    aggregate(&result(&inputs), &catalog, &mut summary);

    let calories: f64 = summary.facts().iter().map(|f| f.food.calories()).sum();
    let fat: f64 = summary.facts().iter().map(|f| f.food.fat()).sum();
    assert_relative_eq!(summary.total_calories(), calories);
    assert_relative_eq!(summary.total_fat(), fat);
    assert_eq!(summary.any_resolved(), !summary.facts().is_empty());
  }

  #[test]
  fn missing_nutrients_count_as_zero() {
    let catalog = catalog();
    let mut summary = NutritionSummary::default();
    let (frame, _) = aggregate(&result(&[(5, 0.99)]), &catalog, &mut summary);
    assert!(frame.any_resolved());
    assert_eq!(frame.total_calories(), 0.0);
    assert_eq!(frame.total_fat(), 0.0);
  }

  #[test]
  fn confidence_rounds_half_away_from_zero() {
    assert_eq!(confidence_percent(0.873), 87);
    assert_eq!(confidence_percent(0.875), 88);
    assert_eq!(confidence_percent(0.265), 27);
    assert_eq!(confidence_percent(0.295), 30);
    assert_eq!(confidence_percent(0.525), 53);
    assert_eq!(confidence_percent(0.585), 59);
    assert_eq!(confidence_percent(0.005), 1);
    assert_eq!(confidence_percent(-0.2), 0);
    assert_eq!(confidence_percent(0.92), 92);
    assert_eq!(confidence_percent(0.004), 0);
    assert_eq!(confidence_percent(1.0), 100);
    assert_eq!(confidence_percent(1.3), 100);
  }

  #[test]
  fn frame_local_policy_resets_every_frame() {
    let mut aggregator = FrameAggregator::new(Arc::new(catalog()), AggregationPolicy::FrameLocal);
    aggregator.push_frame(result(&[(3, 0.9), (1, 0.9)]));
    let report = aggregator.push_frame(result(&[(3, 0.8)]));

    assert_eq!(report.frame_index, 1);
    assert_eq!(report.summary.facts().len(), 1);
    assert_relative_eq!(report.summary.total_calories(), 350.0);
    assert_eq!(aggregator.summary(), &report.summary);
  }

  #[test]
  fn cumulative_policy_carries_totals() {
    let mut aggregator = FrameAggregator::new(Arc::new(catalog()), AggregationPolicy::Cumulative);
    aggregator.push_frame(result(&[(3, 0.9)]));
    aggregator.push_frame(DetectResult::default());
    let report = aggregator.push_frame(result(&[(1, 0.9), (404, 0.9)]));

    assert_eq!(report.unresolved, 1);
    assert_eq!(report.summary.facts().len(), 2);
    assert_relative_eq!(report.summary.total_calories(), 750.0);
    assert_eq!(aggregator.frames(), 3);
  }

  #[test]
  fn report_keeps_raw_detections() {
    let mut aggregator = FrameAggregator::new(Arc::new(catalog()), AggregationPolicy::FrameLocal);
    let report = aggregator.push_frame(result(&[(999, 0.9)]));
    assert_eq!(report.detections.len(), 1);
    assert!(!report.summary.any_resolved());
  }
}

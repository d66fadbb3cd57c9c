// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/output/draw.rs - 检测框与标签绘制
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

use std::{path::Path, sync::Arc};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use thiserror::Error;
use tracing::info;

use crate::{
  aggregate::{FrameReport, confidence_percent},
  catalog::NutritionCatalog,
  frame::RgbFrame,
  model::{DetectItem, DetectResult},
  output::Overlay,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const RESOLVED_COLOR: [u8; 3] = [0, 160, 0]; // 绿色
const UNRESOLVED_COLOR: [u8; 3] = [128, 128, 128]; // 灰色

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体无效: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 检测框绘制
///
/// 没有字体时只画框；有营养数据表时标签显示菜品名称，否则显示类别编号。
#[derive(Clone, Default)]
pub struct Draw {
  font: Option<FontArc>,
  catalog: Option<Arc<NutritionCatalog>>,
}

impl Draw {
  pub fn new(catalog: Arc<NutritionCatalog>) -> Self {
    Self {
      font: None,
      catalog: Some(catalog),
    }
  }

  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  /// 从 TTF/OTF 文件加载标签字体
  pub fn load_font(path: impl AsRef<Path>) -> Result<FontArc, DrawError> {
    let path = path.as_ref();
    let font = FontArc::try_from_vec(std::fs::read(path)?)?;
    info!("已加载标签字体: {}", path.display());
    Ok(font)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn catalog(&self) -> Option<&Arc<NutritionCatalog>> {
    self.catalog.as_ref()
  }

  fn label(&self, item: &DetectItem) -> (String, [u8; 3]) {
    let percent = confidence_percent(item.score);
    match self.catalog.as_ref().and_then(|c| c.lookup(item.class_id)) {
      Some(food) => (format!("{} {}%", food.name, percent), RESOLVED_COLOR),
      None => (format!("#{} {}%", item.class_id, percent), UNRESOLVED_COLOR),
    }
  }

  // bbox 为帧像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32; 4], label: &str, color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..BOX_THICKNESS {
      let (left, top) = ((x_min + t).min(x_max), (y_min + t).min(y_max));
      let (right, bottom) = ((x_max - t).max(x_min), (y_max - t).max(y_min));
      for x in left..=right {
        image.put_pixel(x as u32, top as u32, Rgb(color));
        image.put_pixel(x as u32, bottom as u32, Rgb(color));
      }
      for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, Rgb(color));
        image.put_pixel(right as u32, y as u32, Rgb(color));
      }
    }

    let Some(font) = &self.font else {
      return;
    };

    let scale = PxScale::from(LABEL_FONT_SIZE);
    let (text_width, text_height) = text_size(scale, font, label);
    let label_height = text_height as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;

    // 标签放在框的上方，放不下时放在框内
    let label_x = x_min;
    let label_y = if y_min >= label_height {
      y_min - label_height
    } else {
      y_min
    };
    let label_width = (text_width as i32).min(w - label_x);
    if label_width <= 0 {
      return;
    }

    let rect = imageproc::rect::Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
    draw_filled_rect_mut(image, rect, Rgb(color));
    draw_text_mut(
      image,
      Rgb([255u8, 255u8, 255u8]),
      label_x,
      label_y + LABEL_TEXT_VERTICAL_PADDING,
      scale,
      font,
      label,
    );
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, detections: &DetectResult) {
    for item in detections {
      let (label, color) = self.label(item);
      self.draw_bbox_with_label(image, &item.bbox, &label, color);
    }
  }

  /// 复制一份帧并画上检测结果
  pub fn draw_detection(&self, frame: &RgbFrame, detections: &DetectResult) -> RgbImage {
    let mut image = frame.to_rgb_image();
    self.draw_detections_on_image(&mut image, detections);
    image
  }
}

impl Overlay for Draw {
  fn overlay(&self, frame: RgbFrame, report: &FrameReport) -> RgbFrame {
    RgbFrame::from(self.draw_detection(&frame, &report.detections))
  }
}

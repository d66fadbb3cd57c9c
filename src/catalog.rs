// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/catalog.rs - 营养数据表
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

//! # 营养数据表
//!
//! 类别编号到菜品信息的静态映射，进程启动时加载一次，之后只读。
//!
//! 数据文件为 JSON 数组，数组下标即类别编号：
//!
//! ```json
//! [
//!   { "name": "Bánh mì", "serving_type": "1 ổ (150g)",
//!     "nutrition": { "Calories": 400, "Fat": 12, "Sugar": 5, "Salt": 1.6, "Saturates": 3 } },
//!   { "id": 1, "name": "Phở bò", "serving_type": "1 tô (500g)",
//!     "nutrition": { "Calories": 350, "Fat": 8 } }
//! ]
//! ```
//!
//! `id` 字段可省略；若给出则必须与下标一致。缺失的营养素按 0 读取。

use std::{collections::BTreeMap, fs::File, io::BufReader, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CALORIES: &str = "Calories";
pub const FAT: &str = "Fat";
pub const SUGAR: &str = "Sugar";
pub const SALT: &str = "Salt";
pub const SATURATES: &str = "Saturates";

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("营养数据文件读取失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("营养数据格式错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("第 {index} 项的编号为 {id}，编号必须从 0 开始连续")]
  NonContiguousId { index: usize, id: u32 },
  #[error("菜品 '{name}' 的营养素 '{nutrient}' 为负数: {value}")]
  NegativeNutrient {
    name: String,
    nutrient: String,
    value: f64,
  },
}

#[derive(Debug, Deserialize)]
struct FoodEntry {
  id: Option<u32>,
  name: String,
  #[serde(default)]
  serving_type: String,
  #[serde(default)]
  nutrition: BTreeMap<String, f64>,
}

/// 一种可识别的菜品
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FoodClass {
  pub id: u32,
  pub name: String,
  pub serving_description: String,
  pub nutrition: BTreeMap<String, f64>,
}

impl FoodClass {
  /// 读取营养素数值，缺失时为 0
  pub fn nutrient(&self, key: &str) -> f64 {
    self.nutrition.get(key).copied().unwrap_or(0.0)
  }

  pub fn calories(&self) -> f64 {
    self.nutrient(CALORIES)
  }

  pub fn fat(&self) -> f64 {
    self.nutrient(FAT)
  }

  pub fn sugar(&self) -> f64 {
    self.nutrient(SUGAR)
  }

  pub fn salt(&self) -> f64 {
    self.nutrient(SALT)
  }

  pub fn saturates(&self) -> f64 {
    self.nutrient(SATURATES)
  }
}

/// 营养数据表，可在多个会话间共享只读访问
#[derive(Debug, Clone, Default)]
pub struct NutritionCatalog {
  classes: Box<[Arc<FoodClass>]>,
}

impl NutritionCatalog {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
    let path = path.as_ref();
    info!("加载营养数据: {}", path.display());
    let reader = BufReader::new(File::open(path)?);
    let entries: Vec<FoodEntry> = serde_json::from_reader(reader)?;
    let catalog = Self::from_entries(entries)?;
    info!("营养数据加载完成，共 {} 种菜品", catalog.len());
    Ok(catalog)
  }

  pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
    let entries: Vec<FoodEntry> = serde_json::from_str(json)?;
    Self::from_entries(entries)
  }

  fn from_entries(entries: Vec<FoodEntry>) -> Result<Self, CatalogError> {
    let mut classes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
      if let Some(id) = entry.id
        && id as usize != index
      {
        return Err(CatalogError::NonContiguousId { index, id });
      }

      if let Some((nutrient, value)) = entry.nutrition.iter().find(|(_, v)| **v < 0.0) {
        return Err(CatalogError::NegativeNutrient {
          name: entry.name.clone(),
          nutrient: nutrient.clone(),
          value: *value,
        });
      }

      debug!("菜品 {}: {}", index, entry.name);
      classes.push(Arc::new(FoodClass {
        id: index as u32,
        name: entry.name,
        serving_description: entry.serving_type,
        nutrition: entry.nutrition,
      }));
    }

    Ok(Self {
      classes: classes.into_boxed_slice(),
    })
  }

  /// 按类别编号查找；编号超出范围时返回 `None`，这不是错误
  pub fn lookup(&self, class_id: u32) -> Option<&Arc<FoodClass>> {
    self.classes.get(class_id as usize)
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<FoodClass>> {
    self.classes.iter()
  }
}

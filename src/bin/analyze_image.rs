// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/bin/analyze_image.rs - 图片识别
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

use anyhow::{Result, anyhow};
use clap::Parser;
use url::Url;

use foodlens::{
  FromUrl,
  config::{CommonArgs, SessionConfig, bootstrap},
  input::ImageFileInput,
  output::Render,
  session::Session,
};
use tracing::info;

/// 识别一张菜品图片并估算营养
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 输入图片，例如 image:///photos/meal.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.common.model);
  info!("营养数据: {}", args.common.catalog.display());
  info!("输入图片: {}", args.input);

  let runtime = bootstrap(&args.common)?;
  let outputs = runtime.outputs(&args.common)?;

  let mut input = ImageFileInput::from_url(&args.input)?;
  let frame = input.take_frame().ok_or_else(|| anyhow!("没有输入帧"))?;

  let config = SessionConfig::default().with_confidence(runtime.confidence);
  let mut session = Session::new(runtime.detector, runtime.catalog, config);
  let report = session.analyze_image(&frame)?;
  outputs.render_result(&frame, &report)?;

  info!("完成，会话状态: {:?}", session.state());
  Ok(())
}

// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/bin/live_camera.rs - 摄像头实时识别
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use foodlens::{
  FromUrl,
  aggregate::AggregationPolicy,
  config::{CommonArgs, SessionConfig, bootstrap},
  input::GStreamerLiveTransport,
  output::Render,
  session::LiveCameraSession,
};
use tracing::{info, warn};

/// 打开摄像头，实时显示检测框并输出营养汇总
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub common: CommonArgs,

  /// 摄像头，例如 gst://camera/dev/video0?width=640&height=480&fps=15
  #[arg(long, value_name = "CAMERA", default_value = "gst://camera/dev/video0")]
  pub camera: Url,

  /// 在整个会话内累加营养汇总，默认每帧重新计算
  #[arg(long)]
  pub cumulative: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.common.model);
  info!("营养数据: {}", args.common.catalog.display());
  info!("摄像头: {}", args.camera);

  let runtime = bootstrap(&args.common)?;
  let outputs = runtime.outputs(&args.common)?;

  #[cfg(feature = "save_image_file")]
  let overlay = runtime.draw(&args.common)?;
  #[cfg(not(feature = "save_image_file"))]
  let overlay = foodlens::output::PassThrough;

  let policy = if args.cumulative {
    AggregationPolicy::Cumulative
  } else {
    AggregationPolicy::FrameLocal
  };
  let config = SessionConfig::default()
    .with_confidence(runtime.confidence)
    .with_policy(policy);

  let mut transport = GStreamerLiveTransport::from_url(&args.camera)?;
  let mut session = LiveCameraSession::new(runtime.detector, runtime.catalog, config, overlay);
  session.stop_handle().stop_on_ctrlc()?;
  session.attach(&mut transport)?;

  let outcome = transport.run_until(|| {
    while let Some(live) = session.try_recv() {
      if let Err(e) = outputs.render_result(&live.frame, &live.report) {
        warn!("输出第 {} 帧失败: {}", live.report.frame_index, e);
      }
    }
    session.stop_requested()
  });
  transport.stop();

  let state = session.finish(outcome)?;
  info!("任务完成，会话状态: {:?}", state);

  Ok(())
}

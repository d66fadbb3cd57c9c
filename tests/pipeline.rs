// 该文件是 FoodLens （食鉴） 项目的一部分。
// tests/pipeline.rs - 端到端流程测试
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

use std::{
  convert::Infallible,
  path::{Path, PathBuf},
  sync::Mutex,
};

use approx::assert_relative_eq;
use url::Url;

use foodlens::{
  aggregate::{AggregationPolicy, FrameReport},
  config::{CommonArgs, SessionConfig, StartupError, bootstrap},
  frame::RgbFrame,
  input::{FrameSource, SourceKind},
  output::Render,
  session::{Session, SessionState},
};

fn data(name: &str) -> PathBuf {
  Path::new(env!("CARGO_MANIFEST_DIR")).join("data").join(name)
}

fn url(scheme: &str, path: &Path) -> Url {
  let file = Url::from_file_path(path).unwrap();
  Url::parse(&format!("{}:{}", scheme, &file.as_str()["file:".len()..])).unwrap()
}

fn args(output: Vec<Url>) -> CommonArgs {
  CommonArgs {
    model: url("replay", &data("detections.sample.jsonl")),
    catalog: data("nutrition.sample.json"),
    confidence: 40,
    output,
    font: None,
  }
}

/// 产生固定数量空白帧的视频来源
struct BlankVideo(usize);

impl FrameSource for BlankVideo {
  type Error = Infallible;

  fn kind(&self) -> SourceKind {
    SourceKind::VideoFile
  }

  fn next_frame(&mut self) -> Option<Result<RgbFrame, Infallible>> {
    if self.0 == 0 {
      return None;
    }
    self.0 -= 1;
    Some(Ok(RgbFrame::with_shape(480, 640)))
  }
}

#[derive(Default)]
struct Collect(Mutex<Vec<FrameReport>>);

impl Render for Collect {
  type Error = Infallible;

  fn render_result(&self, _frame: &RgbFrame, report: &FrameReport) -> Result<(), Infallible> {
    self.0.lock().unwrap().push(report.clone());
    Ok(())
  }
}

fn run(policy: AggregationPolicy) -> (SessionState, Vec<FrameReport>) {
  let runtime = bootstrap(&args(vec![])).unwrap();
  let config = SessionConfig::default()
    .with_confidence(runtime.confidence)
    .with_policy(policy);
  let mut session = Session::new(runtime.detector, runtime.catalog, config);
  let output = Collect::default();
  let state = session.run(BlankVideo(4), &output).unwrap();
  (state, output.0.into_inner().unwrap())
}

#[test]
fn sample_catalog_loads() {
  let runtime = bootstrap(&args(vec![])).unwrap();
  assert_eq!(runtime.catalog.len(), 7);
  let tra_da = runtime.catalog.lookup(6).unwrap();
  assert_eq!(tra_da.name, "Trà đá");
  assert_relative_eq!(tra_da.calories(), 0.0);
  assert!(runtime.catalog.lookup(7).is_none());
}

#[test]
fn frame_local_video_session_reports_each_frame_alone() {
  let (state, reports) = run(AggregationPolicy::FrameLocal);
  assert_eq!(state, SessionState::Exhausted);
  assert_eq!(reports.len(), 4);

  let names: Vec<&str> = reports[0]
    .summary
    .facts()
    .iter()
    .map(|f| f.food.name.as_str())
    .collect();
  assert_eq!(names, vec!["Phở bò", "Bánh mì"]);
  assert_eq!(reports[0].summary.facts()[0].confidence_percent, 92);
  assert_relative_eq!(reports[0].summary.total_calories(), 750.0);
  assert_relative_eq!(reports[0].summary.total_fat(), 20.5);

  assert!(!reports[1].summary.any_resolved());

  assert_relative_eq!(reports[2].summary.total_calories(), 350.0);
  assert_eq!(reports[2].unresolved, 1);
  assert_eq!(reports[2].detections.len(), 2);

  // 置信度 0.35 低于阈值 40%
  assert!(reports[3].detections.is_empty());
}

#[test]
fn cumulative_video_session_accumulates() {
  let (_, reports) = run(AggregationPolicy::Cumulative);
  let totals: Vec<f64> = reports.iter().map(|r| r.summary.total_calories()).collect();
  assert_eq!(totals, vec![750.0, 750.0, 1100.0, 1100.0]);
  assert_eq!(reports[3].summary.facts().len(), 3);
}

#[test]
fn missing_model_file_fails_at_startup() {
  let mut args = args(vec![]);
  args.model = Url::parse("replay:///nonexistent/detections.jsonl").unwrap();
  assert!(matches!(bootstrap(&args), Err(StartupError::ModelError(_))));
}

#[test]
fn unknown_output_fails_at_startup() {
  let args = args(vec![Url::parse("webrtc://localhost").unwrap()]);
  let runtime = bootstrap(&args).unwrap();
  assert!(matches!(
    runtime.outputs(&args),
    Err(StartupError::OutputError(_))
  ));
}

#[cfg(feature = "read_image_file")]
#[test]
fn image_session_writes_json_report() {
  use foodlens::{FromUrl, input::ImageFileInput};

  let dir = tempfile::tempdir().unwrap();
  let image_path = dir.path().join("bữa trưa.png");
  image::RgbImage::from_pixel(64, 48, image::Rgb([200, 180, 120]))
    .save(&image_path)
    .unwrap();
  let report_path = dir.path().join("report.jsonl");

  let args = args(vec![url("report", &report_path)]);
  let runtime = bootstrap(&args).unwrap();
  let outputs = runtime.outputs(&args).unwrap();

  let mut input = ImageFileInput::from_url(&url("image", &image_path)).unwrap();
  let frame = input.take_frame().unwrap();
  assert_eq!((frame.width(), frame.height()), (64, 48));

  let config = SessionConfig::default().with_confidence(runtime.confidence);
  let mut session = Session::new(runtime.detector, runtime.catalog, config);
  let report = session.analyze_image(&frame).unwrap();
  outputs.render_result(&frame, &report).unwrap();
  drop(outputs);

  assert_eq!(session.state(), SessionState::Stopped);
  let content = std::fs::read_to_string(&report_path).unwrap();
  let json: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
  assert_eq!(json["summary"]["total_calories"], 750.0);
  assert_eq!(json["summary"]["facts"][1]["food"]["serving_description"], "1 ổ (150g)");
}

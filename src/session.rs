// 该文件是 FoodLens （食鉴） 项目的一部分。
// src/session.rs - 识别会话
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

//! # 识别会话
//!
//! 状态：`Idle → Running → {Stopped, Exhausted, Failed}`。
//!
//! - 图片：检测一次后进入 `Stopped`
//! - 视频文件：读到末尾为 `Exhausted`，读取出错为 `Failed`
//! - 网络摄像头（以及拉取式本地摄像头）：没有帧即 `Failed`，并给出连接错误
//! - 推送式摄像头：会话只注册回调，由传输层驱动
//!
//! 停止请求在帧与帧之间检查；来源在任何终止状态下只释放一次。

use std::{
  error::Error,
  sync::{
    Arc, Mutex, PoisonError,
    mpsc::{self, Receiver, Sender, SyncSender, TrySendError},
  },
  thread,
  time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  aggregate::{FrameAggregator, FrameReport, NutritionSummary},
  catalog::NutritionCatalog,
  config::{Confidence, SessionConfig},
  frame::RgbFrame,
  input::{FrameCallback, FrameSource, PushTransport, SourceKind},
  model::Detector,
  output::{Overlay, Render},
};

/// 推送式会话报告通道的容量
pub const LIVE_REPORT_CAPACITY: usize = 8;

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
  Idle,
  Running,
  /// 用户停止或达到帧数上限
  Stopped,
  /// 视频文件读完
  Exhausted,
  Failed,
}

impl SessionState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SessionState::Stopped | SessionState::Exhausted | SessionState::Failed
    )
  }
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("会话处于 {0:?} 状态，无法开始")]
  InvalidTransition(SessionState),
  #[error("检测失败: {0}")]
  Detector(#[source] BoxError),
  #[error("读取帧失败: {0}")]
  Source(#[source] BoxError),
  #[error("无法连接{kind}: {reason}")]
  Connectivity { kind: SourceKind, reason: String },
  #[error("输出失败: {0}")]
  Render(#[source] BoxError),
}

/// 可克隆的停止请求句柄
#[derive(Clone)]
pub struct StopHandle(Sender<()>);

impl StopHandle {
  pub fn stop(&self) {
    let _ = self.0.send(());
  }

  /// 收到 Ctrl-C 时请求停止；30 秒内未退出则强制结束进程
  pub fn stop_on_ctrlc(self) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      self.stop();
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
  }
}

struct StopSignal {
  tx: Sender<()>,
  rx: Receiver<()>,
}

impl StopSignal {
  fn new() -> Self {
    let (tx, rx) = mpsc::channel();
    Self { tx, rx }
  }

  fn handle(&self) -> StopHandle {
    StopHandle(self.tx.clone())
  }

  fn requested(&self) -> bool {
    self.rx.try_recv().is_ok()
  }
}

/// 图片、视频文件与网络摄像头的顺序会话
pub struct Session<D> {
  detector: D,
  aggregator: FrameAggregator,
  confidence: Confidence,
  max_frames: Option<usize>,
  state: SessionState,
  stop: StopSignal,
}

impl<D: Detector> Session<D> {
  pub fn new(detector: D, catalog: Arc<NutritionCatalog>, config: SessionConfig) -> Self {
    Self {
      detector,
      aggregator: FrameAggregator::new(catalog, config.policy),
      confidence: config.confidence,
      max_frames: config.max_frames,
      state: SessionState::Idle,
      stop: StopSignal::new(),
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  /// 当前汇总；逐帧策略下为最近一帧
  pub fn summary(&self) -> &NutritionSummary {
    self.aggregator.summary()
  }

  pub fn frames(&self) -> u64 {
    self.aggregator.frames()
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.handle()
  }

  fn begin(&mut self) -> Result<(), SessionError> {
    if self.state != SessionState::Idle {
      warn!("会话已处于 {:?} 状态", self.state);
      return Err(SessionError::InvalidTransition(self.state));
    }
    self.state = SessionState::Running;
    Ok(())
  }

  fn process(&mut self, frame: &RgbFrame) -> Result<FrameReport, SessionError> {
    let now = Instant::now();
    let detections = self
      .detector
      .detect(frame, self.confidence)
      .map_err(|e| SessionError::Detector(Box::new(e)))?;
    let report = self.aggregator.push_frame(detections);
    debug!(
      "第 {} 帧: {} 个检测，{} 个已识别，耗时 {:.2?}",
      report.frame_index,
      report.detections.len(),
      report.summary.facts().len(),
      now.elapsed()
    );
    Ok(report)
  }

  /// 分析一张图片，完成后进入 `Stopped`
  pub fn analyze_image(&mut self, frame: &RgbFrame) -> Result<FrameReport, SessionError> {
    self.begin()?;
    info!("开始分析图片 {}x{}", frame.width(), frame.height());
    match self.process(frame) {
      Ok(report) => {
        self.state = SessionState::Stopped;
        Ok(report)
      }
      Err(e) => {
        self.state = SessionState::Failed;
        Err(e)
      }
    }
  }

  /// 从拉取式来源逐帧处理直到停止、读完或失败，返回终止状态
  ///
  /// 来源在返回前释放。
  pub fn run<S, O>(&mut self, mut source: S, output: &O) -> Result<SessionState, SessionError>
  where
    S: FrameSource,
    O: Render,
    O::Error: Error + Send + Sync + 'static,
  {
    if let Err(e) = self.begin() {
      source.release();
      return Err(e);
    }

    let kind = source.kind();
    info!("开始{}会话", kind);
    let result = self.pump(&mut source, output);
    source.release();
    drop(source);

    self.state = match &result {
      Ok(state) => *state,
      Err(_) => SessionState::Failed,
    };
    match &result {
      Ok(state) => info!("会话结束: {:?}，共 {} 帧", state, self.frames()),
      Err(e) => warn!("会话失败: {}，已处理 {} 帧", e, self.frames()),
    }
    result
  }

  fn pump<S, O>(&mut self, source: &mut S, output: &O) -> Result<SessionState, SessionError>
  where
    S: FrameSource,
    O: Render,
    O::Error: Error + Send + Sync + 'static,
  {
    let kind = source.kind();
    let needs_connection = matches!(kind, SourceKind::IpCamera | SourceKind::LiveCamera);
    let mut processed = 0usize;

    loop {
      if self.stop.requested() {
        info!("收到停止请求，结束会话");
        return Ok(SessionState::Stopped);
      }
      if self.max_frames.is_some_and(|max| processed >= max) {
        info!("达到指定帧数 {}，结束会话", processed);
        return Ok(SessionState::Stopped);
      }

      let frame = match source.next_frame() {
        Some(Ok(frame)) => frame,
        None if needs_connection => {
          return Err(SessionError::Connectivity {
            kind,
            reason: "没有收到视频帧".to_string(),
          });
        }
        None => return Ok(SessionState::Exhausted),
        Some(Err(e)) if needs_connection => {
          return Err(SessionError::Connectivity {
            kind,
            reason: e.to_string(),
          });
        }
        Some(Err(e)) => return Err(SessionError::Source(Box::new(e))),
      };

      let report = self.process(&frame)?;
      output
        .render_result(&frame, &report)
        .map_err(|e| SessionError::Render(Box::new(e)))?;
      processed += 1;
    }
  }
}

/// 推送式会话发布的一帧：未叠加检测框的原始帧及其报告
#[derive(Debug, Clone)]
pub struct LiveFrame {
  pub frame: RgbFrame,
  pub report: FrameReport,
}

struct LiveState<D> {
  detector: D,
  aggregator: FrameAggregator,
}

/// 推送式摄像头会话
///
/// 传输层线程调用回调：检测、汇总、叠加检测框后返回该帧；
/// 报告通过有界通道发布，通道满时丢弃而不阻塞。
pub struct LiveCameraSession<D, V> {
  inner: Arc<Mutex<LiveState<D>>>,
  overlay: Arc<V>,
  confidence: Confidence,
  reports_tx: SyncSender<LiveFrame>,
  reports_rx: Receiver<LiveFrame>,
  state: SessionState,
  stop: StopSignal,
}

impl<D, V> LiveCameraSession<D, V>
where
  D: Detector + Send + 'static,
  V: Overlay + Send + Sync + 'static,
{
  pub fn new(detector: D, catalog: Arc<NutritionCatalog>, config: SessionConfig, overlay: V) -> Self {
    let (reports_tx, reports_rx) = mpsc::sync_channel(LIVE_REPORT_CAPACITY);
    Self {
      inner: Arc::new(Mutex::new(LiveState {
        detector,
        aggregator: FrameAggregator::new(catalog, config.policy),
      })),
      overlay: Arc::new(overlay),
      confidence: config.confidence,
      reports_tx,
      reports_rx,
      state: SessionState::Idle,
      stop: StopSignal::new(),
    }
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.handle()
  }

  pub fn stop_requested(&self) -> bool {
    self.stop.requested()
  }

  /// 当前汇总的副本
  pub fn summary(&self) -> NutritionSummary {
    let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    state.aggregator.summary().clone()
  }

  /// 每帧处理函数
  ///
  /// 检测失败时记录日志并原样返回该帧。
  pub fn callback(&self) -> FrameCallback {
    let inner = Arc::clone(&self.inner);
    let overlay = Arc::clone(&self.overlay);
    let reports = self.reports_tx.clone();
    let confidence = self.confidence;

    Arc::new(move |frame: RgbFrame| {
      let report = {
        let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match state.detector.detect(&frame, confidence) {
          Ok(detections) => state.aggregator.push_frame(detections),
          Err(e) => {
            warn!("实时检测失败: {}", e);
            return frame;
          }
        }
      };

      let shown = overlay.overlay(frame.clone(), &report);
      if let Err(TrySendError::Full(dropped)) = reports.try_send(LiveFrame { frame, report }) {
        debug!("报告通道已满，丢弃第 {} 帧报告", dropped.report.frame_index);
      }
      shown
    })
  }

  /// 把回调注册到推送式传输，进入 `Running`
  pub fn attach<T>(&mut self, transport: &mut T) -> Result<(), SessionError>
  where
    T: PushTransport,
    T::Error: Error + Send + Sync + 'static,
  {
    if self.state != SessionState::Idle {
      return Err(SessionError::InvalidTransition(self.state));
    }
    self.state = SessionState::Running;
    if let Err(e) = transport.register(self.callback()) {
      self.state = SessionState::Failed;
      return Err(SessionError::Connectivity {
        kind: SourceKind::LiveCamera,
        reason: e.to_string(),
      });
    }
    info!("实时会话已开始");
    Ok(())
  }

  pub fn try_recv(&self) -> Option<LiveFrame> {
    self.reports_rx.try_recv().ok()
  }

  /// 传输结束后调用：正常结束为 `Stopped`，出错为 `Failed`
  pub fn finish<E>(&mut self, outcome: Result<(), E>) -> Result<SessionState, SessionError>
  where
    E: Error + Send + Sync + 'static,
  {
    match outcome {
      Ok(()) => {
        self.state = SessionState::Stopped;
        info!("实时会话结束");
        Ok(self.state)
      }
      Err(e) => {
        self.state = SessionState::Failed;
        Err(SessionError::Source(Box::new(e)))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
  };

  use super::*;
  use crate::{
    aggregate::AggregationPolicy,
    model::{DetectItem, DetectResult},
    output::PassThrough,
  };
  use approx::assert_relative_eq;

  #[derive(Error, Debug)]
  #[error("mock failure: {0}")]
  struct MockError(&'static str);

  fn catalog() -> Arc<NutritionCatalog> {
    Arc::new(
      NutritionCatalog::from_json_str(
        r#"[
          { "name": "Bánh mì", "nutrition": { "Calories": 400, "Fat": 12.5 } },
          { "name": "Phở", "nutrition": { "Calories": 350, "Fat": 8 } }
        ]"#,
      )
      .unwrap(),
    )
  }

  fn detections(ids: &[u32]) -> DetectResult {
    DetectResult::new(
      ids
        .iter()
        .map(|&class_id| DetectItem {
          class_id,
          score: 0.9,
          bbox: [0.0, 0.0, 1.0, 1.0],
        })
        .collect(),
    )
  }

  /// 按顺序返回预设结果，用完后返回空结果
  struct ScriptedDetector(Mutex<VecDeque<Result<DetectResult, MockError>>>);

  impl ScriptedDetector {
    fn new(script: Vec<Result<DetectResult, MockError>>) -> Self {
      Self(Mutex::new(script.into()))
    }
  }

  impl Detector for ScriptedDetector {
    type Error = MockError;

    fn detect(&self, _frame: &RgbFrame, _confidence: Confidence) -> Result<DetectResult, MockError> {
      self.0.lock().unwrap().pop_front().unwrap_or_else(|| Ok(DetectResult::default()))
    }
  }

  struct MockSource {
    kind: SourceKind,
    frames: VecDeque<Option<Result<RgbFrame, MockError>>>,
    released: Arc<AtomicUsize>,
  }

  impl MockSource {
    fn new(kind: SourceKind, frames: Vec<Option<Result<RgbFrame, MockError>>>) -> (Self, Arc<AtomicUsize>) {
      let released = Arc::new(AtomicUsize::new(0));
      (
        Self {
          kind,
          frames: frames.into(),
          released: Arc::clone(&released),
        },
        released,
      )
    }

    fn frames(kind: SourceKind, n: usize) -> (Self, Arc<AtomicUsize>) {
      Self::new(kind, (0..n).map(|_| Some(Ok(RgbFrame::with_shape(2, 2)))).collect())
    }
  }

  impl FrameSource for MockSource {
    type Error = MockError;

    fn kind(&self) -> SourceKind {
      self.kind
    }

    fn next_frame(&mut self) -> Option<Result<RgbFrame, MockError>> {
      self.frames.pop_front().flatten()
    }

    fn release(&mut self) {
      self.released.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[derive(Default)]
  struct Collect(Mutex<Vec<FrameReport>>);

  impl Render for Collect {
    type Error = MockError;

    fn render_result(&self, _frame: &RgbFrame, report: &FrameReport) -> Result<(), MockError> {
      self.0.lock().unwrap().push(report.clone());
      Ok(())
    }
  }

  fn session(script: Vec<Result<DetectResult, MockError>>, config: SessionConfig) -> Session<ScriptedDetector> {
    Session::new(ScriptedDetector::new(script), catalog(), config)
  }

  #[test]
  fn image_session_stops_after_one_detection() {
    let mut s = session(vec![Ok(detections(&[0, 1, 7]))], SessionConfig::default());
    let report = s.analyze_image(&RgbFrame::with_shape(4, 4)).unwrap();

    assert_eq!(s.state(), SessionState::Stopped);
    assert_eq!(report.summary.facts().len(), 2);
    assert_eq!(report.unresolved, 1);
    assert_relative_eq!(s.summary().total_calories(), 750.0);
    assert_relative_eq!(s.summary().total_fat(), 20.5);
  }

  #[test]
  fn starting_twice_is_rejected() {
    let mut s = session(vec![], SessionConfig::default());
    s.analyze_image(&RgbFrame::with_shape(1, 1)).unwrap();

    let (source, released) = MockSource::frames(SourceKind::VideoFile, 1);
    let err = s.run(source, &Collect::default()).unwrap_err();
    assert!(matches!(
      err,
      SessionError::InvalidTransition(SessionState::Stopped)
    ));
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn video_runs_until_exhausted_and_releases_once() {
    let mut s = session(
      vec![Ok(detections(&[0])), Ok(detections(&[])), Ok(detections(&[1]))],
      SessionConfig::default(),
    );
    let (source, released) = MockSource::frames(SourceKind::VideoFile, 3);
    let output = Collect::default();

    let state = s.run(source, &output).unwrap();
    assert_eq!(state, SessionState::Exhausted);
    assert_eq!(s.state(), SessionState::Exhausted);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    let reports = output.0.lock().unwrap();
    assert_eq!(reports.len(), 3);
    assert_eq!(reports[1].frame_index, 1);
    assert!(!reports[1].summary.any_resolved());
    assert_relative_eq!(reports[2].summary.total_calories(), 350.0);
  }

  #[test]
  fn cumulative_policy_carries_totals_across_frames() {
    let mut s = session(
      vec![Ok(detections(&[0])), Ok(detections(&[1]))],
      SessionConfig::default().with_policy(AggregationPolicy::Cumulative),
    );
    let (source, _) = MockSource::frames(SourceKind::VideoFile, 2);
    let output = Collect::default();
    s.run(source, &output).unwrap();

    let reports = output.0.lock().unwrap();
    assert_relative_eq!(reports[0].summary.total_calories(), 400.0);
    assert_relative_eq!(reports[1].summary.total_calories(), 750.0);
    assert_relative_eq!(s.summary().total_calories(), 750.0);
  }

  #[test]
  fn video_read_error_fails_the_session() {
    let mut s = session(vec![], SessionConfig::default());
    let (source, released) = MockSource::new(
      SourceKind::VideoFile,
      vec![Some(Ok(RgbFrame::with_shape(2, 2))), Some(Err(MockError("corrupt packet")))],
    );

    let err = s.run(source, &Collect::default()).unwrap_err();
    assert!(matches!(err, SessionError::Source(_)));
    assert_eq!(s.state(), SessionState::Failed);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn ip_camera_without_first_frame_is_a_connectivity_failure() {
    let mut s = session(vec![], SessionConfig::default());
    let (source, released) = MockSource::new(SourceKind::IpCamera, vec![None]);

    let err = s.run(source, &Collect::default()).unwrap_err();
    assert!(matches!(
      err,
      SessionError::Connectivity {
        kind: SourceKind::IpCamera,
        ..
      }
    ));
    assert_eq!(s.state(), SessionState::Failed);
    assert_eq!(s.frames(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn ip_camera_read_error_is_a_connectivity_failure() {
    let mut s = session(vec![], SessionConfig::default());
    let (source, _) = MockSource::new(
      SourceKind::IpCamera,
      vec![Some(Ok(RgbFrame::with_shape(2, 2))), Some(Err(MockError("timeout")))],
    );

    let err = s.run(source, &Collect::default()).unwrap_err();
    assert!(err.to_string().contains("timeout"));
    assert_eq!(s.frames(), 1);
  }

  #[test]
  fn stop_request_is_observed_between_frames() {
    let mut s = session(vec![], SessionConfig::default());
    s.stop_handle().stop();
    let (source, released) = MockSource::frames(SourceKind::IpCamera, 5);

    assert_eq!(s.run(source, &Collect::default()).unwrap(), SessionState::Stopped);
    assert_eq!(s.frames(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn max_frames_stops_the_session() {
    let mut s = session(vec![], SessionConfig::default().with_max_frames(Some(2)));
    let (source, released) = MockSource::frames(SourceKind::VideoFile, 5);

    assert_eq!(s.run(source, &Collect::default()).unwrap(), SessionState::Stopped);
    assert_eq!(s.frames(), 2);
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn detector_error_fails_and_releases() {
    let mut s = session(vec![Err(MockError("npu"))], SessionConfig::default());
    let (source, released) = MockSource::frames(SourceKind::VideoFile, 2);

    assert!(matches!(
      s.run(source, &Collect::default()),
      Err(SessionError::Detector(_))
    ));
    assert_eq!(released.load(Ordering::SeqCst), 1);
  }

  #[derive(Default)]
  struct MockTransport {
    callback: Option<FrameCallback>,
  }

  impl PushTransport for MockTransport {
    type Error = MockError;

    fn register(&mut self, callback: FrameCallback) -> Result<(), MockError> {
      self.callback = Some(callback);
      Ok(())
    }
  }

  #[test]
  fn live_callback_publishes_reports_and_returns_frames() {
    let detector = ScriptedDetector::new(vec![
      Ok(detections(&[0, 1])),
      Err(MockError("busy")),
      Ok(detections(&[1])),
    ]);
    let mut live = LiveCameraSession::new(detector, catalog(), SessionConfig::default(), PassThrough);
    let mut transport = MockTransport::default();
    live.attach(&mut transport).unwrap();
    assert_eq!(live.state(), SessionState::Running);

    let callback = transport.callback.clone().unwrap();
    let handle = thread::spawn(move || {
      (0..3)
        .map(|_| callback(RgbFrame::with_shape(3, 5)))
        .map(|f| (f.height(), f.width()))
        .collect::<Vec<_>>()
    });
    assert_eq!(handle.join().unwrap(), vec![(3, 5); 3]);

    let first = live.try_recv().unwrap().report;
    assert_relative_eq!(first.summary.total_calories(), 750.0);
    let second = live.try_recv().unwrap().report;
    assert_eq!(second.frame_index, 1);
    assert_relative_eq!(second.summary.total_calories(), 350.0);
    assert!(live.try_recv().is_none());

    assert!(matches!(
      live.attach(&mut transport),
      Err(SessionError::InvalidTransition(SessionState::Running))
    ));
    assert_eq!(live.finish::<MockError>(Ok(())).unwrap(), SessionState::Stopped);
  }

  #[test]
  fn live_reports_are_dropped_when_nobody_reads() {
    let live = LiveCameraSession::new(
      ScriptedDetector::new(vec![]),
      catalog(),
      SessionConfig::default(),
      PassThrough,
    );
    let callback = live.callback();
    for _ in 0..LIVE_REPORT_CAPACITY + 3 {
      callback(RgbFrame::with_shape(1, 1));
    }
    let mut received = 0;
    while live.try_recv().is_some() {
      received += 1;
    }
    assert_eq!(received, LIVE_REPORT_CAPACITY);
  }
}

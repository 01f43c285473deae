// 该文件是 Huajian （花鉴） 项目的一部分。
// src/task.rs - 单张图像分析任务
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
  sync::{Arc, Mutex, PoisonError},
  time::Instant,
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  input::{BoundedImageError, BoundedImageLoader, ImageSource, LoadedImage},
  model::{
    BoundingBox, Detection, FlowerModelError, LabelError, ObjectDetector, SharedFlowerModel,
  },
  output::draw::Draw,
};

pub const NOT_LOADED_SUMMARY: &str = "Error: Custom model or labels not loaded properly.";

#[derive(Error, Debug)]
pub enum AnalysisError {
  #[error("图像加载失败: {0}")]
  Image(#[from] BoundedImageError),
  #[error("标签与模型不匹配: {0}")]
  Label(#[from] LabelError),
  #[error("请求 {0} 已被新的分析请求取代")]
  Superseded(u64),
  #[error("后台任务异常: {0}")]
  Join(#[from] JoinError),
}

/// 花卉检测通道的状态，资源加载失败时保留原因
#[derive(Clone)]
pub enum CustomPass {
  Ready(SharedFlowerModel),
  Unavailable(String),
}

impl CustomPass {
  /// 资源加载失败不终止程序，只禁用花卉检测通道
  pub fn from_result<E: std::fmt::Display>(result: Result<SharedFlowerModel, E>) -> Self {
    match result {
      Ok(model) => CustomPass::Ready(model),
      Err(e) => {
        error!("花卉模型或标签加载失败: {}", e);
        CustomPass::Unavailable(e.to_string())
      }
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self, CustomPass::Ready(_))
  }
}

/// 花卉检测通道的结果
#[derive(Debug, Clone)]
pub enum CustomOutcome {
  NotLoaded(String),
  Detections(Vec<Detection>),
}

impl CustomOutcome {
  pub fn detections(&self) -> &[Detection] {
    match self {
      CustomOutcome::NotLoaded(_) => &[],
      CustomOutcome::Detections(detections) => detections,
    }
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self, CustomOutcome::Detections(_))
  }
}

/// 一次分析的完整结果
#[derive(Debug, Clone)]
pub struct AnalysisReport {
  pub request_id: u64,
  /// 叠加了两层检测结果的图像
  pub image: RgbImage,
  pub source_width: u32,
  pub source_height: u32,
  pub sample_size: u32,
  pub flowers: CustomOutcome,
  pub objects: Vec<BoundingBox>,
  pub analyzed_at: DateTime<Utc>,
}

impl AnalysisReport {
  /// 每个花卉检测一行；花卉通道不可用时为固定的错误提示
  pub fn summary(&self) -> String {
    match &self.flowers {
      CustomOutcome::NotLoaded(_) => format!("{}\n", NOT_LOADED_SUMMARY),
      CustomOutcome::Detections(detections) => detections
        .iter()
        .map(|detection| format!("{}\n", detection))
        .collect(),
    }
  }
}

struct ActiveRequest {
  id: u64,
  token: CancellationToken,
}

/// 花卉检测与通用检测的分析器
///
/// 每次 [`Analyzer::analyze`] 都会取消上一个请求；
/// 已被取代的请求返回 [`AnalysisError::Superseded`]，不会产生标注图像。
pub struct Analyzer<D> {
  loader: BoundedImageLoader,
  flower: CustomPass,
  detector: D,
  draw: Draw,
  active: Mutex<ActiveRequest>,
}

impl<D: ObjectDetector> Analyzer<D> {
  pub fn new(loader: BoundedImageLoader, flower: CustomPass, detector: D) -> Self {
    if let CustomPass::Unavailable(reason) = &flower {
      warn!("花卉模型不可用: {}", reason);
    }

    Self {
      loader,
      flower,
      detector,
      draw: Draw::default(),
      active: Mutex::new(ActiveRequest {
        id: 0,
        token: CancellationToken::new(),
      }),
    }
  }

  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn flower_pass(&self) -> &CustomPass {
    &self.flower
  }

  /// 取消当前正在进行的请求
  pub fn cancel(&self) {
    self
      .active
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .token
      .cancel();
  }

  fn begin(&self) -> (u64, CancellationToken) {
    let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
    active.token.cancel();
    active.id += 1;
    active.token = CancellationToken::new();
    debug!("开始分析请求 {}", active.id);
    (active.id, active.token.clone())
  }

  fn is_current(&self, request_id: u64) -> bool {
    let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
    active.id == request_id && !active.token.is_cancelled()
  }

  pub async fn analyze(&self, source: ImageSource) -> Result<AnalysisReport, AnalysisError> {
    let (request_id, token) = self.begin();

    let result = tokio::select! {
      biased;
      _ = token.cancelled() => Err(AnalysisError::Superseded(request_id)),
      result = self.run(request_id, source) => result,
    };

    if !self.is_current(request_id) {
      info!("丢弃过期的分析结果: 请求 {}", request_id);
      return Err(AnalysisError::Superseded(request_id));
    }
    result
  }

  async fn run(
    &self,
    request_id: u64,
    source: ImageSource,
  ) -> Result<AnalysisReport, AnalysisError> {
    let started = Instant::now();
    let loader = self.loader;
    let LoadedImage {
      image,
      source_width,
      source_height,
      sample_size,
    } = tokio::task::spawn_blocking(move || source.load(&loader)).await??;
    info!(
      "图像加载完成: {}x{} -> {}x{} (降采样 {}), 耗时: {:.2?}",
      source_width,
      source_height,
      image.width(),
      image.height(),
      sample_size,
      started.elapsed()
    );

    let image = Arc::new(image);
    let (flowers, objects) = tokio::join!(
      self.run_flower_pass(image.clone()),
      self.run_object_pass(image.clone())
    );
    let flowers = flowers?;

    let draw = self.draw.clone();
    let (annotated, flowers, objects) = tokio::task::spawn_blocking(move || {
      let annotated = draw.compose(&image, flowers.detections(), &objects);
      (annotated, flowers, objects)
    })
    .await?;
    info!("请求 {} 分析完成，耗时: {:.2?}", request_id, started.elapsed());

    Ok(AnalysisReport {
      request_id,
      image: annotated,
      source_width,
      source_height,
      sample_size,
      flowers,
      objects,
      analyzed_at: Utc::now(),
    })
  }

  async fn run_flower_pass(&self, image: Arc<RgbImage>) -> Result<CustomOutcome, AnalysisError> {
    let model = match &self.flower {
      CustomPass::Ready(model) => model.clone(),
      CustomPass::Unavailable(reason) => return Ok(CustomOutcome::NotLoaded(reason.clone())),
    };

    let started = Instant::now();
    match tokio::task::spawn_blocking(move || model.infer(&image)).await {
      Ok(Ok(detections)) => {
        info!(
          "花卉检测到 {} 个目标，耗时: {:.2?}",
          detections.len(),
          started.elapsed()
        );
        Ok(CustomOutcome::Detections(detections))
      }
      Ok(Err(FlowerModelError::Label(e))) => {
        error!("花卉检测结果无法映射到标签: {}", e);
        Err(AnalysisError::Label(e))
      }
      Ok(Err(e)) => {
        error!("花卉模型推理失败，按无检测结果处理: {}", e);
        Ok(CustomOutcome::Detections(Vec::new()))
      }
      Err(e) => {
        error!("花卉推理任务异常，按无检测结果处理: {}", e);
        Ok(CustomOutcome::Detections(Vec::new()))
      }
    }
  }

  async fn run_object_pass(&self, image: Arc<RgbImage>) -> Vec<BoundingBox> {
    let started = Instant::now();
    match self.detector.detect(image).await {
      Ok(boxes) => {
        info!(
          "通用检测到 {} 个物体，耗时: {:.2?}",
          boxes.len(),
          started.elapsed()
        );
        boxes
      }
      Err(e) => {
        error!("通用检测失败，按无检测结果处理: {}", e);
        Vec::new()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn report(flowers: CustomOutcome) -> AnalysisReport {
    AnalysisReport {
      request_id: 1,
      image: RgbImage::new(1, 1),
      source_width: 1,
      source_height: 1,
      sample_size: 1,
      flowers,
      objects: Vec::new(),
      analyzed_at: Utc::now(),
    }
  }

  fn detection(label: &str, score: f32) -> Detection {
    Detection {
      bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
      class_id: 0,
      label: label.to_string(),
      score,
    }
  }

  #[test]
  fn summary_lists_each_detection() {
    let report = report(CustomOutcome::Detections(vec![
      detection("rose", 0.873),
      detection("tulip", 0.6),
    ]));
    assert_eq!(report.summary(), "rose (0.87)\ntulip (0.60)\n");
  }

  #[test]
  fn summary_reports_missing_model() {
    let report = report(CustomOutcome::NotLoaded("no labels".to_string()));
    assert_eq!(report.summary(), format!("{}\n", NOT_LOADED_SUMMARY));
    assert!(report.flowers.detections().is_empty());
    assert!(!report.flowers.is_loaded());
  }

  #[test]
  fn empty_detections_give_empty_summary() {
    assert_eq!(report(CustomOutcome::Detections(vec![])).summary(), "");
  }
}

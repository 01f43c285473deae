// 该文件是 Huajian （花鉴） 项目的一部分。
// src/model/flower.rs - 花卉检测模型
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
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{DETECTION_ROW_SIZE, DetectionTensor, RGB_CHANNELS, RgbF32Tensor},
  model::{BoundingBox, Detection, LabelError, LabelTable, Model, TensorRunner},
  url_path, url_query,
};

pub const FLOWER_INPUT_W: u32 = 224;
pub const FLOWER_INPUT_H: u32 = 224;
pub const FLOWER_MAX_DETECTIONS: usize = 10;
pub const FLOWER_SCORE_THRESH: f32 = 0.5;

const DEFAULT_LABELS_FILE: &str = "labels.txt";

/// 224×224 输入、最多 10 个检测框的花卉模型
pub type Flower224<R> = FlowerModel<R, FLOWER_INPUT_W, FLOWER_INPUT_H, FLOWER_MAX_DETECTIONS>;

/// 擦除后端类型后可在任务间共享的花卉模型
pub type SharedFlowerModel = Arc<
  dyn Model<Input = RgbImage, Output = Vec<Detection>, Error = FlowerModelError> + Send + Sync,
>;

#[derive(Error, Debug)]
pub enum FlowerModelError {
  #[error("标签错误: {0}")]
  Label(#[from] LabelError),
  #[error("模型{tensor}形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  ShapeMismatch {
    tensor: &'static str,
    expected: Vec<usize>,
    actual: Vec<usize>,
  },
  #[error("推理后端错误: {0}")]
  Runner(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("推理后端在先前的调用中崩溃")]
  Poisoned,
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("置信度阈值无效: {0}")]
  InvalidThreshold(String),
}

/// 解码固定布局的检测输出
///
/// 每行为 `[left, top, right, bottom, score, class_id]`，坐标归一化到 [0, 1]。
/// 只保留 `score > threshold` 的行，输出保持原始行顺序。
pub fn decode_detections(
  output: &[f32],
  width: u32,
  height: u32,
  labels: &LabelTable,
  threshold: f32,
) -> Result<Vec<Detection>, LabelError> {
  let mut detections = Vec::new();

  for (row_idx, row) in output.chunks_exact(DETECTION_ROW_SIZE).enumerate() {
    let score = row[4];
    let accepted = score > threshold;
    if !accepted {
      continue;
    }

    let (class_id, label) = labels.lookup(row[5])?;
    let bbox = BoundingBox::denormalize([row[0], row[1], row[2], row[3]], width, height);
    debug!(
      "第 {} 行: {} {:.3} at [{:.1}, {:.1}, {:.1}, {:.1}]",
      row_idx, label, score, bbox.left, bbox.top, bbox.right, bbox.bottom
    );

    detections.push(Detection {
      bbox,
      class_id,
      label: label.to_string(),
      score,
    });
  }

  Ok(detections)
}

fn check_shape(
  tensor: &'static str,
  declared: Option<Vec<usize>>,
  expected: Vec<usize>,
) -> Result<(), FlowerModelError> {
  match declared {
    Some(actual) if actual != expected => {
      error!("模型{}形状不匹配: 期望 {:?}, 实际 {:?}", tensor, expected, actual);
      Err(FlowerModelError::ShapeMismatch {
        tensor,
        expected,
        actual,
      })
    }
    Some(_) => Ok(()),
    None => {
      debug!("推理后端未声明{}形状，跳过校验", tensor);
      Ok(())
    }
  }
}

/// 花卉检测模型
///
/// 输入 `1×H×W×3` 的 f32 张量，输出 `1×K×6` 的检测张量。
/// 后端由互斥锁保护，同一模型上的推理调用串行执行。
pub struct FlowerModel<R, const W: u32, const H: u32, const K: usize> {
  runner: Mutex<R>,
  labels: LabelTable,
  threshold: f32,
}

impl<R: TensorRunner, const W: u32, const H: u32, const K: usize> FlowerModel<R, W, H, K> {
  pub fn new(runner: R, labels: LabelTable) -> Result<Self, FlowerModelError> {
    check_shape(
      "输入",
      runner.input_shape(),
      vec![1, H as usize, W as usize, RGB_CHANNELS],
    )?;
    check_shape(
      "输出",
      runner.output_shape(),
      vec![1, K, DETECTION_ROW_SIZE],
    )?;

    info!(
      "花卉模型就绪: 输入 1x{}x{}x{}, 输出 1x{}x{}, 标签 {} 个",
      H,
      W,
      RGB_CHANNELS,
      K,
      DETECTION_ROW_SIZE,
      labels.len()
    );

    Ok(Self {
      runner: Mutex::new(runner),
      labels,
      threshold: FLOWER_SCORE_THRESH,
    })
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn threshold(&self) -> f32 {
    self.threshold
  }

  pub fn labels(&self) -> &LabelTable {
    &self.labels
  }

  /// 执行一次推理，返回原始输出张量
  pub fn run_tensor(
    &self,
    tensor: &RgbF32Tensor<W, H>,
  ) -> Result<DetectionTensor<K>, FlowerModelError> {
    let input = tensor.to_ne_bytes();
    let mut output = DetectionTensor::<K>::default();

    let mut runner = self
      .runner
      .lock()
      .map_err(|_| FlowerModelError::Poisoned)?;
    runner
      .run(&input, output.as_mut_slice())
      .map_err(|e| FlowerModelError::Runner(Box::new(e)))?;

    Ok(output)
  }
}

impl<R: TensorRunner, const W: u32, const H: u32, const K: usize> Model
  for FlowerModel<R, W, H, K>
{
  type Input = RgbImage;
  type Output = Vec<Detection>;
  type Error = FlowerModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    debug!("编码模型输入: {}x{} -> {}x{}", input.width(), input.height(), W, H);
    let tensor = RgbF32Tensor::<W, H>::encode(input);

    debug!("执行模型推理");
    let output = self.run_tensor(&tensor)?;

    let detections = decode_detections(
      output.as_slice(),
      input.width(),
      input.height(),
      &self.labels,
      self.threshold,
    )?;
    debug!("检测到 {} 朵花", detections.len());
    Ok(detections)
  }
}

/// 从 `flower:///path/model?labels=/path/labels.txt&threshold=0.5` 构造模型
#[derive(Debug, Clone)]
pub struct FlowerModelBuilder {
  model_path: PathBuf,
  labels_path: PathBuf,
  threshold: f32,
}

impl FromUrlWithScheme for FlowerModelBuilder {
  const SCHEME: &'static str = "flower";
}

impl FromUrl for FlowerModelBuilder {
  type Error = FlowerModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FlowerModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let model_path =
      url_path(url).map_err(|e| FlowerModelError::ModelPathError(e.to_string()))?;
    let labels_path = url_query(url, "labels")
      .map(PathBuf::from)
      .unwrap_or_else(|| model_path.with_file_name(DEFAULT_LABELS_FILE));

    let mut builder = FlowerModelBuilder::new(model_path, labels_path);
    if let Some(value) = url_query(url, "threshold") {
      let threshold = value
        .parse::<f32>()
        .map_err(|e| FlowerModelError::InvalidThreshold(format!("{}: {}", value, e)))?;
      if !(0.0..=1.0).contains(&threshold) {
        return Err(FlowerModelError::InvalidThreshold(value));
      }
      builder = builder.threshold(threshold);
    }

    Ok(builder)
  }
}

impl FlowerModelBuilder {
  pub fn new(model_path: PathBuf, labels_path: PathBuf) -> Self {
    Self {
      model_path,
      labels_path,
      threshold: FLOWER_SCORE_THRESH,
    }
  }

  pub fn threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  pub fn labels_path(&self) -> &Path {
    &self.labels_path
  }

  /// 加载标签表并与给定后端组装成模型
  pub fn build_with<R: TensorRunner, const W: u32, const H: u32, const K: usize>(
    &self,
    runner: R,
  ) -> Result<FlowerModel<R, W, H, K>, FlowerModelError> {
    let labels = LabelTable::from_file(&self.labels_path)?;
    Ok(FlowerModel::new(runner, labels)?.with_threshold(self.threshold))
  }
}

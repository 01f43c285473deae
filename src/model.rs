// 该文件是 Huajian （花鉴） 项目的一部分。
// src/model.rs - 模型
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

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use image::RgbImage;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 同步推理后端
///
/// 接收本机字节序的输入张量，并填充调用方预先分配的输出缓冲区。
/// 同一后端不保证可以并发调用，调用方负责串行化。
pub trait TensorRunner: Send {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 模型声明的输入形状，后端无法查询时返回 `None`
  fn input_shape(&self) -> Option<Vec<usize>> {
    None
  }

  /// 模型声明的输出形状，后端无法查询时返回 `None`
  fn output_shape(&self) -> Option<Vec<usize>> {
    None
  }

  fn run(&mut self, input: &[u8], output: &mut [f32]) -> Result<(), Self::Error>;
}

/// 将后端报告的维度数组转换为形状，去掉末尾填充的 0
pub fn declared_shape<I>(dims: I) -> Vec<usize>
where
  I: IntoIterator,
  I::Item: Into<u64>,
{
  let mut shape: Vec<usize> = dims.into_iter().map(|d| d.into() as usize).collect();
  while shape.last() == Some(&0) {
    shape.pop();
  }
  shape
}

/// 像素坐标系下的轴对齐边界框，构造时保证 left ≤ right、top ≤ bottom
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl BoundingBox {
  pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left: left.min(right),
      top: top.min(bottom),
      right: left.max(right),
      bottom: top.max(bottom),
    }
  }

  /// 将 [0, 1] 归一化坐标映射到 `width`×`height` 像素
  pub fn denormalize(normalized: [f32; 4], width: u32, height: u32) -> Self {
    let (w, h) = (width as f32, height as f32);
    Self::new(
      normalized[0] * w,
      normalized[1] * h,
      normalized[2] * w,
      normalized[3] * h,
    )
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.left, self.top, self.right, self.bottom]
  }
}

/// 一条带标签的检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub class_id: usize,
  pub label: String,
  pub score: f32,
}

impl Detection {
  /// 形如 `rose (0.87)` 的展示文本
  pub fn display_label(&self) -> String {
    self.to_string()
  }
}

impl fmt::Display for Detection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ({:.2})", self.label, self.score)
  }
}

/// 通用目标检测器，只返回无类别的边界框，结果异步送达
#[async_trait]
pub trait ObjectDetector: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<BoundingBox>, Self::Error>;
}

pub mod label;
pub use self::label::{LabelError, LabelTable};

mod flower;
pub use self::flower::{
  FLOWER_INPUT_H, FLOWER_INPUT_W, FLOWER_MAX_DETECTIONS, FLOWER_SCORE_THRESH, Flower224,
  FlowerModel, FlowerModelBuilder, FlowerModelError, SharedFlowerModel, decode_detections,
};

#[cfg(feature = "rknpu")]
mod rknn;
#[cfg(feature = "rknpu")]
pub use self::rknn::{RknnRunner, RknnRunnerError};

mod yolo26;
pub use self::yolo26::decode_yolo26;
#[cfg(feature = "rknpu")]
pub use self::yolo26::{Yolo26Builder, Yolo26Detector, Yolo26Error};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bounding_box_is_reordered() {
    let bbox = BoundingBox::new(50.0, 80.0, 10.0, 20.0);
    assert_eq!(bbox.to_array(), [10.0, 20.0, 50.0, 80.0]);
    assert_eq!(bbox.width(), 40.0);
    assert_eq!(bbox.height(), 60.0);
  }

  #[test]
  fn denormalize_scales_by_image_size() {
    let bbox = BoundingBox::denormalize([0.1, 0.2, 0.5, 0.6], 1000, 500);
    assert!((bbox.left - 100.0).abs() < 1e-3);
    assert!((bbox.top - 100.0).abs() < 1e-3);
    assert!((bbox.right - 500.0).abs() < 1e-3);
    assert!((bbox.bottom - 300.0).abs() < 1e-3);
  }

  #[test]
  fn detection_label_has_two_decimals() {
    let detection = Detection {
      bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
      class_id: 0,
      label: "rose".to_string(),
      score: 0.873,
    };
    assert_eq!(detection.display_label(), "rose (0.87)");
  }

  #[test]
  fn declared_shape_drops_padding() {
    let dims: [u32; 8] = [1, 224, 224, 3, 0, 0, 0, 0];
    assert_eq!(declared_shape(dims), vec![1, 224, 224, 3]);
    assert_eq!(declared_shape([1u32, 10, 6]), vec![1, 10, 6]);
    assert!(declared_shape([0u32; 4]).is_empty());
  }
}

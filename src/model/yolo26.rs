// 该文件是 Huajian （花鉴） 项目的一部分。
// src/model/yolo26.rs - 通用目标检测（YOLO26，无类别）
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

use tracing::{debug, error};

const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: f32 = 640.0;
const YOLO26_INPUT_H: f32 = 640.0;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
pub const YOLO26_OBJECT_THRESH: f32 = 0.5;

/// 按长度区分同一检测头的回归与分类张量，返回 (reg, cls)
fn split_reg_cls<'a>(
  first: &'a [f32],
  second: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if first.len() == reg_expected && second.len() == cls_expected {
    Some((first, second))
  } else if first.len() == cls_expected && second.len() == reg_expected {
    Some((second, first))
  } else {
    None
  }
}

/// 解码三个检测头的输出，得到归一化的无类别边界框 `[x_min, y_min, x_max, y_max]`
///
/// `tensors` 按检测头顺序排列，每个头两个张量（回归和分类），顺序可以互换。
/// 物体置信度取各类别最大 logit 的 sigmoid。
pub fn decode_yolo26(tensors: &[&[f32]], threshold: f32) -> Vec<[f32; 4]> {
  let mut boxes = Vec::new();

  for (head_idx, (&(map_h, map_w), stride)) in
    YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
  {
    let (Some(first), Some(second)) = (tensors.get(head_idx * 2), tensors.get(head_idx * 2 + 1))
    else {
      error!("检测头 {} 缺少输出张量", head_idx);
      continue;
    };

    let spatial = map_h * map_w;
    let Some((reg, cls)) = split_reg_cls(
      first,
      second,
      4 * spatial,
      YOLO26_CLASS_NUM * spatial,
    ) else {
      error!(
        "检测头 {}: 输出大小不匹配 - {} / {}, 期望回归 {}, 期望分类 {}",
        head_idx,
        first.len(),
        second.len(),
        4 * spatial,
        YOLO26_CLASS_NUM * spatial
      );
      continue;
    };

    for h in 0..map_h {
      for w in 0..map_w {
        let idx = h * map_w + w;

        let max_logit = (0..YOLO26_CLASS_NUM)
          .map(|c| cls[c * spatial + idx])
          .fold(f32::MIN, f32::max);
        let score = sigmoid(max_logit);
        if score <= threshold {
          continue;
        }

        let grid_x = (w as f32) + 0.5;
        let grid_y = (h as f32) + 0.5;

        let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);
        let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_W);
        let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, YOLO26_INPUT_H);

        boxes.push([
          xmin / YOLO26_INPUT_W,
          ymin / YOLO26_INPUT_H,
          xmax / YOLO26_INPUT_W,
          ymax / YOLO26_INPUT_H,
        ]);
      }
    }
  }

  debug!("通用检测到 {} 个物体", boxes.len());
  boxes
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

#[cfg(feature = "rknpu")]
mod npu {
  use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
  };

  use async_trait::async_trait;
  use image::RgbImage;
  use rknpu::{Context, InitFlags, TensorFormat, TensorType};
  use thiserror::Error;
  use tracing::{debug, error, info};
  use url::Url;

  use super::{YOLO26_OBJECT_THRESH, decode_yolo26};
  use crate::{
    FromUrl, FromUrlWithScheme,
    frame::RgbNhwcFrame,
    model::{BoundingBox, ObjectDetector},
    url_path, url_query,
  };

  const YOLO26_NUM_INPUTS: u32 = 1;
  const YOLO26_NUM_OUTPUTS: u32 = 6;

  #[derive(Error, Debug)]
  pub enum Yolo26Error {
    #[error("模型加载错误: {0}")]
    ModelLoadError(#[from] std::io::Error),
    #[error("模型无效: {0}")]
    ModelInvalid(String),
    #[error("RKNN 错误: {0}")]
    RknnError(#[from] rknpu::Error),
    #[error("模型路径错误: {0}")]
    ModelPathError(String),
    #[error("读取输出失败: {0}")]
    OutputError(String),
    #[error("推理上下文在先前的调用中崩溃")]
    Poisoned,
    #[error("推理任务异常: {0}")]
    Join(#[from] tokio::task::JoinError),
  }

  pub struct Yolo26Builder {
    model_path: PathBuf,
    threshold: f32,
    flags: InitFlags,
  }

  impl FromUrlWithScheme for Yolo26Builder {
    const SCHEME: &'static str = "yolo26";
  }

  impl FromUrl for Yolo26Builder {
    type Error = Yolo26Error;

    fn from_url(url: &Url) -> Result<Self, Self::Error> {
      if url.scheme() != Self::SCHEME {
        return Err(Yolo26Error::ModelPathError(format!(
          "模型路径必须使用 {} 方案",
          Self::SCHEME
        )));
      }

      let threshold = match url_query(url, "threshold") {
        Some(value) => value
          .parse::<f32>()
          .map_err(|e| Yolo26Error::ModelPathError(format!("阈值 {} 无效: {}", value, e)))?,
        None => YOLO26_OBJECT_THRESH,
      };

      Ok(Yolo26Builder {
        model_path: url_path(url).map_err(|e| Yolo26Error::ModelPathError(e.to_string()))?,
        threshold,
        flags: InitFlags::default(),
      })
    }
  }

  impl Yolo26Builder {
    pub fn flags(mut self, flags: InitFlags) -> Self {
      self.flags = flags;
      self
    }

    pub fn build(self) -> Result<Yolo26Detector, Yolo26Error> {
      info!("加载通用检测模型: {}", self.model_path.display());
      let model_data = std::fs::read(&self.model_path)?;
      let context = Context::new(&model_data, self.flags)?;

      let num_inputs = context.num_inputs()?;
      let num_outputs = context.num_outputs()?;
      if num_inputs != YOLO26_NUM_INPUTS || num_outputs != YOLO26_NUM_OUTPUTS {
        let msg = format!(
          "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
          YOLO26_NUM_INPUTS, YOLO26_NUM_OUTPUTS, num_inputs, num_outputs
        );
        error!("{}", msg);
        return Err(Yolo26Error::ModelInvalid(msg));
      }
      debug!("模型输入数量: {}, 输出数量: {}", num_inputs, num_outputs);

      Ok(Yolo26Detector {
        context: Arc::new(Mutex::new(context)),
        threshold: self.threshold,
      })
    }
  }

  /// 基于 YOLO26 的通用检测器，推理在阻塞线程池中完成
  pub struct Yolo26Detector {
    context: Arc<Mutex<Context>>,
    threshold: f32,
  }

  #[async_trait]
  impl ObjectDetector for Yolo26Detector {
    type Error = Yolo26Error;

    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<BoundingBox>, Self::Error> {
      let context = self.context.clone();
      let threshold = self.threshold;

      tokio::task::spawn_blocking(move || -> Result<Vec<BoundingBox>, Yolo26Error> {
        let frame = RgbNhwcFrame::<640, 640>::from_image(&image);
        let context = context.lock().map_err(|_| Yolo26Error::Poisoned)?;

        context.set_input(0, frame.as_nhwc(), TensorFormat::NHWC, TensorType::UInt8)?;
        context.run()?;
        let output = context.get_outputs()?;

        let mut tensors = Vec::with_capacity(YOLO26_NUM_OUTPUTS as usize);
        for idx in 0..YOLO26_NUM_OUTPUTS as usize {
          let data = output
            .get_f32(idx)
            .map_err(|e| Yolo26Error::OutputError(e.to_string()))?;
          tensors.push(data.to_vec());
        }
        let views: Vec<&[f32]> = tensors.iter().map(Vec::as_slice).collect();

        Ok(
          decode_yolo26(&views, threshold)
            .into_iter()
            .map(|bbox| BoundingBox::denormalize(bbox, image.width(), image.height()))
            .collect(),
        )
      })
      .await?
    }
  }
}

#[cfg(feature = "rknpu")]
pub use self::npu::{Yolo26Builder, Yolo26Detector, Yolo26Error};

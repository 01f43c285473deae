// 该文件是 Huajian （花鉴） 项目的一部分。
// src/model/rknn.rs - RKNN 推理后端
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

use std::path::Path;

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::model::{
  FlowerModel, FlowerModelBuilder, FlowerModelError, TensorRunner, declared_shape,
};

const FLOWER_NUM_INPUTS: u32 = 1;
const FLOWER_NUM_OUTPUTS: u32 = 1;

#[derive(Error, Debug)]
pub enum RknnRunnerError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("RKNN 错误: {0}")]
  RknnError(#[from] rknpu::Error),
  #[error("读取输出失败: {0}")]
  OutputError(String),
  #[error("输出长度不匹配: 期望 {expected}, 实际 {actual}")]
  OutputLength { expected: usize, actual: usize },
}

/// 单输入单输出的 RKNN 上下文
pub struct RknnRunner {
  context: Context,
  input_shape: Vec<usize>,
  output_shape: Vec<usize>,
}

impl RknnRunner {
  pub fn open<P: AsRef<Path>>(path: P, flags: InitFlags) -> Result<Self, RknnRunnerError> {
    let path = path.as_ref();
    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, flags)?;

    let num_inputs = context.num_inputs()?;
    let num_outputs = context.num_outputs()?;
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    if num_inputs != FLOWER_NUM_INPUTS || num_outputs != FLOWER_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        FLOWER_NUM_INPUTS, FLOWER_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnRunnerError::ModelInvalid(msg));
    }

    let input_attr = context
      .input_attrs
      .first()
      .ok_or_else(|| RknnRunnerError::ModelInvalid("缺少输入张量属性".to_string()))?;
    let output_attr = context
      .output_attrs
      .first()
      .ok_or_else(|| RknnRunnerError::ModelInvalid("缺少输出张量属性".to_string()))?;
    let input_shape = declared_shape(input_attr.dims.iter().copied());
    let output_shape = declared_shape(output_attr.dims.iter().copied());
    debug!("模型输入形状: {:?}", input_shape);
    debug!("模型输出形状: {:?}", output_shape);

    Ok(Self {
      context,
      input_shape,
      output_shape,
    })
  }
}

impl TensorRunner for RknnRunner {
  type Error = RknnRunnerError;

  fn input_shape(&self) -> Option<Vec<usize>> {
    Some(self.input_shape.clone())
  }

  fn output_shape(&self) -> Option<Vec<usize>> {
    Some(self.output_shape.clone())
  }

  fn run(&mut self, input: &[u8], output: &mut [f32]) -> Result<(), Self::Error> {
    self
      .context
      .set_input(0, input, TensorFormat::NHWC, TensorType::Float32)?;
    self.context.run()?;

    let outputs = self.context.get_outputs()?;
    let data = outputs
      .get_f32(0)
      .map_err(|e| RknnRunnerError::OutputError(e.to_string()))?;

    if data.len() != output.len() {
      return Err(RknnRunnerError::OutputLength {
        expected: output.len(),
        actual: data.len(),
      });
    }
    output.copy_from_slice(&data[..]);
    Ok(())
  }
}

impl FlowerModelBuilder {
  /// 使用 RKNN 后端加载模型
  pub fn build_rknn<const W: u32, const H: u32, const K: usize>(
    &self,
  ) -> Result<FlowerModel<RknnRunner, W, H, K>, FlowerModelError> {
    let runner = RknnRunner::open(self.model_path(), InitFlags::default())
      .map_err(|e| FlowerModelError::Runner(Box::new(e)))?;
    self.build_with(runner)
  }
}

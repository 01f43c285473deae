// 该文件是 Huajian （花鉴） 项目的一部分。
// src/bin/huajian_oneshot.rs - 单张图像花卉检测
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

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use huajian::{
  FromUrl,
  input::{BoundedImageLoader, DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH, ImageSource},
  model::{Flower224, FlowerModelBuilder, SharedFlowerModel, Yolo26Builder},
  output::{
    OutputWrapper, Render,
    draw::{Draw, load_font},
  },
  task::{Analyzer, CustomPass},
};

/// Huajian 单张图像检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 花卉模型，例如 flower:///model.rknn?labels=/labels.txt
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 通用检测模型，例如 yolo26:///yolo26.rknn
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Url,
  /// 输入图像，例如 image:///photo.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///result.png?record=true
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 标签字体文件，缺省使用内置字体
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 解码后的最大宽度
  #[arg(long, default_value_t = DEFAULT_MAX_WIDTH)]
  pub max_width: u32,
  /// 解码后的最大高度
  #[arg(long, default_value_t = DEFAULT_MAX_HEIGHT)]
  pub max_height: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("花卉模型: {}", args.model);
  info!("通用检测模型: {}", args.detector);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let flower = CustomPass::from_result(
    FlowerModelBuilder::from_url(&args.model)
      .and_then(|builder| builder.build_rknn())
      .map(|model: Flower224<_>| Arc::new(model) as SharedFlowerModel),
  );
  let detector = Yolo26Builder::from_url(&args.detector)?
    .build()
    .context("加载通用检测模型失败")?;

  let mut draw = Draw::default();
  if let Some(path) = &args.font {
    match load_font(path) {
      Ok(font) => draw = draw.with_font(font),
      Err(e) => warn!("无法加载字体 {}，继续使用内置字体: {}", path.display(), e),
    }
  }

  let loader = BoundedImageLoader::new(args.max_width, args.max_height);
  let analyzer = Analyzer::new(loader, flower, detector).with_draw(draw);

  let source = ImageSource::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let report = analyzer
    .analyze(source)
    .await
    .with_context(|| format!("分析失败: {}", args.input))?;
  output.render_result(&report)?;

  print!("{}", report.summary());
  info!(
    "花卉 {} 个，通用物体 {} 个",
    report.flowers.detections().len(),
    report.objects.len()
  );

  Ok(())
}

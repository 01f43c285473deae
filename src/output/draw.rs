// 该文件是 Huajian （花鉴） 项目的一部分。
// src/output/draw.rs - 检测结果叠加绘制
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

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{BoundingBox, Detection};

// 绘制常量
const STROKE_WIDTH: i32 = 5;
const LABEL_FONT_SIZE: f32 = 40.0;
const LABEL_BASELINE_OFFSET: f32 = 10.0;
const FLOWER_BOX_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const OBJECT_BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const LABEL_COLOR: [u8; 3] = [255, 255, 255]; // 白色

const EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font.ttf");

#[derive(Error, Debug)]
pub enum FontError {
  #[error("无法读取字体文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  Invalid(#[from] ab_glyph::InvalidFont),
}

pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontArc, FontError> {
  let data = std::fs::read(path.as_ref())?;
  let font = FontArc::try_from_vec(data)?;
  info!("已加载字体: {}", path.as_ref().display());
  Ok(font)
}

/// 将边界框取整并限制在图像范围内，完全落在图像外时返回 None
fn clamp_to_image(bbox: &BoundingBox, width: u32, height: u32) -> Option<(i32, i32, i32, i32)> {
  if width == 0 || height == 0 {
    return None;
  }
  let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);

  let left = bbox.left.floor() as i32;
  let top = bbox.top.floor() as i32;
  let right = bbox.right.ceil() as i32;
  let bottom = bbox.bottom.ceil() as i32;

  if right < 0 || bottom < 0 || left > max_x || top > max_y {
    return None;
  }

  Some((
    left.clamp(0, max_x),
    top.clamp(0, max_y),
    right.clamp(0, max_x),
    bottom.clamp(0, max_y),
  ))
}

/// 叠加层绘制器
///
/// 花卉检测框为红色并带标签文本，通用检测框为绿色。
/// 默认使用内置字体，可用 [`Draw::with_font`] 替换；没有字体时只绘制边框。
#[derive(Clone)]
pub struct Draw {
  font: Option<FontArc>,
  font_size: f32,
  stroke_width: i32,
  flower_color: Rgb<u8>,
  object_color: Rgb<u8>,
  label_color: Rgb<u8>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: FontArc::try_from_slice(EMBEDDED_FONT).ok(),
      font_size: LABEL_FONT_SIZE,
      stroke_width: STROKE_WIDTH,
      flower_color: Rgb(FLOWER_BOX_COLOR),
      object_color: Rgb(OBJECT_BOX_COLOR),
      label_color: Rgb(LABEL_COLOR),
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  /// 只绘制边框，不绘制标签文本
  pub fn without_font(mut self) -> Self {
    self.font = None;
    self
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在原图副本上依次绘制花卉层与通用检测层
  pub fn compose(
    &self,
    base: &RgbImage,
    flowers: &[Detection],
    objects: &[BoundingBox],
  ) -> RgbImage {
    let mut canvas = base.clone();

    for detection in flowers {
      self.stroke_rect(&mut canvas, &detection.bbox, self.flower_color);
      self.draw_label(
        &mut canvas,
        &detection.display_label(),
        detection.bbox.left,
        detection.bbox.top - LABEL_BASELINE_OFFSET,
      );
    }

    for bbox in objects {
      self.stroke_rect(&mut canvas, bbox, self.object_color);
    }

    canvas
  }

  // 描边以边框为中心线，向内外各扩展半个线宽
  fn stroke_rect(&self, image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    let Some((left, top, right, bottom)) = clamp_to_image(bbox, width, height) else {
      debug!("边界框 {:?} 完全位于图像之外，跳过", bbox);
      return;
    };
    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);

    let half = self.stroke_width / 2;
    for offset in -half..(self.stroke_width - half) {
      let x0 = (left + offset).clamp(0, max_x);
      let y0 = (top + offset).clamp(0, max_y);
      let x1 = (right - offset).clamp(0, max_x);
      let y1 = (bottom - offset).clamp(0, max_y);
      if x0 > x1 || y0 > y1 {
        continue;
      }

      let rect = Rect::at(x0, y0).of_size((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
      draw_hollow_rect_mut(image, rect, color);
    }
  }

  // (x, baseline) 为文本基线起点
  fn draw_label(&self, image: &mut RgbImage, text: &str, x: f32, baseline: f32) {
    let Some(font) = &self.font else {
      return;
    };

    let scale = PxScale::from(self.font_size);
    let ascent = font.as_scaled(scale).ascent();
    let top = (baseline - ascent).round() as i32;

    draw_text_mut(
      image,
      self.label_color,
      x.round() as i32,
      top,
      scale,
      font,
      text,
    );
  }
}

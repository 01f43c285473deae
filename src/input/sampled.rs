// 该文件是 Huajian （花鉴） 项目的一部分。
// src/input/sampled.rs - 按降采样倍数直接解码
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

use std::io::{BufRead, Read, Seek};

use image::{Rgb, RgbImage};
use tracing::debug;

use super::BoundedImageError;

// Adam7 各遍的 (x0, y0, dx, dy)
const ADAM7_PASSES: [(u32, u32, u32, u32); 7] = [
  (0, 0, 8, 8),
  (4, 0, 8, 8),
  (0, 4, 4, 8),
  (2, 0, 4, 4),
  (0, 2, 2, 4),
  (1, 0, 2, 2),
  (0, 1, 1, 2),
];
const SEQUENTIAL_PASS: [(u32, u32, u32, u32); 1] = [(0, 0, 1, 1)];

/// 按 f×f 块求均值的累加器，只保存降采样后尺寸的和
pub(super) struct BlockAccumulator {
  factor: u32,
  width: u32,
  height: u32,
  sums: Vec<u32>,
  counts: Vec<u32>,
}

impl BlockAccumulator {
  const BYTES_PER_PIXEL: u64 = 4 * 4;

  pub(super) fn new(
    source_width: u32,
    source_height: u32,
    factor: u32,
    budget: u64,
  ) -> Result<Self, BoundedImageError> {
    let factor = factor.max(1);
    let width = source_width.div_ceil(factor);
    let height = source_height.div_ceil(factor);

    let required = width as u64 * height as u64 * Self::BYTES_PER_PIXEL;
    if required > budget {
      return Err(BoundedImageError::OverBudget { required, budget });
    }

    let len = width as usize * height as usize;
    Ok(Self {
      factor,
      width,
      height,
      sums: vec![0; len * 3],
      counts: vec![0; len],
    })
  }

  pub(super) fn add(&mut self, x: u32, y: u32, pixel: [u8; 3]) {
    let (bx, by) = (x / self.factor, y / self.factor);
    if bx >= self.width || by >= self.height {
      return;
    }
    let idx = (by * self.width + bx) as usize;
    for (sum, value) in self.sums[idx * 3..idx * 3 + 3].iter_mut().zip(pixel) {
      *sum += value as u32;
    }
    self.counts[idx] += 1;
  }

  pub(super) fn finish(self) -> RgbImage {
    RgbImage::from_fn(self.width, self.height, |x, y| {
      let idx = (y * self.width + x) as usize;
      let count = self.counts[idx];
      if count == 0 {
        return Rgb([0, 0, 0]);
      }
      let avg = |c: usize| ((self.sums[idx * 3 + c] + count / 2) / count) as u8;
      Rgb([avg(0), avg(1), avg(2)])
    })
  }
}

fn to_rgb(px: &[u8]) -> [u8; 3] {
  match px.len() {
    1 | 2 => [px[0]; 3],
    _ => [px[0], px[1], px[2]],
  }
}

/// 逐行解码 PNG 并在读取时完成块平均，任何时刻只持有一行全宽像素
pub(super) fn decode_png<R: BufRead + Seek>(
  reader: R,
  factor: u32,
  budget: u64,
) -> Result<RgbImage, BoundedImageError> {
  let mut decoder = png::Decoder::new(reader);
  decoder.set_transformations(png::Transformations::normalize_to_color8());
  let mut reader = decoder.read_info()?;

  let (width, height, interlaced) = {
    let info = reader.info();
    (info.width, info.height, info.interlaced)
  };
  let channels = reader.output_color_type().0.samples();
  debug!(
    "PNG 逐行降采样: {}x{}, 通道 {}, 隔行 {}, 倍数 {}",
    width, height, channels, interlaced, factor
  );

  let mut acc = BlockAccumulator::new(width, height, factor, budget)?;
  let passes: &[(u32, u32, u32, u32)] = if interlaced {
    &ADAM7_PASSES
  } else {
    &SEQUENTIAL_PASS
  };

  for &(x0, y0, dx, dy) in passes {
    if width <= x0 || height <= y0 {
      continue;
    }
    let pass_width = (width - x0).div_ceil(dx) as usize;
    let pass_height = (height - y0).div_ceil(dy);

    for line in 0..pass_height {
      let row = reader.next_row()?.ok_or(BoundedImageError::Truncated)?;
      let y = y0 + line * dy;
      for (i, px) in row
        .data()
        .chunks_exact(channels)
        .take(pass_width)
        .enumerate()
      {
        acc.add(x0 + i as u32 * dx, y, to_rgb(px));
      }
    }
  }

  Ok(acc.finish())
}

/// 在 DCT 域按 1/2、1/4、1/8 缩放解码 JPEG
///
/// 像素格式无法直接转换为 RGB 时返回 `None`，由调用方回退到完整解码。
pub(super) fn decode_jpeg<R: Read>(
  reader: R,
  factor: u32,
  budget: u64,
) -> Result<Option<RgbImage>, BoundedImageError> {
  let mut decoder = jpeg_decoder::Decoder::new(reader);
  decoder.read_info()?;
  let info = decoder.info().ok_or(BoundedImageError::Truncated)?;

  let channels = match info.pixel_format {
    jpeg_decoder::PixelFormat::L8 => 1,
    jpeg_decoder::PixelFormat::RGB24 => 3,
    other => {
      debug!("JPEG 像素格式 {:?} 不支持缩放解码", other);
      return Ok(None);
    }
  };

  let requested_width = (info.width as u32).div_ceil(factor) as u16;
  let requested_height = (info.height as u32).div_ceil(factor) as u16;
  let (width, height) = decoder.scale(requested_width, requested_height)?;

  let required = width as u64 * height as u64 * channels as u64;
  if required > budget {
    return Err(BoundedImageError::OverBudget { required, budget });
  }
  debug!(
    "JPEG 缩放解码: {}x{} -> {}x{}",
    info.width, info.height, width, height
  );

  let pixels = decoder.decode()?;
  let image = RgbImage::from_fn(width as u32, height as u32, |x, y| {
    let idx = (y as usize * width as usize + x as usize) * channels;
    Rgb(to_rgb(&pixels[idx..idx + channels]))
  });
  Ok(Some(image))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accumulator_averages_blocks() {
    let mut acc = BlockAccumulator::new(4, 2, 2, u64::MAX).unwrap();
    acc.add(0, 0, [0, 0, 0]);
    acc.add(1, 0, [100, 10, 0]);
    acc.add(0, 1, [100, 10, 0]);
    acc.add(1, 1, [200, 20, 0]);
    acc.add(2, 0, [255, 255, 255]);

    let image = acc.finish();
    assert_eq!(image.dimensions(), (2, 1));
    assert_eq!(image.get_pixel(0, 0), &Rgb([100, 10, 0]));
    assert_eq!(image.get_pixel(1, 0), &Rgb([255, 255, 255]));
  }

  #[test]
  fn accumulator_covers_partial_edge_blocks() {
    let acc = BlockAccumulator::new(5, 3, 2, u64::MAX).unwrap();
    assert_eq!((acc.width, acc.height), (3, 2));
  }

  #[test]
  fn accumulator_respects_budget() {
    assert!(matches!(
      BlockAccumulator::new(1000, 1000, 1, 1024),
      Err(BoundedImageError::OverBudget { .. })
    ));
  }

  #[test]
  fn gray_pixels_expand_to_rgb() {
    assert_eq!(to_rgb(&[7]), [7, 7, 7]);
    assert_eq!(to_rgb(&[7, 255]), [7, 7, 7]);
    assert_eq!(to_rgb(&[1, 2, 3, 4]), [1, 2, 3]);
  }
}

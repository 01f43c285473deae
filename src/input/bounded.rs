// 该文件是 Huajian （花鉴） 项目的一部分。
// src/input/bounded.rs - 有界图像加载
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
  fs::File,
  io::{BufRead, BufReader, Cursor, Seek, SeekFrom},
  path::Path,
};

use image::{ImageFormat, ImageReader, Limits, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::debug;

use super::sampled;

/// 默认的最大输出尺寸
pub const DEFAULT_MAX_WIDTH: u32 = 1024;
pub const DEFAULT_MAX_HEIGHT: u32 = 1024;
/// 解码阶段允许分配的最大字节数
pub const DEFAULT_DECODE_BUDGET: u64 = 512 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BoundedImageError {
  #[error("无法打开图像: {0}")]
  Open(#[source] std::io::Error),
  #[error("无法读取图像尺寸: {0}")]
  Header(#[source] image::ImageError),
  #[error("图像解码失败: {0}")]
  Decode(#[source] image::ImageError),
  #[error("图像尺寸无效: {0}x{1}")]
  EmptyImage(u32, u32),
  #[error("PNG 解码失败: {0}")]
  Png(#[from] png::DecodingError),
  #[error("JPEG 解码失败: {0}")]
  Jpeg(#[from] jpeg_decoder::Error),
  #[error("降采样解码需要 {required} 字节，超出预算 {budget} 字节")]
  OverBudget { required: u64, budget: u64 },
  #[error("图像数据不完整")]
  Truncated,
}

/// 计算 2 的幂次降采样倍数
///
/// 只要宽高的一半除以倍数后仍不小于目标尺寸，就将倍数翻倍。
/// 源图像已在范围内时返回 1。
pub fn sample_size(width: u32, height: u32, req_width: u32, req_height: u32) -> u32 {
  let (req_width, req_height) = (req_width.max(1), req_height.max(1));
  let mut sample = 1u32;

  if height > req_height || width > req_width {
    let half_height = height / 2;
    let half_width = width / 2;

    while half_height / sample >= req_height && half_width / sample >= req_width {
      sample *= 2;
    }
  }

  sample
}

/// 在保持宽高比的前提下缩放到不超过上限的尺寸
fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
  if width <= max_width && height <= max_height {
    return (width, height);
  }

  let ratio = f64::min(
    max_width as f64 / width as f64,
    max_height as f64 / height as f64,
  );
  let w = ((width as f64 * ratio).round() as u32).clamp(1, max_width);
  let h = ((height as f64 * ratio).round() as u32).clamp(1, max_height);
  (w, h)
}

/// 加载结果
#[derive(Debug, Clone)]
pub struct LoadedImage {
  pub image: RgbImage,
  /// 源图像声明的尺寸
  pub source_width: u32,
  pub source_height: u32,
  /// 采用的降采样倍数
  pub sample_size: u32,
}

/// 两遍解码的有界图像加载器
///
/// 第一遍只读取图像头中的尺寸，第二遍按降采样倍数解码：
/// PNG 逐行读取并按块平均，JPEG 在 DCT 域缩放，都不会生成全分辨率像素缓冲。
/// 其他格式完整解码，分配受 [`Limits`] 约束，超出预算的图像会报错而不是耗尽内存。
#[derive(Debug, Clone, Copy)]
pub struct BoundedImageLoader {
  max_width: u32,
  max_height: u32,
  decode_budget: u64,
}

impl Default for BoundedImageLoader {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_WIDTH, DEFAULT_MAX_HEIGHT)
  }
}

impl BoundedImageLoader {
  pub fn new(max_width: u32, max_height: u32) -> Self {
    Self {
      max_width: max_width.max(1),
      max_height: max_height.max(1),
      decode_budget: DEFAULT_DECODE_BUDGET,
    }
  }

  pub fn with_decode_budget(mut self, bytes: u64) -> Self {
    self.decode_budget = bytes;
    self
  }

  pub fn bound(&self) -> (u32, u32) {
    (self.max_width, self.max_height)
  }

  pub fn load_path<P: AsRef<Path>>(&self, path: P) -> Result<LoadedImage, BoundedImageError> {
    let file = File::open(path.as_ref()).map_err(BoundedImageError::Open)?;
    self.load_reader(BufReader::new(file))
  }

  pub fn load_bytes(&self, bytes: &[u8]) -> Result<LoadedImage, BoundedImageError> {
    self.load_reader(Cursor::new(bytes))
  }

  pub fn load_reader<R: BufRead + Seek>(
    &self,
    mut reader: R,
  ) -> Result<LoadedImage, BoundedImageError> {
    let header = ImageReader::new(&mut reader)
      .with_guessed_format()
      .map_err(BoundedImageError::Open)?;
    let format = header.format();
    let (source_width, source_height) = header
      .into_dimensions()
      .map_err(BoundedImageError::Header)?;

    if source_width == 0 || source_height == 0 {
      return Err(BoundedImageError::EmptyImage(source_width, source_height));
    }

    let sample = sample_size(source_width, source_height, self.max_width, self.max_height);
    let (width, height) = fit_within(
      source_width.div_ceil(sample),
      source_height.div_ceil(sample),
      self.max_width,
      self.max_height,
    );
    debug!(
      "图像尺寸 {}x{}, 格式 {:?}, 降采样倍数 {}, 输出尺寸 {}x{}",
      source_width, source_height, format, sample, width, height
    );

    reader
      .seek(SeekFrom::Start(0))
      .map_err(BoundedImageError::Open)?;

    let sampled = match format {
      Some(ImageFormat::Png) if sample > 1 => {
        Some(sampled::decode_png(&mut reader, sample, self.decode_budget)?)
      }
      Some(ImageFormat::Jpeg) if sample > 1 => {
        let image = sampled::decode_jpeg(&mut reader, sample, self.decode_budget)?;
        reader
          .seek(SeekFrom::Start(0))
          .map_err(BoundedImageError::Open)?;
        image
      }
      _ => None,
    };

    let decoded = match sampled {
      Some(image) => image,
      None => self.decode_full(&mut reader, source_width, source_height)?,
    };

    let image = if decoded.dimensions() == (width, height) {
      decoded
    } else {
      image::imageops::resize(&decoded, width, height, FilterType::Triangle)
    };

    Ok(LoadedImage {
      image,
      source_width,
      source_height,
      sample_size: sample,
    })
  }

  fn decode_full<R: BufRead + Seek>(
    &self,
    reader: R,
    width: u32,
    height: u32,
  ) -> Result<RgbImage, BoundedImageError> {
    let required = width as u64 * height as u64 * 3;
    if required > self.decode_budget {
      return Err(BoundedImageError::OverBudget {
        required,
        budget: self.decode_budget,
      });
    }

    let mut limits = Limits::default();
    limits.max_alloc = Some(self.decode_budget);

    let mut decoder = ImageReader::new(reader)
      .with_guessed_format()
      .map_err(BoundedImageError::Open)?;
    decoder.limits(limits);
    Ok(decoder.decode().map_err(BoundedImageError::Decode)?.into_rgb8())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{ImageFormat, Rgb};

  fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
      Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
  }

  #[test]
  fn sample_size_is_one_within_bounds() {
    assert_eq!(sample_size(800, 600, 1024, 1024), 1);
    assert_eq!(sample_size(1024, 1024, 1024, 1024), 1);
  }

  #[test]
  fn sample_size_doubles_while_halves_exceed_target() {
    // 半尺寸 2000x1500 均不小于 1024，翻倍一次后 1000 < 1024
    assert_eq!(sample_size(4000, 3000, 1024, 1024), 2);
    assert_eq!(sample_size(8192, 8192, 1024, 1024), 8);
    assert_eq!(sample_size(2048, 2048, 1024, 1024), 2);
    // 只有一边超出时另一边限制倍数
    assert_eq!(sample_size(5000, 900, 1024, 1024), 1);
  }

  #[test]
  fn sample_size_terminates_for_zero_target() {
    assert_eq!(sample_size(16, 16, 0, 0), 16);
  }

  #[test]
  fn fit_within_keeps_aspect_ratio() {
    assert_eq!(fit_within(2000, 1500, 1024, 1024), (1024, 768));
    assert_eq!(fit_within(1500, 3000, 1024, 1024), (512, 1024));
    assert_eq!(fit_within(640, 480, 1024, 1024), (640, 480));
  }

  #[test]
  fn small_image_is_returned_unscaled() {
    let loader = BoundedImageLoader::default();
    let loaded = loader.load_bytes(&png_bytes(320, 200)).unwrap();
    assert_eq!(loaded.sample_size, 1);
    assert_eq!(loaded.image.dimensions(), (320, 200));
    assert_eq!(loaded.image.get_pixel(17, 9), &Rgb([17, 9, 128]));
  }

  #[test]
  fn large_image_is_bounded_and_keeps_aspect() {
    let loader = BoundedImageLoader::new(100, 100);
    let loaded = loader.load_bytes(&png_bytes(450, 300)).unwrap();
    let (w, h) = loaded.image.dimensions();
    assert!(w <= 100 && h <= 100);
    assert_eq!((loaded.source_width, loaded.source_height), (450, 300));
    assert_eq!(loaded.sample_size, 2);
    let source_ratio = 450.0 / 300.0;
    let ratio = w as f64 / h as f64;
    assert!((ratio - source_ratio).abs() < 0.05);
  }

  #[test]
  fn power_of_two_sampling_is_applied() {
    let loader = BoundedImageLoader::new(50, 50);
    let loaded = loader.load_bytes(&png_bytes(400, 200)).unwrap();
    // 半尺寸 200x100，倍数 4 时 50x25 不再满足条件；降采样到 100x50 后再缩放到 50x25
    assert_eq!(loaded.sample_size, 4);
    assert_eq!(loaded.image.dimensions(), (50, 25));
  }

  #[test]
  fn garbage_bytes_fail_to_decode() {
    let loader = BoundedImageLoader::default();
    let result = loader.load_bytes(b"definitely not an image");
    assert!(matches!(result, Err(BoundedImageError::Header(_))));
  }

  #[test]
  fn missing_file_fails_to_open() {
    let loader = BoundedImageLoader::default();
    let result = loader.load_path("/nonexistent/huajian/rose.png");
    assert!(matches!(result, Err(BoundedImageError::Open(_))));
  }

  #[test]
  fn decode_budget_is_enforced() {
    let loader = BoundedImageLoader::new(64, 64).with_decode_budget(1024);
    let result = loader.load_bytes(&png_bytes(256, 256));
    assert!(matches!(result, Err(BoundedImageError::OverBudget { .. })));
  }

  #[test]
  fn full_decode_is_checked_against_budget() {
    let image = RgbImage::from_pixel(256, 256, Rgb([9, 9, 9]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Bmp).unwrap();

    let loader = BoundedImageLoader::new(64, 64).with_decode_budget(1024);
    let result = loader.load_bytes(bytes.get_ref());
    assert!(matches!(
      result,
      Err(BoundedImageError::OverBudget {
        required: 196608,
        budget: 1024
      })
    ));
  }

  #[test]
  fn png_is_sampled_without_full_resolution_buffer() {
    // 全分辨率 RGB 缓冲为 12 MiB，降采样后的累加器只需 256 KiB
    let source = RgbImage::from_fn(2048, 2048, |x, _| {
      if x < 1024 { Rgb([200, 40, 40]) } else { Rgb([40, 40, 200]) }
    });
    let mut bytes = Cursor::new(Vec::new());
    source.write_to(&mut bytes, ImageFormat::Png).unwrap();

    let loader = BoundedImageLoader::new(128, 128).with_decode_budget(4 * 1024 * 1024);
    let loaded = loader.load_bytes(bytes.get_ref()).unwrap();

    assert_eq!(loaded.sample_size, 16);
    assert_eq!(loaded.image.dimensions(), (128, 128));
    assert_eq!(loaded.image.get_pixel(10, 64), &Rgb([200, 40, 40]));
    assert_eq!(loaded.image.get_pixel(120, 64), &Rgb([40, 40, 200]));
  }

  #[test]
  fn jpeg_is_scaled_during_decode() {
    let source = RgbImage::from_pixel(1024, 512, Rgb([180, 90, 30]));
    let mut bytes = Cursor::new(Vec::new());
    source.write_to(&mut bytes, ImageFormat::Jpeg).unwrap();

    // 全分辨率 1.5 MiB，1/4 缩放后 96 KiB
    let loader = BoundedImageLoader::new(100, 100).with_decode_budget(1024 * 1024);
    let loaded = loader.load_bytes(bytes.get_ref()).unwrap();

    assert_eq!(loaded.sample_size, 4);
    assert_eq!(loaded.image.dimensions(), (100, 50));
    let Rgb([r, g, b]) = *loaded.image.get_pixel(50, 25);
    assert!(r.abs_diff(180) < 12 && g.abs_diff(90) < 12 && b.abs_diff(30) < 12);
  }
}

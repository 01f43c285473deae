// 该文件是 Huajian （花鉴） 项目的一部分。
// src/frame.rs - 模型输入/输出张量定义
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

use image::{
  RgbImage,
  imageops::{self, FilterType},
};

pub const RGB_CHANNELS: usize = 3;

/// 检测输出每行的数值个数: left, top, right, bottom, score, class_id
pub const DETECTION_ROW_SIZE: usize = 6;

/// 将图像缩放到 W×H（不保持宽高比），尺寸已一致时直接借用
fn resized<const W: u32, const H: u32>(image: &RgbImage) -> std::borrow::Cow<'_, RgbImage> {
  if image.dimensions() == (W, H) {
    std::borrow::Cow::Borrowed(image)
  } else {
    std::borrow::Cow::Owned(imageops::resize(image, W, H, FilterType::Triangle))
  }
}

/// 8 位 NHWC 帧
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  pub fn from_image(image: &RgbImage) -> Self {
    let data = resized::<W, H>(image).into_owned().into_raw();
    Self {
      data: data.into_boxed_slice(),
    }
  }

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

/// 归一化的 f32 NHWC 张量
///
/// 按行优先排列，每个像素依次为 R、G、B 三个通道，取值为 `sample / 255.0`。
/// 形状为 `1×H×W×3`。
#[derive(Debug, Clone, PartialEq)]
pub struct RgbF32Tensor<const W: u32, const H: u32> {
  data: Box<[f32]>,
}

impl<const W: u32, const H: u32> RgbF32Tensor<W, H> {
  /// 浮点数个数
  pub const LEN: usize = RGB_CHANNELS * W as usize * H as usize;
  /// 字节数
  pub const BYTE_LEN: usize = Self::LEN * std::mem::size_of::<f32>();

  /// 缩放并归一化图像。结果只取决于缩放后的像素，可逐位复现。
  pub fn encode(image: &RgbImage) -> Self {
    let source = resized::<W, H>(image);
    let data: Box<[f32]> = source
      .as_raw()
      .iter()
      .map(|&sample| f32::from(sample) / 255.0)
      .collect();
    debug_assert_eq!(data.len(), Self::LEN);
    Self { data }
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, H as usize, W as usize, RGB_CHANNELS]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  /// 以本机字节序序列化，供推理后端直接读取
  pub fn to_ne_bytes(&self) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(Self::BYTE_LEN);
    for value in self.data.iter() {
      bytes.extend_from_slice(&value.to_ne_bytes());
    }
    bytes
  }
}

/// 固定形状 `1×K×6` 的检测输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTensor<const K: usize> {
  data: Box<[f32]>,
}

impl<const K: usize> Default for DetectionTensor<K> {
  fn default() -> Self {
    Self {
      data: vec![0.0f32; K * DETECTION_ROW_SIZE].into_boxed_slice(),
    }
  }
}

impl<const K: usize> DetectionTensor<K> {
  pub const LEN: usize = K * DETECTION_ROW_SIZE;

  pub fn shape(&self) -> [usize; 3] {
    [1, K, DETECTION_ROW_SIZE]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn as_mut_slice(&mut self) -> &mut [f32] {
    &mut self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn tensor_byte_length_matches_shape() {
    let image = RgbImage::from_pixel(37, 91, Rgb([1, 2, 3]));
    let tensor = RgbF32Tensor::<224, 224>::encode(&image);
    assert_eq!(tensor.as_slice().len(), 224 * 224 * 3);
    assert_eq!(tensor.to_ne_bytes().len(), 4 * 224 * 224 * 3);
    assert_eq!(RgbF32Tensor::<224, 224>::BYTE_LEN, 602_112);
    assert_eq!(tensor.shape(), [1, 224, 224, 3]);
  }

  #[test]
  fn solid_color_encodes_to_normalized_triples() {
    let (r, g, b) = (255u8, 128u8, 7u8);
    let image = RgbImage::from_pixel(8, 8, Rgb([r, g, b]));
    let tensor = RgbF32Tensor::<8, 8>::encode(&image);
    for triple in tensor.as_slice().chunks_exact(3) {
      assert!((triple[0] - r as f32 / 255.0).abs() < 1e-6);
      assert!((triple[1] - g as f32 / 255.0).abs() < 1e-6);
      assert!((triple[2] - b as f32 / 255.0).abs() < 1e-6);
    }
  }

  #[test]
  fn values_stay_in_unit_range_and_are_row_major() {
    let image = RgbImage::from_fn(4, 2, |x, y| Rgb([(x * 60) as u8, (y * 200) as u8, 255]));
    let tensor = RgbF32Tensor::<4, 2>::encode(&image);
    let data = tensor.as_slice();
    assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    // 第 1 行第 3 列的像素
    let offset = (4 + 3) * 3;
    assert!((data[offset] - 180.0 / 255.0).abs() < 1e-6);
    assert!((data[offset + 1] - 200.0 / 255.0).abs() < 1e-6);
    assert_eq!(data[offset + 2], 1.0);
  }

  #[test]
  fn encoding_is_reproducible() {
    let image = RgbImage::from_fn(300, 170, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 9]));
    let a = RgbF32Tensor::<224, 224>::encode(&image);
    let b = RgbF32Tensor::<224, 224>::encode(&image);
    assert_eq!(a.to_ne_bytes(), b.to_ne_bytes());
  }

  #[test]
  fn native_bytes_decode_back() {
    let image = RgbImage::from_pixel(2, 2, Rgb([51, 102, 204]));
    let tensor = RgbF32Tensor::<2, 2>::encode(&image);
    let bytes = tensor.to_ne_bytes();
    let first = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    assert_eq!(first, 51.0 / 255.0);
  }

  #[test]
  fn nhwc_frame_resizes_to_shape() {
    let image = RgbImage::from_pixel(10, 5, Rgb([9, 9, 9]));
    let frame = RgbNhwcFrame::<16, 8>::from_image(&image);
    assert_eq!(frame.as_nhwc().len(), 16 * 8 * 3);
    assert_eq!((frame.width(), frame.height(), frame.channels()), (16, 8, 3));
  }

  #[test]
  fn detection_tensor_is_zeroed() {
    let tensor = DetectionTensor::<10>::default();
    assert_eq!(tensor.as_slice().len(), 60);
    assert_eq!(tensor.shape(), [1, 10, 6]);
    assert!(tensor.as_slice().iter().all(|v| *v == 0.0));
  }
}

// 该文件是 Huajian （花鉴） 项目的一部分。
// src/input.rs - 图像输入
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

use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, url_path};

mod bounded;
mod sampled;
pub use self::bounded::{
  BoundedImageError, BoundedImageLoader, DEFAULT_DECODE_BUDGET, DEFAULT_MAX_HEIGHT,
  DEFAULT_MAX_WIDTH, LoadedImage, sample_size,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("路径编码错误: {0}")]
  PathEncoding(#[from] std::string::FromUtf8Error),
}

/// 一次分析的图像来源
#[derive(Debug, Clone)]
pub enum ImageSource {
  File(PathBuf),
  Memory(Arc<[u8]>),
}

impl FromUrlWithScheme for ImageSource {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageSource {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }

    Ok(ImageSource::File(url_path(url)?))
  }
}

impl From<PathBuf> for ImageSource {
  fn from(path: PathBuf) -> Self {
    ImageSource::File(path)
  }
}

impl From<Vec<u8>> for ImageSource {
  fn from(bytes: Vec<u8>) -> Self {
    ImageSource::Memory(bytes.into())
  }
}

impl ImageSource {
  pub fn load(&self, loader: &BoundedImageLoader) -> Result<LoadedImage, BoundedImageError> {
    match self {
      ImageSource::File(path) => loader.load_path(path),
      ImageSource::Memory(bytes) => loader.load_bytes(bytes),
    }
  }
}

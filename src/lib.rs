// 该文件是 Huajian （花鉴） 项目的一部分。
// src/lib.rs - 库主文件
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

use std::{path::PathBuf, string::FromUtf8Error};

pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 取出 URL 中的文件路径（已做百分号解码）
pub fn url_path(url: &url::Url) -> Result<PathBuf, FromUtf8Error> {
  let path = urlencoding::decode(url.path())?;
  Ok(PathBuf::from(path.into_owned()))
}

/// 取出 URL 查询参数中第一个名为 `key` 的值
pub fn url_query(url: &url::Url, key: &str) -> Option<String> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn url_path_is_percent_decoded() {
    let url = url::Url::parse("image:///tmp/my%20photos/rose.jpg").unwrap();
    assert_eq!(url_path(&url).unwrap(), PathBuf::from("/tmp/my photos/rose.jpg"));
  }

  #[test]
  fn url_query_picks_first_match() {
    let url = url::Url::parse("flower:///m.rknn?labels=/a.txt&labels=/b.txt").unwrap();
    assert_eq!(url_query(&url, "labels").as_deref(), Some("/a.txt"));
    assert_eq!(url_query(&url, "threshold"), None);
  }
}

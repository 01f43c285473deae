// 该文件是 Huajian （花鉴） 项目的一部分。
// src/model/label.rs - 类别标签表
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

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取标签文件 {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("标签文件中没有任何标签")]
  Empty,
  #[error("类别编号 {class_id} 超出标签表范围 [0, {len})，标签表与模型不匹配")]
  IndexOutOfRange { class_id: f32, len: usize },
}

/// 按类别编号索引的只读标签表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  labels: Box<[String]>,
}

impl LabelTable {
  /// 读取换行分隔的标签文件
  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
    let path = path.as_ref();
    info!("加载标签文件: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| LabelError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let table = Self::parse(&text)?;
    debug!("标签数量: {}", table.len());
    Ok(table)
  }

  /// 每行一个标签，按原样保留，只跳过空白行
  pub fn parse(text: &str) -> Result<Self, LabelError> {
    let labels: Box<[String]> = text
      .lines()
      .filter(|line| !line.trim().is_empty())
      .map(str::to_string)
      .collect();

    if labels.is_empty() {
      return Err(LabelError::Empty);
    }

    Ok(Self { labels })
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.labels.get(index).map(String::as_str)
  }

  /// 按模型输出的浮点类别编号查找标签，编号截断取整
  ///
  /// 截断后为负、NaN 或越界的编号都是错误，不会回退到默认标签。
  pub fn lookup(&self, class_id: f32) -> Result<(usize, &str), LabelError> {
    let out_of_range = || LabelError::IndexOutOfRange {
      class_id,
      len: self.labels.len(),
    };

    if class_id.is_nan() || class_id <= -1.0 {
      return Err(out_of_range());
    }

    let index = class_id.trunc() as usize;
    self
      .get(index)
      .map(|label| (index, label))
      .ok_or_else(out_of_range)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_skips_blank_lines() {
    let table = LabelTable::parse("daisy\r\n\n   \ndandelion\nrose\n\n").unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.iter().collect::<Vec<_>>(), ["daisy", "dandelion", "rose"]);
  }

  #[test]
  fn labels_are_kept_as_written() {
    let table = LabelTable::parse(" sun flower \n\tiris\nrose").unwrap();
    assert_eq!(table.get(0), Some(" sun flower "));
    assert_eq!(table.get(1), Some("\tiris"));
    assert_eq!(table.lookup(2.0).unwrap(), (2, "rose"));
  }

  #[test]
  fn empty_file_is_rejected() {
    assert!(matches!(LabelTable::parse("\n \n"), Err(LabelError::Empty)));
  }

  #[test]
  fn lookup_truncates_class_id() {
    let table = LabelTable::parse("daisy\ndandelion\nrose").unwrap();
    assert_eq!(table.lookup(2.0).unwrap(), (2, "rose"));
    assert_eq!(table.lookup(1.9).unwrap(), (1, "dandelion"));
    assert_eq!(table.lookup(0.0).unwrap(), (0, "daisy"));
  }

  #[test]
  fn lookup_out_of_range_fails() {
    let table = LabelTable::parse("daisy\nrose").unwrap();
    assert!(matches!(
      table.lookup(2.0),
      Err(LabelError::IndexOutOfRange { len: 2, .. })
    ));
    assert!(table.lookup(-1.0).is_err());
    assert!(table.lookup(f32::NAN).is_err());
    assert_eq!(table.lookup(-0.5).unwrap(), (0, "daisy"));
  }

  #[test]
  fn missing_file_reports_path() {
    let err = LabelTable::from_file("/nonexistent/labels.txt").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/labels.txt"));
  }
}

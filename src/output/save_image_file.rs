// 该文件是 Huajian （花鉴） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像与检测记录
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

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::Render,
  task::{AnalysisReport, CustomOutcome},
  url_path, url_query,
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("路径无效: {0}")]
  InvalidPath(String),
}

/// 将标注图像写入文件
///
/// `record=true` 时在同一目录写入同名的 `.txt` 摘要与 `.json` 检测记录。
pub struct SaveImageFileOutput {
  path: PathBuf,
  record: bool,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    let path = url_path(uri).map_err(|e| SaveImageFileError::InvalidPath(e.to_string()))?;
    if path.file_name().is_none() {
      return Err(SaveImageFileError::InvalidPath(format!(
        "输出路径缺少文件名: {}",
        path.display()
      )));
    }

    let record = url_query(uri, "record").is_some_and(|v| v == "true" || v == "1");

    Ok(SaveImageFileOutput { path, record })
  }
}

impl SaveImageFileOutput {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self {
      path: path.into(),
      record: false,
    }
  }

  pub fn with_record(mut self, record: bool) -> Self {
    self.record = record;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save_image(&self, image: &image::RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(&self.path)?;
    info!("保存图像到文件: {}", self.path.display());

    Ok(())
  }

  fn save_record(&self, report: &AnalysisReport) -> Result<(), SaveImageFileError> {
    let summary_path = self.path.with_extension("txt");
    std::fs::write(&summary_path, report.summary())?;
    debug!("保存摘要到文件: {}", summary_path.display());

    let (status, flowers) = match &report.flowers {
      CustomOutcome::NotLoaded(reason) => (json!({ "loaded": false, "reason": reason }), vec![]),
      CustomOutcome::Detections(detections) => (
        json!({ "loaded": true }),
        detections
          .iter()
          .map(|d| {
            json!({
              "label": d.label,
              "class_id": d.class_id,
              "score": d.score,
              "bbox": d.bbox.to_array(),
            })
          })
          .collect(),
      ),
    };
    let objects: Vec<_> = report
      .objects
      .iter()
      .map(|bbox| json!({ "bbox": bbox.to_array() }))
      .collect();

    let record = json!({
      "request_id": report.request_id,
      "analyzed_at": report.analyzed_at.to_rfc3339(),
      "source": { "width": report.source_width, "height": report.source_height },
      "image": { "width": report.image.width(), "height": report.image.height() },
      "sample_size": report.sample_size,
      "flower_model": status,
      "flowers": flowers,
      "objects": objects,
    });

    let record_path = self.path.with_extension("json");
    std::fs::write(&record_path, serde_json::to_vec_pretty(&record)?)?;
    debug!("保存检测记录到文件: {}", record_path.display());

    Ok(())
  }
}

impl Render<AnalysisReport> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(&self, report: &AnalysisReport) -> Result<(), Self::Error> {
    self.save_image(&report.image)?;
    if self.record {
      self.save_record(report)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use image::{Rgb, RgbImage};

  use super::*;
  use crate::model::{BoundingBox, Detection};

  fn report(flowers: CustomOutcome) -> AnalysisReport {
    AnalysisReport {
      request_id: 7,
      image: RgbImage::from_pixel(8, 6, Rgb([10, 20, 30])),
      source_width: 16,
      source_height: 12,
      sample_size: 2,
      flowers,
      objects: vec![BoundingBox::new(1.0, 1.0, 4.0, 4.0)],
      analyzed_at: Utc::now(),
    }
  }

  #[test]
  fn url_selects_path_and_record_flag() {
    let url = Url::parse("image:///tmp/out/result%20a.png?record=true").unwrap();
    let output = SaveImageFileOutput::from_url(&url).unwrap();
    assert_eq!(output.path(), Path::new("/tmp/out/result a.png"));
    assert!(output.record);

    let url = Url::parse("image:///tmp/out.png").unwrap();
    assert!(!SaveImageFileOutput::from_url(&url).unwrap().record);

    let url = Url::parse("file:///tmp/out.png").unwrap();
    assert!(matches!(
      SaveImageFileOutput::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn writes_image_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("out.png");
    let output = SaveImageFileOutput::new(&path).with_record(true);

    let detection = Detection {
      bbox: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
      class_id: 1,
      label: "rose".to_string(),
      score: 0.87,
    };
    output
      .render_result(&report(CustomOutcome::Detections(vec![detection])))
      .unwrap();

    let saved = image::open(&path).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (8, 6));
    assert_eq!(saved.get_pixel(0, 0), &Rgb([10, 20, 30]));

    let summary = std::fs::read_to_string(path.with_extension("txt")).unwrap();
    assert_eq!(summary, "rose (0.87)\n");

    let record: serde_json::Value =
      serde_json::from_slice(&std::fs::read(path.with_extension("json")).unwrap()).unwrap();
    assert_eq!(record["request_id"], 7);
    assert_eq!(record["source"]["width"], 16);
    assert_eq!(record["flowers"][0]["label"], "rose");
    assert_eq!(record["flower_model"]["loaded"], true);
    assert_eq!(record["objects"].as_array().unwrap().len(), 1);
  }

  #[test]
  fn record_marks_missing_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    SaveImageFileOutput::new(&path)
      .with_record(true)
      .render_result(&report(CustomOutcome::NotLoaded("missing".to_string())))
      .unwrap();

    let record: serde_json::Value =
      serde_json::from_slice(&std::fs::read(path.with_extension("json")).unwrap()).unwrap();
    assert_eq!(record["flower_model"]["loaded"], false);
    assert!(record["flowers"].as_array().unwrap().is_empty());
  }

  #[test]
  fn record_is_optional() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.png");
    SaveImageFileOutput::new(&path)
      .render_result(&report(CustomOutcome::Detections(vec![])))
      .unwrap();
    assert!(path.exists());
    assert!(!path.with_extension("json").exists());
  }
}

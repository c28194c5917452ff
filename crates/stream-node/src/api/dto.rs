use common::RecordMode;
use serde::Serialize;

use crate::pipeline::{CameraPipeline, PipelineState};

#[derive(Debug, Serialize)]
pub struct StreamDto {
  pub camera_id: String,
  pub camera_name: String,
  pub record_mode: RecordMode,
  pub state: PipelineState,
  pub recording: bool,
  pub areas: usize,
}

impl From<&CameraPipeline> for StreamDto {
  fn from(pipeline: &CameraPipeline) -> Self {
    let camera = pipeline.camera();
    StreamDto {
      camera_id: camera.id,
      camera_name: camera.name,
      record_mode: camera.record_mode,
      state: pipeline.state(),
      recording: pipeline.is_recording(),
      areas: pipeline.regions().len(),
    }
  }
}

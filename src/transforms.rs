// src/transforms.rs

use crate::error::{KfevalError, Result};
use crate::frame_store::{self, FrameIndex};
use log::{debug, info};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const TRANSFORMS_FILE: &str = "transforms.json";

/// Writes a copy of a `transforms.json` whose `frames[]` only holds the
/// selected frame indices. Every other key is carried over as is.
pub fn subset_transforms(original: &Path, selected: &[FrameIndex], output: &Path) -> Result<usize> {
    let content = fs::read_to_string(original)?;
    let mut data: Value = serde_json::from_str(&content)?;

    let frames = data
        .get("frames")
        .and_then(Value::as_array)
        .ok_or_else(|| KfevalError::Parse(format!("{} has no frames array", original.display())))?;
    let wanted: HashSet<FrameIndex> = selected.iter().copied().collect();

    let kept: Vec<Value> = frames
        .iter()
        .filter(|frame| match frame_index(frame) {
            Some(index) => wanted.contains(&index),
            None => {
                debug!("Dropping transform frame without a frame index: {}", frame);
                false
            }
        })
        .cloned()
        .collect();
    let total = frames.len();
    let kept_count = kept.len();
    data["frames"] = Value::Array(kept);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, serde_json::to_string_pretty(&data)?)?;
    info!(
        "Kept {} of {} transform frames in {}",
        kept_count,
        total,
        output.display()
    );
    Ok(kept_count)
}

fn frame_index(frame: &Value) -> Option<FrameIndex> {
    let file_path = frame.get("file_path")?.as_str()?;
    let name = Path::new(file_path).file_name()?.to_str()?;
    frame_store::parse_frame_index(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn keeps_selected_frames_and_other_keys() {
        let dir = tempdir().unwrap();
        let original = dir.path().join(TRANSFORMS_FILE);
        let identity = [[1, 0, 0, 0], [0, 1, 0, 0], [0, 0, 1, 0], [0, 0, 0, 1]];
        let data = json!({
            "w": 1920, "h": 1080, "fl_y": 1000.0,
            "frames": [
                {"file_path": "images/frame_00000.jpg", "transform_matrix": identity},
                {"file_path": "images/frame_00005.jpg", "transform_matrix": identity},
                {"file_path": "images/frame_00010.jpg", "transform_matrix": identity},
                {"file_path": "images/cover.jpg", "transform_matrix": identity},
            ]
        });
        fs::write(&original, data.to_string()).unwrap();

        let output = dir.path().join("subset").join(TRANSFORMS_FILE);
        assert_eq!(subset_transforms(&original, &[5, 10, 15], &output).unwrap(), 2);

        let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(written["w"], 1920);
        assert_eq!(written["fl_y"], 1000.0);
        let paths: Vec<_> = written["frames"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["file_path"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["images/frame_00005.jpg", "images/frame_00010.jpg"]);
    }

    #[test]
    fn missing_frames_array_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let original = dir.path().join(TRANSFORMS_FILE);
        fs::write(&original, r#"{"w": 10}"#).unwrap();
        let err = subset_transforms(&original, &[0], &dir.path().join("out.json")).unwrap_err();
        assert!(matches!(err, KfevalError::Parse(_)));
    }
}

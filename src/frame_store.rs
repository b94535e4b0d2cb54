// src/frame_store.rs

use crate::error::{KfevalError, Result};
use image::{ImageDecoder, ImageReader};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Temporal position of a frame in its source sequence.
pub type FrameIndex = u64;

static FRAME_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>.+)_(?P<index>\d+)\.(?i:jpe?g|png)$").expect("Invalid frame name regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub index: FrameIndex,
    pub path: PathBuf,
    pub height: u32,
    pub width: u32,
    pub channels: u8,
}

impl FrameRecord {
    /// (height, width, channels)
    pub fn shape(&self) -> (u32, u32, u8) {
        (self.height, self.width, self.channels)
    }

    /// Reads the image header to build a record without decoding pixels.
    pub fn probe(index: FrameIndex, path: &Path) -> Result<Self> {
        let (width, height, channels) = probe_header(path)?;
        Ok(FrameRecord {
            index,
            path: path.to_path_buf(),
            height,
            width,
            channels,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOrdering {
    /// Sorted by the integer embedded in `<prefix>_<NNNN>.<ext>`.
    Numeric,
    /// Sorted by file name; indices are positions in that order.
    Lexicographic,
}

/// Frames sorted ascending by index, no duplicate indices.
#[derive(Debug, Clone)]
pub struct Sequence {
    frames: Vec<FrameRecord>,
    ordering: FrameOrdering,
}

impl Sequence {
    pub fn from_records(mut frames: Vec<FrameRecord>) -> Result<Self> {
        frames.sort_by_key(|f| f.index);
        if let Some(dup) = frames.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(KfevalError::Input(format!(
                "Duplicate frame index {} ({} and {})",
                dup[0].index,
                dup[0].path.display(),
                dup[1].path.display()
            )));
        }
        Ok(Sequence {
            frames,
            ordering: FrameOrdering::Numeric,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn ordering(&self) -> FrameOrdering {
        self.ordering
    }

    pub fn indices(&self) -> Vec<FrameIndex> {
        self.frames.iter().map(|f| f.index).collect()
    }
}

/// Decoded frame samples in row-major HWC order, still in the file's value range.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<f32>,
}

impl Raster {
    pub fn shape(&self) -> (u32, u32, u8) {
        (self.height, self.width, self.channels)
    }
}

/// Extracts the trailing `_<NNNN>` index from a frame file name.
pub fn parse_frame_index(file_name: &str) -> Option<FrameIndex> {
    FRAME_NAME_REGEX
        .captures(file_name)
        .and_then(|caps| caps.name("index"))
        .and_then(|m| m.as_str().parse::<FrameIndex>().ok())
}

fn is_frame_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            .unwrap_or(false)
}

/// Lists the frames of a folder in temporal order.
pub fn list_ordered(folder: &Path) -> Result<Sequence> {
    debug!("Listing frames in {}", folder.display());
    let entries = fs::read_dir(folder).map_err(|e| KfevalError::load(folder, e))?;

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| KfevalError::load(folder, e))?.path();
        if !is_frame_file(&path) {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        files.push((name, path));
    }

    let parsed: Option<Vec<FrameIndex>> = files.iter().map(|(name, _)| parse_frame_index(name)).collect();
    let numeric = parsed.filter(|indices| {
        let unique: HashSet<&FrameIndex> = indices.iter().collect();
        unique.len() == indices.len()
    });

    let (mut keyed, ordering): (Vec<(FrameIndex, PathBuf)>, FrameOrdering) = match numeric {
        Some(indices) => (
            indices.into_iter().zip(files.into_iter().map(|(_, p)| p)).collect(),
            FrameOrdering::Numeric,
        ),
        None => {
            files.sort_by(|a, b| a.0.cmp(&b.0));
            (
                files
                    .into_iter()
                    .enumerate()
                    .map(|(i, (_, p))| (i as FrameIndex, p))
                    .collect(),
                FrameOrdering::Lexicographic,
            )
        }
    };
    keyed.sort_by_key(|(index, _)| *index);

    match ordering {
        FrameOrdering::Numeric => info!(
            "{}: {} frames ordered by embedded frame number",
            folder.display(),
            keyed.len()
        ),
        FrameOrdering::Lexicographic => warn!(
            "{}: frames not uniquely numbered, sorting {} frames by filename",
            folder.display(),
            keyed.len()
        ),
    }

    let frames = keyed
        .iter()
        .map(|(index, path)| FrameRecord::probe(*index, path))
        .collect::<Result<Vec<_>>>()?;

    Ok(Sequence { frames, ordering })
}

fn probe_header(path: &Path) -> Result<(u32, u32, u8)> {
    let meta = fs::metadata(path).map_err(|e| KfevalError::load(path, e))?;
    if meta.len() == 0 {
        return Err(KfevalError::load(path, "file is empty"));
    }
    let decoder = ImageReader::open(path)
        .map_err(|e| KfevalError::load(path, e))?
        .with_guessed_format()
        .map_err(|e| KfevalError::load(path, e))?
        .into_decoder()
        .map_err(|e| KfevalError::load(path, e))?;
    let (width, height) = decoder.dimensions();
    let channels = if decoder.color_type().has_color() { 3 } else { 1 };
    Ok((width, height, channels))
}

/// Decodes a frame to 8-bit samples (grayscale or RGB) stored as f32.
pub fn load(record: &FrameRecord) -> Result<Raster> {
    let path = record.path.as_path();
    let meta = fs::metadata(path).map_err(|e| KfevalError::load(path, e))?;
    if meta.len() == 0 {
        return Err(KfevalError::load(path, "file is empty"));
    }
    let img = image::open(path).map_err(|e| KfevalError::load(path, e))?;

    let (width, height, channels, data) = if img.color().has_color() {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        (w, h, 3u8, rgb.into_raw())
    } else {
        let luma = img.to_luma8();
        let (w, h) = luma.dimensions();
        (w, h, 1u8, luma.into_raw())
    };

    if (height, width, channels) != record.shape() {
        return Err(KfevalError::load(
            path,
            format!(
                "decoded shape {:?} differs from listed shape {:?}",
                (height, width, channels),
                record.shape()
            ),
        ));
    }

    Ok(Raster {
        width,
        height,
        channels,
        data: data.into_iter().map(f32::from).collect(),
    })
}

/// Copies frames into `dest`, keeping their file names.
pub fn copy_into(frames: &[FrameRecord], dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)?;
    for frame in frames {
        let name = frame
            .path
            .file_name()
            .ok_or_else(|| KfevalError::Input(format!("Frame path has no file name: {}", frame.path.display())))?;
        fs::copy(&frame.path, dest.join(name))?;
    }
    debug!("Copied {} frames to {}", frames.len(), dest.display());
    Ok(frames.len())
}

// src/align.rs

use crate::error::{KfevalError, Result};
use crate::frame_store::{FrameIndex, FrameRecord, Sequence};
use log::{debug, info, warn};
use std::collections::HashSet;

/// How many mismatched positions to report from each end.
const MISALIGNMENT_SAMPLE: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct AlignedPair {
    pub predicted: FrameRecord,
    pub ground_truth: FrameRecord,
}

/// Positional pairing was used although the frame index labels differ.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMisalignment {
    pub mismatched: usize,
    pub total: usize,
    /// (position, predicted index, ground-truth index)
    pub first: Vec<(usize, FrameIndex, FrameIndex)>,
    pub last: Vec<(usize, FrameIndex, FrameIndex)>,
}

#[derive(Debug, Clone)]
pub struct Alignment {
    pub pairs: Vec<AlignedPair>,
    pub misalignment: Option<IndexMisalignment>,
}

#[derive(Debug, Clone, Default)]
pub struct AlignOptions<'a> {
    /// Restricts ground truth to these indices.
    pub frame_filter: Option<&'a HashSet<FrameIndex>>,
    /// Reverses the predicted sequence end to end.
    pub reverse_pred: bool,
}

pub fn align(pred: &Sequence, gt: &Sequence, options: &AlignOptions<'_>) -> Result<Alignment> {
    let gt_frames: Vec<&FrameRecord> = match options.frame_filter {
        Some(filter) => {
            let kept: Vec<&FrameRecord> = gt.frames().iter().filter(|f| filter.contains(&f.index)).collect();
            debug!("Frame filter kept {} of {} ground-truth frames", kept.len(), gt.len());
            kept
        }
        None => gt.frames().iter().collect(),
    };

    let mut pred_frames: Vec<&FrameRecord> = pred.frames().iter().collect();
    if options.reverse_pred {
        pred_frames.reverse();
    }

    if pred_frames.len() != gt_frames.len() {
        return Err(KfevalError::CountMismatch {
            pred: pred_frames.len(),
            gt: gt_frames.len(),
        });
    }

    for (position, (p, g)) in pred_frames.iter().zip(gt_frames.iter()).enumerate() {
        if p.shape() != g.shape() {
            return Err(KfevalError::ShapeMismatch {
                position,
                pred: p.shape(),
                gt: g.shape(),
            });
        }
    }

    let misalignment = index_misalignment(&pred_frames, &gt_frames);
    if let Some(m) = &misalignment {
        warn!(
            "Frame indices differ at {} of {} positions; pairing by position. First: {:?} Last: {:?}",
            m.mismatched, m.total, m.first, m.last
        );
    }

    let pairs: Vec<AlignedPair> = pred_frames
        .into_iter()
        .zip(gt_frames)
        .map(|(p, g)| AlignedPair {
            predicted: p.clone(),
            ground_truth: g.clone(),
        })
        .collect();
    info!(
        "Aligned {} frame pairs (reverse_pred: {}, filtered: {})",
        pairs.len(),
        options.reverse_pred,
        options.frame_filter.is_some()
    );

    Ok(Alignment { pairs, misalignment })
}

fn index_misalignment(pred: &[&FrameRecord], gt: &[&FrameRecord]) -> Option<IndexMisalignment> {
    let mismatched: Vec<(usize, FrameIndex, FrameIndex)> = pred
        .iter()
        .zip(gt.iter())
        .enumerate()
        .filter(|(_, (p, g))| p.index != g.index)
        .map(|(i, (p, g))| (i, p.index, g.index))
        .collect();
    if mismatched.is_empty() {
        return None;
    }

    let first = mismatched.iter().take(MISALIGNMENT_SAMPLE).copied().collect();
    let skip = mismatched.len().saturating_sub(MISALIGNMENT_SAMPLE);
    let last = mismatched.iter().skip(skip).copied().collect();
    Some(IndexMisalignment {
        mismatched: mismatched.len(),
        total: pred.len(),
        first,
        last,
    })
}

//! estimation — the pose estimator boundary
//!
//! Wraps a pretrained pose ONNX export behind the `PoseEstimator` trait.
//! Per frame: resize to the model's square input, normalize to an NCHW float
//! tensor, run the session, decode the proposal tensor back into frame pixel
//! coordinates, and de-duplicate overlapping detections.
//!
//! The model's internal algorithm is opaque here; decoding its output layout
//! and suppressing duplicates is the whole of this module's claim on it.

use std::cmp::Ordering;
use std::path::Path;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{DecodingMode, DetectionConfig, ModelConfig};
use crate::pose::{Keypoint, Part, Pose, KEYPOINT_COUNT};
use crate::video::RgbFrame;

/// Values per proposal column: 4 box coords + 1 score + (x, y, confidence)
/// per keypoint. The box coords are ignored — pose geometry is derived from
/// keypoints downstream.
const PROPOSAL_ROWS: usize = 5 + 3 * KEYPOINT_COUNT;

/// The estimator seam: one call per loop iteration, never overlapped.
pub trait PoseEstimator {
    fn estimate(&mut self, frame: &RgbFrame, params: &DetectionConfig) -> Result<Vec<Pose>>;
}

/// ONNX Runtime session plus reusable pre-processing buffers.
pub struct OnnxPoseEstimator {
    session: Session,
    input_size: u32,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl OnnxPoseEstimator {
    /// Load the configured model variant. Called once at startup.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let model_path = config.resolve_path();
        let session = build_ort_session(&model_path)?;
        let input_size = config.input_resolution;
        debug!(
            model = %model_path.display(),
            input_size,
            architecture = %config.architecture,
            "pose model loaded"
        );
        Ok(Self {
            session,
            input_size,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (input_size * input_size * 3) as usize],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            self.input_size,
            self.input_size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("input resize failed")?;
        self.resize_buf = dst.into_vec();

        // NCHW float tensor, one plane per channel, scaled to [0, 1].
        let raw = &self.resize_buf;
        let plane = (self.input_size * self.input_size) as usize;
        let mut tensor_data = vec![0f32; 3 * plane];
        tensor_data
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(channel, out)| {
                for (idx, value) in out.iter_mut().enumerate() {
                    *value = raw[idx * 3 + channel] as f32 / 255.0;
                }
            });

        let shape = [1usize, 3, self.input_size as usize, self.input_size as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create input tensor")?
            .into_dyn())
    }
}

impl PoseEstimator for OnnxPoseEstimator {
    fn estimate(&mut self, frame: &RgbFrame, params: &DetectionConfig) -> Result<Vec<Pose>> {
        let input = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input])
            .context("pose inference failed")?;

        let first = outputs
            .iter()
            .next()
            .context("pose model produced no outputs")?
            .1;
        let (shape, data) = first
            .try_extract_tensor::<f32>()
            .context("failed to extract pose output tensor")?;
        anyhow::ensure!(
            shape.len() == 3 && shape[1] as usize == PROPOSAL_ROWS,
            "unexpected pose output shape {shape:?}"
        );
        let proposals = shape[2] as usize;

        let scale = (
            frame.width as f32 / self.input_size as f32,
            frame.height as f32 / self.input_size as f32,
        );
        let candidates = decode_proposals(data, proposals, scale, frame.width as f32, params);
        Ok(suppress_overlapping(
            candidates,
            params.nms_radius,
            max_detections(params),
        ))
    }
}

fn max_detections(params: &DetectionConfig) -> usize {
    match params.decoding {
        DecodingMode::SinglePose => 1,
        DecodingMode::MultiPose => params.max_detections,
    }
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let builder = Session::builder()
        .context("failed to create ORT session builder")?
        .with_intra_threads(2)
        .context("failed to set ORT intra threads")?
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?
        .with_execution_providers([ep::CPUExecutionProvider::default().build()])
        .context("failed to register execution providers")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load pose model {}", model_path.display()))
}

/// Decode the raw `[PROPOSAL_ROWS × proposals]` tensor (column-major across
/// rows) into poses in frame pixel coordinates. Proposals below the score
/// threshold are dropped; keypoint x is mirrored when the flip flag is set.
fn decode_proposals(
    data: &[f32],
    proposals: usize,
    scale: (f32, f32),
    frame_width: f32,
    params: &DetectionConfig,
) -> Vec<Pose> {
    let (scale_x, scale_y) = scale;
    (0..proposals)
        .into_par_iter()
        .filter_map(|i| {
            let score = data[4 * proposals + i];
            if score < params.min_part_confidence {
                return None;
            }
            let keypoints = Part::ALL.map(|part| {
                let row = 5 + 3 * part.index();
                let mut x = data[row * proposals + i] * scale_x;
                let y = data[(row + 1) * proposals + i] * scale_y;
                let confidence = data[(row + 2) * proposals + i];
                if params.flip_horizontal {
                    x = frame_width - 1.0 - x;
                }
                Keypoint {
                    part,
                    x,
                    y,
                    confidence,
                }
            });
            Some(Pose::new(score, keypoints))
        })
        .collect()
}

/// Anchor used for de-duplication: the strongest keypoint's position.
fn pose_anchor(pose: &Pose) -> (f32, f32) {
    let strongest = pose
        .keypoints()
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(Ordering::Equal)
        })
        .expect("poses always carry keypoints");
    (strongest.x, strongest.y)
}

/// Greedy de-duplication: strongest first, drop any candidate whose anchor
/// falls within `radius` pixels of an already-kept pose, stop at
/// `max_detections`.
fn suppress_overlapping(mut candidates: Vec<Pose>, radius: f32, max_detections: usize) -> Vec<Pose> {
    candidates.sort_unstable_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(Ordering::Equal)
    });

    let radius_sq = radius * radius;
    let mut kept: Vec<Pose> = Vec::new();
    let mut anchors: Vec<(f32, f32)> = Vec::new();

    for pose in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let (cx, cy) = pose_anchor(&pose);
        let clash = anchors.iter().any(|&(x, y)| {
            let (dx, dy) = (cx - x, cy - y);
            dx * dx + dy * dy <= radius_sq
        });
        if !clash {
            anchors.push((cx, cy));
            kept.push(pose);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw output buffer with one column per (score, base) pair;
    /// keypoint k sits at (base.0 + k, base.1 + k) with confidence 0.9.
    fn raw_proposals(columns: &[(f32, (f32, f32))]) -> (Vec<f32>, usize) {
        let n = columns.len();
        let mut data = vec![0f32; PROPOSAL_ROWS * n];
        for (i, &(score, (bx, by))) in columns.iter().enumerate() {
            data[4 * n + i] = score;
            for k in 0..KEYPOINT_COUNT {
                let row = 5 + 3 * k;
                data[row * n + i] = bx + k as f32;
                data[(row + 1) * n + i] = by + k as f32;
                data[(row + 2) * n + i] = 0.9;
            }
        }
        (data, n)
    }

    fn params() -> DetectionConfig {
        DetectionConfig {
            flip_horizontal: false,
            ..DetectionConfig::default()
        }
    }

    #[test]
    fn decode_scales_to_frame_coordinates() {
        let (data, n) = raw_proposals(&[(0.8, (10.0, 20.0))]);
        let poses = decode_proposals(&data, n, (2.0, 3.0), 1280.0, &params());
        assert_eq!(poses.len(), 1);
        let nose = poses[0].keypoint(Part::Nose);
        assert_eq!(nose.x, 20.0);
        assert_eq!(nose.y, 60.0);
        assert_eq!(poses[0].score(), 0.8);
    }

    #[test]
    fn decode_drops_proposals_below_threshold() {
        let (data, n) = raw_proposals(&[(0.05, (10.0, 10.0)), (0.8, (100.0, 100.0))]);
        let poses = decode_proposals(&data, n, (1.0, 1.0), 640.0, &params());
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].score(), 0.8);
    }

    #[test]
    fn decode_mirrors_x_when_flipped() {
        let (data, n) = raw_proposals(&[(0.8, (10.0, 20.0))]);
        let flipped = DetectionConfig {
            flip_horizontal: true,
            ..params()
        };
        let poses = decode_proposals(&data, n, (1.0, 1.0), 640.0, &flipped);
        let nose = poses[0].keypoint(Part::Nose);
        assert_eq!(nose.x, 640.0 - 1.0 - 10.0);
        assert_eq!(nose.y, 20.0);
    }

    #[test]
    fn suppression_merges_detections_within_radius() {
        let (data, n) = raw_proposals(&[
            (0.6, (100.0, 100.0)),
            (0.9, (110.0, 100.0)), // 10 px from the first
            (0.7, (400.0, 100.0)),
        ]);
        let candidates = decode_proposals(&data, n, (1.0, 1.0), 640.0, &params());

        let merged = suppress_overlapping(candidates.clone(), 30.0, 5);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].score(), 0.9); // strongest survives
        assert_eq!(merged[1].score(), 0.7);

        let untouched = suppress_overlapping(candidates, 5.0, 5);
        assert_eq!(untouched.len(), 3);
    }

    #[test]
    fn suppression_caps_at_max_detections() {
        let (data, n) = raw_proposals(&[
            (0.6, (100.0, 100.0)),
            (0.9, (300.0, 100.0)),
            (0.7, (500.0, 100.0)),
        ]);
        let candidates = decode_proposals(&data, n, (1.0, 1.0), 640.0, &params());
        let kept = suppress_overlapping(candidates, 30.0, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score(), 0.9);
    }
}

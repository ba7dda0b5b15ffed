//! overlay — draw detection results onto RGB frames
//!
//! The drawing surface is the frame's own RGB24 buffer, wrapped in an
//! `RgbImage` for the duration of a draw call (no clone; the buffer is moved
//! out and back). Which layers are drawn is governed by `OutputConfig`;
//! which poses and keypoints qualify is governed by the detection thresholds.

use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::config::{DetectionConfig, OutputConfig};
use crate::pose::Pose;
use crate::video::RgbFrame;

pub const KEYPOINT_COLOR: [u8; 3] = [0, 255, 255];
pub const SKELETON_COLOR: [u8; 3] = [0, 255, 255];
pub const HEAD_VECTOR_COLOR: [u8; 3] = [255, 0, 255];
pub const BOUNDING_BOX_COLOR: [u8; 3] = [255, 0, 0];

/// Radius of the filled circle drawn per keypoint.
const KEYPOINT_RADIUS: i32 = 4;

/// Flip the frame about its vertical center axis (selfie view). Keypoints
/// mirrored by the estimator land on the same pixels afterwards.
pub fn mirror_inplace(frame: &mut RgbFrame) {
    let row_len = frame.width as usize * 3;
    for row in frame.data.chunks_exact_mut(row_len) {
        let (mut left, mut right) = (0usize, frame.width as usize - 1);
        while left < right {
            for c in 0..3 {
                row.swap(left * 3 + c, right * 3 + c);
            }
            left += 1;
            right -= 1;
        }
    }
}

/// Fill the whole frame with one color.
pub fn clear(frame: &mut RgbFrame, color: [u8; 3]) {
    for pixel in frame.data.chunks_exact_mut(3) {
        pixel.copy_from_slice(&color);
    }
}

/// Draw every qualifying pose onto the frame.
///
/// A pose below `min_pose_confidence` renders nothing at all. Within a
/// qualifying pose, each keypoint (and each skeleton segment endpoint) is
/// gated individually by `min_part_confidence`. Zero qualifying poses is not
/// an error; the frame is simply left as-is.
pub fn render(
    frame: &mut RgbFrame,
    poses: &[Pose],
    detection: &DetectionConfig,
    output: &OutputConfig,
) {
    if !output.show_skeleton && !output.show_points && !output.show_bounding_box {
        return;
    }

    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .expect("valid frame dimensions");

    for pose in poses {
        if pose.score() < detection.min_pose_confidence {
            continue;
        }

        if output.show_points {
            for keypoint in pose.passing_keypoints(detection.min_part_confidence) {
                draw_filled_circle_mut(
                    &mut img,
                    (keypoint.x as i32, keypoint.y as i32),
                    KEYPOINT_RADIUS,
                    Rgb(KEYPOINT_COLOR),
                );
            }
        }

        if output.show_skeleton {
            for (a, b) in pose.segments(detection.min_part_confidence) {
                draw_line_segment_mut(&mut img, (a.x, a.y), (b.x, b.y), Rgb(SKELETON_COLOR));
            }
            if let Some((anchor, tip)) = pose.head_vector(detection.min_part_confidence) {
                draw_line_segment_mut(&mut img, anchor, tip, Rgb(HEAD_VECTOR_COLOR));
            }
        }

        if output.show_bounding_box {
            if let Some(bbox) = pose.bounding_box(detection.min_part_confidence) {
                let rect = Rect::at(bbox.x1 as i32, bbox.y1 as i32).of_size(
                    (bbox.width() as u32).max(1),
                    (bbox.height() as u32).max(1),
                );
                draw_hollow_rect_mut(&mut img, rect, Rgb(BOUNDING_BOX_COLOR));
            }
        }
    }

    frame.data = img.into_raw();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::tests::{uniform_pose, with_confidence, with_position};
    use crate::pose::Part;

    const W: u32 = 200;
    const H: u32 = 200;

    fn black_frame() -> RgbFrame {
        RgbFrame {
            data: vec![0u8; (W * H * 3) as usize],
            width: W,
            height: H,
            pts: 0,
        }
    }

    fn pixel(frame: &RgbFrame, x: u32, y: u32) -> [u8; 3] {
        let at = ((y * frame.width + x) * 3) as usize;
        [frame.data[at], frame.data[at + 1], frame.data[at + 2]]
    }

    fn default_configs() -> (DetectionConfig, OutputConfig) {
        (DetectionConfig::default(), OutputConfig::default())
    }

    #[test]
    fn keypoint_below_part_threshold_is_omitted() {
        // minPose 0.15 / minPart 0.1, pose 0.2, nose@0.05, leftEye@0.5:
        // only the eye is drawn, and nothing derived from the nose is.
        let (detection, output) = default_configs();
        let pose = uniform_pose(0.2, 0.5);
        let pose = with_position(pose, Part::Nose, 30.0, 170.0);
        let pose = with_confidence(pose, Part::Nose, 0.05);
        let pose = with_position(pose, Part::LeftEye, 120.0, 30.0);

        let mut frame = black_frame();
        render(&mut frame, &[pose], &detection, &output);

        assert_eq!(pixel(&frame, 120, 30), KEYPOINT_COLOR);
        assert_eq!(pixel(&frame, 30, 170), [0, 0, 0]);
    }

    #[test]
    fn pose_below_pose_threshold_renders_nothing() {
        let (detection, mut output) = default_configs();
        output.show_bounding_box = true;

        // Keypoints are confident, the pose is not: nothing may be drawn.
        let pose = uniform_pose(0.1, 0.9);
        let mut frame = black_frame();
        render(&mut frame, &[pose], &detection, &output);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn only_passing_poses_render() {
        let detection = DetectionConfig::default();
        let output = OutputConfig {
            show_video: true,
            show_skeleton: false,
            show_points: true,
            show_bounding_box: false,
        };
        let weak = with_position(uniform_pose(0.1, 0.9), Part::Nose, 40.0, 180.0);
        let strong = with_position(uniform_pose(0.3, 0.9), Part::Nose, 150.0, 40.0);

        let mut frame = black_frame();
        render(&mut frame, &[weak, strong], &detection, &output);

        assert_eq!(pixel(&frame, 150, 40), KEYPOINT_COLOR);
        assert_eq!(pixel(&frame, 40, 180), [0, 0, 0]);
    }

    #[test]
    fn bounding_box_outlines_passing_keypoints() {
        let detection = DetectionConfig::default();
        let output = OutputConfig {
            show_video: false,
            show_skeleton: false,
            show_points: false,
            show_bounding_box: true,
        };

        // Keypoints on the diagonal from (0,0) to (150,150), plus one
        // low-confidence outlier at (190,190) that must not widen the box.
        let pose = with_position(uniform_pose(0.9, 0.9), Part::RightAnkle, 190.0, 190.0);
        let pose = with_confidence(pose, Part::RightAnkle, 0.05);
        let mut frame = black_frame();
        render(&mut frame, &[pose], &detection, &output);

        assert_eq!(pixel(&frame, 0, 75), BOUNDING_BOX_COLOR); // left edge
        assert_eq!(pixel(&frame, 75, 0), BOUNDING_BOX_COLOR); // top edge
        assert_eq!(pixel(&frame, 170, 75), [0, 0, 0]); // box stops at the passing set
        assert_eq!(pixel(&frame, 189, 189), [0, 0, 0]); // outlier excluded
    }

    #[test]
    fn toggles_suppress_their_layers() {
        let detection = DetectionConfig::default();
        let output = OutputConfig {
            show_video: true,
            show_skeleton: false,
            show_points: false,
            show_bounding_box: false,
        };
        let mut frame = black_frame();
        render(&mut frame, &[uniform_pose(0.9, 0.9)], &detection, &output);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn mirror_flips_about_the_vertical_axis() {
        let mut frame = RgbFrame {
            data: vec![0u8; 4 * 2 * 3],
            width: 4,
            height: 2,
            pts: 0,
        };
        // Mark (0, 1) red.
        let at = (4 + 0) * 3;
        frame.data[at] = 255;

        mirror_inplace(&mut frame);

        assert_eq!(pixel(&frame, 3, 1), [255, 0, 0]);
        assert_eq!(pixel(&frame, 0, 1), [0, 0, 0]);
    }

    #[test]
    fn clear_fills_the_frame() {
        let mut frame = black_frame();
        clear(&mut frame, [9, 9, 9]);
        assert!(frame.data.chunks_exact(3).all(|p| p == [9, 9, 9]));
    }
}

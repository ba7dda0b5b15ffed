//! pose — detection results and the fixed keypoint layout
//!
//! A `Pose` is one detected person for one frame: an overall confidence score
//! plus exactly one `Keypoint` per recognized body part, in a fixed order.
//! Poses carry no identity across frames.

use serde::{Deserialize, Serialize};

/// Number of recognized body parts per pose.
pub const KEYPOINT_COUNT: usize = 17;

/// Scale applied to the anchor→nose direction when deriving the head vector.
const HEAD_VECTOR_SCALE: f32 = 2.0;

/// Body-part labels, in keypoint-array order.
///
/// Consumers index poses by `Part`, never by raw position, so the enum order
/// is the single source of truth for the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum Part {
    Nose = 0,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl Part {
    /// All parts in keypoint-array order.
    pub const ALL: [Part; KEYPOINT_COUNT] = [
        Part::Nose,
        Part::LeftEye,
        Part::RightEye,
        Part::LeftEar,
        Part::RightEar,
        Part::LeftShoulder,
        Part::RightShoulder,
        Part::LeftElbow,
        Part::RightElbow,
        Part::LeftWrist,
        Part::RightWrist,
        Part::LeftHip,
        Part::RightHip,
        Part::LeftKnee,
        Part::RightKnee,
        Part::LeftAnkle,
        Part::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Part::Nose => "nose",
            Part::LeftEye => "leftEye",
            Part::RightEye => "rightEye",
            Part::LeftEar => "leftEar",
            Part::RightEar => "rightEar",
            Part::LeftShoulder => "leftShoulder",
            Part::RightShoulder => "rightShoulder",
            Part::LeftElbow => "leftElbow",
            Part::RightElbow => "rightElbow",
            Part::LeftWrist => "leftWrist",
            Part::RightWrist => "rightWrist",
            Part::LeftHip => "leftHip",
            Part::RightHip => "rightHip",
            Part::LeftKnee => "leftKnee",
            Part::RightKnee => "rightKnee",
            Part::LeftAnkle => "leftAnkle",
            Part::RightAnkle => "rightAnkle",
        }
    }
}

/// Anatomically adjacent part pairs connected by skeleton segments.
pub const SKELETON: [(Part, Part); 12] = [
    (Part::LeftHip, Part::LeftShoulder),
    (Part::LeftElbow, Part::LeftShoulder),
    (Part::LeftElbow, Part::LeftWrist),
    (Part::LeftHip, Part::LeftKnee),
    (Part::LeftKnee, Part::LeftAnkle),
    (Part::RightHip, Part::RightShoulder),
    (Part::RightElbow, Part::RightShoulder),
    (Part::RightElbow, Part::RightWrist),
    (Part::RightHip, Part::RightKnee),
    (Part::RightKnee, Part::RightAnkle),
    (Part::LeftShoulder, Part::RightShoulder),
    (Part::LeftHip, Part::RightHip),
];

/// One anatomical landmark: position in frame pixel space plus detection
/// confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Keypoint {
    pub part: Part,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn passes(&self, min_confidence: f32) -> bool {
        self.confidence >= min_confidence
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// One detected person in one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pose {
    score: f32,
    keypoints: [Keypoint; KEYPOINT_COUNT],
}

impl Pose {
    /// `keypoints` must be in `Part::ALL` order — one entry per part.
    pub fn new(score: f32, keypoints: [Keypoint; KEYPOINT_COUNT]) -> Self {
        debug_assert!(keypoints
            .iter()
            .zip(Part::ALL)
            .all(|(k, p)| k.part == p));
        Self { score, keypoints }
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn keypoints(&self) -> &[Keypoint; KEYPOINT_COUNT] {
        &self.keypoints
    }

    pub fn keypoint(&self, part: Part) -> &Keypoint {
        &self.keypoints[part.index()]
    }

    /// Keypoints whose own confidence clears `min_confidence`, independent of
    /// the pose score.
    pub fn passing_keypoints(&self, min_confidence: f32) -> impl Iterator<Item = &Keypoint> {
        self.keypoints
            .iter()
            .filter(move |k| k.passes(min_confidence))
    }

    /// Skeleton segments where both endpoints clear `min_confidence`.
    pub fn segments(&self, min_confidence: f32) -> Vec<(&Keypoint, &Keypoint)> {
        SKELETON
            .iter()
            .filter_map(|&(a, b)| {
                let (ka, kb) = (self.keypoint(a), self.keypoint(b));
                (ka.passes(min_confidence) && kb.passes(min_confidence)).then_some((ka, kb))
            })
            .collect()
    }

    /// Tight axis-aligned box over exactly the keypoints that clear
    /// `min_confidence`. `None` when no keypoint passes.
    pub fn bounding_box(&self, min_confidence: f32) -> Option<BBox> {
        let mut passing = self.passing_keypoints(min_confidence);
        let first = passing.next()?;
        let mut bbox = BBox {
            x1: first.x,
            y1: first.y,
            x2: first.x,
            y2: first.y,
        };
        for k in passing {
            bbox.x1 = bbox.x1.min(k.x);
            bbox.y1 = bbox.y1.min(k.y);
            bbox.x2 = bbox.x2.max(k.x);
            bbox.y2 = bbox.y2.max(k.y);
        }
        Some(bbox)
    }

    /// Head-orientation indicator derived from facial keypoints: a segment
    /// from the point between the ears (eyes as fallback) extended through
    /// the nose. `None` when the required facial keypoints fail the filter.
    pub fn head_vector(&self, min_confidence: f32) -> Option<((f32, f32), (f32, f32))> {
        let nose = self.keypoint(Part::Nose);
        if !nose.passes(min_confidence) {
            return None;
        }
        let anchor_pair = [(Part::LeftEar, Part::RightEar), (Part::LeftEye, Part::RightEye)]
            .into_iter()
            .find_map(|(l, r)| {
                let (kl, kr) = (self.keypoint(l), self.keypoint(r));
                (kl.passes(min_confidence) && kr.passes(min_confidence)).then_some((kl, kr))
            })?;
        let ax = (anchor_pair.0.x + anchor_pair.1.x) / 2.0;
        let ay = (anchor_pair.0.y + anchor_pair.1.y) / 2.0;
        let tip = (
            ax + (nose.x - ax) * HEAD_VECTOR_SCALE,
            ay + (nose.y - ay) * HEAD_VECTOR_SCALE,
        );
        Some(((ax, ay), tip))
    }
}

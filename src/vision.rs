//! Body-language metrics contract for camera sessions.
//!
//! Inference runs elsewhere; this crate only consumes the latest frame
//! through a `watch` channel and mirrors it into the session snapshot.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Per-frame metrics. Scores are normalized to `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionFrameMetrics {
    /// Capture time of the frame, milliseconds since session start.
    pub timestamp_ms: u64,
    pub face_detected: bool,
    pub eye_contact: f32,
    pub posture: f32,
    pub gesture_activity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl VisionFrameMetrics {
    /// Scores clamped into range; NaN becomes zero.
    pub fn sanitized(mut self) -> Self {
        for score in [
            &mut self.eye_contact,
            &mut self.posture,
            &mut self.gesture_activity,
        ] {
            *score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        }
        self
    }
}

/// Receiving end of a vision feed. `None` until the first frame.
pub type VisionFeed = watch::Receiver<Option<VisionFrameMetrics>>;

/// Create a feed; the producer publishes with `send_replace(Some(frame))`.
pub fn feed() -> (watch::Sender<Option<VisionFrameMetrics>>, VisionFeed) {
    watch::channel(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_scores() {
        let frame = VisionFrameMetrics {
            eye_contact: 1.4,
            posture: f32::NAN,
            gesture_activity: -0.2,
            ..VisionFrameMetrics::default()
        }
        .sanitized();
        assert_eq!(frame.eye_contact, 1.0);
        assert_eq!(frame.posture, 0.0);
        assert_eq!(frame.gesture_activity, 0.0);
    }

    #[test]
    fn deserializes_without_expression() {
        let frame: VisionFrameMetrics = serde_json::from_str(
            r#"{"timestamp_ms":40,"face_detected":true,"eye_contact":0.8,"posture":0.6,"gesture_activity":0.1}"#,
        )
        .unwrap();
        assert!(frame.face_detected);
        assert_eq!(frame.expression, None);
    }
}

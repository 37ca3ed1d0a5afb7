//! Evidence assembly for a single capture tap.
//!
//! The camera session itself lives outside this crate; it hands over a
//! [`SensorFrame`] snapshot and the tap location. Assembly only copies
//! buffers, it never touches the network or disk.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NutriLensError, Result};

/// Tap location in normalized view coordinates, `(0,0)` top-left to `(1,1)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapPoint {
    pub x: f32,
    pub y: f32,
}

impl TapPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn center() -> Self {
        Self { x: 0.5, y: 0.5 }
    }

    fn in_frame(&self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// World-space coordinate of a raycast hit, in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldPosition {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl WorldPosition {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Row-major depth buffer as delivered by the sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    pub width: usize,
    pub height: usize,
    pub samples: Vec<f32>,
}

impl DepthMap {
    fn is_consistent(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.width.checked_mul(self.height) == Some(self.samples.len())
    }

    /// Depth at a normalized point, nearest-sample.
    pub fn sample_at(&self, tap: TapPoint) -> Option<f32> {
        if !self.is_consistent() || !tap.in_frame() {
            return None;
        }
        let col = ((tap.x * self.width as f32) as usize).min(self.width - 1);
        let row = ((tap.y * self.height as f32) as usize).min(self.height - 1);
        self.samples.get(row * self.width + col).copied()
    }
}

/// The camera session's current frame at tap time.
#[derive(Debug, Clone, Default)]
pub struct SensorFrame {
    /// Encoded still image (JPEG).
    pub image: Option<Vec<u8>>,
    /// `None` on devices without depth sensing.
    pub depth: Option<DepthMap>,
    /// First raycast hit under the tap, if the session resolved one.
    pub raycast_hit: Option<WorldPosition>,
}

/// Immutable bundle of image, depth and position captured at one tap.
///
/// Buffers are reference-counted so the evidence can move into a background
/// request without copying again.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEvidence {
    image_bytes: Arc<[u8]>,
    depth_samples: Arc<[f32]>,
    depth_width: usize,
    depth_height: usize,
    world_position: WorldPosition,
}

impl CaptureEvidence {
    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }

    /// Row-major `width x height` samples; empty when depth was unavailable.
    pub fn depth_samples(&self) -> &[f32] {
        &self.depth_samples
    }

    pub fn depth_dimensions(&self) -> (usize, usize) {
        (self.depth_width, self.depth_height)
    }

    pub fn has_depth(&self) -> bool {
        !self.depth_samples.is_empty()
    }

    pub fn world_position(&self) -> WorldPosition {
        self.world_position
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureCoordinator;

impl CaptureCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot the frame's buffers into evidence for the given tap.
    ///
    /// Fails with `CaptureUnavailable` when there is no image or the tap lies
    /// outside the view. Missing or inconsistent depth degrades to an empty
    /// depth sequence instead of failing.
    pub fn capture(&self, tap: TapPoint, frame: &SensorFrame) -> Result<CaptureEvidence> {
        if !tap.in_frame() {
            return Err(NutriLensError::CaptureUnavailable(format!(
                "tap ({}, {}) is outside the frame",
                tap.x, tap.y
            )));
        }

        let image = match frame.image.as_deref() {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                return Err(NutriLensError::CaptureUnavailable(
                    "no image in current frame".into(),
                ))
            }
        };

        let (depth_samples, depth_width, depth_height): (Arc<[f32]>, usize, usize) =
            match &frame.depth {
                Some(map) if map.is_consistent() => {
                    (Arc::from(map.samples.as_slice()), map.width, map.height)
                }
                Some(map) => {
                    tracing::warn!(
                        width = map.width,
                        height = map.height,
                        samples = map.samples.len(),
                        "depth buffer size mismatch, capturing without depth"
                    );
                    (Arc::from(Vec::new()), 0, 0)
                }
                None => {
                    tracing::debug!("no depth in current frame");
                    (Arc::from(Vec::new()), 0, 0)
                }
            };

        let world_position = frame.raycast_hit.unwrap_or_else(|| {
            tracing::debug!("no raycast hit under tap, using origin");
            WorldPosition::default()
        });

        Ok(CaptureEvidence {
            image_bytes: Arc::from(image),
            depth_samples,
            depth_width,
            depth_height,
            world_position,
        })
    }
}

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Enrollment number identifying one registered person.
pub type EnrollmentId = i64;

/// Grayscale pixel grid indexed as `[row, col]`.
pub type PixelGrid = Array2<u8>;

/// A registered person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub enrollment_id: EnrollmentId,
    pub display_name: String,
}

/// One captured face crop belonging to an enrolled identity.
#[derive(Debug, Clone)]
pub struct FaceSample {
    pub enrollment_id: EnrollmentId,
    pub pixels: PixelGrid,
    /// 1-based position in the identity's capture sequence.
    pub sample_index: u32,
}

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Output of a recognizer for one face crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Closest enrolled identity.
    pub enrollment_id: EnrollmentId,
    /// Distance to that identity's nearest sample. Lower = more similar.
    pub confidence: f64,
}

impl Prediction {
    /// A prediction counts as a match only when strictly below the threshold.
    pub fn is_match(&self, threshold: f64) -> bool {
        self.confidence < threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_is_strictly_below_threshold() {
        let p = Prediction { enrollment_id: 7, confidence: 40.0 };
        assert!(p.is_match(70.0));

        let at = Prediction { enrollment_id: 7, confidence: 70.0 };
        assert!(!at.is_match(70.0));

        let above = Prediction { enrollment_id: 7, confidence: 112.5 };
        assert!(!above.is_match(70.0));
    }

    #[test]
    fn test_region_area() {
        let r = Region { x: 5, y: 5, width: 40, height: 30 };
        assert_eq!(r.area(), 1200);
    }
}

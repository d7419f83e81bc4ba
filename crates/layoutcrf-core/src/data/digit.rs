//! Small square image records for the capsule classifier.

use serde::{Deserialize, Serialize};

use super::font::to_unit_pixels;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitRecord {
    /// `image_size * image_size` grayscale bytes.
    pub image: Vec<u8>,
    pub label: u32,
}

impl DigitRecord {
    pub fn pixels(&self, image_size: usize) -> Result<Vec<f32>> {
        to_unit_pixels(&self.image, image_size * image_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixels_are_scaled() {
        let record = DigitRecord {
            image: vec![0, 51, 102, 255],
            label: 3,
        };
        assert_eq!(record.pixels(2).unwrap(), vec![0.0, 0.2, 0.4, 1.0]);
        assert!(record.pixels(3).is_err());
    }
}

//! Glyph image records for OCR.

use serde::{Deserialize, Serialize};

use crate::error::{LayoutError, Result};

/// Side of the square glyph images.
pub const GLYPH_SIZE: usize = 64;

/// A raw 64x64 single-channel glyph and its text label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FontRecord {
    #[serde(rename = "image/encoded", default)]
    pub image: Vec<u8>,
    #[serde(rename = "image/class/text", default)]
    pub text: String,
}

impl FontRecord {
    /// Pixels as floats in `[0, 1]`.
    pub fn pixels(&self) -> Result<Vec<f32>> {
        to_unit_pixels(&self.image, GLYPH_SIZE * GLYPH_SIZE)
    }
}

/// Scale raw bytes to `[0, 1]`, checking the pixel count.
pub fn to_unit_pixels(bytes: &[u8], expected: usize) -> Result<Vec<f32>> {
    if bytes.len() != expected {
        return Err(LayoutError::Data(format!(
            "image has {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    Ok(bytes.iter().map(|&b| b as f32 / 255.0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_follow_example_keys() {
        let json = format!(
            r#"{{"image/encoded": {:?}, "image/class/text": "元"}}"#,
            vec![255u8; GLYPH_SIZE * GLYPH_SIZE]
        );
        let record: FontRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.text, "元");
        let pixels = record.pixels().unwrap();
        assert_eq!(pixels.len(), 4096);
        assert_eq!(pixels[0], 1.0);
    }

    #[test]
    fn wrong_size_is_error() {
        let record = FontRecord {
            image: vec![0; 10],
            text: "a".into(),
        };
        assert!(record.pixels().is_err());
    }
}

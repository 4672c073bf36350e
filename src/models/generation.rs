use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::credential::Credential;

/// The output dimensions accepted by the image API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSize {
    #[serde(rename = "1024x1024")]
    Square,
    #[serde(rename = "1024x1536")]
    Portrait,
    #[serde(rename = "1536x1024")]
    Landscape,
    #[serde(rename = "auto")]
    Auto,
}

impl ImageSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::Square => "1024x1024",
            ImageSize::Portrait => "1024x1536",
            ImageSize::Landscape => "1536x1024",
            ImageSize::Auto => "auto",
        }
    }
}

impl FromStr for ImageSize {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1024x1024" | "square" => Ok(ImageSize::Square),
            "1024x1536" | "portrait" => Ok(ImageSize::Portrait),
            "1536x1024" | "landscape" => Ok(ImageSize::Landscape),
            "auto" => Ok(ImageSize::Auto),
            other => Err(AppError::Validation(format!("Unsupported image size: {}", other))),
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The rendering quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Low,
    Medium,
    High,
    Auto,
}

impl ImageQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageQuality::Low => "low",
            ImageQuality::Medium => "medium",
            ImageQuality::High => "high",
            ImageQuality::Auto => "auto",
        }
    }
}

impl FromStr for ImageQuality {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(ImageQuality::Low),
            "medium" => Ok(ImageQuality::Medium),
            "high" => Ok(ImageQuality::High),
            "auto" => Ok(ImageQuality::Auto),
            other => Err(AppError::Validation(format!("Unsupported image quality: {}", other))),
        }
    }
}

/// Caller-supplied overrides, all optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamOverrides {
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub count: Option<u8>,
}

/// Fully resolved parameters for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationParams {
    pub model: String,
    pub size: ImageSize,
    pub quality: ImageQuality,
    pub count: u8,
}

/// The largest `n` a single generation may request.
pub const MAX_IMAGE_COUNT: u8 = 4;

impl GenerationParams {
    /// Default parameters for the configured model.
    pub fn defaults(model: &str) -> Self {
        Self {
            model: model.to_string(),
            size: ImageSize::Square,
            quality: ImageQuality::Auto,
            count: 1,
        }
    }

    /// Applies overrides on top of `self`.
    ///
    /// # Arguments
    ///
    /// * `overrides` - The caller's requested parameters.
    ///
    /// # Returns
    ///
    /// The resolved parameters, or a validation error for unknown values.
    pub fn resolve(mut self, overrides: &ParamOverrides) -> Result<Self, AppError> {
        if let Some(model) = overrides.model.as_deref().map(str::trim) {
            if model.is_empty() {
                return Err(AppError::Validation("Model must not be empty".to_string()));
            }
            self.model = model.to_string();
        }
        if let Some(size) = overrides.size.as_deref() {
            self.size = size.parse()?;
        }
        if let Some(quality) = overrides.quality.as_deref() {
            self.quality = quality.parse()?;
        }
        if let Some(count) = overrides.count {
            if count == 0 || count > MAX_IMAGE_COUNT {
                return Err(AppError::Validation(format!(
                    "Image count must be between 1 and {}",
                    MAX_IMAGE_COUNT
                )));
            }
            self.count = count;
        }
        Ok(self)
    }
}

/// Everything a job runner needs for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub session_id: Uuid,
    pub prompt: String,
    pub reference_image_ids: Vec<String>,
    pub params: GenerationParams,
    pub credential: Credential,
}

/// A generated image held in memory until the session expires.
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
}

impl GeneratedImage {
    /// Wraps raw image bytes, sniffing their content type.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mime_type = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_else(|| "image/png".to_string());

        Self {
            bytes: Arc::new(bytes),
            mime_type,
        }
    }
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_defaults() {
        let overrides = ParamOverrides {
            model: None,
            size: Some("portrait".to_string()),
            quality: Some("high".to_string()),
            count: Some(2),
        };

        let params = GenerationParams::defaults("gpt-image-1").resolve(&overrides).unwrap();

        assert_eq!(params.model, "gpt-image-1");
        assert_eq!(params.size, ImageSize::Portrait);
        assert_eq!(params.quality, ImageQuality::High);
        assert_eq!(params.count, 2);
    }

    #[test]
    fn unknown_size_is_rejected() {
        let overrides = ParamOverrides {
            size: Some("640x480".to_string()),
            ..Default::default()
        };

        let result = GenerationParams::defaults("gpt-image-1").resolve(&overrides);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn count_out_of_range_is_rejected() {
        let overrides = ParamOverrides {
            count: Some(5),
            ..Default::default()
        };

        assert!(GenerationParams::defaults("m").resolve(&overrides).is_err());
    }

    #[test]
    fn png_bytes_are_sniffed() {
        let png_header = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(GeneratedImage::from_bytes(png_header).mime_type, "image/png");

        let jpeg_header = vec![0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(GeneratedImage::from_bytes(jpeg_header).mime_type, "image/jpeg");
    }
}

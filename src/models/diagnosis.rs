use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use serde::{ Serialize, Deserialize };
use thiserror::Error;

/// Structured answer of the crop diagnosis call. All three fields are required;
/// anything else in the reply is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisResult {
    pub disease: String,
    pub description: String,
    pub remedy: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Image must be sent as a base64 data URL")]
    InvalidDataUrl,
    #[error("Unsupported file type '{0}'. Please upload an image.")]
    UnsupportedMime(String),
    #[error("Image is too large ({size} bytes, limit is {limit} bytes)")]
    TooLarge { size: usize, limit: usize },
    #[error("Image data is not valid base64: {0}")]
    Base64(String),
    #[error("Image is empty")]
    Empty,
}

/// An image picked by the user, together with its declared MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageUpload {
    bytes: Vec<u8>,
    mime_type: String,
}

impl std::fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUpload")
            .field("mime_type", &self.mime_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Result<Self, ImageError> {
        let mime_type = mime_type.into().trim().to_ascii_lowercase();
        if !mime_type.starts_with("image/") || mime_type.len() == "image/".len() {
            return Err(ImageError::UnsupportedMime(mime_type));
        }
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self { bytes, mime_type })
    }

    /// Parses a `data:<mime>;base64,<payload>` URL, the shape a browser
    /// `FileReader.readAsDataURL` produces.
    pub fn from_data_url(data_url: &str) -> Result<Self, ImageError> {
        let rest = data_url.trim().strip_prefix("data:").ok_or(ImageError::InvalidDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(ImageError::InvalidDataUrl)?;
        let mut params = header.split(';');
        let mime_type = params.next().unwrap_or_default();
        if !params.any(|p| p.eq_ignore_ascii_case("base64")) {
            return Err(ImageError::InvalidDataUrl);
        }
        let bytes = STANDARD.decode(payload.trim()).map_err(|e| ImageError::Base64(e.to_string()))?;
        Self::new(bytes, mime_type)
    }

    pub fn ensure_within(&self, limit: usize) -> Result<(), ImageError> {
        if self.bytes.len() > limit {
            return Err(ImageError::TooLarge { size: self.bytes.len(), limit });
        }
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_browser_data_url() {
        let image = ImageUpload::from_data_url("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(image.mime_type(), "image/png");
        assert_eq!(image.bytes(), &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]);
        assert_eq!(image.to_base64(), "iVBORw0KGgo=");
    }

    #[test]
    fn rejects_non_image_mime() {
        let err = ImageUpload::from_data_url("data:application/pdf;base64,JVBERi0=").unwrap_err();
        assert_eq!(err, ImageError::UnsupportedMime("application/pdf".to_string()));
    }

    #[test]
    fn rejects_url_without_base64_marker() {
        assert_eq!(
            ImageUpload::from_data_url("data:image/png,rawbytes").unwrap_err(),
            ImageError::InvalidDataUrl
        );
        assert_eq!(ImageUpload::from_data_url("image/png;base64,AAAA").unwrap_err(), ImageError::InvalidDataUrl);
    }

    #[test]
    fn rejects_bad_base64() {
        let err = ImageUpload::from_data_url("data:image/jpeg;base64,@@@").unwrap_err();
        assert!(matches!(err, ImageError::Base64(_)));
    }

    #[test]
    fn enforces_size_limit() {
        let image = ImageUpload::new(vec![1, 2, 3, 4], "image/jpeg").unwrap();
        assert!(image.ensure_within(4).is_ok());
        assert_eq!(image.ensure_within(3).unwrap_err(), ImageError::TooLarge { size: 4, limit: 3 });
    }

    #[test]
    fn diagnosis_ignores_extra_fields() {
        let parsed: DiagnosisResult = serde_json::from_str(
            r#"{"disease":"Rust","description":"Orange pustules","remedy":"- Neem oil","confidence":0.8}"#
        ).unwrap();
        assert_eq!(parsed.disease, "Rust");
        assert_eq!(parsed.remedy, "- Neem oil");
    }
}

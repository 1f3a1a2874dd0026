use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Raw image bytes paired with their mime type.
///
/// This is the unit the gateway sends and receives; stored history blobs are
/// materialized back into `ImageData` at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "image/png")
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// Transient reference handle for embedders that render inline images.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }

    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .context("data URL must start with 'data:'")?;
        let Some((mime_type, encoded)) = rest.split_once(";base64,") else {
            bail!("data URL is not base64-encoded");
        };
        if mime_type.is_empty() {
            bail!("data URL has an empty mime type");
        }
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .context("data URL payload is not valid base64")?;
        Ok(Self::new(bytes, mime_type))
    }
}

/// An image the user selected for the current session. Never persisted as-is;
/// only the `GenerationRecord`s derived from it survive the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputItem {
    pub data: ImageData,
    pub display_name: String,
}

impl InputItem {
    pub fn new(data: ImageData, display_name: impl Into<String>) -> Self {
        Self {
            data,
            display_name: display_name.into(),
        }
    }
}

/// The partial record handed to [`crate::history::HistoryStore::append`].
/// The store assigns the id and the creation timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewGeneration {
    pub image: Option<ImageData>,
    pub secondary_image: Option<ImageData>,
    pub video: Option<Vec<u8>>,
    pub text: Option<String>,
    pub original_filename: Option<String>,
}

/// One persisted unit of generation history. Immutable once written; removed
/// only by a full history clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub id: i64,
    pub image: Option<ImageData>,
    pub secondary_image: Option<ImageData>,
    pub video: Option<Vec<u8>>,
    pub text: Option<String>,
    pub original_filename: Option<String>,
    pub timestamp_ms: i64,
}

/// Output of a single pipeline stage. Consumed either as the final artifact
/// or as the next stage's primary input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub image: ImageData,
    /// Intermediate artifact from a two-step run (e.g. the line art).
    pub intermediate: Option<ImageData>,
    pub text: Option<String>,
    pub source_filename: Option<String>,
    /// History id when the record was durably saved.
    pub record_id: Option<i64>,
    /// Set when generation succeeded but the history write failed; the
    /// artifact is still usable for the current session.
    pub save_error: Option<String>,
}

impl StageResult {
    pub fn persisted(&self) -> bool {
        self.record_id.is_some()
    }
}

/// Aggregate outcome of a batch run over independent input items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub success_count: usize,
    pub fail_count: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.success_count + self.fail_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_round_trip() -> Result<()> {
        let image = ImageData::new(vec![0x89, 0x50, 0x4e, 0x47], "image/png");
        let url = image.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(ImageData::from_data_url(&url)?, image);
        Ok(())
    }

    #[test]
    fn from_data_url_rejects_malformed_input() {
        assert!(ImageData::from_data_url("image/png;base64,AAAA").is_err());
        assert!(ImageData::from_data_url("data:image/png,plain").is_err());
        assert!(ImageData::from_data_url("data:;base64,AAAA").is_err());
        assert!(ImageData::from_data_url("data:image/png;base64,not base64!").is_err());
    }

    #[test]
    fn batch_summary_totals() {
        let summary = BatchSummary {
            success_count: 3,
            fail_count: 2,
        };
        assert_eq!(summary.total(), 5);
    }
}

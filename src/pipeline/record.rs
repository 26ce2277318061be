//! Image records and their captioning lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Unprocessed,
    Processing,
    Processed,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Unprocessed => "unprocessed",
            ImageStatus::Processing => "processing",
            ImageStatus::Processed => "processed",
            ImageStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unprocessed" => Some(ImageStatus::Unprocessed),
            "processing" => Some(ImageStatus::Processing),
            "processed" => Some(ImageStatus::Processed),
            "error" => Some(ImageStatus::Error),
            _ => None,
        }
    }

    /// Single-letter marker for list output.
    pub fn short_name(&self) -> &'static str {
        match self {
            ImageStatus::Unprocessed => "-",
            ImageStatus::Processing => "~",
            ImageStatus::Processed => "+",
            ImageStatus::Error => "!",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    /// Locator understood by the asset source and the captioning provider.
    pub source_ref: String,
    pub file_name: String,
    pub status: ImageStatus,
    pub caption: Option<String>,
    pub detailed_caption: Option<String>,
    pub error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Creation time reported by the asset source, if it came from a scan.
    pub captured_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub fn new(
        id: impl Into<String>,
        source_ref: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            file_name: file_name.into(),
            status: ImageStatus::Unprocessed,
            caption: None,
            detailed_caption: None,
            error: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: Utc::now(),
            captured_at: None,
        }
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = Some(captured_at);
        self
    }

    /// Timestamp dedup compares against.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.captured_at.unwrap_or(self.created_at)
    }

    fn expect_status(&self, allowed: &[ImageStatus], to: ImageStatus) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(PipelineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[ImageStatus::Unprocessed], ImageStatus::Processing)?;
        self.status = ImageStatus::Processing;
        self.processing_started_at = Some(now);
        Ok(())
    }

    pub fn complete(&mut self, caption: &str, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[ImageStatus::Processing], ImageStatus::Processed)?;
        let caption = caption.trim();
        if caption.is_empty() {
            return Err(PipelineError::ProviderEmptyResult);
        }
        self.status = ImageStatus::Processed;
        self.caption = Some(caption.to_string());
        self.error = None;
        self.processing_completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.expect_status(&[ImageStatus::Processing], ImageStatus::Error)?;
        self.status = ImageStatus::Error;
        self.caption = None;
        self.error = Some(reason.into());
        self.processing_completed_at = Some(now);
        Ok(())
    }

    /// Undo `begin_processing` when the attempt never reached the provider
    /// in a usable state. The record looks as if it had never been dequeued.
    pub fn release(&mut self) -> Result<()> {
        self.expect_status(&[ImageStatus::Processing], ImageStatus::Unprocessed)?;
        self.status = ImageStatus::Unprocessed;
        self.processing_started_at = None;
        Ok(())
    }

    /// Reset to `unprocessed`, discarding every generated result.
    pub fn reprocess(&mut self) -> Result<()> {
        self.expect_status(
            &[ImageStatus::Processed, ImageStatus::Error],
            ImageStatus::Unprocessed,
        )?;
        self.status = ImageStatus::Unprocessed;
        self.caption = None;
        self.detailed_caption = None;
        self.error = None;
        self.processing_started_at = None;
        self.processing_completed_at = None;
        Ok(())
    }

    /// Attach the long caption. Never changes status.
    pub fn set_detailed_caption(&mut self, text: &str) -> Result<()> {
        self.expect_status(&[ImageStatus::Processed], ImageStatus::Processed)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::ProviderEmptyResult);
        }
        self.detailed_caption = Some(text.to_string());
        Ok(())
    }
}

/// Ordered set of records, newest first, unique by id.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<ImageRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted records, keeping the first occurrence of each id.
    pub fn from_records(records: Vec<ImageRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            if store.contains(&record.id) {
                tracing::warn!(id = %record.id, "Dropping duplicate persisted record");
                continue;
            }
            store.records.push(record);
        }
        store
    }

    /// Insert at the front. Returns false if the id is already present.
    pub fn insert(&mut self, record: ImageRecord) -> bool {
        if self.contains(&record.id) {
            return false;
        }
        self.records.insert(0, record);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ImageRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut ImageRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    pub fn find_by_source(&self, source_ref: &str) -> Option<&ImageRecord> {
        self.records.iter().find(|r| r.source_ref == source_ref)
    }

    pub fn remove(&mut self, id: &str) -> Option<ImageRecord> {
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records left in `processing` by a run that never finished.
    pub fn stale_processing(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status == ImageStatus::Processing)
            .map(|r| r.id.clone())
            .collect()
    }
}

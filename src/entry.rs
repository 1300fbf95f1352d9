//! Diary entry record, draft, and field validation.

use serde::{Deserialize, Serialize};

use crate::{
    core::store::StoreError,
    types::{
        EntryId, Identity, MAX_LATITUDE, MAX_LONGITUDE, MIN_LATITUDE, MIN_LONGITUDE, MicroDegrees,
        Timestamp,
    },
};

/// Maximum title length in Unicode scalar values.
pub const MAX_TITLE_CHARS: usize = 100;
/// Maximum description length in Unicode scalar values.
pub const MAX_DESCRIPTION_CHARS: usize = 500;
/// Maximum audio reference length in Unicode scalar values.
pub const MAX_AUDIO_URL_CHARS: usize = 256;

/// Fully materialized, authoritative diary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable entry identifier.
    pub id: EntryId,
    /// Account that created the entry. Never changes.
    pub creator: Identity,
    /// Short title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Opaque media reference.
    pub audio_url: String,
    /// Latitude in micro-degrees.
    pub latitude: MicroDegrees,
    /// Longitude in micro-degrees.
    pub longitude: MicroDegrees,
    /// Creation time, set once by the substrate clock.
    pub created_at: Timestamp,
    /// When true, any identity may read the entry.
    pub is_public: bool,
}

impl Entry {
    /// Returns the creator-mutable fields of this entry.
    pub fn draft(&self) -> EntryDraft {
        EntryDraft {
            title: self.title.clone(),
            description: self.description.clone(),
            audio_url: self.audio_url.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            is_public: self.is_public,
        }
    }

    /// Replaces every mutable field, leaving `id`, `creator` and `created_at` intact.
    pub fn apply_draft(&mut self, draft: EntryDraft) {
        self.title = draft.title;
        self.description = draft.description;
        self.audio_url = draft.audio_url;
        self.latitude = draft.latitude;
        self.longitude = draft.longitude;
        self.is_public = draft.is_public;
    }
}

/// Creator-supplied fields used by both create and update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    /// Short title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Opaque media reference.
    pub audio_url: String,
    /// Latitude in micro-degrees.
    pub latitude: MicroDegrees,
    /// Longitude in micro-degrees.
    pub longitude: MicroDegrees,
    /// Visibility flag.
    pub is_public: bool,
}

impl EntryDraft {
    /// Checks coordinates first, then text bounds.
    pub fn validate(&self) -> Result<(), StoreError> {
        if !valid_coordinates(self.latitude, self.longitude) {
            return Err(StoreError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        check_len("title", &self.title, MAX_TITLE_CHARS)?;
        check_len("description", &self.description, MAX_DESCRIPTION_CHARS)?;
        check_len("audio_url", &self.audio_url, MAX_AUDIO_URL_CHARS)?;
        Ok(())
    }

    pub(crate) fn into_entry(self, id: EntryId, creator: Identity, created_at: Timestamp) -> Entry {
        Entry {
            id,
            creator,
            title: self.title,
            description: self.description,
            audio_url: self.audio_url,
            latitude: self.latitude,
            longitude: self.longitude,
            created_at,
            is_public: self.is_public,
        }
    }
}

/// True iff both values lie inside the inclusive geographic bounds.
pub fn valid_coordinates(latitude: MicroDegrees, longitude: MicroDegrees) -> bool {
    (MIN_LATITUDE..=MAX_LATITUDE).contains(&latitude)
        && (MIN_LONGITUDE..=MAX_LONGITUDE).contains(&longitude)
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), StoreError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(StoreError::FieldTooLong { field, max, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(lat: MicroDegrees, lng: MicroDegrees) -> EntryDraft {
        EntryDraft {
            title: "harbor".to_string(),
            description: String::new(),
            audio_url: "ipfs://clip".to_string(),
            latitude: lat,
            longitude: lng,
            is_public: false,
        }
    }

    #[test]
    fn coordinate_bounds_are_inclusive() {
        assert!(valid_coordinates(MAX_LATITUDE, MAX_LONGITUDE));
        assert!(valid_coordinates(MIN_LATITUDE, MIN_LONGITUDE));
        assert!(valid_coordinates(0, 0));
        assert!(!valid_coordinates(MAX_LATITUDE + 1, 0));
        assert!(!valid_coordinates(MIN_LATITUDE - 1, 0));
        assert!(!valid_coordinates(0, MAX_LONGITUDE + 1));
        assert!(!valid_coordinates(0, MIN_LONGITUDE - 1));
    }

    #[test]
    fn coordinates_are_checked_before_text() {
        let mut d = draft(91_000_000, 0);
        d.title = "x".repeat(MAX_TITLE_CHARS + 1);
        assert!(matches!(d.validate(), Err(StoreError::InvalidCoordinates { .. })));
    }

    #[test]
    fn text_bounds_count_scalar_values() {
        let mut d = draft(0, 0);
        d.title = "é".repeat(MAX_TITLE_CHARS);
        assert!(d.validate().is_ok());

        d.title.push('é');
        assert_eq!(
            d.validate(),
            Err(StoreError::FieldTooLong {
                field: "title",
                max: MAX_TITLE_CHARS,
                actual: MAX_TITLE_CHARS + 1,
            })
        );

        let mut d = draft(0, 0);
        d.audio_url = "a".repeat(MAX_AUDIO_URL_CHARS + 1);
        assert!(matches!(
            d.validate(),
            Err(StoreError::FieldTooLong { field: "audio_url", .. })
        ));
    }
}

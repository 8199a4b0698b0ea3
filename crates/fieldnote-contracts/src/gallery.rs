use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

use crate::chat::Transcript;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub image: String,
    pub description: String,
}

/// File-backed gallery of identified organisms.
///
/// The backing file holds the full entry list as a 4-space-indented JSON
/// array and is rewritten wholesale on every save. Single interactive
/// session assumed: no locking, concurrent writers race and the last one
/// wins.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all entries. A missing file is an empty gallery; any other
    /// read or parse failure propagates.
    pub fn load(&self) -> Result<Vec<GalleryEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed reading gallery file ({})", self.path.display())
                })
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing gallery file ({})", self.path.display()))
    }

    pub fn save(&self, entries: &[GalleryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut bytes = Vec::new();
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut bytes, formatter);
        entries
            .serialize(&mut serializer)
            .context("failed serializing gallery entries")?;
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("failed writing gallery file ({})", self.path.display()))?;
        Ok(())
    }

    /// Drains the transcript's described photo turns into the store:
    /// load, append entries whose image text is not already present,
    /// save, return the merged list.
    ///
    /// The dedup key is the image text alone, so an existing entry keeps
    /// its original description even when the transcript carries a newer
    /// one for the same image. Re-running with an unchanged transcript
    /// adds nothing.
    pub fn fold(&self, transcript: &Transcript) -> Result<Vec<GalleryEntry>> {
        let mut entries = self.load()?;
        for (image, description) in transcript.described_photos() {
            if entries.iter().any(|entry| entry.image == image) {
                continue;
            }
            entries.push(GalleryEntry {
                image: image.to_string(),
                description: description.to_string(),
            });
        }
        self.save(&entries)?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use crate::chat::{ChatTurn, Transcript};

    use super::{GalleryEntry, GalleryStore};

    fn described_photo(image: &str, description: &str) -> ChatTurn {
        let mut turn = ChatTurn::user_photo(image);
        turn.description = Some(description.to_string());
        turn
    }

    #[test]
    fn load_missing_file_is_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GalleryStore::new(temp.path().join("gallery_data.json"));
        assert_eq!(store.load()?, Vec::new());
        Ok(())
    }

    #[test]
    fn load_propagates_parse_failures() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery_data.json");
        std::fs::write(&path, "not json")?;
        assert!(GalleryStore::new(path).load().is_err());
        Ok(())
    }

    #[test]
    fn save_writes_four_space_indented_json() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("gallery_data.json");
        let store = GalleryStore::new(&path);
        store.save(&[GalleryEntry {
            image: "B1".to_string(),
            description: "a heron".to_string(),
        }])?;

        let raw = std::fs::read_to_string(&path)?;
        assert!(raw.contains("\n    {"));
        assert!(raw.contains("\n        \"image\": \"B1\""));
        assert_eq!(store.load()?.len(), 1);
        Ok(())
    }

    #[test]
    fn fold_single_described_photo_into_empty_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GalleryStore::new(temp.path().join("gallery_data.json"));
        let mut transcript = Transcript::new();
        transcript.push(described_photo("B1", "D1"));

        let entries = store.fold(&transcript)?;
        assert_eq!(
            entries,
            vec![GalleryEntry {
                image: "B1".to_string(),
                description: "D1".to_string(),
            }]
        );
        assert_eq!(store.load()?, entries);
        Ok(())
    }

    #[test]
    fn fold_twice_with_unchanged_transcript_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GalleryStore::new(temp.path().join("gallery_data.json"));
        let mut transcript = Transcript::new();
        transcript.push(described_photo("B1", "D1"));

        store.fold(&transcript)?;
        let entries = store.fold(&transcript)?;
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn fold_appends_new_image_after_existing_entries() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GalleryStore::new(temp.path().join("gallery_data.json"));
        store.save(&[GalleryEntry {
            image: "B1".to_string(),
            description: "D1".to_string(),
        }])?;

        let mut transcript = Transcript::new();
        transcript.push(described_photo("B2", "D2"));
        let entries = store.fold(&transcript)?;

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image, "B1");
        assert_eq!(entries[1].image, "B2");
        Ok(())
    }

    #[test]
    fn fold_keeps_existing_description_for_same_image() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = GalleryStore::new(temp.path().join("gallery_data.json"));
        store.save(&[GalleryEntry {
            image: "B1".to_string(),
            description: "D1".to_string(),
        }])?;

        let mut transcript = Transcript::new();
        transcript.push(described_photo("B1", "D2"));
        let entries = store.fold(&transcript)?;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, "D1");
        Ok(())
    }
}

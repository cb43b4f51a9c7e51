use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::audio::types::TrackStructure;

/// Stable track id: a content address of the absolute media path.
pub fn track_id(path: &Path) -> String {
    let canonical = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let digest = blake3::hash(canonical.to_string_lossy().as_bytes());
    digest.to_hex()[..16].to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    structures: HashMap<String, TrackStructure>,
    /// Milliseconds since the epoch of the last write.
    last_updated: u64,
}

/// On-disk cache of analyzed track structures.
///
/// One JSON document keyed by track id; corrupt or missing files reset to an
/// empty cache rather than failing a load. Writes go through a temp file and
/// an atomic rename.
pub struct StructureCache {
    path: PathBuf,
    data: CacheFile,
}

impl StructureCache {
    pub fn open(path: PathBuf) -> Self {
        let data = match File::open(&path) {
            Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!(
                        "Cache: '{}' unreadable ({}); starting empty",
                        path.display(),
                        e
                    );
                    CacheFile::default()
                }
            },
            Err(_) => CacheFile::default(),
        };
        log::debug!(
            "Cache: opened '{}' with {} structures",
            path.display(),
            data.structures.len()
        );
        Self { path, data }
    }

    pub fn get(&self, track_id: &str) -> Option<&TrackStructure> {
        self.data.structures.get(track_id)
    }

    pub fn insert(&mut self, track_id: String, structure: TrackStructure) {
        self.data.structures.insert(track_id, structure);
    }

    pub fn len(&self) -> usize {
        self.data.structures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.structures.is_empty()
    }

    /// Persists the cache atomically (write temp, then rename).
    pub fn save(&mut self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.data.last_updated = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let temp = self.path.with_extension("json.tmp");
        {
            let file = File::create(&temp)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer(writer, &self.data)?;
        }
        fs::rename(&temp, &self.path)?;
        log::debug!("Cache: saved {} structures", self.data.structures.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::TrackSection;

    fn structure() -> TrackStructure {
        TrackStructure {
            bpm: 128.0,
            beats: vec![0.0, 0.469, 0.938],
            intro: TrackSection {
                start: 0.0,
                end: 7.5,
                beats: 16,
            },
            main: TrackSection {
                start: 7.5,
                end: 52.5,
                beats: 96,
            },
            outro: TrackSection {
                start: 52.5,
                end: 60.0,
                beats: 16,
            },
            hot_cues: vec![0.0, 7.5, 52.5],
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = std::env::temp_dir().join(format!("duodeck-cache-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("structures.json");

        let mut cache = StructureCache::open(path.clone());
        assert!(cache.is_empty());
        cache.insert("abc123".to_string(), structure());
        cache.save().unwrap();

        let reloaded = StructureCache::open(path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("abc123"), Some(&structure()));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_cache_resets_to_empty() {
        let dir = std::env::temp_dir().join(format!("duodeck-cache-bad-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("structures.json");
        fs::write(&path, b"{not json").unwrap();

        let cache = StructureCache::open(path);
        assert!(cache.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn track_ids_are_stable_and_distinct() {
        let a = track_id(Path::new("/music/one.mp3"));
        let b = track_id(Path::new("/music/two.mp3"));
        assert_eq!(a, track_id(Path::new("/music/one.mp3")));
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}

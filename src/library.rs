use std::path::{Path, PathBuf};

use crate::audio::errors::ControlError;
use crate::audio::types::TrackInfo;
use crate::cache::{self, StructureCache};

const AUDIO_EXTENSIONS: [&str; 4] = ["mp3", "flac", "wav", "m4a"];

/// File-system backed track library.
///
/// Workspaces are the sub-directories of a music root (the root itself is the
/// default workspace); tracks are the audio files inside the selected
/// workspace. Durations and tempos are backfilled from the structure cache
/// once a track has been analyzed.
pub struct Library {
    root: PathBuf,
    selected: Option<String>,
}

impl Library {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            selected: None,
        }
    }

    pub fn workspaces(&self) -> Vec<String> {
        let mut names = vec![".".to_string()];
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        if !name.starts_with('.') {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    pub fn select_workspace(&mut self, name: &str) -> Result<(), ControlError> {
        if name == "." {
            self.selected = None;
            return Ok(());
        }
        let candidate = self.root.join(name);
        if candidate.is_dir() {
            self.selected = Some(name.to_string());
            log::info!("Library: workspace '{}' selected", name);
            Ok(())
        } else {
            Err(ControlError::UnknownWorkspace(name.to_string()))
        }
    }

    pub fn selected_workspace(&self) -> &str {
        self.selected.as_deref().unwrap_or(".")
    }

    fn workspace_dir(&self) -> PathBuf {
        match &self.selected {
            Some(name) => self.root.join(name),
            None => self.root.clone(),
        }
    }

    /// Lists the tracks of the selected workspace in name order.
    pub fn tracks(&self, cache: &StructureCache) -> Vec<TrackInfo> {
        let mut tracks = Vec::new();
        let dir = self.workspace_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            log::warn!("Library: cannot read '{}'", dir.display());
            return tracks;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_audio_file(&path) {
                continue;
            }
            tracks.push(track_info(&path, cache));
        }
        tracks.sort_by(|a, b| a.title.cmp(&b.title));
        tracks
    }

    /// Resolves a track id back to its descriptor.
    pub fn find(&self, id: &str, cache: &StructureCache) -> Result<TrackInfo, ControlError> {
        self.tracks(cache)
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ControlError::UnknownTrack(id.to_string()))
    }
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            AUDIO_EXTENSIONS.iter().any(|&known| known == ext)
        })
        .unwrap_or(false)
}

fn track_info(path: &Path, cache: &StructureCache) -> TrackInfo {
    let id = cache::track_id(path);
    let structure = cache.get(&id);
    TrackInfo {
        title: path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string(),
        path: path.to_string_lossy().to_string(),
        duration_seconds: structure.map(|s| s.outro.end),
        bpm: structure.map(|s| s.bpm as f32),
        structure: structure.cloned(),
        id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_library() -> (PathBuf, Library) {
        let root = std::env::temp_dir().join(format!("duodeck-lib-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("crates")).unwrap();
        std::fs::write(root.join("one.mp3"), b"x").unwrap();
        std::fs::write(root.join("two.flac"), b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();
        std::fs::write(root.join("crates").join("three.mp3"), b"x").unwrap();
        (root.clone(), Library::new(root))
    }

    #[test]
    fn lists_only_audio_files() {
        let (root, library) = scratch_library();
        let cache = StructureCache::open(root.join("structures.json"));
        let tracks = library.tracks(&cache);
        let titles: Vec<_> = tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["one", "two"]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn workspace_selection_switches_directory() {
        let (root, mut library) = scratch_library();
        let cache = StructureCache::open(root.join("structures.json"));

        assert!(library.workspaces().contains(&"crates".to_string()));
        library.select_workspace("crates").unwrap();
        let titles: Vec<_> = library
            .tracks(&cache)
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["three"]);

        assert!(matches!(
            library.select_workspace("missing"),
            Err(ControlError::UnknownWorkspace(_))
        ));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn find_resolves_by_id() {
        let (root, library) = scratch_library();
        let cache = StructureCache::open(root.join("structures.json"));
        let tracks = library.tracks(&cache);
        let found = library.find(&tracks[0].id, &cache).unwrap();
        assert_eq!(found.title, tracks[0].title);
        assert!(library.find("nope", &cache).is_err());
        let _ = std::fs::remove_dir_all(&root);
    }
}

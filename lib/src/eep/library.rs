//! Loading and lookup of EEP profile definitions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use super::profile::{EepProfile, ProfileSummary};

#[derive(Debug, Error)]
enum ProfileLoadError {
    #[error("couldn't read file: {0}")]
    Read(#[from] std::io::Error),
    #[error("couldn't parse profile: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Immutable set of profiles, loaded once at startup.
pub struct EepLibrary {
    profiles: HashMap<String, Arc<EepProfile>>,
}

impl EepLibrary {
    /// Scan the roots in order, recursively, for `*.json` profile files.
    /// Later roots override earlier ones on duplicate `eep` keys, which is
    /// how user-supplied definitions beat the bundled library. Unparsable
    /// files are logged and skipped.
    pub fn load(roots: &[PathBuf]) -> Self {
        let mut profiles = HashMap::new();
        for root in roots {
            if !root.is_dir() {
                continue;
            }
            info!("scanning {} for EEP definitions", root.display());
            let mut files = Vec::new();
            collect_json_files(root, &mut files);
            files.sort();
            for path in files {
                match load_profile(&path) {
                    Ok(profile) => {
                        profiles.insert(profile.eep.clone(), Arc::new(profile));
                    }
                    Err(e) => warn!("skipping {}: {e}", path.display()),
                }
            }
        }
        info!("loaded {} EEP profiles", profiles.len());
        EepLibrary { profiles }
    }

    /// Build a library from in-memory profiles, later entries overriding.
    pub fn from_profiles<I: IntoIterator<Item = EepProfile>>(profiles: I) -> Self {
        EepLibrary {
            profiles: profiles
                .into_iter()
                .map(|p| (p.eep.clone(), Arc::new(p)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn get(&self, eep: &str) -> Option<Arc<EepProfile>> {
        self.profiles.get(eep).cloned()
    }

    /// Profile summaries sorted by EEP code.
    pub fn list(&self) -> Vec<ProfileSummary> {
        let mut summaries: Vec<ProfileSummary> =
            self.profiles.values().map(|p| p.summary()).collect();
        summaries.sort_by(|a, b| a.eep.cmp(&b.eep));
        summaries
    }

    pub fn by_rorg(&self, rorg: u8) -> Vec<Arc<EepProfile>> {
        let mut matches: Vec<Arc<EepProfile>> = self
            .profiles
            .values()
            .filter(|p| p.rorg() == Some(rorg))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.eep.cmp(&b.eep));
        matches
    }

    /// Case-insensitive substring search over EEP code, title and
    /// manufacturer.
    pub fn search(&self, query: &str) -> Vec<ProfileSummary> {
        let query = query.to_lowercase();
        let mut summaries: Vec<ProfileSummary> = self
            .profiles
            .values()
            .filter(|p| {
                p.eep.to_lowercase().contains(&query)
                    || p.type_title.to_lowercase().contains(&query)
                    || p.manufacturer.to_lowercase().contains(&query)
            })
            .map(|p| p.summary())
            .collect();
        summaries.sort_by(|a, b| a.eep.cmp(&b.eep));
        summaries
    }
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        warn!("couldn't list {}", dir.display());
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_json_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
}

fn load_profile(path: &Path) -> Result<EepProfile, ProfileLoadError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_profile(dir: &Path, name: &str, eep: &str, title: &str) {
        let contents = serde_json::json!({
            "eep": eep,
            "rorg_number": format!("0x{}", &eep[..2]),
            "type_title": title,
            "manufacturer": "EnOcean",
        });
        std::fs::write(dir.join(name), contents.to_string()).unwrap();
    }

    #[test]
    fn test_load_recursive_and_sorted_listing() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a5");
        std::fs::create_dir(&nested).unwrap();
        write_profile(root.path(), "f6.json", "F6-02-01", "Rocker Switch");
        write_profile(&nested, "a5.json", "A5-02-05", "Temperature Sensor");
        std::fs::write(root.path().join("readme.txt"), "not a profile").unwrap();

        let library = EepLibrary::load(&[root.path().to_path_buf()]);
        assert_eq!(library.len(), 2);
        let listed: Vec<String> = library.list().into_iter().map(|s| s.eep).collect();
        assert_eq!(listed, ["A5-02-05", "F6-02-01"]);
        assert_eq!(library.by_rorg(0xA5).len(), 1);
        assert_eq!(library.by_rorg(0xD5).len(), 0);
    }

    #[test]
    fn test_later_roots_override_earlier() {
        let bundled = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_profile(bundled.path(), "a5.json", "A5-02-05", "Bundled title");
        write_profile(user.path(), "mine.json", "A5-02-05", "My override");

        let library = EepLibrary::load(&[
            bundled.path().to_path_buf(),
            user.path().to_path_buf(),
        ]);
        assert_eq!(library.len(), 1);
        assert_eq!(library.get("A5-02-05").unwrap().type_title, "My override");
    }

    #[test]
    fn test_bad_json_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_profile(root.path(), "good.json", "D5-00-01", "Contact");
        std::fs::write(root.path().join("bad.json"), "{ not json").unwrap();

        let library = EepLibrary::load(&[root.path().to_path_buf()]);
        assert_eq!(library.len(), 1);
        assert!(library.get("D5-00-01").is_some());
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let root = tempfile::tempdir().unwrap();
        write_profile(root.path(), "a5.json", "A5-02-05", "Temperature Sensor");
        write_profile(root.path(), "f6.json", "F6-02-01", "Rocker Switch");

        let library = EepLibrary::load(&[root.path().to_path_buf()]);
        assert_eq!(library.search("temperature").len(), 1);
        assert_eq!(library.search("ROCKER").len(), 1);
        assert_eq!(library.search("a5-02").len(), 1);
        assert_eq!(library.search("enocean").len(), 2);
        assert!(library.search("zigbee").is_empty());
    }

    #[test]
    fn test_missing_root_is_tolerated() {
        let library = EepLibrary::load(&[PathBuf::from("/nonexistent/eep")]);
        assert!(library.is_empty());
    }
}

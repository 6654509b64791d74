use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Image files under `folder` whose extension (case-insensitive) is listed,
/// sorted by path
pub fn discover_images(folder: &Path, recursive: bool, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        return Err(anyhow!("Not a directory: {}", folder.display()));
    }

    let mut walker = WalkDir::new(folder).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut images: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| has_extension(entry.path(), extensions))
        .map(|entry| entry.into_path())
        .collect();

    // Sort by path for consistent ordering
    images.sort();

    Ok(images)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn extensions() -> Vec<String> {
        vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let images = discover_images(dir.path(), true, &extensions()).unwrap();
        assert_eq!(images.len(), 3);
        assert!(images.windows(2).all(|w| w[0] <= w[1]));

        let top_level = discover_images(dir.path(), false, &extensions()).unwrap();
        assert_eq!(top_level.len(), 2);
    }

    #[test]
    fn test_missing_folder_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(discover_images(&dir.path().join("nope"), true, &extensions()).is_err());
    }
}

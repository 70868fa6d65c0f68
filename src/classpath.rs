//! Classpath resolution: directories and `.jar` archives searched in
//! order for `name.class`.  First hit wins.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ClasspathError {
    #[error("cannot open archive {path}: {source}")]
    BadArchive {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} has no Main-Class in its manifest")]
    NoMainClass { path: String },
}

enum Entry {
    Dir(PathBuf),
    Jar(PathBuf, ZipArchive<File>),
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Dir(path) => write!(f, "Dir({})", path.display()),
            Entry::Jar(path, _) => write!(f, "Jar({})", path.display()),
        }
    }
}

/// The ordered search path.
#[derive(Debug, Default)]
pub struct ClassPath {
    entries: Vec<Entry>,
}

impl ClassPath {
    /// Builds a search path; unopenable archive entries are dropped
    /// with a warning rather than failing the whole path.
    pub fn from_paths(paths: &[PathBuf]) -> ClassPath {
        let mut entries = Vec::new();
        for path in paths {
            if path.is_dir() {
                entries.push(Entry::Dir(path.clone()));
            } else if path.extension().is_some_and(|e| e == "jar" || e == "zip") {
                match open_archive(path) {
                    Ok(archive) => entries.push(Entry::Jar(path.clone(), archive)),
                    Err(e) => warn!("skipping classpath entry: {e}"),
                }
            } else {
                warn!("skipping classpath entry {}: not a directory or archive", path.display());
            }
        }
        ClassPath { entries }
    }

    /// Searches for the `.class` resource of an internal-form class
    /// name.
    pub fn find(&mut self, name: &str) -> Option<Vec<u8>> {
        let resource = format!("{name}.class");
        for entry in &mut self.entries {
            match entry {
                Entry::Dir(dir) => {
                    let candidate = dir.join(&resource);
                    if let Ok(mut file) = File::open(&candidate) {
                        let mut bytes = Vec::new();
                        if file.read_to_end(&mut bytes).is_ok() {
                            debug!("{name} found at {}", candidate.display());
                            return Some(bytes);
                        }
                    }
                }
                Entry::Jar(path, archive) => {
                    if let Ok(mut zipped) = archive.by_name(&resource) {
                        let mut bytes = Vec::new();
                        if zipped.read_to_end(&mut bytes).is_ok() {
                            debug!("{name} found in {}", path.display());
                            return Some(bytes);
                        }
                    }
                }
            }
        }
        None
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, ClasspathError> {
    let file = File::open(path).map_err(|source| ClasspathError::Io {
        path: path.display().to_string(),
        source,
    })?;
    ZipArchive::new(file).map_err(|source| ClasspathError::BadArchive {
        path: path.display().to_string(),
        source,
    })
}

/// Reads the `Main-Class` attribute of a jar's manifest, converted to
/// internal form.
pub fn jar_main_class(path: &Path) -> Result<String, ClasspathError> {
    let mut archive = open_archive(path)?;
    let mut manifest = String::new();
    archive
        .by_name("META-INF/MANIFEST.MF")
        .map_err(|source| ClasspathError::BadArchive {
            path: path.display().to_string(),
            source,
        })?
        .read_to_string(&mut manifest)
        .map_err(|source| ClasspathError::Io {
            path: path.display().to_string(),
            source,
        })?;

    manifest
        .lines()
        .find_map(|line| line.strip_prefix("Main-Class:"))
        .map(|main| main.trim().replace('.', "/"))
        .ok_or_else(|| ClasspathError::NoMainClass {
            path: path.display().to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_search_finds_class_bytes() {
        let dir = std::env::temp_dir().join("lungo_cp_test");
        let pkg = dir.join("demo");
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("Thing.class"), [0xCA, 0xFE, 0xBA, 0xBE]).unwrap();

        let mut cp = ClassPath::from_paths(&[dir.clone()]);
        assert_eq!(cp.find("demo/Thing").unwrap(), [0xCA, 0xFE, 0xBA, 0xBE]);
        assert!(cp.find("demo/Missing").is_none());

        std::fs::remove_dir_all(dir).unwrap();
    }
}

use std::io;
use std::path::{Path, PathBuf};

/// File access keyed by logical path.
pub trait Storage {
    fn load_file(&self, logical_path: &str) -> io::Result<Vec<u8>>;
    fn save_file(&self, logical_path: &str, data: &[u8]) -> io::Result<()>;
    fn file_exists(&self, logical_path: &str) -> bool;
}

/// Local filesystem storage rooted at a data directory.
///
/// Relative logical paths resolve under the root; absolute paths and `~/`
/// paths are used as given.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$XDG_DATA_HOME/ChessCoach`, falling back to `$HOME/.local/share/ChessCoach`.
    pub fn from_env() -> Self {
        let data_home = std::env::var_os("XDG_DATA_HOME")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".local/share"));
        Self::new(data_home.join("ChessCoach"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, logical_path: &str) -> PathBuf {
        let path = match logical_path.strip_prefix("~/") {
            Some(rest) => home_dir().join(rest),
            None => PathBuf::from(logical_path),
        };
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Storage for LocalStorage {
    fn load_file(&self, logical_path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(logical_path))
    }

    fn save_file(&self, logical_path: &str, data: &[u8]) -> io::Result<()> {
        let path = self.resolve(logical_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        tracing::debug!("Wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn file_exists(&self, logical_path: &str) -> bool {
        self.resolve(logical_path).exists()
    }
}

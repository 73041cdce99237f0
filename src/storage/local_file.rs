//! Files of the local backend that prune their empty parent directories on delete.

use bytes::Bytes;
use log::debug;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A file plus the number of parent directories it may remove once they are empty.
#[derive(Debug, Clone)]
pub struct StorageFile {
    path: PathBuf,
    depth: usize,
}

impl StorageFile {
    pub fn new(path: PathBuf, depth: usize) -> Self {
        Self { path, depth }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> Result<Option<Bytes>> {
        match fs::read(&self.path) {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, content: &[u8]) -> Result<()> {
        self.ensure_parent()?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn move_to(&self, destination: &StorageFile) -> Result<()> {
        destination.ensure_parent()?;
        fs::rename(&self.path, &destination.path)?;
        self.delete()?;
        Ok(())
    }

    pub fn copy_to(&self, destination: &StorageFile) -> Result<()> {
        destination.ensure_parent()?;
        fs::copy(&self.path, &destination.path)?;
        Ok(())
    }

    /// Removes the file, then every empty parent up to `depth` levels.
    pub fn delete(&self) -> Result<bool> {
        let existed = match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let mut directory = self.path.parent();
        let mut depth = self.depth;

        while depth > 0 {
            let Some(current) = directory else { break };

            let is_empty = match fs::read_dir(current) {
                Ok(mut entries) => entries.next().is_none(),
                Err(_) => break,
            };

            if !is_empty {
                break;
            }

            debug!("Pruning empty directory {}", current.display());
            match fs::remove_dir(current) {
                Ok(()) => {}
                // a concurrent writer may have just populated it
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(_) => break,
            }

            depth -= 1;
            directory = current.parent();
        }

        Ok(existed)
    }
}

/// Marker recording the current owner of a package slot, one line of plain text.
#[derive(Debug, Clone)]
pub struct LinkFile {
    file: StorageFile,
}

impl LinkFile {
    pub fn new(path: PathBuf, depth: usize) -> Self {
        Self {
            file: StorageFile::new(path, depth),
        }
    }

    pub fn exists(&self) -> bool {
        self.file.exists()
    }

    pub fn retrieve(&self) -> Result<Option<String>> {
        Ok(self.file.read()?.map(|content| {
            String::from_utf8_lossy(&content)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string()
        }))
    }

    pub fn store(&self, user_name: &str) -> Result<()> {
        self.file.write(format!("{}\n", user_name).as_bytes())
    }

    pub fn delete(&self) -> Result<bool> {
        self.file.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_delete_prunes_up_to_depth() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("a").join("b").join("c").join("file.txt");
        let file = StorageFile::new(path, 2);

        file.write(b"content").unwrap();
        assert!(file.exists());
        assert!(file.delete().unwrap());

        assert!(!root.path().join("a").join("b").join("c").exists());
        assert!(!root.path().join("a").join("b").exists());
        assert!(root.path().join("a").exists());
        assert!(!file.delete().unwrap());
    }

    #[test]
    fn test_delete_keeps_non_empty_parents() {
        let root = TempDir::new().unwrap();
        let first = StorageFile::new(root.path().join("x").join("one.txt"), 3);
        let second = StorageFile::new(root.path().join("x").join("two.txt"), 3);

        first.write(b"1").unwrap();
        second.write(b"2").unwrap();
        first.delete().unwrap();

        assert!(second.exists());
        assert_eq!(second.read().unwrap().unwrap(), Bytes::from_static(b"2"));
    }

    #[test]
    fn test_link_file_roundtrip() {
        let root = TempDir::new().unwrap();
        let link = LinkFile::new(root.path().join("l").join("link.txt"), 1);

        assert_eq!(link.retrieve().unwrap(), None);
        link.store("alice").unwrap();
        assert_eq!(link.retrieve().unwrap(), Some("alice".to_string()));
        link.store("bob").unwrap();
        assert_eq!(link.retrieve().unwrap(), Some("bob".to_string()));
        assert!(link.delete().unwrap());
        assert!(!root.path().join("l").exists());
    }
}

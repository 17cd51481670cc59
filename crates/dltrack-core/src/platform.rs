//! Platform collaborators: the local filesystem and the OS shell
//!
//! Both are traits so the registry can be driven against doubles in tests.
//! Calls are synchronous; the coordinator runs them on the blocking pool.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Filesystem operations the download core needs
pub trait FileSystem: Send + Sync + 'static {
    fn exists(&self, path: &Path) -> bool;

    /// Move `from` to `to`, creating the destination directory if needed
    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn size_of(&self, path: &Path) -> io::Result<u64>;

    /// Directory finished downloads are moved into
    fn downloads_directory(&self) -> PathBuf;
}

/// [`FileSystem`] backed by `std::fs`
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    downloads_dir: PathBuf,
}

impl LocalFileSystem {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }
}

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Temp files often live on another mount; fall back to copy + remove
                tracing::debug!("rename {} failed ({}), copying instead", from.display(), e);
                std::fs::copy(from, to)?;
                std::fs::remove_file(from)?;
                Ok(())
            }
        }
    }

    fn size_of(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn downloads_directory(&self) -> PathBuf {
        self.downloads_dir.clone()
    }
}

/// Hands files to the desktop environment
pub trait ShellOpener: Send + Sync + 'static {
    fn open(&self, path: &Path) -> io::Result<()>;

    fn reveal_in_file_browser(&self, path: &Path) -> io::Result<()>;
}

/// [`ShellOpener`] that spawns the platform's opener process
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl ShellOpener for SystemShell {
    fn open(&self, path: &Path) -> io::Result<()> {
        #[cfg(target_os = "macos")]
        {
            Command::new("open").arg(path).spawn()?;
        }

        #[cfg(target_os = "windows")]
        {
            Command::new("cmd")
                .args(["/C", "start", "", &path.to_string_lossy()])
                .spawn()?;
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            Command::new("xdg-open").arg(path).spawn()?;
        }

        Ok(())
    }

    fn reveal_in_file_browser(&self, path: &Path) -> io::Result<()> {
        #[cfg(target_os = "macos")]
        {
            Command::new("open").arg("-R").arg(path).spawn()?;
        }

        #[cfg(target_os = "windows")]
        {
            let path_str = path.to_string_lossy().replace('/', "\\");
            Command::new("explorer").args(["/select,", &path_str]).spawn()?;
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            // xdg-open has no "select" mode, show the containing folder
            let folder = path.parent().unwrap_or(path);
            Command::new("xdg-open").arg(folder).spawn()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_creates_destination_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("incoming.part");
        std::fs::write(&src, b"hello").unwrap();

        let fs = LocalFileSystem::new(dir.path().join("Downloads"));
        let dest = fs.downloads_directory().join("hello.txt");
        fs.move_file(&src, &dest).unwrap();

        assert!(!fs.exists(&src));
        assert_eq!(fs.size_of(&dest).unwrap(), 5);
    }

    #[test]
    fn test_move_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        let result = fs.move_file(&dir.path().join("nope"), &dir.path().join("out"));
        assert!(result.is_err());
    }
}

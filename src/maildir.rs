//! On-disk layout: `<root>/<address>/<identifier>.eml`, soft-deleted files
//! under `<root>/<address>/trash/`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TRASH_DIR: &str = "trash";
const EXTENSION: &str = "eml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrashOutcome {
    Moved,
    /// A file with the same name was already in the trash.
    AlreadyTrashed,
    /// Nothing to move; the source file no longer exists.
    Missing,
}

#[derive(Debug, Clone)]
pub struct MailLayout {
    root: PathBuf,
}

impl MailLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn account_dir(&self, address: &str) -> PathBuf {
        self.root.join(sanitize(address))
    }

    pub fn trash_dir(&self, address: &str) -> PathBuf {
        self.account_dir(address).join(TRASH_DIR)
    }

    pub fn file_name(identifier: &str) -> String {
        format!("{}.{EXTENSION}", sanitize(identifier))
    }

    pub fn message_path(&self, address: &str, identifier: &str) -> PathBuf {
        self.account_dir(address).join(Self::file_name(identifier))
    }

    /// Writes the raw message durably: the bytes are synced to a temporary
    /// sibling before being renamed into place.
    pub fn write_message(&self, address: &str, identifier: &str, raw: &[u8]) -> io::Result<PathBuf> {
        let dir = self.account_dir(address);
        fs::create_dir_all(&dir)?;

        let target = dir.join(Self::file_name(identifier));
        let staging = dir.join(format!(".{}.tmp", Self::file_name(identifier)));
        {
            let mut file = File::create(&staging)?;
            file.write_all(raw)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        #[cfg(unix)]
        File::open(&dir)?.sync_all()?;
        Ok(target)
    }

    /// Moves `location` into the `trash/` directory next to it.
    pub fn trash_file(&self, location: &Path) -> io::Result<TrashOutcome> {
        let (Some(parent), Some(file_name)) = (location.parent(), location.file_name()) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a message file: {}", location.display()),
            ));
        };

        let trash = parent.join(TRASH_DIR);
        fs::create_dir_all(&trash)?;
        let destination = trash.join(file_name);
        if destination.exists() {
            return Ok(TrashOutcome::AlreadyTrashed);
        }
        match fs::rename(location, &destination) {
            Ok(()) => Ok(TrashOutcome::Moved),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(TrashOutcome::Missing),
            Err(err) => Err(err),
        }
    }

    /// Removes the account directory, trash included. A missing directory is fine.
    pub fn remove_account_dir(&self, address: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.account_dir(address)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

fn sanitize(component: &str) -> String {
    component.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_under_account_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MailLayout::new(dir.path());
        let path = layout
            .write_message("alice@example.com", "uid-1", b"Subject: hi\r\n\r\nbody")
            .unwrap();
        assert_eq!(path, dir.path().join("alice@example.com").join("uid-1.eml"));
        assert_eq!(fs::read(&path).unwrap(), b"Subject: hi\r\n\r\nbody");
        assert!(!dir
            .path()
            .join("alice@example.com")
            .join(".uid-1.eml.tmp")
            .exists());
    }

    #[test]
    fn identifiers_cannot_escape_the_account_directory() {
        let layout = MailLayout::new("/srv/mail");
        assert_eq!(
            layout.message_path("alice@example.com", "../x/y"),
            PathBuf::from("/srv/mail/alice@example.com/.._x_y.eml")
        );
    }

    #[test]
    fn trashing_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MailLayout::new(dir.path());
        let path = layout.write_message("alice@example.com", "uid-1", b"x").unwrap();

        assert_eq!(layout.trash_file(&path).unwrap(), TrashOutcome::Moved);
        assert!(layout.trash_dir("alice@example.com").join("uid-1.eml").exists());
        assert!(!path.exists());

        layout.write_message("alice@example.com", "uid-1", b"x").unwrap();
        assert_eq!(layout.trash_file(&path).unwrap(), TrashOutcome::AlreadyTrashed);
    }

    #[test]
    fn trashing_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MailLayout::new(dir.path());
        let path = layout.message_path("alice@example.com", "never-written");
        assert_eq!(layout.trash_file(&path).unwrap(), TrashOutcome::Missing);
    }

    #[test]
    fn removes_account_directory_with_trash() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MailLayout::new(dir.path());
        let path = layout.write_message("alice@example.com", "uid-1", b"x").unwrap();
        layout.trash_file(&path).unwrap();

        layout.remove_account_dir("alice@example.com").unwrap();
        assert!(!layout.account_dir("alice@example.com").exists());
        layout.remove_account_dir("alice@example.com").unwrap();
    }
}

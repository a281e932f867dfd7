/// Directory-backed key-value backend
///
/// Each key is one file. File names are the key with every byte outside
/// `[A-Za-z0-9_-]` escaped as `%XX`, so the mapping is reversible and
/// `list_keys` can recover keys from a directory listing. Escaped names
/// longer than `SEGMENT_LEN` are cut into segments; every segment but the
/// last becomes a directory named with a trailing `+`.
/// Writes go to a temporary file that is synced and renamed into place.

use crate::backend::KvBackend;
use crate::{Error, Result};
use bytes::Bytes;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TEMP_MARKER: char = '~';
const SEGMENT_MARKER: char = '+';
/// Longest name written for one path component, well under common
/// filesystem limits of 255 bytes
const SEGMENT_LEN: usize = 200;

pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open a backend rooted at `dir`, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "opened file backend");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::Storage("empty key".to_string()));
        }
        let escaped = escape_key(key);
        let mut path = self.dir.clone();
        let mut start = 0;
        while escaped.len() - start > SEGMENT_LEN {
            path.push(format!("{}{}", &escaped[start..start + SEGMENT_LEN], SEGMENT_MARKER));
            start += SEGMENT_LEN;
        }
        path.push(&escaped[start..]);
        Ok(path)
    }
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.file_for(key)?) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e).with_context(&format!("reading {}", key))),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.file_for(key)?;
        let temp = self
            .dir
            .join(format!("{}{}.tmp", TEMP_MARKER, uuid::Uuid::new_v4().simple()));

        let write = || -> io::Result<()> {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&temp);
            Error::from(e).with_context(&format!("writing {}", key))
        })
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        collect_keys(&self.dir, "", prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.file_for(key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::from(e).with_context(&format!("deleting {}", key))),
        }
    }
}

/// Recover keys under `dir`, whose segment directories so far spell `stem`
fn collect_keys(dir: &Path, stem: &str, prefix: &str, keys: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.contains(TEMP_MARKER) {
            continue;
        }
        if let Some(segment) = name.strip_suffix(SEGMENT_MARKER) {
            if entry.file_type()?.is_dir() {
                collect_keys(&entry.path(), &format!("{}{}", stem, segment), prefix, keys)?;
            }
            continue;
        }
        if let Some(key) = unescape_key(&format!("{}{}", stem, name)) {
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
    }
    Ok(())
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_escape_roundtrip() {
        for key in ["Person:abc", "__index:Person:ageIndex:AQID", "a.b/c d%", "名前"] {
            let escaped = escape_key(key);
            assert!(escaped
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'%'));
            assert_eq!(unescape_key(&escaped).as_deref(), Some(key));
        }
        assert_eq!(escape_key("Person:1"), "Person%3A1");
    }

    #[test]
    fn test_file_backend_basic() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        assert_eq!(backend.get("Person:1").unwrap(), None);
        backend.set("Person:1", b"{}").unwrap();
        assert_eq!(backend.get("Person:1").unwrap(), Some(Bytes::from_static(b"{}")));

        backend.set("Person:1", b"{\"a\":1}").unwrap();
        assert_eq!(
            backend.get("Person:1").unwrap(),
            Some(Bytes::from_static(b"{\"a\":1}"))
        );

        assert!(backend.delete("Person:1").unwrap());
        assert!(!backend.delete("Person:1").unwrap());
    }

    #[test]
    fn test_file_backend_list_keys() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend.set("Person:2", b"").unwrap();
        backend.set("Person:1", b"").unwrap();
        backend.set("Pet:1", b"").unwrap();
        fs::write(dir.path().join("~stray.tmp"), b"partial").unwrap();

        assert_eq!(backend.list_keys("Person:").unwrap(), vec!["Person:1", "Person:2"]);
        assert_eq!(backend.list_keys("").unwrap().len(), 3);
    }

    #[test]
    fn test_file_backend_persists_across_open() {
        let dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.set("Person:1", b"payload").unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.get("Person:1").unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
    }

    #[test]
    fn test_long_keys_stay_under_name_limit() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let long = format!("__index:Person:nameIndex:{}", "n".repeat(700));
        let exact = format!("Person:{}", "i".repeat(SEGMENT_LEN - "Person%3A".len()));

        backend.set(&long, b"bucket").unwrap();
        backend.set(&exact, b"payload").unwrap();
        backend.set("Person:1", b"short").unwrap();
        assert_eq!(backend.get(&long).unwrap(), Some(Bytes::from_static(b"bucket")));
        assert_eq!(backend.get(&exact).unwrap(), Some(Bytes::from_static(b"payload")));

        fn longest_name(dir: &Path) -> usize {
            fs::read_dir(dir)
                .unwrap()
                .map(|entry| {
                    let entry = entry.unwrap();
                    let own = entry.file_name().len();
                    if entry.file_type().unwrap().is_dir() {
                        own.max(longest_name(&entry.path()))
                    } else {
                        own
                    }
                })
                .max()
                .unwrap_or(0)
        }
        assert!(longest_name(dir.path()) <= SEGMENT_LEN + 1);

        assert_eq!(backend.list_keys("__index:").unwrap(), vec![long.clone()]);
        assert_eq!(backend.list_keys("Person:").unwrap().len(), 2);

        assert!(backend.delete(&long).unwrap());
        assert!(!backend.delete(&long).unwrap());
        assert_eq!(backend.get(&long).unwrap(), None);
        assert!(backend.list_keys("__index:").unwrap().is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(matches!(backend.set("", b"x"), Err(Error::Storage(_))));
    }
}

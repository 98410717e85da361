//! On-disk machinery shared by the query and render caches: config-keyed
//! directory naming, the inter-process mutex file, the commit cursor, and
//! pre-sized memory-mapped data files.
//!
//! A cache directory is append-only. Writers serialize on the `mutex` file;
//! the `cursor` file holds the number of committed chunk records and is
//! flushed only after everything the records point at is durable, so a
//! record is either fully visible or not visible at all.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use fs2::FileExt;
use md5::{Digest, Md5};
use memmap2::{Mmap, MmapMut, MmapOptions};

use flatchart::{flat_child_dirs, read_flat_checksum, Charset};

use crate::model::{Coverage, Library};

pub const CHARSET_FILENAME: &str = "charset";
pub const CONFIG_FILENAME: &str = "config";
pub const MUTEX_FILENAME: &str = "mutex";
pub const CURSOR_FILENAME: &str = "cursor";
pub const CHUNKS_FILENAME: &str = "chunks";
pub const LIBRARIES_FILENAME: &str = "libraries";
pub const COVERAGES_FILENAME: &str = "coverages";

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Cache directory for a config string: `<prefix>_<md5-hex>` under the
/// parent. Different configs land in different directories, so caches built
/// against different flat data or projections never collide.
pub fn cache_dir(parent: &Path, prefix: &str, config_string: &str) -> PathBuf {
    let mut hasher = Md5::new();
    hasher.update(config_string.as_bytes());
    parent.join(format!("{}_{}", prefix, hex::encode(hasher.finalize())))
}

/// The `flatDirs` section of a cache config string: one line per flat child
/// dir with its ingest checksum.
pub fn flat_dirs_config_section(flat_parent: &Path) -> Result<String> {
    let mut section = String::from("flatDirs =\n");
    for dir in flat_child_dirs(flat_parent)? {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_default();
        let checksum = read_flat_checksum(&dir)
            .with_context(|| format!("failed to read checksum of {}", dir.display()))?;
        section.push_str(&format!("    {} : {}\n", name, checksum));
    }
    Ok(section)
}

/// The cross-process writer lock. Locking is advisory and exclusive; the
/// guard unlocks on drop.
pub struct MutexFile {
    file: File,
}

impl MutexFile {
    pub fn open(path: &Path) -> Result<MutexFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open mutex file {}", path.display()))?;
        Ok(MutexFile { file })
    }

    pub fn lock(&self) -> Result<MutexFileGuard<'_>> {
        self.file.lock_exclusive().context("failed to lock mutex file")?;
        Ok(MutexFileGuard { file: &self.file })
    }
}

pub struct MutexFileGuard<'a> {
    file: &'a File,
}

impl Drop for MutexFileGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(self.file) {
            log::error!("Failed to unlock mutex file: {}", e);
        }
    }
}

/// The commit cursor: a single native-endian u32 counting committed chunk
/// records. Read and written only while holding the mutex file.
pub struct CursorFile {
    map: MmapMut,
}

impl CursorFile {
    pub fn open(path: &Path) -> Result<CursorFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open cursor file {}", path.display()))?;
        ensure!(file.metadata()?.len() == 4, "cursor file is not 4 bytes");
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(CursorFile { map })
    }

    pub fn get(&self) -> u32 {
        u32::from_ne_bytes(self.map[0..4].try_into().unwrap())
    }

    pub fn set(&mut self, value: u32) {
        self.map[0..4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn force(&self) -> Result<()> {
        self.map.flush().context("failed to flush cursor file")
    }
}

/// Creates a file of the given length (sparse where the filesystem allows)
/// and syncs it, so the cache layout is durable before the cursor appears.
pub fn create_sized_file(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Writes the cursor file last during initialization: its presence marks the
/// directory as fully laid out.
pub fn create_cursor_file(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to create cursor file {}", path.display()))?;
    file.set_len(4)?;
    let mut cursor = CursorFile::open(path)?;
    cursor.set(0);
    cursor.force()?;
    file.sync_all()?;
    Ok(())
}

/// A read-write mapping of a whole cache file, or of a byte range of one.
/// Ranged mappings keep commit-time address usage proportional to the chunk
/// being written, not to the (sparse, huge) data file.
pub struct RwMap {
    map: MmapMut,
}

impl RwMap {
    pub fn open(path: &Path) -> Result<RwMap> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(RwMap { map })
    }

    pub fn open_range(path: &Path, byte_offset: u64, byte_len: usize) -> Result<RwMap> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let map = unsafe {
            MmapOptions::new()
                .offset(byte_offset)
                .len(byte_len)
                .map_mut(&file)?
        };
        Ok(RwMap { map })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn force(&self) -> Result<()> {
        self.map.flush().context("failed to flush mapping")
    }
}

/// A read-only mapping of a byte range of a cache file. Committed ranges are
/// never rewritten, so readers take no lock.
pub struct RoMap {
    map: Mmap,
}

impl RoMap {
    pub fn open_range(path: &Path, byte_offset: u64, byte_len: usize) -> Result<RoMap> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let map = unsafe {
            MmapOptions::new()
                .offset(byte_offset)
                .len(byte_len)
                .map(&file)?
        };
        Ok(RoMap { map })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }
}

pub fn write_charset_file(dir: &Path, charset: Charset) -> Result<()> {
    fs::write(dir.join(CHARSET_FILENAME), charset.label().as_bytes())?;
    Ok(())
}

pub fn read_charset_file(dir: &Path) -> Result<Charset> {
    let label = fs::read_to_string(dir.join(CHARSET_FILENAME))?;
    Ok(Charset::from_label(&label)?)
}

pub fn write_config_file(dir: &Path, config_string: &str, charset: Charset) -> Result<()> {
    fs::write(dir.join(CONFIG_FILENAME), charset.encode(config_string)?)?;
    Ok(())
}

pub fn read_config_file(dir: &Path, charset: Charset) -> Result<String> {
    let bytes = fs::read(dir.join(CONFIG_FILENAME))?;
    Ok(charset.decode(&bytes)?)
}

/// Directory names are config digests, so a name match with differing config
/// bytes means a digest collision between two incompatible caches. That is
/// not recoverable in place.
pub fn verify_config(dir: &Path, expected_config: &str) -> Result<()> {
    let charset = read_charset_file(dir)?;
    let existing = read_config_file(dir, charset)?;
    if existing != expected_config {
        bail!(
            "Two different cache configs are in conflict, due to a hash collision: \
             either delete the existing cache dir (if it is no longer in use), or use \
             a different cache parent dir: cache-dir = {}",
            dir.display()
        );
    }
    Ok(())
}

/// One line per library: database number, name, projected bounds. Line order
/// defines the cache's library numbering.
pub fn write_libraries_file(path: &Path, libraries: &[Library], charset: Charset) -> Result<()> {
    let mut text = String::new();
    for lib in libraries {
        text.push_str(&format!(
            "{} {} {} {} {} {}\n",
            lib.database_num, lib.name, lib.x_min, lib.x_max, lib.y_min, lib.y_max
        ));
    }
    fs::write(path, charset.encode(&text)?)?;
    Ok(())
}

pub fn read_libraries_file(path: &Path, charset: Charset) -> Result<Vec<Library>> {
    let bytes = fs::read(path)?;
    let text = charset.decode(&bytes)?;
    let mut libraries = Vec::new();
    for (library_num, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        ensure!(fields.len() == 6, "malformed libraries line: {:?}", line);
        libraries.push(Library {
            library_num: library_num as i32,
            database_num: fields[0].parse()?,
            name: fields[1].to_string(),
            x_min: fields[2].parse()?,
            x_max: fields[3].parse()?,
            y_min: fields[4].parse()?,
            y_max: fields[5].parse()?,
        });
    }
    Ok(libraries)
}

/// One coverage name per line; line order defines coverage numbering.
pub fn write_coverages_file(path: &Path, coverages: &[Coverage], charset: Charset) -> Result<()> {
    let mut text = String::new();
    for coverage in coverages {
        text.push_str(&coverage.name);
        text.push('\n');
    }
    fs::write(path, charset.encode(&text)?)?;
    Ok(())
}

pub fn read_coverages_file(path: &Path, charset: Charset) -> Result<Vec<Coverage>> {
    let bytes = fs::read(path)?;
    let text = charset.decode(&bytes)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(coverage_num, line)| Coverage {
            coverage_num: coverage_num as i32,
            name: line.trim().to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cache_dir_name_is_config_digest() {
        let parent = Path::new("/caches");
        let a = cache_dir(parent, "render-cache", "config a");
        let b = cache_dir(parent, "render-cache", "config b");
        assert_ne!(a, b);
        assert_eq!(a, cache_dir(parent, "render-cache", "config a"));
        let name = a.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("render-cache_"));
        assert_eq!(name.len(), "render-cache_".len() + 32);
    }

    #[test]
    fn mutex_guard_unlocks_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MUTEX_FILENAME);
        let mutex = MutexFile::open(&path).unwrap();
        drop(mutex.lock().unwrap());
        // Relocking succeeds once the guard is gone.
        drop(mutex.lock().unwrap());
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CURSOR_FILENAME);
        create_cursor_file(&path).unwrap();

        let mut cursor = CursorFile::open(&path).unwrap();
        assert_eq!(cursor.get(), 0);
        cursor.set(7);
        cursor.force().unwrap();
        drop(cursor);

        assert_eq!(CursorFile::open(&path).unwrap().get(), 7);
    }

    #[test]
    fn config_mismatch_is_reported_as_collision() {
        let dir = tempdir().unwrap();
        write_charset_file(dir.path(), Charset::Utf8).unwrap();
        write_config_file(dir.path(), "config a", Charset::Utf8).unwrap();

        verify_config(dir.path(), "config a").unwrap();
        let err = verify_config(dir.path(), "config b").unwrap_err();
        assert!(err.to_string().contains("hash collision"));
    }

    #[test]
    fn libraries_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(LIBRARIES_FILENAME);
        let libraries = vec![
            Library {
                library_num: 0,
                database_num: 7,
                name: "BROWSE".to_string(),
                x_min: -180.0,
                x_max: 180.0,
                y_min: -90.0,
                y_max: 90.0,
            },
            Library {
                library_num: 1,
                database_num: 7,
                name: "h0666a".to_string(),
                x_min: 10.5,
                x_max: 11.25,
                y_min: 59.0,
                y_max: 60.0,
            },
        ];
        write_libraries_file(&path, &libraries, Charset::Utf8).unwrap();

        let reread = read_libraries_file(&path, Charset::Utf8).unwrap();
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[1].library_num, 1);
        assert_eq!(reread[1].name, "h0666a");
        assert_eq!(reread[1].x_max, 11.25);
    }

    #[test]
    fn coverages_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(COVERAGES_FILENAME);
        let coverages = vec![
            Coverage { coverage_num: 0, name: "nav".to_string() },
            Coverage { coverage_num: 1, name: "hyd".to_string() },
        ];
        write_coverages_file(&path, &coverages, Charset::Utf8).unwrap();

        let reread = read_coverages_file(&path, Charset::Utf8).unwrap();
        assert_eq!(reread.len(), 2);
        assert_eq!(reread[1].coverage_num, 1);
        assert_eq!(reread[1].name, "hyd");
    }
}

//! The render cache: converted chunks append grouped vertex, label-char, and
//! label-length data to shared files, with an 11-long index record per chunk
//! and an 11-int record per group. Readers map committed ranges directly for
//! upload to the GPU.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use log::debug;

use flatchart::Charset;

use crate::cachedir::{
    self, cache_dir, create_cursor_file, create_sized_file, flat_dirs_config_section,
    read_charset_file, read_coverages_file, read_libraries_file, verify_config,
    write_charset_file, write_config_file, write_coverages_file, write_libraries_file,
    CursorFile, MutexFile, RoMap, RwMap, GIB, MIB,
};
use crate::databases::FlatDatabases;
use crate::geosym::{
    default_external_attrs, external_attrs_config_lines, ExternalAttrs, GeosymAssignment,
};
use crate::model::{coverage_significance, ChunkKey, ChunkPriority, Coverage, Library};
use crate::proj::{PlateCarree, Projection};
use crate::render_build::{self, ChunkBuffers, FLOATS_PER_LABEL_VERTEX};
use crate::sched::{ChunkJobScheduler, Semaphore};

pub const RENDER_FORMAT_VERSION: &str = "13";
pub const RENDER_CACHE_DIR_PREFIX: &str = "render-cache";

pub const GROUPS_FILENAME: &str = "groups";
pub const LABEL_CHARS_FILENAME: &str = "label-chars";
pub const LABEL_LENGTHS_FILENAME: &str = "label-lengths";
pub const VERTICES_FILENAME: &str = "vertices";

pub const LONGS_PER_RENDER_CHUNK: usize = 11;
pub const INTS_PER_RENDER_GROUP: usize = 11;

pub struct RenderCacheConfig {
    pub flat_parent_dir: PathBuf,
    pub render_parent_dir: PathBuf,
    pub proj: Arc<dyn Projection>,
    pub proj_points_per_bounds_edge: usize,

    /// Names the symbology-assignment set in the cache config string, so
    /// caches built with different assignment files never mix.
    pub geosym_assignments_name: String,
    pub assignments: Vec<GeosymAssignment>,
    pub external_attrs: ExternalAttrs,

    pub groups_file_size: u64,
    pub label_chars_file_size: u64,
    pub label_lengths_file_size: u64,
    pub vertices_file_size: u64,
    pub reload_chunks_table_before_converting: bool,
    pub charset: Charset,
}

impl RenderCacheConfig {
    pub fn new(
        flat_parent_dir: PathBuf,
        render_parent_dir: PathBuf,
        geosym_assignments_name: String,
        assignments: Vec<GeosymAssignment>,
    ) -> RenderCacheConfig {
        RenderCacheConfig {
            flat_parent_dir,
            render_parent_dir,
            proj: Arc::new(PlateCarree),
            proj_points_per_bounds_edge: 2,
            geosym_assignments_name,
            assignments,
            external_attrs: default_external_attrs(),
            groups_file_size: 25 * MIB,
            label_chars_file_size: 100 * MIB,
            label_lengths_file_size: 100 * MIB,
            vertices_file_size: 20 * GIB,
            reload_chunks_table_before_converting: false,
            charset: Charset::Utf8,
        }
    }
}

pub fn render_config_string(config: &RenderCacheConfig) -> Result<String> {
    let mut s = String::new();
    s.push_str(&format!("formatVersion = {}\n", RENDER_FORMAT_VERSION));
    s.push('\n');
    s.push_str(&flat_dirs_config_section(&config.flat_parent_dir)?);
    s.push('\n');
    s.push_str(&format!("proj = {}\n", config.proj.config_string()));
    s.push_str(&format!("geosymAssignments = {}\n", config.geosym_assignments_name));
    s.push('\n');
    s.push_str(&external_attrs_config_lines(&config.external_attrs));
    Ok(s)
}

/// One committed chunk's index record: where its groups, label chars, label
/// lengths, and vertex coords sit in the shared data files.
#[derive(Debug, Clone, Copy)]
pub struct RenderChunk {
    pub key: ChunkKey,
    pub feature_count: i32,

    pub group_first: i32,
    pub group_count: i32,

    pub label_char_first: i32,
    pub label_char_count: i32,

    pub label_length_first: i32,
    pub label_length_count: i32,

    pub vertex_coord_first: i64,
    pub vertex_coord_count: i32,
}

fn read_chunk_record(bytes: &[u8], record: usize) -> RenderChunk {
    let at = record * LONGS_PER_RENDER_CHUNK * 8;
    let long = |i: usize| -> i64 {
        let o = at + i * 8;
        i64::from_ne_bytes(bytes[o..o + 8].try_into().unwrap())
    };
    RenderChunk {
        key: ChunkKey { library_num: long(0) as i32, coverage_num: long(1) as i32 },
        feature_count: long(2) as i32,
        group_first: long(3) as i32,
        group_count: long(4) as i32,
        label_char_first: long(5) as i32,
        label_char_count: long(6) as i32,
        label_length_first: long(7) as i32,
        label_length_count: long(8) as i32,
        vertex_coord_first: long(9),
        vertex_coord_count: long(10) as i32,
    }
}

fn write_chunk_record(bytes: &mut [u8], record: usize, chunk: &RenderChunk) {
    let at = record * LONGS_PER_RENDER_CHUNK * 8;
    let longs = [
        chunk.key.library_num as i64,
        chunk.key.coverage_num as i64,
        chunk.feature_count as i64,
        chunk.group_first as i64,
        chunk.group_count as i64,
        chunk.label_char_first as i64,
        chunk.label_char_count as i64,
        chunk.label_length_first as i64,
        chunk.label_length_count as i64,
        chunk.vertex_coord_first,
        chunk.vertex_coord_count as i64,
    ];
    for (i, v) in longs.iter().enumerate() {
        let o = at + i * 8;
        bytes[o..o + 8].copy_from_slice(&v.to_ne_bytes());
    }
}

/// One group's record: which assignment it belongs to, and where its slices
/// of the chunk's label and vertex ranges sit. Firsts are chunk-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderGroup {
    pub assignment_id: i32,

    pub label_first: i32,
    pub label_char_first: i32,
    pub label_char_count: i32,
    pub label_length_first: i32,
    pub label_length_count: i32,

    pub vertex_coord_first: i32,
    pub triangle_coord_count: i32,
    pub line_coord_count: i32,
    pub icon_coord_count: i32,
    pub label_coord_count: i32,
}

impl RenderGroup {
    /// Vertex order within a group is triangles, lines, icons, labels.
    pub fn triangle_coord_first(&self) -> i32 {
        self.vertex_coord_first
    }

    pub fn line_coord_first(&self) -> i32 {
        self.vertex_coord_first + self.triangle_coord_count
    }

    pub fn icon_coord_first(&self) -> i32 {
        self.line_coord_first() + self.line_coord_count
    }

    pub fn label_coord_first(&self) -> i32 {
        self.icon_coord_first() + self.icon_coord_count
    }
}

fn read_group_record(bytes: &[u8], record: usize) -> RenderGroup {
    let at = record * INTS_PER_RENDER_GROUP * 4;
    let int = |i: usize| -> i32 {
        let o = at + i * 4;
        i32::from_ne_bytes(bytes[o..o + 4].try_into().unwrap())
    };
    RenderGroup {
        assignment_id: int(0),
        label_first: int(1),
        label_char_first: int(2),
        label_char_count: int(3),
        label_length_first: int(4),
        label_length_count: int(5),
        vertex_coord_first: int(6),
        triangle_coord_count: int(7),
        line_coord_count: int(8),
        icon_coord_count: int(9),
        label_coord_count: int(10),
    }
}

fn write_group_record(bytes: &mut [u8], record: usize, group: &RenderGroup) {
    let at = record * INTS_PER_RENDER_GROUP * 4;
    let ints = [
        group.assignment_id,
        group.label_first,
        group.label_char_first,
        group.label_char_count,
        group.label_length_first,
        group.label_length_count,
        group.vertex_coord_first,
        group.triangle_coord_count,
        group.line_coord_count,
        group.icon_coord_count,
        group.label_coord_count,
    ];
    for (i, v) in ints.iter().enumerate() {
        let o = at + i * 4;
        bytes[o..o + 4].copy_from_slice(&v.to_ne_bytes());
    }
}

struct CommitState {
    cursor: CursorFile,
    chunks: RwMap,
    groups: RwMap,
    label_chars: RwMap,
    label_lengths: RwMap,
    loaded: u32,
}

/// Appends one converted chunk's group records, label data, and vertex
/// coords. Group firsts are chunk-relative; vertex order within a group is
/// triangles, lines, icons, labels.
fn write_group_data(
    commit: &mut CommitState,
    buffers: &ChunkBuffers,
    group_next: i32,
    label_char_next: i32,
    label_length_next: i32,
    vertices_map: Option<&mut RwMap>,
) {
    let mut label_char_at = label_char_next as usize;
    let mut label_length_at = label_length_next as usize;

    let mut group_label_first = 0i32;
    let mut group_label_char_first = 0i32;
    let mut group_label_length_first = 0i32;
    let mut group_vertex_coord_first = 0i32;

    for (g, group) in buffers.groups.iter().enumerate() {
        let char_bytes = commit.label_chars.bytes_mut();
        for &c in &group.label_chars {
            char_bytes[label_char_at * 2..label_char_at * 2 + 2].copy_from_slice(&c.to_ne_bytes());
            label_char_at += 1;
        }

        let length_bytes = commit.label_lengths.bytes_mut();
        for &n in &group.label_lengths {
            length_bytes[label_length_at * 4..label_length_at * 4 + 4]
                .copy_from_slice(&n.to_ne_bytes());
            label_length_at += 1;
        }

        let record = RenderGroup {
            assignment_id: group.assignment.id,
            label_first: group_label_first,
            label_char_first: group_label_char_first,
            label_char_count: group.label_chars.len() as i32,
            label_length_first: group_label_length_first,
            label_length_count: group.label_lengths.len() as i32,
            vertex_coord_first: group_vertex_coord_first,
            triangle_coord_count: group.triangle_coords.len() as i32,
            line_coord_count: group.line_coords.len() as i32,
            icon_coord_count: group.icon_coords.len() as i32,
            label_coord_count: group.label_coords.len() as i32,
        };
        write_group_record(commit.groups.bytes_mut(), group_next as usize + g, &record);

        group_label_first += (group.label_coords.len() / FLOATS_PER_LABEL_VERTEX) as i32;
        group_label_char_first += group.label_chars.len() as i32;
        group_label_length_first += group.label_lengths.len() as i32;
        group_vertex_coord_first += group.vertex_coord_count() as i32;
    }

    if let Some(map) = vertices_map {
        let bytes = map.bytes_mut();
        let mut at = 0usize;
        for group in &buffers.groups {
            for coords in [
                &group.triangle_coords,
                &group.line_coords,
                &group.icon_coords,
                &group.label_coords,
            ] {
                let n = coords.len() * 4;
                bytes[at..at + n].copy_from_slice(bytemuck::cast_slice(coords));
                at += n;
            }
        }
    }
}

pub struct RenderCache {
    pub libraries: Vec<Library>,
    pub coverages: Vec<Coverage>,
    pub assignments: HashMap<i32, GeosymAssignment>,

    databases: FlatDatabases,
    proj: Arc<dyn Projection>,
    external_attrs: ExternalAttrs,
    assignments_by_fcode: HashMap<String, Vec<GeosymAssignment>>,
    reload_chunks_table_before_converting: bool,

    dir: PathBuf,
    mutex: MutexFile,
    commit: Mutex<CommitState>,
    chunks: Mutex<HashMap<ChunkKey, RenderChunk>>,

    scheduler: ChunkJobScheduler,
}

impl RenderCache {
    pub fn open(config: RenderCacheConfig, num_converter_threads: usize) -> Result<Arc<RenderCache>> {
        let scheduler = ChunkJobScheduler::new("render-cache", num_converter_threads)?;
        let databases = FlatDatabases::open(&config.flat_parent_dir)?;

        let config_string = render_config_string(&config)?;
        let dir = cache_dir(&config.render_parent_dir, RENDER_CACHE_DIR_PREFIX, &config_string);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let mutex = MutexFile::open(&dir.join(cachedir::MUTEX_FILENAME))?;

        let cursor_path = dir.join(cachedir::CURSOR_FILENAME);
        let chunks_path = dir.join(cachedir::CHUNKS_FILENAME);
        let libraries_path = dir.join(cachedir::LIBRARIES_FILENAME);
        let coverages_path = dir.join(cachedir::COVERAGES_FILENAME);

        {
            let _guard = mutex.lock()?;
            if !cursor_path.exists() {
                write_charset_file(&dir, config.charset)?;
                write_config_file(&dir, &config_string, config.charset)?;

                let libraries = databases
                    .discover_libraries(config.proj.as_ref(), config.proj_points_per_bounds_edge)?;
                let coverages = databases.discover_coverages();
                write_libraries_file(&libraries_path, &libraries, config.charset)?;
                write_coverages_file(&coverages_path, &coverages, config.charset)?;

                let chunks_len =
                    (libraries.len() * coverages.len() * LONGS_PER_RENDER_CHUNK * 8) as u64;
                create_sized_file(&chunks_path, chunks_len)?;
                create_sized_file(&dir.join(GROUPS_FILENAME), config.groups_file_size)?;
                create_sized_file(&dir.join(LABEL_CHARS_FILENAME), config.label_chars_file_size)?;
                create_sized_file(&dir.join(LABEL_LENGTHS_FILENAME), config.label_lengths_file_size)?;
                create_sized_file(&dir.join(VERTICES_FILENAME), config.vertices_file_size)?;
                create_cursor_file(&cursor_path)?;
            }
        }

        let charset = read_charset_file(&dir)?;
        verify_config(&dir, &config_string)?;

        let libraries = read_libraries_file(&libraries_path, charset)?;
        let coverages = read_coverages_file(&coverages_path, charset)?;

        let assignments_by_fcode = render_build::assignments_by_fcode(&config.assignments);
        let assignments: HashMap<i32, GeosymAssignment> =
            config.assignments.iter().map(|a| (a.id, a.clone())).collect();

        let cache = Arc::new(RenderCache {
            libraries,
            coverages,
            assignments,
            databases,
            proj: Arc::clone(&config.proj),
            external_attrs: config.external_attrs,
            assignments_by_fcode,
            reload_chunks_table_before_converting: config.reload_chunks_table_before_converting,
            dir: dir.clone(),
            mutex,
            commit: Mutex::new(CommitState {
                cursor: CursorFile::open(&cursor_path)?,
                chunks: RwMap::open(&chunks_path)?,
                groups: RwMap::open(&dir.join(GROUPS_FILENAME))?,
                label_chars: RwMap::open(&dir.join(LABEL_CHARS_FILENAME))?,
                label_lengths: RwMap::open(&dir.join(LABEL_LENGTHS_FILENAME))?,
                loaded: 0,
            }),
            chunks: Mutex::new(HashMap::new()),
            scheduler,
        });

        {
            let mut commit = cache.lock_commit();
            let _guard = cache.mutex.lock()?;
            cache.absorb_new_chunks(&mut commit);
        }

        Ok(cache)
    }

    fn lock_commit(&self) -> std::sync::MutexGuard<'_, CommitState> {
        match self.commit.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_chunks(&self) -> std::sync::MutexGuard<'_, HashMap<ChunkKey, RenderChunk>> {
        match self.chunks.lock() {
            Ok(chunks) => chunks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn describe(&self, key: ChunkKey) -> String {
        let library = &self.libraries[key.library_num as usize];
        let coverage = &self.coverages[key.coverage_num as usize];
        format!(
            "database = {}, library = {}, coverage = {}",
            library.database_num, library.name, coverage.name
        )
    }

    /// Loads index records committed since the last absorb (by this or any
    /// other process). Caller holds the mutex file.
    fn absorb_new_chunks(&self, commit: &mut CommitState) {
        let cursor = commit.cursor.get();
        let mut chunks = self.lock_chunks();
        for record in commit.loaded..cursor {
            let chunk = read_chunk_record(commit.chunks.bytes(), record as usize);
            debug!("Found externally converted chunk: {}", self.describe(chunk.key));
            chunks.insert(chunk.key, chunk);
        }
        commit.loaded = cursor;
    }

    /// Hands the chunk's index record to the callback: synchronously on a
    /// cache hit, else from a conversion worker once the chunk is built. A
    /// priority of Skip drops the request.
    pub fn get_chunk<F>(
        self: &Arc<Self>,
        key: ChunkKey,
        priority_fn: Arc<dyn Fn(ChunkKey) -> ChunkPriority + Send + Sync>,
        callback: F,
    ) where
        F: FnOnce(RenderChunk) + Send + 'static,
    {
        // Bind the hit first so the map guard drops before the callback runs;
        // a callback may re-enter the cache.
        let hit = self.lock_chunks().get(&key).copied();
        if let Some(chunk) = hit {
            callback(chunk);
            return;
        }

        let early_priority = priority_fn(key);
        if early_priority == ChunkPriority::Skip {
            debug!(
                "Skipping chunk conversion: early-priority = {:?}, {}",
                early_priority,
                self.describe(key)
            );
        } else {
            debug!(
                "Enqueueing chunk for conversion: early-priority = {:?}, {}",
                early_priority,
                self.describe(key)
            );
            self.enqueue_conversion(key, priority_fn, Box::new(callback), Instant::now(), early_priority, 0);
        }
    }

    fn enqueue_conversion(
        self: &Arc<Self>,
        key: ChunkKey,
        priority_fn: Arc<dyn Fn(ChunkKey) -> ChunkPriority + Send + Sync>,
        callback: Box<dyn FnOnce(RenderChunk) + Send>,
        orig_time: Instant,
        early_priority: ChunkPriority,
        num_deferrals: u32,
    ) {
        let cache = Arc::clone(self);
        let significance = coverage_significance(&self.coverages[key.coverage_num as usize].name);
        self.scheduler.submit(early_priority, significance, move || {
            let hit = cache.lock_chunks().get(&key).copied();
            if let Some(chunk) = hit {
                callback(chunk);
                return Ok(());
            }

            let late_priority = priority_fn(key);
            let wait_millis = orig_time.elapsed().as_millis();
            if late_priority == ChunkPriority::Skip {
                debug!(
                    "Skipping chunk conversion: new-priority = {:?}, old-priority = {:?}, deferrals = {}, total-wait = {} ms, {}",
                    late_priority, early_priority, num_deferrals, wait_millis, cache.describe(key)
                );
            } else if late_priority.rank() < early_priority.rank() {
                debug!(
                    "Deferring chunk conversion: new-priority = {:?}, old-priority = {:?}, prior-deferrals = {}, wait-so-far = {} ms, {}",
                    late_priority, early_priority, num_deferrals, wait_millis, cache.describe(key)
                );
                cache.enqueue_conversion(key, priority_fn, callback, orig_time, late_priority, num_deferrals + 1);
            } else {
                debug!(
                    "Converting chunk: late-priority = {:?}, early-priority = {:?}, deferrals = {}, total-wait = {} ms, {}",
                    late_priority, early_priority, num_deferrals, wait_millis, cache.describe(key)
                );
                cache.convert_chunk(key, callback)?;
            }
            Ok(())
        });
    }

    fn convert_chunk(&self, key: ChunkKey, callback: Box<dyn FnOnce(RenderChunk) + Send>) -> Result<()> {
        // Some other thread or process may have committed this very chunk
        // since we enqueued. Usually not worth checking for: the chance is
        // low, and redoing one conversion is cheap.
        if self.reload_chunks_table_before_converting {
            let mut commit = self.lock_commit();
            let _guard = self.mutex.lock()?;
            self.absorb_new_chunks(&mut commit);
            let hit = self.lock_chunks().get(&key).copied();
            if let Some(chunk) = hit {
                callback(chunk);
                return Ok(());
            }
        }

        // Build outside the lock; the expensive part needs no shared state.
        let buffers = self.build_chunk(key)?;
        let label_char_count = buffers.label_char_count();
        let label_length_count = buffers.label_length_count();
        let vertex_coord_count = buffers.vertex_coord_count();

        let mut commit = self.lock_commit();
        let _guard = self.mutex.lock()?;

        self.absorb_new_chunks(&mut commit);
        let hit = self.lock_chunks().get(&key).copied();
        if let Some(chunk) = hit {
            callback(chunk);
            return Ok(());
        }

        let chunk_next = commit.cursor.get();
        let (group_next, label_char_next, label_length_next, vertex_coord_next) = if chunk_next > 0 {
            let last = read_chunk_record(commit.chunks.bytes(), chunk_next as usize - 1);
            (
                last.group_first + last.group_count,
                last.label_char_first + last.label_char_count,
                last.label_length_first + last.label_length_count,
                last.vertex_coord_first + last.vertex_coord_count as i64,
            )
        } else {
            (0, 0, 0, 0)
        };

        let mut vertices_map = if vertex_coord_count > 0 {
            Some(RwMap::open_range(
                &self.dir.join(VERTICES_FILENAME),
                vertex_coord_next as u64 * 4,
                vertex_coord_count * 4,
            )?)
        } else {
            None
        };

        write_group_data(
            &mut commit,
            &buffers,
            group_next,
            label_char_next,
            label_length_next,
            vertices_map.as_mut(),
        );

        let chunk = RenderChunk {
            key,
            feature_count: buffers.feature_count,
            group_first: group_next,
            group_count: buffers.groups.len() as i32,
            label_char_first: label_char_next,
            label_char_count: label_char_count as i32,
            label_length_first: label_length_next,
            label_length_count: label_length_count as i32,
            vertex_coord_first: vertex_coord_next,
            vertex_coord_count: vertex_coord_count as i32,
        };
        write_chunk_record(commit.chunks.bytes_mut(), chunk_next as usize, &chunk);

        {
            let mut chunks = self.lock_chunks();
            debug!("Finished converting chunk: {}", self.describe(key));
            chunks.insert(key, chunk);
        }
        commit.loaded = chunk_next + 1;

        callback(chunk);

        // Another process must never see the index record before the data it
        // points at, nor the cursor before the index record.
        if let Some(map) = &vertices_map {
            map.force()?;
        }
        commit.groups.force()?;
        commit.label_chars.force()?;
        commit.label_lengths.force()?;
        commit.chunks.force()?;
        commit.cursor.set(chunk_next + 1);
        commit.cursor.force()?;

        Ok(())
    }

    fn build_chunk(&self, key: ChunkKey) -> Result<ChunkBuffers> {
        let library = &self.libraries[key.library_num as usize];
        let coverage = &self.coverages[key.coverage_num as usize];

        let database = self
            .databases
            .get(library.database_num)
            .with_context(|| format!("no flat database numbered {}", library.database_num))?;

        match database.flat_chunk_key(&library.name, &coverage.name) {
            Some(flat_key) => render_build::build_chunk(
                &database.store,
                flat_key,
                &coverage.name,
                &self.assignments_by_fcode,
                &self.external_attrs,
                self.proj.as_ref(),
            ),
            None => Ok(ChunkBuffers { feature_count: 0, groups: Vec::new() }),
        }
    }

    /// The chunk's group records, parsed from the shared groups file.
    pub fn chunk_groups(&self, chunk: &RenderChunk) -> Result<Vec<RenderGroup>> {
        if chunk.group_count == 0 {
            return Ok(Vec::new());
        }
        let map = RoMap::open_range(
            &self.dir.join(GROUPS_FILENAME),
            chunk.group_first as u64 * INTS_PER_RENDER_GROUP as u64 * 4,
            chunk.group_count as usize * INTS_PER_RENDER_GROUP * 4,
        )?;
        Ok((0..chunk.group_count as usize)
            .map(|g| read_group_record(map.bytes(), g))
            .collect())
    }

    /// Maps the chunk's vertex coords read-only, ready for upload. The floats
    /// are the committed bytes; committed ranges are never rewritten.
    pub fn map_chunk_vertices(&self, chunk: &RenderChunk) -> Result<RoMap> {
        RoMap::open_range(
            &self.dir.join(VERTICES_FILENAME),
            chunk.vertex_coord_first as u64 * 4,
            chunk.vertex_coord_count as usize * 4,
        )
    }

    /// The chunk's label text, UTF-16 code units.
    pub fn chunk_label_chars(&self, chunk: &RenderChunk) -> Result<Vec<u16>> {
        if chunk.label_char_count == 0 {
            return Ok(Vec::new());
        }
        let map = RoMap::open_range(
            &self.dir.join(LABEL_CHARS_FILENAME),
            chunk.label_char_first as u64 * 2,
            chunk.label_char_count as usize * 2,
        )?;
        Ok(map
            .bytes()
            .chunks_exact(2)
            .map(|b| u16::from_ne_bytes([b[0], b[1]]))
            .collect())
    }

    /// Per-label-entry character counts, zero for entries with no value.
    pub fn chunk_label_lengths(&self, chunk: &RenderChunk) -> Result<Vec<i32>> {
        if chunk.label_length_count == 0 {
            return Ok(Vec::new());
        }
        let map = RoMap::open_range(
            &self.dir.join(LABEL_LENGTHS_FILENAME),
            chunk.label_length_first as u64 * 4,
            chunk.label_length_count as usize * 4,
        )?;
        Ok(map
            .bytes()
            .chunks_exact(4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

/// Converts every library/coverage chunk, most significant coverages first,
/// with at most `num_simultaneous` conversions in flight. Returns once all
/// chunks are committed.
pub fn convert_all_chunks(
    cache: &Arc<RenderCache>,
    num_simultaneous: usize,
    priority: ChunkPriority,
) -> Result<()> {
    ensure!(num_simultaneous >= 1, "illegal number of simultaneous conversions: {}", num_simultaneous);
    let permits = Arc::new(Semaphore::new(num_simultaneous));

    let mut coverages = cache.coverages.clone();
    coverages.sort_by_key(|c| (coverage_significance(&c.name), c.name.clone()));

    let priority_fn: Arc<dyn Fn(ChunkKey) -> ChunkPriority + Send + Sync> =
        Arc::new(move |_| priority);

    for coverage in &coverages {
        for library in &cache.libraries {
            permits.acquire();
            let key = ChunkKey {
                library_num: library.library_num,
                coverage_num: coverage.coverage_num,
            };
            let permits = Arc::clone(&permits);
            cache.get_chunk(key, Arc::clone(&priority_fn), move |_chunk| {
                permits.release();
            });
        }
    }

    for _ in 0..num_simultaneous {
        permits.acquire();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatchart::AttrValue;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn chunk_records_round_trip() {
        let mut bytes = vec![0u8; 2 * LONGS_PER_RENDER_CHUNK * 8];
        let chunk = RenderChunk {
            key: ChunkKey { library_num: 2, coverage_num: 5 },
            feature_count: 117,
            group_first: 30,
            group_count: 4,
            label_char_first: 9000,
            label_char_count: 64,
            label_length_first: 400,
            label_length_count: 12,
            vertex_coord_first: 5_500_000_000,
            vertex_coord_count: 7200,
        };
        write_chunk_record(&mut bytes, 1, &chunk);

        let reread = read_chunk_record(&bytes, 1);
        assert_eq!(reread.key, chunk.key);
        assert_eq!(reread.feature_count, 117);
        assert_eq!(reread.group_first, 30);
        assert_eq!(reread.group_count, 4);
        assert_eq!(reread.vertex_coord_first, 5_500_000_000);
        assert_eq!(reread.vertex_coord_count, 7200);
    }

    #[test]
    fn group_records_round_trip() {
        let mut bytes = vec![0u8; 3 * INTS_PER_RENDER_GROUP * 4];
        let group = RenderGroup {
            assignment_id: 1234,
            label_first: 2,
            label_char_first: 16,
            label_char_count: 9,
            label_length_first: 4,
            label_length_count: 3,
            vertex_coord_first: 840,
            triangle_coord_count: 90,
            line_coord_count: 48,
            icon_coord_count: 8,
            label_coord_count: 6,
        };
        write_group_record(&mut bytes, 2, &group);
        assert_eq!(read_group_record(&bytes, 2), group);
    }

    #[test]
    fn group_vertex_sections_order_triangles_lines_icons_labels() {
        let group = RenderGroup {
            assignment_id: 0,
            label_first: 0,
            label_char_first: 0,
            label_char_count: 0,
            label_length_first: 0,
            label_length_count: 0,
            vertex_coord_first: 100,
            triangle_coord_count: 9,
            line_coord_count: 8,
            icon_coord_count: 4,
            label_coord_count: 3,
        };
        assert_eq!(group.triangle_coord_first(), 100);
        assert_eq!(group.line_coord_first(), 109);
        assert_eq!(group.icon_coord_first(), 117);
        assert_eq!(group.label_coord_first(), 121);
    }

    #[test]
    fn config_string_names_assignments_and_external_attrs() {
        let parent = tempdir().unwrap();
        let dir = parent.path().join("flat00");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(flatchart::CHARSET_FILENAME), "UTF-8").unwrap();
        fs::write(dir.join(flatchart::CHECKSUM_FILENAME), "cccc3333").unwrap();

        let mut config = RenderCacheConfig::new(
            parent.path().to_path_buf(),
            PathBuf::from("/unused"),
            "full-assignments".to_string(),
            Vec::new(),
        );
        config
            .external_attrs
            .insert("zmax".to_string(), AttrValue::Double(12.5));

        let s = render_config_string(&config).unwrap();
        assert!(s.starts_with("formatVersion = 13\n\nflatDirs =\n"));
        assert!(s.contains("    flat00 : cccc3333\n"));
        assert!(s.contains("geosymAssignments = full-assignments\n"));
        assert!(s.contains("isdm = 0 (integer)\n"));
        assert!(s.contains("zmax = 12.5 (double)\n"));
    }
}

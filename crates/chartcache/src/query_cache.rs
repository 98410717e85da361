//! The query cache: one serialized spatial tree per chunk, appended to a
//! shared `trees` file under the cross-process commit protocol, searched
//! in place through read-only mappings.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use log::debug;
use memmap2::MmapOptions;

use flatchart::{Charset, FeatureKind};

use crate::cachedir::{
    self, cache_dir, create_cursor_file, create_sized_file, flat_dirs_config_section,
    read_charset_file, read_coverages_file, read_libraries_file, verify_config,
    write_charset_file, write_config_file, write_coverages_file, write_libraries_file,
    CursorFile, MutexFile, RwMap, GIB,
};
use crate::databases::FlatDatabases;
use crate::model::{coverage_significance, ChunkKey, ChunkPriority, Coverage, Library};
use crate::proj::{PlateCarree, Projection};
use crate::render_build::{area_triangle_coords, project_ring, FLOATS_PER_TRIANGLE_VERTEX};
use crate::sched::{ChunkJobScheduler, Semaphore};
use crate::tree::{Tree, TreeCounts};
use crate::tree_build::TreeBuilder;

pub const QUERY_FORMAT_VERSION: &str = "1";
pub const QUERY_CACHE_DIR_PREFIX: &str = "query-cache";
pub const TREES_FILENAME: &str = "trees";

pub const LONGS_PER_QUERY_CHUNK: usize = 8;

pub struct QueryCacheConfig {
    pub flat_parent_dir: PathBuf,
    pub query_parent_dir: PathBuf,
    pub proj: Arc<dyn Projection>,
    pub proj_points_per_bounds_edge: usize,
    pub trees_file_size: u64,
    pub reload_chunks_table_before_converting: bool,
    pub charset: Charset,
}

impl QueryCacheConfig {
    pub fn new(flat_parent_dir: PathBuf, query_parent_dir: PathBuf) -> QueryCacheConfig {
        QueryCacheConfig {
            flat_parent_dir,
            query_parent_dir,
            proj: Arc::new(PlateCarree),
            proj_points_per_bounds_edge: 2,
            trees_file_size: 50 * GIB,
            reload_chunks_table_before_converting: false,
            charset: Charset::Utf8,
        }
    }
}

pub fn query_config_string(config: &QueryCacheConfig) -> Result<String> {
    let mut s = String::new();
    s.push_str(&format!("formatVersion = {}\n", QUERY_FORMAT_VERSION));
    s.push('\n');
    s.push_str(&flat_dirs_config_section(&config.flat_parent_dir)?);
    s.push('\n');
    s.push_str(&format!("proj = {}\n", config.proj.config_string()));
    Ok(s)
}

/// One committed chunk record: where its tree's words sit in the `trees`
/// file, and the record counts needed to decode them.
#[derive(Debug, Clone, Copy)]
pub struct QueryChunk {
    pub key: ChunkKey,
    pub tree_word_first: i64,
    pub counts: TreeCounts,
}

fn read_chunk_record(bytes: &[u8], record: usize) -> QueryChunk {
    let at = record * LONGS_PER_QUERY_CHUNK * 8;
    let long = |i: usize| -> i64 {
        let o = at + i * 8;
        i64::from_ne_bytes(bytes[o..o + 8].try_into().unwrap())
    };
    QueryChunk {
        key: ChunkKey { library_num: long(0) as i32, coverage_num: long(1) as i32 },
        tree_word_first: long(2),
        counts: TreeCounts {
            interior_nodes: long(3) as usize,
            leaf_nodes: long(4) as usize,
            points: long(5) as usize,
            lines: long(6) as usize,
            triangles: long(7) as usize,
        },
    }
}

fn write_chunk_record(bytes: &mut [u8], record: usize, chunk: &QueryChunk) {
    let at = record * LONGS_PER_QUERY_CHUNK * 8;
    let longs = [
        chunk.key.library_num as i64,
        chunk.key.coverage_num as i64,
        chunk.tree_word_first,
        chunk.counts.interior_nodes as i64,
        chunk.counts.leaf_nodes as i64,
        chunk.counts.points as i64,
        chunk.counts.lines as i64,
        chunk.counts.triangles as i64,
    ];
    for (i, v) in longs.iter().enumerate() {
        let o = at + i * 8;
        bytes[o..o + 8].copy_from_slice(&v.to_ne_bytes());
    }
}

/// Commit-side state, guarded by an in-process mutex; the cross-process
/// mutex file is additionally held for every access, because the cursor
/// is the one thing in the directory that gets overwritten.
struct CommitState {
    cursor: CursorFile,
    chunks: RwMap,
    /// Records already absorbed into the trees map.
    loaded: u32,
}

/// A query for some window of some set of chunks. The callback receives each
/// chunk's matching feature numbers as that chunk becomes available.
#[derive(Debug, Clone)]
pub struct SpatialQuery {
    pub chunk_keys: Vec<ChunkKey>,
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

pub struct QueryCache {
    pub libraries: Vec<Library>,
    pub coverages: Vec<Coverage>,

    databases: FlatDatabases,
    proj: Arc<dyn Projection>,
    reload_chunks_table_before_converting: bool,

    trees_path: PathBuf,
    mutex: MutexFile,
    commit: Mutex<CommitState>,
    trees: Mutex<HashMap<ChunkKey, Arc<Tree>>>,

    scheduler: ChunkJobScheduler,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache").finish_non_exhaustive()
    }
}

impl QueryCache {
    pub fn open(config: QueryCacheConfig, num_converter_threads: usize) -> Result<Arc<QueryCache>> {
        let scheduler = ChunkJobScheduler::new("query-cache", num_converter_threads)?;
        let databases = FlatDatabases::open(&config.flat_parent_dir)?;

        let config_string = query_config_string(&config)?;
        let dir = cache_dir(&config.query_parent_dir, QUERY_CACHE_DIR_PREFIX, &config_string);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;

        let mutex = MutexFile::open(&dir.join(cachedir::MUTEX_FILENAME))?;

        let cursor_path = dir.join(cachedir::CURSOR_FILENAME);
        let chunks_path = dir.join(cachedir::CHUNKS_FILENAME);
        let trees_path = dir.join(TREES_FILENAME);
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
                    (libraries.len() * coverages.len() * LONGS_PER_QUERY_CHUNK * 8) as u64;
                create_sized_file(&chunks_path, chunks_len)?;
                create_sized_file(&trees_path, config.trees_file_size)?;
                create_cursor_file(&cursor_path)?;
            }
        }

        // Everything but the cursor and the append ranges is immutable once
        // the cursor file exists, so these reads need no lock.
        let charset = read_charset_file(&dir)?;
        verify_config(&dir, &config_string)?;

        let libraries = read_libraries_file(&libraries_path, charset)?;
        let coverages = read_coverages_file(&coverages_path, charset)?;

        let cache = Arc::new(QueryCache {
            libraries,
            coverages,
            databases,
            proj: Arc::clone(&config.proj),
            reload_chunks_table_before_converting: config.reload_chunks_table_before_converting,
            trees_path,
            mutex,
            commit: Mutex::new(CommitState {
                cursor: CursorFile::open(&cursor_path)?,
                chunks: RwMap::open(&chunks_path)?,
                loaded: 0,
            }),
            trees: Mutex::new(HashMap::new()),
            scheduler,
        });

        {
            let mut commit = cache.lock_commit();
            let _guard = cache.mutex.lock()?;
            cache.absorb_new_chunks(&mut commit)?;
        }

        Ok(cache)
    }

    fn lock_commit(&self) -> std::sync::MutexGuard<'_, CommitState> {
        match self.commit.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_trees(&self) -> std::sync::MutexGuard<'_, HashMap<ChunkKey, Arc<Tree>>> {
        match self.trees.lock() {
            Ok(trees) => trees,
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

    /// Loads chunk records committed since the last absorb (by this or any
    /// other process) into the trees map. Caller holds the mutex file.
    fn absorb_new_chunks(&self, commit: &mut CommitState) -> Result<()> {
        let cursor = commit.cursor.get();
        let mut trees = self.lock_trees();
        for record in commit.loaded..cursor {
            let chunk = read_chunk_record(commit.chunks.bytes(), record as usize);
            debug!("Found externally converted chunk: {}", self.describe(chunk.key));
            let tree = Arc::new(self.map_tree(&chunk)?);
            trees.insert(chunk.key, tree);
        }
        commit.loaded = cursor;
        Ok(())
    }

    /// Maps a committed tree's word range read-only. Committed ranges are
    /// never rewritten, so the mapping needs no lock.
    fn map_tree(&self, chunk: &QueryChunk) -> Result<Tree> {
        let word_count = chunk.counts.total_words();
        if word_count == 0 {
            return Tree::from_words(Vec::new(), chunk.counts);
        }
        let file = File::open(&self.trees_path)
            .with_context(|| format!("failed to open {}", self.trees_path.display()))?;
        let map = unsafe {
            MmapOptions::new()
                .offset(chunk.tree_word_first as u64 * 4)
                .len(word_count * 4)
                .map(&file)?
        };
        Tree::from_mapped(map, chunk.counts)
    }

    /// Searches each requested chunk's tree, converting chunks that are not
    /// cached yet. The callback runs once per chunk that is neither skipped
    /// nor abandoned.
    pub fn run_query<F>(
        self: &Arc<Self>,
        query: &SpatialQuery,
        priority_fn: Arc<dyn Fn(ChunkKey) -> ChunkPriority + Send + Sync>,
        callback: F,
    ) where
        F: Fn(ChunkKey, std::collections::HashSet<i32>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let (x_min, x_max, y_min, y_max) = (query.x_min, query.x_max, query.y_min, query.y_max);
        for &key in &query.chunk_keys {
            let callback = Arc::clone(&callback);
            self.get_chunk(key, Arc::clone(&priority_fn), move |tree| {
                let feature_nums = tree.search(x_min, x_max, y_min, y_max);
                callback(key, feature_nums);
            });
        }
    }

    /// Hands the chunk's tree to the callback: synchronously on a cache hit,
    /// else from a conversion worker once the chunk is built. A priority of
    /// Skip drops the request.
    pub fn get_chunk<F>(
        self: &Arc<Self>,
        key: ChunkKey,
        priority_fn: Arc<dyn Fn(ChunkKey) -> ChunkPriority + Send + Sync>,
        callback: F,
    ) where
        F: FnOnce(Arc<Tree>) + Send + 'static,
    {
        // Bind the hit first so the map guard drops before the callback runs;
        // a callback may re-enter the cache.
        let hit = self.lock_trees().get(&key).cloned();
        if let Some(tree) = hit {
            callback(tree);
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
        callback: Box<dyn FnOnce(Arc<Tree>) + Send>,
        orig_time: Instant,
        early_priority: ChunkPriority,
        num_deferrals: u32,
    ) {
        let cache = Arc::clone(self);
        let significance = coverage_significance(&self.coverages[key.coverage_num as usize].name);
        self.scheduler.submit(early_priority, significance, move || {
            let hit = cache.lock_trees().get(&key).cloned();
            if let Some(tree) = hit {
                callback(tree);
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

    fn convert_chunk(&self, key: ChunkKey, callback: Box<dyn FnOnce(Arc<Tree>) + Send>) -> Result<()> {
        // Some other thread or process may have committed this very chunk
        // since we enqueued. Usually not worth checking for: the chance is
        // low, and redoing one conversion is cheap.
        if self.reload_chunks_table_before_converting {
            let mut commit = self.lock_commit();
            let _guard = self.mutex.lock()?;
            self.absorb_new_chunks(&mut commit)?;
            let hit = self.lock_trees().get(&key).cloned();
            if let Some(tree) = hit {
                callback(tree);
                return Ok(());
            }
        }

        // Build outside the lock; the expensive part needs no shared state.
        let image = self.build_tree(key)?;
        let counts = image.counts();
        let words = image.to_words();

        let mut commit = self.lock_commit();
        let _guard = self.mutex.lock()?;

        self.absorb_new_chunks(&mut commit)?;
        let hit = self.lock_trees().get(&key).cloned();
        if let Some(tree) = hit {
            callback(tree);
            return Ok(());
        }

        let chunk_next = commit.cursor.get();
        let tree_word_next = if chunk_next > 0 {
            let last = read_chunk_record(commit.chunks.bytes(), chunk_next as usize - 1);
            last.tree_word_first + last.counts.total_words() as i64
        } else {
            0
        };

        let chunk = QueryChunk { key, tree_word_first: tree_word_next, counts };

        let trees_map = if words.is_empty() {
            None
        } else {
            let mut map = RwMap::open_range(
                &self.trees_path,
                tree_word_next as u64 * 4,
                words.len() * 4,
            )?;
            map.bytes_mut().copy_from_slice(bytemuck::cast_slice(&words));
            Some(map)
        };

        write_chunk_record(commit.chunks.bytes_mut(), chunk_next as usize, &chunk);

        let tree = Arc::new(Tree::from_words(words, counts)?);
        {
            let mut trees = self.lock_trees();
            debug!("Finished converting chunk: {}", self.describe(key));
            trees.insert(key, Arc::clone(&tree));
        }
        commit.loaded = chunk_next + 1;

        callback(tree);

        // Another process must never see the index record before the words
        // it points at, nor the cursor before the index record.
        if let Some(map) = &trees_map {
            map.force()?;
        }
        commit.chunks.force()?;
        commit.cursor.set(chunk_next + 1);
        commit.cursor.force()?;

        Ok(())
    }

    /// Builds the chunk's spatial tree from flat features: points as points,
    /// line strips as segments, area fills as tessellated triangles. Item
    /// feature numbers are chunk-local.
    fn build_tree(&self, key: ChunkKey) -> Result<crate::tree_build::TreeImage> {
        let library = &self.libraries[key.library_num as usize];
        let coverage = &self.coverages[key.coverage_num as usize];

        let mut builder =
            TreeBuilder::new(library.x_min, library.x_max, library.y_min, library.y_max);

        let database = self
            .databases
            .get(library.database_num)
            .with_context(|| format!("no flat database numbered {}", library.database_num))?;

        if let Some(flat_key) = database.flat_chunk_key(&library.name, &coverage.name) {
            let proj = self.proj.as_ref();
            for (feature_num, feature) in database.store.features(flat_key)?.iter().enumerate() {
                let feature_num = feature_num as i32;
                match feature.kind {
                    FeatureKind::Point => {
                        let vertex = database.store.read_point_vertex(feature.item_first)?;
                        let [x, y] = proj.project_pos(vertex[0], vertex[1]);
                        builder.add_point(feature_num, x, y);
                    }
                    FeatureKind::Line => {
                        let vertices =
                            database.store.read_line_vertices(feature.item_first, feature.item_count)?;
                        let xys = project_ring(&vertices, proj);
                        for seg in xys.windows(4).step_by(2) {
                            builder.add_line(feature_num, seg[0], seg[1], seg[2], seg[3]);
                        }
                    }
                    FeatureKind::Area => {
                        let rings =
                            database.store.read_area_rings(feature.item_first, feature.item_count)?;
                        let xy_rings: Vec<Vec<f32>> =
                            rings.iter().map(|r| project_ring(r, proj)).collect();
                        let coords = area_triangle_coords(feature_num, &xy_rings);
                        for tri in coords.chunks_exact(3 * FLOATS_PER_TRIANGLE_VERTEX) {
                            builder.add_triangle(
                                feature_num,
                                tri[0], tri[1], tri[3], tri[4], tri[6], tri[7],
                            );
                        }
                    }
                }
            }
        }

        Ok(builder.build())
    }
}

/// Converts every library/coverage chunk, most significant coverages first,
/// with at most `num_simultaneous` conversions in flight. Returns once all
/// chunks are committed.
pub fn convert_all_chunks(
    cache: &Arc<QueryCache>,
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
            cache.get_chunk(key, Arc::clone(&priority_fn), move |_tree| {
                permits.release();
            });
        }
    }

    for _ in 0..num_simultaneous {
        permits.acquire();
    }
    Ok(())
}

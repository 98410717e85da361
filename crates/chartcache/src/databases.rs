//! The set of open flat databases behind a cache, with the name-to-number
//! lookups both caches need to go from cache chunk keys back to flat chunks.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use flatchart::{flat_child_dirs, FlatChunkKey, FlatStore};

use crate::model::{Coverage, Library};
use crate::proj::{compute_xy_min_max, Projection};

pub struct FlatDatabase {
    pub store: FlatStore,
    library_nums: HashMap<String, i32>,
    coverage_nums: HashMap<String, i32>,
}

impl FlatDatabase {
    fn new(store: FlatStore) -> FlatDatabase {
        let library_nums = store
            .library_names
            .iter()
            .map(|(&num, name)| (name.clone(), num))
            .collect();
        let coverage_nums = store
            .coverage_names
            .iter()
            .map(|(&num, name)| (name.clone(), num))
            .collect();
        FlatDatabase { store, library_nums, coverage_nums }
    }

    /// Flat chunk key for a cache library/coverage pair, if this database
    /// carries both names.
    pub fn flat_chunk_key(&self, library_name: &str, coverage_name: &str) -> Option<FlatChunkKey> {
        Some(FlatChunkKey {
            library_num: *self.library_nums.get(library_name)?,
            coverage_num: *self.coverage_nums.get(coverage_name)?,
        })
    }
}

/// All flat child databases under one parent dir, in database-number order.
pub struct FlatDatabases {
    databases: Vec<FlatDatabase>,
    by_num: HashMap<i32, usize>,
}

impl FlatDatabases {
    pub fn open(flat_parent_dir: &Path) -> Result<FlatDatabases> {
        let mut databases = Vec::new();
        let mut by_num = HashMap::new();
        for dir in flat_child_dirs(flat_parent_dir)? {
            let store = FlatStore::open(&dir)
                .with_context(|| format!("failed to open flat database {}", dir.display()))?;
            by_num.insert(store.database_num, databases.len());
            databases.push(FlatDatabase::new(store));
        }
        Ok(FlatDatabases { databases, by_num })
    }

    pub fn get(&self, database_num: i32) -> Option<&FlatDatabase> {
        self.by_num.get(&database_num).map(|&i| &self.databases[i])
    }

    /// Cache library list: every flat library the projection can handle, with
    /// projected bounds. Each database carries its own BROWSE (whole-region
    /// overview) library; only the first is kept.
    pub fn discover_libraries(
        &self,
        proj: &dyn Projection,
        proj_points_per_bounds_edge: usize,
    ) -> Result<Vec<Library>> {
        let mut libraries = Vec::new();
        let mut have_browse_library = false;
        for database in &self.databases {
            let database_num = database.store.database_num;
            for flat_library_num in 0..database.store.library_count() {
                let flat_library_num = flat_library_num as i32;
                let name = database
                    .store
                    .library_names
                    .get(&flat_library_num)
                    .with_context(|| {
                        format!("flat database {} has no name for library {}", database_num, flat_library_num)
                    })?
                    .clone();
                let bounds = database.store.library_bounds(flat_library_num)?;

                if !proj.can_project_library(database_num, &name, bounds) {
                    debug!(
                        "Skipping a library that the projection cannot handle: database = {}, library = {}",
                        database_num, name
                    );
                    continue;
                }

                let is_browse = name.eq_ignore_ascii_case("BROWSE");
                if is_browse && have_browse_library {
                    continue;
                }
                have_browse_library |= is_browse;

                let [x_min, x_max, y_min, y_max] =
                    compute_xy_min_max(proj, proj_points_per_bounds_edge, bounds);
                libraries.push(Library {
                    library_num: libraries.len() as i32,
                    database_num,
                    name,
                    x_min,
                    x_max,
                    y_min,
                    y_max,
                });
            }
        }
        Ok(libraries)
    }

    /// Cache coverage list: the union of coverage names across databases, in
    /// first-seen order.
    pub fn discover_coverages(&self) -> Vec<Coverage> {
        let mut coverages: Vec<Coverage> = Vec::new();
        for database in &self.databases {
            let mut nums: Vec<i32> = database.store.coverage_names.keys().copied().collect();
            nums.sort_unstable();
            for num in nums {
                let name = &database.store.coverage_names[&num];
                if !coverages.iter().any(|c| &c.name == name) {
                    coverages.push(Coverage {
                        coverage_num: coverages.len() as i32,
                        name: name.clone(),
                    });
                }
            }
        }
        coverages
    }
}

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::time::Instant;

use chartcache::model::ChunkPriority;
use chartcache::{query_cache, render_cache, QueryCacheConfig, RenderCacheConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CacheKind {
    Query,
    Render,
    Both,
}

#[derive(Parser, Debug)]
#[command(name = "flat2cache", version)]
struct Args {
    /// Parent dir containing flatNN child dirs.
    #[arg(long)]
    flat_dir: PathBuf,

    /// Parent dir to hold the cache dirs.
    #[arg(long)]
    cache_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = CacheKind::Both)]
    kind: CacheKind,

    /// Conversion worker threads per cache.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Chunk conversions in flight at once.
    #[arg(long, default_value_t = 16)]
    simultaneous: usize,

    /// Query tree-data file size in bytes.
    #[arg(long)]
    trees_file_size: Option<u64>,

    /// Render vertex file size in bytes.
    #[arg(long)]
    vertices_file_size: Option<u64>,
}

fn convert_query_cache(args: &Args) -> Result<()> {
    let mut config =
        QueryCacheConfig::new(args.flat_dir.clone(), args.cache_dir.clone());
    if let Some(size) = args.trees_file_size {
        config.trees_file_size = size;
    }

    let start = Instant::now();
    let cache = chartcache::QueryCache::open(config, args.workers)?;
    let chunk_count = cache.libraries.len() * cache.coverages.len();
    info!(
        "Converting query cache: libraries = {}, coverages = {}, chunks = {}",
        cache.libraries.len(),
        cache.coverages.len(),
        chunk_count
    );

    query_cache::convert_all_chunks(&cache, args.simultaneous, ChunkPriority::Default)?;
    info!(
        "Converted query cache: chunks = {}, elapsed = {:.1} s",
        chunk_count,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn convert_render_cache(args: &Args) -> Result<()> {
    // Symbology rule files are loaded by the embedding application; a cache
    // built here carries chunk structure but no symbol groups.
    warn!("Converting render cache with no symbology assignments; chunks will have empty groups");

    let mut config = RenderCacheConfig::new(
        args.flat_dir.clone(),
        args.cache_dir.clone(),
        "none".to_string(),
        Vec::new(),
    );
    if let Some(size) = args.vertices_file_size {
        config.vertices_file_size = size;
    }

    let start = Instant::now();
    let cache = chartcache::RenderCache::open(config, args.workers)?;
    let chunk_count = cache.libraries.len() * cache.coverages.len();
    info!(
        "Converting render cache: libraries = {}, coverages = {}, chunks = {}",
        cache.libraries.len(),
        cache.coverages.len(),
        chunk_count
    );

    render_cache::convert_all_chunks(&cache, args.simultaneous, ChunkPriority::Default)?;
    info!(
        "Converted render cache: chunks = {}, elapsed = {:.1} s",
        chunk_count,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.kind {
        CacheKind::Query => convert_query_cache(&args)?,
        CacheKind::Render => convert_render_cache(&args)?,
        CacheKind::Both => {
            convert_query_cache(&args)?;
            convert_render_cache(&args)?;
        }
    }
    Ok(())
}

//! Reader for flat chart databases: a directory of memory-mapped tables
//! produced by an offline extraction step, one directory per database.
//!
//! Directory contents (all binary tables native-endian):
//!   charset         : text, charset label for every string in the database
//!   checksum        : text, content digest of the source data
//!   library-names   : text, lines "<id> <name>"
//!   coverage-names  : text, lines "<id> <name>"
//!   fcode-names     : text, lines "<id> <name>"
//!   attr-names      : text, lines "<id> <name>"
//!   chunks          : i32[4] per record: libraryNum, coverageNum,
//!                     featureFirst, featureCount
//!   libraries       : f64[4] per library: minLat, maxLat, minLon, maxLon (deg)
//!   features        : i32[6] per feature: fcodeId, typeTag, attrFirst,
//!                     attrCount, itemFirst, itemCount
//!   rings           : i32[2] per ring: vertexFirst, vertexCount
//!   vertices        : f64[2] per vertex: lat, lon (deg)
//!   attrs           : i64[2] per attribute: nameId/typeTag word, value word
//!   strings         : byte heap for out-of-line attribute strings
//!
//! A feature's `itemFirst`/`itemCount` index into `rings` for areas, into
//! `vertices` for lines, and name a single vertex for points.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

pub const INTS_PER_CHUNK: usize = 4;
pub const DOUBLES_PER_LIBRARY: usize = 4;
pub const INTS_PER_FEATURE: usize = 6;
pub const INTS_PER_RING: usize = 2;
pub const DOUBLES_PER_VERTEX: usize = 2;
pub const LONGS_PER_ATTR: usize = 2;

pub const CHARSET_FILENAME: &str = "charset";
pub const CHECKSUM_FILENAME: &str = "checksum";
pub const LIBRARY_NAMES_FILENAME: &str = "library-names";
pub const COVERAGE_NAMES_FILENAME: &str = "coverage-names";
pub const FCODE_NAMES_FILENAME: &str = "fcode-names";
pub const ATTR_NAMES_FILENAME: &str = "attr-names";
pub const CHUNKS_FILENAME: &str = "chunks";
pub const LIBRARIES_FILENAME: &str = "libraries";
pub const FEATURES_FILENAME: &str = "features";
pub const RINGS_FILENAME: &str = "rings";
pub const VERTICES_FILENAME: &str = "vertices";
pub const ATTRS_FILENAME: &str = "attrs";
pub const STRINGS_FILENAME: &str = "strings";

#[cold]
fn bad(msg: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg)
}

#[inline(always)]
fn i32_at(buf: &[u8], index: usize) -> io::Result<i32> {
    let at = index * 4;
    let b = buf
        .get(at..at + 4)
        .ok_or_else(|| bad("read past end of table"))?;
    Ok(i32::from_ne_bytes(b.try_into().unwrap()))
}

#[inline(always)]
fn i64_at(buf: &[u8], index: usize) -> io::Result<i64> {
    let at = index * 8;
    let b = buf
        .get(at..at + 8)
        .ok_or_else(|| bad("read past end of table"))?;
    Ok(i64::from_ne_bytes(b.try_into().unwrap()))
}

#[inline(always)]
fn f64_at(buf: &[u8], index: usize) -> io::Result<f64> {
    Ok(f64::from_bits(i64_at(buf, index)? as u64))
}

/// Charset label stored in the database; applies to the name tables, the
/// checksum, and every attribute string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Ascii,
    Utf8,
    Latin1,
}

impl Charset {
    pub fn from_label(label: &str) -> io::Result<Charset> {
        match label.trim() {
            "US-ASCII" | "ASCII" => Ok(Charset::Ascii),
            "UTF-8" | "UTF8" => Ok(Charset::Utf8),
            "ISO-8859-1" | "LATIN-1" => Ok(Charset::Latin1),
            other => Err(bad(&format!("unsupported charset {:?}", other))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Charset::Ascii => "US-ASCII",
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
        }
    }

    pub fn decode(self, bytes: &[u8]) -> io::Result<String> {
        match self {
            Charset::Ascii => {
                if !bytes.is_ascii() {
                    return Err(bad("non-ASCII byte in US-ASCII string"));
                }
                // ASCII is a UTF-8 subset
                Ok(std::str::from_utf8(bytes).map_err(|_| bad("bad ASCII string"))?.to_string())
            }
            Charset::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|_| bad("bad UTF-8 string")),
            Charset::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn encode(self, text: &str) -> io::Result<Vec<u8>> {
        match self {
            Charset::Ascii => {
                if !text.is_ascii() {
                    return Err(bad("non-ASCII char in US-ASCII string"));
                }
                Ok(text.as_bytes().to_vec())
            }
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(c as u32).map_err(|_| bad("char outside ISO-8859-1 range")))
                .collect(),
        }
    }
}

/// Identifies one chunk (all features of one coverage of one library).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlatChunkKey {
    pub library_num: i32,
    pub coverage_num: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct FlatChunk {
    pub key: FlatChunkKey,
    pub feature_first: i32,
    pub feature_count: i32,
}

/// Lat/lon bounding box of one library, degrees.
#[derive(Debug, Clone, Copy)]
pub struct LatLonBounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Point,
    Line,
    Area,
}

impl FeatureKind {
    pub fn from_tag(tag: i32) -> io::Result<FeatureKind> {
        match tag {
            0 => Ok(FeatureKind::Point),
            1 => Ok(FeatureKind::Line),
            2 => Ok(FeatureKind::Area),
            _ => Err(bad(&format!("unknown feature type tag {}", tag))),
        }
    }

    /// Delineation string used by symbology assignment rules.
    pub fn delineation(self) -> &'static str {
        match self {
            FeatureKind::Point => "Point",
            FeatureKind::Line => "Line",
            FeatureKind::Area => "Area",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FlatFeature {
    pub feature_num: i32,
    pub fcode_id: i32,
    pub kind: FeatureKind,
    pub attr_first: i32,
    pub attr_count: i32,
    pub item_first: i32,
    pub item_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i32),
    Double(f64),
    Text(String),
}

/// Attribute list of one feature, in database order.
#[derive(Debug, Clone, Default)]
pub struct FeatureAttrs {
    pairs: Vec<(String, AttrValue)>,
}

impl FeatureAttrs {
    pub fn new() -> FeatureAttrs {
        FeatureAttrs { pairs: Vec::new() }
    }

    pub fn push(&mut self, name: String, value: AttrValue) {
        self.pairs.push((name, value));
    }

    /// Linear lookup; attribute lists are short.
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Child directories of `parent` named `flatNN` (two decimal digits), sorted
/// by name. The digits are the database number.
pub fn flat_child_dirs(parent: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if parse_database_num(name).is_some() {
                dirs.push(entry.path());
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn parse_database_num(dir_name: &str) -> Option<i32> {
    let digits = dir_name.strip_prefix("flat")?;
    if digits.len() != 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn flat_database_num(dir: &Path) -> io::Result<i32> {
    dir.file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_database_num)
        .ok_or_else(|| bad("flat dir name is not of the form flatNN"))
}

/// Zero-length files cannot be mapped, so each table carries an optional map.
struct Table {
    map: Option<Mmap>,
}

impl Table {
    fn open(path: &Path) -> io::Result<Table> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { memmap2::MmapOptions::new().map(&file)? })
        };
        Ok(Table { map })
    }

    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

fn read_text_file(dir: &Path, name: &str, charset: Charset) -> io::Result<String> {
    let bytes = fs::read(dir.join(name))?;
    charset.decode(&bytes)
}

fn read_names_file(dir: &Path, name: &str, charset: Charset) -> io::Result<HashMap<i32, String>> {
    let text = read_text_file(dir, name, charset)?;
    let mut names = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| bad(&format!("malformed line in {}: {:?}", name, line)))?;
        let id: i32 = id
            .parse()
            .map_err(|_| bad(&format!("malformed id in {}: {:?}", name, line)))?;
        names.insert(id, rest.trim().to_string());
    }
    Ok(names)
}

/// One open flat database. All binary tables stay memory-mapped; reads are
/// bounds-checked slices, no table is loaded eagerly except the chunk index
/// and library bounds.
pub struct FlatStore {
    dir: PathBuf,
    pub database_num: i32,
    pub charset: Charset,
    pub checksum: String,
    pub library_names: HashMap<i32, String>,
    pub coverage_names: HashMap<i32, String>,
    pub fcode_names: HashMap<i32, String>,
    pub attr_names: HashMap<i32, String>,
    library_bounds: Vec<LatLonBounds>,
    chunks: Vec<FlatChunk>,
    chunk_index: HashMap<FlatChunkKey, usize>,
    features: Table,
    rings: Table,
    vertices: Table,
    attrs: Table,
    strings: Table,
}

/// Charset of one flat database, read without opening the whole store.
pub fn read_flat_charset(dir: &Path) -> io::Result<Charset> {
    let label = fs::read_to_string(dir.join(CHARSET_FILENAME))?;
    Charset::from_label(&label)
}

/// Ingest checksum of one flat database, read without opening the whole
/// store. Cache config strings embed it to tie a cache to its source data.
pub fn read_flat_checksum(dir: &Path) -> io::Result<String> {
    let charset = read_flat_charset(dir)?;
    Ok(read_text_file(dir, CHECKSUM_FILENAME, charset)?.trim().to_string())
}

impl FlatStore {
    pub fn open(dir: &Path) -> io::Result<FlatStore> {
        let database_num = flat_database_num(dir)?;

        let charset = read_flat_charset(dir)?;
        let checksum = read_text_file(dir, CHECKSUM_FILENAME, charset)?.trim().to_string();

        let library_names = read_names_file(dir, LIBRARY_NAMES_FILENAME, charset)?;
        let coverage_names = read_names_file(dir, COVERAGE_NAMES_FILENAME, charset)?;
        let fcode_names = read_names_file(dir, FCODE_NAMES_FILENAME, charset)?;
        let attr_names = read_names_file(dir, ATTR_NAMES_FILENAME, charset)?;

        let libs_bytes = fs::read(dir.join(LIBRARIES_FILENAME))?;
        if libs_bytes.len() % (DOUBLES_PER_LIBRARY * 8) != 0 {
            return Err(bad("libraries table size is not a record multiple"));
        }
        let library_count = libs_bytes.len() / (DOUBLES_PER_LIBRARY * 8);
        let mut library_bounds = Vec::with_capacity(library_count);
        for lib in 0..library_count {
            let at = lib * DOUBLES_PER_LIBRARY;
            library_bounds.push(LatLonBounds {
                lat_min: f64_at(&libs_bytes, at)?,
                lat_max: f64_at(&libs_bytes, at + 1)?,
                lon_min: f64_at(&libs_bytes, at + 2)?,
                lon_max: f64_at(&libs_bytes, at + 3)?,
            });
        }

        let chunks_bytes = fs::read(dir.join(CHUNKS_FILENAME))?;
        if chunks_bytes.len() % (INTS_PER_CHUNK * 4) != 0 {
            return Err(bad("chunks table size is not a record multiple"));
        }
        let chunk_count = chunks_bytes.len() / (INTS_PER_CHUNK * 4);
        let mut chunks = Vec::with_capacity(chunk_count);
        let mut chunk_index = HashMap::with_capacity(chunk_count);
        for c in 0..chunk_count {
            let at = c * INTS_PER_CHUNK;
            let key = FlatChunkKey {
                library_num: i32_at(&chunks_bytes, at)?,
                coverage_num: i32_at(&chunks_bytes, at + 1)?,
            };
            chunk_index.insert(key, chunks.len());
            chunks.push(FlatChunk {
                key,
                feature_first: i32_at(&chunks_bytes, at + 2)?,
                feature_count: i32_at(&chunks_bytes, at + 3)?,
            });
        }

        Ok(FlatStore {
            dir: dir.to_path_buf(),
            database_num,
            charset,
            checksum,
            library_names,
            coverage_names,
            fcode_names,
            attr_names,
            library_bounds,
            chunks,
            chunk_index,
            features: Table::open(&dir.join(FEATURES_FILENAME))?,
            rings: Table::open(&dir.join(RINGS_FILENAME))?,
            vertices: Table::open(&dir.join(VERTICES_FILENAME))?,
            attrs: Table::open(&dir.join(ATTRS_FILENAME))?,
            strings: Table::open(&dir.join(STRINGS_FILENAME))?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn library_count(&self) -> usize {
        self.library_bounds.len()
    }

    pub fn library_bounds(&self, library_num: i32) -> io::Result<LatLonBounds> {
        self.library_bounds
            .get(library_num as usize)
            .copied()
            .ok_or_else(|| bad("library num out of range"))
    }

    pub fn chunks(&self) -> impl Iterator<Item = &FlatChunk> {
        self.chunks.iter()
    }

    pub fn chunk(&self, key: FlatChunkKey) -> Option<FlatChunk> {
        self.chunk_index.get(&key).map(|&i| self.chunks[i])
    }

    /// All features of one chunk, or an empty list if the database has no
    /// such chunk (a library need not carry every coverage).
    pub fn features(&self, key: FlatChunkKey) -> io::Result<Vec<FlatFeature>> {
        let chunk = match self.chunk(key) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(chunk.feature_count.max(0) as usize);
        for i in 0..chunk.feature_count {
            out.push(self.feature(chunk.feature_first + i)?);
        }
        Ok(out)
    }

    pub fn feature(&self, feature_num: i32) -> io::Result<FlatFeature> {
        let buf = self.features.bytes();
        let at = feature_num as usize * INTS_PER_FEATURE;
        Ok(FlatFeature {
            feature_num,
            fcode_id: i32_at(buf, at)?,
            kind: FeatureKind::from_tag(i32_at(buf, at + 1)?)?,
            attr_first: i32_at(buf, at + 2)?,
            attr_count: i32_at(buf, at + 3)?,
            item_first: i32_at(buf, at + 4)?,
            item_count: i32_at(buf, at + 5)?,
        })
    }

    pub fn fcode_name(&self, fcode_id: i32) -> io::Result<&str> {
        self.fcode_names
            .get(&fcode_id)
            .map(String::as_str)
            .ok_or_else(|| bad("unknown fcode id"))
    }

    /// Decode one feature's attributes. Word 0 carries the attr-name id in
    /// its high 32 bits and the value type tag in its low byte; word 1 is the
    /// value, interpreted per the tag.
    pub fn read_attrs(&self, attr_first: i32, attr_count: i32) -> io::Result<FeatureAttrs> {
        let buf = self.attrs.bytes();
        let mut attrs = FeatureAttrs::new();
        for i in 0..attr_count {
            let at = (attr_first + i) as usize * LONGS_PER_ATTR;
            let word0 = i64_at(buf, at)?;
            let word1 = i64_at(buf, at + 1)?;

            let name_id = (word0 >> 32) as i32;
            let name = self
                .attr_names
                .get(&name_id)
                .ok_or_else(|| bad("unknown attr name id"))?
                .clone();

            let value = match (word0 & 0xFF) as i32 {
                0 => AttrValue::Int(word1 as i32),
                1 => AttrValue::Double(f64::from_bits(word1 as u64)),
                2 => {
                    let byte_first = (word1 >> 32) as usize;
                    let byte_count = word1 as i32 as usize;
                    let bytes = self
                        .strings
                        .bytes()
                        .get(byte_first..byte_first + byte_count)
                        .ok_or_else(|| bad("attr string range past end of heap"))?;
                    AttrValue::Text(self.charset.decode(bytes)?)
                }
                3 => AttrValue::Text(self.charset.decode(&unpack_string_bytes(word1))?),
                tag => return Err(bad(&format!("unknown attr type tag {}", tag))),
            };

            attrs.push(name, value);
        }
        Ok(attrs)
    }

    /// Rings of one area feature; each ring is a closed loop of
    /// `[lat_deg, lon_deg]` vertices. Ring 0 is the outer boundary, any
    /// further rings are holes.
    pub fn read_area_rings(&self, ring_first: i32, ring_count: i32) -> io::Result<Vec<Vec<[f64; 2]>>> {
        let rings_buf = self.rings.bytes();
        let mut rings = Vec::with_capacity(ring_count.max(0) as usize);
        for r in 0..ring_count {
            let at = (ring_first + r) as usize * INTS_PER_RING;
            let vertex_first = i32_at(rings_buf, at)?;
            let vertex_count = i32_at(rings_buf, at + 1)?;
            rings.push(self.read_line_vertices(vertex_first, vertex_count)?);
        }
        Ok(rings)
    }

    /// `[lat_deg, lon_deg]` vertices of one line feature (or one ring).
    pub fn read_line_vertices(&self, vertex_first: i32, vertex_count: i32) -> io::Result<Vec<[f64; 2]>> {
        let buf = self.vertices.bytes();
        let mut verts = Vec::with_capacity(vertex_count.max(0) as usize);
        for v in 0..vertex_count {
            let at = (vertex_first + v) as usize * DOUBLES_PER_VERTEX;
            verts.push([f64_at(buf, at)?, f64_at(buf, at + 1)?]);
        }
        Ok(verts)
    }

    /// `[lat_deg, lon_deg]` of one point feature.
    pub fn read_point_vertex(&self, vertex_num: i32) -> io::Result<[f64; 2]> {
        let buf = self.vertices.bytes();
        let at = vertex_num as usize * DOUBLES_PER_VERTEX;
        Ok([f64_at(buf, at)?, f64_at(buf, at + 1)?])
    }
}

/// Short strings are packed into the value word itself: length in the top
/// byte, then up to 7 bytes most-significant-first.
fn unpack_string_bytes(packed: i64) -> Vec<u8> {
    let length = ((packed >> 56) & 0xFF) as usize;
    let mut bytes = Vec::with_capacity(length.min(7));
    for i in 0..length.min(7) {
        bytes.push((packed >> (8 * (6 - i))) as u8);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_i32s(dir: &Path, name: &str, vals: &[i32]) {
        let mut f = File::create(dir.join(name)).unwrap();
        for v in vals {
            f.write_all(&v.to_ne_bytes()).unwrap();
        }
    }

    fn write_i64s(dir: &Path, name: &str, vals: &[i64]) {
        let mut f = File::create(dir.join(name)).unwrap();
        for v in vals {
            f.write_all(&v.to_ne_bytes()).unwrap();
        }
    }

    fn write_f64s(dir: &Path, name: &str, vals: &[f64]) {
        let mut f = File::create(dir.join(name)).unwrap();
        for v in vals {
            f.write_all(&v.to_ne_bytes()).unwrap();
        }
    }

    fn attr_word0(name_id: i32, tag: i32) -> i64 {
        ((name_id as i64) << 32) | (tag as i64 & 0xFF)
    }

    fn pack_string(s: &str) -> i64 {
        let bytes = s.as_bytes();
        assert!(bytes.len() <= 7);
        let mut packed = (bytes.len() as i64) << 56;
        for (i, &b) in bytes.iter().enumerate() {
            packed |= (b as i64) << (8 * (6 - i));
        }
        packed
    }

    /// One library, one coverage, three features: a point, a 3-vertex line,
    /// and a square area with no holes.
    fn write_fixture(dir: &Path) {
        fs::write(dir.join("charset"), "UTF-8\n").unwrap();
        fs::write(dir.join("checksum"), "f00dcafe\n").unwrap();
        fs::write(dir.join("library-names"), "0 COA11A\n").unwrap();
        fs::write(dir.join("coverage-names"), "0 nav\n").unwrap();
        fs::write(dir.join("fcode-names"), "0 BUOY\n1 COAST\n2 LAKE\n").unwrap();
        fs::write(dir.join("attr-names"), "0 nam\n1 dep\n2 cnt\n3 lab\n").unwrap();

        write_f64s(dir, "libraries", &[10.0, 20.0, -40.0, -30.0]);
        write_i32s(dir, "chunks", &[0, 0, 0, 3]);

        write_i32s(
            dir,
            "features",
            &[
                0, 0, 0, 2, 0, 0, // point: fcode 0, attrs [0,2), vertex 0
                1, 1, 2, 1, 1, 3, // line: fcode 1, attrs [2,3), vertices [1,4)
                2, 2, 3, 1, 0, 1, // area: fcode 2, attrs [3,4), rings [0,1)
            ],
        );

        write_i32s(dir, "rings", &[4, 5]);
        write_f64s(
            dir,
            "vertices",
            &[
                10.5, -35.0, // point vertex
                11.0, -36.0, 12.0, -36.0, 12.0, -35.0, // line vertices
                14.0, -38.0, 14.0, -37.0, 15.0, -37.0, 15.0, -38.0, 14.0, -38.0, // ring
            ],
        );

        let strings = b"deep water";
        fs::write(dir.join("strings"), strings).unwrap();

        write_i64s(
            dir,
            "attrs",
            &[
                attr_word0(0, 3),
                pack_string("buoy1"),
                attr_word0(1, 1),
                (42.5f64).to_bits() as i64,
                attr_word0(2, 0),
                7,
                attr_word0(3, 2),
                (0i64 << 32) | strings.len() as i64,
            ],
        );
    }

    fn open_fixture() -> (tempfile::TempDir, FlatStore) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("flat03");
        fs::create_dir(&dir).unwrap();
        write_fixture(&dir);
        let store = FlatStore::open(&dir).unwrap();
        (tmp, store)
    }

    #[test]
    fn opens_and_indexes_chunks() {
        let (_tmp, store) = open_fixture();
        assert_eq!(store.database_num, 3);
        assert_eq!(store.checksum, "f00dcafe");
        assert_eq!(store.library_count(), 1);

        let key = FlatChunkKey { library_num: 0, coverage_num: 0 };
        let chunk = store.chunk(key).unwrap();
        assert_eq!(chunk.feature_first, 0);
        assert_eq!(chunk.feature_count, 3);

        let bounds = store.library_bounds(0).unwrap();
        assert_eq!(bounds.lat_min, 10.0);
        assert_eq!(bounds.lon_max, -30.0);

        let missing = FlatChunkKey { library_num: 0, coverage_num: 9 };
        assert!(store.chunk(missing).is_none());
        assert!(store.features(missing).unwrap().is_empty());
    }

    #[test]
    fn reads_feature_geometry() {
        let (_tmp, store) = open_fixture();
        let key = FlatChunkKey { library_num: 0, coverage_num: 0 };
        let features = store.features(key).unwrap();
        assert_eq!(features.len(), 3);

        assert_eq!(features[0].kind, FeatureKind::Point);
        assert_eq!(store.read_point_vertex(features[0].item_first).unwrap(), [10.5, -35.0]);

        assert_eq!(features[1].kind, FeatureKind::Line);
        let line = store
            .read_line_vertices(features[1].item_first, features[1].item_count)
            .unwrap();
        assert_eq!(line, vec![[11.0, -36.0], [12.0, -36.0], [12.0, -35.0]]);

        assert_eq!(features[2].kind, FeatureKind::Area);
        let rings = store
            .read_area_rings(features[2].item_first, features[2].item_count)
            .unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].len(), 5);
        assert_eq!(rings[0][0], rings[0][4]);
    }

    #[test]
    fn decodes_all_attr_value_kinds() {
        let (_tmp, store) = open_fixture();
        let attrs = store.read_attrs(0, 4).unwrap();
        assert_eq!(attrs.len(), 4);
        assert_eq!(attrs.get("nam"), Some(&AttrValue::Text("buoy1".to_string())));
        assert_eq!(attrs.get("dep"), Some(&AttrValue::Double(42.5)));
        assert_eq!(attrs.get("cnt"), Some(&AttrValue::Int(7)));
        assert_eq!(attrs.get("lab"), Some(&AttrValue::Text("deep water".to_string())));

        // order preserved
        let names: Vec<&str> = attrs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["nam", "dep", "cnt", "lab"]);
    }

    #[test]
    fn packed_strings_are_most_significant_first() {
        assert_eq!(unpack_string_bytes(pack_string("abc")), b"abc");
        assert_eq!(unpack_string_bytes(pack_string("1234567")), b"1234567");
        assert_eq!(unpack_string_bytes(pack_string("")), b"");
    }

    #[test]
    fn unknown_tags_are_fatal() {
        let (tmp, _) = open_fixture();
        let dir = tmp.path().join("flat03");

        write_i64s(&dir, "attrs", &[attr_word0(0, 9), 0]);
        let store = FlatStore::open(&dir).unwrap();
        let err = store.read_attrs(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        write_i32s(&dir, "features", &[0, 7, 0, 0, 0, 0]);
        let store = FlatStore::open(&dir).unwrap();
        assert!(store.feature(0).is_err());
    }

    #[test]
    fn discovers_flat_child_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["flat07", "flat03", "flatx", "flat123", "notes"] {
            fs::create_dir(tmp.path().join(name)).unwrap();
        }
        let dirs = flat_child_dirs(tmp.path()).unwrap();
        let names: Vec<_> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["flat03", "flat07"]);
        assert_eq!(flat_database_num(&dirs[1]).unwrap(), 7);
    }
}

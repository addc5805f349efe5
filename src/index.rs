//! Read-only HNSW candidate index over the gallery.
//!
//! The on-disk artifact is an hnswlib `saveIndex` dump (cosine space). All
//! integers are little-endian, `size_t` is 64-bit:
//!
//! ```text
//! [8B offsetLevel0] [8B maxElements] [8B elementCount] [8B sizeDataPerElement]
//! [8B labelOffset] [8B offsetData] [4B maxLevel(i32)] [4B entryPoint(u32)]
//! [8B maxM] [8B maxM0] [8B M] [8B mult(f64)] [8B efConstruction]
//! elementCount x sizeDataPerElement level-0 records:
//!   [2B linkCount] [1B flags, bit 0 = deleted] [1B pad] [maxM0 x 4B links]
//!   [dim x 4B f32 vector] [8B label]
//! For each element:
//!   [4B linkListSize] then linkListSize bytes, one (maxM*4 + 4)-byte block per
//!   upper level, each laid out like the level-0 link header and links.
//! ```
//!
//! The vector dimension is not stored; it is `(labelOffset - offsetData) / 4`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::Path;

use ndarray::Array2;

use crate::error::{MatchError, Result};

pub const DEFAULT_EF: usize = 50;

const DELETE_MARK: u8 = 0x01;
const HEADER_LEN: usize = 8 * 6 + 4 + 4 + 8 * 3 + 8 + 8;

/// A gallery position returned by the index with its approximate cosine distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub position: usize,
    pub distance: f32,
}

#[derive(Debug, Clone)]
struct GraphParams {
    max_elements: usize,
    max_m: usize,
    max_m0: usize,
    m: usize,
    mult: f64,
    ef_construction: usize,
}

#[derive(Debug)]
pub struct CandidateIndex {
    dim: usize,
    params: GraphParams,
    /// Element-major, `dim` floats per element, unit length.
    vectors: Vec<f32>,
    labels: Vec<usize>,
    deleted: Vec<bool>,
    links0: Vec<Vec<u32>>,
    /// `upper[i][l - 1]` holds the links of element `i` on level `l`.
    upper: Vec<Vec<Vec<u32>>>,
    entry_point: u32,
    max_level: usize,
    live: usize,
    ef: usize,
}

impl CandidateIndex {
    /// Load an hnswlib index and check it against the extractor dimension.
    pub fn load(path: &Path, expected_dim: usize, ef: usize) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| MatchError::IndexLoad(format!("reading {}: {e}", path.display())))?;
        let index = Self::from_bytes(&bytes, ef)
            .map_err(|e| MatchError::IndexLoad(format!("{}: {e}", path.display())))?;
        if index.dim != expected_dim {
            return Err(MatchError::IndexLoad(format!(
                "index dimension {} does not match embedding dimension {expected_dim}",
                index.dim
            )));
        }
        log::info!(
            "loaded candidate index: {} elements ({} live), dim {}, max level {}, ef {}",
            index.len(),
            index.live,
            index.dim,
            index.max_level,
            index.ef
        );
        Ok(index)
    }

    /// Exact index for small galleries: one level, every element linked to
    /// every other, labels equal to row positions.
    pub fn exhaustive(vectors: &Array2<f32>, ef: usize) -> Self {
        let (count, dim) = vectors.dim();
        let mut flat = Vec::with_capacity(count * dim);
        for row in vectors.rows() {
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            flat.extend(row.iter().map(|x| if norm > 0.0 { x / norm } else { *x }));
        }
        let links0 = (0..count as u32)
            .map(|i| (0..count as u32).filter(|&j| j != i).collect())
            .collect();
        let max_m0 = count.saturating_sub(1).max(32);

        Self {
            dim,
            params: GraphParams {
                max_elements: count,
                max_m: max_m0 / 2,
                max_m0,
                m: max_m0 / 2,
                mult: 1.0 / ((max_m0 / 2) as f64).ln(),
                ef_construction: 200,
            },
            vectors: flat,
            labels: (0..count).collect(),
            deleted: vec![false; count],
            links0,
            upper: vec![Vec::new(); count],
            entry_point: 0,
            max_level: 0,
            live: count,
            ef: ef.max(1),
        }
    }

    pub fn from_bytes(bytes: &[u8], ef: usize) -> std::result::Result<Self, String> {
        let mut r = ByteReader::new(bytes);

        let offset_level0 = r.size()?;
        let max_elements = r.size()?;
        let count = r.size()?;
        let size_per_element = r.size()?;
        let label_offset = r.size()?;
        let offset_data = r.size()?;
        let max_level = r.i32()?;
        let entry_point = r.u32()?;
        let max_m = r.size()?;
        let max_m0 = r.size()?;
        let m = r.size()?;
        let mult = r.f64()?;
        let ef_construction = r.size()?;

        if offset_level0 != 0 {
            return Err(format!("unexpected level-0 offset {offset_level0}"));
        }
        if count == 0 {
            return Err("index is empty".to_string());
        }
        if count > max_elements {
            return Err(format!("{count} elements exceed capacity {max_elements}"));
        }
        let links0_size = link_block_size(max_m0)?;
        let block = link_block_size(max_m)?;
        if offset_data != links0_size {
            return Err(format!(
                "data offset {offset_data} inconsistent with maxM0 {max_m0}"
            ));
        }
        if label_offset <= offset_data || (label_offset - offset_data) % 4 != 0 {
            return Err(format!("label offset {label_offset} is not a vector boundary"));
        }
        if label_offset.checked_add(8) != Some(size_per_element) {
            return Err(format!("element size {size_per_element} inconsistent"));
        }
        if max_level < 0 {
            return Err(format!("negative max level {max_level}"));
        }
        if entry_point as usize >= count {
            return Err(format!("entry point {entry_point} out of range"));
        }
        let dim = (label_offset - offset_data) / 4;

        let level0_len = count
            .checked_mul(size_per_element)
            .ok_or_else(|| "level-0 block size overflows".to_string())?;
        let level0 = r.take(level0_len)?;

        let mut vectors = Vec::with_capacity(count * dim);
        let mut labels = Vec::with_capacity(count);
        let mut deleted = Vec::with_capacity(count);
        let mut links0 = Vec::with_capacity(count);
        let mut seen = vec![false; count];

        for (i, rec) in level0.chunks_exact(size_per_element).enumerate() {
            let (links, flags) = read_links(rec, max_m0, count)
                .map_err(|e| format!("element {i} level 0: {e}"))?;
            links0.push(links);
            deleted.push(flags & DELETE_MARK != 0);

            vectors.extend(
                rec[offset_data..label_offset]
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );

            let mut label = [0u8; 8];
            label.copy_from_slice(&rec[label_offset..label_offset + 8]);
            let label = u64::from_le_bytes(label);
            let position = usize::try_from(label)
                .ok()
                .filter(|&p| p < count)
                .ok_or_else(|| format!("element {i} has label {label}, expected < {count}"))?;
            if std::mem::replace(&mut seen[position], true) {
                return Err(format!("label {label} appears more than once"));
            }
            labels.push(position);
        }

        let mut upper = Vec::with_capacity(count);
        for i in 0..count {
            let size = r.u32()? as usize;
            if size == 0 {
                upper.push(Vec::new());
                continue;
            }
            if size % block != 0 {
                return Err(format!("element {i}: link list size {size} not a multiple of {block}"));
            }
            let data = r.take(size)?;
            let levels = data
                .chunks_exact(block)
                .enumerate()
                .map(|(l, chunk)| {
                    read_links(chunk, max_m, count)
                        .map(|(links, _)| links)
                        .map_err(|e| format!("element {i} level {}: {e}", l + 1))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            upper.push(levels);
        }

        if r.remaining() > 0 {
            log::warn!("candidate index has {} trailing bytes", r.remaining());
        }

        // The entry point sits on the top level, so it carries a link list
        // for every level above 0.
        let max_level = max_level as usize;
        let entry_levels = upper[entry_point as usize].len();
        if max_level > entry_levels {
            return Err(format!(
                "max level {max_level} exceeds the {entry_levels} upper levels of entry point {entry_point}"
            ));
        }

        let live = deleted.iter().filter(|&&d| !d).count();
        Ok(Self {
            dim,
            params: GraphParams {
                max_elements,
                max_m,
                max_m0,
                m,
                mult,
                ef_construction,
            },
            vectors,
            labels,
            deleted,
            links0,
            upper,
            entry_point,
            max_level,
            live,
            ef: ef.max(1),
        })
    }

    /// Serialize in the hnswlib layout described in the module docs.
    pub fn to_bytes(&self) -> Vec<u8> {
        let count = self.labels.len();
        let p = &self.params;
        let offset_data = p.max_m0 * 4 + 4;
        let label_offset = offset_data + self.dim * 4;
        let size_per_element = label_offset + 8;

        let mut out = Vec::with_capacity(HEADER_LEN + count * size_per_element);
        for v in [0, p.max_elements, count, size_per_element, label_offset, offset_data] {
            out.extend_from_slice(&(v as u64).to_le_bytes());
        }
        out.extend_from_slice(&(self.max_level as i32).to_le_bytes());
        out.extend_from_slice(&self.entry_point.to_le_bytes());
        for v in [p.max_m, p.max_m0, p.m] {
            out.extend_from_slice(&(v as u64).to_le_bytes());
        }
        out.extend_from_slice(&p.mult.to_le_bytes());
        out.extend_from_slice(&(p.ef_construction as u64).to_le_bytes());

        for i in 0..count {
            let flags = if self.deleted[i] { DELETE_MARK } else { 0 };
            write_links(&mut out, &self.links0[i], p.max_m0, flags);
            for v in self.vector(i as u32) {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out.extend_from_slice(&(self.labels[i] as u64).to_le_bytes());
        }

        let block = p.max_m * 4 + 4;
        for levels in &self.upper {
            out.extend_from_slice(&((levels.len() * block) as u32).to_le_bytes());
            for links in levels {
                write_links(&mut out, links, p.max_m, 0);
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())
            .map_err(|e| MatchError::IndexLoad(format!("writing {}: {e}", path.display())))
    }

    /// Number of stored elements, including deleted ones.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn ef(&self) -> usize {
        self.ef
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// Approximate top-k gallery positions, nearest first.
    ///
    /// `k` is clamped to the number of live elements. Equal distances are
    /// ordered by gallery position.
    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<Candidate> {
        let k = k.min(self.live);
        if k == 0 {
            return Vec::new();
        }
        if query.len() != self.dim {
            log::warn!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim
            );
            return Vec::new();
        }

        let norm = query.iter().map(|x| x * x).sum::<f32>().sqrt();
        let query: Vec<f32> = if norm > 0.0 {
            query.iter().map(|x| x / norm).collect()
        } else {
            query.to_vec()
        };

        let mut current = self.entry_point;
        let mut current_dist = self.distance(&query, current);
        for level in (1..=self.max_level).rev() {
            (current, current_dist) = self.greedy_descent(&query, current, current_dist, level);
        }

        let found = self.search_base_layer(&query, current, current_dist, self.ef.max(k));

        let mut out: Vec<Candidate> = found
            .into_iter()
            .map(|item| Candidate {
                position: self.labels[item.id as usize],
                distance: item.dist,
            })
            .collect();
        out.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        out.truncate(k);
        out
    }

    fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    /// Cosine distance over unit vectors.
    fn distance(&self, query: &[f32], id: u32) -> f32 {
        let dot: f32 = query
            .iter()
            .zip(self.vector(id))
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }

    fn neighbors(&self, id: u32, level: usize) -> &[u32] {
        if level == 0 {
            return &self.links0[id as usize];
        }
        self.upper[id as usize]
            .get(level - 1)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn greedy_descent(
        &self,
        query: &[f32],
        mut current: u32,
        mut current_dist: f32,
        level: usize,
    ) -> (u32, f32) {
        loop {
            let mut improved = false;
            for &nbr in self.neighbors(current, level) {
                let d = self.distance(query, nbr);
                if d < current_dist {
                    current = nbr;
                    current_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return (current, current_dist);
            }
        }
    }

    /// Beam search on level 0. Deleted elements are traversed but not returned.
    fn search_base_layer(&self, query: &[f32], entry: u32, entry_dist: f32, ef: usize) -> Vec<HeapItem> {
        let has_deletions = self.live < self.len();
        let mut visited = vec![false; self.len()];
        let mut candidates: BinaryHeap<Reverse<HeapItem>> = BinaryHeap::new();
        let mut results: BinaryHeap<HeapItem> = BinaryHeap::new();

        let entry_item = HeapItem {
            dist: entry_dist,
            id: entry,
        };
        visited[entry as usize] = true;
        let mut lower_bound = if self.deleted[entry as usize] {
            f32::MAX
        } else {
            results.push(entry_item);
            entry_dist
        };
        candidates.push(Reverse(entry_item));

        while let Some(Reverse(candidate)) = candidates.pop() {
            if candidate.dist > lower_bound && (results.len() >= ef || !has_deletions) {
                break;
            }

            for &nbr in self.neighbors(candidate.id, 0) {
                if std::mem::replace(&mut visited[nbr as usize], true) {
                    continue;
                }
                let d = self.distance(query, nbr);
                if results.len() < ef || d < lower_bound {
                    let item = HeapItem { dist: d, id: nbr };
                    candidates.push(Reverse(item));
                    if !self.deleted[nbr as usize] {
                        results.push(item);
                    }
                    if results.len() > ef {
                        results.pop();
                    }
                    if let Some(worst) = results.peek() {
                        lower_bound = worst.dist;
                    }
                }
            }
        }

        results.into_vec()
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapItem {
    dist: f32,
    id: u32,
}

/// Max-heap order: farthest first.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.id.cmp(&other.id))
    }
}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapItem {}

/// Byte size of a link block holding up to `capacity` links.
fn link_block_size(capacity: usize) -> std::result::Result<usize, String> {
    capacity
        .checked_mul(4)
        .and_then(|v| v.checked_add(4))
        .ok_or_else(|| format!("link capacity {capacity} overflows"))
}

/// Parse a link block: `[2B count] [1B flags] [1B pad] [capacity x 4B]`.
fn read_links(
    block: &[u8],
    capacity: usize,
    count: usize,
) -> std::result::Result<(Vec<u32>, u8), String> {
    let n = u16::from_le_bytes([block[0], block[1]]) as usize;
    if n > capacity {
        return Err(format!("{n} links exceed capacity {capacity}"));
    }
    let links = block[4..4 + n * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    if let Some(bad) = links.iter().find(|&&l| l as usize >= count) {
        return Err(format!("link to missing element {bad}"));
    }
    Ok((links, block[2]))
}

fn write_links(out: &mut Vec<u8>, links: &[u32], capacity: usize, flags: u8) {
    out.extend_from_slice(&(links.len() as u16).to_le_bytes());
    out.push(flags);
    out.push(0);
    for l in links {
        out.extend_from_slice(&l.to_le_bytes());
    }
    for _ in links.len()..capacity {
        out.extend_from_slice(&0u32.to_le_bytes());
    }
}

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err(format!(
                "truncated: needed {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn size(&mut self) -> std::result::Result<usize, String> {
        let v = u64::from_le_bytes(self.array()?);
        usize::try_from(v).map_err(|_| format!("value {v} does not fit in usize"))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> std::result::Result<i32, String> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> std::result::Result<f64, String> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

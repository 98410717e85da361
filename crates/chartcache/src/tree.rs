//! Read side of the serialized spatial tree.
//!
//! A tree is five consecutive word arrays: interior nodes, leaf nodes, point
//! items, line items, triangle items. Node records reference children by
//! signed index: a non-negative child number indexes the interior-node list,
//! a negative one is bitwise NOT-ed and indexes the leaf list. Nodes are
//! written post-order depth-first, so the root is the last node.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use memmap2::Mmap;

use crate::geom::{box_contains_point, box_intersects_line, box_intersects_triangle};

pub const INTS_PER_INTERIOR_NODE: usize = 6;
pub const INTS_PER_LEAF_NODE: usize = 10;
pub const INTS_PER_POINT_ITEM: usize = 3;
pub const INTS_PER_LINE_ITEM: usize = 5;
pub const INTS_PER_TRIANGLE_ITEM: usize = 7;

/// Record counts of one serialized tree, as stored in the cache's chunk
/// index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeCounts {
    pub interior_nodes: usize,
    pub leaf_nodes: usize,
    pub points: usize,
    pub lines: usize,
    pub triangles: usize,
}

impl TreeCounts {
    pub fn total_words(&self) -> usize {
        self.interior_nodes * INTS_PER_INTERIOR_NODE
            + self.leaf_nodes * INTS_PER_LEAF_NODE
            + self.points * INTS_PER_POINT_ITEM
            + self.lines * INTS_PER_LINE_ITEM
            + self.triangles * INTS_PER_TRIANGLE_ITEM
    }
}

/// Tree words stay where they are: committed trees are searched straight out
/// of the cache file mapping, freshly built trees out of their build buffer.
enum TreeWords {
    Mapped(Mmap),
    Owned(Vec<i32>),
}

impl TreeWords {
    #[inline(always)]
    fn word(&self, index: usize) -> i32 {
        match self {
            TreeWords::Mapped(map) => {
                let at = index * 4;
                i32::from_ne_bytes(map[at..at + 4].try_into().unwrap())
            }
            TreeWords::Owned(words) => words[index],
        }
    }

    fn word_len(&self) -> usize {
        match self {
            TreeWords::Mapped(map) => map.len() / 4,
            TreeWords::Owned(words) => words.len(),
        }
    }
}

#[derive(Clone, Copy)]
enum Root {
    Interior(usize),
    Leaf(usize),
    Empty,
}

pub struct Tree {
    words: TreeWords,
    counts: TreeCounts,
    leaf_first: usize,
    point_first: usize,
    line_first: usize,
    triangle_first: usize,
    root: Root,
}

impl Tree {
    /// Wrap a mapping that covers exactly the tree's words.
    pub fn from_mapped(map: Mmap, counts: TreeCounts) -> Result<Tree> {
        Self::new(TreeWords::Mapped(map), counts)
    }

    pub fn from_words(words: Vec<i32>, counts: TreeCounts) -> Result<Tree> {
        Self::new(TreeWords::Owned(words), counts)
    }

    fn new(words: TreeWords, counts: TreeCounts) -> Result<Tree> {
        ensure!(
            words.word_len() == counts.total_words(),
            "tree word count mismatch: have {}, counts require {}",
            words.word_len(),
            counts.total_words()
        );

        let leaf_first = counts.interior_nodes * INTS_PER_INTERIOR_NODE;
        let point_first = leaf_first + counts.leaf_nodes * INTS_PER_LEAF_NODE;
        let line_first = point_first + counts.points * INTS_PER_POINT_ITEM;
        let triangle_first = line_first + counts.lines * INTS_PER_LINE_ITEM;

        let root = if counts.interior_nodes > 0 {
            Root::Interior(counts.interior_nodes - 1)
        } else if counts.leaf_nodes > 0 {
            Root::Leaf(counts.leaf_nodes - 1)
        } else {
            Root::Empty
        };

        Ok(Tree { words, counts, leaf_first, point_first, line_first, triangle_first, root })
    }

    pub fn counts(&self) -> TreeCounts {
        self.counts
    }

    pub fn search(&self, x_min: f32, x_max: f32, y_min: f32, y_max: f32) -> HashSet<i32> {
        let mut feature_nums = HashSet::new();
        self.search_into(x_min, x_max, y_min, y_max, &mut feature_nums);
        feature_nums
    }

    /// `feature_nums` is both input and output: features already present are
    /// pruned early, new results are added.
    pub fn search_into(&self, x_min: f32, x_max: f32, y_min: f32, y_max: f32, feature_nums: &mut HashSet<i32>) {
        match self.root {
            Root::Interior(node) => self.search_interior(node, x_min, x_max, y_min, y_max, feature_nums),
            Root::Leaf(node) => self.search_leaf(node, x_min, x_max, y_min, y_max, feature_nums),
            Root::Empty => {}
        }
    }

    fn search_child(&self, child_ref: i32, x_min: f32, x_max: f32, y_min: f32, y_max: f32, out: &mut HashSet<i32>) {
        if child_ref >= 0 {
            self.search_interior(child_ref as usize, x_min, x_max, y_min, y_max, out);
        } else {
            self.search_leaf(!child_ref as usize, x_min, x_max, y_min, y_max, out);
        }
    }

    fn search_interior(&self, node: usize, x_min: f32, x_max: f32, y_min: f32, y_max: f32, out: &mut HashSet<i32>) {
        let at = node * INTS_PER_INTERIOR_NODE;
        let x_divider = f32::from_bits(self.words.word(at) as u32);
        let y_divider = f32::from_bits(self.words.word(at + 1) as u32);

        // Inclusive on both sides of each divider, matching item replication
        let small_x = x_min <= x_divider;
        let large_x = x_max >= x_divider;
        let small_y = y_min <= y_divider;
        let large_y = y_max >= y_divider;

        if small_x && small_y {
            self.search_child(self.words.word(at + 2), x_min, x_max, y_min, y_max, out);
        }
        if large_x && small_y {
            self.search_child(self.words.word(at + 3), x_min, x_max, y_min, y_max, out);
        }
        if small_x && large_y {
            self.search_child(self.words.word(at + 4), x_min, x_max, y_min, y_max, out);
        }
        if large_x && large_y {
            self.search_child(self.words.word(at + 5), x_min, x_max, y_min, y_max, out);
        }
    }

    fn search_leaf(&self, node: usize, x_min: f32, x_max: f32, y_min: f32, y_max: f32, out: &mut HashSet<i32>) {
        let at = self.leaf_first + node * INTS_PER_LEAF_NODE;
        let leaf_x_min = f32::from_bits(self.words.word(at) as u32);
        let leaf_x_max = f32::from_bits(self.words.word(at + 1) as u32);
        let leaf_y_min = f32::from_bits(self.words.word(at + 2) as u32);
        let leaf_y_max = f32::from_bits(self.words.word(at + 3) as u32);
        let point_first = self.words.word(at + 4) as usize;
        let point_count = self.words.word(at + 5) as usize;
        let line_first = self.words.word(at + 6) as usize;
        let line_count = self.words.word(at + 7) as usize;
        let triangle_first = self.words.word(at + 8) as usize;
        let triangle_count = self.words.word(at + 9) as usize;

        let x_all = x_min <= leaf_x_min && leaf_x_max <= x_max;
        let y_all = y_min <= leaf_y_min && leaf_y_max <= y_max;
        if x_all && y_all {
            // Query box swallows the leaf box, so every item matches
            for point in point_first..point_first + point_count {
                out.insert(self.point_feature_num(point));
            }
            for line in line_first..line_first + line_count {
                out.insert(self.line_feature_num(line));
            }
            for triangle in triangle_first..triangle_first + triangle_count {
                out.insert(self.triangle_feature_num(triangle));
            }
            return;
        }

        for point in point_first..point_first + point_count {
            let feature_num = self.point_feature_num(point);
            if !out.contains(&feature_num) {
                let at = self.point_first + point * INTS_PER_POINT_ITEM;
                let x = f32::from_bits(self.words.word(at + 1) as u32);
                let y = f32::from_bits(self.words.word(at + 2) as u32);
                if box_contains_point(x_min, y_min, x_max, y_max, x, y) {
                    out.insert(feature_num);
                }
            }
        }
        for line in line_first..line_first + line_count {
            let feature_num = self.line_feature_num(line);
            if !out.contains(&feature_num) {
                let at = self.line_first + line * INTS_PER_LINE_ITEM;
                let xa = f32::from_bits(self.words.word(at + 1) as u32);
                let ya = f32::from_bits(self.words.word(at + 2) as u32);
                let xb = f32::from_bits(self.words.word(at + 3) as u32);
                let yb = f32::from_bits(self.words.word(at + 4) as u32);
                if box_intersects_line(x_min, y_min, x_max, y_max, xa, ya, xb, yb) {
                    out.insert(feature_num);
                }
            }
        }
        for triangle in triangle_first..triangle_first + triangle_count {
            let feature_num = self.triangle_feature_num(triangle);
            if !out.contains(&feature_num) {
                let at = self.triangle_first + triangle * INTS_PER_TRIANGLE_ITEM;
                let xa = f32::from_bits(self.words.word(at + 1) as u32);
                let ya = f32::from_bits(self.words.word(at + 2) as u32);
                let xb = f32::from_bits(self.words.word(at + 3) as u32);
                let yb = f32::from_bits(self.words.word(at + 4) as u32);
                let xc = f32::from_bits(self.words.word(at + 5) as u32);
                let yc = f32::from_bits(self.words.word(at + 6) as u32);
                if box_intersects_triangle(x_min, y_min, x_max, y_max, xa, ya, xb, yb, xc, yc) {
                    out.insert(feature_num);
                }
            }
        }
    }

    fn point_feature_num(&self, point: usize) -> i32 {
        self.words.word(self.point_first + point * INTS_PER_POINT_ITEM)
    }

    fn line_feature_num(&self, line: usize) -> i32 {
        self.words.word(self.line_first + line * INTS_PER_LINE_ITEM)
    }

    fn triangle_feature_num(&self, triangle: usize) -> i32 {
        self.words.word(self.triangle_first + triangle * INTS_PER_TRIANGLE_ITEM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_searches_empty() {
        let counts = TreeCounts { interior_nodes: 0, leaf_nodes: 0, points: 0, lines: 0, triangles: 0 };
        let tree = Tree::from_words(Vec::new(), counts).unwrap();
        assert!(tree.search(-1e9, 1e9, -1e9, 1e9).is_empty());
    }

    #[test]
    fn word_count_mismatch_is_rejected() {
        let counts = TreeCounts { interior_nodes: 0, leaf_nodes: 1, points: 0, lines: 0, triangles: 0 };
        assert!(Tree::from_words(vec![0; 3], counts).is_err());
    }

    #[test]
    fn child_refs_distinguish_interior_and_leaf_by_sign() {
        // One interior node over four leaves; leaves 0..4 tile the unit
        // square around dividers (0.5, 0.5), each holding one point item.
        let mut words = Vec::<i32>::new();

        // interior node (written after children in a real build, but the
        // image is order-independent within each array)
        words.push(0.5f32.to_bits() as i32);
        words.push(0.5f32.to_bits() as i32);
        words.extend_from_slice(&[!0, !1, !2, !3]);

        let leaf_boxes = [
            (0.0f32, 0.5f32, 0.0f32, 0.5f32),
            (0.5, 1.0, 0.0, 0.5),
            (0.0, 0.5, 0.5, 1.0),
            (0.5, 1.0, 0.5, 1.0),
        ];
        for (i, &(x0, x1, y0, y1)) in leaf_boxes.iter().enumerate() {
            words.push(x0.to_bits() as i32);
            words.push(x1.to_bits() as i32);
            words.push(y0.to_bits() as i32);
            words.push(y1.to_bits() as i32);
            words.extend_from_slice(&[i as i32, 1, 0, 0, 0, 0]);
        }

        // one point per leaf, at the leaf box center
        for (i, &(x0, x1, y0, y1)) in leaf_boxes.iter().enumerate() {
            words.push(100 + i as i32);
            words.push((0.5 * (x0 + x1)).to_bits() as i32);
            words.push((0.5 * (y0 + y1)).to_bits() as i32);
        }

        let counts = TreeCounts { interior_nodes: 1, leaf_nodes: 4, points: 4, lines: 0, triangles: 0 };
        let tree = Tree::from_words(words, counts).unwrap();

        // Query strictly inside one quadrant hits only its point
        assert_eq!(tree.search(0.6, 0.9, 0.1, 0.4), HashSet::from([101]));
        // Query covering everything hits all four
        assert_eq!(tree.search(0.0, 1.0, 0.0, 1.0), HashSet::from([100, 101, 102, 103]));
        // Query on the divider lands in all quadrants but matches no point
        assert!(tree.search(0.5, 0.5, 0.5, 0.5).is_empty());
    }
}

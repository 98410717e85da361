//! Build side of the spatial tree: accumulate projected items, split into
//! quadrants while splitting pays, serialize post-order.

use anyhow::Result;

use crate::geom::{box_contains_point, box_intersects_line, box_intersects_triangle};
use crate::tree::{
    Tree, TreeCounts, INTS_PER_INTERIOR_NODE, INTS_PER_LEAF_NODE, INTS_PER_LINE_ITEM,
    INTS_PER_POINT_ITEM, INTS_PER_TRIANGLE_ITEM,
};

/// Nodes with fewer items than this are always leaves.
pub const MAX_LEAF_ITEMS: usize = 100;

/// A split must cut the worst (or at least the expected) child population to
/// below this fraction of the parent's, or the node stays a leaf.
pub const SPLIT_COST_RATIO: f64 = 0.85;

#[derive(Debug, Clone, Copy)]
struct PointItem {
    feature_num: i32,
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy)]
struct LineItem {
    feature_num: i32,
    xa: f32,
    ya: f32,
    xb: f32,
    yb: f32,
}

impl LineItem {
    fn x_min(&self) -> f32 {
        self.xa.min(self.xb)
    }
    fn x_max(&self) -> f32 {
        self.xa.max(self.xb)
    }
    fn y_min(&self) -> f32 {
        self.ya.min(self.yb)
    }
    fn y_max(&self) -> f32 {
        self.ya.max(self.yb)
    }
}

#[derive(Debug, Clone, Copy)]
struct TriangleItem {
    feature_num: i32,
    xa: f32,
    ya: f32,
    xb: f32,
    yb: f32,
    xc: f32,
    yc: f32,
}

impl TriangleItem {
    fn x_min(&self) -> f32 {
        self.xa.min(self.xb).min(self.xc)
    }
    fn x_max(&self) -> f32 {
        self.xa.max(self.xb).max(self.xc)
    }
    fn y_min(&self) -> f32 {
        self.ya.min(self.yb).min(self.yc)
    }
    fn y_max(&self) -> f32 {
        self.ya.max(self.yb).max(self.yc)
    }
}

enum Node {
    Leaf {
        x_min: f32,
        x_max: f32,
        y_min: f32,
        y_max: f32,
        points: Vec<PointItem>,
        lines: Vec<LineItem>,
        triangles: Vec<TriangleItem>,
    },
    Interior {
        x_divider: f32,
        y_divider: f32,
        children: Box<[Node; 4]>,
    },
}

/// Serialized word arrays of one tree, in the order they land in the cache
/// file: interior nodes, leaf nodes, points, lines, triangles.
pub struct TreeImage {
    pub interior_nodes: Vec<i32>,
    pub leaf_nodes: Vec<i32>,
    pub points: Vec<i32>,
    pub lines: Vec<i32>,
    pub triangles: Vec<i32>,
}

impl TreeImage {
    pub fn counts(&self) -> TreeCounts {
        TreeCounts {
            interior_nodes: self.interior_nodes.len() / INTS_PER_INTERIOR_NODE,
            leaf_nodes: self.leaf_nodes.len() / INTS_PER_LEAF_NODE,
            points: self.points.len() / INTS_PER_POINT_ITEM,
            lines: self.lines.len() / INTS_PER_LINE_ITEM,
            triangles: self.triangles.len() / INTS_PER_TRIANGLE_ITEM,
        }
    }

    /// Concatenate the arrays in file order.
    pub fn to_words(&self) -> Vec<i32> {
        let mut words = Vec::with_capacity(self.counts().total_words());
        words.extend_from_slice(&self.interior_nodes);
        words.extend_from_slice(&self.leaf_nodes);
        words.extend_from_slice(&self.points);
        words.extend_from_slice(&self.lines);
        words.extend_from_slice(&self.triangles);
        words
    }

    pub fn into_tree(self) -> Result<Tree> {
        let counts = self.counts();
        Tree::from_words(self.to_words(), counts)
    }
}

pub struct TreeBuilder {
    x_root_min: f32,
    x_root_max: f32,
    y_root_min: f32,
    y_root_max: f32,
    points: Vec<PointItem>,
    lines: Vec<LineItem>,
    triangles: Vec<TriangleItem>,
}

impl TreeBuilder {
    /// Root bounds are the library's projected bounds, not the items'.
    pub fn new(x_root_min: f32, x_root_max: f32, y_root_min: f32, y_root_max: f32) -> TreeBuilder {
        TreeBuilder {
            x_root_min,
            x_root_max,
            y_root_min,
            y_root_max,
            points: Vec::new(),
            lines: Vec::new(),
            triangles: Vec::new(),
        }
    }

    pub fn add_point(&mut self, feature_num: i32, x: f32, y: f32) {
        self.points.push(PointItem { feature_num, x, y });
    }

    pub fn add_line(&mut self, feature_num: i32, xa: f32, ya: f32, xb: f32, yb: f32) {
        self.lines.push(LineItem { feature_num, xa, ya, xb, yb });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_triangle(&mut self, feature_num: i32, xa: f32, ya: f32, xb: f32, yb: f32, xc: f32, yc: f32) {
        self.triangles.push(TriangleItem { feature_num, xa, ya, xb, yb, xc, yc });
    }

    pub fn build(self) -> TreeImage {
        let root = create_node(
            self.x_root_min,
            self.x_root_max,
            self.y_root_min,
            self.y_root_max,
            self.points,
            self.lines,
            self.triangles,
        );

        let mut image = TreeImage {
            interior_nodes: Vec::new(),
            leaf_nodes: Vec::new(),
            points: Vec::new(),
            lines: Vec::new(),
            triangles: Vec::new(),
        };
        append_node(&root, &mut image);
        image
    }
}

/// Distance from `v` to the next representable f32 of larger magnitude.
fn ulp(v: f32) -> f32 {
    let bits = v.to_bits() & 0x7FFF_FFFF;
    f32::from_bits(bits + 1) - f32::from_bits(bits)
}

/// Pick the divider minimizing the worse of the two halves' populations,
/// ties broken by the area-weighted expected population. Candidates sit one
/// ULP below each distinct item minimum, so no item's edge lands exactly on
/// the divider.
fn choose_divider(node_min: f32, node_max: f32, item_mins: &[f32], item_maxs: &[f32]) -> f32 {
    let num_items = item_mins.len();

    let mut best_divider = node_min + 0.5 * (node_max - node_min);
    let mut best_worst_cost = usize::MAX;
    let mut best_avg_cost = f64::MAX;

    for i in 0..num_items {
        let item_min = item_mins[i];

        // Don't try the same divider position twice
        if i > 0 && item_min == item_mins[i - 1] {
            continue;
        }

        let divider = item_min - ulp(item_min);

        let frac_below = f64::from(divider - node_min) / f64::from(node_max - node_min);
        let frac_above = 1.0 - frac_below;
        // Both item edges are inclusive, so an item straddles the divider
        // when min <= divider <= max
        let num_below = item_mins.partition_point(|&v| v <= divider);
        let num_above = num_items - item_maxs.partition_point(|&v| v < divider);

        let worst_cost = num_below.max(num_above);
        let avg_cost = frac_below * num_below as f64 + frac_above * num_above as f64;
        if worst_cost < best_worst_cost || (worst_cost == best_worst_cost && avg_cost < best_avg_cost) {
            best_divider = divider;
            best_worst_cost = worst_cost;
            best_avg_cost = avg_cost;
        }
    }

    best_divider
}

fn sorted(mut values: Vec<f32>) -> Vec<f32> {
    values.sort_by(f32::total_cmp);
    values
}

fn create_node(
    x_node_min: f32,
    x_node_max: f32,
    y_node_min: f32,
    y_node_max: f32,
    points: Vec<PointItem>,
    lines: Vec<LineItem>,
    triangles: Vec<TriangleItem>,
) -> Node {
    let num_items = points.len() + lines.len() + triangles.len();
    if num_items < MAX_LEAF_ITEMS {
        return Node::Leaf {
            x_min: x_node_min,
            x_max: x_node_max,
            y_min: y_node_min,
            y_max: y_node_max,
            points,
            lines,
            triangles,
        };
    }

    // Choose dividers; the four sorts are independent
    let collect = |f: &(dyn Fn(&PointItem) -> f32 + Sync),
                   g: &(dyn Fn(&LineItem) -> f32 + Sync),
                   h: &(dyn Fn(&TriangleItem) -> f32 + Sync)| {
        let mut values = Vec::with_capacity(num_items);
        values.extend(points.iter().map(f));
        values.extend(lines.iter().map(g));
        values.extend(triangles.iter().map(h));
        values
    };

    let ((x_item_mins, x_item_maxs), (y_item_mins, y_item_maxs)) = rayon::join(
        || {
            rayon::join(
                || sorted(collect(&|p| p.x, &LineItem::x_min, &TriangleItem::x_min)),
                || sorted(collect(&|p| p.x, &LineItem::x_max, &TriangleItem::x_max)),
            )
        },
        || {
            rayon::join(
                || sorted(collect(&|p| p.y, &LineItem::y_min, &TriangleItem::y_min)),
                || sorted(collect(&|p| p.y, &LineItem::y_max, &TriangleItem::y_max)),
            )
        },
    );

    let x_divider = choose_divider(x_node_min, x_node_max, &x_item_mins, &x_item_maxs);
    let y_divider = choose_divider(y_node_min, y_node_max, &y_item_mins, &y_item_maxs);

    // Divvy items into quadrants; an item straddling a divider is replicated
    let quadrants = [
        (x_node_min, x_divider, y_node_min, y_divider),
        (x_divider, x_node_max, y_node_min, y_divider),
        (x_node_min, x_divider, y_divider, y_node_max),
        (x_divider, x_node_max, y_divider, y_node_max),
    ];

    let mut q_points: [Vec<PointItem>; 4] = Default::default();
    let mut q_lines: [Vec<LineItem>; 4] = Default::default();
    let mut q_triangles: [Vec<TriangleItem>; 4] = Default::default();

    for point in &points {
        for (q, &(x0, x1, y0, y1)) in quadrants.iter().enumerate() {
            if box_contains_point(x0, y0, x1, y1, point.x, point.y) {
                q_points[q].push(*point);
            }
        }
    }
    for line in &lines {
        for (q, &(x0, x1, y0, y1)) in quadrants.iter().enumerate() {
            if box_intersects_line(x0, y0, x1, y1, line.xa, line.ya, line.xb, line.yb) {
                q_lines[q].push(*line);
            }
        }
    }
    for triangle in &triangles {
        for (q, &(x0, x1, y0, y1)) in quadrants.iter().enumerate() {
            if box_intersects_triangle(
                x0, y0, x1, y1, triangle.xa, triangle.ya, triangle.xb, triangle.yb, triangle.xc,
                triangle.yc,
            ) {
                q_triangles[q].push(*triangle);
            }
        }
    }

    // Recurse only if the split pays for itself, otherwise the replication
    // from straddling items can blow the tree up
    let q_counts: Vec<usize> = (0..4)
        .map(|q| q_points[q].len() + q_lines[q].len() + q_triangles[q].len())
        .collect();
    let worst_cost = *q_counts.iter().max().unwrap();

    let x_frac_below = f64::from(x_divider - x_node_min) / f64::from(x_node_max - x_node_min);
    let x_frac_above = 1.0 - x_frac_below;
    let y_frac_below = f64::from(y_divider - y_node_min) / f64::from(y_node_max - y_node_min);
    let y_frac_above = 1.0 - y_frac_below;
    let avg_cost = x_frac_below * y_frac_below * q_counts[0] as f64
        + x_frac_above * y_frac_below * q_counts[1] as f64
        + x_frac_below * y_frac_above * q_counts[2] as f64
        + x_frac_above * y_frac_above * q_counts[3] as f64;

    let old_cost = num_items;
    if (worst_cost as f64) < SPLIT_COST_RATIO * old_cost as f64
        || (worst_cost <= old_cost && avg_cost < SPLIT_COST_RATIO * old_cost as f64)
    {
        let [qp0, qp1, qp2, qp3] = q_points;
        let [ql0, ql1, ql2, ql3] = q_lines;
        let [qt0, qt1, qt2, qt3] = q_triangles;
        Node::Interior {
            x_divider,
            y_divider,
            children: Box::new([
                create_node(x_node_min, x_divider, y_node_min, y_divider, qp0, ql0, qt0),
                create_node(x_divider, x_node_max, y_node_min, y_divider, qp1, ql1, qt1),
                create_node(x_node_min, x_divider, y_divider, y_node_max, qp2, ql2, qt2),
                create_node(x_divider, x_node_max, y_divider, y_node_max, qp3, ql3, qt3),
            ]),
        }
    } else {
        Node::Leaf {
            x_min: x_node_min,
            x_max: x_node_max,
            y_min: y_node_min,
            y_max: y_node_max,
            points,
            lines,
            triangles,
        }
    }
}

/// Post-order append. Returns the node's reference: a non-negative interior
/// index, or the bitwise NOT of a leaf index.
fn append_node(node: &Node, image: &mut TreeImage) -> i32 {
    match node {
        Node::Leaf { x_min, x_max, y_min, y_max, points, lines, triangles } => {
            let leaf_num = (image.leaf_nodes.len() / INTS_PER_LEAF_NODE) as i32;

            let point_first = (image.points.len() / INTS_PER_POINT_ITEM) as i32;
            let line_first = (image.lines.len() / INTS_PER_LINE_ITEM) as i32;
            let triangle_first = (image.triangles.len() / INTS_PER_TRIANGLE_ITEM) as i32;

            image.leaf_nodes.push(x_min.to_bits() as i32);
            image.leaf_nodes.push(x_max.to_bits() as i32);
            image.leaf_nodes.push(y_min.to_bits() as i32);
            image.leaf_nodes.push(y_max.to_bits() as i32);
            image.leaf_nodes.push(point_first);
            image.leaf_nodes.push(points.len() as i32);
            image.leaf_nodes.push(line_first);
            image.leaf_nodes.push(lines.len() as i32);
            image.leaf_nodes.push(triangle_first);
            image.leaf_nodes.push(triangles.len() as i32);

            for point in points {
                image.points.push(point.feature_num);
                image.points.push(point.x.to_bits() as i32);
                image.points.push(point.y.to_bits() as i32);
            }
            for line in lines {
                image.lines.push(line.feature_num);
                image.lines.push(line.xa.to_bits() as i32);
                image.lines.push(line.ya.to_bits() as i32);
                image.lines.push(line.xb.to_bits() as i32);
                image.lines.push(line.yb.to_bits() as i32);
            }
            for triangle in triangles {
                image.triangles.push(triangle.feature_num);
                image.triangles.push(triangle.xa.to_bits() as i32);
                image.triangles.push(triangle.ya.to_bits() as i32);
                image.triangles.push(triangle.xb.to_bits() as i32);
                image.triangles.push(triangle.yb.to_bits() as i32);
                image.triangles.push(triangle.xc.to_bits() as i32);
                image.triangles.push(triangle.yc.to_bits() as i32);
            }

            !leaf_num
        }
        Node::Interior { x_divider, y_divider, children } => {
            let child_refs: Vec<i32> = children.iter().map(|c| append_node(c, image)).collect();

            let interior_num = (image.interior_nodes.len() / INTS_PER_INTERIOR_NODE) as i32;
            image.interior_nodes.push(x_divider.to_bits() as i32);
            image.interior_nodes.push(y_divider.to_bits() as i32);
            image.interior_nodes.extend_from_slice(&child_refs);
            interior_num
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn small_chunks_stay_single_leaf() {
        let mut builder = TreeBuilder::new(0.0, 1.0, 0.0, 1.0);
        for i in 0..(MAX_LEAF_ITEMS as i32 - 1) {
            builder.add_point(i, 0.5, 0.5);
        }
        let image = builder.build();
        let counts = image.counts();
        assert_eq!(counts.interior_nodes, 0);
        assert_eq!(counts.leaf_nodes, 1);
        assert_eq!(counts.points, MAX_LEAF_ITEMS - 1);
    }

    #[test]
    fn unsplittable_items_fall_back_to_a_leaf() {
        // Every triangle covers the whole root box, so any split replicates
        // all of them into all four quadrants and fails both cost gates
        let mut builder = TreeBuilder::new(0.0, 1.0, 0.0, 1.0);
        for i in 0..150 {
            builder.add_triangle(i, -1.0, -1.0, 3.0, -1.0, 1.0, 3.0);
        }
        let image = builder.build();
        let counts = image.counts();
        assert_eq!(counts.interior_nodes, 0);
        assert_eq!(counts.leaf_nodes, 1);
        assert_eq!(counts.triangles, 150);
    }

    #[test]
    fn spread_points_split_and_search_stays_complete() {
        let mut builder = TreeBuilder::new(0.0, 1.0, 0.0, 1.0);
        let mut feature_num = 0;
        for i in 0..20 {
            for j in 0..20 {
                let x = (i as f32 + 0.5) / 20.0;
                let y = (j as f32 + 0.5) / 20.0;
                builder.add_point(feature_num, x, y);
                feature_num += 1;
            }
        }
        let image = builder.build();
        assert!(image.counts().interior_nodes > 0);
        // Replication never loses or duplicates a point item's feature
        let tree = image.into_tree().unwrap();
        let all = tree.search(0.0, 1.0, 0.0, 1.0);
        assert_eq!(all.len(), 400);

        // A window query returns exactly the grid points inside it
        let hits = tree.search(0.2, 0.4, 0.2, 0.4);
        let expected: HashSet<i32> = (0..400)
            .filter(|&f| {
                let x = ((f / 20) as f32 + 0.5) / 20.0;
                let y = ((f % 20) as f32 + 0.5) / 20.0;
                (0.2..=0.4).contains(&x) && (0.2..=0.4).contains(&y)
            })
            .collect();
        assert_eq!(hits, expected);
    }

    #[test]
    fn straddling_lines_replicate_without_duplicate_results() {
        let mut builder = TreeBuilder::new(0.0, 1.0, 0.0, 1.0);
        // Lines crossing the whole box in x, spread in y: the y split works,
        // the x split cannot, and every line straddles any x divider
        for i in 0..300 {
            let y = (i as f32 + 0.5) / 300.0;
            builder.add_line(i, 0.0, y, 1.0, y);
        }
        let image = builder.build();
        let tree = image.into_tree().unwrap();
        let all = tree.search(0.0, 1.0, 0.0, 1.0);
        assert_eq!(all.len(), 300);

        let band = tree.search(0.4, 0.6, 0.0, 0.1);
        let expected: HashSet<i32> = (0..300)
            .filter(|&i| (i as f32 + 0.5) / 300.0 <= 0.1)
            .collect();
        assert_eq!(band, expected);
    }

    #[test]
    fn divider_sits_one_ulp_below_an_item_min() {
        let mins = sorted(vec![0.25f32; 60].into_iter().chain(vec![0.75f32; 60]).collect());
        let maxs = mins.clone();
        let divider = choose_divider(0.0, 1.0, &mins, &maxs);
        assert_eq!(divider, 0.75 - ulp(0.75));
        // 60 below, 60 above: no item straddles
        assert_eq!(mins.partition_point(|&v| v <= divider), 60);
        assert_eq!(maxs.partition_point(|&v| v < divider), 60);
    }
}

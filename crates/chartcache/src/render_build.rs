//! Converts one flat-database chunk into render buffers: tessellated area
//! fills, line strips with cumulative arclength, icon anchors with rotation,
//! and label text with anchor coordinates. Vertices are bucketed into groups,
//! one per symbology assignment that matched at least one feature.

use std::collections::HashMap;

use anyhow::Result;
use flatchart::{AttrValue, FeatureAttrs, FeatureKind, FlatChunkKey, FlatStore};
use log::warn;

use crate::geosym::{ExternalAttrs, GeosymAssignment};
use crate::proj::Projection;

/// Triangle vertex: x, y, featureNum.
pub const FLOATS_PER_TRIANGLE_VERTEX: usize = 3;
/// Line vertex: x, y, featureNum, cumulativeDistance.
pub const FLOATS_PER_LINE_VERTEX: usize = 4;
/// Icon vertex: x, y, featureNum, rotation (counterclockwise radians).
pub const FLOATS_PER_ICON_VERTEX: usize = 4;
/// Label vertex: x, y, featureNum.
pub const FLOATS_PER_LABEL_VERTEX: usize = 3;

/// Vertex and label buffers for the features of one chunk that matched one
/// symbology assignment.
pub struct GroupBuffers {
    pub assignment: GeosymAssignment,
    pub triangle_coords: Vec<f32>,
    pub line_coords: Vec<f32>,
    pub icon_coords: Vec<f32>,
    pub label_coords: Vec<f32>,
    pub label_lengths: Vec<i32>,
    /// Label text, UTF-16 code units, concatenated across entries.
    pub label_chars: Vec<u16>,
}

impl GroupBuffers {
    fn new(assignment: GeosymAssignment) -> GroupBuffers {
        GroupBuffers {
            assignment,
            triangle_coords: Vec::new(),
            line_coords: Vec::new(),
            icon_coords: Vec::new(),
            label_coords: Vec::new(),
            label_lengths: Vec::new(),
            label_chars: Vec::new(),
        }
    }

    pub fn vertex_coord_count(&self) -> usize {
        self.triangle_coords.len()
            + self.line_coords.len()
            + self.icon_coords.len()
            + self.label_coords.len()
    }
}

/// All groups of one converted chunk, in the order their assignments first
/// matched a feature.
pub struct ChunkBuffers {
    pub feature_count: i32,
    pub groups: Vec<GroupBuffers>,
}

impl ChunkBuffers {
    pub fn label_char_count(&self) -> usize {
        self.groups.iter().map(|g| g.label_chars.len()).sum()
    }

    pub fn label_length_count(&self) -> usize {
        self.groups.iter().map(|g| g.label_lengths.len()).sum()
    }

    pub fn vertex_coord_count(&self) -> usize {
        self.groups.iter().map(|g| g.vertex_coord_count()).sum()
    }
}

/// Builds the render buffers for one chunk. Feature numbers written into the
/// vertex streams are chunk-local indices, matching the feature order of the
/// flat database.
pub fn build_chunk(
    store: &FlatStore,
    key: FlatChunkKey,
    coverage_name: &str,
    assignments_by_fcode: &HashMap<String, Vec<GeosymAssignment>>,
    external_attrs: &ExternalAttrs,
    proj: &dyn Projection,
) -> Result<ChunkBuffers> {
    let features = store.features(key)?;

    let mut groups: Vec<GroupBuffers> = Vec::new();
    let mut group_index: HashMap<i32, usize> = HashMap::new();

    for (feature_num, feature) in features.iter().enumerate() {
        let feature_num = feature_num as i32;
        let fcode = store.fcode_name(feature.fcode_id)?;
        let delineation = feature.kind.delineation();
        let attrs = store.read_attrs(feature.attr_first, feature.attr_count)?;

        let mut members: Vec<usize> = Vec::new();
        if let Some(candidates) = assignments_by_fcode.get(fcode) {
            for assignment in candidates {
                if assignment.matches(fcode, delineation, coverage_name, &attrs, external_attrs) {
                    let idx = match group_index.get(&assignment.id) {
                        Some(&idx) => idx,
                        None => {
                            groups.push(GroupBuffers::new(assignment.clone()));
                            group_index.insert(assignment.id, groups.len() - 1);
                            groups.len() - 1
                        }
                    };
                    if !members.contains(&idx) {
                        members.push(idx);
                    }
                }
            }
        }

        match feature.kind {
            FeatureKind::Area => {
                let rings = store.read_area_rings(feature.item_first, feature.item_count)?;
                append_area_feature(feature_num, &attrs, &rings, proj, &mut groups, &members);
            }
            FeatureKind::Line => {
                let vertices = store.read_line_vertices(feature.item_first, feature.item_count)?;
                append_line_feature(feature_num, &attrs, &vertices, proj, &mut groups, &members);
            }
            FeatureKind::Point => {
                let vertex = store.read_point_vertex(feature.item_first)?;
                append_point_feature(feature_num, &attrs, vertex, proj, &mut groups, &members);
            }
        }
    }

    Ok(ChunkBuffers { feature_count: features.len() as i32, groups })
}

fn have_area_symbol(groups: &[GroupBuffers], members: &[usize]) -> bool {
    members.iter().any(|&i| groups[i].assignment.has_area_symbol())
}

fn have_line_symbol(groups: &[GroupBuffers], members: &[usize]) -> bool {
    members.iter().any(|&i| groups[i].assignment.has_line_symbol())
}

fn have_point_symbol(groups: &[GroupBuffers], members: &[usize]) -> bool {
    members.iter().any(|&i| groups[i].assignment.has_point_symbol())
}

fn have_label_makers(groups: &[GroupBuffers], members: &[usize]) -> bool {
    members.iter().any(|&i| !groups[i].assignment.label_makers.is_empty())
}

/// Symbol rotation for a feature, counterclockwise radians in projected
/// space. The orientation attribute holds clockwise degrees; features that
/// lack a numeric orientation draw unrotated.
fn feature_rotation_ccw_rad(
    assignment: &GeosymAssignment,
    attrs: &FeatureAttrs,
    proj: &dyn Projection,
    x: f32,
    y: f32,
) -> f32 {
    let cw_deg = match attrs.get(&assignment.orientation_attr) {
        Some(AttrValue::Int(v)) => *v as f64,
        Some(AttrValue::Double(v)) => *v,
        _ => return 0.0,
    };
    proj.project_azimuth_rad(x, y, (-cw_deg).to_radians()) as f32
}

fn append_icon_coords(
    groups: &mut [GroupBuffers],
    members: &[usize],
    attrs: &FeatureAttrs,
    proj: &dyn Projection,
    x: f32,
    y: f32,
    feature_num: i32,
) {
    for &i in members {
        let group = &mut groups[i];
        if group.assignment.has_point_symbol() {
            let rotation = feature_rotation_ccw_rad(&group.assignment, attrs, proj, x, y);
            group.icon_coords.push(x);
            group.icon_coords.push(y);
            group.icon_coords.push(feature_num as f32);
            group.icon_coords.push(rotation);
        }
    }
}

/// One run of label lengths per template entry (zero for valueless entries),
/// and one anchor vertex per template that produced any text.
fn append_labels(
    groups: &mut [GroupBuffers],
    members: &[usize],
    attrs: &FeatureAttrs,
    x: f32,
    y: f32,
    feature_num: i32,
) {
    for &i in members {
        let group = &mut groups[i];
        for maker in &group.assignment.label_makers {
            let mut char_count = 0;
            for entry in &maker.entries {
                match entry.text(attrs) {
                    None => group.label_lengths.push(0),
                    Some(text) => {
                        let units: Vec<u16> = text.encode_utf16().collect();
                        group.label_lengths.push(units.len() as i32);
                        group.label_chars.extend_from_slice(&units);
                        char_count += units.len();
                    }
                }
            }
            if char_count > 0 {
                group.label_coords.push(x);
                group.label_coords.push(y);
                group.label_coords.push(feature_num as f32);
            }
        }
    }
}

/// Appends a line-strip vertex for every input vertex, carrying the
/// cumulative distance along the strip so far. Distance restarts at zero for
/// each call, which for area features means each ring.
fn append_line_coords(feature_num: i32, xys: &[f32], out: &mut Vec<f32>) {
    if xys.len() < 2 {
        return;
    }
    let mut cumulative_distance = 0.0f64;
    let mut i = 0;
    loop {
        let xa = xys[i];
        let ya = xys[i + 1];

        out.push(xa);
        out.push(ya);
        out.push(feature_num as f32);
        out.push(cumulative_distance as f32);

        if i + 3 >= xys.len() {
            break;
        }

        let xb = xys[i + 2];
        let yb = xys[i + 3];
        let dx = (xb - xa) as f64;
        let dy = (yb - ya) as f64;
        cumulative_distance += (dx * dx + dy * dy).sqrt();
        i += 2;
    }
}

pub(crate) fn project_ring(ring: &[[f64; 2]], proj: &dyn Projection) -> Vec<f32> {
    let mut xys = Vec::with_capacity(ring.len() * 2);
    for &[lat_deg, lon_deg] in ring {
        let [x, y] = proj.project_pos(lat_deg, lon_deg);
        xys.push(x);
        xys.push(y);
    }
    xys
}

/// Fills the feature polygon with triangles. A polygon the tessellator
/// rejects gets no fill, but its outline, icon, and labels still draw.
pub(crate) fn area_triangle_coords(feature_num: i32, xy_rings: &[Vec<f32>]) -> Vec<f32> {
    let mut flat: Vec<f32> = Vec::new();
    let mut hole_indices: Vec<usize> = Vec::new();
    for (r, xys) in xy_rings.iter().enumerate() {
        if r > 0 {
            hole_indices.push(flat.len() / 2);
        }
        flat.extend_from_slice(xys);
    }

    match earcutr::earcut(&flat, &hole_indices, 2) {
        Ok(triangle_indices) => {
            let mut coords = Vec::with_capacity(triangle_indices.len() * FLOATS_PER_TRIANGLE_VERTEX);
            for v in triangle_indices {
                coords.push(flat[2 * v]);
                coords.push(flat[2 * v + 1]);
                coords.push(feature_num as f32);
            }
            coords
        }
        Err(e) => {
            warn!("Failed to tessellate area-feature fill; this feature's area will not be filled: {:?}", e);
            Vec::new()
        }
    }
}

fn append_area_feature(
    feature_num: i32,
    attrs: &FeatureAttrs,
    rings: &[Vec<[f64; 2]>],
    proj: &dyn Projection,
    groups: &mut [GroupBuffers],
    members: &[usize],
) {
    let need_triangles = have_area_symbol(groups, members);
    let need_lines = have_line_symbol(groups, members);
    let need_icons = have_point_symbol(groups, members);
    let need_labels = have_label_makers(groups, members);
    if !(need_triangles || need_lines || need_icons || need_labels) {
        return;
    }

    let xy_rings: Vec<Vec<f32>> = rings.iter().map(|r| project_ring(r, proj)).collect();

    if need_triangles {
        let triangle_coords = area_triangle_coords(feature_num, &xy_rings);
        for &i in members {
            if groups[i].assignment.has_area_symbol() {
                groups[i].triangle_coords.extend_from_slice(&triangle_coords);
            }
        }
    }

    if need_lines {
        let mut line_coords = Vec::new();
        for xys in &xy_rings {
            append_line_coords(feature_num, xys, &mut line_coords);
        }
        for &i in members {
            if groups[i].assignment.has_line_symbol() {
                groups[i].line_coords.extend_from_slice(&line_coords);
            }
        }
    }

    if (need_icons || need_labels) && !xy_rings.is_empty() && xy_rings[0].len() >= 2 {
        // Anchor icons and labels at the average xy of the outer ring,
        // summing offsets from the first vertex to keep precision.
        let xys = &xy_rings[0];
        let x_ref = xys[0];
        let y_ref = xys[1];
        let mut x_offset_sum = 0.0f64;
        let mut y_offset_sum = 0.0f64;
        for xy in xys.chunks_exact(2) {
            x_offset_sum += (xy[0] - x_ref) as f64;
            y_offset_sum += (xy[1] - y_ref) as f64;
        }
        let xy_count = (xys.len() / 2) as f64;
        let x = (x_ref as f64 + x_offset_sum / xy_count) as f32;
        let y = (y_ref as f64 + y_offset_sum / xy_count) as f32;

        if need_icons {
            append_icon_coords(groups, members, attrs, proj, x, y, feature_num);
        }
        if need_labels {
            append_labels(groups, members, attrs, x, y, feature_num);
        }
    }
}

fn append_line_feature(
    feature_num: i32,
    attrs: &FeatureAttrs,
    vertices: &[[f64; 2]],
    proj: &dyn Projection,
    groups: &mut [GroupBuffers],
    members: &[usize],
) {
    let need_lines = have_line_symbol(groups, members);
    let need_icons = have_point_symbol(groups, members);
    let need_labels = have_label_makers(groups, members);
    if !(need_lines || need_icons || need_labels) {
        return;
    }

    let xys = project_ring(vertices, proj);

    if need_lines {
        let mut line_coords = Vec::new();
        append_line_coords(feature_num, &xys, &mut line_coords);
        for &i in members {
            if groups[i].assignment.has_line_symbol() {
                groups[i].line_coords.extend_from_slice(&line_coords);
            }
        }
    }

    if (need_icons || need_labels) && xys.len() >= 2 {
        // Anchor icons and labels halfway along the line's arclength.
        let mut x = xys[0];
        let mut y = xys[1];

        let mut d_total = 0.0f32;
        for seg in xys.windows(4).step_by(2) {
            let dx = seg[2] - seg[0];
            let dy = seg[3] - seg[1];
            d_total += (dx * dx + dy * dy).sqrt();
        }

        let mut d_remaining = 0.5 * d_total;
        for seg in xys.windows(4).step_by(2) {
            let dx = seg[2] - seg[0];
            let dy = seg[3] - seg[1];
            let d_step = (dx * dx + dy * dy).sqrt();
            if d_step >= d_remaining {
                let alpha = d_remaining / d_step;
                x = seg[0] + alpha * dx;
                y = seg[1] + alpha * dy;
                break;
            }
            d_remaining -= d_step;
        }

        if need_icons {
            append_icon_coords(groups, members, attrs, proj, x, y, feature_num);
        }
        if need_labels {
            append_labels(groups, members, attrs, x, y, feature_num);
        }
    }
}

fn append_point_feature(
    feature_num: i32,
    attrs: &FeatureAttrs,
    vertex: [f64; 2],
    proj: &dyn Projection,
    groups: &mut [GroupBuffers],
    members: &[usize],
) {
    let need_icons = have_point_symbol(groups, members);
    let need_labels = have_label_makers(groups, members);
    if !(need_icons || need_labels) {
        return;
    }

    let [x, y] = proj.project_pos(vertex[0], vertex[1]);

    if need_icons {
        append_icon_coords(groups, members, attrs, proj, x, y, feature_num);
    }
    if need_labels {
        append_labels(groups, members, attrs, x, y, feature_num);
    }
}

/// Groups assignments by fcode for quick lookup while scanning features.
pub fn assignments_by_fcode(
    assignments: &[GeosymAssignment],
) -> HashMap<String, Vec<GeosymAssignment>> {
    let mut map: HashMap<String, Vec<GeosymAssignment>> = HashMap::new();
    for a in assignments {
        map.entry(a.fcode.clone()).or_default().push(a.clone());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geosym::{LabelEntry, LabelMaker};
    use crate::proj::PlateCarree;

    fn attrs(pairs: &[(&str, AttrValue)]) -> FeatureAttrs {
        let mut fa = FeatureAttrs::new();
        for (name, value) in pairs {
            fa.push(name.to_string(), value.clone());
        }
        fa
    }

    fn assignment(id: i32) -> GeosymAssignment {
        GeosymAssignment {
            id,
            fcode: "BUOY".to_string(),
            delineation: "Point".to_string(),
            coverage_type: String::new(),
            attr_expr: None,
            point_symbol: String::new(),
            line_symbol: String::new(),
            area_symbol: String::new(),
            display_priority: 0,
            orientation_attr: String::new(),
            label_makers: Vec::new(),
        }
    }

    #[test]
    fn line_coords_carry_cumulative_distance() {
        let xys = [0.0, 0.0, 3.0, 4.0, 3.0, 10.0];
        let mut out = Vec::new();
        append_line_coords(7, &xys, &mut out);

        assert_eq!(out.len(), 3 * FLOATS_PER_LINE_VERTEX);
        assert_eq!(&out[0..4], &[0.0, 0.0, 7.0, 0.0]);
        assert_eq!(&out[4..8], &[3.0, 4.0, 7.0, 5.0]);
        assert_eq!(&out[8..12], &[3.0, 10.0, 7.0, 11.0]);
    }

    #[test]
    fn single_vertex_line_emits_nothing() {
        let mut out = Vec::new();
        append_line_coords(0, &[1.0], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn line_anchor_sits_at_arclength_midpoint() {
        // Total length 10; the midpoint falls inside the second segment.
        let vertices = [[0.0, 0.0], [0.0, 4.0], [0.0, 10.0]];
        let mut a = assignment(1);
        a.point_symbol = "icon.svg".to_string();
        let mut groups = vec![GroupBuffers::new(a)];

        append_line_feature(0, &FeatureAttrs::new(), &vertices, &PlateCarree, &mut groups, &[0]);

        assert_eq!(groups[0].icon_coords.len(), FLOATS_PER_ICON_VERTEX);
        assert!((groups[0].icon_coords[0] - 5.0).abs() < 1e-6);
        assert!((groups[0].icon_coords[1] - 0.0).abs() < 1e-6);
    }

    #[test]
    fn area_anchor_is_outer_ring_average() {
        let rings = vec![vec![[0.0, 0.0], [0.0, 4.0], [2.0, 4.0], [2.0, 0.0]]];
        let mut a = assignment(1);
        a.point_symbol = "icon.svg".to_string();
        let mut groups = vec![GroupBuffers::new(a)];

        append_area_feature(3, &FeatureAttrs::new(), &rings, &PlateCarree, &mut groups, &[0]);

        assert_eq!(groups[0].icon_coords.len(), FLOATS_PER_ICON_VERTEX);
        assert!((groups[0].icon_coords[0] - 2.0).abs() < 1e-6);
        assert!((groups[0].icon_coords[1] - 1.0).abs() < 1e-6);
        assert_eq!(groups[0].icon_coords[2], 3.0);
    }

    #[test]
    fn area_fill_tessellates_into_triangles() {
        let rings = vec![vec![[0.0, 0.0], [0.0, 4.0], [2.0, 4.0], [2.0, 0.0]]];
        let mut a = assignment(1);
        a.area_symbol = "fill".to_string();
        let mut groups = vec![GroupBuffers::new(a)];

        append_area_feature(0, &FeatureAttrs::new(), &rings, &PlateCarree, &mut groups, &[0]);

        // A quad tessellates into 2 triangles, 6 vertices.
        assert_eq!(groups[0].triangle_coords.len(), 6 * FLOATS_PER_TRIANGLE_VERTEX);
        for v in groups[0].triangle_coords.chunks_exact(FLOATS_PER_TRIANGLE_VERTEX) {
            assert_eq!(v[2], 0.0);
        }
    }

    #[test]
    fn area_ring_outlines_restart_distance_per_ring() {
        let rings = vec![
            vec![[0.0, 0.0], [0.0, 4.0], [4.0, 4.0], [4.0, 0.0]],
            vec![[1.0, 1.0], [1.0, 2.0], [2.0, 2.0]],
        ];
        let mut a = assignment(1);
        a.line_symbol = "outline".to_string();
        let mut groups = vec![GroupBuffers::new(a)];

        append_area_feature(0, &FeatureAttrs::new(), &rings, &PlateCarree, &mut groups, &[0]);

        let coords = &groups[0].line_coords;
        assert_eq!(coords.len(), 7 * FLOATS_PER_LINE_VERTEX);
        // First vertex of the second ring restarts at distance zero.
        assert_eq!(coords[4 * FLOATS_PER_LINE_VERTEX + 3], 0.0);
    }

    #[test]
    fn labels_record_per_entry_lengths_and_one_anchor() {
        let mut a = assignment(1);
        a.label_makers = vec![LabelMaker {
            entries: vec![
                LabelEntry { attr: "nam".to_string() },
                LabelEntry { attr: "dep".to_string() },
            ],
        }];
        let mut groups = vec![GroupBuffers::new(a)];
        let fa = attrs(&[("nam", AttrValue::Text("reef".to_string()))]);

        append_point_feature(0, &fa, [10.0, 20.0], &PlateCarree, &mut groups, &[0]);

        assert_eq!(groups[0].label_lengths, vec![4, 0]);
        assert_eq!(groups[0].label_chars.len(), 4);
        assert_eq!(groups[0].label_coords.len(), FLOATS_PER_LABEL_VERTEX);
        assert_eq!(groups[0].label_coords[0], 20.0);
        assert_eq!(groups[0].label_coords[1], 10.0);
    }

    #[test]
    fn valueless_labels_still_take_length_slots_but_no_anchor() {
        let mut a = assignment(1);
        a.label_makers = vec![LabelMaker {
            entries: vec![LabelEntry { attr: "nam".to_string() }],
        }];
        let mut groups = vec![GroupBuffers::new(a)];

        append_point_feature(0, &FeatureAttrs::new(), [0.0, 0.0], &PlateCarree, &mut groups, &[0]);

        assert_eq!(groups[0].label_lengths, vec![0]);
        assert!(groups[0].label_chars.is_empty());
        assert!(groups[0].label_coords.is_empty());
    }

    #[test]
    fn icon_rotation_converts_clockwise_degrees() {
        let mut a = assignment(1);
        a.point_symbol = "icon.svg".to_string();
        a.orientation_attr = "orient".to_string();
        let mut groups = vec![GroupBuffers::new(a)];
        let fa = attrs(&[("orient", AttrValue::Double(90.0))]);

        append_point_feature(0, &fa, [0.0, 0.0], &PlateCarree, &mut groups, &[0]);

        let rotation = groups[0].icon_coords[3];
        assert!((rotation - (-std::f32::consts::FRAC_PI_2)).abs() < 1e-6);
    }
}

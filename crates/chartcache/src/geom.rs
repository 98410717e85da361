//! Box/segment/triangle intersection predicates shared by the tree builder
//! and tree search. All bounds are inclusive on both sides, which keeps
//! degenerate items (points, axis-aligned segments) well behaved.

#[inline]
pub fn box_contains_point(x_min: f32, y_min: f32, x_max: f32, y_max: f32, x: f32, y: f32) -> bool {
    x_min <= x && x <= x_max && y_min <= y && y <= y_max
}

pub fn box_intersects_line(
    x_min: f32,
    y_min: f32,
    x_max: f32,
    y_max: f32,
    xa: f32,
    ya: f32,
    xb: f32,
    yb: f32,
) -> bool {
    if box_contains_point(x_min, y_min, x_max, y_max, xa, ya) {
        return true;
    }
    if box_contains_point(x_min, y_min, x_max, y_max, xb, yb) {
        return true;
    }

    if xa < x_min && xb < x_min {
        return false;
    }
    if xa > x_max && xb > x_max {
        return false;
    }
    if ya < y_min && yb < y_min {
        return false;
    }
    if ya > y_max && yb > y_max {
        return false;
    }

    line_intersects_horizontal(xa, ya, xb, yb, x_min, x_max, y_min)
        || line_intersects_horizontal(xa, ya, xb, yb, x_min, x_max, y_max)
        || line_intersects_vertical(xa, ya, xb, yb, x_min, y_min, y_max)
        || line_intersects_vertical(xa, ya, xb, yb, x_max, y_min, y_max)
}

#[allow(clippy::too_many_arguments)]
pub fn box_intersects_triangle(
    x_min: f32,
    y_min: f32,
    x_max: f32,
    y_max: f32,
    xa: f32,
    ya: f32,
    xb: f32,
    yb: f32,
    xc: f32,
    yc: f32,
) -> bool {
    if box_contains_point(x_min, y_min, x_max, y_max, xa, ya)
        || box_contains_point(x_min, y_min, x_max, y_max, xb, yb)
        || box_contains_point(x_min, y_min, x_max, y_max, xc, yc)
    {
        return true;
    }

    if xa < x_min && xb < x_min && xc < x_min {
        return false;
    }
    if xa > x_max && xb > x_max && xc > x_max {
        return false;
    }
    if ya < y_min && yb < y_min && yc < y_min {
        return false;
    }
    if ya > y_max && yb > y_max && yc > y_max {
        return false;
    }

    if triangle_contains_point(xa, ya, xb, yb, xc, yc, x_min, y_min)
        || triangle_contains_point(xa, ya, xb, yb, xc, yc, x_max, y_min)
        || triangle_contains_point(xa, ya, xb, yb, xc, yc, x_min, y_max)
        || triangle_contains_point(xa, ya, xb, yb, xc, yc, x_max, y_max)
    {
        return true;
    }

    for &(x0, y0, x1, y1) in &[(xa, ya, xb, yb), (xb, yb, xc, yc), (xc, yc, xa, ya)] {
        if line_intersects_horizontal(x0, y0, x1, y1, x_min, x_max, y_min)
            || line_intersects_horizontal(x0, y0, x1, y1, x_min, x_max, y_max)
            || line_intersects_vertical(x0, y0, x1, y1, x_min, y_min, y_max)
            || line_intersects_vertical(x0, y0, x1, y1, x_max, y_min, y_max)
        {
            return true;
        }
    }

    false
}

/// Edge cross products all the same sign (or zero) puts the point inside,
/// regardless of winding.
pub fn triangle_contains_point(xa: f32, ya: f32, xb: f32, yb: f32, xc: f32, yc: f32, x: f32, y: f32) -> bool {
    let cross_ab = cross(x - xa, y - ya, xb - xa, yb - ya);
    let cross_bc = cross(x - xb, y - yb, xc - xb, yc - yb);
    let cross_ca = cross(x - xc, y - yc, xa - xc, ya - yc);

    (cross_ab <= 0.0 && cross_bc <= 0.0 && cross_ca <= 0.0)
        || (cross_ab >= 0.0 && cross_bc >= 0.0 && cross_ca >= 0.0)
}

#[inline]
fn cross(xa: f32, ya: f32, xb: f32, yb: f32) -> f32 {
    xa * yb - ya * xb
}

fn line_intersects_horizontal(xa: f32, ya: f32, xb: f32, yb: f32, x_min: f32, x_max: f32, y: f32) -> bool {
    let dy = yb - ya;
    if dy == 0.0 {
        ya == y
            && if xa < xb {
                xa <= x_max && xb >= x_min
            } else {
                xb <= x_max && xa >= x_min
            }
    } else {
        let alpha = f64::from(y - ya) / f64::from(dy);
        if !(0.0..=1.0).contains(&alpha) {
            false
        } else {
            let x = f64::from(xa) + alpha * f64::from(xb - xa);
            f64::from(x_min) <= x && x <= f64::from(x_max)
        }
    }
}

fn line_intersects_vertical(xa: f32, ya: f32, xb: f32, yb: f32, x: f32, y_min: f32, y_max: f32) -> bool {
    let dx = xb - xa;
    if dx == 0.0 {
        xa == x
            && if ya < yb {
                ya <= y_max && yb >= y_min
            } else {
                yb <= y_max && ya >= y_min
            }
    } else {
        let alpha = f64::from(x - xa) / f64::from(dx);
        if !(0.0..=1.0).contains(&alpha) {
            false
        } else {
            let y = f64::from(ya) + alpha * f64::from(yb - ya);
            f64::from(y_min) <= y && y <= f64::from(y_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_containment_is_inclusive() {
        assert!(box_contains_point(0.0, 0.0, 1.0, 1.0, 0.0, 0.0));
        assert!(box_contains_point(0.0, 0.0, 1.0, 1.0, 1.0, 1.0));
        assert!(!box_contains_point(0.0, 0.0, 1.0, 1.0, 1.0001, 0.5));
    }

    #[test]
    fn line_crossing_box_without_endpoint_inside() {
        // Crosses the box diagonally, both endpoints outside
        assert!(box_intersects_line(0.0, 0.0, 1.0, 1.0, -1.0, 0.5, 2.0, 0.5));
        // Passes entirely to one side
        assert!(!box_intersects_line(0.0, 0.0, 1.0, 1.0, -1.0, 2.0, 2.0, 2.0));
        // Degenerate horizontal segment lying on the top edge
        assert!(box_intersects_line(0.0, 0.0, 1.0, 1.0, -1.0, 1.0, 2.0, 1.0));
        // Degenerate vertical segment on the left edge
        assert!(box_intersects_line(0.0, 0.0, 1.0, 1.0, 0.0, -1.0, 0.0, 2.0));
    }

    #[test]
    fn near_miss_diagonal_rejected() {
        // Bounding boxes overlap but the segment passes outside the corner
        assert!(!box_intersects_line(0.0, 0.0, 1.0, 1.0, 1.5, 0.0, 0.0, 1.5));
        // Nudge it inward and it clips the corner
        assert!(box_intersects_line(0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0));
    }

    #[test]
    fn triangle_surrounding_box_intersects() {
        // Box strictly inside a big triangle: no vertex or edge crossings,
        // only the corner-in-triangle test can catch it
        assert!(box_intersects_triangle(
            0.4, 0.4, 0.6, 0.6, -10.0, -10.0, 10.0, -10.0, 0.0, 10.0
        ));
        // Winding flipped
        assert!(box_intersects_triangle(
            0.4, 0.4, 0.6, 0.6, -10.0, -10.0, 0.0, 10.0, 10.0, -10.0
        ));
    }

    #[test]
    fn triangle_outside_box_rejected() {
        assert!(!box_intersects_triangle(
            0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 2.0, 2.5, 3.0
        ));
    }

    #[test]
    fn triangle_edge_clipping_box() {
        // One edge slices through, all vertices outside
        assert!(box_intersects_triangle(
            0.0, 0.0, 1.0, 1.0, -1.0, 0.5, 2.0, 0.5, 0.5, 5.0
        ));
    }
}

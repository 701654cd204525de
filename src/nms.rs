use crate::geometry::{BBox, Corners};

/// Greedy non-maximum suppression over pixel boxes.
///
/// Candidates are ranked by bottom edge (`y + h`), ties keeping input order,
/// and the box with the largest bottom edge that is still alive is kept next.
/// A remaining box is dropped when the intersection covers more than
/// `iou_threshold` of *its own* area. That denominator is not the union, so a
/// small box inside a kept large one always goes, while a large box under a
/// kept small one usually stays. Areas use the inclusive `+1` pixel convention.
///
/// Output is in pick order (descending bottom edge). Labels are not
/// considered: every box competes with every other box.
pub fn suppress(boxes: &[BBox], iou_threshold: f32) -> Vec<BBox> {
    if boxes.is_empty() {
        return Vec::new();
    }

    let corners: Vec<Corners> = boxes.iter().map(BBox::corners).collect();
    let areas: Vec<f64> = corners.iter().map(Corners::inclusive_area).collect();
    let threshold = iou_threshold as f64;

    // stable: equal bottom edges stay in input order
    let mut remaining: Vec<usize> = (0..boxes.len()).collect();
    remaining.sort_by(|&a, &b| corners[a].y2.total_cmp(&corners[b].y2));

    let mut picked = Vec::with_capacity(remaining.len().min(64));
    while let Some(i) = remaining.pop() {
        picked.push(i);
        let kept = corners[i];
        remaining.retain(|&j| overlap_fraction(&kept, &corners[j], areas[j]) <= threshold);
    }

    picked
        .into_iter()
        .map(|i| {
            let c = corners[i];
            BBox::from_corners(c.x1, c.y1, c.x2, c.y2)
        })
        .collect()
}

/// Intersection of `kept` and `other` over the area of `other`.
fn overlap_fraction(kept: &Corners, other: &Corners, other_area: f64) -> f64 {
    let inter_w = (kept.x2.min(other.x2) - kept.x1.max(other.x1) + 1.0).max(0.0);
    let inter_h = (kept.y2.min(other.y2) - kept.y1.max(other.y1) + 1.0).max(0.0);
    let inter = inter_w * inter_h;

    if other_area <= 0.0 {
        return if inter > 0.0 { f64::INFINITY } else { 0.0 };
    }
    inter / other_area
}

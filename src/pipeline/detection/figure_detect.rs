// Raster figure detection from a page's paint operator stream.
// Matrices arrive in top-left page space; each painted image fills the unit
// square of the current transformation matrix.

use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;

use super::types::{
    BoundingBox, ExtractionMethod, FigureCandidate, FigureMetadata, PaintOperation, TextSpan,
};
use crate::pipeline_config::DetectionConfig;

const IDENTITY: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// Max distance below a figure at which a caption line is still attached.
const CAPTION_MAX_DISTANCE: f64 = 40.0;

static CAPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*fig(ure|\.)?\s*\d+").expect("valid caption regex")
});

/// A painted image before de-duplication.
#[derive(Debug, Clone)]
struct PaintedRegion {
    order: usize,
    name: String,
    width: u32,
    height: u32,
    color_space: Option<String>,
    has_alpha: bool,
    mime_type: Option<String>,
    encoded: Option<Vec<u8>>,
    bbox: BoundingBox,
}

/// Detect figure candidates on one page.
pub fn detect_figures(
    page_num: u32,
    operations: &[PaintOperation],
    spans: &[TextSpan],
    config: &DetectionConfig,
) -> Vec<FigureCandidate> {
    let painted = collect_painted_regions(operations);
    let total = painted.len();

    let sized: Vec<PaintedRegion> = painted
        .into_iter()
        .filter(|r| r.bbox.area() >= config.min_figure_area)
        .collect();
    let mut kept = dedup_keep_largest(sized, config.figure_overlap_ratio);
    kept.sort_by_key(|r| r.order);

    tracing::debug!(
        page = page_num,
        painted = total,
        kept = kept.len(),
        "Figure detection complete"
    );

    kept.into_iter()
        .enumerate()
        .map(|(i, region)| {
            let caption = find_caption(&region.bbox, spans);
            into_candidate(page_num, i + 1, region, caption)
        })
        .collect()
}

/// Walk the operator stream tracking the CTM stack.
fn collect_painted_regions(operations: &[PaintOperation]) -> Vec<PaintedRegion> {
    let mut ctm = IDENTITY;
    let mut stack: Vec<[f64; 6]> = Vec::new();
    let mut regions = Vec::new();

    for op in operations {
        match op {
            PaintOperation::Save => stack.push(ctm),
            PaintOperation::Restore => match stack.pop() {
                Some(saved) => ctm = saved,
                None => tracing::debug!("Unbalanced restore in paint stream ignored"),
            },
            PaintOperation::Transform { matrix } => ctm = concat(matrix, &ctm),
            PaintOperation::PaintImage {
                name,
                width,
                height,
                color_space,
                has_alpha,
                mime_type,
                encoded,
            } => regions.push(PaintedRegion {
                order: regions.len(),
                name: name.clone(),
                width: *width,
                height: *height,
                color_space: color_space.clone(),
                has_alpha: *has_alpha,
                mime_type: mime_type.clone(),
                encoded: encoded.clone(),
                bbox: unit_square_bounds(&ctm),
            }),
            PaintOperation::Other => {}
        }
    }
    regions
}

/// `m × ctm`: apply `m` first, then the existing matrix.
fn concat(m: &[f64; 6], ctm: &[f64; 6]) -> [f64; 6] {
    let [a1, b1, c1, d1, e1, f1] = *m;
    let [a2, b2, c2, d2, e2, f2] = *ctm;
    [
        a1 * a2 + b1 * c2,
        a1 * b2 + b1 * d2,
        c1 * a2 + d1 * c2,
        c1 * b2 + d1 * d2,
        e1 * a2 + f1 * c2 + e2,
        e1 * b2 + f1 * d2 + f2,
    ]
}

fn unit_square_bounds(ctm: &[f64; 6]) -> BoundingBox {
    let [a, b, c, d, e, f] = *ctm;
    let corners = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)]
        .map(|(x, y)| (a * x + c * y + e, b * x + d * y + f));

    let min_x = corners.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = corners.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = corners.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = corners.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

    BoundingBox::new(min_x, min_y, max_x - min_x, max_y - min_y)
}

/// Keep the largest of any group of overlapping regions.
/// Two regions overlap when their intersection exceeds `ratio` of the smaller one.
fn dedup_keep_largest(mut regions: Vec<PaintedRegion>, ratio: f64) -> Vec<PaintedRegion> {
    // Stable sort: equal areas keep paint order
    regions.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));

    let mut kept: Vec<PaintedRegion> = Vec::new();
    for region in regions {
        let duplicate = kept.iter().any(|k| {
            let smaller = k.bbox.area().min(region.bbox.area());
            smaller > 0.0 && k.bbox.intersection_area(&region.bbox) / smaller > ratio
        });
        if duplicate {
            tracing::trace!(image = %region.name, "Overlapping image dropped");
        } else {
            kept.push(region);
        }
    }
    kept
}

/// Nearest "Figure N" line just below the figure and horizontally overlapping it.
fn find_caption(bbox: &BoundingBox, spans: &[TextSpan]) -> Option<String> {
    spans
        .iter()
        .filter(|s| CAPTION_RE.is_match(&s.text))
        .filter(|s| s.bbox.x < bbox.right() && s.bbox.right() > bbox.x)
        .map(|s| (s.bbox.y - bbox.bottom(), s))
        .filter(|(dist, _)| *dist >= -1.0 && *dist <= CAPTION_MAX_DISTANCE)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, s)| s.text.trim().to_string())
}

fn into_candidate(
    page_num: u32,
    n: usize,
    region: PaintedRegion,
    caption: Option<String>,
) -> FigureCandidate {
    let data_url = match &region.encoded {
        Some(bytes) if !bytes.is_empty() => {
            let mime = region.mime_type.as_deref().unwrap_or("image/png");
            format!(
                "data:{mime};base64,{}",
                base64::engine::general_purpose::STANDARD.encode(bytes)
            )
        }
        _ => format!("image-ref://page/{page_num}/{}", region.name),
    };

    FigureCandidate {
        id: format!("figure-p{page_num}-{n}"),
        page_num,
        data_url,
        width: region.width,
        height: region.height,
        bounding_box: region.bbox,
        metadata: FigureMetadata {
            color_space: region.color_space,
            has_alpha: region.has_alpha,
            image_name: region.name,
        },
        caption,
        extraction_method: ExtractionMethod::OperatorListInterception,
    }
}

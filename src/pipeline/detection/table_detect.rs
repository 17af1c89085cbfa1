// Geometric table detection from positioned text spans.
// Spans are clustered into rows by vertical proximity, rows into blocks of
// consecutive multi-cell rows, and chunk start positions into column bins.
// A block is a table when enough rows share enough column starts and the
// rows do not read like flowing prose.

use super::types::{BoundingBox, ExtractionMethod, TableCandidate, TextSpan};
use crate::pipeline_config::DetectionConfig;

/// Fallback row height when spans carry no usable height.
const DEFAULT_ROW_HEIGHT: f64 = 10.0;

/// Horizontal run of spans close enough to read as one cell.
#[derive(Debug, Clone)]
struct Chunk {
    text: String,
    bbox: BoundingBox,
}

impl Chunk {
    fn start(&self) -> f64 {
        self.bbox.x
    }
}

#[derive(Debug, Clone)]
struct Row {
    chunks: Vec<Chunk>,
    bbox: BoundingBox,
}

/// A cluster of chunk start positions.
#[derive(Debug, Clone)]
struct ColumnBin {
    sum: f64,
    count: usize,
    left: f64,
    /// Distinct rows that contributed a start to this bin.
    rows: Vec<usize>,
}

impl ColumnBin {
    fn center(&self) -> f64 {
        self.sum / self.count as f64
    }

    fn support(&self) -> usize {
        self.rows.len()
    }
}

/// Detect table candidates on one page.
pub fn detect_tables(
    page_num: u32,
    spans: &[TextSpan],
    config: &DetectionConfig,
) -> Vec<TableCandidate> {
    let rows = cluster_rows(spans, config);
    if rows.len() < config.min_rows {
        return Vec::new();
    }

    let mut tables = Vec::new();
    for block in split_blocks(rows, config) {
        if block.len() < config.min_rows {
            continue;
        }
        if let Some(mut table) = build_table(page_num, &block, config) {
            table.id = format!("table-p{page_num}-{}", tables.len() + 1);
            tables.push(table);
        }
    }

    tracing::debug!(page = page_num, tables = tables.len(), "Table detection complete");
    tables
}

// ═══════════════════════════════════════════════════════════
// Row clustering
// ═══════════════════════════════════════════════════════════

/// Group spans into rows by vertical-centre proximity, then merge
/// horizontally adjacent spans into cell chunks.
fn cluster_rows(spans: &[TextSpan], config: &DetectionConfig) -> Vec<Row> {
    let mut sorted: Vec<&TextSpan> = spans
        .iter()
        .filter(|s| !s.text.trim().is_empty() && s.bbox.is_well_formed())
        .collect();
    sorted.sort_by(|a, b| {
        a.bbox
            .center_y()
            .total_cmp(&b.bbox.center_y())
            .then(a.bbox.x.total_cmp(&b.bbox.x))
    });

    let mut groups: Vec<Vec<&TextSpan>> = Vec::new();
    let mut row_center = f64::NEG_INFINITY;

    for span in sorted {
        let cy = span.bbox.center_y();
        match groups.last_mut() {
            Some(group) if (cy - row_center).abs() <= config.row_tolerance => {
                group.push(span);
                // Running mean keeps slightly skewed baselines together
                row_center += (cy - row_center) / group.len() as f64;
            }
            _ => {
                groups.push(vec![span]);
                row_center = cy;
            }
        }
    }

    groups
        .into_iter()
        .map(|mut group| {
            group.sort_by(|a, b| a.bbox.x.total_cmp(&b.bbox.x));
            merge_into_row(&group, config)
        })
        .collect()
}

fn merge_into_row(spans: &[&TextSpan], config: &DetectionConfig) -> Row {
    let mut chunks: Vec<Chunk> = Vec::new();

    for span in spans {
        let text = span.text.trim();
        let height = span_height(span);

        if let Some(last) = chunks.last_mut() {
            let gap = span.bbox.x - last.bbox.right();
            let threshold = config.cell_gap_ratio * height.max(last.bbox.height);
            if gap < threshold {
                if !last.text.ends_with(' ') {
                    last.text.push(' ');
                }
                last.text.push_str(text);
                last.bbox = last.bbox.union(&span.bbox);
                continue;
            }
        }

        chunks.push(Chunk {
            text: text.to_string(),
            bbox: span.bbox,
        });
    }

    let bbox = chunks
        .iter()
        .skip(1)
        .fold(chunks[0].bbox, |acc, c| acc.union(&c.bbox));

    Row { chunks, bbox }
}

fn span_height(span: &TextSpan) -> f64 {
    if span.bbox.height > 0.0 {
        span.bbox.height
    } else {
        span.font_size.filter(|s| *s > 0.0).unwrap_or(DEFAULT_ROW_HEIGHT)
    }
}

/// Split rows into runs of consecutive multi-chunk rows with small vertical gaps.
fn split_blocks(rows: Vec<Row>, config: &DetectionConfig) -> Vec<Vec<Row>> {
    let max_gap = config.max_row_gap_ratio * median_row_height(&rows);

    let mut blocks: Vec<Vec<Row>> = Vec::new();
    let mut current: Vec<Row> = Vec::new();

    for row in rows {
        if row.chunks.len() < 2 {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }

        let continues = current
            .last()
            .map(|prev| row.bbox.y - prev.bbox.bottom() <= max_gap)
            .unwrap_or(true);
        if !continues {
            blocks.push(std::mem::take(&mut current));
        }
        current.push(row);
    }

    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn median_row_height(rows: &[Row]) -> f64 {
    let mut heights: Vec<f64> = rows
        .iter()
        .map(|r| r.bbox.height)
        .filter(|h| *h > 0.0)
        .collect();
    if heights.is_empty() {
        return DEFAULT_ROW_HEIGHT;
    }
    heights.sort_by(|a, b| a.total_cmp(b));
    heights[heights.len() / 2]
}

// ═══════════════════════════════════════════════════════════
// Column alignment
// ═══════════════════════════════════════════════════════════

/// Cluster chunk starts of a block into column bins.
/// Returns bins ordered left to right.
fn column_bins(block: &[Row], tolerance: f64) -> Vec<ColumnBin> {
    let mut starts: Vec<(f64, usize)> = block
        .iter()
        .enumerate()
        .flat_map(|(row_idx, row)| row.chunks.iter().map(move |c| (c.start(), row_idx)))
        .collect();
    starts.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut bins: Vec<ColumnBin> = Vec::new();
    for (x, row_idx) in starts {
        match bins.last_mut() {
            Some(bin) if (x - bin.center()).abs() <= tolerance => {
                bin.sum += x;
                bin.count += 1;
                if !bin.rows.contains(&row_idx) {
                    bin.rows.push(row_idx);
                }
            }
            _ => bins.push(ColumnBin {
                sum: x,
                count: 1,
                left: x,
                rows: vec![row_idx],
            }),
        }
    }
    bins
}

fn is_on_aligned(x: f64, aligned: &[ColumnBin], tolerance: f64) -> bool {
    aligned.iter().any(|b| (x - b.center()).abs() <= tolerance)
}

/// Long multi-word run typical of paragraph text.
fn is_long_run(text: &str, config: &DetectionConfig) -> bool {
    text.split_whitespace().count() >= config.prose_min_words
        && text.chars().count() >= config.prose_min_chars
}

/// A row reads like prose when half its chunks are long runs, or when it
/// carries a long run and some of its starts do not recur across rows.
fn is_prose_row(row: &Row, aligned: &[ColumnBin], config: &DetectionConfig) -> bool {
    let long_runs = row
        .chunks
        .iter()
        .filter(|c| is_long_run(&c.text, config))
        .count();
    if long_runs == 0 {
        return false;
    }
    let off_grid = row
        .chunks
        .iter()
        .filter(|c| !is_on_aligned(c.start(), aligned, config.column_tolerance))
        .count();
    long_runs * 2 >= row.chunks.len() || off_grid > 0
}

// ═══════════════════════════════════════════════════════════
// Table assembly
// ═══════════════════════════════════════════════════════════

fn build_table(page_num: u32, block: &[Row], config: &DetectionConfig) -> Option<TableCandidate> {
    let row_count = block.len();
    let bins = column_bins(block, config.column_tolerance);

    let aligned: Vec<ColumnBin> = bins
        .into_iter()
        .filter(|b| b.support() as f64 / row_count as f64 >= config.alignment_ratio)
        .collect();

    if aligned.len() < config.min_columns {
        tracing::trace!(
            page = page_num,
            aligned = aligned.len(),
            "Block rejected: too few aligned columns"
        );
        return None;
    }

    let consistent_rows = block
        .iter()
        .filter(|row| {
            row.chunks
                .iter()
                .filter(|c| is_on_aligned(c.start(), &aligned, config.column_tolerance))
                .count()
                >= 2
        })
        .count();
    if (consistent_rows as f64 / row_count as f64) < config.alignment_ratio {
        tracing::trace!(page = page_num, consistent_rows, row_count, "Block rejected: inconsistent alignment");
        return None;
    }

    let prose_rows = block
        .iter()
        .filter(|row| is_prose_row(row, &aligned, config))
        .count();
    if prose_rows * 2 > row_count {
        tracing::debug!(page = page_num, prose_rows, row_count, "Block rejected as prose");
        return None;
    }

    let column_positions: Vec<f64> = aligned.iter().map(|b| b.left).collect();
    let raw_grid: Vec<Vec<String>> = block
        .iter()
        .map(|row| assign_to_columns(row, &aligned, config.column_tolerance))
        .collect();

    let bounding_box = block
        .iter()
        .skip(1)
        .fold(block[0].bbox, |acc, r| acc.union(&r.bbox));

    let headers = raw_grid[0].clone();
    let rows = raw_grid[1..].to_vec();

    Some(TableCandidate {
        id: String::new(),
        page_num,
        headers,
        rows,
        raw_grid,
        column_positions,
        bounding_box,
        extraction_method: ExtractionMethod::GeometricDetection,
    })
}

/// Place each chunk in the right-most aligned column starting at or left of it.
fn assign_to_columns(row: &Row, aligned: &[ColumnBin], tolerance: f64) -> Vec<String> {
    let mut cells = vec![String::new(); aligned.len()];
    for chunk in &row.chunks {
        let col = aligned
            .iter()
            .rposition(|b| b.left <= chunk.start() + tolerance)
            .unwrap_or(0);
        let cell = &mut cells[col];
        if !cell.is_empty() {
            cell.push(' ');
        }
        cell.push_str(&chunk.text);
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAR_WIDTH: f64 = 5.0;
    const LINE_HEIGHT: f64 = 10.0;

    fn span(text: &str, x: f64, y: f64) -> TextSpan {
        TextSpan {
            text: text.to_string(),
            bbox: BoundingBox::new(x, y, text.chars().count() as f64 * CHAR_WIDTH, LINE_HEIGHT),
            font_name: Some("Helvetica".into()),
            font_size: Some(LINE_HEIGHT),
        }
    }

    /// One span per cell, columns at fixed x, rows 15 units apart.
    fn grid_spans(grid: &[&[&str]], columns: &[f64], top: f64) -> Vec<TextSpan> {
        let mut spans = Vec::new();
        for (r, row) in grid.iter().enumerate() {
            for (c, text) in row.iter().enumerate() {
                spans.push(span(text, columns[c], top + r as f64 * 15.0));
            }
        }
        spans
    }

    fn demographics_grid() -> Vec<TextSpan> {
        grid_spans(
            &[
                &["Variable", "Surgery", "Control"],
                &["Age", "62.1", "63.4"],
                &["Male sex", "54%", "51%"],
                &["NIHSS", "18", "17"],
                &["GCS", "9", "10"],
            ],
            &[50.0, 200.0, 300.0],
            100.0,
        )
    }

    #[test]
    fn four_by_three_grid_detected() {
        let tables = detect_tables(1, &demographics_grid(), &DetectionConfig::default());
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.id, "table-p1-1");
        assert_eq!(table.headers, vec!["Variable", "Surgery", "Control"]);
        assert_eq!(table.rows.len(), 4);
        assert_eq!(table.rows[1], vec!["Male sex", "54%", "51%"]);
        assert_eq!(table.raw_grid.len(), 5);
        assert_eq!(table.column_positions, vec![50.0, 200.0, 300.0]);
        assert_eq!(table.extraction_method, ExtractionMethod::GeometricDetection);
    }

    #[test]
    fn bounding_box_covers_all_rows() {
        let tables = detect_tables(1, &demographics_grid(), &DetectionConfig::default());
        let bbox = tables[0].bounding_box;
        assert!((bbox.x - 50.0).abs() < 1e-9);
        assert!((bbox.y - 100.0).abs() < 1e-9);
        assert!((bbox.bottom() - (100.0 + 4.0 * 15.0 + LINE_HEIGHT)).abs() < 1e-9);
    }

    #[test]
    fn single_word_headings_rejected() {
        let spans = vec![
            span("Introduction", 50.0, 100.0),
            span("Methods", 50.0, 140.0),
            span("Results", 50.0, 180.0),
        ];
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn paragraph_lines_rejected() {
        let lines = [
            "Patients were randomized to decompressive surgery or best medical",
            "treatment within 48 hours of symptom onset and followed for twelve",
            "months with the modified Rankin Scale as the primary endpoint of",
            "the trial, assessed by investigators blinded to the allocation.",
            "Secondary endpoints included mortality and quality of life scores.",
        ];
        let spans: Vec<TextSpan> = lines
            .iter()
            .enumerate()
            .map(|(i, l)| span(l, 50.0, 100.0 + i as f64 * 12.0))
            .collect();
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn two_column_prose_rejected() {
        let left = [
            "Patients were randomized to surgery or best",
            "medical treatment within two days of onset",
            "and were followed for twelve months after",
            "enrollment by blinded outcome assessors who",
            "recorded functional status at every visit",
        ];
        let right = [
            "Mortality was lower in the surgical arm and",
            "functional outcome was better among the young",
            "patients although the effect was attenuated",
            "in those older than sixty years of age with",
            "large hemispheric infarcts on baseline imaging",
        ];
        let mut spans = Vec::new();
        for i in 0..5 {
            let y = 100.0 + i as f64 * 12.0;
            spans.push(span(left[i], 50.0, y));
            spans.push(span(right[i], 320.0, y));
        }
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn too_few_rows_rejected() {
        let spans = grid_spans(
            &[&["Variable", "Surgery"], &["Age", "62"], &["Sex", "54%"]],
            &[50.0, 200.0],
            100.0,
        );
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn misaligned_columns_rejected() {
        let spans = vec![
            span("Age", 50.0, 100.0),
            span("62", 120.0, 100.0),
            span("Sex", 50.0, 115.0),
            span("54%", 210.0, 115.0),
            span("GCS", 50.0, 130.0),
            span("9", 290.0, 130.0),
            span("NIHSS", 50.0, 145.0),
            span("18", 380.0, 145.0),
        ];
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn adjacent_word_spans_merge_into_one_cell() {
        let mut spans = vec![
            span("Mean", 50.0, 100.0),
            span("age", 73.0, 100.0),
            span("Surgery", 200.0, 100.0),
        ];
        for (i, (label, value)) in [("Male", "54%"), ("GCS", "9"), ("NIHSS", "18")].iter().enumerate() {
            let y = 115.0 + i as f64 * 15.0;
            spans.push(span(label, 50.0, y));
            spans.push(span(value, 200.0, y));
        }
        let tables = detect_tables(2, &spans, &DetectionConfig::default());
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers, vec!["Mean age", "Surgery"]);
        assert_eq!(tables[0].page_num, 2);
    }

    #[test]
    fn centered_header_lands_in_its_column() {
        let mut spans = demographics_grid();
        // Shift the header "Surgery" a few units right, still within the column
        spans[1] = span("Surgery", 204.0, 100.0);
        let tables = detect_tables(1, &spans, &DetectionConfig::default());
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers[1], "Surgery");
    }

    #[test]
    fn two_separated_tables_get_distinct_ids() {
        let mut spans = demographics_grid();
        spans.extend(grid_spans(
            &[
                &["Outcome", "Surgery", "Control"],
                &["Mortality", "22%", "71%"],
                &["mRS 0-3", "43%", "21%"],
                &["mRS 4-5", "35%", "8%"],
            ],
            &[50.0, 200.0, 300.0],
            400.0,
        ));
        let tables = detect_tables(3, &spans, &DetectionConfig::default());
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].id, "table-p3-1");
        assert_eq!(tables[1].id, "table-p3-2");
        assert_eq!(tables[1].headers[0], "Outcome");
    }

    #[test]
    fn input_order_does_not_matter() {
        let mut spans = demographics_grid();
        spans.reverse();
        let tables = detect_tables(1, &spans, &DetectionConfig::default());
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].headers, vec!["Variable", "Surgery", "Control"]);
    }

    #[test]
    fn empty_and_blank_spans_ignored() {
        assert!(detect_tables(1, &[], &DetectionConfig::default()).is_empty());
        let spans = vec![span("   ", 50.0, 100.0), span("", 80.0, 100.0)];
        assert!(detect_tables(1, &spans, &DetectionConfig::default()).is_empty());
    }

    #[test]
    fn missing_cell_leaves_empty_string() {
        let mut spans = demographics_grid();
        // Drop "63.4" (row 1, column 3)
        spans.remove(5);
        let tables = detect_tables(1, &spans, &DetectionConfig::default());
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].rows[0], vec!["Age", "62.1", ""]);
    }

    #[test]
    fn column_bins_cluster_nearby_starts() {
        let rows = vec![
            Row {
                chunks: vec![
                    Chunk { text: "a".into(), bbox: BoundingBox::new(50.0, 0.0, 5.0, 10.0) },
                    Chunk { text: "b".into(), bbox: BoundingBox::new(200.0, 0.0, 5.0, 10.0) },
                ],
                bbox: BoundingBox::new(50.0, 0.0, 155.0, 10.0),
            },
            Row {
                chunks: vec![
                    Chunk { text: "c".into(), bbox: BoundingBox::new(52.0, 15.0, 5.0, 10.0) },
                    Chunk { text: "d".into(), bbox: BoundingBox::new(203.0, 15.0, 5.0, 10.0) },
                ],
                bbox: BoundingBox::new(52.0, 15.0, 156.0, 10.0),
            },
        ];
        let bins = column_bins(&rows, 8.0);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].support(), 2);
        assert!((bins[0].center() - 51.0).abs() < 1e-9);
        assert_eq!(bins[0].left, 50.0);
    }

    #[test]
    fn long_run_needs_words_and_length() {
        let config = DetectionConfig::default();
        assert!(is_long_run("patients were randomized to surgery", &config));
        assert!(!is_long_run("a b c d e", &config));
        assert!(!is_long_run("Hemicraniectomy", &config));
    }
}

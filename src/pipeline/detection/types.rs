use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in page units, origin top-left, y growing down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn center_y(&self) -> f64 {
        self.y + self.height / 2.0
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Finite coordinates and non-negative extents.
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= 0.0
            && self.height >= 0.0
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        BoundingBox {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Area of the intersection (0 when disjoint).
    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }
}

/// A positioned run of text from the page's text layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub font_name: Option<String>,
    #[serde(default)]
    pub font_size: Option<f64>,
}

/// One entry of a page's paint/drawing operator stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PaintOperation {
    /// Push the current transformation matrix.
    Save,
    /// Pop the current transformation matrix.
    Restore,
    /// Concatenate `[a, b, c, d, e, f]` onto the current matrix.
    Transform { matrix: [f64; 6] },
    /// Paint a raster image into the unit square of the current matrix.
    PaintImage {
        name: String,
        /// Intrinsic pixel width.
        width: u32,
        /// Intrinsic pixel height.
        height: u32,
        #[serde(default)]
        color_space: Option<String>,
        #[serde(default)]
        has_alpha: bool,
        #[serde(default)]
        mime_type: Option<String>,
        /// Already-encoded image bytes (PNG/JPEG), when the provider has them.
        #[serde(default)]
        encoded: Option<Vec<u8>>,
    },
    /// Any operator the detector does not care about (paths, text, shading).
    Other,
}

/// Everything the geometry provider hands over for one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageGeometry {
    /// 1-based page number.
    pub page_num: u32,
    #[serde(default)]
    pub spans: Vec<TextSpan>,
    #[serde(default)]
    pub operations: Vec<PaintOperation>,
}

/// How a candidate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    GeometricDetection,
    OperatorListInterception,
}

/// A table region detected on a page. Immutable once detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCandidate {
    pub id: String,
    pub page_num: u32,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub raw_grid: Vec<Vec<String>>,
    /// Left edge of each aligned column, in page units.
    pub column_positions: Vec<f64>,
    pub bounding_box: BoundingBox,
    pub extraction_method: ExtractionMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureMetadata {
    pub color_space: Option<String>,
    pub has_alpha: bool,
    pub image_name: String,
}

/// A raster figure region detected on a page. Immutable once detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureCandidate {
    pub id: String,
    pub page_num: u32,
    /// `data:` URL when encoded bytes were available, otherwise an `image-ref://` reference.
    pub data_url: String,
    /// Intrinsic pixel dimensions.
    pub width: u32,
    pub height: u32,
    pub bounding_box: BoundingBox,
    pub metadata: FigureMetadata,
    /// Caption text near the figure, when the provider supplies it.
    #[serde(default)]
    pub caption: Option<String>,
    pub extraction_method: ExtractionMethod,
}

/// Detection output for one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageDetection {
    pub page_num: u32,
    pub tables: Vec<TableCandidate>,
    pub figures: Vec<FigureCandidate>,
}

//! Element model: canvas elements, their geometry and style, sparse patches,
//! and creation drafts.
//!
//! `Element` mirrors one row of the `board_elements` table and is the unit
//! every other module trades in. `ElementPatch` is the sparse update sent to
//! the persistence layer and applied to the store; `ElementDraft` is what a
//! caller hands to `create` before the server has assigned an id.

#[cfg(test)]
#[path = "element_test.rs"]
mod element_test;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::consts::{
    DEFAULT_NOTE_COLOR, DEFAULT_NOTE_SIZE, DEFAULT_TEXT_FONT_SIZE, DEFAULT_TEXT_SIZE, MAX_IMAGE_SIZE,
    MIN_BLOCK_SIZE, MIN_TEXT_SIZE,
};

/// Unique identifier for an element. Assigned by the persistence layer.
pub type ElementId = Uuid;

/// Unique identifier for a board.
pub type BoardId = Uuid;

/// Unique identifier for a user.
pub type UserId = Uuid;

// =============================================================================
// KIND & GEOMETRY
// =============================================================================

/// The kind of an element. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Sticky note with a background color and plain text.
    Note,
    /// Image referenced by URL.
    Image,
    /// Free-standing text block with rich formatting.
    Text,
}

impl ElementKind {
    /// Smallest size a resize gesture may produce for this kind.
    #[must_use]
    pub fn min_size(self) -> Size {
        match self {
            Self::Note | Self::Image => MIN_BLOCK_SIZE,
            Self::Text => MIN_TEXT_SIZE,
        }
    }

    /// Size used when a draft doesn't specify one.
    #[must_use]
    pub fn default_size(self) -> Size {
        match self {
            Self::Note => DEFAULT_NOTE_SIZE,
            Self::Text => DEFAULT_TEXT_SIZE,
            Self::Image => MAX_IMAGE_SIZE,
        }
    }
}

/// A point in board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width and height in board units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Grow each dimension to at least the matching dimension of `min`.
    #[must_use]
    pub fn clamped_to(self, min: Size) -> Self {
        Self { width: self.width.max(min.width), height: self.height.max(min.height) }
    }
}

/// Position and size of an element. Flattened into the row on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub position: Point,
    pub size: Size,
}

/// Scale an image's natural size down to fit within [`MAX_IMAGE_SIZE`],
/// preserving aspect ratio. Images that already fit keep their size.
#[must_use]
pub fn fit_image_size(natural: Size) -> Size {
    if natural.width <= 0.0 || natural.height <= 0.0 {
        return MAX_IMAGE_SIZE;
    }
    let ratio = (MAX_IMAGE_SIZE.width / natural.width)
        .min(MAX_IMAGE_SIZE.height / natural.height)
        .min(1.0);
    Size::new((natural.width * ratio).round(), (natural.height * ratio).round())
}

// =============================================================================
// STYLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontWeight {
    Normal,
    Bold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    Normal,
    Italic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextDecoration {
    None,
    Underline,
    LineThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heading {
    H1,
    H2,
    H3,
    H4,
    H5,
    H6,
    P,
}

/// Text formatting for text blocks. Stored as a JSON column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStyle {
    /// Font size in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_weight: Option<FontWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_style: Option<FontStyle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_decoration: Option<TextDecoration>,
    /// Text color as a CSS color string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Highlight color as a CSS color string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<Heading>,
}

impl TextStyle {
    /// Style applied to freshly created text blocks.
    #[must_use]
    pub fn text_default() -> Self {
        Self {
            font_size: Some(DEFAULT_TEXT_FONT_SIZE),
            font_weight: Some(FontWeight::Normal),
            font_style: Some(FontStyle::Normal),
            text_decoration: Some(TextDecoration::None),
            color: None,
            background_color: None,
            heading: Some(Heading::P),
        }
    }
}

/// Presentation attributes. `color` and `text` are independently mutable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Style {
    /// Note background color, or default text color for text blocks.
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default, rename = "text_style")]
    pub text: Option<TextStyle>,
}

// =============================================================================
// ELEMENT
// =============================================================================

/// A canvas element as stored in the element store and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    /// Owning board. Immutable after creation.
    pub board_id: BoardId,
    /// Creator. Immutable after creation.
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Plain text, rich markup, or an image URL depending on `kind`.
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(flatten)]
    pub style: Style,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Server-assigned; never used for local conflict decisions.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Author display name, attached locally once resolved.
    #[serde(skip)]
    pub author_name: Option<String>,
}

// =============================================================================
// PATCH
// =============================================================================

/// Sparse update for an element. Only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, rename = "text_style", skip_serializing_if = "Option::is_none")]
    pub text_style: Option<TextStyle>,
}

impl ElementPatch {
    #[must_use]
    pub fn position(position: Point) -> Self {
        Self { position: Some(position), ..Self::default() }
    }

    #[must_use]
    pub fn size(size: Size) -> Self {
        Self { size: Some(size), ..Self::default() }
    }

    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    #[must_use]
    pub fn color(color: impl Into<String>) -> Self {
        Self { color: Some(color.into()), ..Self::default() }
    }

    #[must_use]
    pub fn text_style(style: TextStyle) -> Self {
        Self { text_style: Some(style), ..Self::default() }
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.position.is_none()
            && self.size.is_none()
            && self.color.is_none()
            && self.text_style.is_none()
    }

    /// Fold a later patch into this one. Fields set in `later` win.
    pub fn merge(&mut self, later: ElementPatch) {
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.position.is_some() {
            self.position = later.position;
        }
        if later.size.is_some() {
            self.size = later.size;
        }
        if later.color.is_some() {
            self.color = later.color;
        }
        if later.text_style.is_some() {
            self.text_style = later.text_style;
        }
    }

    /// Overwrite the matching fields of `element`.
    pub fn apply_to(&self, element: &mut Element) {
        if let Some(ref content) = self.content {
            element.content.clone_from(content);
        }
        if let Some(position) = self.position {
            element.geometry.position = position;
        }
        if let Some(size) = self.size {
            element.geometry.size = size;
        }
        if let Some(ref color) = self.color {
            element.style.color = Some(color.clone());
        }
        if let Some(ref text_style) = self.text_style {
            element.style.text = Some(text_style.clone());
        }
    }
}

// =============================================================================
// DRAFTS
// =============================================================================

/// Caller-supplied description of an element to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDraft {
    pub kind: ElementKind,
    pub position: Point,
    pub content: String,
    pub size: Option<Size>,
    pub color: Option<String>,
    pub text_style: Option<TextStyle>,
}

impl ElementDraft {
    /// An empty note in the default color.
    #[must_use]
    pub fn note(position: Point) -> Self {
        Self {
            kind: ElementKind::Note,
            position,
            content: String::new(),
            size: None,
            color: Some(DEFAULT_NOTE_COLOR.to_owned()),
            text_style: None,
        }
    }

    /// An empty text block with the default formatting.
    #[must_use]
    pub fn text(position: Point) -> Self {
        Self {
            kind: ElementKind::Text,
            position,
            content: String::new(),
            size: None,
            color: None,
            text_style: Some(TextStyle::text_default()),
        }
    }

    /// An image at `url`, sized from its natural dimensions.
    #[must_use]
    pub fn image(position: Point, url: impl Into<String>, natural: Size) -> Self {
        Self {
            kind: ElementKind::Image,
            position,
            content: url.into(),
            size: Some(fit_image_size(natural)),
            color: None,
            text_style: None,
        }
    }
}

/// Insert row for a new element. The server assigns `id` and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewElement {
    pub board_id: BoardId,
    #[serde(rename = "user_id")]
    pub author_id: UserId,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub content: String,
    pub position: Point,
    pub size: Size,
    pub color: Option<String>,
    pub text_style: Option<TextStyle>,
}

impl NewElement {
    /// Resolve a draft against its board and author, filling kind defaults.
    #[must_use]
    pub fn from_draft(draft: ElementDraft, board_id: BoardId, author_id: UserId) -> Self {
        Self {
            board_id,
            author_id,
            kind: draft.kind,
            content: draft.content,
            position: draft.position,
            size: draft.size.unwrap_or_else(|| draft.kind.default_size()),
            color: draft.color,
            text_style: draft.text_style,
        }
    }

    /// Materialize the row under `id` with both timestamps set to `at`.
    #[must_use]
    pub fn into_element(self, id: ElementId, at: OffsetDateTime) -> Element {
        Element {
            id,
            board_id: self.board_id,
            author_id: self.author_id,
            kind: self.kind,
            content: self.content,
            geometry: Geometry { position: self.position, size: self.size },
            style: Style { color: self.color, text: self.text_style },
            created_at: at,
            updated_at: at,
            author_name: None,
        }
    }
}

use std::fmt;

use qrcode::{Color, EcLevel, QrCode, Version, render::svg};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::AppError;

/// Length of newly minted identifiers.
pub const MATERIAL_ID_LEN: usize = 7;

/// Upper-case alphanumerics only, so minted identifiers stay in the QR alphanumeric mode.
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Side of one rendered module, in SVG user units.
pub const MODULE_SIZE: u32 = 8;

/// Quiet-zone width in modules. Matches the margin `qrcode` draws for normal symbols.
pub const QUIET_ZONE: usize = 4;

const EC_LEVEL: EcLevel = EcLevel::M;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("scanned payload is empty")]
    EmptyPayload,
    #[error("identifier cannot be encoded as a QR symbol: {0}")]
    Encode(String),
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::EmptyPayload => AppError::EmptyPayload,
            CodecError::Encode(reason) => AppError::Internal(reason),
        }
    }
}

/// MaterialId
///
/// The identifier printed on a fitting. It is the document key in the store and the only
/// payload of its QR symbol. Construction only trims and rejects empty input, so any
/// identifier already in the field survives a decode unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaterialId(String);

impl MaterialId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, CodecError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(CodecError::EmptyPayload);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Mints a fresh identifier from the thread-local RNG.
    pub fn mint() -> Self {
        Self::mint_with(&mut rand::thread_rng())
    }

    pub fn mint_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let id = (0..MATERIAL_ID_LEN)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MaterialId {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MaterialId::new(value)
    }
}

impl From<MaterialId> for String {
    fn from(id: MaterialId) -> Self {
        id.0
    }
}

/// GreyFrame
///
/// An 8-bit greyscale raster, row-major. This is what the scan worker consumes from a
/// camera and what [`QrSymbol::to_frame`] produces for raster consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreyFrame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GreyFrame {
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }
}

/// QrSymbol
///
/// The encoded form of one identifier. Encoding is pure: the same identifier always
/// yields the same module matrix and byte-identical SVG markup.
pub struct QrSymbol {
    code: QrCode,
}

/// encode
///
/// Builds the QR symbol for `id` at error-correction level M, letting `qrcode` pick the
/// smallest normal version that holds the payload. The payload is the identifier bytes
/// and nothing else.
pub fn encode(id: &MaterialId) -> Result<QrSymbol, CodecError> {
    let code = QrCode::with_error_correction_level(id.as_str().as_bytes(), EC_LEVEL)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(QrSymbol { code })
}

impl QrSymbol {
    /// Modules per side, without the quiet zone.
    pub fn width(&self) -> usize {
        self.code.width()
    }

    pub fn version(&self) -> i16 {
        match self.code.version() {
            Version::Normal(v) | Version::Micro(v) => v,
        }
    }

    /// Row-major module matrix, `true` for dark modules.
    pub fn modules(&self) -> Vec<Vec<bool>> {
        let width = self.width();
        self.code
            .to_colors()
            .chunks(width)
            .map(|row| row.iter().map(|c| *c == Color::Dark).collect())
            .collect()
    }

    /// Scalable SVG: fixed-size square per module, quiet zone included, black on white.
    pub fn to_svg(&self) -> String {
        self.code
            .render::<svg::Color>()
            .quiet_zone(true)
            .module_dimensions(MODULE_SIZE, MODULE_SIZE)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#ffffff"))
            .build()
    }

    /// Rasterises the symbol with the quiet zone, `scale` pixels per module.
    pub fn to_frame(&self, scale: usize) -> GreyFrame {
        let scale = scale.max(1);
        let modules = self.modules();
        let side = (self.width() + 2 * QUIET_ZONE) * scale;
        let mut pixels = vec![255u8; side * side];

        for (row, cells) in modules.iter().enumerate() {
            for (col, dark) in cells.iter().enumerate() {
                if !dark {
                    continue;
                }
                let top = (row + QUIET_ZONE) * scale;
                let left = (col + QUIET_ZONE) * scale;
                for y in top..top + scale {
                    pixels[y * side + left..y * side + left + scale].fill(0);
                }
            }
        }

        GreyFrame {
            width: side,
            height: side,
            pixels,
        }
    }
}

/// decode_payload
///
/// Turns a raw scanner string into an identifier. Printed codes carry either the bare
/// identifier or a deep link to the public record page, and the operator cannot tell
/// which, so both are accepted:
///
/// - an absolute hierarchical URL yields its final non-empty path segment;
/// - anything else (including opaque URLs such as `urn:` or `mailto:`) is taken verbatim
///   after trimming.
///
/// The query string is never consulted; `/materials/{id}` is the canonical link form.
pub fn decode_payload(payload: &str) -> Result<MaterialId, CodecError> {
    let trimmed = payload.trim();
    let candidate = match Url::parse(trimmed) {
        Ok(url) if !url.cannot_be_a_base() => last_path_segment(&url).unwrap_or_default(),
        _ => trimmed.to_string(),
    };
    MaterialId::new(candidate)
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Canonical deep link for a record, the scan target printed codes may point at.
pub fn record_link(public_base_url: &str, id: &MaterialId) -> String {
    format!("{}/materials/{}", public_base_url.trim_end_matches('/'), id)
}

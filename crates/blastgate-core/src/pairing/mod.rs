//! Pairing code rendering.
//!
//! The transport hands out pairing codes as opaque strings.  Operators scan
//! them with the phone app, so they are stored and served as a QR image
//! embedded in a `data:` URI that a browser can show directly.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use qrcode::render::svg;
use qrcode::QrCode;
use thiserror::Error;

const DATA_URI_PREFIX: &str = "data:image/svg+xml;base64,";

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing code is empty")]
    Empty,

    #[error("pairing code cannot be encoded as a QR symbol: {0}")]
    Encode(String),
}

/// Renders `code` as a base64 SVG QR image data URI.
///
/// # Errors
///
/// Returns [`PairingError::Empty`] for an empty code and
/// [`PairingError::Encode`] when the code is too long for a QR symbol.
pub fn render_pairing_code(code: &str) -> Result<String, PairingError> {
    if code.is_empty() {
        return Err(PairingError::Empty);
    }
    let symbol =
        QrCode::new(code.as_bytes()).map_err(|e| PairingError::Encode(e.to_string()))?;
    let image = symbol
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!("{DATA_URI_PREFIX}{}", STANDARD.encode(image)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_produces_svg_data_uri() {
        // Arrange
        let code = "2@AbCdEf,ghIJkl,mnOPqr==";

        // Act
        let uri = render_pairing_code(code).unwrap();

        // Assert
        let payload = uri.strip_prefix(DATA_URI_PREFIX).expect("data uri prefix");
        let svg = String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_same_code_renders_identically() {
        assert_eq!(
            render_pairing_code("abc").unwrap(),
            render_pairing_code("abc").unwrap()
        );
    }

    #[test]
    fn test_empty_code_is_rejected() {
        assert!(matches!(render_pairing_code(""), Err(PairingError::Empty)));
    }
}

use base64::Engine;
use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};

/// Minimum rendered edge length in pixels.
const QR_SIZE: u32 = 300;

#[derive(Debug, thiserror::Error)]
#[error("failed to render QR payload: {0}")]
pub struct QrRenderError(#[from] qrcode::types::QrError);

/// Render a QR payload to a `data:` URL holding an SVG image, suitable for
/// dropping straight into an `<img src>`.
pub fn render_data_url(payload: &str) -> Result<String, QrRenderError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::H)?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .quiet_zone(true)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    let encoded = base64::engine::general_purpose::STANDARD.encode(image.as_bytes());
    Ok(format!("data:image/svg+xml;base64,{encoded}"))
}

//! Composite engine command construction.
//!
//! A render is delivered to a worker as one command line: the view setup
//! directives joined by [`COMMAND_SEPARATOR`], followed by a terminal
//! `save` directive targeting the job's output file. Sending everything
//! in a single command keeps the view state and the capture atomic with
//! respect to other commands on the same worker.

use std::path::Path;

use crate::render::{ImageFormat, Representation, RenderParameters};

/// Separator between directives in a composite command.
pub const COMMAND_SEPARATOR: &str = " ; ";

/// Supersampling factor for saved images.
const SUPERSAMPLE: u32 = 3;

/// JPEG quality for saved images.
const JPEG_QUALITY: u32 = 90;

/// Build the full composite render command for `params`, saving to `output`.
pub fn build_render_command(params: &RenderParameters, output: &Path) -> String {
    let mut parts = view_directives(params);
    parts.push(save_directive(params, output));
    parts.join(COMMAND_SEPARATOR)
}

/// View setup directives, in application order.
pub fn view_directives(params: &RenderParameters) -> Vec<String> {
    let mut parts = Vec::new();

    // Representation first so the camera fit sees the final geometry.
    match params.style.representation {
        Representation::Cartoon => {
            parts.push("hide atoms".to_string());
            parts.push("show cartoons".to_string());
        }
        Representation::Stick => {
            parts.push("hide cartoons".to_string());
            parts.push("show atoms".to_string());
            parts.push("style stick".to_string());
        }
        Representation::BallAndStick => {
            parts.push("hide cartoons".to_string());
            parts.push("show atoms".to_string());
            parts.push("style ball".to_string());
        }
        Representation::Sphere => {
            parts.push("hide cartoons".to_string());
            parts.push("show atoms".to_string());
            parts.push("style sphere".to_string());
        }
        Representation::Surface => parts.push("surface".to_string()),
    }
    if let Some(scheme) = params.style.color_scheme.as_deref() {
        if is_keyword(scheme) {
            parts.push(format!("color {scheme}"));
        }
    }

    match params.camera.named_view.as_deref() {
        Some(name) if is_keyword(name) => parts.push(format!("view {name}")),
        _ if params.camera.fit => parts.push("view".to_string()),
        _ => {}
    }
    if let Some(angle) = params.camera.turn_y {
        parts.push(format!("turn y {angle}"));
    }
    if let Some(zoom) = params.camera.zoom {
        parts.push(format!("zoom {zoom}"));
    }

    parts.push(format!("lighting {}", params.lighting.preset.as_str()));
    if params.lighting.shadows {
        parts.push("lighting shadows true".to_string());
    }

    let color = if is_color(&params.background.color) {
        params.background.color.as_str()
    } else {
        "white"
    };
    parts.push(format!("set bgColor {color}"));

    if params.scale_bar.enabled {
        parts.push(format!("scalebar {}", params.scale_bar.length));
    }

    if let Some(caption) = params.caption.as_deref() {
        parts.push(format!(
            "2dlabels text {} xpos 0.03 ypos 0.03 size 18",
            quote(caption)
        ));
    }

    parts
}

/// The terminal `save` directive.
pub fn save_directive(params: &RenderParameters, output: &Path) -> String {
    let mut save = format!(
        "save {} width {} height {} supersample {SUPERSAMPLE}",
        quote(&output.to_string_lossy()),
        params.width,
        params.height,
    );
    match params.format {
        ImageFormat::Png if params.background.transparent => {
            save.push_str(" transparentBackground true");
        }
        ImageFormat::Png => {}
        ImageFormat::Jpeg => save.push_str(&format!(" quality {JPEG_QUALITY}")),
    }
    save
}

/// Double-quote `value`, dropping characters that would break out of the
/// quoted token or split the composite command.
pub fn quote(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !UNQUOTABLE_CHARS.contains(c))
        .collect();
    format!("\"{cleaned}\"")
}

/// Characters [`quote`] drops.
pub const UNQUOTABLE_CHARS: [char; 4] = ['"', ';', '\n', '\r'];

/// `value` passes through [`quote`] unchanged.
pub fn is_quotable(value: &str) -> bool {
    !value.contains(UNQUOTABLE_CHARS)
}

/// Plain identifiers only (named views, color schemes).
fn is_keyword(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Named colors or `#rgb` / `#rrggbb` hex.
fn is_color(value: &str) -> bool {
    match value.strip_prefix('#') {
        Some(hex) => (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => is_keyword(value),
    }
}

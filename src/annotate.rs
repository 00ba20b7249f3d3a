//! Frame annotation — camera id and timestamp burned into the top-left
//! corner before encoding.
//!
//! The label font is loaded once from the first TTF found among the usual
//! system locations. Nodes without any of them store frames unstamped; the
//! condition is logged once per hour rather than per frame.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use rusttype::{Font, Scale};
use tracing::{debug, warn};

use crate::util::clock::SharedClock;
use crate::util::ratelimit::RateLimiter;

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

const LABEL_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

pub struct Annotator {
    font: Option<Font<'static>>,
    limiter: Arc<RateLimiter>,
}

impl Annotator {
    pub fn new(clock: SharedClock) -> Self {
        let font = load_system_font();
        if font.is_none() {
            warn!(
                candidates = ?FONT_CANDIDATES,
                "No TTF font found, frames will be stored without overlay"
            );
        }
        Self {
            font,
            limiter: Arc::new(RateLimiter::new(clock, Duration::from_secs(3600))),
        }
    }

    /// Draw `"{camera_id}: {timestamp}"` onto the frame. Returns `false`
    /// when no font is available and the frame was left untouched.
    pub fn stamp(&self, image: &mut RgbImage, camera_id: &str, timestamp: &str) -> bool {
        let Some(font) = &self.font else {
            if let Some(suppressed) = self.limiter.check("no_overlay_font", None) {
                warn!(
                    "{}",
                    RateLimiter::format("Skipping frame overlay, no font available", suppressed)
                );
            }
            return false;
        };
        let label = format!("{camera_id}: {timestamp}");
        // Scale relative to frame height so the label stays legible at any
        // configured resolution.
        let size = (image.height() as f32 * 0.035).clamp(16.0, 48.0);
        let scale = Scale { x: size, y: size };
        draw_text_mut(image, LABEL_COLOR, 10, 10, scale, font, &label);
        true
    }
}

fn load_system_font() -> Option<Font<'static>> {
    for candidate in FONT_CANDIDATES {
        let path = Path::new(candidate);
        if !path.exists() {
            continue;
        }
        match std::fs::read(path) {
            Ok(bytes) => {
                if let Some(font) = Font::try_from_vec(bytes) {
                    debug!(path = candidate, "Loaded overlay font");
                    return Some(font);
                }
            }
            Err(e) => {
                debug!(path = candidate, error = %e, "Could not read font file");
            }
        }
    }
    None
}

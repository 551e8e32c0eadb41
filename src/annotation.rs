use crate::{config::AnnotationConfig, detection::Detection};
use ab_glyph::FontVec;
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use std::path::Path;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const SYSTEM_FONTS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplementary/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// How detections are burned into an image. Without a font only the boxes are drawn.
pub struct PlotStyle {
    pub font: Option<FontVec>,
    pub font_scale: f32,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            font: None,
            font_scale: 16.0,
        }
    }
}

impl PlotStyle {
    pub fn from_config(config: &AnnotationConfig) -> Self {
        let font = match &config.font_path {
            Some(path) => match load_font(path) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!("Failed to load font {:?}: {}", path, e);
                    None
                }
            },
            None => SYSTEM_FONTS
                .iter()
                .find_map(|path| load_font(Path::new(path)).ok()),
        };

        if font.is_none() {
            tracing::warn!("No font available, annotations will not carry labels");
        }

        Self {
            font,
            font_scale: config.font_scale,
        }
    }

    /// Line width proportional to the image size, never thinner than 2px.
    pub fn line_width_for(&self, width: u32, height: u32) -> u32 {
        (((width + height) as f32 / 2. * 0.003).round() as u32).max(2)
    }

    pub fn draw_box(
        &self,
        canvas: &mut RgbImage,
        detection: &Detection,
        label: &str,
        color: Rgb<u8>,
        line_width: u32,
    ) {
        let x1 = detection.x1.round() as i32;
        let y1 = detection.y1.round() as i32;
        let width = (detection.x2 - detection.x1).round() as i32;
        let height = (detection.y2 - detection.y1).round() as i32;

        for inset in 0..line_width as i32 {
            let (w, h) = (width - 2 * inset, height - 2 * inset);
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        if let Some(font) = &self.font {
            self.draw_label(canvas, font, x1, y1, label, color);
        }
    }

    fn draw_label(
        &self,
        canvas: &mut RgbImage,
        font: &FontVec,
        x: i32,
        y: i32,
        label: &str,
        color: Rgb<u8>,
    ) {
        let (text_width, text_height) = text_size(self.font_scale, font, label);
        if text_width == 0 || text_height == 0 {
            return;
        }
        let tag_height = text_height as i32 + 4;
        let tag_width = text_width + 4;

        // Above the box when it fits, otherwise just inside its top edge.
        let tag_y = if y >= tag_height { y - tag_height } else { y };
        let tag_x = x.clamp(0, (canvas.width() as i32 - tag_width as i32).max(0));

        draw_filled_rect_mut(
            canvas,
            Rect::at(tag_x, tag_y).of_size(tag_width, tag_height as u32),
            color,
        );
        draw_text_mut(
            canvas,
            TEXT_COLOR,
            tag_x + 2,
            tag_y + 2,
            self.font_scale,
            font,
            label,
        );
    }
}

fn load_font(path: &Path) -> Result<FontVec, String> {
    let data = std::fs::read(path).map_err(|e| e.to_string())?;
    FontVec::try_from_vec(data).map_err(|_| format!("{} is not a valid font", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id: 0,
            confidence: 0.5,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn test_line_width() {
        let style = PlotStyle::default();
        assert_eq!(style.line_width_for(64, 64), 2);
        assert_eq!(style.line_width_for(2000, 2000), 6);
    }

    #[test]
    fn test_draw_box_thickness() {
        let style = PlotStyle::default();
        let mut canvas = RgbImage::new(50, 50);
        let red = Rgb([255, 0, 0]);

        style.draw_box(&mut canvas, &detection(10., 10., 40., 40.), "x", red, 3);

        assert_eq!(*canvas.get_pixel(10, 25), red);
        assert_eq!(*canvas.get_pixel(12, 25), red);
        assert_eq!(*canvas.get_pixel(13, 25), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(39, 25), red);
    }

    #[test]
    fn test_degenerate_box_is_skipped() {
        let style = PlotStyle::default();
        let mut canvas = RgbImage::new(20, 20);

        style.draw_box(&mut canvas, &detection(5., 5., 5., 5.), "x", Rgb([1, 2, 3]), 2);

        assert!(canvas.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_missing_font_path_falls_back() {
        let config = AnnotationConfig {
            font_path: Some("/definitely/not/a/font.ttf".into()),
            ..AnnotationConfig::default()
        };
        let style = PlotStyle::from_config(&config);
        assert!(style.font.is_none());
    }
}

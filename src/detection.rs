use crate::{annotation::PlotStyle, labels::ClassLabels};
use image::RgbImage;
use std::sync::Arc;

/// One candidate box, in original image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let union = union(self, other);
        if union <= 0. {
            return 0.;
        }
        intersection(self, other) / union
    }

    pub fn clamp_to(mut self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        self.x1 = self.x1.clamp(0., w);
        self.y1 = self.y1.clamp(0., h);
        self.x2 = self.x2.clamp(0., w);
        self.y2 = self.y2.clamp(0., h);
        self
    }
}

fn intersection(box1: &Detection, box2: &Detection) -> f32 {
    let w = box1.x2.min(box2.x2) - box1.x1.max(box2.x1);
    let h = box1.y2.min(box2.y2) - box1.y1.max(box2.y1);
    w.max(0.) * h.max(0.)
}

fn union(box1: &Detection, box2: &Detection) -> f32 {
    box1.area() + box2.area() - intersection(box1, box2)
}

/// Per-class non-maximum suppression. The result is sorted by descending
/// confidence and holds at most `max_detections` boxes.
pub fn non_max_suppression(
    mut boxes: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
    let mut result: Vec<Detection> = Vec::new();

    for candidate in boxes {
        if result.len() >= max_detections {
            break;
        }
        let suppressed = result.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.iou(&candidate) >= iou_threshold
        });
        if !suppressed {
            result.push(candidate);
        }
    }

    result
}

/// Model output for a single image.
#[derive(Debug, Clone)]
pub struct Detections {
    pub boxes: Vec<Detection>,
    pub names: Arc<ClassLabels>,
    pub orig_img: RgbImage,
}

impl Detections {
    pub fn new(boxes: Vec<Detection>, names: Arc<ClassLabels>, orig_img: RgbImage) -> Self {
        Self {
            boxes,
            names,
            orig_img,
        }
    }

    /// The detection the model ranked first, if any.
    pub fn top(&self) -> Option<&Detection> {
        self.boxes.first()
    }

    pub fn label(&self, detection: &Detection) -> String {
        self.names.name(detection.class_id)
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Draws every detection onto a copy of the original image.
    pub fn plot(&self, style: &PlotStyle) -> RgbImage {
        let mut canvas = self.orig_img.clone();
        let line_width = style.line_width_for(canvas.width(), canvas.height());
        for detection in &self.boxes {
            let label = format!("{} {:.2}", self.label(detection), detection.confidence);
            style.draw_box(
                &mut canvas,
                detection,
                &label,
                self.names.color(detection.class_id),
                line_width,
            );
        }
        canvas
    }
}

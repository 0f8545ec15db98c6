//! Class id to category name mapping
//!
//! Defaults to the 80 COCO labels used by the stock YOLO detectors.

use crate::domain::types::ClassId;
use std::sync::Arc;

const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Cheaply clonable class name table
#[derive(Debug, Clone)]
pub struct ClassNames {
    names: Arc<[String]>,
}

impl Default for ClassNames {
    fn default() -> Self {
        Self::coco()
    }
}

impl ClassNames {
    pub fn coco() -> Self {
        Self::new(COCO_CLASSES.iter().map(|s| s.to_string()).collect())
    }

    pub fn new(names: Vec<String>) -> Self {
        Self { names: names.into() }
    }

    /// Resolve a class id, falling back to `class_<id>` for unknown ids
    pub fn name(&self, class_id: ClassId) -> String {
        self.names
            .get(class_id.0 as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id.0))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_names() {
        let names = ClassNames::default();
        assert_eq!(names.len(), 80);
        assert_eq!(names.name(ClassId(0)), "person");
        assert_eq!(names.name(ClassId(2)), "car");
        assert_eq!(names.name(ClassId(79)), "toothbrush");
    }

    #[test]
    fn test_unknown_class_fallback() {
        let names = ClassNames::new(vec!["van".to_string()]);
        assert_eq!(names.name(ClassId(0)), "van");
        assert_eq!(names.name(ClassId(3)), "class_3");
    }
}

//! Per-label prompt points

use crate::processing::coords::Point2;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Label identifier chosen by the caller
pub type LabelId = i32;

/// Whether a prompt marks the object or the area around it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointType {
    Foreground,
    Background,
}

impl PointType {
    /// Value fed to the decoder's point-label tensor
    pub fn as_model_label(self) -> f32 {
        match self {
            PointType::Foreground => 1.0,
            PointType::Background => 0.0,
        }
    }

    /// Parse the wire label (1 = foreground, 0 = background)
    pub fn from_wire(label: i32) -> Option<Self> {
        match label {
            1 => Some(PointType::Foreground),
            0 => Some(PointType::Background),
            _ => None,
        }
    }
}

/// Prompt point in model pixel space `[0, 1024)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPoint {
    pub position: Point2,
    pub kind: PointType,
}

impl PromptPoint {
    pub fn new(x: f32, y: f32, kind: PointType) -> Self {
        Self {
            position: Point2::new(x, y),
            kind,
        }
    }
}

/// Ordered point lists keyed by label, iterated in label insertion order
#[derive(Debug, Default, Clone)]
pub struct LabelStore {
    labels: IndexMap<LabelId, Vec<PromptPoint>>,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point to a label, creating the label on first use
    pub fn add_point(&mut self, label: LabelId, point: PromptPoint) {
        self.labels.entry(label).or_default().push(point);
    }

    /// Replace a label's whole point list. A new label goes to the end of the
    /// iteration order; an existing one keeps its position.
    pub fn replace_points(&mut self, label: LabelId, points: Vec<PromptPoint>) {
        match self.labels.get_mut(&label) {
            Some(existing) => *existing = points,
            None => {
                self.labels.insert(label, points);
            }
        }
    }

    /// Drop a label. Absent labels are ignored; returns whether one was removed.
    pub fn remove_label(&mut self, label: LabelId) -> bool {
        self.labels.shift_remove(&label).is_some()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    pub fn points(&self, label: LabelId) -> Option<&[PromptPoint]> {
        self.labels.get(&label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = LabelId> + '_ {
        self.labels.keys().copied()
    }

    pub fn contains(&self, label: LabelId) -> bool {
        self.labels.contains_key(&label)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fg(x: f32, y: f32) -> PromptPoint {
        PromptPoint::new(x, y, PointType::Foreground)
    }

    #[test]
    fn test_add_point_keeps_order() {
        let mut store = LabelStore::new();
        store.add_point(3, fg(1.0, 1.0));
        store.add_point(3, fg(2.0, 2.0));
        let points = store.points(3).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].position.x, 1.0);
        assert_eq!(points[1].position.x, 2.0);
    }

    #[test]
    fn test_replace_points_is_not_additive() {
        let mut store = LabelStore::new();
        store.replace_points(0, vec![fg(1.0, 1.0), fg(2.0, 2.0)]);
        store.replace_points(0, vec![fg(5.0, 5.0)]);
        assert_eq!(store.points(0).unwrap(), &[fg(5.0, 5.0)]);
    }

    #[test]
    fn test_insertion_order_survives_replace_and_remove() {
        let mut store = LabelStore::new();
        store.replace_points(7, vec![fg(0.0, 0.0)]);
        store.replace_points(2, vec![fg(0.0, 0.0)]);
        store.replace_points(5, vec![fg(0.0, 0.0)]);
        store.replace_points(7, vec![fg(1.0, 1.0)]);
        assert_eq!(store.labels().collect::<Vec<_>>(), vec![7, 2, 5]);

        assert!(store.remove_label(2));
        assert_eq!(store.labels().collect::<Vec<_>>(), vec![7, 5]);
    }

    #[test]
    fn test_remove_missing_label_is_noop() {
        let mut store = LabelStore::new();
        store.add_point(1, fg(0.0, 0.0));
        assert!(!store.remove_label(42));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear() {
        let mut store = LabelStore::new();
        store.add_point(1, fg(0.0, 0.0));
        store.add_point(2, fg(0.0, 0.0));
        store.clear();
        assert!(store.is_empty());
        assert!(store.points(1).is_none());
    }

    #[test]
    fn test_point_type_wire_values() {
        assert_eq!(PointType::from_wire(1), Some(PointType::Foreground));
        assert_eq!(PointType::from_wire(0), Some(PointType::Background));
        assert_eq!(PointType::from_wire(2), None);
        assert_eq!(PointType::Foreground.as_model_label(), 1.0);
        assert_eq!(PointType::Background.as_model_label(), 0.0);
    }
}

//! Normalization of the primary recognizer's output.
//!
//! Real recognizers return one of three payload shapes:
//!
//! 1. list of lists: `[[[[x,y],...x4], ["text", conf]], ...]`
//! 2. list of pairs: `[["text", conf], ...]` (no geometry)
//! 3. list of objects: `[{"text": ..., "confidence": ..., "bbox": ...}, ...]`
//!
//! any of which may arrive wrapped in a one-element outer list. Entries
//! that fit none of the shapes are skipped and counted, never turned into
//! placeholder tokens.

use serde_json::Value;

use crate::entities::BBox;

/// One recognized token in normalized form.
#[derive(Debug, Clone)]
pub struct WordHit {
    pub text: String,
    pub confidence: f32,
    /// Quad polygon when the engine reported geometry.
    pub polygon: Option<Vec<(f32, f32)>>,
}

impl WordHit {
    /// Axis-aligned box from the quad, `None` when geometry is missing or
    /// degenerate.
    pub fn bbox(&self) -> Option<BBox> {
        let polygon = self.polygon.as_ref()?;
        if polygon.len() < 4 {
            return None;
        }
        let mut x0 = f32::MAX;
        let mut y0 = f32::MAX;
        let mut x1 = f32::MIN;
        let mut y1 = f32::MIN;
        for &(x, y) in polygon {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
        let bbox = BBox { x0, y0, x1, y1 };
        if bbox.is_degenerate() {
            None
        } else {
            Some(bbox)
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizedOcr {
    pub hits: Vec<WordHit>,
    pub dropped: usize,
}

impl NormalizedOcr {
    pub fn full_text(&self) -> String {
        self.hits
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_owned()
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.hits.is_empty() {
            return 0.0;
        }
        self.hits.iter().map(|h| h.confidence).sum::<f32>() / self.hits.len() as f32
    }

    pub fn word_count(&self) -> usize {
        self.hits
            .iter()
            .map(|h| h.text.split_whitespace().count())
            .sum()
    }
}

/// Best-effort extraction of word hits from any tolerated payload shape.
pub fn normalize_payload(payload: &Value) -> NormalizedOcr {
    let entries = match unwrap_outer(payload) {
        Some(entries) => entries,
        None => return NormalizedOcr::default(),
    };

    let mut out = NormalizedOcr::default();
    for entry in entries {
        match normalize_entry(entry) {
            Some(hit) => out.hits.push(hit),
            None => out.dropped += 1,
        }
    }
    if out.dropped > 0 {
        tracing::warn!(
            dropped = out.dropped,
            total = entries.len(),
            "skipped malformed recognizer entries"
        );
    }
    out
}

/// Engines often wrap the entry list in a one-element outer list.
fn unwrap_outer(payload: &Value) -> Option<&Vec<Value>> {
    let outer = payload.as_array()?;
    if outer.len() == 1 {
        if let Some(inner) = outer[0].as_array() {
            // Only unwrap when the single element looks like an entry list
            // rather than a lone entry.
            if inner.iter().all(|e| e.is_array() || e.is_object()) && !looks_like_entry(&outer[0]) {
                return outer[0].as_array();
            }
        }
    }
    Some(outer)
}

fn looks_like_entry(value: &Value) -> bool {
    normalize_entry(value).is_some()
}

fn normalize_entry(entry: &Value) -> Option<WordHit> {
    match entry {
        Value::Array(parts) => normalize_array_entry(parts),
        Value::Object(map) => {
            let text = map.get("text")?.as_str()?.to_owned();
            if text.is_empty() {
                return None;
            }
            let confidence = map
                .get("confidence")
                .or_else(|| map.get("conf"))
                .and_then(value_as_f32)
                .unwrap_or(0.5);
            let polygon = map
                .get("polygon")
                .or_else(|| map.get("bbox"))
                .and_then(parse_geometry);
            Some(WordHit {
                text,
                confidence,
                polygon,
            })
        }
        _ => None,
    }
}

fn normalize_array_entry(parts: &[Value]) -> Option<WordHit> {
    if parts.len() < 2 {
        return None;
    }
    // Shape 1: [quad, [text, conf]]
    if let (Some(polygon), Some(info)) = (parse_geometry(&parts[0]), parts[1].as_array()) {
        let text = info.first()?.as_str()?.to_owned();
        if text.is_empty() {
            return None;
        }
        let confidence = info.get(1).and_then(value_as_f32).unwrap_or(0.5);
        return Some(WordHit {
            text,
            confidence,
            polygon: Some(polygon),
        });
    }
    // Shape 2: [text, conf]
    let text = parts[0].as_str()?.to_owned();
    if text.is_empty() {
        return None;
    }
    let confidence = parts.get(1).and_then(value_as_f32).unwrap_or(0.5);
    Some(WordHit {
        text,
        confidence,
        polygon: None,
    })
}

/// Accepts a quad `[[x,y]; >=4]` or an `[x, y, w, h]` rectangle.
fn parse_geometry(value: &Value) -> Option<Vec<(f32, f32)>> {
    let items = value.as_array()?;
    if items.len() >= 4 && items.iter().all(|v| v.is_number()) {
        let nums: Vec<f32> = items.iter().filter_map(value_as_f32_ref).collect();
        if nums.len() < 4 {
            return None;
        }
        let (x, y, w, h) = (nums[0], nums[1], nums[2], nums[3]);
        if w <= 0.0 || h <= 0.0 {
            return None;
        }
        return Some(vec![(x, y), (x + w, y), (x + w, y + h), (x, y + h)]);
    }
    let mut points = Vec::with_capacity(items.len());
    for item in items {
        let pair = item.as_array()?;
        if pair.len() < 2 {
            return None;
        }
        let x = value_as_f32(pair.first()?)?;
        let y = value_as_f32(pair.get(1)?)?;
        points.push((x, y));
    }
    if points.len() >= 4 {
        Some(points)
    } else {
        None
    }
}

fn value_as_f32(value: &Value) -> Option<f32> {
    value.as_f64().map(|v| v as f32)
}

fn value_as_f32_ref(value: &Value) -> Option<f32> {
    value.as_f64().map(|v| v as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_list_of_lists_with_quads() {
        let payload = json!([[
            [[0, 0], [30, 0], [30, 10], [0, 10]],
            ["Widget", 0.93]
        ]]);
        let out = normalize_payload(&payload);
        assert_eq!(out.hits.len(), 1);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.hits[0].text, "Widget");
        let bbox = out.hits[0].bbox().unwrap();
        assert_eq!(bbox.to_xywh(), [0, 0, 30, 10]);
    }

    #[test]
    fn normalizes_list_of_pairs() {
        let payload = json!([["Total", 0.88], ["£162.00", 0.91]]);
        let out = normalize_payload(&payload);
        assert_eq!(out.hits.len(), 2);
        assert!(out.hits.iter().all(|h| h.polygon.is_none()));
        assert!((out.mean_confidence() - 0.895).abs() < 1e-3);
    }

    #[test]
    fn normalizes_list_of_objects() {
        let payload = json!([
            {"text": "Qty", "confidence": 0.8, "bbox": [10, 5, 20, 12]},
            {"text": "5", "conf": 0.7}
        ]);
        let out = normalize_payload(&payload);
        assert_eq!(out.hits.len(), 2);
        assert_eq!(out.hits[0].bbox().unwrap().to_xywh(), [10, 5, 20, 12]);
        assert!(out.hits[1].polygon.is_none());
    }

    #[test]
    fn counts_malformed_entries_without_placeholders() {
        let payload = json!([
            ["Good", 0.9],
            42,
            {"no_text_key": true},
            [],
            ["", 0.5]
        ]);
        let out = normalize_payload(&payload);
        assert_eq!(out.hits.len(), 1);
        assert_eq!(out.dropped, 4);
        assert_eq!(out.full_text(), "Good");
    }

    #[test]
    fn unwraps_single_element_outer_list() {
        let payload = json!([[
            [[[0, 0], [10, 0], [10, 5], [0, 5]], ["a", 0.9]],
            [[[0, 6], [10, 6], [10, 11], [0, 11]], ["b", 0.8]]
        ]]);
        let out = normalize_payload(&payload);
        assert_eq!(out.hits.len(), 2);
    }

    #[test]
    fn empty_payload_yields_empty_result() {
        assert_eq!(normalize_payload(&json!([])).hits.len(), 0);
        assert_eq!(normalize_payload(&json!(null)).hits.len(), 0);
        assert_eq!(normalize_payload(&json!({"not": "a list"})).hits.len(), 0);
    }

    #[test]
    fn degenerate_quads_have_no_bbox() {
        let hit = WordHit {
            text: "x".into(),
            confidence: 0.5,
            polygon: Some(vec![(5.0, 5.0), (5.0, 5.0), (5.0, 5.0), (5.0, 5.0)]),
        };
        assert!(hit.bbox().is_none());
    }
}

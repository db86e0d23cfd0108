//! Normalization of backend-specific detection geometry.
//!
//! Each backend reports bounding boxes in its own convention: SpeciesNet
//! emits a top-left-corner `bbox` that is already normalized, while the
//! YOLO-based backends (DeepFaune, Manas) emit center-normalized `xywhn`
//! records. Everything downstream works on one canonical representation:
//! top-left corner, all values normalized to 0–1.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::server::backend::Backend;

/// Canonical bounding box: top-left corner convention, 0–1 normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBbox {
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
}

/// Read a `[a, b, c, d]` JSON array of numbers. Wrong arity or non-numeric
/// entries yield `None`.
fn as_quad(value: &Value) -> Option<[f64; 4]> {
    let arr = value.as_array()?;
    if arr.len() != 4 {
        return None;
    }
    let mut out = [0.0; 4];
    for (slot, v) in out.iter_mut().zip(arr) {
        *slot = v.as_f64()?;
    }
    Some(out)
}

/// Convert one raw detection record into the canonical representation.
///
/// Pure and stateless. Returns `None` for missing or malformed geometry;
/// callers must treat that as "no usable detection", never as a zero-sized
/// box.
pub fn to_canonical_bbox(raw_detection: &Value, backend: Backend) -> Option<CanonicalBbox> {
    if backend.emits_center_format() {
        let [x_center, y_center, width, height] = as_quad(raw_detection.get("xywhn")?)?;
        Some(CanonicalBbox {
            bbox_x: x_center - width / 2.0,
            bbox_y: y_center - height / 2.0,
            bbox_width: width,
            bbox_height: height,
        })
    } else {
        let [x, y, width, height] = as_quad(raw_detection.get("bbox")?)?;
        Some(CanonicalBbox {
            bbox_x: x,
            bbox_y: y,
            bbox_width: width,
            bbox_height: height,
        })
    }
}

/// Guess which backend produced a raw server output.
///
/// Heuristic, in order of confidence:
/// 1. an explicit `model.type` tag (the servers report one on `/info`);
/// 2. the version-string shape: SpeciesNet versions carry a trailing
///    alpha (`4.0.1a`), the YOLO backends are plain dotted numbers;
/// 3. the field shape of the first detection entry (`bbox` vs `xywhn`),
///    with known version prefixes telling DeepFaune and Manas apart.
///
/// Anything ambiguous returns `None`, which callers must never treat as a
/// specific backend.
pub fn detect_backend(raw_output: &Value) -> Option<Backend> {
    if let Some(tag) = raw_output
        .pointer("/model/type")
        .and_then(Value::as_str)
    {
        return tag.parse().ok();
    }

    let version = raw_output
        .pointer("/model/version")
        .or_else(|| raw_output.get("model_version"))
        .and_then(Value::as_str);

    if let Some(v) = version {
        if !v.is_empty() && v.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            if v.ends_with(|c: char| c.is_ascii_alphabetic()) {
                return Some(Backend::SpeciesNet);
            }
        }
    }

    let first_detection = raw_output
        .get("detections")
        .and_then(Value::as_array)
        .and_then(|a| a.first());

    if let Some(det) = first_detection {
        if det.get("bbox").is_some() {
            return Some(Backend::SpeciesNet);
        }
        if det.get("xywhn").is_some() {
            // Center format narrows it to the YOLO pair; only a recognized
            // version disambiguates them.
            return match version {
                Some(v) if v.starts_with("1.3") => Some(Backend::DeepFaune),
                Some(v) if v.starts_with("1.0") => Some(Backend::Manas),
                _ => None,
            };
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_center_format_converts_to_top_left() {
        let raw = json!({ "xywhn": [0.5, 0.5, 0.2, 0.4] });
        for backend in [Backend::DeepFaune, Backend::Manas] {
            let bbox = to_canonical_bbox(&raw, backend).unwrap();
            assert!((bbox.bbox_x - 0.4).abs() < 1e-9);
            assert!((bbox.bbox_y - 0.3).abs() < 1e-9);
            assert_eq!(bbox.bbox_width, 0.2);
            assert_eq!(bbox.bbox_height, 0.4);
        }
    }

    #[test]
    fn test_corner_format_passes_through() {
        let raw = json!({ "bbox": [0.1, 0.2, 0.3, 0.4] });
        let bbox = to_canonical_bbox(&raw, Backend::SpeciesNet).unwrap();
        assert_eq!(
            bbox,
            CanonicalBbox {
                bbox_x: 0.1,
                bbox_y: 0.2,
                bbox_width: 0.3,
                bbox_height: 0.4
            }
        );
    }

    #[test]
    fn test_malformed_geometry_is_rejected() {
        // Missing field entirely.
        assert!(to_canonical_bbox(&json!({}), Backend::Manas).is_none());
        // Wrong arity.
        assert!(to_canonical_bbox(&json!({ "xywhn": [0.5, 0.5, 0.2] }), Backend::Manas).is_none());
        // Non-numeric entry.
        assert!(to_canonical_bbox(
            &json!({ "bbox": [0.1, "oops", 0.3, 0.4] }),
            Backend::SpeciesNet
        )
        .is_none());
        // Field from the wrong convention.
        assert!(to_canonical_bbox(&json!({ "bbox": [0.1, 0.2, 0.3, 0.4] }), Backend::Manas).is_none());
    }

    #[test]
    fn test_detect_backend_by_explicit_tag() {
        let raw = json!({ "model": { "type": "manas", "version": "1.0" } });
        assert_eq!(detect_backend(&raw), Some(Backend::Manas));
        let raw = json!({ "model": { "type": "speciesnet" } });
        assert_eq!(detect_backend(&raw), Some(Backend::SpeciesNet));
    }

    #[test]
    fn test_detect_backend_by_version_shape() {
        let raw = json!({ "model": { "version": "4.0.1a" } });
        assert_eq!(detect_backend(&raw), Some(Backend::SpeciesNet));
    }

    #[test]
    fn test_detect_backend_by_detection_shape() {
        let raw = json!({
            "model_version": "1.3",
            "detections": [{ "xywhn": [0.5, 0.5, 0.2, 0.4], "conf": 0.9 }]
        });
        assert_eq!(detect_backend(&raw), Some(Backend::DeepFaune));

        let raw = json!({
            "detections": [{ "bbox": [0.1, 0.2, 0.3, 0.4], "conf": 0.9 }]
        });
        assert_eq!(detect_backend(&raw), Some(Backend::SpeciesNet));
    }

    #[test]
    fn test_ambiguous_output_is_unknown() {
        // Center format with no version: DeepFaune and Manas are
        // indistinguishable, so no guess is made.
        let raw = json!({
            "detections": [{ "xywhn": [0.5, 0.5, 0.2, 0.4] }]
        });
        assert_eq!(detect_backend(&raw), None);
        assert_eq!(detect_backend(&json!({})), None);
        assert_eq!(detect_backend(&json!({ "detections": [] })), None);
    }
}

//! Heuristics over raw place/event payloads.
//!
//! Used when no model is available (classification fallback) and by the
//! operator scrub tool to find items that describe a whole locality rather
//! than a venue.

use serde_json::Value;

use crate::models::Mapping;

/// Place types that describe an area.
pub const LOCALITY_TYPES: &[&str] = &[
    "locality",
    "political",
    "administrative_area_level_1",
    "administrative_area_level_2",
    "administrative_area_level_3",
    "postal_town",
    "colloquial_area",
    "sublocality",
    "sublocality_level_1",
    "neighborhood",
    "country",
];

/// Place types that describe a business or landmark.
pub const ESTABLISHMENT_TYPES: &[&str] = &["establishment", "point_of_interest", "premise"];

/// Category assigned when nothing more specific matches.
pub const FALLBACK_CATEGORY: &str = "local_business";

/// Payload type tags mapped to categories, most specific first.
const CATEGORY_RULES: &[(&str, &str)] = &[
    ("restaurant", "restaurant"),
    ("cafe", "cafe"),
    ("bakery", "bakery"),
    ("bar", "bar"),
    ("night_club", "nightlife"),
    ("museum", "museum"),
    ("art_gallery", "gallery"),
    ("park", "park"),
    ("lodging", "lodging"),
    ("hotel", "lodging"),
    ("store", "shopping"),
    ("shopping_mall", "shopping"),
    ("gym", "fitness"),
    ("spa", "wellness"),
    ("church", "place_of_worship"),
    ("place_of_worship", "place_of_worship"),
    ("school", "education"),
    ("university", "education"),
    ("hospital", "health"),
    ("doctor", "health"),
    ("tourist_attraction", "attraction"),
    ("concert", "music"),
    ("music", "music"),
    ("festival", "festival"),
    ("theater", "arts"),
    ("sports", "sports"),
    ("market", "market"),
];

/// Type tags of a payload, from its `types` array (or a comma separated
/// string) lowercased.
pub fn payload_types(payload: &Mapping) -> Vec<String> {
    match payload.get("types") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// True when the payload's types intersect the locality set and do not
/// intersect the establishment set.
pub fn is_city_like(payload: &Mapping) -> bool {
    let types = payload_types(payload);
    let any_of = |set: &[&str]| types.iter().any(|t| set.contains(&t.as_str()));
    any_of(LOCALITY_TYPES) && !any_of(ESTABLISHMENT_TYPES)
}

/// Lowercase snake case.
pub fn normalize_category(raw: &str) -> String {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Best-effort category from payload fields, with a confidence in 0.0–1.0.
///
/// An explicit `category` field wins. Otherwise the first type tag with a
/// known mapping is used; failing that, the fallback category at low
/// confidence.
pub fn infer_category(payload: &Mapping) -> (String, f64) {
    if let Some(category) = payload
        .get("category")
        .and_then(|v| v.as_str())
        .map(normalize_category)
        .filter(|c| !c.is_empty())
    {
        return (category, 0.6);
    }

    let types = payload_types(payload);
    for (tag, category) in CATEGORY_RULES {
        if types.iter().any(|t| t == tag) {
            return (category.to_string(), 0.5);
        }
    }

    if is_city_like(payload) {
        return ("city".to_string(), 0.5);
    }
    (FALLBACK_CATEGORY.to_string(), 0.2)
}

/// First non-empty string among `fields`.
pub fn first_text<'a>(payload: &'a Mapping, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|f| payload.get(*f).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Display name of a payload.
pub fn display_name(payload: &Mapping) -> Option<&str> {
    first_text(payload, &["name", "title", "event_name", "display_name"])
}

/// Identifier the upstream source assigned to the record, if any.
/// Numeric ids are rendered as text.
pub fn source_key(payload: &Mapping) -> Option<String> {
    ["place_id", "event_id", "source_id", "external_id"]
        .iter()
        .filter_map(|f| payload.get(*f))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(v: Value) -> Mapping {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn source_key_prefers_place_id() {
        let payload = json!({"place_id": " ChIJ123 ", "source_id": "x"});
        assert_eq!(source_key(&mapping(payload)).as_deref(), Some("ChIJ123"));

        let numeric = json!({"event_id": 4417});
        assert_eq!(source_key(&mapping(numeric)).as_deref(), Some("4417"));

        let none = json!({"place_id": "", "name": "x"});
        assert_eq!(source_key(&mapping(none)), None);
    }

    #[test]
    fn city_like_needs_locality_without_establishment() {
        assert!(is_city_like(&mapping(json!({"types": ["locality", "political"]}))));
        assert!(!is_city_like(&mapping(
            json!({"types": ["locality", "point_of_interest"]})
        )));
        assert!(!is_city_like(&mapping(json!({"types": ["restaurant"]}))));
        assert!(!is_city_like(&mapping(json!({"name": "No types"}))));
        assert!(is_city_like(&mapping(json!({"types": "Locality, Political"}))));
    }

    #[test]
    fn explicit_category_beats_types() {
        let p = mapping(json!({"category": "Coffee Shop", "types": ["bar"]}));
        assert_eq!(infer_category(&p), ("coffee_shop".to_string(), 0.6));
    }

    #[test]
    fn types_map_to_categories() {
        let p = mapping(json!({"types": ["point_of_interest", "cafe", "food"]}));
        assert_eq!(infer_category(&p).0, "cafe");
        let p = mapping(json!({"types": ["locality"]}));
        assert_eq!(infer_category(&p).0, "city");
        let p = mapping(json!({"name": "Mystery"}));
        assert_eq!(infer_category(&p), (FALLBACK_CATEGORY.to_string(), 0.2));
    }

    #[test]
    fn display_name_skips_blank_fields() {
        let p = mapping(json!({"name": "  ", "title": "Jazz Night"}));
        assert_eq!(display_name(&p), Some("Jazz Night"));
    }
}

//! Collection: the per-key object store.
//!
//! A collection maps object ids to `(Object, fields[])` entries. Ids are
//! kept in a `BTreeMap` so ordered iteration and scan-greater-or-equal come
//! for free; spatial queries walk the entries with a bounding-box prefilter
//! before running the precise predicate.
//!
//! Field values are per-collection columns: every field name registered in
//! the collection gets an index, and each entry carries a sparse `f64`
//! vector parallel to the registry. Absent fields read as 0. The registry
//! only grows; dropping the collection is the only way to forget a field
//! name.
//!
//! The controller serializes all access behind its global reader/writer
//! lock, so the collection itself carries no locking.

use crate::geojson::{BBox, Object, Position};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// One stored entry.
#[derive(Debug, Clone)]
pub struct Item {
    pub obj: Object,
    pub fields: Vec<f64>,
}

/// The outcome of a set: prior state plus the entry's resolved field vector.
#[derive(Debug, Clone, Default)]
pub struct SetResult {
    pub old_obj: Option<Object>,
    pub old_fields: Vec<f64>,
    pub fields: Vec<f64>,
}

/// An ordered, field-aware object store for one collection key.
#[derive(Debug, Default)]
pub struct Collection {
    items: BTreeMap<String, Item>,
    field_map: HashMap<String, usize>,
    field_arr: Vec<String>,
    weight: usize,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in the collection.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Approximate memory footprint in bytes.
    pub fn weight(&self) -> usize {
        self.weight
    }

    /// The registered field names in index order.
    pub fn field_arr(&self) -> &[String] {
        &self.field_arr
    }

    /// Field name → index map.
    pub fn field_map(&self) -> &HashMap<String, usize> {
        &self.field_map
    }

    /// Registers a field name, returning its column index.
    pub fn field_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.field_map.get(name) {
            return idx;
        }
        let idx = self.field_arr.len();
        self.field_arr.push(name.to_string());
        self.field_map.insert(name.to_string(), idx);
        idx
    }

    /// Inserts or replaces an object. Field values already stored for the id
    /// are preserved; `fields` entries overlay them.
    pub fn set(&mut self, id: &str, obj: Object, fields: &[(String, f64)]) -> SetResult {
        let mut result = SetResult::default();

        let mut values = match self.items.get(id) {
            Some(old) => {
                self.weight -= item_weight(id, old);
                result.old_obj = Some(old.obj.clone());
                result.old_fields = old.fields.clone();
                old.fields.clone()
            }
            None => Vec::new(),
        };

        for (name, value) in fields {
            let idx = self.field_index(name);
            if values.len() <= idx {
                values.resize(idx + 1, 0.0);
            }
            values[idx] = *value;
        }

        result.fields = values.clone();
        let item = Item { obj, fields: values };
        self.weight += item_weight(id, &item);
        self.items.insert(id.to_string(), item);
        result
    }

    /// Updates a single field on an existing id. Returns `None` when the id
    /// is absent, otherwise `(updated, fields)` where `updated` is false if
    /// the stored value already equaled `value`.
    pub fn set_field(&mut self, id: &str, field: &str, value: f64) -> Option<(bool, Vec<f64>)> {
        if !self.items.contains_key(id) {
            return None;
        }
        let idx = self.field_index(field);
        let item = self.items.get_mut(id).expect("presence checked above");
        if item.fields.len() <= idx {
            self.weight += 8 * (idx + 1 - item.fields.len());
            item.fields.resize(idx + 1, 0.0);
        }
        let updated = item.fields[idx] != value;
        item.fields[idx] = value;
        Some((updated, item.fields.clone()))
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Item> {
        let item = self.items.remove(id)?;
        self.weight -= item_weight(id, &item);
        Some(item)
    }

    /// The bounding box covering every geometry in the collection.
    pub fn bounds(&self) -> Option<BBox> {
        let mut bbox: Option<BBox> = None;
        for item in self.items.values() {
            if !item.obj.is_geometry() {
                continue;
            }
            let b = item.obj.calculated_bbox();
            match &mut bbox {
                Some(cur) => cur.union(&b),
                none => *none = Some(b),
            }
        }
        bbox
    }

    /// Iterates every entry in id order (or reverse). The iterator callback
    /// returns false to stop.
    pub fn scan(&self, desc: bool, mut f: impl FnMut(&str, &Object, &[f64]) -> bool) {
        if desc {
            for (id, item) in self.items.iter().rev() {
                if !f(id, &item.obj, &item.fields) {
                    return;
                }
            }
        } else {
            for (id, item) in self.items.iter() {
                if !f(id, &item.obj, &item.fields) {
                    return;
                }
            }
        }
    }

    /// Iterates entries with `start ≤ id < end` in id order. Empty bounds
    /// are unbounded on that side.
    pub fn scan_range(
        &self,
        start: &str,
        end: &str,
        desc: bool,
        mut f: impl FnMut(&str, &Object, &[f64]) -> bool,
    ) {
        let lower = if start.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(start.to_string())
        };
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_string())
        };
        let range = self.items.range((lower, upper));
        if desc {
            for (id, item) in range.rev() {
                if !f(id, &item.obj, &item.fields) {
                    return;
                }
            }
        } else {
            for (id, item) in range {
                if !f(id, &item.obj, &item.fields) {
                    return;
                }
            }
        }
    }

    /// Iterates entries with `id ≥ pivot` in ascending id order.
    pub fn scan_greater_or_equal(
        &self,
        pivot: &str,
        mut f: impl FnMut(&str, &Object, &[f64]) -> bool,
    ) {
        for (id, item) in self.items.range(pivot.to_string()..) {
            if !f(id, &item.obj, &item.fields) {
                return;
            }
        }
    }

    /// Iterates geometry entries matching a spatial predicate, with a cheap
    /// bounding-box prefilter.
    pub fn search(
        &self,
        prefilter: &BBox,
        matches: impl Fn(&Object) -> bool,
        mut f: impl FnMut(&str, &Object, &[f64]) -> bool,
    ) {
        for (id, item) in self.items.iter() {
            if !item.obj.is_geometry() {
                continue;
            }
            if !prefilter.intersects_bbox(&item.obj.calculated_bbox()) {
                continue;
            }
            if matches(&item.obj) && !f(id, &item.obj, &item.fields) {
                return;
            }
        }
    }

    /// Iterates geometry entries intersecting the circle, passing the
    /// distance from the center to each object's representative point.
    pub fn nearby(
        &self,
        center: &Position,
        meters: f64,
        mut f: impl FnMut(&str, &Object, &[f64], f64) -> bool,
    ) {
        for (id, item) in self.items.iter() {
            if !item.obj.is_geometry() {
                continue;
            }
            if item.obj.intersects_circle(center, meters) {
                let dist = item.obj.calculated_point().distance_to(center);
                if !f(id, &item.obj, &item.fields, dist) {
                    return;
                }
            }
        }
    }

    /// Iterates every geometry entry in ascending distance from the center.
    /// This is the k-nearest-neighbours path for `NEARBY` without a radius.
    pub fn nearest(
        &self,
        center: &Position,
        mut f: impl FnMut(&str, &Object, &[f64], f64) -> bool,
    ) {
        let mut candidates: Vec<(&String, &Item, f64)> = self
            .items
            .iter()
            .filter(|(_, item)| item.obj.is_geometry())
            .map(|(id, item)| {
                let dist = item.obj.calculated_point().distance_to(center);
                (id, item, dist)
            })
            .collect();
        candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        for (id, item, dist) in candidates {
            if !f(id, &item.obj, &item.fields, dist) {
                return;
            }
        }
    }
}

fn item_weight(id: &str, item: &Item) -> usize {
    id.len() + item.obj.weight() + item.fields.len() * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geojson::Position;

    fn point(lat: f64, lon: f64) -> Object {
        Object::SimplePoint(Position::from_latlon(lat, lon))
    }

    #[test]
    fn test_set_and_get() {
        let mut col = Collection::new();
        let res = col.set("truck1", point(33.5, -112.1), &[]);
        assert!(res.old_obj.is_none());
        assert_eq!(col.count(), 1);

        let item = col.get("truck1").unwrap();
        assert_eq!(item.obj.calculated_point().lat(), 33.5);
    }

    #[test]
    fn test_replace_returns_old() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 1.0), &[]);
        let res = col.set("a", point(2.0, 2.0), &[]);
        assert!(res.old_obj.is_some());
        assert_eq!(res.old_obj.unwrap().calculated_point().lat(), 1.0);
        assert_eq!(col.count(), 1);
    }

    #[test]
    fn test_fields_preserved_across_set() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 2.0), &[("speed".to_string(), 50.0)]);
        let res = col.set("a", point(1.1, 2.1), &[]);
        // speed survives the object replacement
        assert_eq!(res.fields, vec![50.0]);
    }

    #[test]
    fn test_set_field() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 2.0), &[("speed".to_string(), 50.0)]);

        let (updated, fields) = col.set_field("a", "speed", 90.0).unwrap();
        assert!(updated);
        assert_eq!(fields, vec![90.0]);

        let (updated, _) = col.set_field("a", "speed", 90.0).unwrap();
        assert!(!updated);

        assert!(col.set_field("missing", "speed", 1.0).is_none());
    }

    #[test]
    fn test_field_registry_grows() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 2.0), &[("speed".to_string(), 1.0)]);
        col.set("b", point(1.0, 2.0), &[("age".to_string(), 2.0)]);
        assert_eq!(col.field_arr(), &["speed".to_string(), "age".to_string()]);

        // "a" never had "age" set; it reads as absent (short vector)
        assert_eq!(col.get("a").unwrap().fields, vec![1.0]);
        assert_eq!(col.get("b").unwrap().fields, vec![0.0, 2.0]);
    }

    #[test]
    fn test_remove() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 2.0), &[]);
        assert!(col.remove("a").is_some());
        assert!(col.remove("a").is_none());
        assert_eq!(col.count(), 0);
        assert_eq!(col.weight(), 0);
    }

    #[test]
    fn test_scan_order() {
        let mut col = Collection::new();
        for id in ["b", "a", "c"] {
            col.set(id, point(1.0, 2.0), &[]);
        }
        let mut ids = Vec::new();
        col.scan(false, |id, _, _| {
            ids.push(id.to_string());
            true
        });
        assert_eq!(ids, vec!["a", "b", "c"]);

        ids.clear();
        col.scan(true, |id, _, _| {
            ids.push(id.to_string());
            true
        });
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_scan_greater_or_equal() {
        let mut col = Collection::new();
        for id in ["a", "b", "c", "d"] {
            col.set(id, point(1.0, 2.0), &[]);
        }
        let mut ids = Vec::new();
        col.scan_greater_or_equal("b", |id, _, _| {
            ids.push(id.to_string());
            true
        });
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_scan_range() {
        let mut col = Collection::new();
        for id in ["a", "b", "c", "d"] {
            col.set(id, point(1.0, 2.0), &[]);
        }
        let mut ids = Vec::new();
        col.scan_range("b", "d", false, |id, _, _| {
            ids.push(id.to_string());
            true
        });
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_nearby() {
        let mut col = Collection::new();
        col.set("near", point(0.01, 0.01), &[]);
        col.set("far", point(10.0, 10.0), &[]);
        col.set("str", Object::Str("not geometry".to_string()), &[]);

        let center = Position::from_latlon(0.0, 0.0);
        let mut hits = Vec::new();
        col.nearby(&center, 10_000.0, |id, _, _, dist| {
            hits.push((id.to_string(), dist));
            true
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "near");
        assert!(hits[0].1 > 0.0 && hits[0].1 < 10_000.0);
    }

    #[test]
    fn test_nearest_orders_by_distance() {
        let mut col = Collection::new();
        col.set("far", point(1.0, 1.0), &[]);
        col.set("near", point(0.1, 0.1), &[]);
        col.set("mid", point(0.5, 0.5), &[]);

        let center = Position::from_latlon(0.0, 0.0);
        let mut ids = Vec::new();
        col.nearest(&center, |id, _, _, _| {
            ids.push(id.to_string());
            true
        });
        assert_eq!(ids, vec!["near", "mid", "far"]);
    }

    #[test]
    fn test_bounds() {
        let mut col = Collection::new();
        col.set("a", point(1.0, 2.0), &[]);
        col.set("b", point(5.0, 8.0), &[]);
        let b = col.bounds().unwrap();
        assert_eq!(b.min.lat(), 1.0);
        assert_eq!(b.max.lon(), 8.0);
    }
}

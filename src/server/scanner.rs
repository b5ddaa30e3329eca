//! The scan writer (C10): paged, filtered query output.
//!
//! Every search command (`SCAN`, `SEARCH`, `NEARBY`, `WITHIN`, `INTERSECTS`)
//! streams candidate `(id, object, fields, distance?)` entries from a
//! collection iterator into a `ScanWriter`, which applies the glob and field
//! predicates, tracks cursor/limit paging, and accumulates either a JSON
//! body or a RESP array depending on the connection's output mode.
//!
//! Records that fail a predicate are skipped without consuming cursor
//! budget; the emitted cursor is `cursor + emitted` when the page limit was
//! hit and `0` otherwise.

use crate::collection::Collection;
use crate::geojson::Object;
use crate::glob::GlobPattern;
use crate::protocol::{format_float, RespValue};
use crate::script::ScriptEngine;
use crate::server::message::OutputType;
use crate::server::{json_string, CmdError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Default page size for non-COUNT scans.
pub const LIMIT_ITEMS: u64 = 100;

/// What a search emits per matched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Ids,
    Objects,
    Count,
    Points,
    Hashes,
    Bounds,
}

impl Output {
    /// Parses an output selector token. `HASHES` carries a precision
    /// argument, handled by the token parser.
    pub fn parse(token: &str) -> Option<Output> {
        match token.to_lowercase().as_str() {
            "ids" => Some(Output::Ids),
            "objects" => Some(Output::Objects),
            "count" => Some(Output::Count),
            "points" => Some(Output::Points),
            "hashes" => Some(Output::Hashes),
            "bounds" => Some(Output::Bounds),
            _ => None,
        }
    }
}

/// One numeric `WHERE field op value` clause.
#[derive(Debug, Clone)]
pub struct WhereClause {
    pub field: String,
    pub op: WhereOp,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl WhereOp {
    pub fn parse(token: &str) -> Option<WhereOp> {
        match token {
            "<" | "lt" => Some(WhereOp::Lt),
            "<=" | "lte" => Some(WhereOp::Lte),
            ">" | "gt" => Some(WhereOp::Gt),
            ">=" | "gte" => Some(WhereOp::Gte),
            "==" | "eq" => Some(WhereOp::Eq),
            "!=" | "ne" => Some(WhereOp::Ne),
            _ => None,
        }
    }
}

impl WhereClause {
    pub fn matches(&self, value: f64) -> bool {
        match self.op {
            WhereOp::Lt => value < self.value,
            WhereOp::Lte => value <= self.value,
            WhereOp::Gt => value > self.value,
            WhereOp::Gte => value >= self.value,
            WhereOp::Eq => value == self.value,
            WhereOp::Ne => value != self.value,
        }
    }
}

/// A `WHEREIN field v1 v2 …` clause.
#[derive(Debug, Clone)]
pub struct WhereIn {
    pub field: String,
    pub values: Vec<f64>,
}

impl WhereIn {
    pub fn matches(&self, value: f64) -> bool {
        self.values.contains(&value)
    }
}

/// A `WHEREEVAL script numargs arg…` clause, evaluated through the script
/// engine seam.
#[derive(Debug, Clone)]
pub struct WhereEval {
    pub script: String,
    pub args: Vec<String>,
}

/// One candidate entry handed to the writer.
pub struct ScanParams<'a> {
    pub id: &'a str,
    pub obj: &'a Object,
    pub fields: &'a [f64],
    pub distance: Option<f64>,
}

/// The stateful output serializer.
pub struct ScanWriter {
    output: Output,
    output_type: OutputType,
    precision: u64,
    fmap: HashMap<String, usize>,
    farr: Vec<String>,
    wheres: Vec<WhereClause>,
    whereins: Vec<WhereIn>,
    whereevals: Vec<WhereEval>,
    engine: Arc<dyn ScriptEngine>,
    glob: GlobPattern,
    glob_everything: bool,
    glob_single: bool,
    match_values: bool,
    nofields: bool,
    cursor: u64,
    limit: u64,
    hit_limit: bool,
    once: bool,
    count: u64,
    number_items: u64,
    json: String,
    values: Vec<RespValue>,
}

#[allow(clippy::too_many_arguments)]
impl ScanWriter {
    pub fn new(
        output_type: OutputType,
        output: Output,
        precision: u64,
        glob_pattern: &str,
        match_values: bool,
        cursor: u64,
        limit: u64,
        wheres: Vec<WhereClause>,
        whereins: Vec<WhereIn>,
        whereevals: Vec<WhereEval>,
        nofields: bool,
        engine: Arc<dyn ScriptEngine>,
        col: Option<&Collection>,
    ) -> Result<ScanWriter, CmdError> {
        if !whereevals.is_empty() && !engine.available() {
            return Err(CmdError::Other("scripting is not available".to_string()));
        }
        let limit = if limit == 0 {
            if output == Output::Count {
                u64::MAX
            } else {
                LIMIT_ITEMS
            }
        } else {
            limit
        };
        let glob = GlobPattern::new(glob_pattern);
        let glob_everything = glob.is_everything();
        let glob_single = !glob_everything && !glob.is_glob();
        let (fmap, farr) = match col {
            Some(col) => (col.field_map().clone(), col.field_arr().to_vec()),
            None => (HashMap::new(), Vec::new()),
        };
        Ok(ScanWriter {
            output,
            output_type,
            precision,
            fmap,
            farr,
            wheres,
            whereins,
            whereevals,
            engine,
            glob,
            glob_everything,
            glob_single,
            match_values,
            nofields,
            cursor,
            limit,
            hit_limit: false,
            once: false,
            count: 0,
            number_items: 0,
            json: String::new(),
            values: Vec::new(),
        })
    }

    /// A single-id glob lets the caller short-circuit to a point lookup.
    pub fn single_id(&self) -> Option<&str> {
        if self.glob_single {
            Some(self.glob.as_str())
        } else {
            None
        }
    }

    fn has_fields_output(&self) -> bool {
        matches!(
            self.output,
            Output::Objects | Output::Points | Output::Hashes | Output::Bounds
        ) && !self.nofields
    }

    /// Writes the JSON preamble (field-name registry and the opening of the
    /// typed array). RESP output accumulates values instead and has no head.
    pub fn write_head(&mut self) {
        if self.output_type != OutputType::Json {
            return;
        }
        if !self.farr.is_empty() && self.has_fields_output() {
            self.json.push_str(",\"fields\":[");
            for (i, field) in self.farr.iter().enumerate() {
                if i > 0 {
                    self.json.push(',');
                }
                self.json.push_str(&json_string(field));
            }
            self.json.push(']');
        }
        match self.output {
            Output::Ids => self.json.push_str(",\"ids\":["),
            Output::Objects => self.json.push_str(",\"objects\":["),
            Output::Points => self.json.push_str(",\"points\":["),
            Output::Bounds => self.json.push_str(",\"bounds\":["),
            Output::Hashes => self.json.push_str(",\"hashes\":["),
            Output::Count => {}
        }
    }

    /// Closes the typed array and appends count/cursor. Call once after the
    /// iteration finishes.
    pub fn write_foot(&mut self) {
        let cursor = if self.hit_limit {
            self.cursor + self.number_items
        } else {
            0
        };
        if self.output_type == OutputType::Json {
            if self.output != Output::Count {
                self.json.push(']');
            }
            self.json.push_str(&format!(",\"count\":{}", self.count));
            self.json.push_str(&format!(",\"cursor\":{}", cursor));
        }
    }

    /// The accumulated JSON body fragment (between `{"ok":true` and
    /// `,"elapsed":…`).
    pub fn json_body(&self) -> &str {
        &self.json
    }

    /// The RESP response value: `[cursor, items]`, or a bare integer for
    /// COUNT.
    pub fn resp_output(&mut self) -> RespValue {
        let cursor = if self.hit_limit {
            self.cursor + self.number_items
        } else {
            0
        };
        if self.output == Output::Count {
            RespValue::integer(self.count as i64)
        } else {
            RespValue::array(vec![
                RespValue::integer(cursor as i64),
                RespValue::array(std::mem::take(&mut self.values)),
            ])
        }
    }

    /// Total matched entries (cursor skips included).
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Entries emitted into the current page.
    pub fn emitted(&self) -> u64 {
        self.number_items
    }

    fn glob_matches(&self, id: &str, obj: &Object) -> (bool, bool) {
        if self.glob_everything {
            return (true, true);
        }
        if self.glob_single {
            if self.glob.as_str() != id {
                return (false, true);
            }
            return (true, false);
        }
        let matched = if self.match_values {
            self.glob.matches(&obj.text())
        } else {
            self.glob.matches(id)
        };
        (matched, true)
    }

    /// Applies every WHERE/WHEREIN/WHEREEVAL clause. The reserved
    /// pseudo-field `z` reads the object's calculated elevation.
    pub fn field_match(&self, fields: &[f64], obj: &Object) -> bool {
        let value_of = |field: &str| -> f64 {
            if field == "z" {
                return obj.calculated_point().z;
            }
            match self.fmap.get(field) {
                Some(&idx) if idx < fields.len() => fields[idx],
                _ => 0.0,
            }
        };
        for clause in &self.wheres {
            if !clause.matches(value_of(&clause.field)) {
                return false;
            }
        }
        for clause in &self.whereins {
            if !clause.matches(value_of(&clause.field)) {
                return false;
            }
        }
        if !self.whereevals.is_empty() {
            let mut named: HashMap<String, f64> = HashMap::new();
            for (field, &idx) in &self.fmap {
                named.insert(
                    field.clone(),
                    if idx < fields.len() { fields[idx] } else { 0.0 },
                );
            }
            for clause in &self.whereevals {
                match self.engine.eval_where(&clause.script, &clause.args, &named) {
                    Ok(true) => {}
                    Ok(false) => return false,
                    Err(e) => {
                        debug!(error = %e, "whereeval failed; treating as non-match");
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Feeds one candidate through the predicates and into the page.
    /// Returns false when the iteration should stop (limit hit, or a
    /// single-id glob already resolved).
    pub fn write_object(&mut self, p: ScanParams) -> bool {
        let (matched, keep_going) = self.glob_matches(p.id, p.obj);
        if !matched {
            return keep_going;
        }
        if !self.field_match(p.fields, p.obj) {
            return keep_going;
        }
        self.count += 1;
        if self.count <= self.cursor {
            return keep_going;
        }
        if self.output == Output::Count {
            return self.count < self.limit && keep_going;
        }

        match self.output_type {
            OutputType::Json => self.write_object_json(&p),
            OutputType::Resp => self.write_object_resp(&p),
        }

        self.number_items += 1;
        if self.number_items == self.limit {
            self.hit_limit = true;
            return false;
        }
        keep_going
    }

    fn write_object_json(&mut self, p: &ScanParams) {
        if self.once {
            self.json.push(',');
        } else {
            self.once = true;
        }
        if self.output == Output::Ids {
            self.json.push_str(&json_string(p.id));
            return;
        }
        self.json.push_str(&format!("{{\"id\":{}", json_string(p.id)));
        self.json.push(',');
        self.json
            .push_str(&output_fragment_json(self.output, self.precision, p.obj));
        if self.has_fields_output() && !self.farr.is_empty() {
            self.json.push_str(",\"fields\":[");
            for idx in 0..self.farr.len() {
                if idx > 0 {
                    self.json.push(',');
                }
                let value = p.fields.get(idx).copied().unwrap_or(0.0);
                self.json.push_str(&format_float(value));
            }
            self.json.push(']');
        }
        if let Some(distance) = p.distance {
            if distance > 0.0 {
                self.json
                    .push_str(&format!(",\"distance\":{:.2}", distance));
            }
        }
        self.json.push('}');
    }

    fn write_object_resp(&mut self, p: &ScanParams) {
        if self.output == Output::Ids {
            self.values.push(RespValue::bulk_string(p.id.to_string()));
            return;
        }
        let mut vals = vec![RespValue::bulk_string(p.id.to_string())];
        match self.output {
            Output::Objects => vals.push(RespValue::bulk_string(p.obj.text())),
            Output::Points => {
                let point = p.obj.calculated_point();
                let mut pv = vec![RespValue::float(point.lat()), RespValue::float(point.lon())];
                if point.z != 0.0 {
                    pv.push(RespValue::float(point.z));
                }
                vals.push(RespValue::array(pv));
            }
            Output::Hashes => {
                let hash = p.obj.geohash(self.precision as usize).unwrap_or_default();
                vals.push(RespValue::bulk_string(hash));
            }
            Output::Bounds => {
                let bbox = p.obj.calculated_bbox();
                vals.push(RespValue::array(vec![
                    RespValue::array(vec![
                        RespValue::float(bbox.min.lat()),
                        RespValue::float(bbox.min.lon()),
                    ]),
                    RespValue::array(vec![
                        RespValue::float(bbox.max.lat()),
                        RespValue::float(bbox.max.lon()),
                    ]),
                ]));
            }
            Output::Ids | Output::Count => {}
        }
        if self.has_fields_output() {
            let mut fvals = Vec::new();
            for (idx, name) in self.farr.iter().enumerate() {
                let value = p.fields.get(idx).copied().unwrap_or(0.0);
                if value != 0.0 {
                    fvals.push(RespValue::bulk_string(name.clone()));
                    fvals.push(RespValue::bulk_string(format_float(value)));
                }
            }
            if !fvals.is_empty() {
                vals.push(RespValue::array(fvals));
            }
        }
        if let Some(distance) = p.distance {
            if distance > 0.0 {
                vals.push(RespValue::float(distance));
            }
        }
        self.values.push(RespValue::array(vals));
    }
}

/// Renders the per-object JSON fragment for an output mode, e.g.
/// `"object":{…}` or `"point":{"lat":…,"lon":…}`. Shared with fence payload
/// construction so hooks and searches present objects identically.
pub fn output_fragment_json(output: Output, precision: u64, obj: &Object) -> String {
    match output {
        Output::Objects | Output::Ids | Output::Count => {
            format!("\"object\":{}", obj.json())
        }
        Output::Points => format!("\"point\":{}", obj.calculated_point().external_json()),
        Output::Hashes => {
            let hash = obj.geohash(precision as usize).unwrap_or_default();
            format!("\"hash\":{}", json_string(&hash))
        }
        Output::Bounds => format!("\"bounds\":{}", obj.calculated_bbox().external_json()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geojson::Position;
    use crate::script::NoScripting;

    fn point(lat: f64, lon: f64) -> Object {
        Object::SimplePoint(Position::from_latlon(lat, lon))
    }

    fn writer(output_type: OutputType, output: Output) -> ScanWriter {
        ScanWriter::new(
            output_type,
            output,
            5,
            "*",
            false,
            0,
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(NoScripting),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_ids_json() {
        let mut sw = writer(OutputType::Json, Output::Ids);
        sw.write_head();
        let obj = point(1.0, 2.0);
        sw.write_object(ScanParams {
            id: "truck1",
            obj: &obj,
            fields: &[],
            distance: None,
        });
        sw.write_foot();
        assert_eq!(sw.json_body(), r#","ids":["truck1"],"count":1,"cursor":0"#);
    }

    #[test]
    fn test_count_resp() {
        let mut sw = writer(OutputType::Resp, Output::Count);
        let obj = point(1.0, 2.0);
        for _ in 0..3 {
            sw.write_object(ScanParams {
                id: "x",
                obj: &obj,
                fields: &[],
                distance: None,
            });
        }
        sw.write_foot();
        assert_eq!(sw.resp_output(), RespValue::integer(3));
    }

    #[test]
    fn test_limit_sets_cursor() {
        let mut sw = ScanWriter::new(
            OutputType::Resp,
            Output::Ids,
            0,
            "*",
            false,
            0,
            2,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(NoScripting),
            None,
        )
        .unwrap();
        let obj = point(1.0, 2.0);
        let mut kept = true;
        for id in ["a", "b", "c"] {
            if !kept {
                break;
            }
            kept = sw.write_object(ScanParams {
                id,
                obj: &obj,
                fields: &[],
                distance: None,
            });
        }
        assert!(!kept, "limit should stop the iteration");
        match sw.resp_output() {
            RespValue::Array(vals) => {
                assert_eq!(vals[0], RespValue::integer(2));
                assert_eq!(vals[1].as_array().unwrap().len(), 2);
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_cursor_skips() {
        let mut sw = ScanWriter::new(
            OutputType::Resp,
            Output::Ids,
            0,
            "*",
            false,
            1,
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(NoScripting),
            None,
        )
        .unwrap();
        let obj = point(1.0, 2.0);
        for id in ["a", "b"] {
            sw.write_object(ScanParams {
                id,
                obj: &obj,
                fields: &[],
                distance: None,
            });
        }
        match sw.resp_output() {
            RespValue::Array(vals) => {
                let items = vals[1].as_array().unwrap();
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].as_str(), Some("b"));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_glob_filters_ids() {
        let mut sw = ScanWriter::new(
            OutputType::Resp,
            Output::Ids,
            0,
            "truck*",
            false,
            0,
            0,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            false,
            Arc::new(NoScripting),
            None,
        )
        .unwrap();
        let obj = point(1.0, 2.0);
        for id in ["truck1", "bus1", "truck2"] {
            sw.write_object(ScanParams {
                id,
                obj: &obj,
                fields: &[],
                distance: None,
            });
        }
        assert_eq!(sw.count(), 2);
    }

    #[test]
    fn test_where_clause() {
        let clause = WhereClause {
            field: "speed".to_string(),
            op: WhereOp::Gte,
            value: 50.0,
        };
        assert!(clause.matches(50.0));
        assert!(clause.matches(80.0));
        assert!(!clause.matches(20.0));
    }

    #[test]
    fn test_where_op_parse() {
        assert_eq!(WhereOp::parse("<"), Some(WhereOp::Lt));
        assert_eq!(WhereOp::parse("gte"), Some(WhereOp::Gte));
        assert_eq!(WhereOp::parse("=="), Some(WhereOp::Eq));
        assert_eq!(WhereOp::parse("~"), None);
    }

    #[test]
    fn test_whereeval_requires_engine() {
        let result = ScanWriter::new(
            OutputType::Resp,
            Output::Ids,
            0,
            "*",
            false,
            0,
            0,
            Vec::new(),
            Vec::new(),
            vec![WhereEval {
                script: "return true".to_string(),
                args: Vec::new(),
            }],
            false,
            Arc::new(NoScripting),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_points_json_fragment() {
        let obj = point(33.5, -112.1);
        assert_eq!(
            output_fragment_json(Output::Points, 0, &obj),
            r#""point":{"lat":33.5,"lon":-112.1}"#
        );
    }
}

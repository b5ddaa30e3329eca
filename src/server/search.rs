//! Search commands: SCAN, SEARCH, NEARBY, WITHIN, INTERSECTS.
//!
//! All five share one base-token parser (cursor, limit, sparse, match,
//! where-clauses, output selection, fence flags, ordering), then the spatial
//! commands parse an area: `POINT`, `CIRCLE`, `BOUNDS`, `HASH`, `TILE`,
//! `OBJECT`, `GET key id`, or `ROAM` for moving fences. A search carrying
//! the `FENCE` keyword does not run at all — it produces a fence descriptor
//! that either upgrades the connection to a live stream or is stored inside
//! a hook.

use crate::geojson::{self, BBox, Object, Position};
use crate::protocol::RespValue;
use crate::server::message::{tokenval, Message, OutputType};
use crate::server::scanner::{
    Output, ScanParams, ScanWriter, WhereClause, WhereEval, WhereIn, WhereOp,
};
use crate::server::{elapsed, CmdError, Db, SearchOutcome, Server};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Valid `DETECT` names.
const DETECT_NAMES: &[&str] = &["inside", "outside", "enter", "exit", "cross"];

/// The area a spatial search tests against.
#[derive(Debug, Clone)]
pub enum Shape {
    /// No area: plain id-ordered scan.
    All,
    /// `POINT lat lon [meters]`; no radius means k-nearest-neighbours.
    Point { center: Position, meters: f64 },
    /// `CIRCLE lat lon meters`
    Circle { center: Position, meters: f64 },
    /// `BOUNDS`, `HASH`, or `TILE`, all reduced to a box.
    Bounds(BBox),
    /// `OBJECT <geojson>`
    Obj(Object),
    /// `GET key id` — the area is another stored object, resolved at
    /// evaluation time.
    Get { key: String, id: String },
}

/// `ROAM key pattern meters`: a moving fence against another collection.
#[derive(Debug, Clone)]
pub struct Roam {
    pub key: String,
    pub pattern: String,
    pub meters: f64,
}

/// A parsed search, also serving as the fence descriptor stored in hooks
/// and live subscriptions.
#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub cmd: String,
    pub key: String,
    pub cursor: u64,
    pub limit: u64,
    pub ulimit: bool,
    pub sparse: u32,
    pub usparse: bool,
    pub output: Output,
    pub precision: u64,
    pub glob: String,
    pub wheres: Vec<WhereClause>,
    pub whereins: Vec<WhereIn>,
    pub whereevals: Vec<WhereEval>,
    pub nofields: bool,
    pub fence: bool,
    pub detect: Option<HashSet<String>>,
    pub commands: Option<HashSet<String>>,
    pub desc: bool,
    pub shape: Shape,
    pub knn: bool,
    pub roam: Option<Roam>,
}

impl SearchArgs {
    fn new(cmd: &str) -> SearchArgs {
        SearchArgs {
            cmd: cmd.to_string(),
            key: String::new(),
            cursor: 0,
            limit: 0,
            ulimit: false,
            sparse: 0,
            usparse: false,
            output: Output::Objects,
            precision: 0,
            glob: "*".to_string(),
            wheres: Vec::new(),
            whereins: Vec::new(),
            whereevals: Vec::new(),
            nofields: false,
            fence: false,
            detect: None,
            commands: None,
            desc: false,
            shape: Shape::All,
            knn: false,
            roam: None,
        }
    }

    /// Tests an object against this search's area, honoring the command's
    /// predicate (`within` demands containment, `nearby` and `intersects`
    /// demand overlap). Used both for query execution and fence matching.
    pub(crate) fn matches_obj(&self, db: &Db, obj: &Object) -> bool {
        let within = self.cmd == "within";
        match &self.shape {
            Shape::All => true,
            Shape::Point { center, meters } | Shape::Circle { center, meters } => {
                if *meters < 0.0 {
                    return true;
                }
                if within {
                    obj.within_circle(center, *meters)
                } else {
                    obj.intersects_circle(center, *meters)
                }
            }
            Shape::Bounds(bbox) => {
                if within {
                    obj.within_bbox(bbox)
                } else {
                    obj.intersects_bbox(bbox)
                }
            }
            Shape::Obj(area) => {
                if within {
                    obj.within(area)
                } else {
                    obj.intersects(area)
                }
            }
            Shape::Get { key, id } => {
                let area = db
                    .get_col(key)
                    .and_then(|col| col.get(id))
                    .map(|item| item.obj.clone());
                match area {
                    Some(area) => {
                        if within {
                            obj.within(&area)
                        } else {
                            obj.intersects(&area)
                        }
                    }
                    None => false,
                }
            }
        }
    }

    /// A bounding box covering the search area, used as an iteration
    /// prefilter. Unbounded shapes cover the world.
    pub(crate) fn area_bbox(&self, db: &Db) -> BBox {
        let world = BBox::from_latlon_bounds(-90.0, -180.0, 90.0, 180.0);
        match &self.shape {
            Shape::All => world,
            Shape::Point { center, meters } | Shape::Circle { center, meters } => {
                if *meters < 0.0 {
                    world
                } else {
                    circle_bbox(center, *meters)
                }
            }
            Shape::Bounds(bbox) => *bbox,
            Shape::Obj(obj) => obj.calculated_bbox(),
            Shape::Get { key, id } => db
                .get_col(key)
                .and_then(|col| col.get(id))
                .map(|item| item.obj.calculated_bbox())
                .unwrap_or(world),
        }
    }
}

/// A box that conservatively covers a circle of `meters` around the center.
fn circle_bbox(center: &Position, meters: f64) -> BBox {
    let dlat = meters / 111_320.0;
    let dlon = meters / (111_320.0 * center.lat().to_radians().cos().abs().max(1e-6));
    BBox::from_latlon_bounds(
        center.lat() - dlat,
        center.lon() - dlon,
        center.lat() + dlat,
        center.lon() + dlon,
    )
}

impl Server {
    /// Parses the flags shared by every scan/search command. Returns the
    /// unconsumed tail (the area tokens for spatial commands).
    fn parse_base_tokens<'a>(
        &self,
        cmd: &str,
        mut vs: &'a [String],
    ) -> Result<(&'a [String], SearchArgs), CmdError> {
        let mut s = SearchArgs::new(cmd);
        let (rest, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if key.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        s.key = key.to_string();
        vs = rest;

        loop {
            let Some((rest, token)) = tokenval(vs) else {
                break;
            };
            let lower = token.to_lowercase();
            match lower.as_str() {
                "cursor" => {
                    let (rest, n) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    s.cursor = n
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(n.to_string()))?;
                    vs = rest;
                }
                "limit" => {
                    let (rest, n) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    s.limit = n
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(n.to_string()))?;
                    if s.limit == 0 {
                        return Err(CmdError::InvalidArgument(n.to_string()));
                    }
                    s.ulimit = true;
                    vs = rest;
                }
                "sparse" => {
                    let (rest, n) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    s.sparse = n
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(n.to_string()))?;
                    if s.sparse == 0 || s.sparse > 8 {
                        return Err(CmdError::InvalidArgument(n.to_string()));
                    }
                    s.usparse = true;
                    vs = rest;
                }
                "match" => {
                    let (rest, glob) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    s.glob = glob.to_string();
                    vs = rest;
                }
                "where" => {
                    let (rest, field) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let (rest, op) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let (rest, value) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let op = WhereOp::parse(&op.to_lowercase())
                        .ok_or_else(|| CmdError::InvalidArgument(op.to_string()))?;
                    let value = value
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(value.to_string()))?;
                    s.wheres.push(WhereClause {
                        field: field.to_string(),
                        op,
                        value,
                    });
                    vs = rest;
                }
                "wherein" => {
                    let (rest, field) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let (mut rest, count) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let count: usize = count
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(count.to_string()))?;
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (r, v) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                        values.push(
                            v.parse()
                                .map_err(|_| CmdError::InvalidArgument(v.to_string()))?,
                        );
                        rest = r;
                    }
                    s.whereins.push(WhereIn {
                        field: field.to_string(),
                        values,
                    });
                    vs = rest;
                }
                "whereeval" => {
                    let (rest, script) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let (mut rest, count) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let count: usize = count
                        .parse()
                        .map_err(|_| CmdError::InvalidArgument(count.to_string()))?;
                    let mut args = Vec::with_capacity(count);
                    for _ in 0..count {
                        let (r, v) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                        args.push(v.to_string());
                        rest = r;
                    }
                    s.whereevals.push(WhereEval {
                        script: script.to_string(),
                        args,
                    });
                    vs = rest;
                }
                "nofields" => {
                    s.nofields = true;
                    vs = rest;
                }
                "fence" => {
                    s.fence = true;
                    vs = rest;
                }
                "detect" => {
                    let (rest, csv) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let mut set = HashSet::new();
                    for name in csv.split(',') {
                        let name = name.trim().to_lowercase();
                        if !DETECT_NAMES.contains(&name.as_str()) {
                            return Err(CmdError::InvalidArgument(name));
                        }
                        set.insert(name);
                    }
                    if set.is_empty() {
                        return Err(CmdError::InvalidArgument(csv.to_string()));
                    }
                    s.detect = Some(set);
                    vs = rest;
                }
                "commands" => {
                    let (rest, csv) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let set: HashSet<String> = csv
                        .split(',')
                        .map(|c| c.trim().to_lowercase())
                        .filter(|c| !c.is_empty())
                        .collect();
                    if set.is_empty() {
                        return Err(CmdError::InvalidArgument(csv.to_string()));
                    }
                    s.commands = Some(set);
                    vs = rest;
                }
                "asc" => {
                    s.desc = false;
                    vs = rest;
                }
                "desc" => {
                    s.desc = true;
                    vs = rest;
                }
                "ids" | "count" | "objects" | "points" | "bounds" | "hashes" => {
                    s.output = Output::parse(&lower).expect("selector names match");
                    if s.output == Output::Hashes {
                        let (rest2, p) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                        s.precision = p
                            .parse()
                            .map_err(|_| CmdError::InvalidArgument(p.to_string()))?;
                        if s.precision == 0 || s.precision > 12 {
                            return Err(CmdError::InvalidArgument(p.to_string()));
                        }
                        vs = rest2;
                    } else {
                        vs = rest;
                    }
                }
                _ => break,
            }
        }
        Ok((vs, s))
    }

    /// Parses a full spatial search (`NEARBY`/`WITHIN`/`INTERSECTS`),
    /// including the area clause. Also used by `SETHOOK` for the fence
    /// command after the `META` pairs.
    pub(crate) fn parse_search_args(
        &self,
        cmd: &str,
        vs: &[String],
    ) -> Result<SearchArgs, CmdError> {
        let (mut vs, mut s) = self.parse_base_tokens(cmd, vs)?;

        let (rest, typ) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let typ = typ.to_lowercase();
        vs = rest;

        // `WITHIN key BOUNDS 1 2 3 4` — when the output selector consumed a
        // literal BOUNDS whose operands follow, push it back as the area
        if s.output == Output::Bounds
            && matches!(cmd, "within" | "intersects")
            && typ.parse::<f64>().is_ok()
        {
            s.output = Output::Objects;
            // typ actually held the first operand
            let first = typ.clone();
            let mut nums = vec![first];
            let mut rest = vs;
            for _ in 0..3 {
                let (r, tok) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                nums.push(tok.to_string());
                rest = r;
            }
            if !rest.is_empty() {
                return Err(CmdError::InvalidNumArgs);
            }
            let parsed: Result<Vec<f64>, _> = nums.iter().map(|n| n.parse::<f64>()).collect();
            let nums = parsed.map_err(|_| CmdError::InvalidArgument(nums.join(" ")))?;
            s.shape = Shape::Bounds(BBox::from_latlon_bounds(nums[0], nums[1], nums[2], nums[3]));
            return Ok(s);
        }

        let allowed: &[&str] = match cmd {
            "nearby" => &["point", "roam"],
            "within" | "intersects" => &["get", "bounds", "object", "circle", "hash", "tile"],
            other => return Err(CmdError::InvalidArgument(other.to_string())),
        };
        if typ == "roam" && !(cmd == "nearby" && s.fence) {
            return Err(CmdError::InvalidArgument(typ));
        }
        if !allowed.contains(&typ.as_str()) {
            return Err(CmdError::InvalidArgument(typ));
        }

        let mut next = |vs: &mut &[String]| -> Result<String, CmdError> {
            let (rest, tok) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
            *vs = rest;
            Ok(tok.to_string())
        };
        let parse_f64 = |tok: &str| -> Result<f64, CmdError> {
            tok.parse()
                .map_err(|_| CmdError::InvalidArgument(tok.to_string()))
        };

        match typ.as_str() {
            "point" => {
                let lat = parse_f64(&next(&mut vs)?)?;
                let lon = parse_f64(&next(&mut vs)?)?;
                let meters = if vs.is_empty() {
                    s.knn = true;
                    -1.0
                } else {
                    let m = parse_f64(&next(&mut vs)?)?;
                    if m < 0.0 {
                        return Err(CmdError::InvalidArgument(m.to_string()));
                    }
                    m
                };
                s.shape = Shape::Point {
                    center: Position::from_latlon(lat, lon),
                    meters,
                };
            }
            "circle" => {
                let lat = parse_f64(&next(&mut vs)?)?;
                let lon = parse_f64(&next(&mut vs)?)?;
                let meters = parse_f64(&next(&mut vs)?)?;
                if meters < 0.0 {
                    return Err(CmdError::InvalidArgument(meters.to_string()));
                }
                s.shape = Shape::Circle {
                    center: Position::from_latlon(lat, lon),
                    meters,
                };
            }
            "bounds" => {
                let min_lat = parse_f64(&next(&mut vs)?)?;
                let min_lon = parse_f64(&next(&mut vs)?)?;
                let max_lat = parse_f64(&next(&mut vs)?)?;
                let max_lon = parse_f64(&next(&mut vs)?)?;
                s.shape = Shape::Bounds(BBox::from_latlon_bounds(
                    min_lat, min_lon, max_lat, max_lon,
                ));
            }
            "hash" => {
                let hash = next(&mut vs)?;
                let bbox = geojson::geohash::decode(&hash)
                    .map_err(|_| CmdError::InvalidArgument(hash.clone()))?;
                s.shape = Shape::Bounds(bbox);
            }
            "tile" => {
                let x: u32 = next(&mut vs)?
                    .parse()
                    .map_err(|_| CmdError::InvalidArgument("tile x".to_string()))?;
                let y: u32 = next(&mut vs)?
                    .parse()
                    .map_err(|_| CmdError::InvalidArgument("tile y".to_string()))?;
                let z: u32 = next(&mut vs)?
                    .parse()
                    .map_err(|_| CmdError::InvalidArgument("tile z".to_string()))?;
                s.shape = Shape::Bounds(geojson::tile_to_bbox(x, y, z));
            }
            "object" => {
                let body = next(&mut vs)?;
                let obj =
                    Object::parse_json(&body).map_err(|e| CmdError::Other(e.to_string()))?;
                s.shape = Shape::Obj(obj);
            }
            "get" => {
                let key = next(&mut vs)?;
                let id = next(&mut vs)?;
                s.shape = Shape::Get { key, id };
            }
            "roam" => {
                let key = next(&mut vs)?;
                let pattern = next(&mut vs)?;
                let meters = parse_f64(&next(&mut vs)?)?;
                if meters < 0.0 {
                    return Err(CmdError::InvalidArgument(meters.to_string()));
                }
                s.roam = Some(Roam {
                    key,
                    pattern,
                    meters,
                });
                s.shape = Shape::All;
            }
            _ => unreachable!("type token validated above"),
        }
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        Ok(s)
    }

    /// `SCAN key [flags…]` — id-ordered iteration.
    pub(crate) fn cmd_scan(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let (rest, s) = self.parse_base_tokens("scan", msg.tail())?;
        if !rest.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        self.run_scan(db, msg, start, s, false)
    }

    /// `SEARCH key [flags…]` — like SCAN but the glob matches object string
    /// values instead of ids.
    pub(crate) fn cmd_search(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let (rest, s) = self.parse_base_tokens("search", msg.tail())?;
        if !rest.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        self.run_scan(db, msg, start, s, true)
    }

    fn run_scan(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
        s: SearchArgs,
        match_values: bool,
    ) -> Result<RespValue, CmdError> {
        let col = db.get_col(&s.key);
        let mut sw = ScanWriter::new(
            msg.output,
            s.output,
            s.precision,
            &s.glob,
            match_values,
            s.cursor,
            s.limit,
            s.wheres.clone(),
            s.whereins.clone(),
            s.whereevals.clone(),
            s.nofields,
            Arc::clone(&self.scripts),
            col,
        )?;
        sw.write_head();
        if let Some(col) = col {
            let values_only = match_values;
            let everything = crate::glob::GlobPattern::new(&s.glob).is_everything();
            if s.output == Output::Count
                && s.wheres.is_empty()
                && s.whereins.is_empty()
                && s.whereevals.is_empty()
                && everything
            {
                // cheap count: no predicate can reject anything
                let total = col.count() as u64;
                let count = total.saturating_sub(s.cursor);
                return Ok(self.finish_scan_counted(msg, start, sw, count));
            }
            let glob = crate::glob::GlobPattern::new(&s.glob);
            let (min, max) = glob.limits();
            let feed = |sw: &mut ScanWriter, id: &str, obj: &Object, fields: &[f64]| -> bool {
                if values_only && !matches!(obj, Object::Str(_)) {
                    return true;
                }
                sw.write_object(ScanParams {
                    id,
                    obj,
                    fields,
                    distance: None,
                })
            };
            if values_only || (min.is_empty() && max.is_empty()) {
                col.scan(s.desc, |id, obj, fields| feed(&mut sw, id, obj, fields));
            } else {
                col.scan_range(&min, &max, s.desc, |id, obj, fields| {
                    feed(&mut sw, id, obj, fields)
                });
            }
        }
        Ok(self.finish_scan(msg, start, sw))
    }

    /// `NEARBY`/`WITHIN`/`INTERSECTS`. A `FENCE` search short-circuits into
    /// a live upgrade.
    pub(crate) fn cmd_spatial_search(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<SearchOutcome, CmdError> {
        let s = self.parse_search_args(&msg.command, msg.tail())?;
        if s.fence {
            return Ok(SearchOutcome::Live(s));
        }
        let col = db.get_col(&s.key);
        let limit = if s.usparse {
            4u64.saturating_pow(s.sparse)
        } else {
            s.limit
        };
        let mut sw = ScanWriter::new(
            msg.output,
            s.output,
            s.precision,
            &s.glob,
            false,
            s.cursor,
            limit,
            s.wheres.clone(),
            s.whereins.clone(),
            s.whereevals.clone(),
            s.nofields,
            Arc::clone(&self.scripts),
            col,
        )?;
        sw.write_head();

        if let Some(col) = col {
            let area = s.area_bbox(db);
            let mut sparse_cells: HashSet<(i64, i64)> = HashSet::new();
            let cells = 1i64 << s.sparse.min(16);
            let mut sparse_admit = |obj: &Object| -> bool {
                if !s.usparse {
                    return true;
                }
                let p = obj.calculated_point();
                let w = (area.max.x - area.min.x).max(1e-9);
                let h = (area.max.y - area.min.y).max(1e-9);
                let cell = (
                    (((p.x - area.min.x) / w) * cells as f64) as i64,
                    (((p.y - area.min.y) / h) * cells as f64) as i64,
                );
                sparse_cells.insert(cell)
            };

            match (&s.shape, s.knn) {
                (Shape::Point { center, .. }, true) => {
                    // KNN: ascending-distance iteration; the writer stops
                    // the stream once the page is full
                    col.nearest(center, |id, obj, fields, dist| {
                        if !sparse_admit(obj) {
                            return true;
                        }
                        sw.write_object(ScanParams {
                            id,
                            obj,
                            fields,
                            distance: Some(dist),
                        })
                    });
                }
                (Shape::Point { center, meters }, false) => {
                    col.nearby(center, *meters, |id, obj, fields, dist| {
                        if !sparse_admit(obj) {
                            return true;
                        }
                        sw.write_object(ScanParams {
                            id,
                            obj,
                            fields,
                            distance: Some(dist),
                        })
                    });
                }
                _ => {
                    col.search(
                        &area,
                        |obj| s.matches_obj(db, obj),
                        |id, obj, fields| {
                            if !sparse_admit(obj) {
                                return true;
                            }
                            sw.write_object(ScanParams {
                                id,
                                obj,
                                fields,
                                distance: None,
                            })
                        },
                    );
                }
            }
        }
        Ok(SearchOutcome::Value(self.finish_scan(msg, start, sw)))
    }

    fn finish_scan(&self, msg: &Message, start: Instant, mut sw: ScanWriter) -> RespValue {
        sw.write_foot();
        match msg.output {
            OutputType::Json => RespValue::bulk_string(format!(
                "{{\"ok\":true{},\"elapsed\":\"{}\"}}",
                sw.json_body(),
                elapsed(start)
            )),
            OutputType::Resp => sw.resp_output(),
        }
    }

    fn finish_scan_counted(
        &self,
        msg: &Message,
        start: Instant,
        _sw: ScanWriter,
        count: u64,
    ) -> RespValue {
        match msg.output {
            OutputType::Json => RespValue::bulk_string(format!(
                "{{\"ok\":true,\"count\":{},\"cursor\":0,\"elapsed\":\"{}\"}}",
                count,
                elapsed(start)
            )),
            OutputType::Resp => RespValue::integer(count as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    fn test_server() -> std::sync::Arc<Server> {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = crate::server::ServerOptions {
            dir: dir.path().to_path_buf(),
            append_only: false,
            ..Default::default()
        };
        // TempDir is dropped here but the server has already created its
        // state; these parsing tests never touch the disk again.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async { Server::start(opts).await.unwrap() })
    }

    #[test]
    fn test_parse_nearby_with_radius() {
        let server = test_server();
        let s = server
            .parse_search_args("nearby", &args(&["fleet", "POINT", "33.5", "-112.1", "1000"]))
            .unwrap();
        assert_eq!(s.key, "fleet");
        assert!(!s.knn);
        match s.shape {
            Shape::Point { center, meters } => {
                assert_eq!(center.lat(), 33.5);
                assert_eq!(meters, 1000.0);
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_parse_nearby_knn() {
        let server = test_server();
        let s = server
            .parse_search_args("nearby", &args(&["fleet", "LIMIT", "5", "POINT", "1", "2"]))
            .unwrap();
        assert!(s.knn);
        assert_eq!(s.limit, 5);
    }

    #[test]
    fn test_parse_within_bounds() {
        let server = test_server();
        let s = server
            .parse_search_args("within", &args(&["k", "BOUNDS", "0", "0", "10", "10"]))
            .unwrap();
        match s.shape {
            Shape::Bounds(b) => {
                assert_eq!(b.min.lat(), 0.0);
                assert_eq!(b.max.lon(), 10.0);
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_parse_fence_and_detect() {
        let server = test_server();
        let s = server
            .parse_search_args(
                "nearby",
                &args(&[
                    "fleet", "FENCE", "DETECT", "enter,exit", "POINT", "0", "0", "5000",
                ]),
            )
            .unwrap();
        assert!(s.fence);
        let detect = s.detect.unwrap();
        assert!(detect.contains("enter"));
        assert!(detect.contains("exit"));
        assert!(!detect.contains("inside"));
    }

    #[test]
    fn test_parse_bad_detect() {
        let server = test_server();
        let result = server.parse_search_args(
            "nearby",
            &args(&["fleet", "FENCE", "DETECT", "sideways", "POINT", "0", "0", "1"]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_roam_requires_fence() {
        let server = test_server();
        assert!(server
            .parse_search_args("nearby", &args(&["fleet", "ROAM", "people", "*", "100"]))
            .is_err());
        let s = server
            .parse_search_args(
                "nearby",
                &args(&["fleet", "FENCE", "ROAM", "people", "*", "100"]),
            )
            .unwrap();
        let roam = s.roam.unwrap();
        assert_eq!(roam.key, "people");
        assert_eq!(roam.meters, 100.0);
    }

    #[test]
    fn test_parse_where_clause() {
        let server = test_server();
        let s = server
            .parse_search_args(
                "within",
                &args(&[
                    "k", "WHERE", "speed", ">=", "50", "BOUNDS", "0", "0", "1", "1",
                ]),
            )
            .unwrap();
        assert_eq!(s.wheres.len(), 1);
        assert_eq!(s.wheres[0].field, "speed");
        assert_eq!(s.wheres[0].op, WhereOp::Gte);
    }

    #[test]
    fn test_parse_output_selector() {
        let server = test_server();
        let s = server
            .parse_search_args(
                "within",
                &args(&["k", "IDS", "CIRCLE", "0", "0", "100"]),
            )
            .unwrap();
        assert_eq!(s.output, Output::Ids);
        match s.shape {
            Shape::Circle { meters, .. } => assert_eq!(meters, 100.0),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_circle_bbox_covers_circle() {
        let center = Position::from_latlon(33.5, -112.1);
        let bbox = circle_bbox(&center, 10_000.0);
        assert!(bbox.contains_position(&center));
        // a point ~5km east should still be inside the cover
        let east = Position::from_latlon(33.5, -112.05);
        assert!(bbox.contains_position(&east));
    }
}

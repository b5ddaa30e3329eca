//! Write and point-read command handlers.
//!
//! These run under the router's lock (exclusive for writes, shared for
//! reads) and return `(response, CommandDetails)` pairs; the router owns
//! journaling and fan-out. Handlers never touch the AOF directly.

use crate::collection::Collection;
use crate::geojson::{self, BBox, Object, Position};
use crate::glob::GlobPattern;
use crate::protocol::{format_float, RespValue};
use crate::server::message::{tokenval, Message, OutputType};
use crate::server::{elapsed, json_string, CmdError, CommandDetails, Db, Server};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::time::Instant;

/// Field names that collide with the reserved search pseudo-fields.
pub fn is_reserved_field_name(field: &str) -> bool {
    matches!(field, "z" | "lat" | "lon")
}

pub(crate) fn parse_float(token: &str) -> Result<f64, CmdError> {
    token
        .parse::<f64>()
        .map_err(|_| CmdError::InvalidArgument(token.to_string()))
}

impl Server {
    /// `SET key id [FIELD name value ...] [EX seconds] [NX|XX]
    ///  (POINT lat lon [z] | BOUNDS minlat minlon maxlat maxlon |
    ///   HASH geohash | OBJECT geojson | STRING value | TILE x y z)`
    pub(crate) fn cmd_set(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let mut vs: &[String] = msg.tail();
        let (rest, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (rest, id) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
        if key.is_empty() || id.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, id) = (key.to_string(), id.to_string());
        vs = rest;

        let mut fields: Vec<(String, f64)> = Vec::new();
        let mut ex: Option<f64> = None;
        let mut nx = false;
        let mut xx = false;
        let obj: Object;

        loop {
            let (rest, token) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
            vs = rest;
            match token.to_lowercase().as_str() {
                "field" => {
                    let (rest, name) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    let (rest, value) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    vs = rest;
                    if is_reserved_field_name(name) {
                        return Err(CmdError::InvalidArgument(name.to_string()));
                    }
                    fields.push((name.to_string(), parse_float(value)?));
                }
                "ex" => {
                    let (rest, seconds) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    vs = rest;
                    let seconds = parse_float(seconds)?;
                    if seconds < 0.0 {
                        return Err(CmdError::InvalidArgument(format_float(seconds)));
                    }
                    ex = Some(seconds);
                }
                "nx" => {
                    if xx {
                        return Err(CmdError::InvalidArgument(token.to_string()));
                    }
                    nx = true;
                }
                "xx" => {
                    if nx {
                        return Err(CmdError::InvalidArgument(token.to_string()));
                    }
                    xx = true;
                }
                "point" => {
                    let (rest, lat) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    let (rest, lon) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                    let lat = parse_float(lat)?;
                    let lon = parse_float(lon)?;
                    // an optional trailing z
                    if let Some((rest, z)) = tokenval(rest) {
                        if !rest.is_empty() {
                            return Err(CmdError::InvalidNumArgs);
                        }
                        let z = parse_float(z)?;
                        obj = Object::Point {
                            pos: Position::new(lon, lat, z),
                            bbox: None,
                        };
                    } else {
                        obj = Object::SimplePoint(Position::from_latlon(lat, lon));
                    }
                    break;
                }
                "bounds" => {
                    let mut nums = [0.0f64; 4];
                    let mut rest = vs;
                    for num in nums.iter_mut() {
                        let (r, tok) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                        *num = parse_float(tok)?;
                        rest = r;
                    }
                    if !rest.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    let bbox = BBox::from_latlon_bounds(nums[0], nums[1], nums[2], nums[3]);
                    obj = Object::Polygon {
                        rings: vec![vec![
                            bbox.min,
                            Position::new(bbox.max.x, bbox.min.y, 0.0),
                            bbox.max,
                            Position::new(bbox.min.x, bbox.max.y, 0.0),
                            bbox.min,
                        ]],
                        bbox: None,
                    };
                    break;
                }
                "hash" => {
                    let (rest, hash) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    if !rest.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    let bbox = geojson::geohash::decode(hash)
                        .map_err(|_| CmdError::InvalidArgument(hash.to_string()))?;
                    obj = Object::SimplePoint(bbox.center());
                    break;
                }
                "object" => {
                    let (rest, body) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    if !rest.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    obj = Object::parse_json(body)
                        .map_err(|e| CmdError::Other(e.to_string()))?;
                    break;
                }
                "string" => {
                    let (rest, value) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                    if !rest.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    obj = Object::Str(value.to_string());
                    break;
                }
                "tile" => {
                    let mut nums = [0u32; 3];
                    let mut rest = vs;
                    for num in nums.iter_mut() {
                        let (r, tok) = tokenval(rest).ok_or(CmdError::InvalidNumArgs)?;
                        *num = tok
                            .parse()
                            .map_err(|_| CmdError::InvalidArgument(tok.to_string()))?;
                        rest = r;
                    }
                    if !rest.is_empty() {
                        return Err(CmdError::InvalidNumArgs);
                    }
                    let bbox = geojson::tile_to_bbox(nums[0], nums[1], nums[2]);
                    obj = Object::SimplePoint(bbox.center());
                    break;
                }
                other => return Err(CmdError::InvalidArgument(other.to_string())),
            }
        }

        let exists = db.get_col(&key).map(|c| c.get(&id).is_some()).unwrap_or(false);
        if nx && exists {
            return Ok((
                self.condition_failed(msg, start, "id already exists"),
                CommandDetails::default(),
            ));
        }
        if xx && !exists {
            return Ok((
                self.condition_failed(msg, start, "id not found"),
                CommandDetails::default(),
            ));
        }

        let col = db
            .cols
            .entry(key.clone())
            .or_insert_with(Collection::new);
        let result = col.set(&id, obj.clone(), &fields);
        let fmap = col.field_map().clone();

        // SET resets any previous deadline; EX installs a fresh one
        self.clear_expire(db, &key, &id);
        if let Some(seconds) = ex {
            let at = Utc::now() + ChronoDuration::milliseconds((seconds * 1000.0) as i64);
            self.set_expire(db, &key, &id, at);
        }

        let updated = match &result.old_obj {
            Some(old) => *old != obj || result.old_fields != result.fields,
            None => true,
        };
        let details = CommandDetails {
            command: "set".to_string(),
            key,
            id,
            obj: Some(obj),
            fields: result.fields,
            fmap,
            old_obj: result.old_obj,
            old_fields: result.old_fields,
            updated,
            timestamp: Utc::now(),
            ..Default::default()
        };
        Ok((self.ok_message(msg, start), details))
    }

    /// `FSET key id [XX] field value`
    pub(crate) fn cmd_fset(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (key, id) = (key.to_string(), id.to_string());
        let (vs, mut field) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let mut xx = false;
        let mut vs = vs;
        if field.eq_ignore_ascii_case("xx") {
            xx = true;
            let (rest, f) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
            field = f;
            vs = rest;
        }
        let (vs, value) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        if is_reserved_field_name(field) {
            return Err(CmdError::InvalidArgument(field.to_string()));
        }
        let value = parse_float(value)?;

        let col = match db.get_col_mut(&key) {
            Some(col) => col,
            None => {
                if xx {
                    return Ok((self.fset_result(msg, start, 0), CommandDetails::default()));
                }
                return Err(CmdError::KeyNotFound);
            }
        };
        match col.set_field(&id, field, value) {
            Some((updated, fields)) => {
                let obj = col.get(&id).map(|item| item.obj.clone());
                let fmap = col.field_map().clone();
                let details = CommandDetails {
                    command: "fset".to_string(),
                    key,
                    id,
                    field: field.to_string(),
                    value,
                    obj,
                    fields,
                    fmap,
                    updated,
                    timestamp: Utc::now(),
                    ..Default::default()
                };
                Ok((self.fset_result(msg, start, i64::from(updated)), details))
            }
            None => {
                if xx {
                    return Ok((self.fset_result(msg, start, 0), CommandDetails::default()));
                }
                Err(CmdError::IdNotFound)
            }
        }
    }

    /// `DEL key id`
    pub(crate) fn cmd_del(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, id) = (key.to_string(), id.to_string());

        let mut details = CommandDetails {
            command: "del".to_string(),
            key: key.clone(),
            id: id.clone(),
            timestamp: Utc::now(),
            ..Default::default()
        };
        let mut removed = false;
        if let Some(col) = db.get_col_mut(&key) {
            if let Some(item) = col.remove(&id) {
                details.old_obj = Some(item.obj.clone());
                details.obj = Some(item.obj);
                details.old_fields = item.fields;
                removed = true;
            }
            if col.is_empty() {
                db.cols.remove(&key);
            }
        }
        if removed {
            self.clear_expire(db, &key, &id);
            details.updated = true;
        }
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(i64::from(removed)),
        };
        Ok((res, details))
    }

    /// `PDEL key pattern` — deletes every matching id, emitting one child
    /// `DEL` record per id so replicas and hooks see single deletes.
    pub(crate) fn cmd_pdel(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, pattern) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() || pattern.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, pattern) = (key.to_string(), pattern.to_string());

        let glob = GlobPattern::new(&pattern);
        let mut ids: Vec<String> = Vec::new();
        if let Some(col) = db.get_col(&key) {
            let (min, max) = glob.limits();
            let mut visit = |id: &str| {
                if glob.matches(id) {
                    ids.push(id.to_string());
                }
                true
            };
            if glob.is_everything() || (min.is_empty() && max.is_empty()) {
                col.scan(false, |id, _, _| visit(id));
            } else {
                col.scan_range(&min, &max, false, |id, _, _| visit(id));
            }
        }

        let now = Utc::now();
        let mut children = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut child = CommandDetails {
                command: "del".to_string(),
                key: key.clone(),
                id: id.clone(),
                timestamp: now,
                updated: true,
                ..Default::default()
            };
            if let Some(col) = db.get_col_mut(&key) {
                if let Some(item) = col.remove(id) {
                    child.old_obj = Some(item.obj.clone());
                    child.obj = Some(item.obj);
                    child.old_fields = item.fields;
                }
            }
            self.clear_expire(db, &key, id);
            children.push(child);
        }
        if db.get_col(&key).map(|c| c.is_empty()).unwrap_or(false) {
            db.cols.remove(&key);
        }

        let count = children.len();
        let details = CommandDetails {
            command: "pdel".to_string(),
            key,
            pattern,
            parent: true,
            children,
            updated: count > 0,
            timestamp: now,
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(count as i64),
        };
        Ok((res, details))
    }

    /// `DROP key`
    pub(crate) fn cmd_drop(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let key = key.to_string();

        let existed = db.cols.remove(&key).is_some();
        if existed {
            self.clear_key_expires(db, &key);
        }
        let details = CommandDetails {
            command: "drop".to_string(),
            key,
            updated: existed,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(i64::from(existed)),
        };
        Ok((res, details))
    }

    /// `FLUSHDB` — drops every collection and every hook.
    pub(crate) fn cmd_flushdb(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        if !msg.tail().is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        db.cols.clear();
        db.expires.clear();
        self.exlist.lock().unwrap().clear();
        for (name, hook) in db.hooks.drain() {
            hook.close();
            let _ = self.queue.purge(&name);
        }
        db.hook_cols.clear();

        let details = CommandDetails {
            command: "flushdb".to_string(),
            updated: true,
            timestamp: Utc::now(),
            ..Default::default()
        };
        Ok((self.ok_message(msg, start), details))
    }

    /// `EXPIRE key id seconds`
    pub(crate) fn cmd_expire(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, seconds) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let seconds = parse_float(seconds)?;
        let (key, id) = (key.to_string(), id.to_string());

        let exists = db.get_col(&key).map(|c| c.get(&id).is_some()).unwrap_or(false);
        if exists {
            let at = Utc::now() + ChronoDuration::milliseconds((seconds * 1000.0) as i64);
            self.set_expire(db, &key, &id, at);
        }
        let details = CommandDetails {
            command: "expire".to_string(),
            key,
            id,
            value: seconds,
            updated: exists,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => {
                if exists {
                    self.ok_message(msg, start)
                } else {
                    return Err(CmdError::IdNotFound);
                }
            }
            OutputType::Resp => RespValue::integer(i64::from(exists)),
        };
        Ok((res, details))
    }

    /// `PERSIST key id`
    pub(crate) fn cmd_persist(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, id) = (key.to_string(), id.to_string());

        let cleared = self.get_expire(db, &key, &id).is_some();
        if cleared {
            self.clear_expire(db, &key, &id);
        }
        let details = CommandDetails {
            command: "persist".to_string(),
            key,
            id,
            updated: cleared,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(i64::from(cleared)),
        };
        Ok((res, details))
    }

    /// `GET key id [WITHFIELDS] [OBJECT | POINT | BOUNDS | HASH precision]`
    pub(crate) fn cmd_get(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (mut vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;

        let mut withfields = false;
        if let Some((rest, token)) = tokenval(vs) {
            if token.eq_ignore_ascii_case("withfields") {
                withfields = true;
                vs = rest;
            }
        }
        let mut form = "object".to_string();
        let mut precision = 0usize;
        if let Some((rest, token)) = tokenval(vs) {
            form = token.to_lowercase();
            vs = rest;
            if form == "hash" {
                let (rest, p) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                precision = p
                    .parse()
                    .map_err(|_| CmdError::InvalidArgument(p.to_string()))?;
                vs = rest;
            }
        }
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let col = match db.get_col(key) {
            Some(col) => col,
            None => {
                return match msg.output {
                    OutputType::Resp => Ok(RespValue::Null),
                    OutputType::Json => Err(CmdError::KeyNotFound),
                }
            }
        };
        let item = match col.get(id) {
            Some(item) => item,
            None => {
                return match msg.output {
                    OutputType::Resp => Ok(RespValue::Null),
                    OutputType::Json => Err(CmdError::IdNotFound),
                }
            }
        };

        let fragment: (String, RespValue) = match form.as_str() {
            "object" => (
                format!("\"object\":{}", item.obj.json()),
                RespValue::bulk_string(item.obj.text()),
            ),
            "point" => {
                let p = item.obj.calculated_point();
                let mut pv = vec![RespValue::float(p.lat()), RespValue::float(p.lon())];
                if p.z != 0.0 {
                    pv.push(RespValue::float(p.z));
                }
                (
                    format!("\"point\":{}", p.external_json()),
                    RespValue::array(pv),
                )
            }
            "bounds" => {
                let b = item.obj.calculated_bbox();
                (
                    format!("\"bounds\":{}", b.external_json()),
                    RespValue::array(vec![
                        RespValue::array(vec![
                            RespValue::float(b.min.lat()),
                            RespValue::float(b.min.lon()),
                        ]),
                        RespValue::array(vec![
                            RespValue::float(b.max.lat()),
                            RespValue::float(b.max.lon()),
                        ]),
                    ]),
                )
            }
            "hash" => {
                if precision == 0 || precision > 12 {
                    return Err(CmdError::InvalidArgument(precision.to_string()));
                }
                let hash = item
                    .obj
                    .geohash(precision)
                    .map_err(|e| CmdError::Other(e.to_string()))?;
                (
                    format!("\"hash\":{}", json_string(&hash)),
                    RespValue::bulk_string(hash),
                )
            }
            other => return Err(CmdError::InvalidArgument(other.to_string())),
        };

        match msg.output {
            OutputType::Json => {
                let mut body = format!("{{\"ok\":true,{}", fragment.0);
                if withfields {
                    let mut pairs = Vec::new();
                    for (name, &idx) in col.field_map() {
                        let value = item.fields.get(idx).copied().unwrap_or(0.0);
                        if value != 0.0 {
                            pairs.push((name.clone(), value));
                        }
                    }
                    pairs.sort_by(|a, b| a.0.cmp(&b.0));
                    if !pairs.is_empty() {
                        body.push_str(",\"fields\":{");
                        for (i, (name, value)) in pairs.iter().enumerate() {
                            if i > 0 {
                                body.push(',');
                            }
                            body.push_str(&format!(
                                "{}:{}",
                                json_string(name),
                                format_float(*value)
                            ));
                        }
                        body.push('}');
                    }
                }
                body.push_str(&format!(",\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => {
                if withfields {
                    let mut fvals = Vec::new();
                    for (idx, name) in col.field_arr().iter().enumerate() {
                        let value = item.fields.get(idx).copied().unwrap_or(0.0);
                        if value != 0.0 {
                            fvals.push(RespValue::bulk_string(name.clone()));
                            fvals.push(RespValue::bulk_string(format_float(value)));
                        }
                    }
                    Ok(RespValue::array(vec![fragment.1, RespValue::array(fvals)]))
                } else {
                    Ok(fragment.1)
                }
            }
        }
    }

    /// `TTL key id`
    pub(crate) fn cmd_ttl(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let exists = db.get_col(key).map(|c| c.get(id).is_some()).unwrap_or(false);
        if !exists {
            return match msg.output {
                OutputType::Resp => Ok(RespValue::integer(-2)),
                OutputType::Json => Err(CmdError::IdNotFound),
            };
        }
        let remaining = self.get_expire(db, key, id).map(|at| {
            let ms = (at - Utc::now()).num_milliseconds();
            if ms < 0 {
                0.0
            } else {
                ms as f64 / 1000.0
            }
        });
        match msg.output {
            OutputType::Json => {
                let ttl = remaining
                    .map(|secs| format_float((secs * 10.0).round() / 10.0))
                    .unwrap_or_else(|| "-1".to_string());
                Ok(RespValue::bulk_string(format!(
                    "{{\"ok\":true,\"ttl\":{},\"elapsed\":\"{}\"}}",
                    ttl,
                    elapsed(start)
                )))
            }
            OutputType::Resp => Ok(RespValue::integer(
                remaining.map(|secs| secs.ceil() as i64).unwrap_or(-1),
            )),
        }
    }

    /// `BOUNDS key`
    pub(crate) fn cmd_bounds(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let col = match db.get_col(key) {
            Some(col) => col,
            None => {
                return match msg.output {
                    OutputType::Resp => Ok(RespValue::Null),
                    OutputType::Json => Err(CmdError::KeyNotFound),
                }
            }
        };
        let bounds = col.bounds().unwrap_or_default();
        match msg.output {
            OutputType::Json => Ok(RespValue::bulk_string(format!(
                "{{\"ok\":true,\"bounds\":{},\"elapsed\":\"{}\"}}",
                bounds.external_json(),
                elapsed(start)
            ))),
            OutputType::Resp => Ok(RespValue::array(vec![
                RespValue::array(vec![
                    RespValue::float(bounds.min.lat()),
                    RespValue::float(bounds.min.lon()),
                ]),
                RespValue::array(vec![
                    RespValue::float(bounds.max.lat()),
                    RespValue::float(bounds.max.lon()),
                ]),
            ])),
        }
    }

    /// `KEYS pattern`
    pub(crate) fn cmd_keys(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, pattern) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let glob = GlobPattern::new(pattern);
        let keys: Vec<&String> = db.cols.keys().filter(|k| glob.matches(k)).collect();
        match msg.output {
            OutputType::Json => {
                let mut body = String::from("{\"ok\":true,\"keys\":[");
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        body.push(',');
                    }
                    body.push_str(&json_string(key));
                }
                body.push_str(&format!("],\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => Ok(RespValue::array(
                keys.into_iter()
                    .map(|k| RespValue::bulk_string(k.clone()))
                    .collect(),
            )),
        }
    }

    /// `TYPE key`
    pub(crate) fn cmd_type(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let typ = if db.get_col(key).is_some() {
            "hash"
        } else {
            "none"
        };
        match msg.output {
            OutputType::Json => Ok(RespValue::bulk_string(format!(
                "{{\"ok\":true,\"type\":\"{}\",\"elapsed\":\"{}\"}}",
                typ,
                elapsed(start)
            ))),
            OutputType::Resp => Ok(RespValue::simple_string(typ)),
        }
    }

    /// `JGET key id path`
    pub(crate) fn cmd_jget(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, path) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }

        let doc = self.stored_json(db, key, id)?;
        let value = json_path_get(&doc, path);
        match msg.output {
            OutputType::Json => {
                let rendered = match &value {
                    Some(v) => v.to_string(),
                    None => "null".to_string(),
                };
                Ok(RespValue::bulk_string(format!(
                    "{{\"ok\":true,\"value\":{},\"elapsed\":\"{}\"}}",
                    rendered,
                    elapsed(start)
                )))
            }
            OutputType::Resp => Ok(match value {
                Some(Value::String(s)) => RespValue::bulk_string(s.clone()),
                Some(v) => RespValue::bulk_string(v.to_string()),
                None => RespValue::Null,
            }),
        }
    }

    /// `JSET key id path value [RAW|STR]`
    pub(crate) fn cmd_jset(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, path) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (mut vs, raw_value) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let mut mode = "";
        if let Some((rest, m)) = tokenval(vs) {
            match m.to_lowercase().as_str() {
                "raw" => mode = "raw",
                "str" => mode = "str",
                other => return Err(CmdError::InvalidArgument(other.to_string())),
            }
            vs = rest;
        }
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, id) = (key.to_string(), id.to_string());

        let mut doc = match self.stored_json(db, &key, &id) {
            Ok(doc) => doc,
            Err(CmdError::KeyNotFound) | Err(CmdError::IdNotFound) => Value::Null,
            Err(e) => return Err(e),
        };

        let value = match mode {
            "str" => Value::String(raw_value.to_string()),
            "raw" => serde_json::from_str(raw_value)
                .map_err(|_| CmdError::InvalidArgument(raw_value.to_string()))?,
            _ => infer_json_value(raw_value),
        };
        json_path_set(&mut doc, path, value)
            .map_err(|_| CmdError::InvalidArgument(path.to_string()))?;

        let details = self.store_json(db, &key, &id, doc, "jset");
        Ok((self.ok_message(msg, start), details))
    }

    /// `JDEL key id path`
    pub(crate) fn cmd_jdel(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<(RespValue, CommandDetails), CmdError> {
        let vs = msg.tail();
        let (vs, key) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, id) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (vs, path) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        if !vs.is_empty() {
            return Err(CmdError::InvalidNumArgs);
        }
        let (key, id) = (key.to_string(), id.to_string());

        let mut doc = self.stored_json(db, &key, &id)?;
        let removed = json_path_del(&mut doc, path);
        if !removed {
            let res = match msg.output {
                OutputType::Json => self.ok_message(msg, start),
                OutputType::Resp => RespValue::integer(0),
            };
            return Ok((res, CommandDetails::default()));
        }
        let details = self.store_json(db, &key, &id, doc, "jdel");
        let res = match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(1),
        };
        Ok((res, details))
    }

    fn stored_json(&self, db: &Db, key: &str, id: &str) -> Result<Value, CmdError> {
        let col = db.get_col(key).ok_or(CmdError::KeyNotFound)?;
        let item = col.get(id).ok_or(CmdError::IdNotFound)?;
        match &item.obj {
            Object::Str(s) => {
                serde_json::from_str(s).map_err(|_| CmdError::other("value is not valid JSON"))
            }
            _ => Err(CmdError::other("value is not a string")),
        }
    }

    fn store_json(
        &self,
        db: &mut Db,
        key: &str,
        id: &str,
        doc: Value,
        command: &str,
    ) -> CommandDetails {
        let obj = Object::Str(doc.to_string());
        let col = db
            .cols
            .entry(key.to_string())
            .or_insert_with(Collection::new);
        let result = col.set(id, obj.clone(), &[]);
        let fmap = col.field_map().clone();
        CommandDetails {
            command: command.to_string(),
            key: key.to_string(),
            id: id.to_string(),
            obj: Some(obj),
            fields: result.fields,
            fmap,
            old_obj: result.old_obj,
            old_fields: result.old_fields,
            updated: true,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    fn fset_result(&self, msg: &Message, start: Instant, n: i64) -> RespValue {
        match msg.output {
            OutputType::Json => self.ok_message(msg, start),
            OutputType::Resp => RespValue::integer(n),
        }
    }

    /// NX/XX condition failures: a null in RESP, an error body in JSON.
    fn condition_failed(&self, msg: &Message, start: Instant, errmsg: &str) -> RespValue {
        match msg.output {
            OutputType::Resp => RespValue::Null,
            OutputType::Json => RespValue::bulk_string(format!(
                "{{\"ok\":false,\"err\":{},\"elapsed\":\"{}\"}}",
                json_string(errmsg),
                elapsed(start)
            )),
        }
    }

    /// `SERVER` — server stats; the RESP form is flat name/value pairs so a
    /// follower can read `aof_size` before tailing.
    pub(crate) fn cmd_server(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let num_objects: usize = db.cols.values().map(|c| c.count()).sum();
        let following = if self.config.follow_host().is_empty() {
            String::new()
        } else {
            format!("{}:{}", self.config.follow_host(), self.config.follow_port())
        };
        let caught_up = self.fcup.load(std::sync::atomic::Ordering::SeqCst);
        let pairs: Vec<(&str, String)> = vec![
            ("id", self.server_id.clone()),
            ("pid", std::process::id().to_string()),
            ("mem_alloc", db.memory_weight().to_string()),
            ("aof_size", db.aof_size.to_string()),
            ("num_collections", db.cols.len().to_string()),
            ("num_hooks", db.hooks.len().to_string()),
            ("num_objects", num_objects.to_string()),
            ("read_only", self.config.read_only().to_string()),
            ("following", following),
            ("caught_up", caught_up.to_string()),
        ];
        match msg.output {
            OutputType::Json => {
                let mut body = String::from("{\"ok\":true,\"stats\":{");
                for (i, (name, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        body.push(',');
                    }
                    // numbers and booleans render bare; everything else is
                    // a JSON string
                    let bare = matches!(
                        *name,
                        "pid" | "mem_alloc"
                            | "aof_size"
                            | "num_collections"
                            | "num_hooks"
                            | "num_objects"
                            | "read_only"
                            | "caught_up"
                    );
                    if bare {
                        body.push_str(&format!("\"{}\":{}", name, value));
                    } else {
                        body.push_str(&format!("\"{}\":{}", name, json_string(value)));
                    }
                }
                body.push_str(&format!("}},\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => {
                let mut vals = Vec::new();
                for (name, value) in pairs {
                    vals.push(RespValue::bulk_string(name.to_string()));
                    vals.push(RespValue::bulk_string(value));
                }
                Ok(RespValue::array(vals))
            }
        }
    }

    /// `STATS key [key ...]` — per-collection stats, null for missing keys.
    pub(crate) fn cmd_stats(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        if msg.args.len() < 2 {
            return Err(CmdError::InvalidNumArgs);
        }
        match msg.output {
            OutputType::Json => {
                let mut body = String::from("{\"ok\":true,\"stats\":[");
                for (i, key) in msg.tail().iter().enumerate() {
                    if i > 0 {
                        body.push(',');
                    }
                    match db.get_col(key) {
                        Some(col) => body.push_str(&format!(
                            "{{\"in_memory_size\":{},\"num_objects\":{}}}",
                            col.weight(),
                            col.count()
                        )),
                        None => body.push_str("null"),
                    }
                }
                body.push_str(&format!("],\"elapsed\":\"{}\"}}", elapsed(start)));
                Ok(RespValue::bulk_string(body))
            }
            OutputType::Resp => {
                let mut vals = Vec::new();
                for key in msg.tail() {
                    match db.get_col(key) {
                        Some(col) => vals.push(RespValue::array(vec![
                            RespValue::bulk_string("in_memory_size"),
                            RespValue::integer(col.weight() as i64),
                            RespValue::bulk_string("num_objects"),
                            RespValue::integer(col.count() as i64),
                        ])),
                        None => vals.push(RespValue::Null),
                    }
                }
                Ok(RespValue::array(vals))
            }
        }
    }

    /// `INFO` — flat text sections in the Redis style.
    pub(crate) fn cmd_info(
        &self,
        db: &Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let num_objects: usize = db.cols.values().map(|c| c.count()).sum();
        let mut text = String::new();
        text.push_str("# Server\r\n");
        text.push_str(&format!("id:{}\r\n", self.server_id));
        text.push_str(&format!("pid:{}\r\n", std::process::id()));
        text.push_str(&format!(
            "uptime_in_seconds:{}\r\n",
            self.started.elapsed().as_secs()
        ));
        text.push_str("# Clients\r\n");
        text.push_str(&format!(
            "connected_clients:{}\r\n",
            self.conns.lock().unwrap().len()
        ));
        text.push_str("# Memory\r\n");
        text.push_str(&format!("used_memory:{}\r\n", db.memory_weight()));
        text.push_str("# Persistence\r\n");
        text.push_str(&format!("aof_enabled:{}\r\n", db.aof.is_some()));
        text.push_str(&format!("aof_size:{}\r\n", db.aof_size));
        text.push_str(&format!("aof_rewrite_in_progress:{}\r\n", db.shrinking));
        text.push_str("# Stats\r\n");
        text.push_str(&format!("num_collections:{}\r\n", db.cols.len()));
        text.push_str(&format!("num_objects:{}\r\n", num_objects));
        text.push_str(&format!("num_hooks:{}\r\n", db.hooks.len()));
        text.push_str(&format!(
            "expired_keys:{}\r\n",
            self.stats.expired.load(std::sync::atomic::Ordering::Relaxed)
        ));
        text.push_str("# Replication\r\n");
        let role = if self.config.follow_host().is_empty() {
            "leader"
        } else {
            "follower"
        };
        text.push_str(&format!("role:{}\r\n", role));

        match msg.output {
            OutputType::Json => Ok(RespValue::bulk_string(format!(
                "{{\"ok\":true,\"info\":{},\"elapsed\":\"{}\"}}",
                json_string(&text),
                elapsed(start)
            ))),
            OutputType::Resp => Ok(RespValue::bulk_string(text)),
        }
    }
}

/// Infers the JSON type of an unannotated `JSET` value.
fn infer_json_value(raw: &str) -> Value {
    if raw == "true" {
        return Value::Bool(true);
    }
    if raw == "false" {
        return Value::Bool(false);
    }
    if raw == "null" {
        return Value::Null;
    }
    if let Ok(n) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(n) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

/// Resolves a dotted path (`a.b.2.c`) within a JSON document.
fn json_path_get<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for part in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Sets a dotted path, creating intermediate objects as needed.
fn json_path_set(doc: &mut Value, path: &str, value: Value) -> Result<(), ()> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.is_empty() {
        return Err(());
    }
    let mut cur = doc;
    for part in &parts[..parts.len() - 1] {
        match cur {
            Value::Array(arr) => {
                let idx: usize = part.parse().map_err(|_| ())?;
                if idx >= arr.len() {
                    return Err(());
                }
                cur = &mut arr[idx];
            }
            Value::Object(_) => {
                let map = cur.as_object_mut().ok_or(())?;
                cur = map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            Value::Null => {
                *cur = Value::Object(serde_json::Map::new());
                let map = cur.as_object_mut().ok_or(())?;
                cur = map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            _ => return Err(()),
        }
    }
    let last = parts[parts.len() - 1];
    match cur {
        Value::Array(arr) => {
            let idx: usize = last.parse().map_err(|_| ())?;
            if idx < arr.len() {
                arr[idx] = value;
            } else if idx == arr.len() {
                arr.push(value);
            } else {
                return Err(());
            }
        }
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Null => {
            let mut map = serde_json::Map::new();
            map.insert(last.to_string(), value);
            *cur = Value::Object(map);
        }
        _ => return Err(()),
    }
    Ok(())
}

/// Deletes a dotted path. Returns true when something was removed.
fn json_path_del(doc: &mut Value, path: &str) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = doc;
    for part in &parts[..parts.len() - 1] {
        cur = match cur {
            Value::Object(map) => match map.get_mut(*part) {
                Some(v) => v,
                None => return false,
            },
            Value::Array(arr) => match part.parse::<usize>().ok().and_then(|i| arr.get_mut(i)) {
                Some(v) => v,
                None => return false,
            },
            _ => return false,
        };
    }
    let last = parts[parts.len() - 1];
    match cur {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(arr) => match last.parse::<usize>() {
            Ok(idx) if idx < arr.len() => {
                arr.remove(idx);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reserved_field_names() {
        assert!(is_reserved_field_name("z"));
        assert!(is_reserved_field_name("lat"));
        assert!(is_reserved_field_name("lon"));
        assert!(!is_reserved_field_name("speed"));
    }

    #[test]
    fn test_json_path_get() {
        let doc = json!({"a": {"b": [1, 2, {"c": "hit"}]}});
        assert_eq!(json_path_get(&doc, "a.b.2.c"), Some(&json!("hit")));
        assert_eq!(json_path_get(&doc, "a.b.0"), Some(&json!(1)));
        assert_eq!(json_path_get(&doc, "a.missing"), None);
        assert_eq!(json_path_get(&doc, "a.b.9"), None);
    }

    #[test]
    fn test_json_path_set_creates_intermediates() {
        let mut doc = Value::Null;
        json_path_set(&mut doc, "user.name", json!("kim")).unwrap();
        assert_eq!(doc, json!({"user": {"name": "kim"}}));

        json_path_set(&mut doc, "user.age", json!(33)).unwrap();
        assert_eq!(doc, json!({"user": {"name": "kim", "age": 33}}));
    }

    #[test]
    fn test_json_path_set_array() {
        let mut doc = json!({"tags": ["a", "b"]});
        json_path_set(&mut doc, "tags.1", json!("B")).unwrap();
        assert_eq!(doc, json!({"tags": ["a", "B"]}));
        // append at end is allowed
        json_path_set(&mut doc, "tags.2", json!("c")).unwrap();
        assert_eq!(doc, json!({"tags": ["a", "B", "c"]}));
        // past the end is not
        assert!(json_path_set(&mut doc, "tags.9", json!("x")).is_err());
    }

    #[test]
    fn test_json_path_del() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        assert!(json_path_del(&mut doc, "a.b"));
        assert_eq!(doc, json!({"a": {"c": 2}}));
        assert!(!json_path_del(&mut doc, "a.missing"));
    }

    #[test]
    fn test_infer_json_value() {
        assert_eq!(infer_json_value("33"), json!(33.0));
        assert_eq!(infer_json_value("true"), json!(true));
        assert_eq!(infer_json_value("null"), Value::Null);
        assert_eq!(infer_json_value("hello"), json!("hello"));
    }
}

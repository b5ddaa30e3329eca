//! Fence matching: turning a committed mutation into notification payloads.
//!
//! Given a fence descriptor (from a hook or a live subscriber) and a
//! `CommandDetails`, this module decides which detect condition fired by
//! evaluating the fence against both the old and the new object:
//!
//! - `inside`  — the object matches the fence (and did before, or is new)
//! - `enter`   — it matched nothing before and matches now
//! - `exit`    — it matched before and no longer does
//! - `outside` — it does not match
//! - `cross`   — both endpoints are outside but the movement passed through
//!
//! A `DETECT` filter narrows what is emitted; `enter` falls back to
//! `inside` and `exit` to `outside` when the primary detect is filtered
//! but the weaker one is allowed. Delete/drop mutations emit bare
//! `del`/`drop` records so subscribers can retire state.
//!
//! Each `(fence, object id)` pair carries a group token that stays stable
//! while the object remains inside and rotates after it leaves, letting
//! consumers correlate an enter/exit episode.

use crate::geojson::Object;
use crate::glob::GlobPattern;
use crate::server::scanner::output_fragment_json;
use crate::server::search::SearchArgs;
use crate::server::{json_string, random_hex, CommandDetails, Db};
use chrono::SecondsFormat;
use std::collections::HashMap;
use std::sync::Mutex;

/// Evaluates one mutation against one fence, returning the JSON payloads to
/// deliver. `hook_name` is present for hooks and absent for live
/// subscribers; `groups` is the per-fence group-token table.
pub(crate) fn fence_match(
    hook_name: Option<&str>,
    metas: &[(String, String)],
    groups: &Mutex<HashMap<String, String>>,
    fence: &SearchArgs,
    details: &CommandDetails,
    db: &Db,
) -> Vec<String> {
    if let Some(commands) = &fence.commands {
        if !commands.contains(&details.command) {
            return Vec::new();
        }
    }
    let time = details
        .timestamp
        .to_rfc3339_opts(SecondsFormat::Micros, true);

    match details.command.as_str() {
        "del" => {
            if !GlobPattern::new(&fence.glob).matches(&details.id) {
                return Vec::new();
            }
            groups.lock().unwrap().remove(&details.id);
            vec![format!(
                "{{\"command\":\"del\"{},\"key\":{},\"time\":{},\"id\":{}}}",
                hook_fragment(hook_name, metas),
                json_string(&details.key),
                json_string(&time),
                json_string(&details.id)
            )]
        }
        "drop" => {
            groups.lock().unwrap().clear();
            vec![format!(
                "{{\"command\":\"drop\"{},\"key\":{},\"time\":{}}}",
                hook_fragment(hook_name, metas),
                json_string(&details.key),
                json_string(&time)
            )]
        }
        "flushdb" => {
            groups.lock().unwrap().clear();
            vec![format!(
                "{{\"command\":\"flushdb\"{},\"time\":{}}}",
                hook_fragment(hook_name, metas),
                json_string(&time)
            )]
        }
        _ => {
            let obj = match &details.obj {
                Some(obj) if obj.is_geometry() => obj,
                _ => return Vec::new(),
            };
            if !GlobPattern::new(&fence.glob).matches(&details.id) {
                return Vec::new();
            }
            if !field_match(fence, details) {
                return Vec::new();
            }
            if let Some(roam) = &fence.roam {
                return roam_match(hook_name, metas, roam, details, obj, db, &time);
            }

            let m2 = fence.matches_obj(db, obj);
            let old = details.old_obj.as_ref().filter(|o| o.is_geometry());
            let primary = match old {
                None => {
                    if m2 {
                        "inside"
                    } else {
                        "outside"
                    }
                }
                Some(old_obj) => {
                    let m1 = fence.matches_obj(db, old_obj);
                    match (m1, m2) {
                        (true, true) => "inside",
                        (false, true) => "enter",
                        (true, false) => "exit",
                        (false, false) => {
                            if crossed(fence, old_obj, obj, db) {
                                "cross"
                            } else {
                                "outside"
                            }
                        }
                    }
                }
            };

            let detect = match &fence.detect {
                None => primary,
                Some(allowed) if allowed.contains(primary) => primary,
                Some(allowed) => match primary {
                    "enter" if allowed.contains("inside") => "inside",
                    "exit" if allowed.contains("outside") => "outside",
                    _ => return Vec::new(),
                },
            };

            let group = {
                let mut groups = groups.lock().unwrap();
                let group = groups
                    .entry(details.id.clone())
                    .or_insert_with(|| random_hex(10))
                    .clone();
                if matches!(primary, "exit" | "outside") {
                    groups.remove(&details.id);
                }
                group
            };

            vec![format!(
                "{{\"command\":{},\"group\":{},\"detect\":\"{}\"{},\"key\":{},\"time\":{},\"id\":{},{}}}",
                json_string(&details.command),
                json_string(&group),
                detect,
                hook_fragment(hook_name, metas),
                json_string(&details.key),
                json_string(&time),
                json_string(&details.id),
                output_fragment_json(fence.output, fence.precision, obj)
            )]
        }
    }
}

/// The `"hook":…` and `"meta":…` members, present only when applicable.
fn hook_fragment(hook_name: Option<&str>, metas: &[(String, String)]) -> String {
    let mut s = String::new();
    if let Some(name) = hook_name {
        s.push_str(&format!(",\"hook\":{}", json_string(name)));
    }
    if !metas.is_empty() {
        s.push_str(",\"meta\":{");
        for (i, (mkey, mval)) in metas.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            s.push_str(&format!("{}:{}", json_string(mkey), json_string(mval)));
        }
        s.push('}');
    }
    s
}

/// Applies the fence's numeric WHERE clauses against the mutation's fields.
/// `WHEREEVAL` requires a scripting engine and is rejected when the fence
/// is installed, so it never reaches this point unevaluated.
fn field_match(fence: &SearchArgs, details: &CommandDetails) -> bool {
    let value_of = |field: &str| -> f64 {
        if field == "z" {
            return details
                .obj
                .as_ref()
                .map(|o| o.calculated_point().z)
                .unwrap_or(0.0);
        }
        match details.fmap.get(field) {
            Some(&idx) if idx < details.fields.len() => details.fields[idx],
            _ => 0.0,
        }
    };
    fence.wheres.iter().all(|w| w.matches(value_of(&w.field)))
        && fence.whereins.iter().all(|w| w.matches(value_of(&w.field)))
}

/// A cheap cross check: both endpoints are outside, but the midpoint of the
/// movement lands inside the fence.
fn crossed(fence: &SearchArgs, old: &Object, new: &Object, db: &Db) -> bool {
    let a = old.calculated_point();
    let b = new.calculated_point();
    let mid = crate::geojson::Position::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0, 0.0);
    fence.matches_obj(db, &Object::SimplePoint(mid))
}

/// Roaming fences: report which objects of the roam target collection are
/// now within range (`nearby`) and which dropped out of range relative to
/// the previous position (`faraway`).
#[allow(clippy::too_many_arguments)]
fn roam_match(
    hook_name: Option<&str>,
    metas: &[(String, String)],
    roam: &crate::server::search::Roam,
    details: &CommandDetails,
    obj: &Object,
    db: &Db,
    time: &str,
) -> Vec<String> {
    if details.command != "set" {
        return Vec::new();
    }
    let target_col = match db.get_col(&roam.key) {
        Some(col) => col,
        None => return Vec::new(),
    };
    let glob = GlobPattern::new(&roam.pattern);
    let center = obj.calculated_point();
    let old_center = details
        .old_obj
        .as_ref()
        .filter(|o| o.is_geometry())
        .map(|o| o.calculated_point());

    let mut payloads = Vec::new();
    let mut near_now: Vec<String> = Vec::new();
    target_col.nearby(&center, roam.meters, |tid, tobj, _, dist| {
        if tid == details.id && roam.key == details.key {
            return true;
        }
        if !glob.matches(tid) {
            return true;
        }
        near_now.push(tid.to_string());
        payloads.push(format!(
            "{{\"command\":\"set\",\"detect\":\"roam\"{},\"key\":{},\"time\":{},\"id\":{},\"nearby\":{{\"key\":{},\"id\":{},\"object\":{},\"meters\":{:.2}}}}}",
            hook_fragment(hook_name, metas),
            json_string(&details.key),
            json_string(time),
            json_string(&details.id),
            json_string(&roam.key),
            json_string(tid),
            tobj.json(),
            dist
        ));
        true
    });

    if let Some(old_center) = old_center {
        target_col.nearby(&old_center, roam.meters, |tid, tobj, _, _| {
            if tid == details.id && roam.key == details.key {
                return true;
            }
            if !glob.matches(tid) || near_now.iter().any(|n| n == tid) {
                return true;
            }
            let dist = tobj.calculated_point().distance_to(&center);
            payloads.push(format!(
                "{{\"command\":\"set\",\"detect\":\"roam\"{},\"key\":{},\"time\":{},\"id\":{},\"faraway\":{{\"key\":{},\"id\":{},\"object\":{},\"meters\":{:.2}}}}}",
                hook_fragment(hook_name, metas),
                json_string(&details.key),
                json_string(time),
                json_string(&details.id),
                json_string(&roam.key),
                json_string(tid),
                tobj.json(),
                dist
            ));
            true
        });
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geojson::Position;
    use crate::server::scanner::Output;
    use crate::server::search::Shape;
    use chrono::Utc;
    use std::collections::HashSet;

    fn make_db() -> Db {
        // Db construction is crate-private; go through the fields directly
        Db {
            cols: Default::default(),
            expires: Default::default(),
            aof: None,
            aof_size: 0,
            shrinking: false,
            shrink_log: Vec::new(),
            hooks: Default::default(),
            hook_cols: Default::default(),
        }
    }

    fn fence_point(meters: f64) -> SearchArgs {
        SearchArgs {
            cmd: "nearby".to_string(),
            key: "fleet".to_string(),
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
            fence: true,
            detect: None,
            commands: None,
            desc: false,
            shape: Shape::Point {
                center: Position::from_latlon(0.0, 0.0),
                meters,
            },
            knn: false,
            roam: None,
        }
    }

    fn set_details(id: &str, lat: f64, lon: f64, old: Option<(f64, f64)>) -> CommandDetails {
        CommandDetails {
            command: "set".to_string(),
            key: "fleet".to_string(),
            id: id.to_string(),
            obj: Some(Object::SimplePoint(Position::from_latlon(lat, lon))),
            old_obj: old.map(|(lat, lon)| Object::SimplePoint(Position::from_latlon(lat, lon))),
            updated: true,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_set_inside_detects_inside() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        let fence = fence_point(10_000.0);
        let details = set_details("t", 0.01, 0.01, None);
        let payloads = fence_match(Some("h"), &[], &groups, &fence, &details, &db);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains("\"detect\":\"inside\""), "{}", payloads[0]);
        assert!(payloads[0].contains("\"hook\":\"h\""));
        assert!(payloads[0].contains("\"id\":\"t\""));
    }

    #[test]
    fn test_enter_exit_sequence() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        let fence = fence_point(10_000.0);

        // outside → inside
        let details = set_details("t", 0.01, 0.01, Some((5.0, 5.0)));
        let payloads = fence_match(None, &[], &groups, &fence, &details, &db);
        assert!(payloads[0].contains("\"detect\":\"enter\""));
        assert!(groups.lock().unwrap().contains_key("t"));

        // inside → outside
        let details = set_details("t", 5.0, 5.0, Some((0.01, 0.01)));
        let payloads = fence_match(None, &[], &groups, &fence, &details, &db);
        assert!(payloads[0].contains("\"detect\":\"exit\""));
        assert!(!groups.lock().unwrap().contains_key("t"));
    }

    #[test]
    fn test_detect_filter_with_fallback() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        let mut fence = fence_point(10_000.0);
        fence.detect = Some(HashSet::from(["inside".to_string()]));

        // enter falls back to inside when only inside is allowed
        let details = set_details("t", 0.01, 0.01, Some((5.0, 5.0)));
        let payloads = fence_match(None, &[], &groups, &fence, &details, &db);
        assert!(payloads[0].contains("\"detect\":\"inside\""));

        // plain outside is filtered out entirely
        let details = set_details("t", 5.0, 5.0, Some((6.0, 6.0)));
        let payloads = fence_match(None, &[], &groups, &fence, &details, &db);
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_del_payload() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        groups
            .lock()
            .unwrap()
            .insert("t".to_string(), "g".to_string());
        let fence = fence_point(10_000.0);
        let details = CommandDetails {
            command: "del".to_string(),
            key: "fleet".to_string(),
            id: "t".to_string(),
            updated: true,
            timestamp: Utc::now(),
            ..Default::default()
        };
        let payloads = fence_match(Some("h"), &[], &groups, &fence, &details, &db);
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].starts_with("{\"command\":\"del\""));
        assert!(!groups.lock().unwrap().contains_key("t"));
    }

    #[test]
    fn test_commands_filter() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        let mut fence = fence_point(10_000.0);
        fence.commands = Some(HashSet::from(["del".to_string()]));
        let details = set_details("t", 0.01, 0.01, None);
        assert!(fence_match(None, &[], &groups, &fence, &details, &db).is_empty());
    }

    #[test]
    fn test_meta_fragment() {
        let metas = vec![("tier".to_string(), "gold".to_string())];
        let fragment = hook_fragment(Some("h"), &metas);
        assert_eq!(fragment, ",\"hook\":\"h\",\"meta\":{\"tier\":\"gold\"}");
    }

    #[test]
    fn test_group_stable_while_inside() {
        let db = make_db();
        let groups = Mutex::new(HashMap::new());
        let fence = fence_point(10_000.0);

        let details = set_details("t", 0.01, 0.01, None);
        let first = fence_match(None, &[], &groups, &fence, &details, &db);
        let details = set_details("t", 0.02, 0.02, Some((0.01, 0.01)));
        let second = fence_match(None, &[], &groups, &fence, &details, &db);

        let group_of = |payload: &str| {
            let start = payload.find("\"group\":\"").unwrap() + 9;
            payload[start..start + 20].to_string()
        };
        assert_eq!(group_of(&first[0]), group_of(&second[0]));
    }
}

//! Developer commands, enabled only with `--dev`.
//!
//! `MASSINSERT` seeds collections with random points through the ordinary
//! write path (journaled, fence-matched, broadcast), which makes it a
//! load generator for the whole commit pipeline rather than a storage
//! backdoor. `SLEEP` holds the shared lock for a wall-clock interval to
//! exercise lock contention.

use crate::protocol::{format_float, RespValue};
use crate::server::message::{tokenval, Message};
use crate::server::{CmdError, Db, Server};
use rand::Rng;
use std::time::Instant;
use tracing::info;

/// Log cadence during a mass insert.
const REPORT_EVERY: usize = 10_000;

impl Server {
    /// `MASSINSERT numkeys numpoints [minlat minlon maxlat maxlon]`
    pub(crate) fn cmd_mass_insert(
        &self,
        db: &mut Db,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        let vs = msg.tail();
        let (vs, ncols) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let (mut vs, nobjs) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
        let ncols: usize = ncols
            .parse()
            .map_err(|_| CmdError::InvalidArgument(ncols.to_string()))?;
        let nobjs: usize = nobjs
            .parse()
            .map_err(|_| CmdError::InvalidArgument(nobjs.to_string()))?;

        let mut bounds = [-90.0f64, -180.0, 90.0, 180.0];
        if !vs.is_empty() {
            for bound in bounds.iter_mut() {
                let (rest, tok) = tokenval(vs).ok_or(CmdError::InvalidNumArgs)?;
                *bound = tok
                    .parse()
                    .map_err(|_| CmdError::InvalidArgument(tok.to_string()))?;
                vs = rest;
            }
            if !vs.is_empty() {
                return Err(CmdError::InvalidNumArgs);
            }
        }
        let (min_lat, min_lon, max_lat, max_lon) = (bounds[0], bounds[1], bounds[2], bounds[3]);

        let mut rng = rand::thread_rng();
        let mut inserted = 0usize;
        for c in 0..ncols {
            let key = format!("mi:{}", c);
            for j in 0..nobjs {
                let id = j.to_string();
                let tokens: Vec<String> = if j % 8 == 0 {
                    vec![
                        "set".to_string(),
                        key.clone(),
                        id,
                        "string".to_string(),
                        format!("str{}", j),
                    ]
                } else {
                    let lat = min_lat + rng.gen::<f64>() * (max_lat - min_lat);
                    let lon = min_lon + rng.gen::<f64>() * (max_lon - min_lon);
                    vec![
                        "set".to_string(),
                        key.clone(),
                        id,
                        "field".to_string(),
                        "fname".to_string(),
                        format_float(rng.gen::<f64>() * 10.0),
                        "point".to_string(),
                        format_float(lat),
                        format_float(lon),
                    ]
                };
                let m = Message::internal(tokens);
                self.apply_internal(db, &m)?;
                inserted += 1;
                if inserted % REPORT_EVERY == 0 {
                    info!(inserted, total = ncols * nobjs, "massinsert progress");
                }
            }
        }
        info!(inserted, "massinsert done");
        Ok(self.ok_message(msg, start))
    }

    /// `SLEEP seconds` — parks the handler while holding the shared lock.
    pub(crate) async fn cmd_sleep(
        &self,
        msg: &Message,
        start: Instant,
    ) -> Result<RespValue, CmdError> {
        if msg.args.len() != 2 {
            return Err(CmdError::InvalidNumArgs);
        }
        let seconds: f64 = msg.args[1]
            .parse()
            .map_err(|_| CmdError::InvalidArgument(msg.args[1].clone()))?;
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0))).await;
        Ok(self.ok_message(msg, start))
    }
}

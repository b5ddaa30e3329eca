//! The client connection table (C13) and the `CLIENT` command.
//!
//! Every accepted connection registers a `ClientInfo` carrying its id,
//! address, optional name, and activity timestamps. `CLIENT LIST` walks
//! the table in id order; `CLIENT KILL` flags the target, whose connection
//! task observes the kill notify and closes its own socket — when a client
//! kills itself the OK response is written before the close.

use crate::protocol::RespValue;
use crate::server::message::{Message, OutputType};
use crate::server::{elapsed, json_string, CmdError, Server};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

/// Per-connection bookkeeping shared between the connection task and the
/// `CLIENT` command.
#[derive(Debug)]
pub struct ClientInfo {
    pub id: u64,
    pub addr: String,
    pub name: std::sync::Mutex<String>,
    pub opened: Instant,
    pub last: std::sync::Mutex<Instant>,
    pub authenticated: AtomicBool,
    /// Fired by `CLIENT KILL`; the owning connection closes itself.
    pub kill: Notify,
    pub killed: AtomicBool,
}

impl ClientInfo {
    /// Updates the last-activity timestamp.
    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn request_kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.kill.notify_waiters();
    }
}

impl Server {
    /// Registers a new connection in the table.
    pub(crate) fn register_client(&self, addr: String) -> Arc<ClientInfo> {
        let id = self
            .next_client_id
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        let info = Arc::new(ClientInfo {
            id,
            addr,
            name: std::sync::Mutex::new(String::new()),
            opened: Instant::now(),
            last: std::sync::Mutex::new(Instant::now()),
            authenticated: AtomicBool::new(false),
            kill: Notify::new(),
            killed: AtomicBool::new(false),
        });
        self.conns.lock().unwrap().insert(id, Arc::clone(&info));
        self.stats
            .total_conns
            .fetch_add(1, Ordering::Relaxed);
        info
    }

    pub(crate) fn unregister_client(&self, id: u64) {
        self.conns.lock().unwrap().remove(&id);
    }

    /// `CLIENT LIST|GETNAME|SETNAME|KILL`.
    pub(crate) fn cmd_client(
        &self,
        msg: &Message,
        start: Instant,
        caller: &Arc<ClientInfo>,
    ) -> Result<RespValue, CmdError> {
        if msg.args.len() < 2 {
            return Err(CmdError::InvalidNumArgs);
        }
        match msg.args[1].to_lowercase().as_str() {
            "list" => {
                if msg.args.len() != 2 {
                    return Err(CmdError::InvalidNumArgs);
                }
                let mut list: Vec<Arc<ClientInfo>> =
                    self.conns.lock().unwrap().values().cloned().collect();
                list.sort_by_key(|c| c.id);
                let now = Instant::now();
                let mut text = String::new();
                for client in list {
                    let age = now.duration_since(client.opened).as_secs();
                    let idle = now
                        .duration_since(*client.last.lock().unwrap())
                        .as_secs();
                    text.push_str(&format!(
                        "id={} addr={} name={} age={} idle={}\n",
                        client.id,
                        client.addr,
                        client.name.lock().unwrap(),
                        age,
                        idle
                    ));
                }
                match msg.output {
                    OutputType::Json => Ok(RespValue::bulk_string(format!(
                        "{{\"ok\":true,\"list\":{},\"elapsed\":\"{}\"}}",
                        json_string(&text),
                        elapsed(start)
                    ))),
                    OutputType::Resp => Ok(RespValue::bulk_string(text)),
                }
            }
            "getname" => {
                if msg.args.len() != 2 {
                    return Err(CmdError::InvalidNumArgs);
                }
                let name = caller.name.lock().unwrap().clone();
                match msg.output {
                    OutputType::Json => Ok(RespValue::bulk_string(format!(
                        "{{\"ok\":true,\"name\":{},\"elapsed\":\"{}\"}}",
                        json_string(&name),
                        elapsed(start)
                    ))),
                    OutputType::Resp => Ok(RespValue::bulk_string(name)),
                }
            }
            "setname" => {
                if msg.args.len() != 3 {
                    return Err(CmdError::InvalidNumArgs);
                }
                let name = &msg.args[2];
                if name.chars().any(char::is_whitespace) {
                    return Err(CmdError::other(
                        "Client names cannot contain spaces, newlines or special characters.",
                    ));
                }
                *caller.name.lock().unwrap() = name.clone();
                Ok(self.ok_message(msg, start))
            }
            "kill" => {
                if msg.args.len() != 3 {
                    return Err(CmdError::InvalidNumArgs);
                }
                let target = &msg.args[2];
                let found = {
                    let conns = self.conns.lock().unwrap();
                    conns
                        .values()
                        .find(|c| c.id.to_string() == *target || c.addr == *target)
                        .cloned()
                };
                match found {
                    Some(client) => {
                        debug!(id = client.id, addr = %client.addr, "client kill");
                        // the connection task writes any pending response
                        // (including this OK when self-killing) before it
                        // notices the flag and closes
                        client.request_kill();
                        Ok(self.ok_message(msg, start))
                    }
                    None => Err(CmdError::other("No such client")),
                }
            }
            _ => Err(CmdError::other(
                "Syntax error, try CLIENT (LIST | KILL | GETNAME | SETNAME)",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kill_sets_flag() {
        let info = ClientInfo {
            id: 1,
            addr: "127.0.0.1:1000".to_string(),
            name: std::sync::Mutex::new(String::new()),
            opened: Instant::now(),
            last: std::sync::Mutex::new(Instant::now()),
            authenticated: AtomicBool::new(false),
            kill: Notify::new(),
            killed: AtomicBool::new(false),
        };
        assert!(!info.killed.load(Ordering::SeqCst));
        info.request_kill();
        assert!(info.killed.load(Ordering::SeqCst));
    }
}

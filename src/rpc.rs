use anyhow::Context as _;
use chrono::{Local, TimeZone as _};
use serde::{Deserialize, Serialize};
use std::io::{BufRead as _, BufReader, Write as _};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::tree::TreeState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    RotateLog { name: String },
    Status { name: String },
    List,
    ServerVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeStatusEntry {
    pub name: String,
    pub state: TreeState,
    pub last_change_unix_seconds: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub statuses: Vec<TreeStatusEntry>,
}

impl Response {
    pub fn ok_message(msg: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: msg.into(),
            statuses: vec![],
        }
    }

    pub fn ok_statuses(statuses: Vec<TreeStatusEntry>) -> Self {
        Self {
            ok: true,
            message: String::new(),
            statuses,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: msg.into(),
            statuses: vec![],
        }
    }

    pub fn render_text(&self) -> String {
        if !self.message.is_empty() && self.statuses.is_empty() {
            return self.message.clone();
        }
        if self.statuses.is_empty() {
            return "(no trees)".to_string();
        }

        let headers = ["tree", "state", "uptime", "last_change"];
        let rows: Vec<[String; 4]> = self
            .statuses
            .iter()
            .map(|s| {
                [
                    s.name.clone(),
                    s.state.to_string(),
                    fmt_uptime_secs(s.uptime_seconds),
                    fmt_unix_seconds(s.last_change_unix_seconds),
                ]
            })
            .collect();

        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.len());
            }
        }

        fn pad(s: &str, width: usize) -> String {
            format!("{s:<width$}")
        }

        let mut out = String::new();
        for (i, h) in headers.iter().enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            out.push_str(&pad(h, widths[i]));
        }
        out.push('\n');
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                if i > 0 {
                    out.push_str("  ");
                }
                out.push_str(&pad(cell, widths[i]));
            }
            out.push('\n');
        }
        out
    }
}

fn fmt_uptime_secs(mut s: u64) -> String {
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

fn fmt_unix_seconds(secs: u64) -> String {
    Local
        .timestamp_opt(secs as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d_%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// One request/response exchange with the daemon. The timeouts bound both
/// directions; the daemon itself never time-limits its side.
pub fn client_call(sock: &Path, req: Request, timeout: Duration) -> anyhow::Result<Response> {
    let stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to pine socket {}: {e}", sock.display())
    })?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut writer = stream.try_clone()?;
    let line = serde_json::to_string(&req)? + "\n";
    writer.write_all(line.as_bytes())?;
    writer.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response =
        serde_json::from_str(resp_line.trim_end()).context("decode daemon response")?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_entry_wire_format() {
        let entry = TreeStatusEntry {
            name: "A".to_string(),
            state: TreeState::Running,
            last_change_unix_seconds: 1_700_000_000,
            uptime_seconds: 42,
        };
        let json = serde_json::to_string(&entry).expect("encode");
        assert!(json.contains("\"state\":\"running\""), "json: {json}");
        assert!(json.contains("\"last_change_unix_seconds\":1700000000"));
        assert!(json.contains("\"uptime_seconds\":42"));
    }

    #[test]
    fn request_wire_format_is_tagged() {
        let json = serde_json::to_string(&Request::Start {
            name: "A".to_string(),
        })
        .expect("encode");
        assert!(json.contains("\"type\":\"Start\""), "json: {json}");
        let back: Request = serde_json::from_str(&json).expect("decode");
        assert!(matches!(back, Request::Start { name } if name == "A"));
    }

    #[test]
    fn render_text_pads_columns() {
        let resp = Response::ok_statuses(vec![
            TreeStatusEntry {
                name: "longish-name".to_string(),
                state: TreeState::Running,
                last_change_unix_seconds: 1_700_000_000,
                uptime_seconds: 3_725,
            },
            TreeStatusEntry {
                name: "b".to_string(),
                state: TreeState::Stopped,
                last_change_unix_seconds: 1_700_000_000,
                uptime_seconds: 0,
            },
        ]);
        let text = resp.render_text();
        assert!(text.contains("longish-name"));
        assert!(text.contains("1h02m"));
        assert!(text.lines().count() == 3, "text:\n{text}");
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(fmt_uptime_secs(9), "9s");
        assert_eq!(fmt_uptime_secs(75), "1m15s");
        assert_eq!(fmt_uptime_secs(3_725), "1h02m");
        assert_eq!(fmt_uptime_secs(180_000), "2d02h");
    }
}

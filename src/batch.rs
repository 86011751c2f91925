//! Composite script protocol
//!
//! Several probes (or several guests) share one remote call. Each part of
//! the script echoes a marker line before its output so the combined stdout
//! can be split again locally:
//!
//! ```text
//! ---CMD:system.uptime---            ---CHILD:42---
//!  10:01:02 up 3 days, ...           <docker ps lines>
//! ---CMD:system.memory---            ---CHILD_END:42---
//! Mem: ...                           ---CHILD:43---
//!                                    CHILD_ERROR
//!                                    ---CHILD_END:43---
//! ```
//!
//! Splitting is pure and never fails; what a missing or broken part means is
//! up to the caller.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::commands::CommandDescriptor;
use crate::node::{GuestType, NodeId};

/// Printed by the batch script when a guest command fails or times out
pub const CHILD_ERROR: &str = "CHILD_ERROR";

static CMD_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"---CMD:([A-Za-z0-9_.\-]+)---").unwrap());

static CHILD_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"---CHILD:(\d+)---").unwrap());

pub fn cmd_marker(key: &str) -> String {
    format!("---CMD:{key}---")
}

pub fn child_marker(id: NodeId) -> String {
    format!("---CHILD:{id}---")
}

pub fn child_end_marker(id: NodeId) -> String {
    format!("---CHILD_END:{id}---")
}

/// One script running every descriptor, each behind its marker
pub fn build_command_batch(commands: &[&CommandDescriptor]) -> String {
    commands
        .iter()
        .map(|c| format!("echo \"{}\"; {} 2>/dev/null", cmd_marker(c.key), c.command_line()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_leading_newline(s: &str) -> &str {
    s.strip_prefix("\r\n")
        .or_else(|| s.strip_prefix('\n'))
        .unwrap_or(s)
}

/// Split `---CMD:<key>---` output into trimmed sections keyed by probe
pub fn parse_command_batch(raw: &str) -> HashMap<String, String> {
    let markers: Vec<_> = CMD_MARKER.captures_iter(raw).collect();
    let mut sections = HashMap::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(raw.len());

        sections.insert(key.as_str().to_string(), raw[whole.end()..end].trim().to_string());
    }

    sections
}

/// A guest to include in a child batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildTarget {
    pub node_id: NodeId,
    pub guest_type: GuestType,
    pub vmid: u32,
}

/// One script polling every guest through its host
///
/// `probe` runs inside each guest via `sh -c '<probe>'` and must not contain
/// single quotes.
pub fn build_child_batch(children: &[ChildTarget], probe: &str, per_child_timeout_secs: u64) -> String {
    children
        .iter()
        .map(|c| {
            format!(
                "echo \"{start}\"; timeout {secs} {prefix} sh -c '{probe}' 2>/dev/null || echo \"{CHILD_ERROR}\"; echo \"{end}\"",
                start = child_marker(c.node_id),
                secs = per_child_timeout_secs,
                prefix = c.guest_type.exec_prefix(c.vmid),
                end = child_end_marker(c.node_id),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why a guest's part of a batch is unusable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentFailure {
    /// No marker for the guest in the output
    Missing,
    /// Started but the end marker never arrived
    Truncated,
    /// The guest command failed or timed out
    GuestError,
    /// `qm guest exec` reported a non-zero exit code
    ExitCode(i64),
}

impl fmt::Display for SegmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentFailure::Missing => write!(f, "no output for guest in batch"),
            SegmentFailure::Truncated => write!(f, "guest output truncated"),
            SegmentFailure::GuestError => write!(f, "command failed or timed out"),
            SegmentFailure::ExitCode(code) => write!(f, "guest command exited with {code}"),
        }
    }
}

/// A guest's slice of the combined output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// Text between the start and end markers, unchanged except for the
    /// newline the marker line leaves behind
    pub payload: String,
    pub terminated: bool,
}

impl Segment {
    /// The script replaced the output with the error sentinel
    pub fn is_error(&self) -> bool {
        self.payload
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .is_some_and(|l| l.trim() == CHILD_ERROR)
    }

    /// Usable payload, with `qm guest exec` JSON envelopes unwrapped
    pub fn body(&self) -> Result<String, SegmentFailure> {
        if !self.terminated {
            return Err(SegmentFailure::Truncated);
        }
        if self.is_error() {
            return Err(SegmentFailure::GuestError);
        }
        unwrap_guest_exec(self.payload.trim())
    }
}

/// `qm guest exec` prints `{"exitcode":0,"exited":1,"out-data":"..."}`
/// instead of the command's output
pub fn unwrap_guest_exec(text: &str) -> Result<String, SegmentFailure> {
    if !text.starts_with('{') {
        return Ok(text.to_string());
    }

    let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(text) else {
        return Ok(text.to_string());
    };

    if !obj.contains_key("exited") && !obj.contains_key("out-data") {
        return Ok(text.to_string());
    }

    let exit = obj.get("exitcode").and_then(|v| v.as_i64()).unwrap_or(0);
    let out = obj
        .get("out-data")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    if exit != 0 && out.is_empty() {
        return Err(SegmentFailure::ExitCode(exit));
    }
    Ok(out)
}

/// Split `---CHILD:<id>---` output into segments keyed by node id
///
/// Segments keep their payload even when the end marker is missing so the
/// caller can decide what a truncated part is worth. A repeated id keeps the
/// first occurrence.
pub fn parse_child_batch(raw: &str) -> BTreeMap<NodeId, Segment> {
    let markers: Vec<_> = CHILD_MARKER.captures_iter(raw).collect();
    let mut segments = BTreeMap::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(id) = id.as_str().parse::<NodeId>() else {
            continue;
        };
        if segments.contains_key(&id) {
            continue;
        }

        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(raw.len());
        let section = &raw[whole.end()..end];

        let segment = match section.find(&child_end_marker(id)) {
            Some(pos) => Segment {
                payload: strip_leading_newline(&section[..pos]).to_string(),
                terminated: true,
            },
            None => Segment {
                payload: strip_leading_newline(section).to_string(),
                terminated: false,
            },
        };

        segments.insert(id, segment);
    }

    segments
}

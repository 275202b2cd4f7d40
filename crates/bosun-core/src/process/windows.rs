//! Windows process enumeration via CIM.
//!
//! Shells out to PowerShell's `Get-CimInstance Win32_Process` and parses
//! the JSON it emits. Compiled on all platforms so the parser stays under
//! test; only `platform_default` wires it up on Windows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use super::{ProcessEnum, ProcessError, ProcessInfo};

const LIST_COMMAND: &str = "Get-CimInstance Win32_Process | \
     Select-Object ProcessId,CommandLine,CreationDate | ConvertTo-Json -Compress";

/// Enumerates processes through `Get-CimInstance Win32_Process`.
#[derive(Debug, Default)]
pub struct WindowsProcessEnum;

impl WindowsProcessEnum {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessEnum for WindowsProcessEnum {
    async fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let output = Command::new("powershell")
            .args(["-NoProfile", "-Command", LIST_COMMAND])
            .output()
            .await
            .map_err(|e| ProcessError::Spawn {
                command: "powershell Get-CimInstance Win32_Process".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ProcessError::Exit {
                command: "Get-CimInstance Win32_Process".into(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        parse_cim_json(&String::from_utf8_lossy(&output.stdout))
    }

    async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output()
            .await
            .map_err(|e| ProcessError::Spawn {
                command: format!("taskkill /PID {pid} /F"),
                source: e,
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // "not found" means the process already exited.
        if stderr.to_ascii_lowercase().contains("not found") {
            return Ok(());
        }
        Err(ProcessError::Exit {
            command: "taskkill".into(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let filter = format!("PID eq {pid}");
        let Ok(output) = Command::new("tasklist")
            .args(["/FI", &filter, "/NH"])
            .output()
            .await
        else {
            return false;
        };
        String::from_utf8_lossy(&output.stdout).contains(&pid.to_string())
    }
}

/// Parse the JSON emitted by `ConvertTo-Json` for Win32_Process.
///
/// A single process serializes as an object, multiple as an array; both
/// forms are accepted. `CreationDate` arrives either as the JSON epoch
/// form `/Date(1700000000000)/` or as a WMI datetime string
/// `20260105101112.000000+000`.
fn parse_cim_json(json: &str) -> Result<Vec<ProcessInfo>, ProcessError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| ProcessError::Parse(format!("invalid CIM JSON: {e}")))?;

    let items: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        obj @ serde_json::Value::Object(_) => vec![obj],
        _ => return Err(ProcessError::Parse("unexpected CIM JSON shape".into())),
    };

    let mut processes = Vec::new();
    for item in items {
        let Some(pid) = item.get("ProcessId").and_then(|v| v.as_u64()) else {
            continue;
        };
        let command_line = item
            .get("CommandLine")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let started_at = item
            .get("CreationDate")
            .and_then(|v| v.as_str())
            .and_then(parse_cim_date);

        processes.push(ProcessInfo {
            pid: pid as u32,
            command_line,
            started_at,
        });
    }

    Ok(processes)
}

/// Parse either CIM date representation into UTC.
fn parse_cim_date(raw: &str) -> Option<DateTime<Utc>> {
    // JSON epoch form: /Date(1700000000000)/
    if let Some(inner) = raw.strip_prefix("/Date(").and_then(|s| s.strip_suffix(")/")) {
        let millis: i64 = inner.parse().ok()?;
        return DateTime::from_timestamp_millis(millis);
    }

    // WMI datetime: yyyymmddHHMMSS.ffffff+UUU (offset in minutes).
    if raw.len() >= 21 {
        let (stamp, offset) = raw.split_at(raw.len() - 4);
        let naive =
            chrono::NaiveDateTime::parse_from_str(&stamp[..14], "%Y%m%d%H%M%S").ok()?;
        let offset_minutes: i32 = offset.parse().ok()?;
        let fixed = chrono::FixedOffset::east_opt(offset_minutes * 60)?;
        return Some(
            naive
                .and_local_timezone(fixed)
                .single()?
                .with_timezone(&Utc),
        );
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_with_epoch_dates() {
        let json = r#"[
            {"ProcessId": 4321, "CommandLine": "git.exe push origin main", "CreationDate": "/Date(1767608400000)/"},
            {"ProcessId": 4322, "CommandLine": null, "CreationDate": null}
        ]"#;
        let procs = parse_cim_json(json).unwrap();
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 4321);
        assert_eq!(procs[0].command_line, "git.exe push origin main");
        assert!(procs[0].started_at.is_some());
        assert_eq!(procs[1].command_line, "");
        assert!(procs[1].started_at.is_none());
    }

    #[test]
    fn parses_single_object() {
        let json = r#"{"ProcessId": 7, "CommandLine": "node monitor.mjs", "CreationDate": "/Date(0)/"}"#;
        let procs = parse_cim_json(json).unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 7);
    }

    #[test]
    fn parses_wmi_datetime() {
        let parsed = parse_cim_date("20260105101112.000000+000").expect("should parse");
        assert_eq!(parsed.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-05 10:11:12");
    }

    #[test]
    fn empty_output_is_no_processes() {
        assert!(parse_cim_json("").unwrap().is_empty());
        assert!(parse_cim_json("  \n").unwrap().is_empty());
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(parse_cim_json("42").is_err());
    }
}

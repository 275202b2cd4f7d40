//! `bosun lock` -- inspect or release the singleton lock.

use std::path::Path;

use anyhow::{Result, bail};

use bosun_core::lock::{LOCK_FILE_NAME, LockFilePayload};
use bosun_core::process::classify::{CmdlineClass, classify};
use bosun_core::process::platform_default;

pub async fn run(config_dir: &Path, status: bool, release: bool) -> Result<()> {
    if status == release {
        bail!("pass exactly one of --status or --release");
    }

    let lock_path = config_dir.join(LOCK_FILE_NAME);

    if status {
        let contents = match std::fs::read_to_string(&lock_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                println!("no lock at {}", lock_path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(payload) = LockFilePayload::parse(&contents) else {
            println!("corrupt lock file at {}", lock_path.display());
            return Ok(());
        };

        let process_enum = platform_default();
        let alive = process_enum.is_alive(payload.pid).await;
        let class = if alive {
            process_enum
                .list()
                .await
                .ok()
                .and_then(|list| list.into_iter().find(|p| p.pid == payload.pid))
                .map(|p| classify(&p.command_line))
                .unwrap_or(CmdlineClass::Unknown)
        } else {
            CmdlineClass::Unknown
        };

        println!("lock file: {}", lock_path.display());
        println!("  pid: {} ({})", payload.pid, if alive { "alive" } else { "dead" });
        if alive {
            println!(
                "  classification: {}",
                match class {
                    CmdlineClass::Monitor => "monitor",
                    CmdlineClass::Other => "other (likely PID reuse)",
                    CmdlineClass::Unknown => "unknown",
                }
            );
        }
        if let Some(started) = &payload.started_at {
            println!("  started_at: {started}");
        }
        if let Some(token) = &payload.lock_token {
            println!("  lock_token: {token}");
        } else {
            println!("  lock_token: (legacy lock file)");
        }
        return Ok(());
    }

    // --release: remove the file regardless of owner. This is the
    // operator's escape hatch after a crash; a live owner is reported
    // first so the operator can reconsider.
    match std::fs::read_to_string(&lock_path) {
        Ok(contents) => {
            if let Some(payload) = LockFilePayload::parse(&contents) {
                let process_enum = platform_default();
                if process_enum.is_alive(payload.pid).await {
                    tracing::warn!(
                        pid = payload.pid,
                        "releasing a lock whose owner is still alive"
                    );
                }
            }
            std::fs::remove_file(&lock_path)?;
            println!("released {}", lock_path.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("no lock at {}", lock_path.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

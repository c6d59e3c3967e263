//! Crash dumps for invariant violations.
//!
//! A kind-4 fault writes `crash/crash.json` under the artifacts directory
//! with the faulting module, message, and a state snapshot, then requests
//! orderly shutdown. The dump is the post-mortem entry point, so writing it
//! must not itself depend on any running component.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub fn write_crash_dump(
    artifacts_dir: &Path,
    module: &str,
    message: &str,
    snapshot: &serde_json::Value,
    t_ns: u64,
) -> Result<PathBuf> {
    let crash_dir = artifacts_dir.join("crash");
    fs::create_dir_all(&crash_dir)?;
    let path = crash_dir.join("crash.json");
    let record = serde_json::json!({
        "t_ns": t_ns,
        "module": module,
        "message": message,
        "state": snapshot,
    });
    fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    Ok(path)
}

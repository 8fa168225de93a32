//! On-disk capture of received webhooks.
//!
//! Each capture is a `<event>-<timestamp>.json` file with the raw body and a
//! sibling `.sh` script that re-sends it with `curl`. The relay consumer and
//! the replayer write the same layout.

use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::deliver::DecodedWebhook;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M.%S%.3f";
const DEFAULT_LOCAL_TARGET: &str = "http://localhost:8080";

/// Paths written for one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub payload: PathBuf,
    pub script: PathBuf,
}

/// Writes captures into one directory.
#[derive(Debug, Clone)]
pub struct CaptureDir {
    dir: PathBuf,
}

impl CaptureDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, hook: &DecodedWebhook, target_url: &str) -> io::Result<Captured> {
        self.save_at(hook, target_url, Utc::now())
    }

    pub fn save_at(
        &self,
        hook: &DecodedWebhook,
        target_url: &str,
        at: DateTime<Utc>,
    ) -> io::Result<Captured> {
        std::fs::create_dir_all(&self.dir)?;

        let event = hook
            .event_type()
            .map(|e| sanitize(&e))
            .unwrap_or_else(|| "event".to_string());
        let stem = format!("{event}-{}", at.format(TIMESTAMP_FORMAT));

        let payload = self.dir.join(format!("{stem}.json"));
        let script = self.dir.join(format!("{stem}.sh"));

        std::fs::write(&payload, &hook.body)?;
        write_script(&script, &format!("{stem}.json"), hook, target_url)?;

        info!(path = %payload.display(), "saved webhook payload");
        Ok(Captured { payload, script })
    }
}

/// The replay script for a captured payload.
pub fn replay_script(payload_file: &str, hook: &DecodedWebhook, target_url: &str) -> String {
    let mut script = String::new();
    script.push_str("#!/usr/bin/env bash\n");
    script.push_str("# Replay a captured webhook.\n");
    script.push_str("#   -l      send to ");
    script.push_str(DEFAULT_LOCAL_TARGET);
    script.push_str("\n#   <url>   send to <url>\n");
    script.push_str("set -euo pipefail\n");
    script.push_str("cd \"$(dirname \"$0\")\"\n\n");
    let _ = writeln!(script, "targetURL={}", shell_quote(target_url));
    script.push_str("if [[ ${1:-} == -l ]]; then\n");
    let _ = writeln!(script, "  targetURL={DEFAULT_LOCAL_TARGET}");
    script.push_str("elif [[ -n ${1:-} ]]; then\n  targetURL=$1\nfi\n\n");

    script.push_str("curl -sSi -X POST \\\n");
    for (name, value) in &hook.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("host") {
            continue;
        }
        let _ = writeln!(script, "  -H {} \\", shell_quote(&format!("{name}: {value}")));
    }
    let _ = writeln!(script, "  --data-binary @{} \\", shell_quote(payload_file));
    script.push_str("  \"${targetURL}\"\n");
    script
}

fn write_script(
    path: &Path,
    payload_file: &str,
    hook: &DecodedWebhook,
    target_url: &str,
) -> io::Result<()> {
    std::fs::write(path, replay_script(payload_file, hook, target_url))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn sanitize(event: &str) -> String {
    event
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn hook() -> DecodedWebhook {
        DecodedWebhook::new(
            vec![
                ("Content-Type".into(), "application/json".into()),
                ("X-GitHub-Event".into(), "push".into()),
                ("X-Note".into(), "it's".into()),
            ],
            b"{\"a\":1}".to_vec(),
        )
    }

    #[test]
    fn writes_payload_and_script() {
        let dir = tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let captured = CaptureDir::new(dir.path())
            .save_at(&hook(), "http://localhost:3000/hook", at)
            .unwrap();

        assert_eq!(
            captured.payload.file_name().unwrap(),
            "push-2024-03-05T07.08.09.000.json"
        );
        assert_eq!(std::fs::read(&captured.payload).unwrap(), b"{\"a\":1}");

        let script = std::fs::read_to_string(&captured.script).unwrap();
        assert!(script.starts_with("#!/usr/bin/env bash"));
        assert!(script.contains("targetURL='http://localhost:3000/hook'"));
        assert!(script.contains("-H 'X-GitHub-Event: push'"));
        assert!(script.contains("-H 'X-Note: it'\\''s'"));
        assert!(script.contains("--data-binary @'push-2024-03-05T07.08.09.000.json'"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&captured.script).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn unknown_event_and_unsafe_names() {
        let dir = tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let plain = DecodedWebhook::new(vec![], b"raw".to_vec());
        let c = CaptureDir::new(dir.path()).save_at(&plain, "http://t", at).unwrap();
        assert!(c.payload.ends_with("event-2024-01-01T00.00.00.000.json"));

        let bitbucket = DecodedWebhook::new(
            vec![("X-Event-Key".into(), "repo:push/../x".into())],
            b"{}".to_vec(),
        );
        let c = CaptureDir::new(dir.path()).save_at(&bitbucket, "http://t", at).unwrap();
        assert_eq!(c.payload.parent().unwrap(), dir.path());
        assert!(c.payload.ends_with("repo_push____x-2024-01-01T00.00.00.000.json"));
    }
}

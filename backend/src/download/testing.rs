//! Shell-script stand-ins for yt-dlp used by the download tests.
//!
//! The URL path selects the behaviour:
//! `/ok`, `/fail`, `/silent-fail`, `/missing`, `/slow`, `/stubborn` and
//! `/gate/<name>`, which blocks until [`TestTools::open`] or
//! [`TestTools::fail`] is called for `<name>`.

use crate::download::invocation::{InvocationBuilder, InvocationError, InvocationRequest};
use crate::process::CommandSpec;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const PROGRESS_25: &str = "[download]  25.0% of 1.00MiB at 1.00MiB/s ETA 00:03";
const PROGRESS_10: &str = "[download]  10.0% of 1.00MiB at 1.00MiB/s ETA 00:03";
const PROGRESS_50: &str = "[download]  50.0% of 1.00MiB at 1.00MiB/s ETA 00:01";
const PROGRESS_DONE: &str = "[download] 100% of 1.00MiB in 00:00:01 at 1.00MiB/s";

/// Temporary gate directory shared by the scripts and the test
pub struct TestTools {
    dir: TempDir,
}

impl TestTools {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Let `/gate/<name>` finish successfully
    pub fn open(&self, name: &str) {
        std::fs::write(self.dir.path().join(name), b"").expect("write gate");
    }

    /// Let `/gate/<name>` exit with an error
    pub fn fail(&self, name: &str) {
        std::fs::write(self.dir.path().join(name), b"fail").expect("write gate");
    }
}

pub struct ScriptedTools {
    gates: PathBuf,
}

impl ScriptedTools {
    pub fn new(gates: &Path) -> Self {
        Self {
            gates: gates.to_path_buf(),
        }
    }
}

fn sh(script: String) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

impl InvocationBuilder for ScriptedTools {
    fn build(&self, request: &InvocationRequest<'_>) -> Result<CommandSpec, InvocationError> {
        let path = url::Url::parse(request.url)
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        let out = request.output_dir.display();

        let spec = match path.as_str() {
            "/ok" => sh(format!(
                "echo '[download] Destination: {out}/ok.mp4'; \
                 echo '{PROGRESS_25}'; echo '{PROGRESS_10}'; echo '{PROGRESS_50}'; \
                 echo '{PROGRESS_DONE}'"
            )),
            "/fail" => sh(
                "echo '[generic] probing'; \
                 echo 'ERROR: [generic] Unsupported URL: mock' >&2; exit 1"
                    .to_string(),
            ),
            "/silent-fail" => sh("exit 2".to_string()),
            "/missing" => CommandSpec::new("/nonexistent/media-downloader-test/yt-dlp"),
            "/slow" => sh(format!(
                "echo '[download] Destination: {out}/slow.mp4'; echo '{PROGRESS_10}'; exec sleep 30"
            )),
            "/stubborn" => sh(format!(
                "trap '' TERM; echo '{PROGRESS_10}'; while :; do sleep 0.1; done"
            )),
            gate if gate.starts_with("/gate/") => {
                let name = &gate["/gate/".len()..];
                let file = self.gates.join(name);
                let file = file.display();
                sh(format!(
                    "echo '[download] Destination: {out}/{name}.mp4'; echo '{PROGRESS_10}'; \
                     while [ ! -e '{file}' ]; do sleep 0.05; done; \
                     if [ -s '{file}' ]; then echo 'ERROR: gate {name} failed' >&2; exit 1; fi; \
                     echo '{PROGRESS_DONE}'"
                ))
            }
            _ => sh("exit 0".to_string()),
        };

        Ok(spec)
    }
}

/// Poll `check` until it yields a value, failing the test after ten seconds
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll `condition` until it holds, failing the test after ten seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    eventually(|| condition().then_some(())).await
}

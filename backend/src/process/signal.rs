//! Platform signal delivery for supervised process trees

use std::io;
use std::process::Stdio;
use tokio::process::Command;

/// Ask the process tree rooted at `pid` to stop.
pub(super) async fn request_stop(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        // Children are spawned as group leaders, so `-pid` addresses the whole tree.
        run_quiet("kill", &["-s", "TERM", "--", &format!("-{pid}")]).await
    }

    #[cfg(windows)]
    {
        run_quiet("taskkill", &["/PID", &pid.to_string(), "/T"]).await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(io::Error::new(io::ErrorKind::Unsupported, "graceful stop unsupported"))
    }
}

/// Forcefully kill the process tree rooted at `pid`.
pub(super) async fn force_kill(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        run_quiet("kill", &["-s", "KILL", "--", &format!("-{pid}")]).await
    }

    #[cfg(windows)]
    {
        run_quiet("taskkill", &["/F", "/T", "/PID", &pid.to_string()]).await
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        Err(io::Error::new(io::ErrorKind::Unsupported, "tree kill unsupported"))
    }
}

#[cfg(any(unix, windows))]
async fn run_quiet(program: &str, args: &[&str]) -> io::Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{program} exited with {status}"),
        ))
    }
}

use regex::Regex;
use std::collections::HashMap;
use std::env;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

// How long to wait for capture threads once the process group is gone
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("static pattern"))
}

/// Expand `${VAR}` from the environment; unknown variables expand to "".
pub fn expand_vars(s: &str) -> String {
    if !s.contains("${") {
        return s.to_string();
    }
    let env_map: HashMap<String, String> = env::vars().collect();
    var_pattern()
        .replace_all(s, |caps: &regex::Captures| {
            env_map.get(&caps[1]).cloned().unwrap_or_default()
        })
        .to_string()
}

/// Build a `Command` from a command vector and optional working directory.
/// The child gets its own process group so a timeout can take down the whole tree.
pub fn build_command(cmd: &[String], cwd: Option<&str>) -> io::Result<Command> {
    let parts: Vec<String> = cmd.iter().map(|p| expand_vars(p)).collect();
    let Some((program, args)) = parts.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let mut command = Command::new(program);
    command.args(args).env("CHI_MONITOR", "1");
    if let Some(dir) = cwd.map(expand_vars).filter(|d| !d.trim().is_empty()) {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    Ok(command)
}

/// Kill a child and everything in its process group, then reap it.
pub fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            // SAFETY: plain syscall on a pid we spawned as a group leader
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn display_cmd(cmd: &[String]) -> String {
    shlex::try_join(cmd.iter().map(|s| s.as_str())).unwrap_or_else(|_| cmd.join(" "))
}

#[derive(Debug)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub overflowed: bool,
}

// Keep at most `cap` bytes, drain the rest so the child never blocks on a full pipe
fn spawn_capture<R: Read + Send + 'static>(mut reader: R, cap: usize) -> JoinHandle<Captured> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = (&mut reader).take(cap as u64).read_to_end(&mut bytes);
        let overflowed = io::copy(&mut reader, &mut io::sink())
            .map(|n| n > 0)
            .unwrap_or(false);
        Captured { bytes, overflowed }
    })
}

/// Read `reader` line by line until EOF, invoking `on_line` with each line
/// (lossily decoded, line terminator stripped).
pub fn spawn_line_reader<R, F>(reader: R, mut on_line: F) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    on_line(text.trim_end_matches(['\r', '\n']).to_string());
                }
            }
        }
    })
}

#[derive(Debug)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Exited(CommandOutput),
    TimedOut { elapsed: Duration },
}

/// Run a command to completion with a hard timeout and bounded capture.
/// On timeout the process group is killed before returning.
pub fn run_bounded(
    cmd: &[String],
    cwd: Option<&str>,
    timeout: Duration,
    max_output_bytes: usize,
) -> io::Result<RunOutcome> {
    let mut command = build_command(cmd, cwd)?;
    let started = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let out = child.stdout.take().map(|s| spawn_capture(s, max_output_bytes));
    let err = child.stderr.take().map(|s| spawn_capture(s, max_output_bytes));

    let status = match child.wait_timeout(timeout) {
        Ok(status) => status,
        Err(e) => {
            terminate(&mut child);
            return Err(e);
        }
    };
    let Some(status) = status else {
        terminate(&mut child);
        join_capture(out);
        join_capture(err);
        return Ok(RunOutcome::TimedOut {
            elapsed: started.elapsed(),
        });
    };

    // A background process can keep the pipes open after the direct child exits
    let deadline = started + timeout;
    if !(finished_by(&out, deadline) && finished_by(&err, deadline)) {
        terminate(&mut child);
        join_capture(out);
        join_capture(err);
        return Ok(RunOutcome::TimedOut {
            elapsed: started.elapsed(),
        });
    }

    Ok(RunOutcome::Exited(CommandOutput {
        code: status.code(),
        stdout: join_capture(out),
        stderr: join_capture(err),
    }))
}

fn finished_by<T>(handle: &Option<JoinHandle<T>>, deadline: Instant) -> bool {
    let Some(h) = handle else {
        return true;
    };
    while !h.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

// Join a capture thread, giving up after a short grace so a pipe held by a
// process outside the group cannot stall the caller
fn join_capture(handle: Option<JoinHandle<Captured>>) -> Captured {
    let empty = Captured {
        bytes: Vec::new(),
        overflowed: false,
    };
    if !finished_by(&handle, Instant::now() + CAPTURE_GRACE) {
        return empty;
    }
    handle.and_then(|h| h.join().ok()).unwrap_or(empty)
}

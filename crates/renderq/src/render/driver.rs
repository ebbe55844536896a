//! Drives one renderer subprocess invocation to a single terminal outcome.
//!
//! The subprocess's stdout and stderr are pumped into a line channel by
//! reader threads; the driver polls (lines, child liveness, cancellation
//! flag) at a bounded interval so a long render never blocks the worker's
//! ability to observe a cancellation request. No retries happen here.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::config::FarmConfig;
use crate::error::RenderError;
use crate::render::command::CommandSpec;
use crate::render::progress::{
    self, frame_percent, is_device_unavailable, still_percent, DiagnosticKind, ProgressMarker,
};

/// Cooperative cancellation flag shared between the caller and the
/// worker executing the job. Once set it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Human-readable failure cause plus the raw diagnostic tail.
#[derive(Debug, Clone)]
pub struct RenderDiagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub tail: Vec<String>,
}

impl RenderDiagnostic {
    /// Formats the diagnostic for a job's error detail field.
    pub fn detail(&self) -> String {
        if self.tail.is_empty() {
            format!("{}: {}", self.kind, self.message)
        } else {
            format!("{}: {}\n{}", self.kind, self.message, self.tail.join("\n"))
        }
    }
}

/// Exactly one outcome per invocation.
#[derive(Debug)]
pub enum TerminalOutcome {
    Succeeded(Vec<PathBuf>),
    Failed(RenderDiagnostic),
    Cancelled,
}

/// Progress as observed from the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressObservation {
    pub percent: u8,
    /// `(current_frame, total_frames)` position pair for animations.
    pub frame: Option<(u32, u32)>,
}

pub struct RenderDriver {
    poll_interval: Duration,
    kill_grace: Duration,
    tail_lines: usize,
}

impl RenderDriver {
    pub fn new(poll_interval: Duration, kill_grace: Duration, tail_lines: usize) -> Self {
        Self {
            poll_interval,
            kill_grace,
            tail_lines,
        }
    }

    pub fn from_config(config: &FarmConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.kill_grace_ms),
            config.diagnostic_tail_lines,
        )
    }

    /// Launches the renderer and pumps it to a terminal outcome.
    ///
    /// `on_progress` is invoked with non-decreasing percentages; delivery
    /// of every intermediate value is not guaranteed.
    pub fn run(
        &self,
        spec: &CommandSpec,
        on_progress: &dyn Fn(ProgressObservation),
        cancel: &CancelToken,
    ) -> Result<TerminalOutcome, RenderError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RenderError::Spawn {
                binary: spec.program.clone(),
                source: e,
            })?;

        debug!(
            "Spawned renderer pid={} for output dir {}",
            child.id(),
            spec.output_dir.display()
        );

        let (line_tx, line_rx) = unbounded::<String>();
        spawn_reader(child.stdout.take(), line_tx.clone());
        spawn_reader(child.stderr.take(), line_tx);

        let mut state = StreamState::new(spec, self.tail_lines);

        let status = loop {
            if cancel.is_cancelled() {
                self.terminate(&mut child);
                return Ok(TerminalOutcome::Cancelled);
            }

            match line_rx.recv_timeout(self.poll_interval) {
                Ok(line) => {
                    state.observe(&line, on_progress);
                    // Drain whatever else is already buffered.
                    while let Ok(line) = line_rx.try_recv() {
                        state.observe(&line, on_progress);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Both streams closed; the process is exiting.
                    match self.await_exit(&mut child, cancel) {
                        Some(status) => break status,
                        None => return Ok(TerminalOutcome::Cancelled),
                    }
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    // Pick up lines that raced the exit.
                    while let Ok(line) = line_rx.recv_timeout(Duration::from_millis(50)) {
                        state.observe(&line, on_progress);
                    }
                    break status;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("try_wait on renderer failed: {}", e);
                    self.terminate(&mut child);
                    return Ok(TerminalOutcome::Failed(RenderDiagnostic {
                        kind: DiagnosticKind::RenderProcessFailed,
                        message: format!("failed to poll renderer process: {}", e),
                        tail: state.tail(),
                    }));
                }
            }
        };

        Ok(state.classify(status.success(), status.code()))
    }

    /// Graceful stop, then forced kill after the grace period.
    fn terminate(&self, child: &mut Child) {
        let pid = child.id();

        #[cfg(unix)]
        {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status();
        }

        let deadline = Instant::now() + self.kill_grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(self.poll_interval.min(Duration::from_millis(100))),
                Err(_) => break,
            }
        }

        debug!("Renderer pid={} did not stop in grace period, killing", pid);
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Waits for exit after the output streams closed, still honoring
    /// cancellation. Returns `None` when cancelled.
    fn await_exit(&self, child: &mut Child, cancel: &CancelToken) -> Option<std::process::ExitStatus> {
        loop {
            if cancel.is_cancelled() {
                self.terminate(child);
                return None;
            }
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => std::thread::sleep(self.poll_interval),
                Err(_) => {
                    let _ = child.kill();
                    return child.wait().ok();
                }
            }
        }
    }
}

fn spawn_reader<R: std::io::Read + Send + 'static>(stream: Option<R>, sender: Sender<String>) {
    let Some(stream) = stream else { return };
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Accumulated interpretation of the output stream for one invocation.
struct StreamState<'a> {
    spec: &'a CommandSpec,
    tail: VecDeque<String>,
    tail_limit: usize,
    saved_paths: Vec<PathBuf>,
    device_unavailable: bool,
    last_percent: u8,
    last_frame: Option<(u32, u32)>,
}

impl<'a> StreamState<'a> {
    fn new(spec: &'a CommandSpec, tail_limit: usize) -> Self {
        Self {
            spec,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
            saved_paths: Vec::new(),
            device_unavailable: false,
            last_percent: 0,
            last_frame: None,
        }
    }

    fn observe(&mut self, line: &str, on_progress: &dyn Fn(ProgressObservation)) {
        if self.tail.len() == self.tail_limit {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        if is_device_unavailable(line) {
            self.device_unavailable = true;
        }

        let animation = self.spec.params.format.is_animation();
        let observation = match progress::parse_line(line) {
            Some(ProgressMarker::Saved(path)) => {
                self.saved_paths.push(path);
                None
            }
            Some(ProgressMarker::Sample { current, total }) if !animation => {
                Some(ProgressObservation {
                    percent: still_percent(current, total),
                    frame: None,
                })
            }
            Some(ProgressMarker::Frame(label)) if animation => {
                self.spec.params.frame_range.and_then(|range| {
                    let total = range.total_frames();
                    range.position_of(label).map(|position| ProgressObservation {
                        percent: frame_percent(position, total),
                        frame: Some((position, total)),
                    })
                })
            }
            _ => None,
        };

        if let Some(obs) = observation {
            // Progress never regresses; equal percentages are coalesced
            // unless the frame pair advanced.
            let advanced =
                obs.percent > self.last_percent || (obs.frame.is_some() && obs.frame != self.last_frame);
            if obs.percent >= self.last_percent && advanced {
                self.last_percent = obs.percent;
                if obs.frame.is_some() {
                    self.last_frame = obs.frame;
                }
                on_progress(obs);
            }
        }
    }

    fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    /// Maps (exit status, observed markers) to the terminal outcome.
    fn classify(self, success: bool, code: Option<i32>) -> TerminalOutcome {
        if success {
            let paths = if self.saved_paths.is_empty() {
                scan_output_dir(&self.spec.output_dir)
            } else {
                self.saved_paths.clone()
            };

            if paths.is_empty() {
                return TerminalOutcome::Failed(RenderDiagnostic {
                    kind: DiagnosticKind::RenderProcessFailed,
                    message: "renderer exited cleanly but produced no output".to_string(),
                    tail: self.tail(),
                });
            }
            return TerminalOutcome::Succeeded(paths);
        }

        let kind = if self.device_unavailable {
            DiagnosticKind::DeviceUnavailable
        } else {
            DiagnosticKind::RenderProcessFailed
        };

        let message = match code {
            Some(code) => format!("renderer exited with code {}", code),
            None => "renderer terminated by signal".to_string(),
        };

        TerminalOutcome::Failed(RenderDiagnostic {
            kind,
            message,
            tail: self.tail(),
        })
    }
}

/// Fallback when no saved-file markers were seen: everything non-hidden
/// in the output directory, in lexicographic order.
fn scan_output_dir(dir: &std::path::Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && !p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(true)
        })
        .collect();
    paths.sort();
    paths
}

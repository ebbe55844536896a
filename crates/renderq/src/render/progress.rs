//! Tolerant parsing of the renderer's line-oriented output stream.
//!
//! The renderer's progress grammar is loosely structured and varies by
//! format, so parsing is pattern-based: lines that match a known marker
//! are mapped, everything else is silently skipped.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A recognized marker in the renderer's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressMarker {
    /// `Fra:<label>` — the renderer is working on this frame label.
    Frame(i64),
    /// `Sample <n>/<m>` — sampling progress within a single frame.
    Sample { current: u32, total: u32 },
    /// `Saved: '<path>'` — an output file was written.
    Saved(PathBuf),
}

/// Classification of a job failure, carried in the job's error detail so
/// callers can distinguish retry-worthy causes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    DeviceUnavailable,
    RenderProcessFailed,
    PackagingFailed,
    Orphaned,
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticKind::DeviceUnavailable => write!(f, "device_unavailable"),
            DiagnosticKind::RenderProcessFailed => write!(f, "render_process_failed"),
            DiagnosticKind::PackagingFailed => write!(f, "packaging_failed"),
            DiagnosticKind::Orphaned => write!(f, "orphaned"),
        }
    }
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Fra:(\d+)").unwrap())
}

fn sample_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Sample (\d+)\s*/\s*(\d+)").unwrap())
}

fn saved_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Saved: '([^']+)'").unwrap())
}

fn device_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)no (cuda|optix|metal|compatible gpu) devices? found|device not available|failed to init(ialize)? device",
        )
        .unwrap()
    })
}

/// Parses one output line into a marker, or `None` for anything
/// unrecognized. Saved markers win over frame markers on the same line
/// (the renderer prints `Fra:` prefixes on most lines).
pub fn parse_line(line: &str) -> Option<ProgressMarker> {
    if let Some(caps) = saved_re().captures(line) {
        return Some(ProgressMarker::Saved(PathBuf::from(&caps[1])));
    }

    if let Some(caps) = sample_re().captures(line) {
        let current: u32 = caps[1].parse().ok()?;
        let total: u32 = caps[2].parse().ok()?;
        if total == 0 {
            return None;
        }
        return Some(ProgressMarker::Sample { current, total });
    }

    if let Some(caps) = frame_re().captures(line) {
        let label: i64 = caps[1].parse().ok()?;
        return Some(ProgressMarker::Frame(label));
    }

    None
}

/// Whether a line indicates the requested device backend is missing,
/// which callers report distinctly from generic render failure.
pub fn is_device_unavailable(line: &str) -> bool {
    device_re().is_match(line)
}

/// Progress percentage for a still: `round(sample / total * 100)`.
pub fn still_percent(current: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (current.min(total) as f64 / total as f64) * 100.0;
    pct.round() as u8
}

/// Progress percentage for an animation: `round(position / total * 100)`
/// where `position` is 1-based within the requested range.
pub fn frame_percent(position: u32, total_frames: u32) -> u8 {
    still_percent(position, total_frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_marker() {
        let line = "Fra:123 Mem:64.21M (Peak 98.11M) | Time:00:01.87 | Rendering";
        assert_eq!(parse_line(line), Some(ProgressMarker::Frame(123)));
    }

    #[test]
    fn test_parse_sample_marker() {
        let line = "Fra:1 Mem:64.21M | Sample 32/128";
        // Sample wins over the Fra: prefix.
        assert_eq!(
            parse_line(line),
            Some(ProgressMarker::Sample {
                current: 32,
                total: 128
            })
        );
    }

    #[test]
    fn test_parse_saved_marker() {
        let line = "Saved: '/rendered/job-1/render.png'";
        assert_eq!(
            parse_line(line),
            Some(ProgressMarker::Saved(PathBuf::from(
                "/rendered/job-1/render.png"
            )))
        );
    }

    #[test]
    fn test_saved_wins_over_frame_prefix() {
        let line = "Fra:4 Saved: '/rendered/job/frame_0004.png' Time: 00:02.11";
        assert_eq!(
            parse_line(line),
            Some(ProgressMarker::Saved(PathBuf::from(
                "/rendered/job/frame_0004.png"
            )))
        );
    }

    #[test]
    fn test_unrecognized_lines_are_skipped() {
        assert_eq!(parse_line("Blender 5.0.0 (hash abc123)"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Compositing | Tile 1-4"), None);
    }

    #[test]
    fn test_zero_total_samples_is_skipped() {
        assert_eq!(parse_line("Sample 3/0"), None);
    }

    #[test]
    fn test_device_unavailable_patterns() {
        assert!(is_device_unavailable("WARNING: No CUDA devices found!"));
        assert!(is_device_unavailable("Error: device not available"));
        assert!(is_device_unavailable("Failed to initialize device OPTIX"));
        assert!(!is_device_unavailable("GPU rendering enabled successfully"));
    }

    #[test]
    fn test_still_percent_rounding() {
        assert_eq!(still_percent(0, 10), 0);
        assert_eq!(still_percent(1, 3), 33);
        assert_eq!(still_percent(2, 3), 67);
        assert_eq!(still_percent(10, 10), 100);
        // Clamped when the renderer over-reports.
        assert_eq!(still_percent(12, 10), 100);
        assert_eq!(still_percent(5, 0), 0);
    }

    #[test]
    fn test_frame_percent_uses_position_not_label() {
        // Range 10..=14: frame label 12 is position 3 of 5.
        assert_eq!(frame_percent(3, 5), 60);
        assert_eq!(frame_percent(5, 5), 100);
    }
}

//! Generated shell scripts standing in for the headless renderer.
//!
//! Each script logs its full argv to an invocation log (one line per
//! run) and emits Blender-style `Fra:` / `Sample n/m` / `Saved:` lines.

use std::path::{Path, PathBuf};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("failed to write script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("script permissions");
    path
}

/// Argument scanner shared by the scripts: fills `$out`, `$start`,
/// `$end` from the argv.
const ARG_SCAN: &str = r#"out=''; start=''; end=''; prev=''
for arg in "$@"; do
  case "$prev" in
    --output) out="$arg";;
    --frame-start) start="$arg";;
    --frame-end) end="$arg";;
  esac
  prev="$arg"
done"#;

/// Renders a still over four samples and saves the requested output.
pub fn still_renderer(dir: &Path, invocation_log: &Path) -> PathBuf {
    let body = format!(
        "echo \"$@\" >> '{log}'\n{scan}\n\
         echo 'Fra:1 Mem:12.3M | Scene, ViewLayer'\n\
         echo 'Fra:1 | Sample 1/4'\n\
         echo 'Fra:1 | Sample 2/4'\n\
         echo 'Fra:1 | Sample 4/4'\n\
         touch \"$out\"\n\
         echo \"Saved: '$out'\"",
        log = invocation_log.display(),
        scan = ARG_SCAN
    );
    write_script(dir, "still-renderer.sh", &body)
}

/// Renders one frame file per label in the requested range.
pub fn animation_renderer(dir: &Path, invocation_log: &Path) -> PathBuf {
    let body = format!(
        "echo \"$@\" >> '{log}'\n{scan}\n\
         outdir=$(dirname \"$out\")\n\
         i=$start\n\
         while [ \"$i\" -le \"$end\" ]; do\n\
           echo \"Fra:$i Mem:14.1M | Rendering\"\n\
           f=$(printf '%s/frame_%04d.png' \"$outdir\" \"$i\")\n\
           touch \"$f\"\n\
           echo \"Saved: '$f'\"\n\
           i=$((i+1))\n\
         done",
        log = invocation_log.display(),
        scan = ARG_SCAN
    );
    write_script(dir, "animation-renderer.sh", &body)
}

/// Fails immediately with a missing-GPU complaint.
pub fn gpu_missing_renderer(dir: &Path, invocation_log: &Path) -> PathBuf {
    let body = format!(
        "echo \"$@\" >> '{log}'\n\
         echo 'WARNING: No CUDA devices found!' >&2\n\
         exit 1",
        log = invocation_log.display()
    );
    write_script(dir, "gpu-missing-renderer.sh", &body)
}

/// Prints one frame marker and then hangs well past any test timeout.
pub fn hanging_renderer(dir: &Path, invocation_log: &Path) -> PathBuf {
    let body = format!(
        "echo \"$@\" >> '{log}'\n\
         echo 'Fra:1 Mem:9.9M | Rendering'\n\
         sleep 60",
        log = invocation_log.display()
    );
    write_script(dir, "hanging-renderer.sh", &body)
}

/// Number of recorded renderer invocations.
pub fn invocation_count(invocation_log: &Path) -> usize {
    std::fs::read_to_string(invocation_log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

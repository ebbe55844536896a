//! Builds the renderer subprocess invocation from job parameters.
//!
//! Pure translation: no filesystem access, no device probing. The caller
//! decides the device backend; the builder never downgrades on its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Output format requested for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    Png,
    Jpeg,
    #[serde(rename = "OPEN_EXR")]
    OpenExr,
    /// Animation over a frame range. The renderer may mux a single video
    /// or emit per-frame files depending on the scene's own settings.
    Ffmpeg,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::OpenExr => "exr",
            OutputFormat::Ffmpeg => "mp4",
        }
    }

    /// The format name as the renderer CLI expects it.
    pub fn cli_name(&self) -> &'static str {
        match self {
            OutputFormat::Png => "PNG",
            OutputFormat::Jpeg => "JPEG",
            OutputFormat::OpenExr => "OPEN_EXR",
            OutputFormat::Ffmpeg => "FFMPEG",
        }
    }

    pub fn is_animation(&self) -> bool {
        matches!(self, OutputFormat::Ffmpeg)
    }

    /// Inverse of [`cli_name`](Self::cli_name), used when rehydrating
    /// persisted records.
    pub fn from_cli_name(name: &str) -> Option<Self> {
        match name {
            "PNG" => Some(OutputFormat::Png),
            "JPEG" => Some(OutputFormat::Jpeg),
            "OPEN_EXR" => Some(OutputFormat::OpenExr),
            "FFMPEG" => Some(OutputFormat::Ffmpeg),
            _ => None,
        }
    }
}

/// Rendering acceleration mode requested for a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBackend {
    Cuda,
    Optix,
    Metal,
    Cpu,
}

impl DeviceBackend {
    pub fn is_gpu(&self) -> bool {
        !matches!(self, DeviceBackend::Cpu)
    }

    /// The `--gpu-type` argument value. CPU has none.
    pub fn gpu_type_arg(&self) -> Option<&'static str> {
        match self {
            DeviceBackend::Cuda => Some("CUDA"),
            DeviceBackend::Optix => Some("OPTIX"),
            DeviceBackend::Metal => Some("METAL"),
            DeviceBackend::Cpu => None,
        }
    }
}

impl std::str::FromStr for DeviceBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cuda" => Ok(DeviceBackend::Cuda),
            "optix" => Ok(DeviceBackend::Optix),
            "metal" => Ok(DeviceBackend::Metal),
            "cpu" => Ok(DeviceBackend::Cpu),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for DeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceBackend::Cuda => write!(f, "cuda"),
            DeviceBackend::Optix => write!(f, "optix"),
            DeviceBackend::Metal => write!(f, "metal"),
            DeviceBackend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Inclusive frame range for animation jobs.
///
/// Frame labels are scene-defined and may not start at 1; progress is
/// computed from a frame's position within this range, not its label.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
}

impl FrameRange {
    pub fn total_frames(&self) -> u32 {
        (self.end - self.start + 1) as u32
    }

    /// 1-based position of a frame label within the range, if it falls
    /// inside it.
    pub fn position_of(&self, label: i64) -> Option<u32> {
        if label < self.start || label > self.end {
            return None;
        }
        Some((label - self.start + 1) as u32)
    }
}

/// Render configuration snapshot, immutable once the job is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderParams {
    pub format: OutputFormat,
    pub samples: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_range: Option<FrameRange>,
}

impl RenderParams {
    /// Validates the parameter set per the upload intake contract:
    /// positive samples and dimensions, frame range present exactly for
    /// animation formats, start not after end.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.samples == 0 {
            return Err(StoreError::InvalidRequest(
                "samples must be positive".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(StoreError::InvalidRequest(
                "resolution dimensions must be positive".to_string(),
            ));
        }
        match (self.format.is_animation(), self.frame_range) {
            (true, None) => Err(StoreError::InvalidRequest(
                "frame_start/frame_end are required for animation formats".to_string(),
            )),
            (false, Some(_)) => Err(StoreError::InvalidRequest(
                "frame range is only valid for animation formats".to_string(),
            )),
            (true, Some(range)) if range.start > range.end => Err(StoreError::InvalidRequest(
                format!("frame_start {} is after frame_end {}", range.start, range.end),
            )),
            _ => Ok(()),
        }
    }
}

/// A concrete subprocess invocation plus what the driver should expect
/// from it.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Directory the renderer writes into; scanned as a fallback when no
    /// saved-file markers were observed.
    pub output_dir: PathBuf,
    pub params: RenderParams,
    pub device: DeviceBackend,
}

/// Maps high-level parameters onto the renderer CLI.
///
/// `<binary> -b <scene> -- --output <file> --format <FMT> --samples N
/// --resolution-x W --resolution-y H [--use-gpu --gpu-type T]
/// [--frame-start A --frame-end B]`
pub fn build(
    renderer_binary: &Path,
    scene_path: &Path,
    output_dir: &Path,
    params: &RenderParams,
    device: DeviceBackend,
) -> CommandSpec {
    let output_file = output_dir.join(format!("render.{}", params.format.extension()));

    let mut args = vec![
        "-b".to_string(),
        scene_path.display().to_string(),
        "--".to_string(),
        "--output".to_string(),
        output_file.display().to_string(),
        "--format".to_string(),
        params.format.cli_name().to_string(),
        "--samples".to_string(),
        params.samples.to_string(),
        "--resolution-x".to_string(),
        params.width.to_string(),
        "--resolution-y".to_string(),
        params.height.to_string(),
    ];

    if let Some(gpu_type) = device.gpu_type_arg() {
        args.push("--use-gpu".to_string());
        args.push("--gpu-type".to_string());
        args.push(gpu_type.to_string());
    }

    if let Some(range) = params.frame_range {
        args.push("--frame-start".to_string());
        args.push(range.start.to_string());
        args.push("--frame-end".to_string());
        args.push(range.end.to_string());
    }

    CommandSpec {
        program: renderer_binary.to_path_buf(),
        args,
        output_dir: output_dir.to_path_buf(),
        params: params.clone(),
        device,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn still_params() -> RenderParams {
        RenderParams {
            format: OutputFormat::Png,
            samples: 64,
            width: 1280,
            height: 720,
            frame_range: None,
        }
    }

    fn animation_params() -> RenderParams {
        RenderParams {
            format: OutputFormat::Ffmpeg,
            samples: 32,
            width: 640,
            height: 480,
            frame_range: Some(FrameRange { start: 10, end: 14 }),
        }
    }

    #[test]
    fn test_still_command_has_no_frame_args() {
        let spec = build(
            Path::new("/opt/blender/blender"),
            Path::new("/work/job/scene.blend"),
            Path::new("/out/job"),
            &still_params(),
            DeviceBackend::Cpu,
        );

        assert_eq!(spec.program, PathBuf::from("/opt/blender/blender"));
        assert!(spec.args.contains(&"--format".to_string()));
        assert!(spec.args.contains(&"PNG".to_string()));
        assert!(!spec.args.contains(&"--frame-start".to_string()));
        assert!(!spec.args.contains(&"--use-gpu".to_string()));
        assert!(spec.args.contains(&"/out/job/render.png".to_string()));
    }

    #[test]
    fn test_gpu_device_adds_gpu_args() {
        let spec = build(
            Path::new("blender"),
            Path::new("scene.blend"),
            Path::new("/out"),
            &still_params(),
            DeviceBackend::Optix,
        );

        let use_gpu = spec.args.iter().position(|a| a == "--use-gpu");
        assert!(use_gpu.is_some());
        assert!(spec.args.contains(&"OPTIX".to_string()));
    }

    #[test]
    fn test_animation_command_has_frame_range() {
        let spec = build(
            Path::new("blender"),
            Path::new("scene.blend"),
            Path::new("/out"),
            &animation_params(),
            DeviceBackend::Cuda,
        );

        let start_idx = spec
            .args
            .iter()
            .position(|a| a == "--frame-start")
            .expect("frame-start missing");
        assert_eq!(spec.args[start_idx + 1], "10");
        assert!(spec.args.contains(&"--frame-end".to_string()));
        assert!(spec.args.contains(&"14".to_string()));
        assert!(spec.args.contains(&"/out/render.mp4".to_string()));
    }

    #[test]
    fn test_scene_precedes_script_separator() {
        let spec = build(
            Path::new("blender"),
            Path::new("scene.blend"),
            Path::new("/out"),
            &still_params(),
            DeviceBackend::Cpu,
        );
        let scene_idx = spec.args.iter().position(|a| a == "scene.blend").unwrap();
        let sep_idx = spec.args.iter().position(|a| a == "--").unwrap();
        assert!(scene_idx < sep_idx);
        assert_eq!(spec.args[0], "-b");
    }

    #[test]
    fn test_frame_range_positions() {
        let range = FrameRange { start: 10, end: 14 };
        assert_eq!(range.total_frames(), 5);
        assert_eq!(range.position_of(10), Some(1));
        assert_eq!(range.position_of(14), Some(5));
        assert_eq!(range.position_of(9), None);
        assert_eq!(range.position_of(15), None);
    }

    #[test]
    fn test_validate_accepts_good_params() {
        assert!(still_params().validate().is_ok());
        assert!(animation_params().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_samples() {
        let mut params = still_params();
        params.samples = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_missing_range_for_animation() {
        let mut params = animation_params();
        params.frame_range = None;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_range_on_still() {
        let mut params = still_params();
        params.frame_range = Some(FrameRange { start: 1, end: 2 });
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut params = animation_params();
        params.frame_range = Some(FrameRange { start: 5, end: 1 });
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_format_serde_names() {
        assert_eq!(
            serde_json::to_string(&OutputFormat::OpenExr).unwrap(),
            "\"OPEN_EXR\""
        );
        assert_eq!(
            serde_json::from_str::<OutputFormat>("\"FFMPEG\"").unwrap(),
            OutputFormat::Ffmpeg
        );
    }
}

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use renderq::{FarmConfig, JobRecord, RenderFarm};

/// Isolated directory tree plus helpers for building farms and uploads.
pub struct TestHarness {
    temp: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().expect("failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// A validated config pointing every directory into the harness.
    /// `extra` is spliced into the JSON object, e.g.
    /// `"worker_count": 2,`.
    pub fn config(&self, renderer: &Path, extra: &str) -> FarmConfig {
        let json = format!(
            r#"{{
                {extra}
                "renderer_binary": "{renderer}",
                "default_device": "cpu",
                "working_dir_root": "{root}/uploads",
                "artifact_dir_root": "{root}/rendered",
                "poll_interval_ms": 20,
                "kill_grace_ms": 1000
            }}"#,
            extra = extra,
            renderer = renderer.display(),
            root = self.root().display()
        );
        renderq::load_config_from_str(&json).expect("invalid test config")
    }

    pub fn farm(&self, renderer: &Path) -> RenderFarm {
        RenderFarm::start(self.config(renderer, "")).expect("failed to start farm")
    }

    /// Writes a minimal stand-in scene file.
    pub fn write_blend(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, b"BLENDER-v500FAKE").expect("failed to write scene");
        path
    }

    /// Writes a zip upload with the given entries.
    pub fn write_zip(&self, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = self.root().join(name);
        let file = std::fs::File::create(&path).expect("failed to create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (entry_name, data) in entries {
            writer.start_file(*entry_name, options).expect("zip entry");
            writer.write_all(data).expect("zip write");
        }
        writer.finish().expect("zip finish");
        path
    }

    /// Polls the farm until the job reaches a terminal state.
    pub fn wait_terminal(&self, farm: &RenderFarm, job_id: &str) -> JobRecord {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let record = farm.status(job_id).expect("job disappeared");
            if record.state.is_terminal() {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "job {} never reached a terminal state (last: {:?})",
                job_id,
                record.state
            );
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub mod artifacts;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod farm;
pub mod jobs;
pub mod queue;
pub mod render;
pub mod resolver;
pub mod worker;

pub use artifacts::ArtifactStore;
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent, NoopSink, ProgressSink};
pub use config::{load_config, load_config_from_str, FarmConfig};
pub use error::{
    ArtifactError, ConfigError, QueueError, RenderError, RenderqError, ResolveError, Result,
    StoreError,
};
pub use farm::{RenderFarm, RenderRequest, SubmitReceipt};
pub use jobs::{JobRecord, JobState, JobStore};
pub use queue::{ChannelQueue, QueueState, RenderUnit, TaskQueue};
pub use render::{DeviceBackend, FrameRange, OutputFormat, RenderParams};
pub use resolver::{ArchiveResolver, ResolvedScene};

pub mod record;
pub mod store;

pub use record::{JobRecord, JobState};
pub use store::JobStore;

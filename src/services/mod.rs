pub mod account_pool;
pub mod local_client;
pub mod logging;
pub mod orchestrator;
pub mod relay;
pub mod resource_selector;
pub mod segment;

pub use account_pool::{AccountPool, AccountPoolConfig, rate_limit_release_at};
pub use local_client::{LocalClient, LocalFile, LocalJob, LocalJobState};
pub use logging::init_tracing;
pub use orchestrator::{
    CompletionObserver, DownloadOrchestrator, DownloadOrchestratorBuilder, OrchestratorConfig,
    RelayPipeline, Series,
};
pub use relay::{
    RelayConnector, RelayFile, RelayService, RelayTask, RelayTaskPhase, StorageQuota, TransferItem,
};
pub use resource_selector::{
    Resolution, Resource, ResourceKind, ResourcePayload, SubtitleLanguage, compare_resources,
    rank_resources, select_best_resource, select_best_valid_resource,
};
pub use segment::{SegmentJob, SegmentOutcome, SegmentStatus, SegmentTransferClient};

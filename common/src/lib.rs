pub mod boot;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod engine;
pub mod gate;
pub mod identity;
pub mod partition;
pub mod signal;
pub mod sim;
pub mod status;
pub mod store;
pub mod task;

pub use boot::{validate_boot, BootValidation};
pub use config::OtaConfig;
pub use descriptor::{DescriptorError, ImageDescriptor, DESCRIPTOR_PREFIX_LEN};
pub use digest::{FirmwareDigest, ImageHasher};
pub use engine::{
    ApplyError, ApplyOutcome, FetchError, FirmwareSource, ImageStream, SystemReset,
    UpdateEngine, ValidationError,
};
pub use gate::{should_attempt, RetryCounter, RetryDecision, RetryPolicy};
pub use identity::{identify_running, IdentityError, RunningImage};
pub use partition::{
    FirmwareWriter, ImageValidationState, PartitionError, PartitionInfo, PartitionRole,
    PartitionTable,
};
pub use signal::NetworkSignal;
pub use status::{OtaPhase, OtaStatus, OtaStatusHandle, PENDING_VERSION};
pub use store::{KvNamespace, KvStore, StoreError, TrustStore};
pub use task::{Delay, OtaPlatform, OtaTask, TaskError, TaskExit, TaskSummary, ThreadDelay};

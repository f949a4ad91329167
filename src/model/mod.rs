//! The Durable Store's data model: suppliers, purchase orders, batches,
//! agent runs, batch logs, activity logs, conflicts, and upload jobs.

pub mod activity_log;
pub mod agent_run;
pub mod batch;
pub mod batch_log;
pub mod conflict;
pub mod money;
pub mod purchase_order;
pub mod supplier;
pub mod upload_job;

pub use activity_log::{ActivityLog, EntityType};
pub use agent_run::{AgentRun, AgentRunStatus};
pub use batch::{BatchStatus, SupplierBatch};
pub use batch_log::{BatchLog, BatchLogType, LogLevel};
pub use conflict::{Conflict, ConflictType};
pub use money::Money;
pub use purchase_order::{ActionType, BatchId, PoStatus, PurchaseOrder, PurchaseOrderId};
pub use supplier::{ContactOverride, Supplier, SupplierId};
pub use upload_job::{UploadJob, UploadJobId, UploadJobStatus, UploadProgress, UploadStage, UploadSummary};

//! case-ingest — ingestion orchestration core: admission governor, run ledger,
//! content-addressed evidence store, atomic commits, and resumable case automation.

pub mod automation;
pub mod clock;
pub mod commit;
pub mod evidence;
pub mod fetch;
pub mod governor;
pub mod ledger;
pub mod orchestrator;
pub mod producer;
pub mod sources;
pub mod store;
pub mod types;

pub use automation::{AutomationConfig, AutomationState, HumanSignal, PortalSession, SessionFactory};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{CommitCoordinator, CommitReceipt, CommitRequest, RegistryEntry};
pub use evidence::{EvidenceStore, PutOutcome};
pub use fetch::{FetchResponse, Fetcher};
pub use governor::{Admission, AdmissionState, DenyReason, Governor};
pub use ledger::{RunFilter, RunLedger, DEFAULT_LIVENESS};
pub use orchestrator::{Collaborators, IngestCore, Orchestrator, RunSummary};
pub use producer::{Classifier, Production, ProducerSet, RecordProducer};
pub use sources::{DriverKind, PortalSelectors, SourceProfile, SourceRegistry};
pub use store::Database;
pub use types::*;

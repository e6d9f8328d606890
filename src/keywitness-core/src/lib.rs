//! # keywitness-core
//!
//! Layered trust pipeline that turns raw key events into signed evidence of
//! human typing activity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   HardwareTrustBinding                        │
//! │   (anchor counter, binding hash, quotes, sealed key)         │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │               IntegrityChain                      │       │
//! │  │   (hash chain + HMAC, snapshots, TimingAnalyzer)  │       │
//! │  └──────────────────────────────────────────────────┘       │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │            CrossSourceValidator                   │       │
//! │  │   (primary vs reference, synthetic detection)     │       │
//! │  └──────────────────────────────────────────────────┘       │
//! │             │                              │                 │
//! │             ▼                              ▼                 │
//! │  ┌────────────────────┐        ┌────────────────────┐       │
//! │  │ EventCounter       │        │ EventCounter       │       │
//! │  │ (primary source)   │        │ (reference source) │       │
//! │  └────────────────────┘        └────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Cross-checked**: events the reference source never saw are counted
//!   as synthetic and, in strict mode, never credited
//! - **Tamper-evident**: every validated increment re-MACs the chain; any
//!   mismatch latches a terminal compromised state
//! - **Hardware-bound**: an anchor's monotonic counter and quotes tie the
//!   chain to one device
//! - **Degrades loudly**: missing reference or anchor is reported in stats
//!   and evidence, never hidden

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod binding;
pub mod config;
pub mod counter;
pub mod error;
pub mod evidence;
pub mod handle;
pub mod integrity;
pub mod source;
pub mod task;
pub mod timing;
pub mod types;
pub mod validator;

pub use binding::{attestation_digest, HardwareSnapshot, HardwareTrustBinding, TrustStatus};
pub use config::{BindingConfig, TimingConfig, ValidatorConfig, WitnessConfig};
pub use counter::{CountEvent, EventCounter};
pub use error::WitnessError;
pub use evidence::{EvidenceRecord, SessionInfo, EVIDENCE_VERSION};
pub use handle::WitnessCounter;
pub use integrity::{ChainView, IntegrityChain, RecordedEvent, SealedSnapshot};
pub use source::{select_sources, Availability, RawEventSource, SimulatedSource, SourceLayer, SourceSelection};
pub use timing::{AnomalyReason, AnomalyReport, TimingAnalyzer, TimingVerdict};
pub use types::{CompromiseStatus, CountReading};
pub use validator::{cross_validate, CrossSourceValidator, CrossValidation, ReferenceSource, TickOutcome, ValidationStats};

// Anchor types callers need to wire a binding.
pub use keywitness_anchor::{create_trust_anchor, Attestation, HardwareType, SealPolicy, TrustAnchor};

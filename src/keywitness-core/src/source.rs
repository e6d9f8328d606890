//! Raw event sources.
//!
//! A source adapter pushes key events into an [`EventCounter`] owned by the
//! session. Platform adapters (OS input hooks, HID readers) live outside
//! this crate; [`SimulatedSource`] stands in for them in tests and the CLI.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::counter::EventCounter;
use crate::error::WitnessError;
use crate::validator::ReferenceSource;

/// Which side of the cross-check a source feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLayer {
    /// High-level OS event stream.
    Primary,
    /// Low-level device stream used to confirm primary events.
    Reference,
}

/// Runtime availability of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Ready to start.
    Available,
    /// Cannot run on this host.
    Unavailable {
        /// Why not.
        reason: String,
    },
}

impl Availability {
    /// Whether the source can run.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// A source of raw key events.
pub trait RawEventSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Layer this source feeds.
    fn layer(&self) -> SourceLayer;

    /// Runtime capability check.
    fn availability(&self) -> Availability;

    /// Begin pushing events into `sink`.
    fn start(&self, sink: Arc<EventCounter>) -> Result<(), WitnessError>;

    /// Stop pushing events. Idempotent.
    fn stop(&self);
}

/// In-process source driven by [`SimulatedSource::emit`].
#[derive(Debug)]
pub struct SimulatedSource {
    name: String,
    layer: SourceLayer,
    availability: Mutex<Availability>,
    sink: Mutex<Option<Arc<EventCounter>>>,
}

impl SimulatedSource {
    /// An available simulated source.
    pub fn new(name: impl Into<String>, layer: SourceLayer) -> Self {
        Self {
            name: name.into(),
            layer,
            availability: Mutex::new(Availability::Available),
            sink: Mutex::new(None),
        }
    }

    /// A simulated source that reports itself unavailable.
    pub fn unavailable(name: impl Into<String>, layer: SourceLayer, reason: impl Into<String>) -> Self {
        let source = Self::new(name, layer);
        source.force_availability(Availability::Unavailable {
            reason: reason.into(),
        });
        source
    }

    /// Override the reported availability.
    pub fn force_availability(&self, availability: Availability) {
        *self.availability.lock().unwrap_or_else(PoisonError::into_inner) = availability;
    }

    fn sink(&self) -> MutexGuard<'_, Option<Arc<EventCounter>>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push `n` events. Returns how many were delivered (0 when stopped).
    pub fn emit(&self, n: u64) -> u64 {
        match self.sink().as_ref() {
            Some(sink) => {
                sink.add(n);
                n
            },
            None => 0,
        }
    }

    /// Whether the source is started.
    pub fn is_running(&self) -> bool {
        self.sink().is_some()
    }
}

impl RawEventSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer(&self) -> SourceLayer {
        self.layer
    }

    fn availability(&self) -> Availability {
        self.availability
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn start(&self, sink: Arc<EventCounter>) -> Result<(), WitnessError> {
        if let Availability::Unavailable { reason } = self.availability() {
            return Err(WitnessError::SourceUnavailable {
                name: self.name.clone(),
                reason,
            });
        }
        let mut slot = self.sink();
        if slot.is_some() {
            return Err(WitnessError::AlreadyRunning {
                component: self.name.clone(),
            });
        }
        *slot = Some(sink);
        debug!(source = %self.name, layer = ?self.layer, "Simulated source started");
        Ok(())
    }

    fn stop(&self) {
        if self.sink().take().is_some() {
            debug!(source = %self.name, "Simulated source stopped");
        }
    }
}

/// Counters wired to the selected sources.
#[derive(Debug)]
pub struct SourceSelection {
    /// Counter fed by the primary source.
    pub primary: Arc<EventCounter>,
    /// Counter fed by the reference source, or why there is none.
    pub reference: ReferenceSource,
}

/// Start `primary` and, if it can run, `reference`, each into a fresh counter.
///
/// A primary that cannot start is fatal. A reference that is unavailable or
/// fails to start degrades to [`ReferenceSource::Unavailable`].
pub fn select_sources(
    primary: &dyn RawEventSource,
    reference: Option<&dyn RawEventSource>,
) -> Result<SourceSelection, WitnessError> {
    if let Availability::Unavailable { reason } = primary.availability() {
        return Err(WitnessError::SourceUnavailable {
            name: primary.name().to_string(),
            reason,
        });
    }
    let primary_counter = Arc::new(EventCounter::new());
    primary.start(Arc::clone(&primary_counter))?;

    let reference = match reference {
        None => ReferenceSource::Unavailable {
            reason: "no reference source configured".into(),
        },
        Some(source) => match source.availability() {
            Availability::Unavailable { reason } => {
                warn!(source = %source.name(), reason = %reason, "Reference source unavailable");
                ReferenceSource::Unavailable { reason }
            },
            Availability::Available => {
                let counter = Arc::new(EventCounter::new());
                match source.start(Arc::clone(&counter)) {
                    Ok(()) => ReferenceSource::Available(counter),
                    Err(e) => {
                        warn!(source = %source.name(), error = %e, "Reference source failed to start");
                        ReferenceSource::Unavailable {
                            reason: e.to_string(),
                        }
                    },
                }
            },
        },
    };

    info!(
        primary = %primary.name(),
        reference_available = matches!(reference, ReferenceSource::Available(_)),
        "Event sources selected"
    );
    Ok(SourceSelection {
        primary: primary_counter,
        reference,
    })
}

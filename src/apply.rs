//! Catalog apply gateway.
//!
//! Translates an accepted insight into one idempotent [`CatalogChange`] and
//! writes it through the catalog contracts. Every write is bounded by a
//! timeout; a write that does not finish in time is reported as a retryable
//! `Timeout` and keeps running on its own thread. The gateway holds on to it,
//! keyed by insight id, until [`ApplyGateway::poll_write`] observes how it
//! ended. No second write is started for an insight while one is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, warn};

use crate::catalog::{Ack, CatalogChange, CatalogError, CatalogReader, CatalogWriter};
use crate::error::ApplyError;
use crate::insight::{Insight, InsightId};
use crate::prediction::PredictionType;
use crate::value::Value;

impl From<CatalogError> for ApplyError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound { entity_id } => Self::EntityGone { entity_id },
            CatalogError::Rejected { reason } => Self::Permanent { reason },
            CatalogError::Unavailable { reason } => Self::Retryable { reason },
            CatalogError::Timeout { duration_ms } => Self::Timeout { duration_ms },
        }
    }
}

fn unsupported(insight: &Insight, what: &str) -> ApplyError {
    ApplyError::Permanent {
        reason: format!(
            "{} insight {} has {what} ({})",
            insight.insight_type,
            insight.id,
            insight.value.type_name()
        ),
    }
}

fn tag_value(insight: &Insight) -> Result<String, ApplyError> {
    insight
        .value
        .as_text()
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| unsupported(insight, "a non-tag value"))
}

fn asset(insight: &Insight) -> Result<String, ApplyError> {
    insight
        .source_asset_id
        .clone()
        .ok_or_else(|| unsupported(insight, "no source image"))
}

/// Maps an insight to the catalog change that materializes it.
///
/// # Errors
///
/// Returns `Permanent` when the value cannot be expressed as a change for
/// its type.
pub fn change_for(insight: &Insight) -> Result<CatalogChange, ApplyError> {
    let add_tag = |field: &str| -> Result<CatalogChange, ApplyError> {
        Ok(CatalogChange::AddTag {
            field: field.to_string(),
            tag: tag_value(insight)?,
        })
    };
    let set_field = |field: &str| -> Result<CatalogChange, ApplyError> {
        if insight.value.is_null() {
            return Err(unsupported(insight, "a null value"));
        }
        Ok(CatalogChange::SetField {
            field: field.to_string(),
            value: insight.value.clone(),
        })
    };

    match insight.insight_type {
        PredictionType::Category => add_tag("categories_tags"),
        PredictionType::Label => add_tag("labels_tags"),
        PredictionType::Brand => add_tag("brands_tags"),
        PredictionType::Store => add_tag("stores_tags"),
        PredictionType::Packaging => add_tag("packagings_tags"),
        PredictionType::PackagerCode => add_tag("emb_codes_tags"),
        PredictionType::ProductWeight => set_field("quantity"),
        PredictionType::ExpirationDate => set_field("expiration_date"),
        PredictionType::IngredientSpellcheck => match &insight.value {
            Value::String(_) => set_field("ingredients_text"),
            _ => Err(unsupported(insight, "a non-text correction")),
        },
        PredictionType::Nutrient => match &insight.value {
            Value::Structured(nutrients) => Ok(CatalogChange::SetNutrients {
                nutrients: nutrients.clone(),
            }),
            _ => Err(unsupported(insight, "non-structured nutrients")),
        },
        PredictionType::ImageOrientation => {
            let rotation = insight
                .value
                .as_int()
                .filter(|r| r.rem_euclid(90) == 0)
                .ok_or_else(|| unsupported(insight, "an invalid rotation"))?;
            Ok(CatalogChange::RotateImage {
                image_id: asset(insight)?,
                rotation: rotation.rem_euclid(360),
            })
        }
        PredictionType::NutritionImage => Ok(CatalogChange::SelectImage {
            image_id: asset(insight)?,
            role: "nutrition".to_string(),
        }),
        PredictionType::IsUpcImage | PredictionType::ImageFlag => Ok(CatalogChange::DeleteImage {
            image_id: asset(insight)?,
        }),
    }
}

type WriteOutcome = Result<Ack, CatalogError>;

fn writer_panicked() -> ApplyError {
    ApplyError::Retryable {
        reason: "catalog writer panicked".to_string(),
    }
}

/// Where the last timed-out write for an insight stands.
#[derive(Debug)]
pub enum WriteState {
    /// No timed-out write is outstanding.
    Idle,
    /// The write is still running; its effect on the catalog is unknown.
    InFlight,
    /// The write finished after its caller stopped waiting.
    Landed(Result<Ack, ApplyError>),
}

/// Writes accepted insights to the catalog.
#[derive(Clone)]
pub struct ApplyGateway {
    reader: Arc<dyn CatalogReader>,
    writer: Arc<dyn CatalogWriter>,
    timeout: Duration,
    outstanding: Arc<Mutex<HashMap<InsightId, Receiver<WriteOutcome>>>>,
}

impl std::fmt::Debug for ApplyGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyGateway")
            .field("timeout", &self.timeout)
            .field("outstanding", &self.outstanding_writes())
            .finish_non_exhaustive()
    }
}

impl ApplyGateway {
    /// Creates a gateway over separate read and write contracts.
    #[must_use]
    pub fn new(reader: Arc<dyn CatalogReader>, writer: Arc<dyn CatalogWriter>, timeout: Duration) -> Self {
        Self {
            reader,
            writer,
            timeout,
            outstanding: Arc::default(),
        }
    }

    /// Creates a gateway over one backend implementing both contracts.
    #[must_use]
    pub fn from_catalog<C>(catalog: Arc<C>, timeout: Duration) -> Self
    where
        C: CatalogReader + CatalogWriter + 'static,
    {
        let reader: Arc<dyn CatalogReader> = catalog.clone();
        let writer: Arc<dyn CatalogWriter> = catalog;
        Self::new(reader, writer, timeout)
    }

    /// The write timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of timed-out writes not yet observed.
    #[must_use]
    pub fn outstanding_writes(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Checks on the timed-out write for `insight_id`, if any.
    ///
    /// A finished write is reported once; afterwards the insight is `Idle`.
    pub fn poll_write(&self, insight_id: InsightId) -> WriteState {
        // The map only holds receivers: a poisoned lock leaves it consistent.
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = outstanding.get(&insight_id) else {
            return WriteState::Idle;
        };
        let outcome = match rx.try_recv() {
            Err(TryRecvError::Empty) => return WriteState::InFlight,
            Ok(result) => result.map_err(ApplyError::from),
            Err(TryRecvError::Disconnected) => Err(writer_panicked()),
        };
        outstanding.remove(&insight_id);
        debug!(insight_id = %insight_id, ok = outcome.is_ok(), "late catalog write resolved");
        WriteState::Landed(outcome)
    }

    /// Stops tracking the timed-out write for `insight_id`. The write itself
    /// may still complete.
    pub fn forget_write(&self, insight_id: InsightId) -> bool {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&insight_id)
            .is_some()
    }

    /// Materializes `insight` in the catalog.
    ///
    /// If an earlier write for the same insight timed out, that write is
    /// resolved first: a successful one is returned as is, and one still
    /// running fails this call as retryable without touching the catalog.
    ///
    /// # Errors
    ///
    /// - `EntityGone` if the entity no longer exists.
    /// - `Permanent` if the insight cannot be expressed or the catalog rejects it.
    /// - `Retryable`/`Timeout` for transient failures.
    pub fn apply(&self, insight: &Insight) -> Result<Ack, ApplyError> {
        match self.poll_write(insight.id) {
            WriteState::InFlight => {
                return Err(ApplyError::Retryable {
                    reason: "previous write still in flight".to_string(),
                })
            }
            WriteState::Landed(Ok(ack)) => return Ok(ack),
            WriteState::Landed(Err(_)) | WriteState::Idle => {}
        }

        let change = change_for(insight)?;

        if self.reader.get_entity(&insight.entity_id)?.is_none() {
            return Err(ApplyError::EntityGone {
                entity_id: insight.entity_id.to_string(),
            });
        }

        let ack = self.write_with_timeout(insight, change)?;
        debug!(
            insight_id = %insight.id,
            entity_id = %insight.entity_id,
            changed = ack.changed,
            "insight written to catalog"
        );
        Ok(ack)
    }

    fn write_with_timeout(&self, insight: &Insight, change: CatalogChange) -> Result<Ack, ApplyError> {
        let (tx, rx) = bounded::<WriteOutcome>(1);
        let writer = Arc::clone(&self.writer);
        let entity_id = insight.entity_id.clone();

        thread::Builder::new()
            .name("insightflow-apply".to_string())
            .spawn(move || {
                let _ = tx.send(writer.apply_change(&entity_id, &change));
            })
            .map_err(|e| ApplyError::Retryable {
                reason: format!("failed to spawn apply thread: {e}"),
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(ApplyError::from),
            Err(RecvTimeoutError::Timeout) => {
                warn!(insight_id = %insight.id, "catalog write timed out; still in flight");
                self.outstanding
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(insight.id, rx);
                Err(ApplyError::Timeout {
                    duration_ms: self.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(writer_panicked()),
        }
    }
}

//! Predictions: immutable raw signals produced by predictors.
//!
//! A prediction is append-only provenance. It is never mutated, and only
//! deleted when its entity is deleted. Many predictions of the same type may
//! coexist for one entity; reconciliation decides which become insights.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityId;
use crate::error::ValidationError;
use crate::value::Value;

/// Unique identifier for a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionId(Uuid);

impl PredictionId {
    /// Creates a new random prediction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PredictionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PredictionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of fact a prediction (and the insight derived from it) is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Category,
    Label,
    Brand,
    Store,
    Packaging,
    PackagerCode,
    ProductWeight,
    ExpirationDate,
    Nutrient,
    IngredientSpellcheck,
    ImageOrientation,
    NutritionImage,
    IsUpcImage,
    ImageFlag,
}

impl PredictionType {
    /// All prediction types, in a stable order.
    pub const ALL: [Self; 14] = [
        Self::Category,
        Self::Label,
        Self::Brand,
        Self::Store,
        Self::Packaging,
        Self::PackagerCode,
        Self::ProductWeight,
        Self::ExpirationDate,
        Self::Nutrient,
        Self::IngredientSpellcheck,
        Self::ImageOrientation,
        Self::NutritionImage,
        Self::IsUpcImage,
        Self::ImageFlag,
    ];

    /// Returns true if several non-terminal insights of this type may coexist
    /// for one entity (one per distinct value).
    #[must_use]
    pub const fn allows_multiple(self) -> bool {
        matches!(
            self,
            Self::Label
                | Self::Store
                | Self::Packaging
                | Self::PackagerCode
                | Self::ImageOrientation
                | Self::IsUpcImage
                | Self::ImageFlag
        )
    }

    /// Returns true if the value identity of this type includes the source
    /// image (the same value on two images is two facts).
    #[must_use]
    pub const fn is_image_scoped(self) -> bool {
        matches!(
            self,
            Self::ImageOrientation | Self::NutritionImage | Self::IsUpcImage | Self::ImageFlag
        )
    }

    /// Returns the stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Label => "label",
            Self::Brand => "brand",
            Self::Store => "store",
            Self::Packaging => "packaging",
            Self::PackagerCode => "packager_code",
            Self::ProductWeight => "product_weight",
            Self::ExpirationDate => "expiration_date",
            Self::Nutrient => "nutrient",
            Self::IngredientSpellcheck => "ingredient_spellcheck",
            Self::ImageOrientation => "image_orientation",
            Self::NutritionImage => "nutrition_image",
            Self::IsUpcImage => "is_upc_image",
            Self::ImageFlag => "image_flag",
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PredictionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownPredictionType {
                name: s.to_string(),
            })
    }
}

/// An immutable signal produced by one predictor about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub entity_id: EntityId,
    #[serde(rename = "type")]
    pub prediction_type: PredictionType,
    pub predictor_id: String,
    pub value: Value,

    /// `None` means maximally uncertain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_asset_id: Option<String>,

    /// The predictor's own judgment that this may be applied without review.
    #[serde(default)]
    pub automatic_processing_hint: bool,

    pub created_at: DateTime<Utc>,
}

impl Prediction {
    pub fn builder() -> PredictionBuilder {
        PredictionBuilder::new()
    }

    /// Returns true if `other` carries the same evidence: same predictor,
    /// same value, same source asset.
    #[must_use]
    pub fn same_evidence(&self, other: &Self) -> bool {
        self.predictor_id == other.predictor_id
            && self.value == other.value
            && self.source_asset_id == other.source_asset_id
    }
}

/// Builder for `Prediction`.
#[derive(Debug, Default)]
pub struct PredictionBuilder {
    entity_id: Option<EntityId>,
    prediction_type: Option<PredictionType>,
    predictor_id: Option<String>,
    value: Option<Value>,
    confidence: Option<f32>,
    source_asset_id: Option<String>,
    automatic_processing_hint: bool,
    created_at: Option<DateTime<Utc>>,
}

impl PredictionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    #[must_use]
    pub fn prediction_type(mut self, prediction_type: PredictionType) -> Self {
        self.prediction_type = Some(prediction_type);
        self
    }

    #[must_use]
    pub fn predictor(mut self, predictor_id: impl Into<String>) -> Self {
        self.predictor_id = Some(predictor_id.into());
        self
    }

    #[must_use]
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    #[must_use]
    pub fn source_asset(mut self, asset_id: impl Into<String>) -> Self {
        self.source_asset_id = Some(asset_id.into());
        self
    }

    #[must_use]
    pub fn automatic_processing(mut self, hint: bool) -> Self {
        self.automatic_processing_hint = hint;
        self
    }

    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Builds the prediction.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` if entity, type, predictor or value is unset,
    /// `ConfidenceOutOfRange` for a confidence outside `[0.0, 1.0]`, and
    /// `NonFiniteValue` for a NaN or infinite float payload.
    pub fn build(self) -> Result<Prediction, ValidationError> {
        let missing = |field: &str| ValidationError::MissingField {
            field: field.to_string(),
        };

        if let Some(value) = self.confidence {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ValidationError::ConfidenceOutOfRange { value });
            }
        }

        if let Some(Value::Float(value)) = self.value {
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteValue { value });
            }
        }

        let predictor_id = self.predictor_id.ok_or_else(|| missing("predictor_id"))?;
        if predictor_id.trim().is_empty() {
            return Err(missing("predictor_id"));
        }

        Ok(Prediction {
            id: PredictionId::new(),
            entity_id: self.entity_id.ok_or_else(|| missing("entity_id"))?,
            prediction_type: self.prediction_type.ok_or_else(|| missing("type"))?,
            predictor_id,
            value: self.value.ok_or_else(|| missing("value"))?,
            confidence: self.confidence,
            source_asset_id: self.source_asset_id,
            automatic_processing_hint: self.automatic_processing_hint,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

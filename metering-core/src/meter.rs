//! Meter definitions as handed over by the metadata store.

use serde::{Deserialize, Serialize};
use crate::aggregation::Aggregation;
use crate::error::{MeterError, Result};

/// A named rule for rolling up events of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub name: String,
    pub slug: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Property holding the aggregated value. Empty for a bare `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_property: Option<String>,
    /// Dimension names. Order carries no meaning.
    #[serde(default)]
    pub properties: Vec<String>,
    pub aggregation: Aggregation,
    pub tenant_slug: String,
}

impl Meter {
    /// The value property, if present and non-empty.
    pub fn value_property(&self) -> Option<&str> {
        self.value_property.as_deref().filter(|p| !p.is_empty())
    }

    /// Checks the invariants every stored meter must hold.
    pub fn validate(&self) -> Result<()> {
        if self.slug.is_empty() {
            return Err(MeterError::invalid_input("meter slug cannot be empty"));
        }
        if self.event_type.is_empty() {
            return Err(MeterError::invalid_input("meter event type cannot be empty"));
        }
        if self.tenant_slug.is_empty() {
            return Err(MeterError::invalid_input("tenant slug cannot be empty"));
        }
        if self.aggregation.requires_value_property() && self.value_property().is_none() {
            return Err(MeterError::invalid_input(format!(
                "value property is required for {} aggregation",
                self.aggregation
            )));
        }
        Ok(())
    }

    /// Every property an event of this meter's type must carry: the value
    /// property followed by the dimensions.
    pub fn required_properties(&self) -> impl Iterator<Item = &str> {
        self.value_property()
            .into_iter()
            .chain(self.properties.iter().map(String::as_str))
    }
}

/// Request to create a meter and its aggregation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMeter {
    #[serde(flatten)]
    pub meter: Meter,
    /// Backfill the view from events already stored.
    #[serde(default)]
    pub populate: bool,
}

/// Request to remove a meter's aggregation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMeter {
    pub tenant_slug: String,
    pub meter_slug: String,
}

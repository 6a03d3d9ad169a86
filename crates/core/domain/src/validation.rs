//! 点位不变量校验。

use crate::data::{DEVICE_ID_TAG, Point};

/// 点位校验错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("measurement is empty")]
    EmptyMeasurement,
    #[error("point has no fields")]
    NoFields,
    #[error("empty tag key")]
    EmptyTagKey,
    #[error("empty field key")]
    EmptyFieldKey,
    #[error("missing tag: {0}")]
    MissingTag(&'static str),
    #[error("field {0} is not a finite number")]
    NonFiniteField(String),
}

impl Point {
    /// 校验点位不变量：measurement 非空、fields 非空、键非空、携带 deviceId。
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.measurement.trim().is_empty() {
            return Err(ValidationError::EmptyMeasurement);
        }
        if self.fields.is_empty() {
            return Err(ValidationError::NoFields);
        }
        if self.tags.keys().any(|key| key.is_empty()) {
            return Err(ValidationError::EmptyTagKey);
        }
        if !self.tags.contains_key(DEVICE_ID_TAG) {
            return Err(ValidationError::MissingTag(DEVICE_ID_TAG));
        }
        for (key, value) in &self.fields {
            if key.is_empty() {
                return Err(ValidationError::EmptyFieldKey);
            }
            if !value.is_finite() {
                return Err(ValidationError::NonFiniteField(key.clone()));
            }
        }
        Ok(())
    }
}

//! Billing error types

use thiserror::Error;

/// Billing-specific errors
///
/// Duplicate purchase submissions are deliberately absent: the ledger
/// reports a replay as a normal `created = false` outcome, not an error.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BillingError::Validation("periodEnd must be in the future".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: periodEnd must be in the future"
        );

        let err = BillingError::NotFound("no active subscription".to_string());
        assert_eq!(err.to_string(), "Not found: no active subscription");
    }

    #[test]
    fn test_sqlx_error_maps_to_database() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::Database(_)));
    }
}

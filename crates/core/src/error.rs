use thiserror::Error;

/// Typed error for the pure margin/PnL math.
///
/// Deliberately small: the calculator either produces numbers or tells
/// the caller its inputs were unusable. Connectivity and persistence
/// failures live with the components that own those resources.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalcError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

use thiserror::Error;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::PlanError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::PlanError::InvalidValue {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

mod ids;
pub use ids::*;
mod workspace;
pub use workspace::*;
mod sections;
pub use sections::*;
mod voting;
pub use voting::*;
mod comments;
pub use comments::*;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Percentage in the closed range 0..=100.
pub type Percent = u8;

pub fn clamp_percent(value: i64) -> Percent {
    value.clamp(0, 100) as Percent
}

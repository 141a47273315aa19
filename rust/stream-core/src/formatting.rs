// rust/stream-core/src/formatting.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;

/// Output representation requested by the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    /// Plain row objects.
    #[default]
    Python,
    /// Columnar tables.
    Arrow,
    /// Tensor-stacked rows, materialized by an external formatter.
    Tensor,
}

impl FromStr for FormatType {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "none" => Ok(Self::Python),
            "arrow" | "pyarrow" | "table" => Ok(Self::Arrow),
            "tensor" | "numpy" | "np" | "torch" => Ok(Self::Tensor),
            other => Err(StreamError::config(format!("unknown format type '{other}'"))),
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Python => "python",
            Self::Arrow => "arrow",
            Self::Tensor => "tensor",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormattingConfig {
    pub format_type: FormatType,
}

impl FormattingConfig {
    pub fn new(format_type: FormatType) -> Self {
        Self { format_type }
    }

    /// Whether operators should run their columnar path.
    pub fn is_table(&self) -> bool {
        self.format_type == FormatType::Arrow
    }

    pub fn is_tensor(&self) -> bool {
        self.format_type == FormatType::Tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_type() {
        assert_eq!("arrow".parse::<FormatType>().unwrap(), FormatType::Arrow);
        assert_eq!("PyArrow".parse::<FormatType>().unwrap(), FormatType::Arrow);
        assert_eq!("numpy".parse::<FormatType>().unwrap(), FormatType::Tensor);
        assert_eq!("python".parse::<FormatType>().unwrap(), FormatType::Python);
        assert!("pandas".parse::<FormatType>().is_err());
    }

    #[test]
    fn test_capability_flags() {
        assert!(FormattingConfig::new(FormatType::Arrow).is_table());
        assert!(!FormattingConfig::new(FormatType::Tensor).is_table());
        assert!(FormattingConfig::new(FormatType::Tensor).is_tensor());
        assert!(!FormattingConfig::default().is_table());
    }
}

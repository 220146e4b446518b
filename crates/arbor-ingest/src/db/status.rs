//! Status enums stored as lowercase TEXT columns.

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(BatchStatus {
    Pending => "pending",
    Processing => "processing",
    Paused => "paused",
    Completed => "completed",
    Error => "error",
});

text_enum!(PageStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Error => "error",
    Paused => "paused",
});

text_enum!(SuggestionStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

text_enum!(SuggestionType {
    Species => "species",
    Defect => "defect",
    Fungus => "fungus",
    Mitigation => "mitigation",
    Feature => "feature",
    Other => "other",
});

text_enum!(ProcessingPhase {
    Ocr => "ocr",
    Translation => "translation",
    Extraction => "extraction",
    Done => "done",
});

impl ProcessingPhase {
    /// Operator-facing label shown as a batch's current stage.
    pub fn label(self) -> &'static str {
        match self {
            ProcessingPhase::Ocr => "Extracting text",
            ProcessingPhase::Translation => "Translating",
            ProcessingPhase::Extraction => "Extracting structured data",
            ProcessingPhase::Done => "Completed",
        }
    }

    /// Position in the stage order, used to find the most advanced page.
    pub fn rank(self) -> u8 {
        match self {
            ProcessingPhase::Ocr => 1,
            ProcessingPhase::Translation => 2,
            ProcessingPhase::Extraction => 3,
            ProcessingPhase::Done => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_text() {
        for status in PageStatus::ALL {
            assert_eq!(status.as_str().parse::<PageStatus>().unwrap(), *status);
        }
        assert!("done".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&BatchStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn test_phase_rank_follows_stage_order() {
        assert!(ProcessingPhase::Ocr.rank() < ProcessingPhase::Translation.rank());
        assert!(ProcessingPhase::Translation.rank() < ProcessingPhase::Extraction.rank());
        assert_eq!(ProcessingPhase::Done.label(), "Completed");
    }
}

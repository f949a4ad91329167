//! Maps a raw worklist row to an action variant and a day-difference.
//!
//! Pure and deterministic: given the same `(due_date, recommended_date)`
//! pair this always returns the same classification. Day-difference is
//! computed on local wall-clock dates truncated to day granularity — no
//! timezone arithmetic happens here, that's the spreadsheet parser's job
//! (an external collaborator, see `spreadsheet.rs`).

use chrono::NaiveDate;

use crate::model::ActionType;

/// A row ready for classification. Everything the classifier needs and
/// nothing else — the spreadsheet parser and re-upload path both produce
/// this shape before handing off to `classify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierInput {
    pub due_date: NaiveDate,
    pub recommended_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub action_type: ActionType,
    /// `recommended - due`, in whole days. Negative for EXPEDITE, positive
    /// for PUSH_OUT, always zero for CANCEL.
    pub days_diff: i64,
}

/// Classify a single row, or `None` if the row needs no action
/// (`recommended_date == due_date`).
pub fn classify(input: &ClassifierInput) -> Option<Classification> {
    match input.recommended_date {
        None => Some(Classification {
            action_type: ActionType::Cancel,
            days_diff: 0,
        }),
        Some(recommended) if recommended == input.due_date => None,
        Some(recommended) => {
            let days_diff = (recommended - input.due_date).num_days();
            let action_type = if days_diff < 0 {
                ActionType::Expedite
            } else {
                ActionType::PushOut
            };
            Some(Classification { action_type, days_diff })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn null_recommended_is_cancel() {
        let c = classify(&ClassifierInput {
            due_date: date(2025, 1, 15),
            recommended_date: None,
        })
        .unwrap();
        assert_eq!(c.action_type, ActionType::Cancel);
        assert_eq!(c.days_diff, 0);
    }

    #[test]
    fn equal_dates_are_skipped() {
        let d = date(2025, 1, 15);
        let c = classify(&ClassifierInput {
            due_date: d,
            recommended_date: Some(d),
        });
        assert!(c.is_none());
    }

    #[test]
    fn earlier_recommended_is_expedite_with_negative_diff() {
        let c = classify(&ClassifierInput {
            due_date: date(2025, 2, 10),
            recommended_date: Some(date(2025, 2, 1)),
        })
        .unwrap();
        assert_eq!(c.action_type, ActionType::Expedite);
        assert_eq!(c.days_diff, -9);
    }

    #[test]
    fn later_recommended_is_push_out_with_positive_diff() {
        let c = classify(&ClassifierInput {
            due_date: date(2025, 1, 15),
            recommended_date: Some(date(2025, 3, 1)),
        })
        .unwrap();
        assert_eq!(c.action_type, ActionType::PushOut);
        assert_eq!(c.days_diff, 45);
    }
}

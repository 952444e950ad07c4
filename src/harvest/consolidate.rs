//! Temporal consolidation of yearly observations into date-ranged records.
//!
//! Consecutive years with the same rate regime collapse into one record whose
//! expiry is the day before the next regime starts. The last record of a
//! product is open-ended.

use crate::harvest::traits::HarvestStage;
use crate::model::{ConsolidatedTariffRecord, RawObservation};
use chrono::NaiveDate;
use std::convert::Infallible;

/// Consolidates the observations of one (pair, product) group.
///
/// Output is sorted by effective date, contiguous and non-overlapping; only
/// the last record has no expiry. Observations whose year has no calendar
/// date are dropped. If two observations share a year and differ, the later
/// one in input order wins.
pub fn consolidate(observations: Vec<RawObservation>) -> Vec<ConsolidatedTariffRecord> {
    let mut records: Vec<ConsolidatedTariffRecord> = observations
        .into_iter()
        .filter_map(|obs| {
            let effective = NaiveDate::from_ymd_opt(obs.effective_year, 1, 1)?;
            Some(ConsolidatedTariffRecord::open_ended(
                obs.origin.clone(),
                obs.destination.clone(),
                effective,
                obs.ad_valorem_rate(),
            ))
        })
        .collect();
    records.sort_by_key(|r| r.effective_date);

    // One record per year, last occurrence kept; the sort above is stable.
    let mut by_year: Vec<ConsolidatedTariffRecord> = Vec::with_capacity(records.len());
    for record in records {
        match by_year.last_mut() {
            Some(last) if last.effective_date == record.effective_date => *last = record,
            _ => by_year.push(record),
        }
    }

    let mut rest = by_year.into_iter();
    let Some(mut current) = rest.next() else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for next in rest {
        if current.same_regime(&next) {
            continue;
        }
        current.expiry_date = Some(
            next.effective_date
                .pred_opt()
                .unwrap_or(next.effective_date),
        );
        result.push(std::mem::replace(&mut current, next));
    }
    result.push(current);
    result
}

/// [`consolidate`] as a pipeline stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct Consolidator;

impl HarvestStage for Consolidator {
    type Input = Vec<RawObservation>;
    type Output = Vec<ConsolidatedTariffRecord>;
    type Error = Infallible;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        Ok(consolidate(input))
    }

    fn stage_name(&self) -> &'static str {
        "consolidate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rates_match;
    use chrono::Datelike;

    fn obs(year: i32, percent: f64) -> RawObservation {
        RawObservation {
            origin: "004".into(),
            destination: "840".into(),
            product_code: "847330".into(),
            effective_year: year,
            ad_valorem_percent: percent,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn assert_coverage(records: &[ConsolidatedTariffRecord]) {
        assert!(!records.is_empty());
        for pair in records.windows(2) {
            assert!(pair[0].effective_date < pair[1].effective_date);
            let expiry = pair[0].expiry_date.expect("only the last record is open");
            assert!(expiry >= pair[0].effective_date);
            assert_eq!(expiry.succ_opt().unwrap(), pair[1].effective_date);
        }
        assert!(records.last().unwrap().expiry_date.is_none());
        assert_eq!(records.iter().filter(|r| r.expiry_date.is_none()).count(), 1);
    }

    #[test]
    fn test_merges_equal_years() {
        let result = consolidate(vec![obs(2000, 10.0), obs(2001, 10.0), obs(2002, 12.0)]);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].effective_date, date(2000, 1, 1));
        assert_eq!(result[0].expiry_date, Some(date(2001, 12, 31)));
        assert!(rates_match(result[0].ad_valorem_rate, 0.10));
        assert_eq!(result[1].effective_date, date(2002, 1, 1));
        assert_eq!(result[1].expiry_date, None);
        assert!(rates_match(result[1].ad_valorem_rate, 0.12));
        assert_coverage(&result);
    }

    #[test]
    fn test_single_observation_is_open_ended() {
        let result = consolidate(vec![obs(1999, 5.0)]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].effective_date, date(1999, 1, 1));
        assert_eq!(result[0].expiry_date, None);
        assert!(rates_match(result[0].ad_valorem_rate, 0.05));
        assert_eq!(result[0].specific_rate, 0.0);
        assert!(result[0].enabled);
        assert!(!result[0].user_defined);
    }

    #[test]
    fn test_empty_input() {
        assert!(consolidate(Vec::new()).is_empty());
    }

    #[test]
    fn test_unsorted_input_and_gaps() {
        let result = consolidate(vec![
            obs(2010, 7.0),
            obs(1995, 3.0),
            obs(2003, 3.0),
            obs(2005, 7.0),
        ]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].effective_date, date(1995, 1, 1));
        assert_eq!(result[0].expiry_date, Some(date(2004, 12, 31)));
        assert_eq!(result[1].effective_date, date(2005, 1, 1));
        assert_coverage(&result);
    }

    #[test]
    fn test_tolerance_prevents_spurious_split() {
        let result = consolidate(vec![obs(2000, 10.0000000), obs(2001, 10.0000001)]);
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_alternating_rates_split_every_year() {
        let input: Vec<_> = (2000..2006)
            .map(|y| obs(y, if y % 2 == 0 { 1.0 } else { 2.0 }))
            .collect();
        let result = consolidate(input);
        assert_eq!(result.len(), 6);
        assert_coverage(&result);
    }

    #[test]
    fn test_duplicate_year_later_wins() {
        let result = consolidate(vec![obs(2000, 4.0), obs(2000, 6.0), obs(2001, 6.0)]);
        assert_eq!(result.len(), 1);
        assert!(rates_match(result[0].ad_valorem_rate, 0.06));
        assert_coverage(&result);
    }

    #[test]
    fn test_duplicate_year_inside_run_does_not_split() {
        // 2001 is reported twice; only the later value counts, so every year is 5 %.
        let result = consolidate(vec![
            obs(2000, 5.0),
            obs(2001, 7.0),
            obs(2001, 5.0),
            obs(2002, 5.0),
        ]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].effective_date, date(2000, 1, 1));
        assert_eq!(result[0].expiry_date, None);
        assert!(rates_match(result[0].ad_valorem_rate, 0.05));
    }

    #[test]
    fn test_duplicate_year_keeps_later_regime_boundary() {
        let result = consolidate(vec![obs(2000, 5.0), obs(2001, 5.0), obs(2001, 7.0)]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].expiry_date, Some(date(2000, 12, 31)));
        assert!(rates_match(result[1].ad_valorem_rate, 0.07));
        assert_coverage(&result);
    }

    #[test]
    fn test_reconsolidation_is_stable() {
        let first = consolidate(vec![
            obs(1990, 8.0),
            obs(1991, 8.0),
            obs(1992, 6.5),
            obs(1993, 6.5),
            obs(1994, 6.5),
            obs(1995, 0.0),
        ]);

        let as_observations: Vec<RawObservation> = first
            .iter()
            .map(|r| obs(r.effective_date.year(), r.ad_valorem_rate * 100.0))
            .collect();
        let second = consolidate(as_observations);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.effective_date, b.effective_date);
            assert_eq!(a.expiry_date, b.expiry_date);
            assert!(rates_match(a.ad_valorem_rate, b.ad_valorem_rate));
        }
        assert_coverage(&second);
    }

    #[test]
    fn test_stage_wrapper() {
        let out = Consolidator.execute(vec![obs(2000, 1.0)]).unwrap();
        assert_eq!(out.len(), 1);
    }
}

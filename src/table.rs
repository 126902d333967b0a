use std::collections::{BTreeMap, BTreeSet};

use crate::models::{AggregateTable, MemberRow, RawActivityRecord};

/// Pivots raw per-day observations into a day-indexed table of the members
/// still active on the latest observed day.
///
/// Never fails: records without a parsable day or a numeric gain are
/// skipped, and missing member fields become empty strings.
pub fn build(records: &[RawActivityRecord]) -> AggregateTable {
    let mut members: BTreeMap<(String, String), BTreeMap<i64, f64>> = BTreeMap::new();
    let mut days = BTreeSet::new();

    for record in records {
        let Some(day) = record.period_label.as_deref().and_then(parse_day) else {
            continue;
        };
        let Some(gain) = record.gain.filter(|gain| gain.is_finite()) else {
            continue;
        };

        days.insert(day);
        let key = (
            record.member_id.clone().unwrap_or_default(),
            record.member_name.clone().unwrap_or_default(),
        );
        // First observation for a day wins.
        members.entry(key).or_default().entry(day).or_insert(gain);
    }

    let Some(&latest_day) = days.iter().next_back() else {
        return AggregateTable::default();
    };

    let mut rows: Vec<MemberRow> = members
        .into_iter()
        .filter(|(_, values)| values.contains_key(&latest_day))
        .map(|((member_id, member_name), day_values)| MemberRow {
            avg_per_day: mean(day_values.values().copied()).map_or(0.0, round_half_even),
            member_id,
            member_name,
            day_values,
        })
        .collect();

    // Stable: equal (avg, name) rows keep member_id order from the map.
    rows.sort_by(|a, b| {
        b.avg_per_day
            .total_cmp(&a.avg_per_day)
            .then_with(|| a.member_name.cmp(&b.member_name))
    });

    AggregateTable {
        days: days.into_iter().collect(),
        rows,
    }
}

pub fn parse_day(label: &str) -> Option<i64> {
    label.trim().parse::<i64>().ok()
}

pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Sum that stays absent when nothing was summed.
pub fn sum_present(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values
        .into_iter()
        .fold(None, |total, value| Some(total.unwrap_or(0.0) + value))
}

pub fn round_half_even(value: f64) -> f64 {
    value.round_ties_even()
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Three-way merge of a single field.
use crate::template::AutoMerge;

/// Encoded values of one field on the three sides of a merge, with the time
/// each leaf last changed the record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FieldSides<'a> {
    pub(crate) ancestor: Option<&'a str>,
    pub(crate) ours: Option<&'a str>,
    pub(crate) theirs: Option<&'a str>,
    pub(crate) ours_when: i64,
    pub(crate) theirs_when: i64,
}

/// How a field was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FieldOutcome {
    /// Sides agree, or only ours changed.
    Ours,
    /// Only theirs changed.
    Theirs,
    /// Both changed; a policy decided.
    Auto(AutoMerge, Option<String>),
    /// Both changed and no policy decided.
    Conflict,
}

/// Merges one field, trying `policies` in order when both sides changed it.
pub(crate) fn merge_field(sides: &FieldSides<'_>, policies: &[AutoMerge]) -> FieldOutcome {
    if sides.ours == sides.theirs || sides.theirs == sides.ancestor {
        return FieldOutcome::Ours;
    }
    if sides.ours == sides.ancestor {
        return FieldOutcome::Theirs;
    }
    policies
        .iter()
        .find_map(|op| apply(*op, sides).map(|value| FieldOutcome::Auto(*op, value)))
        .unwrap_or(FieldOutcome::Conflict)
}

/// Result of one policy, `None` when it cannot decide.
fn apply(op: AutoMerge, s: &FieldSides<'_>) -> Option<Option<String>> {
    let ours = || s.ours.map(str::to_owned);
    let theirs = || s.theirs.map(str::to_owned);
    match op {
        AutoMerge::MostRecent | AutoMerge::LeastRecent => {
            if s.ours_when == s.theirs_when {
                return None;
            }
            let ours_newer = s.ours_when > s.theirs_when;
            Some(if ours_newer == (op == AutoMerge::MostRecent) {
                ours()
            } else {
                theirs()
            })
        }
        AutoMerge::Longest | AutoMerge::Shortest => {
            let x = s.ours?.chars().count();
            let y = s.theirs?.chars().count();
            if x == y {
                return None;
            }
            Some(if (x > y) == (op == AutoMerge::Longest) {
                ours()
            } else {
                theirs()
            })
        }
        AutoMerge::Max | AutoMerge::Min => {
            let (x, y) = (int(s.ours)?, int(s.theirs)?);
            let pick = if op == AutoMerge::Max { x.max(y) } else { x.min(y) };
            Some(Some(pick.to_string()))
        }
        AutoMerge::Sum => {
            let base = match s.ancestor {
                None => 0,
                Some(text) => i128::from(text.parse::<i64>().ok()?),
            };
            let (x, y) = (i128::from(int(s.ours)?), i128::from(int(s.theirs)?));
            let total = i64::try_from(x + y - base).ok()?;
            Some(Some(total.to_string()))
        }
        AutoMerge::Average => {
            let (x, y) = (i128::from(int(s.ours)?), i128::from(int(s.theirs)?));
            let mean = i64::try_from((x + y).div_euclid(2)).ok()?;
            Some(Some(mean.to_string()))
        }
    }
}

fn int(text: Option<&str>) -> Option<i64> {
    text?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sides<'a>(a: Option<&'a str>, x: Option<&'a str>, y: Option<&'a str>) -> FieldSides<'a> {
        FieldSides {
            ancestor: a,
            ours: x,
            theirs: y,
            ours_when: 10,
            theirs_when: 20,
        }
    }

    #[test]
    fn one_sided_changes_need_no_policy() {
        assert_eq!(merge_field(&sides(Some("1"), Some("1"), Some("2")), &[]), FieldOutcome::Theirs);
        assert_eq!(merge_field(&sides(Some("1"), Some("2"), Some("1")), &[]), FieldOutcome::Ours);
        assert_eq!(merge_field(&sides(Some("1"), Some("3"), Some("3")), &[]), FieldOutcome::Ours);
        assert_eq!(merge_field(&sides(None, None, Some("3")), &[]), FieldOutcome::Theirs);
    }

    #[test]
    fn divergent_changes_without_policy_conflict() {
        assert_eq!(
            merge_field(&sides(Some("5"), Some("6"), Some("7")), &[]),
            FieldOutcome::Conflict
        );
    }

    #[test]
    fn max_picks_the_larger_value() {
        assert_eq!(
            merge_field(&sides(Some("5"), Some("6"), Some("7")), &[AutoMerge::Max]),
            FieldOutcome::Auto(AutoMerge::Max, Some("7".into()))
        );
        assert_eq!(
            merge_field(&sides(Some("5"), Some("6"), Some("7")), &[AutoMerge::Min]),
            FieldOutcome::Auto(AutoMerge::Min, Some("6".into()))
        );
    }

    #[test]
    fn sum_and_average_combine_both_deltas() {
        assert_eq!(
            merge_field(&sides(Some("5"), Some("6"), Some("7")), &[AutoMerge::Sum]),
            FieldOutcome::Auto(AutoMerge::Sum, Some("8".into()))
        );
        assert_eq!(
            merge_field(&sides(None, Some("2"), Some("3")), &[AutoMerge::Sum]),
            FieldOutcome::Auto(AutoMerge::Sum, Some("5".into()))
        );
        assert_eq!(
            merge_field(&sides(Some("0"), Some("-3"), Some("0")), &[AutoMerge::Average]),
            FieldOutcome::Ours
        );
        assert_eq!(
            merge_field(&sides(Some("0"), Some("-3"), Some("2")), &[AutoMerge::Average]),
            FieldOutcome::Auto(AutoMerge::Average, Some("-1".into()))
        );
    }

    #[test]
    fn recency_uses_leaf_times_and_falls_through_on_ties() {
        let s = sides(Some("a"), Some("b"), Some("c"));
        assert_eq!(
            merge_field(&s, &[AutoMerge::MostRecent]),
            FieldOutcome::Auto(AutoMerge::MostRecent, Some("c".into()))
        );
        assert_eq!(
            merge_field(&s, &[AutoMerge::LeastRecent]),
            FieldOutcome::Auto(AutoMerge::LeastRecent, Some("b".into()))
        );
        let tied = FieldSides {
            theirs_when: 10,
            ..s
        };
        assert_eq!(
            merge_field(&tied, &[AutoMerge::MostRecent, AutoMerge::Longest]),
            FieldOutcome::Conflict
        );
    }

    #[test]
    fn length_policies_skip_equal_lengths() {
        let s = sides(Some("a"), Some("bb"), Some("ccc"));
        assert_eq!(
            merge_field(&s, &[AutoMerge::Shortest]),
            FieldOutcome::Auto(AutoMerge::Shortest, Some("bb".into()))
        );
        let even = sides(Some("a"), Some("bb"), Some("cc"));
        assert_eq!(
            merge_field(&even, &[AutoMerge::Longest, AutoMerge::MostRecent]),
            FieldOutcome::Auto(AutoMerge::MostRecent, Some("cc".into()))
        );
    }
}

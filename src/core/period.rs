use crate::types::{SarError, SarResult, SceneMeta, PERIODS_PER_YEAR};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Length of every period except the last one of the year
pub const PERIOD_LENGTH_DAYS: i64 = 12;

/// Sentinel-1 constellation revisit interval (days)
pub const DEFAULT_REVISIT_DAYS: i64 = 6;

/// One of the 31 fixed calendar buckets of a year
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    /// 1..=31
    pub index: u8,
    pub start: NaiveDate,
    /// Inclusive
    pub end: NaiveDate,
}

impl Period {
    /// Period `index` of `year`; periods 1-30 span 12 days, period 31 runs to Dec 31
    pub fn new(year: i32, index: u8) -> SarResult<Self> {
        if !(1..=PERIODS_PER_YEAR).contains(&index) {
            return Err(SarError::InvalidFormat(format!(
                "Period must be between 1 and {}, got {}",
                PERIODS_PER_YEAR, index
            )));
        }

        let jan1 = NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| SarError::InvalidFormat(format!("Invalid year {}", year)))?;
        let dec31 = NaiveDate::from_ymd_opt(year, 12, 31)
            .ok_or_else(|| SarError::InvalidFormat(format!("Invalid year {}", year)))?;

        let start = jan1 + Duration::days((index as i64 - 1) * PERIOD_LENGTH_DAYS);
        let end = if index == PERIODS_PER_YEAR {
            dec31
        } else {
            start + Duration::days(PERIOD_LENGTH_DAYS - 1)
        };

        Ok(Self { year, index, start, end })
    }

    /// All 31 periods of a year in order
    pub fn all(year: i32) -> SarResult<Vec<Period>> {
        (1..=PERIODS_PER_YEAR).map(|i| Period::new(year, i)).collect()
    }

    /// `min(31, floor((day_of_year - 1) / 12) + 1)`
    pub fn index_for_date(date: NaiveDate) -> u8 {
        let index = date.ordinal0() as i64 / PERIOD_LENGTH_DAYS + 1;
        index.min(PERIODS_PER_YEAR as i64) as u8
    }

    pub fn containing(date: NaiveDate) -> SarResult<Self> {
        Period::new(date.year(), Period::index_for_date(date))
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Band label, e.g. `P01 2024-01-01/2024-01-12`
    pub fn label(&self) -> String {
        format!(
            "P{:02} {}/{}",
            self.index,
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    pub fn midpoint(&self) -> NaiveDateTime {
        let start = self.start.and_hms_opt(0, 0, 0).unwrap_or_default();
        let end = self.end.and_hms_opt(0, 0, 0).unwrap_or_default();
        start + (end - start) / 2
    }

    /// Nominal acquisition dates inside the period for a revisit interval
    pub fn expected_acquisitions(&self, revisit_days: i64) -> Vec<NaiveDate> {
        let step = Duration::days(revisit_days.max(1));
        let mut dates = Vec::new();
        let mut current = self.start;
        while current <= self.end {
            dates.push(current);
            current += step;
        }
        dates
    }

    /// Acquisition inside the period closest to its midpoint
    pub fn closest_to_midpoint(&self, acquisitions: &[NaiveDateTime]) -> Option<NaiveDateTime> {
        let middle = self.midpoint();
        acquisitions
            .iter()
            .filter(|t| self.contains(t.date()))
            .min_by_key(|t| (**t - middle).num_seconds().abs())
            .copied()
    }
}

/// Parse a period selection such as `"1-5,10,15-20"` into sorted, unique indices
pub fn parse_period_list(selection: &str) -> SarResult<Vec<u8>> {
    let invalid = |part: &str| SarError::Config(format!("Invalid period selection '{}'", part));
    let parse = |text: &str| -> SarResult<u8> {
        let index: u8 = text.trim().parse().map_err(|_| invalid(text))?;
        if (1..=PERIODS_PER_YEAR).contains(&index) {
            Ok(index)
        } else {
            Err(invalid(text))
        }
    };

    let mut periods = BTreeSet::new();
    for part in selection.split(',').filter(|p| !p.trim().is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(invalid(part));
                }
                periods.extend(start..=end);
            }
            None => {
                periods.insert(parse(part)?);
            }
        }
    }
    Ok(periods.into_iter().collect())
}

/// Group identity: a period, optionally split by track
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub period: u8,
    pub track: Option<u16>,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.track {
            Some(track) => write!(f, "P{:02}_T{:03}", self.period, track),
            None => write!(f, "P{:02}", self.period),
        }
    }
}

/// Scenes of one group, ordered by acquisition time
#[derive(Debug, Clone)]
pub struct Group<T> {
    pub key: GroupKey,
    pub members: Vec<(SceneMeta, T)>,
}

impl<T> Group<T> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn tracks(&self) -> BTreeSet<u16> {
        self.members.iter().map(|(m, _)| m.track).collect()
    }
}

/// Output of the Temporal Grouper
#[derive(Debug)]
pub struct GroupingResult<T> {
    /// Sorted by key
    pub groups: Vec<Group<T>>,
    /// Scene ids acquired outside the target year
    pub excluded: Vec<String>,
}

impl<T> GroupingResult<T> {
    /// Period indices with at least one group
    pub fn periods(&self) -> BTreeSet<u8> {
        self.groups.iter().map(|g| g.key.period).collect()
    }
}

/// Temporal Grouper: buckets scenes into 12-day periods and optionally tracks
#[derive(Debug, Clone)]
pub struct TemporalGrouper {
    year: i32,
    by_track: bool,
}

impl TemporalGrouper {
    pub fn new(year: i32, by_track: bool) -> Self {
        Self { year, by_track }
    }

    pub fn group<T>(&self, scenes: Vec<(SceneMeta, T)>) -> GroupingResult<T> {
        log::info!(
            "Grouping {} scenes into 12-day periods of {}{}",
            scenes.len(),
            self.year,
            if self.by_track { " (per track)" } else { "" }
        );

        let mut buckets: BTreeMap<GroupKey, Vec<(SceneMeta, T)>> = BTreeMap::new();
        let mut excluded = Vec::new();

        for (meta, item) in scenes {
            if meta.acquired.year() != self.year {
                log::debug!(
                    "Skipping {} (year {} != {})",
                    meta.scene_id,
                    meta.acquired.year(),
                    self.year
                );
                excluded.push(meta.scene_id);
                continue;
            }

            let key = GroupKey {
                period: Period::index_for_date(meta.acquired.date()),
                track: self.by_track.then_some(meta.track),
            };
            buckets.entry(key).or_default().push((meta, item));
        }

        let groups: Vec<Group<T>> = buckets
            .into_iter()
            .map(|(key, mut members)| {
                members.sort_by(|(a, _), (b, _)| {
                    a.acquired.cmp(&b.acquired).then_with(|| a.scene_id.cmp(&b.scene_id))
                });
                log::debug!("  {}: {} scenes", key, members.len());
                Group { key, members }
            })
            .collect();

        log::info!(
            "Formed {} groups ({} scenes outside {})",
            groups.len(),
            excluded.len(),
            self.year
        );

        GroupingResult { groups, excluded }
    }
}

/// Scene and track coverage of one period
#[derive(Debug, Clone, Serialize)]
pub struct PeriodCoverage {
    pub period: u8,
    pub scenes: usize,
    pub tracks: BTreeSet<u16>,
}

/// Spatial completeness of every period of a year
#[derive(Debug, Clone, Serialize)]
pub struct CompletenessReport {
    pub year: i32,
    pub expected_tracks: usize,
    pub coverage: Vec<PeriodCoverage>,
}

impl CompletenessReport {
    /// `expected_tracks` defaults to the largest track count of any single period
    pub fn from_scenes(year: i32, scenes: &[SceneMeta], expected_tracks: Option<usize>) -> Self {
        let mut coverage: Vec<PeriodCoverage> = (1..=PERIODS_PER_YEAR)
            .map(|period| PeriodCoverage {
                period,
                scenes: 0,
                tracks: BTreeSet::new(),
            })
            .collect();

        for meta in scenes.iter().filter(|m| m.acquired.year() == year) {
            let slot = &mut coverage[Period::index_for_date(meta.acquired.date()) as usize - 1];
            slot.scenes += 1;
            slot.tracks.insert(meta.track);
        }

        let busiest = coverage.iter().map(|c| c.tracks.len()).max().unwrap_or(0);
        Self {
            year,
            expected_tracks: expected_tracks.unwrap_or(busiest),
            coverage,
        }
    }

    pub fn missing_periods(&self) -> Vec<u8> {
        self.coverage
            .iter()
            .filter(|c| c.scenes == 0)
            .map(|c| c.period)
            .collect()
    }

    /// Periods with data but fewer tracks than expected (spatial gaps)
    pub fn incomplete_periods(&self) -> Vec<u8> {
        self.coverage
            .iter()
            .filter(|c| c.scenes > 0 && c.tracks.len() < self.expected_tracks)
            .map(|c| c.period)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::scene_id::SceneIdParser;

    fn scene(date: &str, orbit: u32) -> SceneMeta {
        let name = format!(
            "S1A_IW_GRDH_1SDV_{}T224512_{}T224537_{:06}_064BB2_1A2B_VH.tif",
            date, date, orbit
        );
        SceneIdParser::new().unwrap().parse(&name).unwrap()
    }

    #[test]
    fn test_periods_partition_the_year() {
        for year in [2023, 2024] {
            let periods = Period::all(year).unwrap();
            assert_eq!(periods.len(), 31);
            assert_eq!(periods[0].start, NaiveDate::from_ymd_opt(year, 1, 1).unwrap());
            assert_eq!(periods[30].end, NaiveDate::from_ymd_opt(year, 12, 31).unwrap());

            for window in periods.windows(2) {
                assert_eq!(window[0].end + Duration::days(1), window[1].start);
            }
            for period in &periods[..30] {
                assert_eq!(period.days(), 12);
            }
            let total: i64 = periods.iter().map(|p| p.days()).sum();
            let expected = if year == 2024 { 366 } else { 365 };
            assert_eq!(total, expected);
        }
        assert_eq!(Period::new(2023, 31).unwrap().days(), 5);
        assert_eq!(Period::new(2024, 31).unwrap().days(), 6);
    }

    #[test]
    fn test_index_for_date() {
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        assert_eq!(Period::index_for_date(d(1, 1)), 1);
        assert_eq!(Period::index_for_date(d(1, 12)), 1);
        assert_eq!(Period::index_for_date(d(1, 13)), 2);
        assert_eq!(Period::index_for_date(d(12, 30)), 31);
        assert_eq!(Period::index_for_date(d(12, 31)), 31);

        for period in Period::all(2024).unwrap() {
            assert_eq!(Period::index_for_date(period.start), period.index);
            assert_eq!(Period::index_for_date(period.end), period.index);
        }
    }

    #[test]
    fn test_invalid_period_index() {
        assert!(Period::new(2024, 0).is_err());
        assert!(Period::new(2024, 32).is_err());
    }

    #[test]
    fn test_label_and_calendar_helpers() {
        let period = Period::new(2024, 1).unwrap();
        assert_eq!(period.label(), "P01 2024-01-01/2024-01-12");

        let expected = period.expected_acquisitions(DEFAULT_REVISIT_DAYS);
        assert_eq!(
            expected,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()
            ]
        );

        let t = |day| {
            NaiveDate::from_ymd_opt(2024, 1, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        };
        let best = period.closest_to_midpoint(&[t(3), t(9), t(20)]);
        assert_eq!(best, Some(t(9)));
    }

    #[test]
    fn test_grouping_by_period_and_track() {
        let scenes = vec![
            (scene("20240109", 52276), "b"),
            (scene("20240103", 52101), "a"),
            (scene("20240104", 52102), "c"),
            (scene("20240120", 52101), "d"),
            (scene("20230105", 52101), "old"),
        ];

        let by_period = TemporalGrouper::new(2024, false).group(scenes.clone());
        assert_eq!(by_period.groups.len(), 2);
        assert_eq!(by_period.excluded.len(), 1);
        let first = &by_period.groups[0];
        assert_eq!(first.key, GroupKey { period: 1, track: None });
        let order: Vec<&str> = first.members.iter().map(|(_, s)| *s).collect();
        assert_eq!(order, vec!["a", "c", "b"]);

        let by_track = TemporalGrouper::new(2024, true).group(scenes);
        let keys: Vec<GroupKey> = by_track.groups.iter().map(|g| g.key).collect();
        assert_eq!(
            keys,
            vec![
                GroupKey { period: 1, track: Some(126) },
                GroupKey { period: 1, track: Some(127) },
                GroupKey { period: 2, track: Some(126) },
            ]
        );
        assert_eq!(by_track.groups[0].len(), 2);
        assert_eq!(by_track.periods().len(), 2);
        assert_eq!(keys[0].to_string(), "P01_T126");
    }

    #[test]
    fn test_completeness_report() {
        let scenes = vec![
            scene("20240103", 52101),
            scene("20240104", 52102),
            scene("20240115", 52101),
        ];
        let report = CompletenessReport::from_scenes(2024, &scenes, None);
        assert_eq!(report.expected_tracks, 2);
        assert_eq!(report.incomplete_periods(), vec![2]);
        assert_eq!(report.missing_periods().len(), 29);
        assert!(!report.missing_periods().contains(&1));
    }

    #[test]
    fn test_expected_tracks_is_busiest_period_not_year_total() {
        // Three tracks over the year, never more than two in one period
        let scenes = vec![
            scene("20240103", 52101),
            scene("20240104", 52102),
            scene("20240115", 52101),
            scene("20240116", 52103),
            scene("20240128", 52102),
        ];
        let report = CompletenessReport::from_scenes(2024, &scenes, None);
        assert_eq!(report.expected_tracks, 2);
        assert_eq!(report.incomplete_periods(), vec![3]);

        let explicit = CompletenessReport::from_scenes(2024, &scenes, Some(3));
        assert_eq!(explicit.incomplete_periods(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_period_list() {
        assert_eq!(parse_period_list("1").unwrap(), vec![1]);
        assert_eq!(parse_period_list("3,1,2").unwrap(), vec![1, 2, 3]);
        assert_eq!(
            parse_period_list("1-5,10, 15-17,4").unwrap(),
            vec![1, 2, 3, 4, 5, 10, 15, 16, 17]
        );
        assert!(parse_period_list("0").is_err());
        assert!(parse_period_list("30-32").is_err());
        assert!(parse_period_list("5-2").is_err());
        assert!(parse_period_list("x").is_err());
    }
}

//! View projection
//!
//! Turns the packet window into the rows of the inspection table: an
//! optional aggregation by flow, a case insensitive regex filter over the
//! row text, and a sort on one column. Projection is a pure function of
//! its inputs and is recomputed whenever one of them changes.

use super::model::{FlowIdentity, PacketObservation};
use indexmap::IndexMap;
use regex::RegexBuilder;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Timestamp,
    LastSeen,
    Count,
    LayerType,
    NextLayerType,
    Length,
    SrcIp,
    SrcCountryName,
    SrcCityName,
    SrcLatitude,
    SrcLongitude,
    DstIp,
    DstCountryName,
    DstCityName,
    DstLatitude,
    DstLongitude,
}

impl Column {
    pub const ALL: [Column; 16] = [
        Column::Timestamp,
        Column::LastSeen,
        Column::Count,
        Column::LayerType,
        Column::NextLayerType,
        Column::Length,
        Column::SrcIp,
        Column::SrcCountryName,
        Column::SrcCityName,
        Column::SrcLatitude,
        Column::SrcLongitude,
        Column::DstIp,
        Column::DstCountryName,
        Column::DstCityName,
        Column::DstLatitude,
        Column::DstLongitude,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Timestamp => "timestamp",
            Column::LastSeen => "lastSeen",
            Column::Count => "count",
            Column::LayerType => "layerType",
            Column::NextLayerType => "nextLayerType",
            Column::Length => "length",
            Column::SrcIp => "srcIP",
            Column::SrcCountryName => "srcCountryName",
            Column::SrcCityName => "srcCityName",
            Column::SrcLatitude => "srcLatitude",
            Column::SrcLongitude => "srcLongitude",
            Column::DstIp => "dstIP",
            Column::DstCountryName => "dstCountryName",
            Column::DstCityName => "dstCityName",
            Column::DstLatitude => "dstLatitude",
            Column::DstLongitude => "dstLongitude",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Column::Timestamp
                | Column::LastSeen
                | Column::Count
                | Column::Length
                | Column::SrcLatitude
                | Column::SrcLongitude
                | Column::DstLatitude
                | Column::DstLongitude
        )
    }

    /// Only meaningful for aggregated rows.
    pub fn is_summary_only(&self) -> bool {
        matches!(self, Column::LastSeen | Column::Count)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unknown column {0:?}")]
pub struct UnknownColumn(pub String);

impl FromStr for Column {
    type Err = UnknownColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Column::ALL
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| UnknownColumn(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn reversed(self) -> SortDirection {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewOptions {
    pub filter: String,
    /// `None` keeps arrival order.
    pub sort_column: Option<Column>,
    pub direction: SortDirection,
    pub summarized: bool,
}

/// The filter text is not a valid pattern. Rows are shown unfiltered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid filter: {0}")]
pub struct FilterSyntaxError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    /// The observation; when aggregated, the first one of the flow with
    /// its length replaced by the cumulative length.
    pub observation: PacketObservation,
    pub last_seen: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectedView {
    pub rows: Vec<ViewRow>,
    pub bad_filter: Option<FilterSyntaxError>,
}

enum Key<'a> {
    Number(f64),
    Text(&'a str),
}

impl ViewRow {
    fn single(obs: &PacketObservation) -> ViewRow {
        ViewRow {
            observation: obs.clone(),
            last_seen: obs.timestamp,
            count: 1,
        }
    }

    fn key(&self, column: Column) -> Key<'_> {
        let o = &self.observation;
        match column {
            Column::Timestamp => Key::Number(o.timestamp as f64),
            Column::LastSeen => Key::Number(self.last_seen as f64),
            Column::Count => Key::Number(self.count as f64),
            Column::Length => Key::Number(o.length as f64),
            Column::SrcLatitude => Key::Number(o.src_latitude),
            Column::SrcLongitude => Key::Number(o.src_longitude),
            Column::DstLatitude => Key::Number(o.dst_latitude),
            Column::DstLongitude => Key::Number(o.dst_longitude),
            Column::LayerType => Key::Text(&o.layer_type),
            Column::NextLayerType => Key::Text(&o.next_layer_type),
            Column::SrcIp => Key::Text(&o.src_ip),
            Column::SrcCountryName => Key::Text(&o.src_country_name),
            Column::SrcCityName => Key::Text(&o.src_city_name),
            Column::DstIp => Key::Text(&o.dst_ip),
            Column::DstCountryName => Key::Text(&o.dst_country_name),
            Column::DstCityName => Key::Text(&o.dst_city_name),
        }
    }

    /// Cell text of `column`.
    pub fn cell(&self, column: Column) -> String {
        // Integer columns print without a fraction.
        match column {
            Column::Timestamp => self.observation.timestamp.to_string(),
            Column::LastSeen => self.last_seen.to_string(),
            Column::Count => self.count.to_string(),
            Column::Length => self.observation.length.to_string(),
            _ => match self.key(column) {
                Key::Number(n) => n.to_string(),
                Key::Text(t) => t.to_string(),
            },
        }
    }

    /// The text the filter is matched against.
    pub fn text(&self, summarized: bool) -> String {
        Column::ALL
            .iter()
            .filter(|c| summarized || !c.is_summary_only())
            .map(|c| self.cell(*c))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn compare(a: &ViewRow, b: &ViewRow, column: Column) -> Ordering {
    match (a.key(column), b.key(column)) {
        (Key::Number(x), Key::Number(y)) => x.total_cmp(&y),
        (Key::Text(x), Key::Text(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        // Columns never mix key kinds.
        (Key::Number(_), Key::Text(_)) => Ordering::Less,
        (Key::Text(_), Key::Number(_)) => Ordering::Greater,
    }
}

/// Aggregates observations by flow, in order of first appearance.
pub fn summarize<'a>(observations: impl IntoIterator<Item = &'a PacketObservation>) -> Vec<ViewRow> {
    let mut groups: IndexMap<FlowIdentity, ViewRow> = IndexMap::new();
    for obs in observations {
        match groups.get_mut(&obs.identity()) {
            Some(row) => {
                row.observation.length += obs.length;
                row.last_seen = row.last_seen.max(obs.timestamp);
                row.observation.timestamp = row.observation.timestamp.min(obs.timestamp);
                row.count += 1;
            }
            None => {
                groups.insert(obs.identity(), ViewRow::single(obs));
            }
        }
    }
    groups.into_values().collect()
}

/// Projects `observations` (in arrival order) into table rows.
pub fn project<'a>(
    observations: impl IntoIterator<Item = &'a PacketObservation>,
    options: &ViewOptions,
) -> ProjectedView {
    let mut rows = if options.summarized {
        summarize(observations)
    } else {
        observations.into_iter().map(ViewRow::single).collect()
    };

    let mut bad_filter = None;
    if !options.filter.is_empty() {
        match RegexBuilder::new(&options.filter).case_insensitive(true).build() {
            Ok(re) => rows.retain(|row| re.is_match(&row.text(options.summarized))),
            Err(e) => bad_filter = Some(FilterSyntaxError(e.to_string())),
        }
    }

    if let Some(column) = options.sort_column {
        match options.direction {
            SortDirection::Ascending => rows.sort_by(|a, b| compare(a, b, column)),
            SortDirection::Descending => rows.sort_by(|a, b| compare(b, a, column)),
        }
    }

    ProjectedView { rows, bad_filter }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(src: &str, country: &str, timestamp: i64, length: i64) -> PacketObservation {
        PacketObservation {
            timestamp,
            length,
            layer_type: "IPv4".into(),
            next_layer_type: "TCP".into(),
            src_ip: src.into(),
            src_country_name: country.into(),
            dst_ip: "10.0.0.2".into(),
            ..Default::default()
        }
    }

    fn sample() -> Vec<PacketObservation> {
        vec![
            obs("1.1.1.1", "australia", 3, 40),
            obs("8.8.8.8", "United States", 1, 1500),
            obs("9.9.9.9", "Switzerland", 2, 90),
            obs("1.1.1.1", "australia", 4, 60),
        ]
    }

    #[test]
    fn invalid_filter_passes_everything() {
        let packets = sample();
        let view = project(
            &packets,
            &ViewOptions {
                filter: "(unclosed".into(),
                ..Default::default()
            },
        );
        assert_eq!(view.rows.len(), packets.len());
        assert!(view.bad_filter.is_some());
    }

    #[test]
    fn filter_is_case_insensitive_regex() {
        let packets = sample();
        let view = project(
            &packets,
            &ViewOptions {
                filter: "SWITZ|states".into(),
                ..Default::default()
            },
        );
        assert!(view.bad_filter.is_none());
        let srcs: Vec<_> = view.rows.iter().map(|r| r.observation.src_ip.as_str()).collect();
        assert_eq!(srcs, vec!["8.8.8.8", "9.9.9.9"]);
    }

    #[test]
    fn descending_reverses_ascending_for_distinct_keys() {
        let packets = sample();
        for column in [Column::Timestamp, Column::SrcCountryName] {
            let mut options = ViewOptions {
                sort_column: Some(column),
                summarized: true,
                ..Default::default()
            };
            let up = project(&packets, &options).rows;
            options.direction = SortDirection::Descending;
            let mut down = project(&packets, &options).rows;
            down.reverse();
            assert_eq!(up, down, "column {column}");
        }
    }

    #[test]
    fn unsorted_view_keeps_arrival_order_after_filtering() {
        let packets = sample();
        let view = project(
            &packets,
            &ViewOptions {
                filter: r"1\.1\.1\.1|9\.9\.9\.9".into(),
                sort_column: None,
                direction: SortDirection::Descending,
                ..Default::default()
            },
        );
        let timestamps: Vec<_> = view.rows.iter().map(|r| r.observation.timestamp).collect();
        assert_eq!(timestamps, vec![3, 2, 4]);
    }

    #[test]
    fn text_sort_folds_case() {
        let packets = sample();
        let view = project(
            &packets,
            &ViewOptions {
                sort_column: Some(Column::SrcCountryName),
                ..Default::default()
            },
        );
        let countries: Vec<_> = view
            .rows
            .iter()
            .map(|r| r.observation.src_country_name.as_str())
            .collect();
        assert_eq!(
            countries,
            vec!["australia", "australia", "Switzerland", "United States"]
        );
    }

    #[test]
    fn numeric_columns_sort_numerically() {
        let packets = sample();
        let view = project(
            &packets,
            &ViewOptions {
                sort_column: Some(Column::Length),
                direction: SortDirection::Descending,
                ..Default::default()
            },
        );
        let lengths: Vec<_> = view.rows.iter().map(|r| r.observation.length).collect();
        assert_eq!(lengths, vec![1500, 90, 60, 40]);
    }

    #[test]
    fn summarized_rows_aggregate_by_flow() {
        let rows = summarize(&sample());
        assert_eq!(rows.len(), 3);
        let first = &rows[0];
        assert_eq!(first.observation.src_ip, "1.1.1.1");
        assert_eq!(first.observation.timestamp, 3);
        assert_eq!(first.last_seen, 4);
        assert_eq!(first.observation.length, 100);
        assert_eq!(first.count, 2);
    }

    #[test]
    fn column_names_parse() {
        assert_eq!("srcip".parse::<Column>().unwrap(), Column::SrcIp);
        assert_eq!("lastSeen".parse::<Column>().unwrap(), Column::LastSeen);
        assert!("bogus".parse::<Column>().is_err());
    }
}

//! CSV export of table rows.

use super::view::{Column, ViewRow};
use std::io::{self, Write};

/// Exported columns, in file order.
pub const CSV_COLUMNS: [Column; 14] = [
    Column::Timestamp,
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

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Quotes a field containing a separator, a quote or a line break.
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Writes a header line and one line per row. Aggregated rows carry their
/// first-seen timestamp and cumulative length.
pub fn write_csv<W: Write>(out: &mut W, rows: &[ViewRow]) -> Result<usize, ExportError> {
    let header: Vec<&str> = CSV_COLUMNS.iter().map(|c| c.name()).collect();
    writeln!(out, "{}", header.join(","))?;
    for row in rows {
        let fields: Vec<String> = CSV_COLUMNS
            .iter()
            .map(|c| csv_escape(&row.cell(*c)))
            .collect();
        writeln!(out, "{}", fields.join(","))?;
    }
    out.flush()?;
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::model::PacketObservation;
    use crate::flow::view::{project, ViewOptions};

    #[test]
    fn header_order_and_quoting() {
        let packets = vec![PacketObservation {
            timestamp: 1700000000123,
            length: 74,
            layer_type: "IPv4".into(),
            next_layer_type: "TCP".into(),
            src_ip: "203.0.113.9".into(),
            src_country_name: "Korea, Republic of".into(),
            src_city_name: "Seoul".into(),
            src_latitude: 37.5,
            src_longitude: 127.0,
            dst_ip: "10.0.0.2".into(),
            dst_city_name: "say \"hi\"".into(),
            ..Default::default()
        }];
        let view = project(&packets, &ViewOptions::default());
        let mut out = Vec::new();
        assert_eq!(write_csv(&mut out, &view.rows).unwrap(), 1);
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,layerType,nextLayerType,length,srcIP,srcCountryName,srcCityName,\
             srcLatitude,srcLongitude,dstIP,dstCountryName,dstCityName,dstLatitude,dstLongitude"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1700000000123,IPv4,TCP,74,203.0.113.9,\"Korea, Republic of\",Seoul,37.5,127,\
             10.0.0.2,,\"say \"\"hi\"\"\",0,0"
        );
        assert!(lines.next().is_none());
    }
}

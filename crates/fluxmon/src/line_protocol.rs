// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 Line Protocol encoding.
//!
//! ```text
//! measurement,tag1=val1 field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! Only float fields exist in this service's data model; an un-suffixed
//! numeric literal is a float in Line Protocol. See:
//! <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use crate::measurement::Measurement;

/// Encode one measurement as a single Line Protocol line.
///
/// Field order follows the measurement's (sorted) field map, which keeps
/// the output canonical for a given point.
///
/// # Panics
/// Panics if the measurement has no fields (InfluxDB requires at least
/// one); the source adapter never produces field-less readings.
pub fn encode_point(name: &str, tags: &[(&str, &str)], point: &Measurement) -> String {
    assert!(!point.fields.is_empty(), "line protocol requires at least one field");

    let mut line = escape_name(name);

    let mut sorted_tags: Vec<_> = tags.iter().collect();
    sorted_tags.sort_by_key(|(k, _)| *k);
    for (key, value) in sorted_tags {
        line.push(',');
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&escape_tag(value));
    }

    line.push(' ');
    for (i, (key, value)) in point.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_tag(key));
        line.push('=');
        line.push_str(&format_float(*value));
    }

    line.push(' ');
    line.push_str(&point.timestamp_ns().to_string());
    line
}

fn format_float(v: f64) -> String {
    format!("{}", v)
}

/// Measurement names escape commas and spaces.
fn escape_name(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag/field keys and tag values escape commas, equals signs, and spaces.
fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

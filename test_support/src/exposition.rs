//! ABOUTME: Reads single samples back out of text exposition output
//! ABOUTME: Lets tests assert on a scrape without a metrics parser dependency

/// Value of the sample whose name-and-labels part is exactly `series`
///
/// `series` is written as it appears in the exposition, e.g.
/// `http_outbound_requests_total{method="get",host="example.com"}`.
pub fn sample_value(exposition: &str, series: &str) -> Option<f64> {
    exposition
        .lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let value = line.strip_prefix(series)?.strip_prefix(' ')?;
            value.split_whitespace().next()?.parse().ok()
        })
}

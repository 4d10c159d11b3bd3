//! Group accepted probes by country and number them for output.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::AcceptedProbe;

/// Numbered output lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NumberedOutput {
    /// Every member of every qualifying country.
    pub all: Vec<String>,
    /// The first `min_group_size` members of every qualifying country.
    pub top: Vec<String>,
}

impl NumberedOutput {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.top.is_empty()
    }
}

/// Bucket probes by country, keeping arrival order inside each bucket.
pub fn group_by_country<I>(probes: I) -> BTreeMap<String, Vec<AcceptedProbe>>
where
    I: IntoIterator<Item = AcceptedProbe>,
{
    let mut groups: BTreeMap<String, Vec<AcceptedProbe>> = BTreeMap::new();
    for probe in probes {
        groups.entry(probe.country.clone()).or_default().push(probe);
    }
    groups
}

/// Number each qualifying group `1..N`.
///
/// Countries come out in lexicographic order. A group with fewer than
/// `min_group_size` members appears in neither view.
pub fn number_groups(
    groups: &BTreeMap<String, Vec<AcceptedProbe>>,
    min_group_size: usize,
) -> NumberedOutput {
    let mut out = NumberedOutput::default();
    for members in groups.values() {
        if members.len() < min_group_size {
            continue;
        }
        for (i, probe) in members.iter().enumerate() {
            let line = format_line(probe, i + 1);
            if i < min_group_size {
                out.top.push(line.clone());
            }
            out.all.push(line);
        }
    }
    out
}

/// `{endpoint}#{emoji}{country}{n}`, e.g. `104.16.1.1:443#🇯🇵JP3`.
pub fn format_line(probe: &AcceptedProbe, n: usize) -> String {
    format!("{}#{}{}{}", probe.endpoint, probe.emoji, probe.country, n)
}

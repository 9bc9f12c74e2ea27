//! Object-key construction for uploaded archives.

use chrono::{DateTime, Utc};

use crate::error::{BalerError, Result};

/// Turns (subdir, upload wall-time) into the object key for one archive.
pub trait Namer: Send + Sync {
    fn object_name(&self, subdir: &str, t: DateTime<Utc>) -> String;
}

/// The production namer. Keys look like
/// `<experiment>/<datatype>/<subdir>/YYYYMMDDTHHMMSS.uuuuuuZ-<datatype>-<node>-<experiment>.tgz`.
#[derive(Debug, Clone)]
pub struct StandardNamer {
    datatype: String,
    experiment: String,
    node: String,
}

impl StandardNamer {
    pub fn new(datatype: &str, experiment: &str, node: &str) -> Self {
        Self {
            datatype: datatype.to_string(),
            experiment: experiment.to_string(),
            node: node.to_string(),
        }
    }
}

impl Namer for StandardNamer {
    fn object_name(&self, subdir: &str, t: DateTime<Utc>) -> String {
        let timestring = t.format("%Y%m%dT%H%M%S%.6fZ");
        let basename = format!(
            "{timestring}-{}-{}-{}.tgz",
            self.datatype, self.node, self.experiment
        );
        [self.experiment.as_str(), self.datatype.as_str(), subdir, &basename]
            .iter()
            .filter(|segment| !segment.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Derives the `<machine>-<site>` node token from an FQDN-shaped name like
/// `mlab5.abc0t.measurement-lab.org`. The first two labels must each be
/// exactly five characters.
pub fn node_from_fqdn(fqdn: &str) -> Result<String> {
    let mut labels = fqdn.splitn(3, '.');
    let machine = labels.next().unwrap_or("");
    let site = labels.next().unwrap_or("");
    if machine.is_empty() || site.is_empty() {
        return Err(BalerError::Config(format!(
            "node name is missing machine and site fields: {fqdn}"
        )));
    }
    if machine.len() != 5 || site.len() != 5 {
        return Err(BalerError::Config(format!(
            "machine and site names should have five characters each, e.g. mlab5.abc0t: {machine}.{site}"
        )));
    }
    Ok(format!("{machine}-{site}"))
}

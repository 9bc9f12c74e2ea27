//! Command-line and environment configuration.
//!
//! Every flag can also be supplied through the environment variable of the
//! same name in upper case, which is how the sidecar is configured in
//! production manifests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use baler_core::{node_from_fqdn, ByteCount, Spread};
use clap::Parser;

/// One `--datatype` occurrence: a name, optionally with a sampling ratio as
/// `name=0.25`. Files of a sampled datatype that lose the roll are deleted
/// without being archived.
#[derive(Debug, Clone)]
pub struct DatatypeSpec {
    pub name: String,
    pub sample_ratio: f64,
}

impl DatatypeSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, ratio) = match s.split_once('=') {
            Some((name, ratio)) => {
                let ratio: f64 = ratio
                    .parse()
                    .map_err(|e| format!("bad sampling ratio in {s:?}: {e}"))?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(format!("sampling ratio must be in [0, 1], got {ratio}"));
                }
                (name, ratio)
            }
            None => (s, 1.0),
        };
        if name.is_empty() {
            return Err(format!("empty datatype name in {s:?}"));
        }
        Ok(Self {
            name: name.to_string(),
            sample_ratio: ratio,
        })
    }
}

/// `--metadata key=value`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("metadata must look like key=value, got {s:?}")),
    }
}

#[derive(Parser, Debug)]
#[command(name = "baler-agent")]
#[command(about = "Watches a spool directory, bales finished files into tarballs, uploads them, and deletes the sources")]
pub struct Args {
    /// The spool directory to watch. Each datatype gets its own subtree
    /// directly underneath.
    #[arg(long, env = "DIRECTORY")]
    pub directory: PathBuf,

    /// Destination bucket.
    #[arg(long, env = "BUCKET")]
    pub bucket: String,

    /// Cloud project that owns the bucket. Informational.
    #[arg(long, env = "PROJECT", default_value = "")]
    pub project: String,

    /// Experiment token used in object names.
    #[arg(long, env = "EXPERIMENT")]
    pub experiment: String,

    /// Datatype to push, optionally with a sampling ratio (`ndt=0.1`).
    /// Repeatable; at least one is required.
    #[arg(long = "datatype", env = "DATATYPE", value_parser = DatatypeSpec::parse, required = true)]
    pub datatypes: Vec<DatatypeSpec>,

    /// Node token used in object names, e.g. `mlab5-abc0t`.
    #[arg(long = "node_name", env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// FQDN-shaped node name (`mlab5.abc0t.example.org`) from which the node
    /// token is derived when --node_name is not given.
    #[arg(long = "mlab_node_name", env = "MLAB_NODE_NAME")]
    pub mlab_node_name: Option<String>,

    /// Upload a tarball once its compressed size passes this threshold.
    #[arg(long, env = "ARCHIVE_SIZE_THRESHOLD", default_value = "20MB", value_parser = ByteCount::parse)]
    pub archive_size_threshold: ByteCount,

    /// Bounds and mean of the tarball age timer distribution.
    #[arg(long, env = "ARCHIVE_WAIT_TIME_MIN", default_value = "30m")]
    pub archive_wait_time_min: humantime::Duration,
    #[arg(long, env = "ARCHIVE_WAIT_TIME_EXPECTED", default_value = "1h")]
    pub archive_wait_time_expected: humantime::Duration,
    #[arg(long, env = "ARCHIVE_WAIT_TIME_MAX", default_value = "2h")]
    pub archive_wait_time_max: humantime::Duration,

    /// Age beyond which the sweep considers a file abandoned by its producer
    /// and eligible for upload.
    #[arg(long, env = "MAX_FILE_AGE", default_value = "4h")]
    pub max_file_age: humantime::Duration,

    /// Expected and maximum delay between sweeps.
    #[arg(long, env = "CLEANUP_INTERVAL", default_value = "1h")]
    pub cleanup_interval: humantime::Duration,
    #[arg(long, env = "CLEANUP_INTERVAL_MAX", default_value = "4h")]
    pub cleanup_interval_max: humantime::Duration,

    /// Grace period between the terminate signal and the hard flush.
    #[arg(long, env = "SIGTERM_WAIT_TIME", default_value = "150s")]
    pub sigterm_wait_time: humantime::Duration,

    /// Bound on a single upload attempt. Unset means attempts are unbounded
    /// and only the retry loop provides liveness.
    #[arg(long, env = "UPLOAD_TIMEOUT")]
    pub upload_timeout: Option<humantime::Duration>,

    /// Extra key=value pairs recorded on every archive member. Repeatable.
    #[arg(long = "metadata", env = "METADATA", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    /// Address for the Prometheus text endpoint.
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0:9990")]
    pub metrics_address: SocketAddr,

    /// Initialize everything, then exit before processing any files.
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,
}

impl Args {
    /// The node token for object names, from `--node_name` verbatim or
    /// derived from the FQDN form.
    pub fn node(&self) -> anyhow::Result<String> {
        if let Some(node) = &self.node_name {
            if node.is_empty() {
                return Err(anyhow!("--node_name must not be empty"));
            }
            return Ok(node.clone());
        }
        match &self.mlab_node_name {
            Some(fqdn) => node_from_fqdn(fqdn).context("could not derive node from FQDN"),
            None => Err(anyhow!("one of --node_name or --mlab_node_name is required")),
        }
    }

    pub fn age_delays(&self) -> anyhow::Result<Spread> {
        Spread::new(
            self.archive_wait_time_min.into(),
            self.archive_wait_time_expected.into(),
            self.archive_wait_time_max.into(),
        )
        .context("bad archive wait time bounds")
    }

    pub fn cleanup_cadence(&self) -> anyhow::Result<Spread> {
        let expected: std::time::Duration = self.cleanup_interval.into();
        Spread::new(expected / 4, expected, self.cleanup_interval_max.into())
            .context("bad cleanup interval bounds")
    }

    pub fn metadata_map(&self) -> BTreeMap<String, String> {
        self.metadata.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "baler-agent",
            "--directory",
            "/spool",
            "--bucket",
            "archive-bucket",
            "--experiment",
            "mlab",
            "--datatype",
            "ndt",
            "--node_name",
            "mlab5-abc0t",
        ]
    }

    #[test]
    fn minimal_invocation_parses() {
        let args = Args::try_parse_from(base_args()).unwrap();
        assert_eq!(args.datatypes.len(), 1);
        assert_eq!(args.datatypes[0].name, "ndt");
        assert_eq!(args.datatypes[0].sample_ratio, 1.0);
        assert_eq!(args.archive_size_threshold, ByteCount(20_000_000));
        assert_eq!(args.node().unwrap(), "mlab5-abc0t");
        assert!(args.age_delays().is_ok());
        assert!(args.cleanup_cadence().is_ok());
    }

    #[test]
    fn datatype_specs_accept_sampling_ratios() {
        let mut argv = base_args();
        argv.extend(["--datatype", "host=0.25"]);
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.datatypes.len(), 2);
        assert_eq!(args.datatypes[1].name, "host");
        assert_eq!(args.datatypes[1].sample_ratio, 0.25);

        assert!(DatatypeSpec::parse("x=1.5").is_err());
        assert!(DatatypeSpec::parse("x=-0.5").is_err());
        assert!(DatatypeSpec::parse("=0.5").is_err());
    }

    #[test]
    fn datatypes_are_required() {
        let argv = vec![
            "baler-agent",
            "--directory",
            "/spool",
            "--bucket",
            "b",
            "--experiment",
            "e",
            "--node_name",
            "n-x",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn node_token_falls_back_to_fqdn() {
        let mut argv = base_args();
        argv.retain(|a| *a != "--node_name" && *a != "mlab5-abc0t");
        argv.extend(["--mlab_node_name", "mlab5.abc0t.example.org"]);
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.node().unwrap(), "mlab5-abc0t");

        let mut argv = base_args();
        argv.retain(|a| *a != "--node_name" && *a != "mlab5-abc0t");
        let args = Args::try_parse_from(argv).unwrap();
        assert!(args.node().is_err());
    }

    #[test]
    fn metadata_pairs_parse() {
        let mut argv = base_args();
        argv.extend(["--metadata", "image=baler:1.2", "--metadata", "site=abc0t"]);
        let args = Args::try_parse_from(argv).unwrap();
        let map = args.metadata_map();
        assert_eq!(map.get("image").unwrap(), "baler:1.2");
        assert_eq!(map.get("site").unwrap(), "abc0t");

        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=v").is_err());
    }
}

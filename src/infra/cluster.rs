// ============================================================
// Layer 6 — TPU Cluster Resolution
// ============================================================
// Turns the `tpu` config value into a `Cluster`:
//
//   ""                      → Local (no TPU)
//   "grpc://10.0.0.2:8470"  → Endpoint, used as-is
//   "my-tpu"                → Named, looked up by the runtime
//                             in the given zone/project
//
// No network calls happen here; the runtime performs the
// actual lookup when it starts.

use anyhow::{bail, Context, Result};
use regex::Regex;
use url::Url;

use crate::domain::requests::Cluster;
use crate::domain::traits::ClusterResolver;

/// Cloud resource names: lowercase, start with a letter, no trailing dash.
const TPU_NAME_PATTERN: &str = r"^[a-z]([-a-z0-9]*[a-z0-9])?$";

#[derive(Debug, Clone, Copy, Default)]
pub struct TpuClusterResolver;

impl ClusterResolver for TpuClusterResolver {
    fn resolve(
        &self,
        tpu:     &str,
        zone:    Option<&str>,
        project: Option<&str>,
    ) -> Result<Cluster> {
        let tpu = tpu.trim();
        if tpu.is_empty() {
            return Ok(Cluster::Local);
        }

        if tpu.starts_with("grpc://") {
            let url = Url::parse(tpu).with_context(|| format!("invalid TPU address '{tpu}'"))?;
            if url.host_str().is_none() || url.port().is_none() {
                bail!("TPU address '{tpu}' needs both a host and a port");
            }
            return Ok(Cluster::Endpoint(url));
        }

        if !Regex::new(TPU_NAME_PATTERN)?.is_match(tpu) {
            bail!("'{tpu}' is neither a grpc:// address nor a valid TPU name");
        }
        Ok(Cluster::Named {
            name:    tpu.to_string(),
            zone:    zone.map(str::to_string),
            project: project.map(str::to_string),
        })
    }
}

// ============================================================
// Layer 3 — Checkpoint Selector
// ============================================================
// Which checkpoints in the model directory eval/predict run
// against. Explicit steps are matched to the closest step that
// actually exists on disk; `Continuous` keeps waiting for new
// checkpoints as training writes them.

use anyhow::{bail, Result};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSelector {
    /// The newest checkpoint currently on disk
    Latest,
    /// The checkpoint whose step is closest to this one
    Step(u64),
    /// The closest checkpoint for each of these steps
    Steps(Vec<u64>),
    /// Every new checkpoint as it appears, without end
    Continuous,
}

impl CheckpointSelector {
    /// Build a selector from repeated CLI values. No values means
    /// continuous; a single `latest` means the newest checkpoint.
    pub fn from_args(values: &[String]) -> Result<Self> {
        match values {
            []  => Ok(CheckpointSelector::Continuous),
            [one] => one.parse(),
            many => {
                let steps = many
                    .iter()
                    .map(|v| match v.parse()? {
                        CheckpointSelector::Step(s) => Ok(s),
                        _ => bail!("'{v}' cannot be combined with other checkpoint steps"),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CheckpointSelector::Steps(steps))
            }
        }
    }
}

impl From<u64> for CheckpointSelector {
    fn from(step: u64) -> Self {
        CheckpointSelector::Step(step)
    }
}

impl From<Vec<u64>> for CheckpointSelector {
    fn from(steps: Vec<u64>) -> Self {
        CheckpointSelector::Steps(steps)
    }
}

impl FromStr for CheckpointSelector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "latest" | "-1" => Ok(CheckpointSelector::Latest),
            other => other
                .parse::<u64>()
                .map(CheckpointSelector::Step)
                .map_err(|_| anyhow::anyhow!("invalid checkpoint step '{other}'")),
        }
    }
}

impl fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointSelector::Latest      => f.write_str("latest"),
            CheckpointSelector::Step(s)     => write!(f, "{s}"),
            CheckpointSelector::Steps(list) => {
                let parts: Vec<String> = list.iter().map(u64::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            CheckpointSelector::Continuous  => f.write_str("continuous"),
        }
    }
}

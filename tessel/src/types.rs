//! Small enums shared by every algorithm.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Which side of `B` the triangular operand is applied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uplo {
    Lower,
    Upper,
}

impl Uplo {
    pub fn flip(self) -> Self {
        match self {
            Uplo::Lower => Uplo::Upper,
            Uplo::Upper => Uplo::Lower,
        }
    }
}

/// Whether the diagonal of a triangular operand is implicitly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diag {
    Unit,
    NonUnit,
}

/// How a stored tile is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    NoTrans,
    ConjTrans,
}

impl Op {
    pub fn flip(self) -> Self {
        match self {
            Op::NoTrans => Op::ConjTrans,
            Op::ConjTrans => Op::NoTrans,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    One,
    Inf,
    Max,
    Fro,
}

/// Where and how a blocked algorithm executes its tile operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    /// Dependency-tracked tasks on host worker threads.
    #[default]
    HostTask,
    /// Nested parallel loops on the host (rayon).
    HostNest,
    /// Batched tile kernels on the host, one batch per dependency level.
    HostBatch,
    /// Tiles are transferred to their device, processed there and copied back.
    Devices,
}

impl Target {
    pub const ALL: [Target; 4] = [
        Target::HostTask,
        Target::HostNest,
        Target::HostBatch,
        Target::Devices,
    ];
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Target::HostTask => "HostTask",
            Target::HostNest => "HostNest",
            Target::HostBatch => "HostBatch",
            Target::Devices => "Devices",
        };
        f.write_str(name)
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "t" | "task" | "hosttask" => Ok(Target::HostTask),
            "n" | "nest" | "hostnest" => Ok(Target::HostNest),
            "b" | "batch" | "hostbatch" => Ok(Target::HostBatch),
            "d" | "dev" | "device" | "devices" => Ok(Target::Devices),
            _ => Err(Error::InvalidOption {
                key: "target".into(),
                reason: format!("unknown target '{}'", s),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_long_and_short_names() {
        assert_eq!("HostNest".parse::<Target>().unwrap(), Target::HostNest);
        assert_eq!("d".parse::<Target>().unwrap(), Target::Devices);
        assert!("gpu9".parse::<Target>().is_err());
        for target in Target::ALL {
            assert_eq!(target.to_string().parse::<Target>().unwrap(), target);
        }
    }
}

//! Backend selection module.
//!
//! This module defines the kernel backends and the process-wide default used
//! when an [`Executor`](crate::ops::dispatch::Executor) is created without an
//! explicit tag.
//!
//! # Supported Backends
//!
//! - `Naive`: scalar reference kernels, single threaded (default).
//! - `Cpu`: the same kernels fanned out over a bounded `rayon` pool.
//! - `Wgpu`: accelerator offload through `wgpu` compute shaders (`wgpu` feature).
//!
//! All three compute the same function; results agree within a small
//! floating-point tolerance but are not bit-exact.
//!
//! The default is stored in an `AtomicU8`, so changing it is cheap and safe
//! from any thread.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Enumeration of kernel backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Backend {
    /// Scalar reference kernels.
    #[default]
    Naive = 0,
    /// CPU-parallel kernels on a bounded worker pool.
    Cpu = 1,
    /// GPU offload through `wgpu`.
    Wgpu = 2,
}

impl Backend {
    /// Every backend tag, in declaration order.
    pub const ALL: [Self; 3] = [Self::Naive, Self::Cpu, Self::Wgpu];

    /// Lower-case name used on the command line and in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }

    /// `true` if support for this backend is compiled into the crate.
    ///
    /// A compiled-in `Wgpu` backend may still fail to find a device at runtime;
    /// that is reported when the executor is created.
    #[must_use]
    pub const fn is_compiled(self) -> bool {
        match self {
            Self::Naive | Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "naive" | "scalar" => Ok(Self::Naive),
            "cpu" | "parallel" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(Error::Config(format!(
                "unknown backend `{other}` (expected naive, cpu or wgpu)"
            ))),
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Naive),
            1 => Ok(Self::Cpu),
            2 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

/// Process-wide default backend.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Naive as u8);

/// Sets the default backend for executors created with [`get_backend`].
///
/// # Example
/// ```
/// use pico_cnn::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// set_backend(Backend::Naive);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the process-wide default backend.
///
/// If the stored value is invalid, defaults to [`Backend::Naive`].
#[must_use]
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("CPU".parse::<Backend>().unwrap(), Backend::Cpu);
        assert_eq!("gpu".parse::<Backend>().unwrap(), Backend::Wgpu);
        assert_eq!("naive".parse::<Backend>().unwrap(), Backend::Naive);
        assert!("cgra".parse::<Backend>().is_err());
    }

    #[test]
    fn u8_round_trip_rejects_unknown() {
        for b in Backend::ALL {
            assert_eq!(Backend::try_from(b as u8), Ok(b));
        }
        assert!(Backend::try_from(9).is_err());
    }
}

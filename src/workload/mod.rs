//! Converts MapReduce application names to actual application code.
//!
//! # Example
//!
//! To get the word count application:
//! ```
//! # use anyhow::Result;
//! // This is the correct import to use if you are outside the crate:
//! use mrstream::workload;
//! // Since you will be working within the `mrstream` crate,
//! // you should write `use crate::workload;` instead.
//! # fn main() -> Result<()> {
//! let wc = workload::named("wc")?;
//! # Ok(())
//! # }
//! ```

use crate::Workload;
use anyhow::{bail, Result};

pub mod count;
pub mod grep;
pub mod identity;
pub mod sum;
pub mod wc;

/// Names accepted by [`named`].
pub const NAMES: &[&str] = &["wc", "grep", "identity", "sum", "count"];

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload::new(wc::map, wc::reduce)),
        "grep" => Some(Workload::new(grep::map, grep::reduce).with_value_order(grep::by_line_number)),
        "identity" => Some(Workload::new(identity::map, identity::reduce)),
        "sum" => Some(Workload::new(identity::map, sum::reduce)),
        "count" => Some(Workload::new(identity::map, count::reduce)),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}

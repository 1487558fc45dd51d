// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! The types in this module make up the structure of the TOML configuration
//! file consumed by the `tablesync` binary:
//!
//! ```toml
//! [[table]]
//! name = "filter"
//! ip_version = 4
//! hash_prefix = "ts:"
//! chain_prefixes = ["ts-"]
//!
//! [[table.chain]]
//! name = "ts-fwd"
//! rules = [
//!     "-m conntrack --ctstate INVALID -j DROP",
//!     "-j ACCEPT",
//! ]
//!
//! [table.insertions]
//! FORWARD = ["-j ts-fwd"]
//! ```

use errors::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;

/// The whole configuration: one section per table to synchronize.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    /// The tables to synchronize.
    #[serde(rename = "table", default)]
    pub tables: Vec<TableConfig>,
}

impl Config {
    /// Load a configuration from the TOML file at `path`.
    pub fn load_file(path: &str) -> Result<Config> {
        let mut contents = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
        Ok(::toml::from_str(&contents)?)
    }
}

/// Desired state of one kernel table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableConfig {
    /// Name of the kernel table, one of `filter`, `nat`, `mangle`, `raw`.
    pub name: String,

    /// IP protocol version, 4 or 6. Defaults to 4.
    #[serde(default = "default_ip_version")]
    pub ip_version: u8,

    /// Prefix tagging rule hashes inside comments.
    pub hash_prefix: String,

    /// Every chain-name prefix this deployment has ever used.
    pub chain_prefixes: Vec<String>,

    /// Additional regex alternation recognizing rules written by versions
    /// that predate hash comments.
    #[serde(default)]
    pub extra_cleanup_regex: Option<String>,

    /// The chains to manage in full.
    #[serde(rename = "chain", default)]
    pub chains: Vec<ChainConfig>,

    /// Rule-specs to insert at the top of the given (typically
    /// kernel-created) chains.
    #[serde(default)]
    pub insertions: BTreeMap<String, Vec<String>>,
}

fn default_ip_version() -> u8 {
    4
}

/// A fully managed chain and its ordered rule-specs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainConfig {
    /// Name of the chain; has to match one of the configured prefixes.
    pub name: String,

    /// The rule-specs of the chain, in order.
    pub rules: Vec<String>,
}

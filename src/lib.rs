// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! # tablesync - kernel packet-filter table synchronizer
//!
//! `tablesync` owns the desired state of a single kernel packet-filter table
//! (`filter`, `nat`, `mangle` or `raw`, IPv4 or IPv6) and drives the actual
//! in-kernel state towards it. Callers describe whole chains and per-chain
//! rule insertions through the [`Table`](table/struct.Table.html) API;
//! [`Table::apply`](table/struct.Table.html#method.apply) then computes a
//! minimal diff against what the kernel currently holds and submits it as a
//! single atomic `iptables-restore` transaction.
//!
//! Rules written by this crate carry a short hash in their first comment,
//! which allows them to be recognized in `iptables-save` output without
//! parsing rule bodies. Rules and chains written by anyone else are left
//! untouched, with one exception: rules matching a caller-supplied
//! legacy-insert pattern are cleaned up on the first apply.
//!
//! ## Example
//!
//! ```no_run
//! # #[macro_use] extern crate slog;
//! # extern crate tablesync;
//! # use tablesync::command::*;
//! # use tablesync::rules::*;
//! # use tablesync::table::*;
//! # fn main() {
//! let logger = slog::Logger::root(slog::Discard, o!());
//! let options = TableOptionsBuilder::default()
//!     .name("filter")
//!     .ip_version(IPVersion::IPv4)
//!     .historic_chain_prefixes(vec!["ts-".to_owned()])
//!     .hash_prefix("ts:")
//!     .build()
//!     .unwrap();
//! let mut table = Table::new(options, Box::new(ProcessCommandFactory), &logger).unwrap();
//!
//! table.update_chain(Chain::new("ts-FORWARD", vec![Rule::new("-j ACCEPT")]));
//! table.set_rule_insertions("FORWARD", vec![Rule::new("-j ts-FORWARD")]);
//! table.apply().unwrap();
//! # }
//! ```

#![deny(missing_docs)]

extern crate base64;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate lazy_static;
extern crate regex;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate sha2;
#[macro_use]
extern crate slog;
extern crate toml;

#[cfg(test)]
#[macro_use]
extern crate maplit;

pub mod command;
pub mod errors;
pub mod rules;
pub mod table;
pub mod types;

// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! This module holds [`Table`](struct.Table.html), the synchronizer for a
//! single kernel packet-filter table.
//!
//! A `Table` keeps two pictures of the world: the *desired* state (whole
//! chains owned by us, plus rules to insert at the top of kernel-created
//! chains) and the *believed dataplane* state (the hash sequences we think
//! the kernel currently holds, learned from `iptables-save` output).
//! [`Table::apply`](struct.Table.html#method.apply) reconciles the two and
//! submits the difference as one `iptables-restore` transaction, touching
//! only the rules whose hashes changed so that the kernel keeps the packet
//! counters of everything else.
//!
//! All methods of a `Table` have to be called from a single thread; the
//! kernel table itself is the shared resource, and concurrent writers are
//! handled by rescanning and retrying, not by locking.

use command::{CommandFactory, IPVersion};
use errors::*;
use regex::Regex;
use rules::{rule_hashes, Chain, Rule};
use slog::Logger;
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::thread;
use std::time::Duration;

// Built-in chains the kernel creates per table, from iptables(8).
static KERNEL_CHAINS_FILTER: &'static [&'static str] = &["INPUT", "FORWARD", "OUTPUT"];
static KERNEL_CHAINS_MANGLE: &'static [&'static str] =
    &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];
static KERNEL_CHAINS_NAT: &'static [&'static str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];
static KERNEL_CHAINS_RAW: &'static [&'static str] = &["PREROUTING", "OUTPUT"];

/// Placeholder hash recorded for rules written by versions of this software
/// that predate hash comments. It can never equal a real hash, so any such
/// rule is cleaned up by the first apply that touches its chain.
const OLD_INSERT_SENTINEL: &'static str = "OLD INSERT RULE";

/// Number of times `apply` attempts to program the kernel before giving up.
const MAX_APPLY_ATTEMPTS: u32 = 10;

lazy_static! {
    static ref CHAIN_DECLARATION_RE: Regex = Regex::new(r"^:(\S+)").unwrap();
    static ref RULE_APPEND_RE: Regex = Regex::new(r"^-A (\S+)").unwrap();
}

fn kernel_chains(table: &str) -> Result<&'static [&'static str]> {
    match table {
        "filter" => Ok(KERNEL_CHAINS_FILTER),
        "mangle" => Ok(KERNEL_CHAINS_MANGLE),
        "nat" => Ok(KERNEL_CHAINS_NAT),
        "raw" => Ok(KERNEL_CHAINS_RAW),
        _ => Err(SyncError::UnknownTable {
            table: table.to_owned(),
        }.into()),
    }
}

/// Construction parameters for a [`Table`](struct.Table.html).
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct TableOptions {
    /// Name of the kernel table, one of `filter`, `nat`, `mangle`, `raw`.
    pub name: String,

    /// IP protocol version; selects the save/restore utilities.
    pub ip_version: IPVersion,

    /// Every chain-name prefix this software has ever used. Chains matching
    /// `^(p1|p2|…)` are considered ours and fully managed, which is also
    /// what allows chains left behind by previous versions to be cleaned up.
    pub historic_chain_prefixes: Vec<String>,

    /// Prefix tagging our hashes inside rule comments, e.g. `ts:`.
    pub hash_prefix: String,

    /// Additional regex alternation for recognizing rules inserted by older
    /// versions that did not write hash comments yet.
    #[builder(default)]
    pub extra_cleanup_regex: Option<String>,
}

/// Synchronizer for one kernel packet-filter table on one IP version.
///
/// There must be at most one `Table` per (IP version, table name) pair
/// within a process. Caller mutations are batched and only take effect at
/// the next [`apply`](#method.apply).
pub struct Table {
    name: String,
    ip_version: IPVersion,

    /// Desired contents of the chains we own, keyed by chain name.
    desired_chains: BTreeMap<String, Chain>,

    /// Desired rule insertions per (typically kernel-created) chain.
    /// Pre-populated with an empty entry for every kernel chain of this
    /// table so stale insertions from a previous run are detected and
    /// removed on the first apply.
    inserted_rules: BTreeMap<String, Vec<Rule>>,

    /// Chain names with pending whole-chain work (update or deletion).
    dirty_chains: BTreeSet<String>,

    /// Chain names with pending insertion work.
    dirty_inserts: BTreeSet<String>,

    /// The hash sequences we believe each kernel chain currently holds.
    /// An empty string in a slot marks a rule we do not own. Only updated
    /// after a successful restore or a fresh scan.
    ///
    /// ## Note
    ///
    /// `BTreeMap`/`BTreeSet` are used for all chain collections to make
    /// sure the order of emitted restore lines is deterministic, mainly
    /// because the test-suite requires deterministic ordering.
    dataplane_hashes: BTreeMap<String, Vec<String>>,

    /// When false, the next apply rescans the kernel before generating the
    /// restore script.
    in_sync_with_dataplane: bool,

    hash_prefix: String,
    owned_chains_re: Regex,
    hash_comment_re: Regex,
    legacy_insert_re: Regex,

    command_factory: Box<dyn CommandFactory>,
    log: Logger,
}

impl Table {
    /// Create a new `Table` from its options, the factory used to reach the
    /// save/restore utilities, and a parent logger.
    ///
    /// Fails if the table name is not a known kernel table or if one of the
    /// caller-supplied patterns does not compile.
    pub fn new(
        options: TableOptions,
        command_factory: Box<dyn CommandFactory>,
        root_log: &Logger,
    ) -> Result<Table> {
        let TableOptions {
            name,
            ip_version,
            historic_chain_prefixes,
            hash_prefix,
            extra_cleanup_regex,
        } = options;

        let log = root_log.new(o!(
            "table" => name.clone(),
            "ip_version" => format!("{:?}", ip_version),
        ));

        let owned_chains_re = Regex::new(&format!("^({})", historic_chain_prefixes.join("|")))?;
        let hash_comment_re = Regex::new(&format!(
            "-m comment --comment \"?{}(?P<hash>[a-zA-Z0-9_-]+)",
            hash_prefix
        ))?;
        let mut legacy_insert_parts: Vec<String> = historic_chain_prefixes
            .iter()
            .map(|prefix| format!("-j {}", prefix))
            .collect();
        if let Some(extra) = extra_cleanup_regex {
            legacy_insert_parts.push(extra);
        }
        let legacy_insert_re = Regex::new(&format!("({})", legacy_insert_parts.join("|")))?;

        let mut inserted_rules = BTreeMap::new();
        let mut dirty_inserts = BTreeSet::new();
        for chain_name in kernel_chains(&name)? {
            inserted_rules.insert(chain_name.to_string(), Vec::new());
            dirty_inserts.insert(chain_name.to_string());
        }

        Ok(Table {
            name: name,
            ip_version: ip_version,
            desired_chains: BTreeMap::new(),
            inserted_rules: inserted_rules,
            dirty_chains: BTreeSet::new(),
            dirty_inserts: dirty_inserts,
            dataplane_hashes: BTreeMap::new(),
            in_sync_with_dataplane: false,
            hash_prefix: hash_prefix,
            owned_chains_re: owned_chains_re,
            hash_comment_re: hash_comment_re,
            legacy_insert_re: legacy_insert_re,
            command_factory: command_factory,
            log: log,
        })
    }

    /// Replace the list of rules to insert at the top of `chain_name`.
    ///
    /// The chain is typically one of the kernel-created chains of this
    /// table; the insertions divert traffic into our own chains.
    pub fn set_rule_insertions(&mut self, chain_name: &str, rules: Vec<Rule>) {
        info!(self.log, "Queueing update of rule insertions";
              "chain" => chain_name.to_owned(), "num_rules" => rules.len());
        self.inserted_rules.insert(chain_name.to_owned(), rules);
        self.dirty_inserts.insert(chain_name.to_owned());
    }

    /// Install or replace a whole owned chain.
    pub fn update_chain(&mut self, chain: Chain) {
        info!(self.log, "Queueing update of chain";
              "chain" => chain.name.clone(), "num_rules" => chain.rules.len());
        self.dirty_chains.insert(chain.name.clone());
        self.desired_chains.insert(chain.name.clone(), chain);
    }

    /// Install or replace several owned chains.
    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    /// Schedule the chain with the given name for deletion.
    pub fn remove_chain_by_name(&mut self, name: &str) {
        info!(self.log, "Queueing deletion of chain"; "chain" => name.to_owned());
        self.desired_chains.remove(name);
        self.dirty_chains.insert(name.to_owned());
    }

    /// Schedule the given chains for deletion.
    pub fn remove_chains(&mut self, chains: &[Chain]) {
        for chain in chains {
            self.remove_chain_by_name(&chain.name);
        }
    }

    /// Discard the believed dataplane state, forcing a rescan on the next
    /// apply. Call this whenever the kernel table may have been modified
    /// behind our back.
    pub fn invalidate_dataplane_cache(&mut self) {
        debug!(self.log, "Dataplane cache invalidated, next apply will rescan");
        self.in_sync_with_dataplane = false;
    }

    /// Reconcile the desired state against the kernel and program any
    /// difference.
    ///
    /// Losing a race against a concurrent writer makes the restore utility
    /// fail the whole transaction; that is expected and handled by
    /// rescanning and retrying with exponential backoff. Only after
    /// exhausting the retry budget is the error surfaced to the caller,
    /// and no partial success is ever reported.
    pub fn apply(&mut self) -> Result<()> {
        let mut backoff_ms: u64 = 1;
        let mut failures = 0;
        loop {
            match self.try_apply() {
                Ok(()) => {
                    if failures > 0 {
                        warn!(self.log, "Retry was successful"; "num_failures" => failures);
                    }
                    return Ok(());
                }
                Err(error) => {
                    failures += 1;
                    if failures >= MAX_APPLY_ATTEMPTS {
                        crit!(self.log, "Failed to update table, giving up";
                              "attempts" => failures, "error" => %error);
                        return Err(SyncError::RetriesExhausted {
                            table: self.name.clone(),
                            attempts: failures,
                            last_error: format!("{}", error),
                        }.into());
                    }
                    warn!(self.log, "Failed to update table, will retry";
                          "error" => %error, "backoff_ms" => backoff_ms);
                    thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
            }
        }
    }

    fn try_apply(&mut self) -> Result<()> {
        if !self.in_sync_with_dataplane {
            self.load_dataplane_state()?;
        }
        self.apply_updates()
    }

    /// Scan the kernel and queue a resync for every chain whose actual
    /// contents diverged from what we believe we programmed.
    fn load_dataplane_state(&mut self) -> Result<()> {
        debug!(self.log, "Scanning dataplane state");
        let dataplane_hashes = self.hashes_from_dataplane()?;

        let mut out_of_sync_chains = Vec::new();
        let mut out_of_sync_inserts = Vec::new();
        for (chain_name, programmed_hashes) in &self.dataplane_hashes {
            if self.dirty_chains.contains(chain_name) || self.dirty_inserts.contains(chain_name) {
                // Queued for a rewrite anyway, no point in diffing it.
                continue;
            }
            let dp_hashes = dataplane_hashes
                .get(chain_name)
                .map(|hashes| &hashes[..])
                .unwrap_or(&[]);
            if !self.is_owned_chain(chain_name) {
                // A chain we only insert into: our rules have to sit as an
                // uninterrupted prefix, foreign rules may follow behind.
                let expected_hashes = rule_hashes(
                    chain_name,
                    self.inserted_rules
                        .get(chain_name)
                        .map(|rules| &rules[..])
                        .unwrap_or(&[]),
                );
                if !inserted_rules_in_sync(dp_hashes, &expected_hashes) {
                    info!(self.log, "Out-of-sync rule insertions, queueing resync";
                          "chain" => chain_name.clone());
                    out_of_sync_inserts.push(chain_name.clone());
                }
            } else if dp_hashes != &programmed_hashes[..] {
                info!(self.log, "Out-of-sync chain, queueing resync";
                      "chain" => chain_name.clone());
                out_of_sync_chains.push(chain_name.clone());
            }
        }

        // Owned chains that exist in the kernel without us remembering them
        // are left-overs, either from a crash or from a previous version.
        // Queueing them as dirty makes the generator delete them.
        for chain_name in dataplane_hashes.keys() {
            if self.dataplane_hashes.contains_key(chain_name)
                || self.dirty_chains.contains(chain_name)
                || self.dirty_inserts.contains(chain_name)
            {
                continue;
            }
            if !self.is_owned_chain(chain_name) {
                continue;
            }
            info!(self.log, "Unexpected chain in dataplane, queueing deletion";
                  "chain" => chain_name.clone());
            out_of_sync_chains.push(chain_name.clone());
        }

        self.dirty_chains.extend(out_of_sync_chains);
        self.dirty_inserts.extend(out_of_sync_inserts);
        self.dataplane_hashes = dataplane_hashes;
        self.in_sync_with_dataplane = true;
        Ok(())
    }

    /// Run the save utility and extract the hash sequence of every chain of
    /// this table.
    fn hashes_from_dataplane(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let save_command = self.ip_version.save_command();
        let mut command = self
            .command_factory
            .make_command(save_command, &["-t", &self.name]);
        let output = command.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(self.log, "Save utility failed";
                  "command" => save_command, "stderr" => stderr.clone());
            return Err(SyncError::DataplaneReadFailed {
                command: save_command.to_owned(),
                status: output.status,
                stderr: stderr,
            }.into());
        }
        Ok(self.hashes_from_save_output(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Extract per-chain hash sequences from save-utility output.
    ///
    /// Rules carrying one of our hash comments map to that hash, rules
    /// matching the legacy-insert pattern map to a sentinel, anything else
    /// maps to the empty string.
    fn hashes_from_save_output(&self, save_output: &str) -> BTreeMap<String, Vec<String>> {
        let mut hashes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in save_output.lines() {
            if let Some(captures) = CHAIN_DECLARATION_RE.captures(line) {
                hashes.entry(captures[1].to_owned()).or_insert_with(Vec::new);
            } else if let Some(captures) = RULE_APPEND_RE.captures(line) {
                let chain_name = captures[1].to_owned();
                let hash = if let Some(hash_captures) = self.hash_comment_re.captures(line) {
                    hash_captures["hash"].to_owned()
                } else if self.legacy_insert_re.is_match(line) {
                    OLD_INSERT_SENTINEL.to_owned()
                } else {
                    String::new()
                };
                hashes.entry(chain_name).or_insert_with(Vec::new).push(hash);
            }
        }
        hashes
    }

    /// Build the restore transaction for everything queued as dirty and, if
    /// it has any content, submit it to the restore utility.
    fn apply_updates(&mut self) -> Result<()> {
        let mut input = String::new();
        writeln!(input, "*{}", self.name)?;
        let header_len = input.len();

        // Hash sequences to commit to `dataplane_hashes` once the restore
        // goes through; `None` records a chain deletion.
        let mut new_hashes: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();

        // Create or flush every dirty chain that is either going away (the
        // flush severs references out of it before the deletion below) or
        // not yet known to the kernel. `:<chain> - -` does both.
        for chain_name in &self.dirty_chains {
            let chain_needs_flush = !self.desired_chains.contains_key(chain_name)
                || !self.dataplane_hashes.contains_key(chain_name);
            if chain_needs_flush {
                writeln!(input, ":{} - -", chain_name)?;
            }
        }

        // Bring the contents of owned chains in line, slot by slot. Slots
        // whose hash is unchanged are not touched at all, which is what
        // preserves their kernel packet counters.
        for chain_name in &self.dirty_chains {
            let chain = match self.desired_chains.get(chain_name) {
                Some(chain) => chain,
                None => continue,
            };
            let previous_hashes = self
                .dataplane_hashes
                .get(chain_name)
                .map(|hashes| &hashes[..])
                .unwrap_or(&[]);
            let current_hashes = chain.rule_hashes();
            for i in 0..cmp::max(previous_hashes.len(), current_hashes.len()) {
                if i < previous_hashes.len() && i < current_hashes.len() {
                    if previous_hashes[i] == current_hashes[i] {
                        continue;
                    }
                    let prefix_fragment = self.comment_fragment(&current_hashes[i]);
                    writeln!(
                        input,
                        "{}",
                        chain.rules[i].render_replace(chain_name, i + 1, &prefix_fragment)
                    )?;
                } else if i < previous_hashes.len() {
                    // Every deletion removes from the tail, so the rule
                    // number is the same each time.
                    writeln!(input, "-D {} {}", chain_name, current_hashes.len() + 1)?;
                } else {
                    let prefix_fragment = self.comment_fragment(&current_hashes[i]);
                    writeln!(
                        input,
                        "{}",
                        chain.rules[i].render_append(chain_name, &prefix_fragment)
                    )?;
                }
            }
            new_hashes.insert(chain_name.clone(), Some(current_hashes));
        }

        // Rewrite our insertions at the top of chains we do not own. Old
        // copies of our rules are taken out back-to-front so rule numbers
        // stay valid while we go; foreign rules are never touched.
        for chain_name in &self.dirty_inserts {
            let empty = Vec::new();
            let inserted_rules = self.inserted_rules.get(chain_name).unwrap_or(&empty);
            let previous_hashes = self
                .dataplane_hashes
                .get(chain_name)
                .map(|hashes| &hashes[..])
                .unwrap_or(&[]);
            let mut current_hashes = rule_hashes(chain_name, inserted_rules);

            if inserted_rules_in_sync(previous_hashes, &current_hashes) {
                continue;
            }

            for i in (0..previous_hashes.len()).rev() {
                if !previous_hashes[i].is_empty() {
                    writeln!(input, "-D {} {}", chain_name, i + 1)?;
                } else {
                    // A foreign rule survives the rewrite and will sit
                    // behind our insertions; account for it.
                    current_hashes.push(String::new());
                }
            }
            for i in (0..inserted_rules.len()).rev() {
                let prefix_fragment = self.comment_fragment(&current_hashes[i]);
                writeln!(
                    input,
                    "{}",
                    inserted_rules[i].render_insert(chain_name, &prefix_fragment)
                )?;
            }
            new_hashes.insert(chain_name.clone(), Some(current_hashes));
        }

        // Delete chains that are no longer desired; their flush above has
        // already severed any references into other chains.
        for chain_name in &self.dirty_chains {
            if self.desired_chains.contains_key(chain_name) {
                continue;
            }
            if !self.dataplane_hashes.contains_key(chain_name) {
                return Err(SyncError::InconsistentState {
                    chain: chain_name.clone(),
                }.into());
            }
            writeln!(input, "--delete-chain {}", chain_name)?;
            new_hashes.insert(chain_name.clone(), None);
        }

        if input.len() > header_len {
            input.push_str("COMMIT\n");
            let restore_command = self.ip_version.restore_command();
            debug!(self.log, "Sending restore input"; "input" => input.clone());
            let mut command = self
                .command_factory
                .make_command(restore_command, &["--noflush", "--verbose"]);
            command.set_stdin(&input);
            let output = command.output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
                self.in_sync_with_dataplane = false;
                warn!(self.log, "Restore utility failed, marking dataplane for rescan";
                      "command" => restore_command,
                      "stderr" => stderr.clone(),
                      "input" => input.clone());
                return Err(SyncError::DataplaneWriteFailed {
                    command: restore_command.to_owned(),
                    status: output.status,
                    stderr: stderr,
                }.into());
            }
        }

        for (chain_name, hashes) in new_hashes {
            match hashes {
                Some(hashes) => {
                    self.dataplane_hashes.insert(chain_name, hashes);
                }
                None => {
                    self.dataplane_hashes.remove(&chain_name);
                }
            }
        }
        self.dirty_chains.clear();
        self.dirty_inserts.clear();
        Ok(())
    }

    fn is_owned_chain(&self, chain_name: &str) -> bool {
        self.owned_chains_re.is_match(chain_name)
    }

    fn comment_fragment(&self, hash: &str) -> String {
        format!("-m comment --comment \"{}{}\"", self.hash_prefix, hash)
    }
}

/// Check whether the scanned hash sequence of a chain we insert into is
/// consistent with the expected insertion hashes: our rules form an
/// uninterrupted prefix in the right order, every foreign slot comes after
/// them, and no further rule of ours exists anywhere in the chain.
fn inserted_rules_in_sync(dataplane_hashes: &[String], expected_hashes: &[String]) -> bool {
    let mut seen_foreign_rule = false;
    let mut our_rules = 0;
    for (i, hash) in dataplane_hashes.iter().enumerate() {
        if hash.is_empty() {
            seen_foreign_rule = true;
            continue;
        }
        if seen_foreign_rule || i >= expected_hashes.len() || *hash != expected_hashes[i] {
            return false;
        }
        our_rules += 1;
    }
    our_rules == expected_hashes.len()
}

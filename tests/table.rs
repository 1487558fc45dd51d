// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

#[macro_use]
extern crate slog;
extern crate tablesync;

use slog::{Discard, Logger};
use tablesync::command::{IPVersion, LoggingCommandFactory};
use tablesync::rules::{rule_hashes, Chain, Rule};
use tablesync::table::{Table, TableOptionsBuilder};

const SAVE: &'static str = "iptables-save";
const RESTORE: &'static str = "iptables-restore";

fn empty_filter_save_output() -> &'static str {
    "# Generated by iptables-save v1.6.1 on Thu Jul 12 10:10:23 2018\n\
     *filter\n\
     :INPUT ACCEPT [0:0]\n\
     :FORWARD ACCEPT [0:0]\n\
     :OUTPUT ACCEPT [0:0]\n\
     COMMIT\n"
}

fn new_table(name: &str) -> (Table, LoggingCommandFactory) {
    let factory = LoggingCommandFactory::new();
    factory.set_stdout(SAVE, empty_filter_save_output());

    let options = TableOptionsBuilder::default()
        .name(name)
        .ip_version(IPVersion::IPv4)
        .historic_chain_prefixes(vec!["ts-".to_owned()])
        .hash_prefix("ts:")
        .build()
        .unwrap();
    let log = Logger::root(Discard, o!());
    let table = Table::new(options, Box::new(factory.clone()), &log).unwrap();
    (table, factory)
}

fn comment(hash: &str) -> String {
    format!("-m comment --comment \"ts:{}\"", hash)
}

#[test]
fn cold_start_programs_chain_and_insertion() {
    let (mut table, factory) = new_table("filter");

    let chain = Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-m conntrack --ctstate INVALID -j DROP"),
            Rule::new("-j ACCEPT"),
        ],
    );
    let chain_hashes = chain.rule_hashes();
    let insertions = vec![Rule::new("-j ts-fwd")];
    let insert_hashes = rule_hashes("FORWARD", &insertions);

    table.update_chain(chain);
    table.set_rule_insertions("FORWARD", insertions);
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec![format!(
            "*filter\n\
             :ts-fwd - -\n\
             -A ts-fwd {} -m conntrack --ctstate INVALID -j DROP\n\
             -A ts-fwd {} -j ACCEPT\n\
             -I FORWARD 1 {} -j ts-fwd\n\
             COMMIT\n",
            comment(&chain_hashes[0]),
            comment(&chain_hashes[1]),
            comment(&insert_hashes[0]),
        )]
    );
}

#[test]
fn second_apply_is_a_no_op() {
    let (mut table, factory) = new_table("filter");

    let chain = Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]);
    let chain_hashes = chain.rule_hashes();
    let insertions = vec![Rule::new("-j ts-fwd")];
    let insert_hashes = rule_hashes("FORWARD", &insertions);

    table.update_chain(chain);
    table.set_rule_insertions("FORWARD", insertions);
    table.apply().unwrap();
    assert_eq!(factory.invocations_of(RESTORE), 1);

    // Nothing queued and still in sync: no scan, no restore.
    table.apply().unwrap();
    assert_eq!(factory.invocations_of(SAVE), 1);
    assert_eq!(factory.invocations_of(RESTORE), 1);

    // A rescan that finds exactly what we programmed queues no work either.
    factory.set_stdout(
        SAVE,
        &format!(
            "*filter\n\
             :INPUT ACCEPT [0:0]\n\
             :FORWARD ACCEPT [0:0]\n\
             :OUTPUT ACCEPT [0:0]\n\
             :ts-fwd - [0:0]\n\
             -A FORWARD {} -j ts-fwd\n\
             -A ts-fwd {} -j ACCEPT\n\
             COMMIT\n",
            comment(&insert_hashes[0]),
            comment(&chain_hashes[0]),
        ),
    );
    table.invalidate_dataplane_cache();
    table.apply().unwrap();
    assert_eq!(factory.invocations_of(SAVE), 2);
    assert_eq!(factory.invocations_of(RESTORE), 1);
}

#[test]
fn changing_one_rule_replaces_exactly_one_slot() {
    let (mut table, factory) = new_table("filter");

    table.update_chain(Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-p tcp --dport 80 -j ACCEPT"),
            Rule::new("-j DROP"),
        ],
    ));
    table.apply().unwrap();
    factory.clear_log();

    let updated = Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-p tcp --dport 443 -j ACCEPT"),
            Rule::new("-j DROP"),
        ],
    );
    let updated_hashes = updated.rule_hashes();
    table.update_chain(updated);
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec![format!(
            "*filter\n\
             -R ts-fwd 2 {} -p tcp --dport 443 -j ACCEPT\n\
             COMMIT\n",
            comment(&updated_hashes[1]),
        )]
    );
}

#[test]
fn shrinking_a_chain_deletes_from_the_tail() {
    let (mut table, factory) = new_table("filter");

    table.update_chain(Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-p tcp --dport 80 -j ACCEPT"),
            Rule::new("-p tcp --dport 443 -j ACCEPT"),
            Rule::new("-j DROP"),
        ],
    ));
    table.apply().unwrap();
    factory.clear_log();

    table.update_chain(Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-p tcp --dport 80 -j ACCEPT"),
        ],
    ));
    table.apply().unwrap();

    // Both deletions carry the same rule number: each one removes the
    // current tail.
    assert_eq!(
        factory.stdin_for(RESTORE),
        vec!["*filter\n-D ts-fwd 3\n-D ts-fwd 3\nCOMMIT\n".to_owned()]
    );
}

#[test]
fn growing_a_chain_appends_without_touching_the_prefix() {
    let (mut table, factory) = new_table("filter");

    table.update_chain(Chain::new(
        "ts-fwd",
        vec![Rule::new("-p tcp --dport 22 -j ACCEPT")],
    ));
    table.apply().unwrap();
    factory.clear_log();

    let updated = Chain::new(
        "ts-fwd",
        vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-j DROP"),
        ],
    );
    let updated_hashes = updated.rule_hashes();
    table.update_chain(updated);
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec![format!(
            "*filter\n-A ts-fwd {} -j DROP\nCOMMIT\n",
            comment(&updated_hashes[1]),
        )]
    );
}

#[test]
fn foreign_rule_in_hooked_chain_survives_a_resync() {
    let (mut table, factory) = new_table("filter");

    let insertions = vec![Rule::new("-j ts-one"), Rule::new("-j ts-two")];
    let insert_hashes = rule_hashes("FORWARD", &insertions);
    table.set_rule_insertions("FORWARD", insertions);
    table.apply().unwrap();
    factory.clear_log();

    // Someone slipped a rule of their own between ours.
    factory.set_stdout(
        SAVE,
        &format!(
            "*filter\n\
             :INPUT ACCEPT [0:0]\n\
             :FORWARD ACCEPT [0:0]\n\
             :OUTPUT ACCEPT [0:0]\n\
             -A FORWARD {} -j ts-one\n\
             -A FORWARD -i docker0 -j DOCKER\n\
             -A FORWARD {} -j ts-two\n\
             COMMIT\n",
            comment(&insert_hashes[0]),
            comment(&insert_hashes[1]),
        ),
    );
    table.invalidate_dataplane_cache();
    table.apply().unwrap();

    // Our two rules are taken out back-to-front and re-inserted at the top;
    // the foreign rule is never referenced and ends up behind ours.
    assert_eq!(
        factory.stdin_for(RESTORE),
        vec![format!(
            "*filter\n\
             -D FORWARD 3\n\
             -D FORWARD 1\n\
             -I FORWARD 1 {} -j ts-two\n\
             -I FORWARD 1 {} -j ts-one\n\
             COMMIT\n",
            comment(&insert_hashes[1]),
            comment(&insert_hashes[0]),
        )]
    );
}

#[test]
fn legacy_insertions_are_cleaned_on_first_apply() {
    let (mut table, factory) = new_table("filter");

    // A rule written by a version that predates hash comments: no comment,
    // but it jumps to a chain with one of our prefixes.
    factory.set_stdout(
        SAVE,
        "*filter\n\
         :INPUT ACCEPT [0:0]\n\
         :FORWARD ACCEPT [0:0]\n\
         :OUTPUT ACCEPT [0:0]\n\
         -A FORWARD -j ts-fwd\n\
         COMMIT\n",
    );
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec!["*filter\n-D FORWARD 1\nCOMMIT\n".to_owned()]
    );
}

#[test]
fn stale_insertions_from_a_previous_run_are_cleaned_on_first_apply() {
    let (mut table, factory) = new_table("filter");

    // A hash-commented rule from a previous run of this software; nothing
    // is desired for FORWARD in this run.
    factory.set_stdout(
        SAVE,
        "*filter\n\
         :INPUT ACCEPT [0:0]\n\
         :FORWARD ACCEPT [0:0]\n\
         :OUTPUT ACCEPT [0:0]\n\
         -A FORWARD -m comment --comment \"ts:aaaabbbbccccdddd\" -j ts-fwd\n\
         COMMIT\n",
    );
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec!["*filter\n-D FORWARD 1\nCOMMIT\n".to_owned()]
    );
}

#[test]
fn unremembered_owned_chains_are_deleted() {
    let (mut table, factory) = new_table("filter");

    factory.set_stdout(
        SAVE,
        "*filter\n\
         :INPUT ACCEPT [0:0]\n\
         :FORWARD ACCEPT [0:0]\n\
         :OUTPUT ACCEPT [0:0]\n\
         :ts-old - [0:0]\n\
         -A ts-old -j ACCEPT\n\
         COMMIT\n",
    );
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec!["*filter\n:ts-old - -\n--delete-chain ts-old\nCOMMIT\n".to_owned()]
    );
}

#[test]
fn removing_a_chain_flushes_then_deletes() {
    let (mut table, factory) = new_table("filter");

    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    table.apply().unwrap();
    factory.clear_log();

    table.remove_chain_by_name("ts-fwd");
    table.apply().unwrap();

    assert_eq!(
        factory.stdin_for(RESTORE),
        vec!["*filter\n:ts-fwd - -\n--delete-chain ts-fwd\nCOMMIT\n".to_owned()]
    );

    // The deletion is remembered: applying again emits nothing.
    table.apply().unwrap();
    assert_eq!(factory.invocations_of(RESTORE), 1);
}

#[test]
fn restore_failure_rescans_and_retries() {
    let (mut table, factory) = new_table("filter");
    factory.queue_failure(RESTORE, "iptables-restore: line 2 failed");

    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    table.apply().unwrap();

    // First attempt scans and fails to restore; the second rescans before
    // restoring successfully.
    assert_eq!(factory.invocations_of(SAVE), 2);
    assert_eq!(factory.invocations_of(RESTORE), 2);
}

#[test]
fn save_failure_is_retried() {
    let (mut table, factory) = new_table("filter");
    factory.queue_failure(SAVE, "can't initialize iptables table `filter'");

    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    table.apply().unwrap();

    assert_eq!(factory.invocations_of(SAVE), 2);
    assert_eq!(factory.invocations_of(RESTORE), 1);
}

#[test]
fn apply_gives_up_after_the_retry_budget() {
    let (mut table, factory) = new_table("filter");
    for _ in 0..10 {
        factory.queue_failure(RESTORE, "resource temporarily unavailable");
    }

    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    assert!(table.apply().is_err());
    assert_eq!(factory.invocations_of(RESTORE), 10);
}

#[test]
fn ipv6_tables_use_the_ip6tables_utilities() {
    let factory = LoggingCommandFactory::new();
    factory.set_stdout(
        "ip6tables-save",
        "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\nCOMMIT\n",
    );

    let options = TableOptionsBuilder::default()
        .name("filter")
        .ip_version(IPVersion::IPv6)
        .historic_chain_prefixes(vec!["ts-".to_owned()])
        .hash_prefix("ts:")
        .build()
        .unwrap();
    let log = Logger::root(Discard, o!());
    let mut table = Table::new(options, Box::new(factory.clone()), &log).unwrap();

    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    table.apply().unwrap();

    assert_eq!(factory.invocations_of("ip6tables-save"), 1);
    assert_eq!(factory.invocations_of("ip6tables-restore"), 1);
    assert_eq!(factory.invocations_of(SAVE), 0);
    assert_eq!(factory.invocations_of(RESTORE), 0);
}

#[test]
fn save_is_invoked_for_exactly_this_table() {
    let (mut table, factory) = new_table("filter");
    table.update_chain(Chain::new("ts-fwd", vec![Rule::new("-j ACCEPT")]));
    table.apply().unwrap();

    let commands = factory.logged_commands();
    assert_eq!(commands[0].program, SAVE);
    assert_eq!(commands[0].args, vec!["-t".to_owned(), "filter".to_owned()]);
    assert_eq!(commands[1].program, RESTORE);
    assert_eq!(
        commands[1].args,
        vec!["--noflush".to_owned(), "--verbose".to_owned()]
    );
}

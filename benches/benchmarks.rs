//! Benchmark suite for Shepherd subsystems.
//!
//! This module provides performance benchmarks for:
//! - Reconciliation (ordered clause evaluation)
//! - Waffling detection (label-change log scanning)
//! - Command precedence resolution
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shepherd::engine::waffling::is_waffling;
use shepherd::engine::{commands, EngineConfig, ReconciliationEngine};
use shepherd::facts::FactStore;
use shepherd::item::{CommandEvent, ItemKind, LabelAction, LabelEvent, TrackedItem};

fn ts(hours: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(hours)
}

fn synthetic_item(history_len: usize) -> TrackedItem {
    let labels: BTreeSet<String> = ["needs_info", "needs_triage", "affects_2.9"]
        .into_iter()
        .map(String::from)
        .collect();
    let label_events = (0..history_len)
        .map(|i| {
            let action = if i % 3 == 0 {
                LabelAction::Removed
            } else {
                LabelAction::Applied
            };
            LabelEvent::new(format!("label_{}", i % 7), action, "someone", ts(i as i64))
        })
        .collect();
    let command_events = (0..history_len / 4)
        .map(|i| {
            let token = if i % 2 == 0 { "needs_info" } else { "!needs_info" };
            CommandEvent::new("alice", token, ts(i as i64))
        })
        .collect();
    TrackedItem {
        number: 1,
        kind: ItemKind::PullRequest,
        title: "benchmark item".into(),
        submitter: "reporter".into(),
        labels,
        is_open: true,
        created_at: ts(0),
        updated_at: ts(history_len as i64),
        label_events,
        command_events,
        from_fork: true,
        work_in_progress: false,
        incoming_repo_exists: true,
        mergeable_state: Some("clean".into()),
        head_branch: Some("fix-1".into()),
    }
}

fn synthetic_facts() -> FactStore {
    let mut facts = FactStore::new();
    facts.set("is_needs_info", false);
    facts.set("is_needs_revision", true);
    facts.set("has_ci", true);
    facts.set("ci_state", "failure");
    facts.set("ci_stale", true);
    facts.set("affects_version", "2.10");
    facts.set("issue_type", "bugfix pull request");
    facts.set("maintainers", vec!["alice".to_string(), "bob".to_string()]);
    facts.set(
        "component_labels",
        vec!["networking".to_string(), "windows".to_string()],
    );
    facts
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    let engine = ReconciliationEngine::new(EngineConfig::default());
    let facts = synthetic_facts();
    let valid_labels: BTreeSet<String> = [
        "needs_info",
        "needs_triage",
        "affects_2.9",
        "affects_2.10",
        "networking",
        "windows",
        "bug",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    for history_len in [16, 128, 1024] {
        let item = synthetic_item(history_len);
        group.throughput(Throughput::Elements(history_len as u64));
        group.bench_with_input(
            BenchmarkId::new("history", history_len),
            &item,
            |b, item| {
                b.iter(|| {
                    engine.reconcile(
                        black_box(item),
                        black_box(&facts),
                        black_box(&valid_labels),
                        ts(2000),
                    )
                });
            },
        );
    }
    group.finish();
}

fn bench_waffling_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("waffling_scan");

    for history_len in [64, 1024, 8192] {
        let item = synthetic_item(history_len);
        group.throughput(Throughput::Elements(history_len as u64));
        group.bench_with_input(
            BenchmarkId::new("events", history_len),
            &item.label_events,
            |b, events| {
                b.iter(|| {
                    is_waffling(
                        black_box(events),
                        black_box("label_3"),
                        3,
                        chrono::Duration::days(3650),
                        ts(history_len as i64 + 1),
                    )
                });
            },
        );
    }
    group.finish();
}

fn bench_command_resolution(c: &mut Criterion) {
    let item = synthetic_item(4096);
    c.bench_function("active_commands_1k", |b| {
        b.iter(|| commands::active_commands(black_box(&item.command_events), None));
    });
}

criterion_group!(
    benches,
    bench_reconcile,
    bench_waffling_scan,
    bench_command_resolution
);
criterion_main!(benches);

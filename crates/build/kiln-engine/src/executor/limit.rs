//! Concurrency limit derivation.

use std::collections::HashSet;
use std::fs;
use std::thread;

/// Inputs to [`concurrency_limit`].
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyOptions {
    /// Applied to the core count.
    pub multiplier: f64,
    /// Absolute ceiling.
    pub max_actions: Option<usize>,
    /// Memory budget per concurrent action, in bytes.
    pub memory_per_action: Option<u64>,
}

impl Default for ConcurrencyOptions {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_actions: None,
            memory_per_action: Some(1 << 30),
        }
    }
}

/// Number of actions to run at once on this host.
///
/// Physical cores when they can be counted, logical cores otherwise, times
/// the multiplier, capped by `max_actions` and by available memory divided by
/// the per-action budget. Never less than one.
pub fn concurrency_limit(options: &ConcurrencyOptions) -> usize {
    let cores = physical_cores().unwrap_or_else(|| {
        thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    });
    derive_limit(cores, available_memory(), options)
}

fn derive_limit(cores: usize, available_memory: Option<u64>, options: &ConcurrencyOptions) -> usize {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut limit = (cores as f64 * options.multiplier).floor().max(0.0) as usize;
    if let Some(max) = options.max_actions {
        limit = limit.min(max);
    }
    if let (Some(per_action), Some(available)) = (options.memory_per_action, available_memory) {
        if per_action > 0 {
            let by_memory = usize::try_from(available / per_action).unwrap_or(usize::MAX);
            limit = limit.min(by_memory);
        }
    }
    limit.max(1)
}

fn physical_cores() -> Option<usize> {
    let text = fs::read_to_string("/proc/cpuinfo").ok()?;
    parse_cpuinfo(&text)
}

fn available_memory() -> Option<u64> {
    let text = fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&text)
}

/// Count distinct (physical id, core id) pairs.
fn parse_cpuinfo(text: &str) -> Option<usize> {
    let mut cores = HashSet::new();
    let mut physical = None;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            // Blank line between processors.
            physical = None;
            continue;
        };
        match key.trim() {
            "physical id" => physical = value.trim().parse::<u32>().ok(),
            "core id" => {
                if let Ok(core) = value.trim().parse::<u32>() {
                    cores.insert((physical.unwrap_or(0), core));
                }
            }
            _ => {}
        }
    }
    (!cores.is_empty()).then_some(cores.len())
}

/// `MemAvailable` in bytes.
fn parse_meminfo(text: &str) -> Option<u64> {
    let line = text.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let mut fields = line["MemAvailable:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => value.checked_mul(1024),
        Some(_) => None,
    }
}

//! The operator command surface (§6): whitespace-parsed lines that reach
//! the master either from stdin or from the manager's `command` query.
//! Both sources feed the same [`Master::command_queue`](crate::master::Master)
//! and are parsed by this one function — per the Design Notes, untrusted
//! either way, no duplicated parsing logic.

use crate::master::{Master, MatchOverrides};
use rand::seq::SliceRandom;

/// Parses and runs one operator command line. Unknown commands are
/// logged and discarded (§7: `unknown_command`).
pub async fn execute(master: &mut Master, line: &str) {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("quit") => {
            tracing::info!("quit command received, shutting down");
            close_every_client(master);
            master.shutting_down = true;
        }
        Some("close") => close_fids(master, tokens),
        Some("file") => read_command_files(master, tokens),
        Some("show") => show(master, tokens),
        Some("match") => match_command(master, tokens),
        Some(other) => tracing::warn!(command = other, "unknown operator command"),
        None => {}
    }
}

fn close_every_client(master: &mut Master) {
    for fid in master.registry.fids() {
        master.registry.schedule_removal(fid);
    }
}

fn close_fids<'a>(master: &mut Master, tokens: impl Iterator<Item = &'a str>) {
    let mut any = false;
    for token in tokens {
        match token.parse::<u64>() {
            Ok(fid) => {
                master.registry.schedule_removal(fid);
                any = true;
            }
            Err(_) => tracing::warn!(token, "close: not a fid"),
        }
    }
    if !any {
        tracing::warn!("close: no fids given");
    }
}

fn read_command_files<'a>(master: &mut Master, tokens: impl Iterator<Item = &'a str>) {
    let mut any = false;
    for path in tokens {
        any = true;
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                for line in contents.lines() {
                    if !line.trim().is_empty() {
                        master.command_queue.push_back(line.to_string());
                    }
                }
            }
            Err(e) => tracing::warn!(path, error = %e, "file command: could not read file"),
        }
    }
    if !any {
        tracing::warn!("file: no paths given");
    }
}

fn show<'a>(master: &Master, mut tokens: impl Iterator<Item = &'a str>) {
    match tokens.next() {
        Some("client") => {
            for (fid, entry) in master.registry.entries() {
                let (status, gid, pid) = match (entry.crashed, entry.state) {
                    (true, _) => ("crashed", None, None),
                    (false, crate::registry::PlayState::Waiting) => ("waiting", None, None),
                    (false, crate::registry::PlayState::Playing { gid, pid }) => ("playing", Some(gid), Some(pid)),
                };
                tracing::info!(name = %entry.info.name, status, fid = *fid, ?gid, ?pid, "client");
            }
        }
        Some("process") => {
            for (pid, load) in master.worker_loads.iter().enumerate() {
                tracing::info!(pid, load = *load, "process");
            }
        }
        Some("game") => {
            for (gid, pid) in &master.live_games {
                tracing::info!(gid = *gid, pid = *pid, "game");
            }
        }
        Some(other) => tracing::warn!(target = other, "show: unknown target"),
        None => tracing::warn!("show: missing target"),
    }
}

fn match_command<'a>(master: &mut Master, mut tokens: impl Iterator<Item = &'a str>) {
    match tokens.next() {
        Some("random") => match_random(master),
        Some("fid") => match_fid(master, tokens),
        Some(other) => tracing::warn!(mode = other, "match: unknown mode"),
        None => tracing::warn!("match: missing mode"),
    }
}

fn match_random(master: &mut Master) {
    let waiting = master.registry.waiting_engine_fids();
    if waiting.len() < 2 {
        tracing::warn!(waiting = waiting.len(), "match random: fewer than two waiting engines");
        return;
    }
    let mut rng = rand::thread_rng();
    let mut picked = waiting;
    picked.shuffle(&mut rng);
    let (black, white) = (picked[0], picked[1]);
    dispatch_and_log(master, black, white, MatchOverrides::default());
}

fn match_fid<'a>(master: &mut Master, mut tokens: impl Iterator<Item = &'a str>) {
    let Some(black) = tokens.next().and_then(|t| t.parse::<u64>().ok()) else {
        tracing::warn!("match fid: missing black fid");
        return;
    };
    let Some(white) = tokens.next().and_then(|t| t.parse::<u64>().ok()) else {
        tracing::warn!("match fid: missing white fid");
        return;
    };

    let mut overrides = MatchOverrides::default();
    let mut remaining = tokens.peekable();
    while let Some(key) = remaining.next() {
        match key {
            "bsize" => overrides.board_size = remaining.next().and_then(|v| v.parse().ok()),
            "komi" => overrides.komi = remaining.next().and_then(|v| v.parse().ok()),
            "mtime" => overrides.main_time_seconds = remaining.next().and_then(|v| v.parse().ok()),
            "rule" => overrides.rule = remaining.next().map(str::to_string),
            "sgf" => overrides.resume_record_path = remaining.next().map(std::path::PathBuf::from),
            "store" => overrides.store_dir = remaining.next().map(std::path::PathBuf::from),
            // Unrecognized key tokens consume but do not set anything (§6).
            _ => {
                remaining.next();
            }
        }
    }

    dispatch_and_log(master, black, white, overrides);
}

fn dispatch_and_log(master: &mut Master, black: u64, white: u64, overrides: MatchOverrides) {
    match master.dispatch(black, white, overrides) {
        Ok(gid) => tracing::info!(gid, black, white, "match dispatched"),
        Err(e) => tracing::warn!(black, white, error = %e, "match dispatch failed"),
    }
}

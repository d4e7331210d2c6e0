//! The per-match state machine (§4.4): drives exactly one game between
//! two attached client links, enforcing per-player clocks, legality and
//! superko, and classifying the result into one of the five terminal
//! conditions.

use crate::link::{ClientLink, LinkError};
use crate::task::{ClientInfo, Completion, MatchSettings, PlayerHandle, Task};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("client link error: {0}")]
    Link(#[from] LinkError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record parse error: {0}")]
    Record(#[from] record::ParseError),
    #[error("engine reply did not decode to a legal-looking move")]
    MalformedMove,
}

/// Plays one game to completion and returns the client links to their
/// owner. Never panics on a match-internal failure — any unhandled error
/// classifies the match as `socket_error` (§4.4) and still runs teardown.
pub async fn play_match(mut task: Task) -> Completion {
    let gid = task.gid;
    let pid = task.pid;
    let black_info = task.black.info.clone();
    let white_info = task.white.info.clone();

    task.black.link.attach();
    task.white.link.attach();

    let date = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string();
    let mut settings = task.settings.clone();
    let mut board_size = settings.board_size;
    let mut komi = settings.komi;
    let mut board = board::Board::new(board_size, komi);
    let mut moves: Vec<record::MoveEntry> = Vec::new();

    let outcome = run_full_match(
        gid,
        &mut task.black.link,
        &mut task.white.link,
        &black_info,
        &white_info,
        &mut settings,
        &mut board,
        &mut board_size,
        &mut komi,
        &mut moves,
        &date,
    )
    .await;

    let result = match &outcome {
        Ok(result) => result.clone(),
        Err(err) => {
            tracing::error!(gid, error = %err, "match ended by an unhandled error");
            "0".to_string()
        }
    };

    if let Err(e) = task.black.link.request(&protocol::line_gameover(&date, &result, "")).await {
        tracing::warn!(gid, fid = black_info.fid, error = %e, "gameover exchange with black failed");
    }
    if let Err(e) = task.white.link.request(&protocol::line_gameover(&date, &result, "")).await {
        tracing::warn!(gid, fid = white_info.fid, error = %e, "gameover exchange with white failed");
    }

    task.black.link.detach();
    task.white.link.detach();

    let store_path = settings.store_directory.join(record::file_name(&date, &black_info.name, &white_info.name, gid));
    if let Err(e) = write_checkpoint(&store_path, &settings, board_size, komi, &black_info.name, &white_info.name, &date, Some(result), &moves) {
        tracing::warn!(gid, error = %e, "failed to write final record");
    }

    tracing::info!(gid, pid, "match finished");

    Completion {
        gid,
        pid,
        black: PlayerHandle { info: black_info, link: task.black.link },
        white: PlayerHandle { info: white_info, link: task.white.link },
    }
}

async fn send_setup(
    gid: u64,
    black: &mut ClientLink,
    white: &mut ClientLink,
    board_size: usize,
    komi: f64,
    main_time_seconds: u64,
    black_name: &str,
    white_name: &str,
) -> Result<(), DriverError> {
    let line = protocol::line_setup(gid, board_size, komi, main_time_seconds * 1000, black_name, white_name);
    black.send_line(&line).await?;
    white.send_line(&line).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_full_match(
    gid: u64,
    black: &mut ClientLink,
    white: &mut ClientLink,
    black_info: &ClientInfo,
    white_info: &ClientInfo,
    settings: &mut MatchSettings,
    board: &mut board::Board,
    board_size: &mut usize,
    komi: &mut f64,
    moves: &mut Vec<record::MoveEntry>,
    date: &str,
) -> Result<String, DriverError> {
    // Fail fast if the store directory can't be created, rather than the
    // source's pattern of silently skipping every checkpoint write.
    std::fs::create_dir_all(&settings.store_directory)?;

    let mut replayed_a_resume = false;
    if let Some(path) = settings.resume_record_path.clone() {
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let parsed = record::parse(&text)?;
            *board_size = parsed.board_size;
            *komi = parsed.komi;
            settings.board_size = *board_size;
            settings.komi = *komi;
            *board = board::Board::new(*board_size, *komi);
            replayed_a_resume = true;

            send_setup(gid, black, white, *board_size, *komi, settings.main_time_seconds, &black_info.name, &white_info.name).await?;

            for entry in parsed.moves {
                let mv = match &entry.mv {
                    record::RecordMove::Pass => board::Move::Pass,
                    record::RecordMove::Resign => break,
                    record::RecordMove::Stone { x, y } => board::Move::Place(board.vertex_from_xy(*x, *y)),
                };
                // The resumed prefix is trusted verbatim, as the source does.
                board.play(mv);
                let mover = to_play_color(board.to_move().opposite());
                let move_text = wire_move_text(board, mv);
                let time_left_ms = (entry.clock_remaining_seconds * 1000).max(0);
                black.send_line(&protocol::line_play(mover, &move_text, time_left_ms)).await?;
                white.send_line(&protocol::line_play(mover, &move_text, time_left_ms)).await?;
                moves.push(entry);
            }
        }
    }
    if !replayed_a_resume {
        send_setup(gid, black, white, *board_size, *komi, settings.main_time_seconds, &black_info.name, &white_info.name).await?;
    }

    let store_path = settings.store_directory.join(record::file_name(date, &black_info.name, &white_info.name, gid));
    run_match_loop(black, white, black_info, white_info, settings, board, moves, &store_path, date).await
}

fn wire_move_text(board: &board::Board, mv: board::Move) -> String {
    match mv {
        board::Move::Pass => "pass".to_string(),
        board::Move::Place(v) => board.vertex_to_text(v),
    }
}

fn color_index(c: board::Color) -> usize {
    match c {
        board::Color::Black => 0,
        board::Color::White => 1,
    }
}

fn to_play_color(c: board::Color) -> protocol::PlayColor {
    match c {
        board::Color::Black => protocol::PlayColor::Black,
        board::Color::White => protocol::PlayColor::White,
    }
}

fn record_move_from_board(board: &board::Board, mv: board::Move) -> record::RecordMove {
    match mv {
        board::Move::Pass => record::RecordMove::Pass,
        board::Move::Place(v) => record::RecordMove::Stone { x: board.x_of(v) as usize, y: board.y_of(v) as usize },
    }
}

struct ParsedReply {
    move_text: String,
    analysis: Option<String>,
}

/// Splits an analysis-capable engine's reply into move text and a
/// compact re-serialized analysis blob. A reply with no trailing JSON,
/// or invalid trailing JSON, yields no analysis. A non-analysis-capable
/// engine's reply is used verbatim, unsplit.
fn parse_genmove_reply(reply: &str, supports_analysis: bool) -> ParsedReply {
    let reply = reply.trim();
    if supports_analysis {
        if let Some((head, tail)) = reply.split_once(char::is_whitespace) {
            let tail = tail.trim();
            if !tail.is_empty() {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(tail) {
                    if let Ok(compact) = serde_json::to_string(&value) {
                        return ParsedReply { move_text: head.to_string(), analysis: Some(compact) };
                    }
                }
            }
            return ParsedReply { move_text: head.to_string(), analysis: None };
        }
    }
    ParsedReply { move_text: reply.to_string(), analysis: None }
}

enum DecodedMove {
    Pass,
    Resign,
    Stone(usize),
}

fn decode_move(move_text: &str, board: &board::Board) -> Result<DecodedMove, DriverError> {
    match move_text.to_lowercase().as_str() {
        "pass" => Ok(DecodedMove::Pass),
        "resign" => Ok(DecodedMove::Resign),
        _ => board
            .text_to_vertex(move_text)
            .map(DecodedMove::Stone)
            .ok_or(DriverError::MalformedMove),
    }
}

fn result_string(winner: board::Color, suffix: &str) -> String {
    let letter = match winner {
        board::Color::Black => "B",
        board::Color::White => "W",
    };
    format!("{letter}+{suffix}")
}

fn format_margin(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{score:.1}")
    } else {
        format!("{score}")
    }
}

fn finish_by_score(settings: &MatchSettings, board: &board::Board) -> String {
    let score = if settings.rule == "chinese-like" { board.final_score() } else { 0.0 };
    if settings.rule != "chinese-like" {
        return "0".to_string();
    }
    if score > 0.001 {
        result_string(board::Color::Black, &format_margin(score))
    } else if score < -0.001 {
        result_string(board::Color::White, &format_margin(-score))
    } else {
        "0".to_string()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_match_loop(
    black: &mut ClientLink,
    white: &mut ClientLink,
    black_info: &ClientInfo,
    white_info: &ClientInfo,
    settings: &MatchSettings,
    board: &mut board::Board,
    moves: &mut Vec<record::MoveEntry>,
    store_path: &Path,
    date: &str,
) -> Result<String, DriverError> {
    let should_superko = settings.rule == "chinese-like";
    let main_time = settings.main_time_seconds as f64;
    let mut time_left = [main_time, main_time];
    let mut last_checkpoint = Instant::now();

    loop {
        let to_move = board.to_move();
        let idx = color_index(to_move);

        let clock_start = Instant::now();
        let time_left_ms = (time_left[idx] * 1000.0).round().max(0.0) as i64;
        let genmove_line = protocol::line_genmove(to_play_color(to_move), time_left_ms);
        let reply = {
            let mover = if to_move == board::Color::Black { &mut *black } else { &mut *white };
            mover.request(&genmove_line).await?
        };
        time_left[idx] -= clock_start.elapsed().as_secs_f64();

        if time_left[idx] < 0.0 {
            return Ok(result_string(to_move.opposite(), "Time"));
        }

        let mover_info = if to_move == board::Color::Black { black_info } else { white_info };
        let parsed = parse_genmove_reply(&reply, mover_info.supports_analysis);
        let decoded = decode_move(&parsed.move_text, board)?;

        let mv = match decoded {
            DecodedMove::Resign => return Ok(result_string(to_move.opposite(), "Resign")),
            DecodedMove::Pass => board::Move::Pass,
            DecodedMove::Stone(v) => board::Move::Place(v),
        };

        let legal = board.play(mv);
        let illegal = !legal || (!matches!(mv, board::Move::Pass) && should_superko && board.superko());
        if illegal {
            return Ok(result_string(to_move.opposite(), "Illegal"));
        }

        moves.push(record::MoveEntry {
            mv: record_move_from_board(board, mv),
            clock_remaining_seconds: time_left[idx].max(0.0) as i64,
            analysis: parsed.analysis,
        });

        if last_checkpoint.elapsed().as_secs() >= 5 {
            write_checkpoint(store_path, settings, board.size(), board.komi(), &black_info.name, &white_info.name, date, None, moves)?;
            last_checkpoint = Instant::now();
        }

        let move_text = wire_move_text(board, mv);
        let opponent_idx = 1 - idx;
        let opponent_time_left_ms = (time_left[opponent_idx] * 1000.0).round().max(0.0) as i64;
        let play_line = protocol::line_play(to_play_color(to_move), &move_text, opponent_time_left_ms);
        let opponent = if to_move == board::Color::Black { &mut *white } else { &mut *black };
        opponent.send_line(&play_line).await?;

        if board.consecutive_passes() >= 2 {
            return Ok(finish_by_score(settings, board));
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_checkpoint(
    path: &Path,
    settings: &MatchSettings,
    board_size: usize,
    komi: f64,
    black_name: &str,
    white_name: &str,
    date: &str,
    result: Option<String>,
    moves: &[record::MoveEntry],
) -> std::io::Result<()> {
    let header = record::Header {
        board_size,
        komi,
        main_time_seconds: settings.main_time_seconds as u32,
        black_name: black_name.to_string(),
        white_name: white_name.to_string(),
        date: date.to_string(),
        result,
    };
    let text = record::emit(&record::GameRecord { header, moves: moves.to_vec() });
    let tmp = tmp_path_for(path);
    std::fs::write(&tmp, &text)?;
    std::fs::rename(&tmp, path)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("record").to_string();
    name.push_str(".tmp");
    path.with_file_name(name)
}

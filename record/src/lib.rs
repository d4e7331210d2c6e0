//! Game-record text codec: an SGF-flavored format for persisting and
//! resuming matches (§4.2). `emit` is the inverse of `parse` up to the
//! reconstructed `(board_size, komi, moves)` triple — headers that don't
//! round-trip (player names, date, result) are read-only metadata on emit,
//! not reconstructed by parse, since a resumed match only needs the board
//! state and move history.

use std::fmt;

/// Fixed rule tag written to every record; the server does not support
/// any other ruleset.
pub const RULE: &str = "Chinese";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Black,
    White,
}

impl Color {
    fn opposite(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    fn letter(self) -> char {
        match self {
            Color::Black => 'B',
            Color::White => 'W',
        }
    }
}

/// One move in a game-record history. `Resign` carries no coordinate and
/// is never itself written to the record — per §4.2, resign is omitted.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordMove {
    Pass,
    Resign,
    Stone { x: usize, y: usize },
}

/// One history entry: a move, the mover's clock after playing it, and an
/// optional raw analysis JSON blob exactly as the engine sent it.
#[derive(Clone, Debug, PartialEq)]
pub struct MoveEntry {
    pub mv: RecordMove,
    pub clock_remaining_seconds: i64,
    pub analysis: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub board_size: usize,
    pub komi: f64,
    pub main_time_seconds: u32,
    pub black_name: String,
    pub white_name: String,
    pub date: String,
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GameRecord {
    pub header: Header,
    pub moves: Vec<MoveEntry>,
}

/// What `parse` hands back: enough to rebuild a [`board::Board`] and replay.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedRecord {
    pub board_size: usize,
    pub komi: f64,
    pub moves: Vec<MoveEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("record has no SZ (board size) property")]
    MissingSize,
    #[error("B/W move property appeared before SZ (board size) was parsed")]
    MoveBeforeSize,
    #[error("unterminated {key}[ property")]
    UnterminatedProperty { key: String },
    #[error("bad integer value for {key}: {value:?}")]
    BadInteger { key: String, value: String },
    #[error("bad numeric value for {key}: {value:?}")]
    BadNumber { key: String, value: String },
    #[error("bad coordinate text: {value:?}")]
    BadCoordinate { value: String },
}

impl fmt::Display for RecordMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordMove::Pass => write!(f, "pass"),
            RecordMove::Resign => write!(f, "resign"),
            RecordMove::Stone { x, y } => write!(f, "({x},{y})"),
        }
    }
}

/// Escapes `]` and `\` for use inside a bracketed SGF property value.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c == ']' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Builds the two-letter record coordinate for a 0-based `(x, y)` on a
/// board of `board_size`: column is a plain `'a' + x`, row is
/// size-complemented (`'a' + (board_size - 1 - y)`).
fn encode_coord(x: usize, y: usize, board_size: usize) -> String {
    let col = (b'a' + x as u8) as char;
    let row = (b'a' + (board_size - 1 - y) as u8) as char;
    format!("{col}{row}")
}

fn decode_coord(value: &str, board_size: usize) -> Result<(usize, usize), ParseError> {
    let mut chars = value.chars();
    let c1 = chars
        .next()
        .ok_or_else(|| ParseError::BadCoordinate { value: value.to_string() })?;
    let c2 = chars
        .next()
        .ok_or_else(|| ParseError::BadCoordinate { value: value.to_string() })?;
    let x = c1 as i64 - 'a' as i64;
    let rrs = c2 as i64 - 'a' as i64;
    let y = board_size as i64 - rrs - 1;
    if x < 0 || y < 0 || x as usize >= board_size || y as usize >= board_size {
        return Err(ParseError::BadCoordinate { value: value.to_string() });
    }
    Ok((x as usize, y as usize))
}

/// Serializes a full game record to its on-disk text form.
pub fn emit(record: &GameRecord) -> String {
    let mut out = String::new();
    out.push_str("(;GM[1]FF[4]CA[UTF-8]\n");
    out.push_str(&format!(
        "RU[{}]SZ[{}]KM[{}]TM[{}]\n",
        RULE, record.header.board_size, record.header.komi, record.header.main_time_seconds
    ));
    out.push_str(&format!(
        "PB[{}]PW[{}]DT[{}]RE[{}]\n",
        escape(&record.header.black_name),
        escape(&record.header.white_name),
        escape(&record.header.date),
        escape(record.header.result.as_deref().unwrap_or(""))
    ));

    let mut to_move = Color::Black;
    let mut since_newline: u32 = 0;

    for entry in &record.moves {
        let coord_part = match &entry.mv {
            RecordMove::Resign => continue,
            RecordMove::Pass => String::new(),
            RecordMove::Stone { x, y } => encode_coord(*x, *y, record.header.board_size),
        };
        let letter = to_move.letter();
        out.push_str(&format!(
            ";{letter}[{coord_part}]{letter}L[{}]",
            entry.clock_remaining_seconds
        ));

        if let Some(analysis) = &entry.analysis {
            out.push_str(&format!("CC[{}]", escape(analysis)));
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(analysis) {
                if let Some(comment) = v.get("comment").and_then(|c| c.as_str()) {
                    out.push_str(&format!("C[{}]", escape(comment)));
                }
            }
            out.push('\n');
            since_newline = 0;
        } else {
            since_newline += 1;
            if since_newline > 7 {
                out.push('\n');
                since_newline = 0;
            }
        }

        to_move = to_move.opposite();
    }

    out.push_str(")\n");
    out
}

fn flush_move(
    moves: &mut Vec<MoveEntry>,
    cur_move: &mut Option<RecordMove>,
    cur_clock: &mut Option<i64>,
    cur_analysis: &mut Option<String>,
) {
    if let Some(mv) = cur_move.take() {
        moves.push(MoveEntry {
            mv,
            clock_remaining_seconds: cur_clock.take().unwrap_or(0),
            analysis: cur_analysis.take(),
        });
    } else {
        cur_clock.take();
        cur_analysis.take();
    }
}

/// Parses a record's `size`, `komi` and move history. Unknown properties
/// (including every header field besides `SZ`/`KM`) are ignored.
pub fn parse(text: &str) -> Result<ParsedRecord, ParseError> {
    let chars: Vec<char> = text.chars().collect();
    let mut size: Option<usize> = None;
    let mut komi: f64 = 0.0;
    let mut moves = Vec::new();

    let mut cur_move: Option<RecordMove> = None;
    let mut cur_clock: Option<i64> = None;
    let mut cur_analysis: Option<String> = None;

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            ';' => {
                flush_move(&mut moves, &mut cur_move, &mut cur_clock, &mut cur_analysis);
                i += 1;
            }
            c if c.is_ascii_uppercase() => {
                let start = i;
                let mut j = i + 1;
                if j < chars.len() && chars[j].is_ascii_uppercase() {
                    j += 1;
                }
                if j >= chars.len() || chars[j] != '[' {
                    i += 1;
                    continue;
                }
                let key: String = chars[start..j].iter().collect();
                j += 1;
                let mut value = String::new();
                while j < chars.len() && chars[j] != ']' {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        value.push(chars[j + 1]);
                        j += 2;
                    } else {
                        value.push(chars[j]);
                        j += 1;
                    }
                }
                if j >= chars.len() {
                    return Err(ParseError::UnterminatedProperty { key });
                }
                j += 1;

                match key.as_str() {
                    "SZ" => {
                        size = Some(value.parse().map_err(|_| ParseError::BadInteger {
                            key: key.clone(),
                            value: value.clone(),
                        })?)
                    }
                    "KM" => {
                        komi = value.parse().map_err(|_| ParseError::BadNumber {
                            key: key.clone(),
                            value: value.clone(),
                        })?
                    }
                    "B" | "W" => {
                        let board_size = size.ok_or(ParseError::MoveBeforeSize)?;
                        cur_move = Some(if value.is_empty() {
                            RecordMove::Pass
                        } else {
                            let (x, y) = decode_coord(&value, board_size)?;
                            RecordMove::Stone { x, y }
                        });
                    }
                    "BL" | "WL" => {
                        cur_clock = Some(value.parse().map_err(|_| ParseError::BadInteger {
                            key: key.clone(),
                            value: value.clone(),
                        })?)
                    }
                    "CC" => cur_analysis = Some(value),
                    _ => {}
                }
                i = j;
            }
            _ => i += 1,
        }
    }
    flush_move(&mut moves, &mut cur_move, &mut cur_clock, &mut cur_analysis);

    Ok(ParsedRecord {
        board_size: size.ok_or(ParseError::MissingSize)?,
        komi,
        moves,
    })
}

/// `<date>_<blackName>(B)_<whiteName>(W)_g<gid>.sgf`, per §6's file name
/// convention.
pub fn file_name(date: &str, black_name: &str, white_name: &str, gid: u64) -> String {
    format!("{date}_{black_name}(B)_{white_name}(W)_g{gid}.sgf")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            board_size: 9,
            komi: 7.5,
            main_time_seconds: 300,
            black_name: "alice".to_string(),
            white_name: "bob".to_string(),
            date: "2026-07-27".to_string(),
            result: Some("B+10.5".to_string()),
        }
    }

    #[test]
    fn round_trips_size_komi_and_moves() {
        let record = GameRecord {
            header: sample_header(),
            moves: vec![
                MoveEntry { mv: RecordMove::Stone { x: 2, y: 2 }, clock_remaining_seconds: 295, analysis: None },
                MoveEntry { mv: RecordMove::Stone { x: 3, y: 3 }, clock_remaining_seconds: 290, analysis: None },
                MoveEntry { mv: RecordMove::Pass, clock_remaining_seconds: 285, analysis: None },
            ],
        };
        let text = emit(&record);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.board_size, 9);
        assert_eq!(parsed.komi, 7.5);
        assert_eq!(parsed.moves, record.moves);
    }

    #[test]
    fn resign_is_omitted_from_emitted_text() {
        let record = GameRecord {
            header: sample_header(),
            moves: vec![
                MoveEntry { mv: RecordMove::Stone { x: 0, y: 0 }, clock_remaining_seconds: 299, analysis: None },
                MoveEntry { mv: RecordMove::Resign, clock_remaining_seconds: 0, analysis: None },
            ],
        };
        let text = emit(&record);
        assert!(!text.contains("resign"));
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.moves.len(), 1);
    }

    #[test]
    fn analysis_blob_is_attached_with_comment_duplicated() {
        let record = GameRecord {
            header: sample_header(),
            moves: vec![MoveEntry {
                mv: RecordMove::Stone { x: 4, y: 4 },
                clock_remaining_seconds: 100,
                analysis: Some(r#"{"comment":"hi","pv":["D4","C3"]}"#.to_string()),
            }],
        };
        let text = emit(&record);
        assert!(text.contains(r#"CC[{"comment":"hi","pv":["D4","C3"\]}]"#));
        assert!(text.contains("C[hi]"));

        let parsed = parse(&text).unwrap();
        assert_eq!(
            parsed.moves[0].analysis.as_deref(),
            Some(r#"{"comment":"hi","pv":["D4","C3"]}"#)
        );
    }

    #[test]
    fn escapes_brackets_and_backslashes_in_names() {
        let mut header = sample_header();
        header.black_name = "weird]name\\here".to_string();
        let record = GameRecord { header, moves: vec![] };
        let text = emit(&record);
        assert!(text.contains("PB[weird\\]name\\\\here]"));
    }

    #[test]
    fn row_is_size_complemented_and_column_is_plain() {
        // 9x9 board, x=0 (column a), y=0 (row 1) -> row char = 'a'+(9-1-0)='i'.
        assert_eq!(encode_coord(0, 0, 9), "ai");
        assert_eq!(decode_coord("ai", 9).unwrap(), (0, 0));
        // Last row/column.
        assert_eq!(encode_coord(8, 8, 9), "ia");
        assert_eq!(decode_coord("ia", 9).unwrap(), (8, 8));
    }

    #[test]
    fn newline_inserted_after_every_eighth_node_without_analysis() {
        let moves = (0..9)
            .map(|n| MoveEntry {
                mv: RecordMove::Stone { x: n % 9, y: 0 },
                clock_remaining_seconds: 100,
                analysis: None,
            })
            .collect();
        let record = GameRecord { header: sample_header(), moves };
        let text = emit(&record);
        let move_section = text.split("RE[").nth(1).unwrap().split_once(']').unwrap().1;
        assert_eq!(move_section.matches('\n').count(), 1);
    }

    #[test]
    fn unknown_properties_are_ignored() {
        let text = "(;GM[1]SZ[9]KM[0]XX[whatever]\n;B[cd]BL[100]\n)\n";
        let parsed = parse(text).unwrap();
        assert_eq!(parsed.board_size, 9);
        assert_eq!(parsed.moves.len(), 1);
    }

    #[test]
    fn missing_size_is_an_error() {
        let text = "(;GM[1]KM[0]\n;B[cd]BL[100]\n)\n";
        assert!(matches!(parse(text), Err(ParseError::MoveBeforeSize)));
    }

    #[test]
    fn file_name_matches_convention() {
        assert_eq!(
            file_name("2026-07-27", "alice", "bob", 42),
            "2026-07-27_alice(B)_bob(W)_g42.sgf"
        );
    }
}

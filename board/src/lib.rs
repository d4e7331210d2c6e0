//! Border-padded Go board: legality, capture, positional superko and
//! Tromp-Taylor area scoring.
//!
//! The grid is mail-box indexed: a size-B board is stored as a
//! `(B+2)x(B+2)` buffer whose outer ring is permanently [`Point::Invalid`],
//! so neighbor scans never need a bounds check. Every cell holds one of
//! {black, white, empty, invalid}; for a non-empty cell the *parent* cell
//! of its string (found by following `id`) carries the string's liberty
//! set, size and atari vertex. Member cells only carry `next`, a cyclic
//! linked list over the string.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// The largest board size this crate supports (19x19, the standard size).
pub const MAX_BOARD_SIZE: usize = 19;

/// Column letters skip `I`, same as GTP coordinate text.
const COLUMN_LETTERS: &str = "ABCDEFGHJKLMNOPQRST";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    White,
}

impl Color {
    pub fn opposite(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    fn index(self) -> usize {
        match self {
            Color::Black => 0,
            Color::White => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Point {
    Black,
    White,
    Empty,
    Invalid,
}

impl Point {
    fn of(color: Color) -> Point {
        match color {
            Color::Black => Point::Black,
            Color::White => Point::White,
        }
    }

    fn color_index(self) -> Option<usize> {
        match self {
            Point::Black => Some(0),
            Point::White => Some(1),
            _ => None,
        }
    }
}

/// A move to play. A coordinate is given as a padded vertex index, not a
/// board (x, y) pair — see [`Board::vertex_from_xy`] / [`Board::text_to_vertex`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Move {
    Pass,
    Place(usize),
}

/// Liberty bookkeeping for one string, valid only at the string's parent
/// (root) cell.
#[derive(Clone, Debug, Default)]
struct StoneGroup {
    lib_count: usize,
    atari_vertex: Option<usize>,
    liberties: HashSet<usize>,
}

impl StoneGroup {
    fn clear(&mut self) {
        self.lib_count = 0;
        self.atari_vertex = None;
        self.liberties.clear();
    }

    fn add(&mut self, v: usize) {
        if self.liberties.insert(v) {
            self.lib_count += 1;
            self.atari_vertex = Some(v);
        }
    }

    fn sub(&mut self, v: usize) {
        if self.liberties.remove(&v) {
            self.lib_count -= 1;
        }
    }

    fn merge(&mut self, other: &StoneGroup) {
        self.liberties.extend(other.liberties.iter().copied());
        self.lib_count = self.liberties.len();
        if self.lib_count == 1 {
            self.atari_vertex = self.liberties.iter().next().copied();
        }
    }
}

/// The board position: stones, strings, ko, move history and komi.
#[derive(Clone)]
pub struct Board {
    size: usize,
    komi: f64,
    padded: usize,
    state: Vec<Point>,
    id: Vec<usize>,
    next: Vec<usize>,
    group_size: Vec<usize>,
    groups: Vec<StoneGroup>,
    dir4: [isize; 4],
    to_move: Color,
    move_number: u32,
    last_move: Option<Move>,
    consecutive_passes: u32,
    ko_vertex: Option<usize>,
    history: Vec<u64>,
}

impl Board {
    /// Creates a board of the given size (clamped to [`MAX_BOARD_SIZE`]) and komi.
    pub fn new(size: usize, komi: f64) -> Board {
        let mut board = Board {
            size: 0,
            komi: 0.0,
            padded: 0,
            state: Vec::new(),
            id: Vec::new(),
            next: Vec::new(),
            group_size: Vec::new(),
            groups: Vec::new(),
            dir4: [0; 4],
            to_move: Color::Black,
            move_number: 0,
            last_move: None,
            consecutive_passes: 0,
            ko_vertex: None,
            history: Vec::new(),
        };
        board.reset(size, komi);
        board
    }

    /// Wipes all state and re-initializes the padded border for a new size/komi.
    pub fn reset(&mut self, size: usize, komi: f64) {
        let size = size.min(MAX_BOARD_SIZE).max(1);
        let padded = size + 2;
        let num_vertices = padded * padded;

        self.size = size;
        self.komi = komi;
        self.padded = padded;
        self.dir4 = [1, padded as isize, -1, -(padded as isize)];

        self.state = vec![Point::Invalid; num_vertices];
        for y in 0..size {
            for x in 0..size {
                let v = self.vertex_from_xy(x, y);
                self.state[v] = Point::Empty;
            }
        }

        self.id = (0..num_vertices).collect();
        self.next = (0..num_vertices).collect();
        self.group_size = vec![0; num_vertices];
        self.groups = vec![StoneGroup::default(); num_vertices];

        self.to_move = Color::Black;
        self.move_number = 0;
        self.last_move = None;
        self.consecutive_passes = 0;
        self.ko_vertex = None;
        self.history.clear();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn komi(&self) -> f64 {
        self.komi
    }

    pub fn to_move(&self) -> Color {
        self.to_move
    }

    pub fn move_number(&self) -> u32 {
        self.move_number
    }

    pub fn consecutive_passes(&self) -> u32 {
        self.consecutive_passes
    }

    pub fn ko_vertex(&self) -> Option<usize> {
        self.ko_vertex
    }

    pub fn last_move(&self) -> Option<Move> {
        self.last_move
    }

    // --- coordinate helpers ---

    pub fn vertex_from_xy(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.padded + (x + 1)
    }

    pub fn x_of(&self, v: usize) -> i64 {
        (v % self.padded) as i64 - 1
    }

    pub fn y_of(&self, v: usize) -> i64 {
        (v / self.padded) as i64 - 1
    }

    pub fn index_to_vertex(&self, idx: usize) -> usize {
        self.vertex_from_xy(idx % self.size, idx / self.size)
    }

    pub fn vertex_to_index(&self, v: usize) -> usize {
        let y = self.y_of(v) as usize;
        let x = self.x_of(v) as usize;
        y * self.size + x
    }

    /// Vertex to letter+number text, e.g. "D4". Column letters skip 'I'.
    pub fn vertex_to_text(&self, v: usize) -> String {
        let x = self.x_of(v);
        let y = self.y_of(v);
        let letter = COLUMN_LETTERS.as_bytes()[x as usize] as char;
        format!("{}{}", letter, y + 1)
    }

    /// Parses letter+number text, e.g. "D4", back to a vertex. Returns `None`
    /// for out-of-range or malformed text.
    pub fn text_to_vertex(&self, text: &str) -> Option<usize> {
        let text = text.trim();
        let mut chars = text.chars();
        let c = chars.next()?.to_ascii_uppercase();
        let x = COLUMN_LETTERS.find(c)?;
        let rest: String = chars.collect();
        let row: i64 = rest.parse().ok()?;
        let y = row - 1;
        if x >= self.size || y < 0 || y as usize >= self.size {
            return None;
        }
        Some(self.vertex_from_xy(x, y as usize))
    }

    // --- legality / play ---

    /// True iff `mv` is lawful for the side to move.
    pub fn legal(&self, mv: Move) -> bool {
        match mv {
            Move::Pass => true,
            Move::Place(v) => {
                if Some(v) == self.ko_vertex || self.state[v] != Point::Empty {
                    return false;
                }

                let mut stone_cnt = [0usize; 2];
                let mut atari_cnt = [0usize; 2];
                for d in self.dir4 {
                    let nv = (v as isize + d) as usize;
                    match self.state[nv] {
                        Point::Empty => return true,
                        Point::Invalid => {}
                        _ => {
                            let c = self.state[nv].color_index().unwrap();
                            stone_cnt[c] += 1;
                            if self.groups[self.id[nv]].lib_count == 1 {
                                atari_cnt[c] += 1;
                            }
                        }
                    }
                }

                let me = self.to_move.index();
                let opp = 1 - me;
                atari_cnt[opp] != 0 || atari_cnt[me] < stone_cnt[me]
            }
        }
    }

    /// Plays `mv` if legal, updating strings, liberties, ko and history.
    /// Returns `false` (with no state change) if `mv` is illegal.
    pub fn play(&mut self, mv: Move) -> bool {
        if !self.legal(mv) {
            return false;
        }

        match mv {
            Move::Pass => {
                self.consecutive_passes += 1;
                self.ko_vertex = None;
            }
            Move::Place(v) => {
                let removed = self.place_stone(v);
                let id = self.id[v];
                self.ko_vertex = None;
                if removed == 1 && self.groups[id].lib_count == 1 && self.group_size[id] == 1 {
                    self.ko_vertex = self.groups[id].atari_vertex;
                }
                self.consecutive_passes = 0;
            }
        }

        self.last_move = Some(mv);
        self.to_move = self.to_move.opposite();
        self.move_number += 1;
        self.history.push(self.hash_state());
        true
    }

    fn place_stone(&mut self, v: usize) -> usize {
        let color = self.to_move;
        self.state[v] = Point::of(color);
        self.id[v] = v;
        self.next[v] = v;
        self.group_size[v] = 1;
        self.groups[v].clear();

        for d in self.dir4 {
            let nv = (v as isize + d) as usize;
            if self.state[nv] == Point::Empty {
                let root = self.id[v];
                self.groups[root].add(nv);
            } else if self.state[nv] != Point::Invalid {
                let root = self.id[nv];
                self.groups[root].sub(v);
            }
        }

        for d in self.dir4 {
            let nv = (v as isize + d) as usize;
            if self.state[nv] == Point::of(color) && self.id[nv] != self.id[v] {
                self.merge_groups(v, nv);
            }
        }

        let mut removed_total = 0;
        let enemy = Point::of(color.opposite());
        for d in self.dir4 {
            let nv = (v as isize + d) as usize;
            if self.state[nv] == enemy && self.groups[self.id[nv]].lib_count == 0 {
                removed_total += self.remove_group(nv);
            }
        }
        removed_total
    }

    /// Attaches the smaller string (by `group_size`) onto the larger one.
    fn merge_groups(&mut self, v1: usize, v2: usize) {
        let mut base = self.id[v1];
        let mut add = self.id[v2];
        if self.group_size[base] < self.group_size[add] {
            std::mem::swap(&mut base, &mut add);
        }

        let added = std::mem::take(&mut self.groups[add]);
        self.groups[base].merge(&added);
        self.group_size[base] += self.group_size[add];

        let mut cur = add;
        loop {
            self.id[cur] = base;
            cur = self.next[cur];
            if cur == add {
                break;
            }
        }
        self.next.swap(v1, v2);
    }

    /// Removes the whole string containing `v`, restoring liberties to
    /// neighboring strings. Returns the number of stones removed.
    fn remove_group(&mut self, v: usize) -> usize {
        let mut removed = 0;
        let mut cur = v;
        loop {
            removed += 1;
            self.state[cur] = Point::Empty;
            self.id[cur] = cur;
            for d in self.dir4 {
                let nv = (cur as isize + d) as usize;
                let root = self.id[nv];
                self.groups[root].add(cur);
            }
            let next = self.next[cur];
            self.next[cur] = cur;
            cur = next;
            if cur == v {
                break;
            }
        }
        removed
    }

    /// True iff the current position's color grid matches any prior entry
    /// in history (positional superko).
    pub fn superko(&self) -> bool {
        let Some((current, past)) = self.history.split_last() else {
            return false;
        };
        past.contains(current)
    }

    fn hash_state(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.state.hash(&mut hasher);
        hasher.finish()
    }

    /// Tromp-Taylor area score: reach(black) - reach(white) - komi.
    pub fn final_score(&self) -> f64 {
        self.reach(Color::Black) as f64 - self.reach(Color::White) as f64 - self.komi
    }

    /// BFS over empty cells starting from every stone of `color`. A cell
    /// counts if it is of `color`, or empty and reached from a `color` stone.
    fn reach(&self, color: Color) -> usize {
        let target = Point::of(color);
        let mut seen = vec![false; self.state.len()];
        let mut queue = std::collections::VecDeque::new();
        let mut count = 0;

        for (v, &p) in self.state.iter().enumerate() {
            if p == target {
                count += 1;
                seen[v] = true;
                queue.push_back(v);
            }
        }

        while let Some(v) = queue.pop_front() {
            for d in self.dir4 {
                let nv = (v as isize + d) as usize;
                if self.state[nv] == Point::Empty && !seen[nv] {
                    seen[nv] = true;
                    count += 1;
                    queue.push_back(nv);
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_text(board: &mut Board, text: &str) -> bool {
        let mv = match text {
            "pass" => Move::Pass,
            v => Move::Place(board.text_to_vertex(v).expect("valid coordinate")),
        };
        board.play(mv)
    }

    #[test]
    fn liberties_match_recomputed_neighbors_after_each_play() {
        let mut board = Board::new(9, 7.5);
        for mv in ["C3", "D3", "C4", "D4", "pass", "pass"] {
            assert!(play_text(&mut board, mv));
        }
        for v in 0..board.state.len() {
            if board.state[v] == Point::Invalid || board.id[v] != v || board.group_size[v] == 0 {
                continue;
            }
            let mut cur = v;
            let mut members = Vec::new();
            loop {
                members.push(cur);
                cur = board.next[cur];
                if cur == v {
                    break;
                }
            }
            let mut expected = HashSet::new();
            for &m in &members {
                for d in board.dir4 {
                    let nv = (m as isize + d) as usize;
                    if board.state[nv] == Point::Empty {
                        expected.insert(nv);
                    }
                }
            }
            assert_eq!(board.groups[v].liberties, expected);
        }
    }

    #[test]
    fn double_pass_scores_tromp_taylor_area() {
        let mut board = Board::new(5, 0.5);
        assert!(play_text(&mut board, "pass"));
        assert!(play_text(&mut board, "pass"));
        assert_eq!(board.consecutive_passes(), 2);
        // Empty board, black to move first: all 25 points reach both colors.
        assert_eq!(board.final_score(), 25.0 - 25.0 - 0.5);
    }

    #[test]
    fn immediate_ko_is_detected_and_clears() {
        // Classic ko shape on a 5x5:
        //   . X O . .
        //   X O . O .
        //   . X O . .
        let mut board = Board::new(5, 0.5);
        let moves = [
            ("B3", true),
            ("C4", true),
            ("B4", true),
            ("C5", true),
            ("B5", true),
            ("D4", true),
            ("pass", true),
            ("C3", true), // black captures white's C4 stone -> ko at C4
        ];
        for (mv, expected) in moves {
            assert_eq!(play_text(&mut board, mv), expected, "move {mv}");
        }
        let ko = board.ko_vertex().expect("ko should be set");
        assert_eq!(board.vertex_to_text(ko), "C4");
        assert!(!board.legal(Move::Place(ko)));

        // White plays elsewhere; ko clears.
        assert!(play_text(&mut board, "E5"));
        assert!(board.ko_vertex().is_none());
    }

    #[test]
    fn superko_detects_repeated_whole_board_position() {
        let mut board = Board::new(5, 0.5);
        board.history.push(111);
        board.history.push(222);
        board.history.push(111);
        assert!(board.superko());

        let mut board2 = Board::new(5, 0.5);
        board2.history.push(111);
        board2.history.push(222);
        board2.history.push(333);
        assert!(!board2.superko());
    }

    #[test]
    fn column_letters_skip_i_and_round_trip() {
        let board = Board::new(19, 7.5);
        for idx in 0..19 {
            let v = board.vertex_from_xy(idx, 0);
            let text = board.vertex_to_text(v);
            assert_eq!(board.text_to_vertex(&text), Some(v));
        }
        // Column index 8 is "J", not "I".
        let v = board.vertex_from_xy(8, 0);
        assert_eq!(board.vertex_to_text(v), "J1");
    }
}
